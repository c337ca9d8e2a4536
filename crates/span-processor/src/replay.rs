// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Offline replay of payloads written by [`crate::capture::FailureCapture`].

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::codec::Codec;
use crate::errors::{HandlerError, ReplayError};
use crate::handler::Handler;

const DUMP_EXTENSION: &str = "log";

/// Result of running one captured payload back through a handler.
#[derive(Debug)]
pub struct ReplayReport {
    pub payload_size: usize,
    pub dump_path: PathBuf,
    pub outcome: Result<(), HandlerError>,
}

/// Renders a payload one byte per line as `index\thex\tdecimal\tchar`.
///
/// Bytes outside printable ASCII are shown as `.` in the last column.
pub fn byte_dump(payload: &[u8]) -> String {
    let mut out = String::with_capacity(payload.len() * 16);
    for (index, byte) in payload.iter().enumerate() {
        let shown = if byte.is_ascii_graphic() || *byte == b' ' {
            char::from(*byte)
        } else {
            '.'
        };
        // writing to a String cannot fail
        let _ = writeln!(out, "{index}\t{byte:#04x}\t{byte}\t{shown}");
    }
    out
}

/// Reads a captured payload, writes its byte dump next to it with a `.log` extension and
/// replays it through `handler`.
pub async fn replay_file(path: &Path, handler: &dyn Handler) -> Result<ReplayReport, ReplayError> {
    let payload = tokio::fs::read(path)
        .await
        .map_err(|source| ReplayError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    debug!("Read {} bytes from {}", payload.len(), path.display());

    let dump_path = path.with_extension(DUMP_EXTENSION);
    tokio::fs::write(&dump_path, byte_dump(&payload))
        .await
        .map_err(|source| ReplayError::Dump {
            path: dump_path.clone(),
            source,
        })?;

    let mut codec = Codec::new(0);
    codec.write_payload(&payload);
    let outcome = handler.process(&mut codec).await;

    Ok(ReplayReport {
        payload_size: payload.len(),
        dump_path,
        outcome,
    })
}
