// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Best-effort persistence of payloads the handler rejected.
//!
//! Every capture lands in its own file holding the exact raw bytes, so it can be replayed through
//! the same decode path later (see [`crate::replay`]). File names combine a UTC timestamp with
//! nanosecond precision and a sequence number shared by every capture in the process, and are
//! opened with `create_new`, so two failures can never write to the same file.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;

use crate::errors::CaptureError;

pub const DEFAULT_CAPTURE_FILE_PREFIX: &str = "span-ingest-err";
const CAPTURE_FILE_EXTENSION: &str = "bin";
const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S%.9fZ";

static CAPTURE_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Where and how rejected payloads are written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConfig {
    pub directory: PathBuf,
    pub file_prefix: String,
}

impl CaptureConfig {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        CaptureConfig {
            directory: directory.into(),
            file_prefix: DEFAULT_CAPTURE_FILE_PREFIX.to_string(),
        }
    }

    #[must_use]
    pub fn with_file_prefix(mut self, file_prefix: impl Into<String>) -> Self {
        self.file_prefix = file_prefix.into();
        self
    }
}

#[derive(Debug)]
pub struct FailureCapture {
    config: CaptureConfig,
}

impl FailureCapture {
    pub fn new(config: CaptureConfig) -> Self {
        FailureCapture { config }
    }

    pub fn directory(&self) -> &Path {
        &self.config.directory
    }

    /// Writes `payload` verbatim to a new file and returns its path.
    pub async fn capture(&self, payload: &[u8]) -> Result<PathBuf, CaptureError> {
        let directory = &self.config.directory;
        tokio::fs::create_dir_all(directory)
            .await
            .map_err(|source| CaptureError::CreateDir {
                path: directory.clone(),
                source,
            })?;

        let path = directory.join(self.next_file_name());
        let write_err = |source: std::io::Error| CaptureError::Write {
            path: path.clone(),
            source,
        };
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(write_err)?;
        file.write_all(payload).await.map_err(write_err)?;
        file.flush().await.map_err(write_err)?;

        Ok(path)
    }

    fn next_file_name(&self) -> String {
        let sequence = CAPTURE_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        format!(
            "{}-{}-{:06}.{}",
            self.config.file_prefix,
            format_utc_timestamp(Utc::now()),
            sequence,
            CAPTURE_FILE_EXTENSION
        )
    }
}

fn format_utc_timestamp(time: DateTime<Utc>) -> String {
    time.format(TIMESTAMP_FORMAT).to_string()
}
