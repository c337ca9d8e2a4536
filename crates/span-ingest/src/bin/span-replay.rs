// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Replays a captured payload through the decode path and dumps its bytes next to it.
//!
//! Usage: `span-replay [--log-level <LEVEL>] <captured-file>`

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::Parser;
use tokio::sync::mpsc;

use span_ingest::logging;
use span_processor::{forwarder::ForwardingHandler, replay::replay_file};

/// Replays a payload captured by span-ingest and writes a byte dump next to it
#[derive(Parser, Debug)]
#[command(name = "span-replay")]
#[command(version, about, long_about = None)]
struct Args {
    /// Captured `.bin` file to replay
    path: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging::init(&args.log_level)?;

    // one slot is enough for the single payload being replayed
    let (tx, mut rx) = mpsc::channel(1);
    let handler = ForwardingHandler::new(tx);
    let report = replay_file(&args.path, &handler)
        .await
        .with_context(|| format!("could not replay {}", args.path.display()))?;

    println!("payload: {} bytes", report.payload_size);
    println!("byte dump: {}", report.dump_path.display());
    match report.outcome {
        Ok(()) => {
            let traces = rx.try_recv().map(|batch| batch.traces.len()).unwrap_or(0);
            println!("decoded: {traces} traces");
            Ok(())
        }
        Err(e) => bail!("decode failed: {e}"),
    }
}
