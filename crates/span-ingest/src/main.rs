// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use span_ingest::{config::Config, logging};
use span_processor::{
    forwarder::{DecodedBatch, ForwardingHandler},
    handler::Handler,
    metrics::{ProcessorMetrics, ServerMetrics},
    processor::SpanProcessor,
    server::Server,
    udp_server::UdpServer,
};

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("could not load configuration")?;
    logging::init(&config.log_level)?;

    debug!("Starting span ingest agent with {:?}", config);

    let server_metrics = Arc::new(ServerMetrics::new());
    let server = Arc::new(
        UdpServer::bind(&config.udp_server_config(), Arc::clone(&server_metrics))
            .await
            .context("could not start UDP server")?,
    );

    let (batch_tx, batch_rx) = mpsc::channel::<DecodedBatch>(config.batch_channel_size);
    let handler: Arc<dyn Handler> = Arc::new(ForwardingHandler::new(batch_tx));
    let processor_metrics = Arc::new(ProcessorMetrics::new());
    let processor = Arc::new(
        SpanProcessor::new(
            Arc::clone(&server) as Arc<dyn Server>,
            handler,
            Arc::clone(&processor_metrics),
            config.processor_config(),
        )
        .context("could not create span processor")?,
    );

    let consumer = tokio::spawn(drain_batches(batch_rx));

    let serving = {
        let processor = Arc::clone(&processor);
        tokio::spawn(async move { processor.serve().await })
    };
    match server.local_addr() {
        Ok(addr) => info!(
            "span-ingest: listening on {} with {} processors",
            addr, config.num_processors
        ),
        Err(e) => warn!("span-ingest: could not read local address: {}", e),
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Unable to listen for shutdown signal: {}", e);
    }
    info!("Shutting down span ingest agent");

    if tokio::time::timeout(config.shutdown_timeout, processor.stop())
        .await
        .is_err()
    {
        warn!(
            "Span processor did not stop within {:?}, exiting anyway",
            config.shutdown_timeout
        );
    }
    if let Err(e) = serving.await {
        error!("UDP serve task failed: {}", e);
    }
    // the handler owning the batch sender goes away with the processor
    drop(processor);
    match tokio::time::timeout(config.shutdown_timeout, consumer).await {
        Ok(Ok(batches)) => debug!("Drained {} span batches", batches),
        Ok(Err(e)) => error!("Batch consumer failed: {}", e),
        Err(_) => warn!("Batch consumer did not finish in time"),
    }

    info!(
        "Processor metrics: {:?}, server metrics: {:?}",
        processor_metrics.snapshot(),
        server_metrics.snapshot()
    );
    Ok(())
}

async fn drain_batches(mut batch_rx: mpsc::Receiver<DecodedBatch>) -> u64 {
    let mut batches = 0;
    while let Some(batch) = batch_rx.recv().await {
        batches += 1;
        debug!(
            "Received span batch of {} traces ({} bytes)",
            batch.traces.len(),
            batch.payload_size
        );
    }
    batches
}
