// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! UDP transport feeding a bounded queue of received buffers.
//!
//! The read loop never waits on the workers: when the queue is full the datagram is dropped and
//! counted. Buffers handed back through [`Server::data_recd`] are recycled for later reads, so
//! memory stays bounded by the queue size.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::errors::ServerError;
use crate::metrics::ServerMetrics;
use crate::server::{DataChan, ReceivedBuffer, Server};

// Largest payload accepted over UDP by span emitters
const DEFAULT_MAX_PACKET_SIZE: usize = 65_000;
const DEFAULT_MAX_QUEUE_SIZE: usize = 1_000;
const DEFAULT_PORT: u16 = 6831;

/// Configuration for the UDP server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpServerConfig {
    /// Host to bind the UDP socket to (e.g., "127.0.0.1")
    pub host: String,
    /// Port to bind the UDP socket to, 0 picks a free port
    pub port: u16,
    /// Maximum datagram size, longer datagrams are truncated by the socket
    pub max_packet_size: usize,
    /// Maximum number of buffers waiting for a worker
    pub max_queue_size: usize,
}

impl Default for UdpServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
        }
    }
}

pub struct UdpServer {
    socket: UdpSocket,
    data_tx: Mutex<Option<mpsc::Sender<ReceivedBuffer>>>,
    data_chan: DataChan,
    free_buffers: Mutex<Vec<Vec<u8>>>,
    max_packet_size: usize,
    max_queue_size: usize,
    serving: AtomicBool,
    cancel_token: CancellationToken,
    metrics: Arc<ServerMetrics>,
}

impl UdpServer {
    pub async fn bind(
        config: &UdpServerConfig,
        metrics: Arc<ServerMetrics>,
    ) -> Result<Self, ServerError> {
        if config.max_packet_size == 0 {
            return Err(ServerError::InvalidConfig(
                "max packet size must be greater than 0".to_string(),
            ));
        }
        if config.max_queue_size == 0 {
            return Err(ServerError::InvalidConfig(
                "max queue size must be greater than 0".to_string(),
            ));
        }

        let addr = format!("{}:{}", config.host, config.port);
        let socket = UdpSocket::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;

        let (data_tx, data_rx) = mpsc::channel(config.max_queue_size);
        Ok(UdpServer {
            socket,
            data_tx: Mutex::new(Some(data_tx)),
            data_chan: DataChan::new(data_rx),
            free_buffers: Mutex::new(Vec::new()),
            max_packet_size: config.max_packet_size,
            max_queue_size: config.max_queue_size,
            serving: AtomicBool::new(false),
            cancel_token: CancellationToken::new(),
            metrics,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn metrics(&self) -> &Arc<ServerMetrics> {
        &self.metrics
    }

    /// Empty buffer with room for one datagram; the socket fills its spare capacity.
    fn take_buffer(&self) -> Vec<u8> {
        let mut buf = self
            .free_buffers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .unwrap_or_default();
        buf.clear();
        buf.reserve_exact(self.max_packet_size);
        buf
    }

    fn recycle_buffer(&self, buf: Vec<u8>) {
        let mut free = self
            .free_buffers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if free.len() < self.max_queue_size {
            free.push(buf);
        }
    }

    fn take_sender(&self) -> Option<mpsc::Sender<ReceivedBuffer>> {
        self.data_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

#[async_trait]
impl Server for UdpServer {
    /// Reads datagrams until [`Server::stop`] is called, then closes the data channel.
    ///
    /// Only the first call serves; later calls return immediately.
    async fn serve(&self) {
        let Some(data_tx) = self.take_sender() else {
            warn!("UDP server already served or stopped");
            return;
        };
        self.serving.store(true, Ordering::SeqCst);
        debug!("UDP server started");

        loop {
            let mut buf = self.take_buffer();
            let read = tokio::select! {
                biased;
                _ = self.cancel_token.cancelled() => None,
                read = self.socket.recv_buf_from(&mut buf) => Some(read),
            };
            let Some(read) = read else {
                self.recycle_buffer(buf);
                break;
            };

            match read {
                Ok((amt, src)) => {
                    trace!("Received {} bytes from {}", amt, src);
                    match data_tx.try_send(ReceivedBuffer::new(buf)) {
                        Ok(()) => self.metrics.packet_queued(amt),
                        Err(TrySendError::Full(dropped)) => {
                            self.metrics.packet_dropped();
                            self.recycle_buffer(dropped.into_inner());
                        }
                        Err(TrySendError::Closed(dropped)) => {
                            self.recycle_buffer(dropped.into_inner());
                            break;
                        }
                    }
                }
                Err(e) => {
                    error!("Failed to read from UDP socket: {}", e);
                    self.metrics.read_error();
                    self.recycle_buffer(buf);
                }
            }
        }

        self.serving.store(false, Ordering::SeqCst);
        // dropping the sender closes the channel once the workers drain it
        drop(data_tx);
        debug!("UDP server stopped");
    }

    fn stop(&self) {
        self.serving.store(false, Ordering::SeqCst);
        self.cancel_token.cancel();
        // never served, nobody else will close the channel
        drop(self.take_sender());
    }

    fn is_serving(&self) -> bool {
        self.serving.load(Ordering::SeqCst)
    }

    fn data_chan(&self) -> DataChan {
        self.data_chan.clone()
    }

    fn data_recd(&self, buf: ReceivedBuffer) {
        self.metrics.packet_released();
        self.recycle_buffer(buf.into_inner());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn local_config(max_queue_size: usize) -> UdpServerConfig {
        UdpServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            max_packet_size: 1024,
            max_queue_size,
        }
    }

    async fn wait_for(predicate: impl Fn() -> bool) {
        timeout(Duration::from_secs(5), async {
            while !predicate() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_rejects_zero_queue_size() {
        let result = UdpServer::bind(&local_config(0), Arc::new(ServerMetrics::new())).await;
        assert!(matches!(result, Err(ServerError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_bind_error_reports_address() {
        let taken = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();
        let config = UdpServerConfig {
            port,
            ..local_config(1)
        };
        match UdpServer::bind(&config, Arc::new(ServerMetrics::new())).await {
            Err(ServerError::Bind { addr, .. }) => assert_eq!(addr, format!("127.0.0.1:{port}")),
            _ => panic!("expected a bind error"),
        }
    }

    #[tokio::test]
    async fn test_serves_datagrams_and_recycles_buffers() {
        let server = Arc::new(
            UdpServer::bind(&local_config(8), Arc::new(ServerMetrics::new()))
                .await
                .unwrap(),
        );
        let addr = server.local_addr().unwrap();
        let serving = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.serve().await })
        };
        wait_for(|| server.is_serving()).await;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"first batch", addr).await.unwrap();
        client.send_to(b"second", addr).await.unwrap();

        let chan = server.data_chan();
        let first = chan.recv().await.unwrap();
        let second = chan.recv().await.unwrap();
        assert_eq!(first.bytes(), b"first batch");
        assert_eq!(second.bytes(), b"second");
        assert_eq!(server.metrics().snapshot().queue_size, 2);

        server.data_recd(first);
        server.data_recd(second);
        let snapshot = server.metrics().snapshot();
        assert_eq!(snapshot.packets_processed, 2);
        assert_eq!(snapshot.queue_size, 0);
        assert_eq!(snapshot.packet_size, 6);

        server.stop();
        serving.await.unwrap();
        assert!(!server.is_serving());
        assert!(chan.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_recycled_buffer_holds_only_new_datagram() {
        let server = Arc::new(
            UdpServer::bind(&local_config(1), Arc::new(ServerMetrics::new()))
                .await
                .unwrap(),
        );
        let addr = server.local_addr().unwrap();
        let serving = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.serve().await })
        };
        wait_for(|| server.is_serving()).await;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let chan = server.data_chan();
        client.send_to(&[b'x'; 1024], addr).await.unwrap();
        let long = chan.recv().await.unwrap();
        assert_eq!(long.len(), 1024);
        server.data_recd(long);

        // the read loop already holds a fresh buffer, the long one is reused for the next read
        client.send_to(b"a", addr).await.unwrap();
        let next = chan.recv().await.unwrap();
        assert_eq!(next.bytes(), b"a");
        server.data_recd(next);

        client.send_to(b"yz", addr).await.unwrap();
        let short = chan.recv().await.unwrap();
        assert_eq!(short.bytes(), b"yz");
        server.data_recd(short);

        server.stop();
        serving.await.unwrap();
    }

    #[tokio::test]
    async fn test_drops_packets_when_queue_full() {
        let server = Arc::new(
            UdpServer::bind(&local_config(1), Arc::new(ServerMetrics::new()))
                .await
                .unwrap(),
        );
        let addr = server.local_addr().unwrap();
        let serving = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.serve().await })
        };
        wait_for(|| server.is_serving()).await;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"kept", addr).await.unwrap();
        wait_for(|| server.metrics().snapshot().packets_processed == 1).await;
        client.send_to(b"dropped", addr).await.unwrap();
        wait_for(|| server.metrics().snapshot().packets_dropped == 1).await;

        server.stop();
        serving.await.unwrap();

        // queued buffers survive the stop, then the channel closes
        let chan = server.data_chan();
        let kept = chan.recv().await.unwrap();
        assert_eq!(kept.bytes(), b"kept");
        server.data_recd(kept);
        assert!(chan.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_stop_before_serve_closes_channel() {
        let server = UdpServer::bind(&local_config(4), Arc::new(ServerMetrics::new()))
            .await
            .unwrap();
        server.stop();

        assert!(server.data_chan().recv().await.is_none());
        // serving after stop returns straight away
        server.serve().await;
        assert!(!server.is_serving());
    }
}
