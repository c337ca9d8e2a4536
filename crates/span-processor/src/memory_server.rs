// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::server::{DataChan, ReceivedBuffer, Server};

/// In-process [`Server`] fed through [`MemoryServer::push`].
///
/// Keeps count of buffers handed to workers and of acknowledgments, which makes it the
/// transport of choice for exercising a processor without a socket.
#[derive(Debug)]
pub struct MemoryServer {
    data_tx: Mutex<Option<mpsc::Sender<ReceivedBuffer>>>,
    data_chan: DataChan,
    serving: AtomicBool,
    delivered: AtomicU64,
    acknowledged: AtomicU64,
}

impl MemoryServer {
    /// Creates a server whose queue holds at most `capacity` unread buffers.
    pub fn new(capacity: usize) -> Self {
        let (data_tx, data_rx) = mpsc::channel(capacity.max(1));
        MemoryServer {
            data_tx: Mutex::new(Some(data_tx)),
            data_chan: DataChan::new(data_rx),
            serving: AtomicBool::new(false),
            delivered: AtomicU64::new(0),
            acknowledged: AtomicU64::new(0),
        }
    }

    /// Queues a payload, waiting while the queue is full. Returns `false` once stopped.
    pub async fn push(&self, payload: impl Into<Vec<u8>>) -> bool {
        let data_tx = self
            .data_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(data_tx) = data_tx else {
            return false;
        };
        match data_tx.send(ReceivedBuffer::new(payload.into())).await {
            Ok(()) => {
                self.delivered.fetch_add(1, Ordering::SeqCst);
                true
            }
            Err(_) => false,
        }
    }

    /// Buffers accepted into the queue.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::SeqCst)
    }

    pub fn acknowledged(&self) -> u64 {
        self.acknowledged.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Server for MemoryServer {
    async fn serve(&self) {
        self.serving.store(true, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.serving.store(false, Ordering::SeqCst);
        // the channel closes once pending pushes complete and the queue drains
        if self
            .data_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
        {
            debug!("Memory server stopped");
        }
    }

    fn is_serving(&self) -> bool {
        self.serving.load(Ordering::SeqCst)
    }

    fn data_chan(&self) -> DataChan {
        self.data_chan.clone()
    }

    fn data_recd(&self, _buf: ReceivedBuffer) {
        self.acknowledged.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_push_after_stop_is_refused() {
        let server = MemoryServer::new(2);
        assert!(server.push("one").await);
        server.stop();
        assert!(!server.push("two").await);

        let chan = server.data_chan();
        let buf = chan.recv().await.unwrap();
        assert_eq!(buf.bytes(), b"one");
        assert!(chan.recv().await.is_none());

        server.data_recd(buf);
        assert_eq!(server.delivered(), 1);
        assert_eq!(server.acknowledged(), 1);
    }
}
