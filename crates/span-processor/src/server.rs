// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Contract between a transport and the [`crate::processor::SpanProcessor`] draining it.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

/// One received, not yet acknowledged payload.
///
/// The transport owns the backing memory. Handing the buffer back through
/// [`Server::data_recd`] consumes it, so it can only be acknowledged once.
#[derive(Debug)]
pub struct ReceivedBuffer {
    data: Vec<u8>,
}

impl ReceivedBuffer {
    pub fn new(data: Vec<u8>) -> Self {
        ReceivedBuffer { data }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Gives the backing memory back to the transport for reuse.
    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

/// Receiving half of a transport's buffer queue, shared by all workers.
///
/// Each buffer is delivered to exactly one caller of [`DataChan::recv`]. `recv` returns `None`
/// once the transport has dropped its sender and every queued buffer has been handed out.
#[derive(Debug, Clone)]
pub struct DataChan {
    rx: Arc<Mutex<mpsc::Receiver<ReceivedBuffer>>>,
}

impl DataChan {
    pub fn new(rx: mpsc::Receiver<ReceivedBuffer>) -> Self {
        DataChan {
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    pub async fn recv(&self) -> Option<ReceivedBuffer> {
        self.rx.lock().await.recv().await
    }
}

/// A transport producing [`ReceivedBuffer`]s.
#[async_trait]
pub trait Server: Send + Sync {
    /// Starts accepting input. May run until [`Server::stop`] is called.
    async fn serve(&self);

    /// Stops accepting input. The data channel is closed once the queued buffers are drained.
    fn stop(&self);

    fn is_serving(&self) -> bool;

    fn data_chan(&self) -> DataChan;

    /// Acknowledges a buffer received from [`Server::data_chan`] so its memory can be reclaimed.
    fn data_recd(&self, buf: ReceivedBuffer);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_data_chan_delivers_each_buffer_once() {
        let (tx, rx) = mpsc::channel(8);
        let chan = DataChan::new(rx);
        let other = chan.clone();

        tx.send(ReceivedBuffer::new(b"one".to_vec())).await.unwrap();
        tx.send(ReceivedBuffer::new(b"two".to_vec())).await.unwrap();
        drop(tx);

        let first = chan.recv().await.unwrap();
        let second = other.recv().await.unwrap();
        assert_eq!(first.bytes(), b"one");
        assert_eq!(second.bytes(), b"two");
        assert!(chan.recv().await.is_none());
        assert!(other.recv().await.is_none());
    }
}
