// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Worker pool draining a transport's buffers into a [`Handler`].
//!
//! `num_processors` workers pull buffers from the shared [`DataChan`], decode them through a
//! pooled [`crate::codec::Codec`] and acknowledge every buffer back to the transport, whether the
//! handler succeeded or not. Rejected payloads can be copied to disk by a [`FailureCapture`]
//! without delaying the acknowledgment.
//!
//! Buffers pulled by different workers are processed concurrently, so there is no ordering
//! guarantee between distinct buffers once `num_processors > 1`. A single worker handles the
//! buffers it pulls one at a time.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info_span, trace, warn, Instrument, Span};

use crate::capture::{CaptureConfig, FailureCapture};
use crate::codec_pool::CodecPool;
use crate::errors::ProcessorError;
use crate::handler::Handler;
use crate::metrics::ProcessorMetrics;
use crate::server::{DataChan, ReceivedBuffer, Server};

const PAYLOAD_PREVIEW_LEN: usize = 256;
const DEFAULT_MAX_PENDING_CAPTURES: usize = 64;

/// Configuration for a [`SpanProcessor`].
#[derive(Debug, Clone)]
pub struct SpanProcessorConfig {
    /// Name recorded on the processor's tracing span
    pub name: String,
    /// Number of concurrent drain loops, must be greater than 0
    pub num_processors: usize,
    /// Idle codecs kept for reuse, defaults to `num_processors`
    pub max_idle_codecs: Option<usize>,
    /// Where rejected payloads are written, capture is disabled when `None`
    pub capture: Option<CaptureConfig>,
    /// Captures allowed to be in flight at once, further rejected payloads are not captured
    pub max_pending_captures: usize,
}

impl Default for SpanProcessorConfig {
    fn default() -> Self {
        Self {
            name: "span_processor".to_string(),
            num_processors: 1,
            max_idle_codecs: None,
            capture: None,
            max_pending_captures: DEFAULT_MAX_PENDING_CAPTURES,
        }
    }
}

/// Lifecycle of a [`SpanProcessor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    Stopped,
    /// Workers are being spawned. [`SpanProcessor::new`] only returns once they are, so
    /// [`SpanProcessor::state`] never reports it.
    Starting,
    Running,
    Stopping,
}

/// Drains a [`Server`] with a fixed number of workers.
pub struct SpanProcessor {
    server: Arc<dyn Server>,
    state: RwLock<ProcessorState>,
    workers: Mutex<JoinSet<()>>,
    captures: TaskTracker,
    metrics: Arc<ProcessorMetrics>,
    span: Span,
}

impl SpanProcessor {
    /// Spawns `config.num_processors` workers on the current tokio runtime.
    ///
    /// Fails without spawning anything when `num_processors` is 0.
    pub fn new(
        server: Arc<dyn Server>,
        handler: Arc<dyn Handler>,
        metrics: Arc<ProcessorMetrics>,
        config: SpanProcessorConfig,
    ) -> Result<Self, ProcessorError> {
        if config.num_processors == 0 {
            return Err(ProcessorError::InvalidProcessorCount(
                config.num_processors,
            ));
        }

        let span = info_span!("span_processor", name = %config.name);
        let captures = TaskTracker::new();

        let worker = Worker {
            server: Arc::clone(&server),
            data_chan: server.data_chan(),
            codec_pool: Arc::new(CodecPool::new(
                config.max_idle_codecs.unwrap_or(config.num_processors),
            )),
            handler,
            capture: config.capture.map(|c| Arc::new(FailureCapture::new(c))),
            capture_permits: Arc::new(Semaphore::new(
                config.max_pending_captures.min(Semaphore::MAX_PERMITS),
            )),
            captures: captures.clone(),
            metrics: Arc::clone(&metrics),
        };

        let mut workers = JoinSet::new();
        for id in 0..config.num_processors {
            let worker = worker.clone();
            workers.spawn(
                worker
                    .run()
                    .instrument(info_span!(parent: &span, "worker", id)),
            );
        }
        debug!(parent: &span, "Started {} span processor workers", config.num_processors);

        Ok(SpanProcessor {
            server,
            state: RwLock::new(ProcessorState::Running),
            workers: Mutex::new(workers),
            captures,
            metrics,
            span,
        })
    }

    /// Starts serving traffic on the underlying server.
    ///
    /// Whether this returns immediately or only once the server stops is up to the server.
    /// Servers are started once; see the implementation for repeated calls.
    pub async fn serve(&self) {
        self.server.serve().instrument(self.span.clone()).await;
    }

    /// Indicates whether the underlying server is currently serving traffic.
    pub fn is_serving(&self) -> bool {
        self.server.is_serving()
    }

    pub fn state(&self) -> ProcessorState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stops the server and waits until every buffer it already queued has been processed.
    ///
    /// In-flight handler calls are allowed to finish; there is no timeout here, so callers that
    /// need a bounded shutdown should wrap this in one. Meant to be called by a single stopper.
    pub async fn stop(&self) {
        {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            if *state != ProcessorState::Running {
                return;
            }
            *state = ProcessorState::Stopping;
        }

        let started = Instant::now();
        self.server.stop();

        let mut workers = self.workers.lock().await;
        while let Some(result) = workers.join_next().await {
            if let Err(e) = result {
                error!(parent: &self.span, "Span processor worker failed: {}", e);
            }
        }
        self.captures.close();
        self.captures.wait().await;

        let elapsed = started.elapsed();
        self.metrics.record_close_time(elapsed);
        debug!(
            parent: &self.span,
            "Span processor stopped in {} ms",
            elapsed.as_millis()
        );

        *self.state.write().unwrap_or_else(PoisonError::into_inner) = ProcessorState::Stopped;
    }

    pub fn metrics(&self) -> &Arc<ProcessorMetrics> {
        &self.metrics
    }
}

/// State shared by every drain loop.
#[derive(Clone)]
struct Worker {
    server: Arc<dyn Server>,
    data_chan: DataChan,
    codec_pool: Arc<CodecPool>,
    handler: Arc<dyn Handler>,
    capture: Option<Arc<FailureCapture>>,
    capture_permits: Arc<Semaphore>,
    captures: TaskTracker,
    metrics: Arc<ProcessorMetrics>,
}

impl Worker {
    /// Processes buffers until the data channel is closed.
    async fn run(self) {
        while let Some(read_buf) = self.data_chan.recv().await {
            let pending = PendingAck::new(self.server.as_ref(), read_buf);
            self.process_buffer(pending.buffer()).await;
            pending.ack();
        }
        trace!("Data channel closed, worker exiting");
    }

    async fn process_buffer(&self, read_buf: &ReceivedBuffer) {
        let payload = read_buf.bytes();
        debug!(
            bytes_received = payload.len(),
            "Span(s) received by the processor"
        );
        self.metrics.buffer_received(payload.len());

        let mut codec = self.codec_pool.acquire();
        codec.write_payload(payload);

        match self.handler.process(&mut codec).await {
            Ok(()) => self.metrics.handler_succeeded(),
            Err(e) => {
                error!("Processor failed: {}", e);
                debug!("Payload contents: {}", payload_preview(payload));
                self.metrics.handler_failed();
                if let Some(capture) = &self.capture {
                    self.spawn_capture(Arc::clone(capture), payload);
                }
            }
        }

        codec.release();
    }

    fn spawn_capture(&self, capture: Arc<FailureCapture>, payload: &[u8]) {
        let Ok(permit) = Arc::clone(&self.capture_permits).try_acquire_owned() else {
            self.metrics.capture_skipped();
            warn!("Too many pending captures, rejected payload not captured");
            return;
        };
        let payload = payload.to_vec();
        let metrics = Arc::clone(&self.metrics);
        self.captures.spawn(
            async move {
                let _permit = permit;
                match capture.capture(&payload).await {
                    Ok(path) => {
                        metrics.payload_captured();
                        debug!("Captured rejected payload to {}", path.display());
                    }
                    Err(e) => {
                        metrics.capture_failed();
                        warn!("Failed to capture rejected payload: {}", e);
                    }
                }
            }
            .in_current_span(),
        );
    }
}

/// A buffer that must go back to the server exactly once.
///
/// Acknowledges on drop as well, so an unwinding handler cannot leak the buffer.
struct PendingAck<'a> {
    server: &'a dyn Server,
    buf: Option<ReceivedBuffer>,
}

impl<'a> PendingAck<'a> {
    fn new(server: &'a dyn Server, buf: ReceivedBuffer) -> Self {
        PendingAck {
            server,
            buf: Some(buf),
        }
    }

    #[allow(clippy::expect_used)]
    fn buffer(&self) -> &ReceivedBuffer {
        self.buf.as_ref().expect("buffer is present until acknowledged")
    }

    fn ack(mut self) {
        if let Some(buf) = self.buf.take() {
            self.server.data_recd(buf);
        }
    }
}

impl Drop for PendingAck<'_> {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.server.data_recd(buf);
        }
    }
}

/// Lossy, truncated text rendering of a payload for debug logs.
fn payload_preview(payload: &[u8]) -> String {
    let shown = &payload[..payload.len().min(PAYLOAD_PREVIEW_LEN)];
    let mut preview = String::from_utf8_lossy(shown).into_owned();
    if payload.len() > PAYLOAD_PREVIEW_LEN {
        preview.push_str(&format!("... ({} bytes total)", payload.len()));
    }
    preview
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Codec;
    use crate::errors::HandlerError;
    use crate::forwarder::ForwardingHandler;
    use crate::memory_server::MemoryServer;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;
    use tracing_test::traced_test;

    /// Rejects exactly the payload `bad`.
    struct RejectBad;

    #[async_trait]
    impl Handler for RejectBad {
        async fn process(&self, codec: &mut Codec) -> Result<(), HandlerError> {
            if codec.remaining() == b"bad" {
                return Err(HandlerError::Rejected("bad payload".to_string()));
            }
            Ok(())
        }
    }

    struct AcceptAll;

    #[async_trait]
    impl Handler for AcceptAll {
        async fn process(&self, _codec: &mut Codec) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    fn processor_config(num_processors: usize) -> SpanProcessorConfig {
        SpanProcessorConfig {
            num_processors,
            ..Default::default()
        }
    }

    fn new_processor(
        server: &Arc<MemoryServer>,
        handler: Arc<dyn Handler>,
        config: SpanProcessorConfig,
    ) -> SpanProcessor {
        SpanProcessor::new(
            Arc::clone(server) as Arc<dyn Server>,
            handler,
            Arc::new(ProcessorMetrics::new()),
            config,
        )
        .expect("processor creation failed")
    }

    #[tokio::test]
    async fn test_zero_processors_rejected() {
        let server = Arc::new(MemoryServer::new(4));
        let result = SpanProcessor::new(
            Arc::clone(&server) as Arc<dyn Server>,
            Arc::new(AcceptAll),
            Arc::new(ProcessorMetrics::new()),
            processor_config(0),
        );

        assert!(matches!(
            result,
            Err(ProcessorError::InvalidProcessorCount(0))
        ));

        // nothing drains the queue
        server.push("ok").await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(server.acknowledged(), 0);
    }

    #[tokio::test]
    async fn test_ok_bad_ok_with_capture() {
        let dir = tempfile::tempdir().unwrap();
        let server = Arc::new(MemoryServer::new(4));
        let processor = new_processor(
            &server,
            Arc::new(RejectBad),
            SpanProcessorConfig {
                capture: Some(CaptureConfig::new(dir.path())),
                ..processor_config(1)
            },
        );

        for payload in ["ok", "bad", "ok"] {
            server.push(payload).await;
        }
        processor.stop().await;

        let metrics = processor.metrics().snapshot();
        assert_eq!(metrics.handler_successes, 2);
        assert_eq!(metrics.handler_errors, 1);
        assert_eq!(metrics.payloads_captured, 1);
        assert_eq!(server.delivered(), 3);
        assert_eq!(server.acknowledged(), 3);

        let files: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .collect();
        assert_eq!(files.len(), 1);
        assert_eq!(std::fs::read(&files[0]).unwrap(), b"bad");
    }

    #[tokio::test]
    async fn test_failure_without_capture_still_counted() {
        let server = Arc::new(MemoryServer::new(4));
        let processor = new_processor(&server, Arc::new(RejectBad), processor_config(1));

        server.push("bad").await;
        processor.stop().await;

        let metrics = processor.metrics().snapshot();
        assert_eq!(metrics.handler_errors, 1);
        assert_eq!(metrics.payloads_captured, 0);
        assert_eq!(metrics.capture_errors, 0);
        assert_eq!(server.acknowledged(), 1);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_capture_io_error_is_logged_not_propagated() {
        let dir = tempfile::tempdir().unwrap();
        let not_a_dir = dir.path().join("file");
        std::fs::write(&not_a_dir, b"occupied").unwrap();

        let server = Arc::new(MemoryServer::new(4));
        let processor = new_processor(
            &server,
            Arc::new(RejectBad),
            SpanProcessorConfig {
                capture: Some(CaptureConfig::new(&not_a_dir)),
                ..processor_config(1)
            },
        );

        server.push("bad").await;
        server.push("ok").await;
        processor.stop().await;

        let metrics = processor.metrics().snapshot();
        assert_eq!(metrics.capture_errors, 1);
        assert_eq!(metrics.handler_successes, 1);
        assert_eq!(server.acknowledged(), 2);
        assert!(logs_contain("Failed to capture rejected payload"));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_received_buffer_logged_with_length() {
        let server = Arc::new(MemoryServer::new(4));
        let processor = new_processor(&server, Arc::new(AcceptAll), processor_config(1));

        server.push("12345").await;
        processor.stop().await;

        assert!(logs_contain("Span(s) received by the processor"));
        assert!(logs_contain("bytes_received=5"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_many_buffers_many_workers() {
        let server = Arc::new(MemoryServer::new(64));
        let processor = new_processor(&server, Arc::new(AcceptAll), processor_config(4));

        let producer = {
            let server = Arc::clone(&server);
            tokio::spawn(async move {
                for i in 0..1000u32 {
                    let len = (i.wrapping_mul(2_654_435_761) % 512) as usize + 1;
                    let payload: Vec<u8> = (0..len).map(|b| (b as u32 ^ i) as u8).collect();
                    server.push(payload).await;
                }
            })
        };
        producer.await.unwrap();
        processor.stop().await;

        let metrics = processor.metrics().snapshot();
        assert_eq!(server.delivered(), 1000);
        assert_eq!(server.acknowledged(), 1000);
        assert_eq!(metrics.handler_successes, 1000);
        assert_eq!(metrics.handler_errors, 0);
    }

    /// Flags any codec observed by two handler calls at once.
    #[derive(Default)]
    struct ExclusiveCodecCheck {
        in_use: std::sync::Mutex<HashSet<u64>>,
        violated: AtomicBool,
        max_concurrency: AtomicUsize,
    }

    #[async_trait]
    impl Handler for ExclusiveCodecCheck {
        async fn process(&self, codec: &mut Codec) -> Result<(), HandlerError> {
            let id = codec.id();
            let expected = codec.remaining().to_vec();
            {
                let mut in_use = self.in_use.lock().unwrap();
                if !in_use.insert(id) {
                    self.violated.store(true, Ordering::SeqCst);
                }
                self.max_concurrency.fetch_max(in_use.len(), Ordering::SeqCst);
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
            if codec.remaining() != expected.as_slice() {
                self.violated.store(true, Ordering::SeqCst);
            }
            self.in_use.lock().unwrap().remove(&id);
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_codec_never_shared_between_workers() {
        let server = Arc::new(MemoryServer::new(256));
        let handler = Arc::new(ExclusiveCodecCheck::default());
        let processor = new_processor(
            &server,
            Arc::clone(&handler) as Arc<dyn Handler>,
            processor_config(4),
        );

        for i in 0..200u32 {
            server.push(i.to_be_bytes().to_vec()).await;
        }
        processor.stop().await;

        assert!(!handler.violated.load(Ordering::SeqCst));
        assert!(handler.max_concurrency.load(Ordering::SeqCst) <= 4);
        assert_eq!(server.acknowledged(), 200);
    }

    /// Sleeps for `delay` after signalling that it started.
    struct SlowHandler {
        started: Notify,
        finished: AtomicBool,
        delay: Duration,
    }

    #[async_trait]
    impl Handler for SlowHandler {
        async fn process(&self, _codec: &mut Codec) -> Result<(), HandlerError> {
            self.started.notify_one();
            tokio::time::sleep(self.delay).await;
            self.finished.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_stop_waits_for_in_flight_handler() {
        let server = Arc::new(MemoryServer::new(4));
        let handler = Arc::new(SlowHandler {
            started: Notify::new(),
            finished: AtomicBool::new(false),
            delay: Duration::from_millis(200),
        });
        let processor = new_processor(
            &server,
            Arc::clone(&handler) as Arc<dyn Handler>,
            processor_config(2),
        );

        server.push("slow").await;
        handler.started.notified().await;
        processor.stop().await;

        assert!(handler.finished.load(Ordering::SeqCst));
        assert_eq!(server.acknowledged(), 1);
        let close_time = processor.metrics().close_time().unwrap();
        assert!(close_time >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_stop_processes_already_queued_buffers() {
        let server = Arc::new(MemoryServer::new(64));
        let processor = new_processor(&server, Arc::new(AcceptAll), processor_config(3));

        for i in 0..50u8 {
            server.push(vec![i]).await;
        }
        processor.stop().await;

        assert_eq!(server.acknowledged(), 50);
        assert_eq!(processor.metrics().handler_successes(), 50);
    }

    /// Parks on payload `hang` until released.
    struct HangOnce {
        release: Notify,
        processed: AtomicUsize,
    }

    #[async_trait]
    impl Handler for HangOnce {
        async fn process(&self, codec: &mut Codec) -> Result<(), HandlerError> {
            if codec.remaining() == b"hang" {
                self.release.notified().await;
            }
            self.processed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_hung_handler_parks_only_one_worker() {
        let server = Arc::new(MemoryServer::new(16));
        let handler = Arc::new(HangOnce {
            release: Notify::new(),
            processed: AtomicUsize::new(0),
        });
        let processor = new_processor(
            &server,
            Arc::clone(&handler) as Arc<dyn Handler>,
            processor_config(2),
        );

        server.push("hang").await;
        for _ in 0..5 {
            server.push("ok").await;
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        while server.acknowledged() < 5 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(server.acknowledged(), 5);
        assert_eq!(handler.processed.load(Ordering::SeqCst), 5);

        handler.release.notify_one();
        processor.stop().await;
        assert_eq!(server.acknowledged(), 6);
    }

    #[tokio::test]
    async fn test_lifecycle_states() {
        let server = Arc::new(MemoryServer::new(4));
        let processor = new_processor(&server, Arc::new(AcceptAll), processor_config(2));
        assert_eq!(processor.state(), ProcessorState::Running);
        assert!(!processor.is_serving());

        processor.serve().await;
        assert!(processor.is_serving());

        processor.stop().await;
        assert_eq!(processor.state(), ProcessorState::Stopped);
        assert!(!processor.is_serving());
        let close_time = processor.metrics().close_time();
        assert!(close_time.is_some());

        // a second stop is a no-op
        processor.stop().await;
        assert_eq!(processor.metrics().close_time(), close_time);
    }

    #[tokio::test]
    async fn test_deeply_nested_payload_fails_without_killing_worker() {
        let server = Arc::new(MemoryServer::new(4));
        let mut nested = vec![0x91; 10_000];
        nested.push(0xc0);
        let batch = rmp_serde::to_vec(&serde_json::json!([[{"span_id": 1}]])).unwrap();
        server.push(nested).await;
        server.push(batch).await;

        let (batch_tx, mut batch_rx) = tokio::sync::mpsc::channel(4);
        let processor = new_processor(
            &server,
            Arc::new(ForwardingHandler::new(batch_tx)),
            processor_config(1),
        );
        processor.stop().await;

        let metrics = processor.metrics().snapshot();
        assert_eq!(metrics.handler_errors, 1);
        assert_eq!(metrics.handler_successes, 1);
        assert_eq!(server.acknowledged(), 2);
        assert_eq!(batch_rx.recv().await.unwrap().traces.len(), 1);
    }

    #[tokio::test]
    async fn test_pending_captures_are_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let server = Arc::new(MemoryServer::new(8));
        for _ in 0..5 {
            server.push("bad").await;
        }

        // the worker drains the whole queue before any capture task gets to run
        let processor = new_processor(
            &server,
            Arc::new(RejectBad),
            SpanProcessorConfig {
                capture: Some(CaptureConfig::new(dir.path())),
                max_pending_captures: 2,
                ..processor_config(1)
            },
        );
        processor.stop().await;

        let metrics = processor.metrics().snapshot();
        assert_eq!(metrics.handler_errors, 5);
        assert_eq!(metrics.payloads_captured, 2);
        assert_eq!(metrics.captures_skipped, 3);
        assert_eq!(server.acknowledged(), 5);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 2);
    }

    /// Panics on payload `boom`.
    struct PanicOnBoom;

    #[async_trait]
    impl Handler for PanicOnBoom {
        async fn process(&self, codec: &mut Codec) -> Result<(), HandlerError> {
            if codec.remaining() == b"boom" {
                panic!("handler blew up");
            }
            Ok(())
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn test_panicking_handler_still_acks_buffer() {
        let server = Arc::new(MemoryServer::new(4));
        for payload in ["ok", "boom", "ok"] {
            server.push(payload).await;
        }

        let processor = new_processor(&server, Arc::new(PanicOnBoom), processor_config(2));
        tokio::time::timeout(Duration::from_secs(5), processor.stop())
            .await
            .expect("stop hung after a handler panic");

        assert_eq!(server.delivered(), 3);
        assert_eq!(server.acknowledged(), server.delivered());
        assert_eq!(processor.metrics().handler_successes(), 2);
        assert_eq!(processor.state(), ProcessorState::Stopped);
        assert!(logs_contain("Span processor worker failed"));
    }

    #[test]
    fn test_payload_preview_truncates() {
        assert_eq!(payload_preview(b"short"), "short");

        let long = vec![b'a'; PAYLOAD_PREVIEW_LEN + 10];
        let preview = payload_preview(&long);
        assert!(preview.starts_with(&"a".repeat(PAYLOAD_PREVIEW_LEN)));
        assert!(preview.ends_with(&format!("({} bytes total)", PAYLOAD_PREVIEW_LEN + 10)));
    }
}
