// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Counters shared between workers and whoever reports them.
//!
//! A metrics instance is created by the caller and handed to the component it observes, so its
//! lifetime is scoped to that component rather than to the process.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

/// Metrics recorded by [`crate::processor::SpanProcessor`].
#[derive(Debug, Default)]
pub struct ProcessorMetrics {
    handler_successes: AtomicU64,
    handler_errors: AtomicU64,
    bytes_received: AtomicU64,
    payloads_captured: AtomicU64,
    capture_errors: AtomicU64,
    captures_skipped: AtomicU64,
    close_time_nanos: AtomicU64,
}

/// Point-in-time copy of [`ProcessorMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessorMetricsSnapshot {
    pub handler_successes: u64,
    pub handler_errors: u64,
    pub bytes_received: u64,
    pub payloads_captured: u64,
    pub capture_errors: u64,
    pub captures_skipped: u64,
    pub close_time: Option<Duration>,
}

impl ProcessorMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn buffer_received(&self, len: usize) {
        self.bytes_received.fetch_add(len as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn handler_succeeded(&self) {
        self.handler_successes.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn handler_failed(&self) {
        self.handler_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn payload_captured(&self) {
        self.payloads_captured.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn capture_failed(&self) {
        self.capture_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// A rejected payload was not captured because too many captures were pending.
    #[inline]
    pub fn capture_skipped(&self) {
        self.captures_skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Records how long the processor took to stop.
    pub fn record_close_time(&self, elapsed: Duration) {
        let nanos = u64::try_from(elapsed.as_nanos())
            .unwrap_or(u64::MAX)
            .max(1);
        self.close_time_nanos.store(nanos, Ordering::Relaxed);
    }

    pub fn handler_successes(&self) -> u64 {
        self.handler_successes.load(Ordering::Relaxed)
    }

    pub fn handler_errors(&self) -> u64 {
        self.handler_errors.load(Ordering::Relaxed)
    }

    pub fn payloads_captured(&self) -> u64 {
        self.payloads_captured.load(Ordering::Relaxed)
    }

    pub fn capture_errors(&self) -> u64 {
        self.capture_errors.load(Ordering::Relaxed)
    }

    pub fn captures_skipped(&self) -> u64 {
        self.captures_skipped.load(Ordering::Relaxed)
    }

    /// `None` until the processor has been stopped.
    pub fn close_time(&self) -> Option<Duration> {
        match self.close_time_nanos.load(Ordering::Relaxed) {
            0 => None,
            nanos => Some(Duration::from_nanos(nanos)),
        }
    }

    pub fn snapshot(&self) -> ProcessorMetricsSnapshot {
        ProcessorMetricsSnapshot {
            handler_successes: self.handler_successes(),
            handler_errors: self.handler_errors(),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            payloads_captured: self.payloads_captured(),
            capture_errors: self.capture_errors(),
            captures_skipped: self.captures_skipped(),
            close_time: self.close_time(),
        }
    }
}

/// Metrics recorded by [`crate::udp_server::UdpServer`].
#[derive(Debug, Default)]
pub struct ServerMetrics {
    packets_processed: AtomicU64,
    packets_dropped: AtomicU64,
    read_errors: AtomicU64,
    queue_size: AtomicI64,
    packet_size: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerMetricsSnapshot {
    pub packets_processed: u64,
    pub packets_dropped: u64,
    pub read_errors: u64,
    pub queue_size: i64,
    pub packet_size: u64,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// A packet was queued for the workers.
    #[inline]
    pub fn packet_queued(&self, len: usize) {
        self.packets_processed.fetch_add(1, Ordering::Relaxed);
        self.packet_size.store(len as u64, Ordering::Relaxed);
        self.queue_size.fetch_add(1, Ordering::Relaxed);
    }

    /// A queued packet was acknowledged by a worker.
    #[inline]
    pub fn packet_released(&self) {
        self.queue_size.fetch_sub(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn packet_dropped(&self) {
        self.packets_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn read_error(&self) {
        self.read_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ServerMetricsSnapshot {
        ServerMetricsSnapshot {
            packets_processed: self.packets_processed.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
            queue_size: self.queue_size.load(Ordering::Relaxed),
            packet_size: self.packet_size.load(Ordering::Relaxed),
        }
    }
}
