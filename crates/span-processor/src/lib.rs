// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # Span Processor
//!
//! Buffered decode pipeline between a datagram transport and the code that forwards span
//! batches to their backends.
//!
//! ## Architecture
//!
//! - [`server`]: contract a transport implements to feed the pipeline
//! - [`udp_server`]: UDP transport with a bounded, recycling buffer queue
//! - [`codec`] and [`codec_pool`]: reusable decode state, reset before every message
//! - [`processor`]: fixed pool of workers draining the transport into a [`handler::Handler`]
//! - [`capture`]: best-effort dump of rejected payloads for offline replay
//! - [`replay`]: runs a captured payload back through a handler

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod capture;
pub mod codec;
pub mod codec_pool;
pub mod errors;
pub mod forwarder;
pub mod handler;
#[cfg(any(test, feature = "test-utils"))]
pub mod memory_server;
pub mod metrics;
pub mod processor;
pub mod replay;
pub mod server;
pub mod udp_server;
