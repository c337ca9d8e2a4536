// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;

use crate::codec::Codec;
use crate::errors::HandlerError;

/// Business logic invoked once per received buffer.
///
/// The codec already holds the raw payload and serves as both the input and the output channel.
/// Implementations decode one batch and dispatch it. They see nothing of codec pooling,
/// acknowledgment or failure capture.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn process(&self, codec: &mut Codec) -> Result<(), HandlerError>;
}
