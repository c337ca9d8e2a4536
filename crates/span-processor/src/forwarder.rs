// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc::Sender;
use tracing::debug;

use crate::codec::Codec;
use crate::errors::HandlerError;
use crate::handler::Handler;

/// One decoded span batch, opaque beyond its top-level list of traces.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedBatch {
    pub payload_size: usize,
    pub traces: Vec<Value>,
}

/// Decodes a MessagePack array of traces and forwards it downstream.
///
/// The batch is sent through a bounded channel, so a slow consumer slows the workers down
/// instead of growing memory. A closed channel counts as a handler failure.
#[derive(Debug, Clone)]
pub struct ForwardingHandler {
    tx: Sender<DecodedBatch>,
}

impl ForwardingHandler {
    pub fn new(tx: Sender<DecodedBatch>) -> Self {
        ForwardingHandler { tx }
    }
}

#[async_trait]
impl Handler for ForwardingHandler {
    async fn process(&self, codec: &mut Codec) -> Result<(), HandlerError> {
        let payload_size = codec.remaining().len();
        let traces = match codec.decode::<Value>()? {
            Value::Array(traces) => traces,
            other => {
                return Err(HandlerError::Rejected(format!(
                    "expected an array of traces, got {}",
                    value_kind(&other)
                )))
            }
        };
        if !codec.remaining().is_empty() {
            return Err(HandlerError::Rejected(format!(
                "{} trailing bytes after batch",
                codec.remaining().len()
            )));
        }

        debug!("Decoded batch of {} trace(s)", traces.len());
        self.tx
            .send(DecodedBatch {
                payload_size,
                traces,
            })
            .await
            .map_err(|e| HandlerError::Downstream(e.to_string()))
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "a map",
    }
}
