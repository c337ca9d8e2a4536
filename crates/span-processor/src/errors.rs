// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;

/// Errors returned while constructing a [`crate::processor::SpanProcessor`].
#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    #[error("number of processors must be greater than 0, called with {0}")]
    InvalidProcessorCount(usize),
}

/// Outcome of a failed [`crate::handler::Handler::process`] call.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("failed to decode payload: {0}")]
    Decode(String),

    #[error("failed to encode response: {0}")]
    Encode(String),

    #[error("payload rejected: {0}")]
    Rejected(String),

    #[error("downstream unavailable: {0}")]
    Downstream(String),
}

/// Errors raised while persisting a rejected payload to disk.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("failed to create capture directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write capture file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised by transport servers.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("invalid server configuration: {0}")]
    InvalidConfig(String),

    #[error("couldn't bind to address {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised while replaying a captured payload.
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("failed to read capture file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write byte dump {path}: {source}")]
    Dump {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_processor_error_display() {
        let error = ProcessorError::InvalidProcessorCount(0);
        assert_eq!(
            error.to_string(),
            "number of processors must be greater than 0, called with 0"
        );
    }

    #[test]
    fn test_capture_error_keeps_source() {
        use std::error::Error;

        let error = CaptureError::Write {
            path: PathBuf::from("/tmp/capture.bin"),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        assert!(error.to_string().contains("/tmp/capture.bin"));
        assert!(error.source().is_some());
    }
}
