//! Error taxonomy for the ingestion server.
//!
//! Decode and sink errors are recovered inside the session loop, session
//! errors end only the affected connection, and startup errors end the process.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

/// An inbound message that could not be turned into a `PacketEvent`.
#[derive(Debug, Error)]
#[error("malformed event: {reason}")]
pub struct DecodeError {
    pub raw: String,
    pub reason: String,
}

impl DecodeError {
    pub fn new(raw: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            raw: raw.into(),
            reason: reason.into(),
        }
    }

    /// Raw input clipped for log lines.
    pub fn preview(&self) -> &str {
        const MAX: usize = 256;
        if self.raw.len() <= MAX {
            return &self.raw;
        }
        let mut end = MAX;
        while !self.raw.is_char_boundary(end) {
            end -= 1;
        }
        &self.raw[..end]
    }
}

/// A write to one log target failed. The record is dropped for that target only.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("opening log target {key} at {path}: {source}")]
    Open {
        key: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("writing log target {key} at {path}: {source}")]
    Write {
        key: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("rotating log target {key}: {source}")]
    Rotate {
        key: String,
        #[source]
        source: io::Error,
    },
}

impl SinkError {
    pub fn key(&self) -> &str {
        match self {
            SinkError::Open { key, .. }
            | SinkError::Write { key, .. }
            | SinkError::Rotate { key, .. } => key,
        }
    }
}

/// Transport-level failure that terminates a single session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("websocket handshake with {peer} failed: {source}")]
    Handshake {
        peer: SocketAddr,
        #[source]
        source: tokio_tungstenite::tungstenite::Error,
    },

    #[error("websocket handshake with {peer} timed out")]
    HandshakeTimeout { peer: SocketAddr },

    #[error("receive from {peer} failed: {source}")]
    Receive {
        peer: SocketAddr,
        #[source]
        source: tokio_tungstenite::tungstenite::Error,
    },
}

/// Failures that prevent the server from starting at all.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("cannot create storage directory {path}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_clips_long_input_on_char_boundary() {
        let raw = "é".repeat(200);
        let err = DecodeError::new(raw, "bad");
        assert!(err.preview().len() <= 256);
        assert!(err.preview().chars().all(|c| c == 'é'));
    }

    #[test]
    fn decode_error_display_has_reason() {
        let err = DecodeError::new("{not json", "key must be a string");
        assert_eq!(err.to_string(), "malformed event: key must be a string");
    }
}
