//! Live event streaming over the server's websocket endpoint.
//!
//! The [`Controller`] owns the whole session: it opens a
//! [`connection::Connection`], sends the resolved subscription set, drives
//! the [`read_loop::ReadLoop`] and
//! reconnects after recoverable failures until the stop deadline passes or
//! the session is cancelled.

mod connection;
mod controller;
mod envelope;
mod read_loop;
mod subscription;
#[cfg(test)]
mod test_server;

use std::fmt;
use std::io;

use thiserror::Error;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::error::ProtocolError;

pub use connection::stream_url;
pub use controller::{Controller, SessionReport, StreamOptions};
pub use envelope::Event;
pub use read_loop::EventSink;
pub use subscription::{UsageError, resolve};

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error("url error: {0}")]
    Url(#[from] url::ParseError),
    #[error("unsupported url scheme {0:?} (expected http, https, ws or wss)")]
    UnsupportedScheme(String),
    #[error("token cannot be sent as an authorization header")]
    InvalidToken,
    #[error("{0}")]
    Handshake(HandshakeError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("connection not initialized")]
    NotInitialized,
    #[error("timed out during {0}")]
    Timeout(&'static str),
    #[error("{}", describe_close(.code, .reason))]
    Closed { code: Option<u16>, reason: String },
    #[error("cancelled")]
    Cancelled,
    #[error("output error: {0}")]
    Sink(#[source] io::Error),
    #[error(transparent)]
    Usage(#[from] UsageError),
}

/// How the controller reacts to an error. Decided once, where the error is
/// produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Server build has no event stream; retrying cannot help.
    Capability,
    Authentication,
    /// The stream ended, gracefully or not.
    Closed,
    Timeout,
    Cancelled,
    Sink,
    Usage,
    Transient,
}

impl StreamError {
    pub fn class(&self) -> ErrorClass {
        match self {
            StreamError::Handshake(error) if error.is_unsupported() => ErrorClass::Capability,
            StreamError::Handshake(error) if error.is_unauthorized() => ErrorClass::Authentication,
            StreamError::Handshake(_) => ErrorClass::Transient,
            StreamError::UnsupportedScheme(_) | StreamError::InvalidToken | StreamError::Url(_) => {
                ErrorClass::Usage
            }
            StreamError::Usage(_) => ErrorClass::Usage,
            StreamError::Closed { .. } => ErrorClass::Closed,
            StreamError::WebSocket(error) if is_closed_transport(error) => ErrorClass::Closed,
            StreamError::Timeout(_) => ErrorClass::Timeout,
            StreamError::Cancelled => ErrorClass::Cancelled,
            StreamError::Sink(_) => ErrorClass::Sink,
            StreamError::WebSocket(_)
            | StreamError::Json(_)
            | StreamError::NotInitialized => ErrorClass::Transient,
        }
    }

    pub fn is_stream_closed(&self) -> bool {
        self.class() == ErrorClass::Closed
    }

    pub fn is_timeout(&self) -> bool {
        self.class() == ErrorClass::Timeout
    }
}

fn is_closed_transport(error: &tungstenite::Error) -> bool {
    match error {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => true,
        tungstenite::Error::Protocol(ProtocolError::ResetWithoutClosingHandshake) => true,
        tungstenite::Error::Io(error) => matches!(
            error.kind(),
            io::ErrorKind::UnexpectedEof
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::BrokenPipe
        ),
        _ => false,
    }
}

fn describe_close(code: &Option<u16>, reason: &str) -> String {
    match (*code, reason.is_empty()) {
        (Some(code), false) => format!("stream closed by server ({code}: {reason})"),
        (Some(code), true) => format!("stream closed by server ({code})"),
        (None, _) => "stream closed".to_string(),
    }
}

/// The server answered the upgrade request with something other than 101.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeError {
    pub status: Option<u16>,
    pub body: Option<String>,
}

impl HandshakeError {
    pub fn is_unsupported(&self) -> bool {
        matches!(self.status, Some(404 | 405))
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self.status, Some(401 | 403))
    }
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = if self.is_unsupported() {
            "server does not support event streaming"
        } else if self.is_unauthorized() {
            "event stream rejected the access token"
        } else {
            "event stream handshake failed"
        };
        f.write_str(label)?;
        if let Some(status) = self.status {
            write!(f, " (HTTP {status})")?;
        }
        if let Some(body) = self.body.as_deref().map(str::trim).filter(|body| !body.is_empty()) {
            write!(f, ": {body}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handshake(status: u16) -> StreamError {
        StreamError::Handshake(HandshakeError {
            status: Some(status),
            body: None,
        })
    }

    #[test]
    fn handshake_statuses_are_classified() {
        assert_eq!(handshake(404).class(), ErrorClass::Capability);
        assert_eq!(handshake(405).class(), ErrorClass::Capability);
        assert_eq!(handshake(401).class(), ErrorClass::Authentication);
        assert_eq!(handshake(403).class(), ErrorClass::Authentication);
        assert_eq!(handshake(502).class(), ErrorClass::Transient);
    }

    #[test]
    fn closed_conditions_are_classified() {
        let graceful = StreamError::Closed {
            code: Some(1000),
            reason: String::new(),
        };
        assert!(graceful.is_stream_closed());
        assert!(StreamError::WebSocket(tungstenite::Error::ConnectionClosed).is_stream_closed());
        assert!(
            StreamError::WebSocket(tungstenite::Error::Protocol(
                ProtocolError::ResetWithoutClosingHandshake
            ))
            .is_stream_closed()
        );
        let reset = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        assert!(StreamError::WebSocket(tungstenite::Error::Io(reset)).is_stream_closed());
        let refused = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        assert_eq!(
            StreamError::WebSocket(tungstenite::Error::Io(refused)).class(),
            ErrorClass::Transient
        );
    }

    #[test]
    fn close_message_includes_code_and_reason() {
        let error = StreamError::Closed {
            code: Some(1001),
            reason: "going away".to_string(),
        };
        assert_eq!(error.to_string(), "stream closed by server (1001: going away)");
    }

    #[test]
    fn handshake_message_includes_status_and_body() {
        let error = HandshakeError {
            status: Some(401),
            body: Some("invalid token\n".to_string()),
        };
        assert_eq!(
            error.to_string(),
            "event stream rejected the access token (HTTP 401): invalid token"
        );
    }
}
