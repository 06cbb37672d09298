use std::time::Duration;

use thiserror::Error;

use crate::message::Message;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Socket-level failure or abnormal close.
    #[error("transport error: {0}")]
    Transport(String),

    /// The server answered with an error frame where success was expected.
    #[error("protocol error ({}): {message}", .code.map_or_else(|| "-".to_string(), |c| c.to_string()))]
    Protocol {
        code: Option<i64>,
        message: String,
        frame: Message,
    },

    #[error("timed out after {elapsed:?} waiting for {pattern}")]
    Timeout {
        elapsed: Duration,
        pattern: serde_json::Value,
    },

    /// A newer wait replaced this one on a single-slot connection.
    #[error("expectation superseded by a newer wait on the same connection")]
    Superseded,

    #[error("connection closed")]
    Closed,

    #[error("invalid json: {0}")]
    Json(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("http error {status}: {body}")]
    Http {
        status: u16,
        body: serde_json::Value,
    },
}

impl Error {
    /// Builds a protocol error out of a `{code, error}` frame.
    pub fn from_frame(frame: &Message) -> Self {
        Error::Protocol {
            code: frame.code(),
            message: frame
                .error_text()
                .unwrap_or("unexpected response")
                .to_string(),
            frame: frame.clone(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }

    /// The frame the server sent, for protocol errors.
    pub fn frame(&self) -> Option<&Message> {
        match self {
            Error::Protocol { frame, .. } => Some(frame),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Json(e.to_string())
    }
}

impl From<tungstenite::Error> for Error {
    fn from(e: tungstenite::Error) -> Self {
        match e {
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                Error::Closed
            }
            e => Error::Transport(e.to_string()),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Transport(e.to_string())
    }
}
