//! Crate-wide error type for the order-book engine.
//!
//! Error kinds mirror the handling policy of the engine: transient network
//! failures and desyncs are retried internally and never reach a subscriber,
//! malformed messages are dropped, and only `FatalInit` is allowed to abort
//! the process.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    #[error("desync detected for {symbol}")]
    DesyncDetected { symbol: String },

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("fatal initialization failure: {0}")]
    FatalInit(String),

    #[error("storage write failure: {0}")]
    StorageWriteFailure(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl EngineError {
    /// Whether a caller should retry the operation that produced this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::TransientNetwork(_) | EngineError::DesyncDetected { .. }
        )
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            EngineError::TransientNetwork(err.to_string())
        } else if let Some(status) = err.status() {
            match status.as_u16() {
                429 | 418 | 403 => EngineError::TransientNetwork(format!(
                    "rate limited by venue (HTTP {})",
                    status.as_u16()
                )),
                500..=599 => EngineError::TransientNetwork(format!(
                    "venue server error (HTTP {})",
                    status.as_u16()
                )),
                _ => EngineError::MalformedMessage(format!("unexpected HTTP status: {}", status)),
            }
        } else {
            EngineError::TransientNetwork(err.to_string())
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::MalformedMessage(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for EngineError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        EngineError::TransientNetwork(err.to_string())
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        EngineError::StorageWriteFailure(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_and_desync_are_retryable() {
        assert!(EngineError::TransientNetwork("x".into()).is_retryable());
        assert!(
            EngineError::DesyncDetected {
                symbol: "BTCUSDT".into()
            }
            .is_retryable()
        );
        assert!(!EngineError::FatalInit("x".into()).is_retryable());
    }

    #[test]
    fn json_error_maps_to_malformed_message() {
        let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let engine_err: EngineError = err.into();
        assert!(matches!(engine_err, EngineError::MalformedMessage(_)));
    }
}
