//! Error types for the chain capability clients.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChainError {
    #[error("RPC call failed: {method}, error: {error}")]
    Rpc { method: String, error: String },

    #[error("HTTP request failed: {url}, status: {status:?}, error: {error}")]
    HttpRequest {
        url: String,
        status: Option<u16>,
        error: String,
    },

    #[error("network timeout after {timeout_secs}s: {context}")]
    NetworkTimeout { timeout_secs: u64, context: String },

    #[error("network connection error: {0}")]
    NetworkConnection(String),

    #[error("aggregator error: {status}, message: {message}")]
    AggregatorResponse { status: u16, message: String },

    #[error("invalid aggregator response: {0}")]
    AggregatorInvalidResponse(String),

    #[error("price oracle returned a non-finite or non-positive price for {symbol}")]
    InvalidPrice { symbol: String },

    #[error("transaction reverted: {0}")]
    TransactionReverted(String),

    #[error("transaction receipt timed out: {hash}")]
    ReceiptTimeout { hash: String },

    #[error("signing key error: {0}")]
    SigningKey(String),

    #[error("signature recovery failed: {0}")]
    SignatureRecovery(String),

    #[error("JSON parsing error: {context}, error: {error}")]
    JsonParse { context: String, error: String },

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("operation failed: {0}")]
    OperationFailed(String),
}

impl ChainError {
    pub fn log_level(&self) -> tracing::Level {
        use tracing::Level;
        match self {
            Self::Rpc { .. } => Level::ERROR,
            Self::HttpRequest { .. } | Self::NetworkConnection(_) => Level::WARN,
            Self::NetworkTimeout { .. } => Level::WARN,
            Self::AggregatorResponse { .. } | Self::AggregatorInvalidResponse(_) => Level::WARN,
            Self::InvalidPrice { .. } => Level::WARN,
            Self::TransactionReverted(_) => Level::ERROR,
            Self::ReceiptTimeout { .. } => Level::ERROR,
            Self::SigningKey(_) => Level::ERROR,
            Self::SignatureRecovery(_) => Level::INFO,
            Self::JsonParse { .. } => Level::WARN,
            Self::InvalidAddress(_) => Level::INFO,
            Self::OperationFailed(_) => Level::ERROR,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NetworkTimeout { .. } | Self::NetworkConnection(_) | Self::HttpRequest { .. } => true,
            Self::AggregatorResponse { status, .. } => *status >= 500,
            Self::Rpc { .. } => true,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for ChainError {
    fn from(err: reqwest::Error) -> Self {
        let url = err.url().map(|u| u.to_string()).unwrap_or_default();
        let status = err.status().map(|s| s.as_u16());

        if err.is_timeout() {
            Self::NetworkTimeout { timeout_secs: 30, context: url }
        } else if err.is_connect() {
            Self::NetworkConnection(format!("failed to connect to {url}: {err}"))
        } else {
            Self::HttpRequest { url, status, error: err.to_string() }
        }
    }
}

impl From<serde_json::Error> for ChainError {
    fn from(err: serde_json::Error) -> Self {
        Self::JsonParse { context: "JSON deserialization".to_string(), error: err.to_string() }
    }
}

pub type Result<T> = std::result::Result<T, ChainError>;
