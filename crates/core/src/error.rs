//! Error types for the treasury core.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("KV store error: {0}")]
    Kv(String),

    #[error("KV connection failed: {0}")]
    KvConnection(String),

    #[error("lock conflict: operation already in progress for {op}:{id}")]
    LockConflict { op: String, id: String },

    #[error("chain client error: {0}")]
    Chain(#[from] treasury_chain::ChainError),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("invalid configuration: {field}, reason: {reason}")]
    InvalidConfig { field: String, reason: String },

    #[error("JSON decode error: {context}, error: {error}")]
    JsonDecode { context: String, error: String },

    #[error("missing required field: {field}, context: {context}")]
    MissingField { field: String, context: String },

    #[error("invalid asset: {asset}, reason: {reason}")]
    InvalidAsset { asset: String, reason: String },

    #[error("price unavailable for asset {asset_id}")]
    PriceUnavailable { asset_id: String },

    #[error("mismatched price decimals: {a} uses {a_decimals}, {b} uses {b_decimals}")]
    MismatchedPriceDecimals {
        a: String,
        a_decimals: u32,
        b: String,
        b_decimals: u32,
    },

    #[error("duplicate transaction: {0}")]
    DuplicateTransaction(String),

    #[error("duplicate job request: {0}")]
    DuplicateJob(String),

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("not a depositor: {0}")]
    NotADepositor(String),

    #[error("invalid signature")]
    InvalidSignature,

    #[error("signed message expired")]
    MessageExpired,

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("operation failed: {0}")]
    OperationFailed(String),
}

impl CoreError {
    pub fn log_level(&self) -> tracing::Level {
        use tracing::Level;
        match self {
            Self::Kv(_) | Self::KvConnection(_) => Level::ERROR,
            Self::Chain(_) => Level::WARN,
            Self::LockConflict { .. } => Level::INFO,
            Self::Config(_) | Self::InvalidConfig { .. } => Level::ERROR,
            Self::JsonDecode { .. } | Self::MissingField { .. } => Level::WARN,
            Self::InvalidAsset { .. } => Level::WARN,
            Self::PriceUnavailable { .. } => Level::WARN,
            Self::MismatchedPriceDecimals { .. } => Level::ERROR,
            Self::DuplicateTransaction(_) | Self::DuplicateJob(_) => Level::DEBUG,
            Self::JobNotFound(_) => Level::DEBUG,
            Self::NotADepositor(_) => Level::INFO,
            Self::InvalidSignature | Self::MessageExpired => Level::INFO,
            Self::InvalidAmount(_) => Level::INFO,
            Self::OperationFailed(_) => Level::ERROR,
        }
    }

    /// Whether the caller should requeue the job for this error rather than
    /// failing it permanently.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Kv(_) | Self::KvConnection(_) | Self::Chain(_) | Self::PriceUnavailable { .. }
        )
    }
}

impl From<redis::RedisError> for CoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_dropped() || err.is_connection_refusal() {
            Self::KvConnection(err.to_string())
        } else {
            Self::Kv(err.to_string())
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::JsonDecode {
            context: "JSON decode".to_string(),
            error: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
