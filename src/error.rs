use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("{entity} `{key}` already exists")]
    AlreadyExists { entity: &'static str, key: String },
    #[error("{entity} `{key}` not found")]
    NotFound { entity: &'static str, key: String },
    #[error("quota exceeded for `{account}`: {requested} requested, {used}/{limit} used")]
    QuotaExceeded {
        account: String,
        requested: u64,
        used: u64,
        limit: u64,
    },
    #[error("upload would not extend the garbage collection deadline")]
    ShorterRetention,
    #[error("insufficient balance for `{account}`: {requested} requested, {available} available")]
    InsufficientBalance {
        account: String,
        requested: f64,
        available: f64,
    },
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("tier `{tier}` does not permit {capability}")]
    CapabilityDenied {
        tier: &'static str,
        capability: &'static str,
    },
    #[error("overflow: {0}")]
    Overflow(String),
    #[error("database error: {0}")]
    Store(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl LedgerError {
    pub fn not_found(entity: &'static str, key: impl Into<String>) -> Self {
        LedgerError::NotFound {
            entity,
            key: key.into(),
        }
    }

    pub fn already_exists(entity: &'static str, key: impl Into<String>) -> Self {
        LedgerError::AlreadyExists {
            entity,
            key: key.into(),
        }
    }

    /// Stable label used as the `error` field on log events.
    pub fn kind(&self) -> &'static str {
        match self {
            LedgerError::AlreadyExists { .. } => "already_exists",
            LedgerError::NotFound { .. } => "not_found",
            LedgerError::QuotaExceeded { .. } => "quota_exceeded",
            LedgerError::ShorterRetention => "shorter_retention",
            LedgerError::InsufficientBalance { .. } => "insufficient_balance",
            LedgerError::InvalidState(_) => "invalid_state",
            LedgerError::CapabilityDenied { .. } => "capability_denied",
            LedgerError::Overflow(_) => "overflow",
            LedgerError::Store(_) => "store",
            LedgerError::Migrate(_) => "migrate",
        }
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;
