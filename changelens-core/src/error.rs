use thiserror::Error;

/// Core error taxonomy. Every variant carries a human-readable message and
/// an optional hint directing the caller toward a recovery action.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Validation error: {message}")]
    Validation { message: String, hint: Option<String> },

    #[error("Not found: {message}")]
    NotFound { message: String, hint: Option<String> },

    #[error("Conflict: {message}")]
    Conflict { message: String, hint: Option<String> },

    #[error("Store unavailable: {message}")]
    Unavailable { message: String, hint: Option<String> },

    #[error("Not implemented: {message}")]
    NotImplemented { message: String },

    #[error("Operation timed out: {message}")]
    Timeout { message: String, hint: Option<String> },

    #[error("Invariant violation: {message}")]
    Invariant { message: String },
}

impl CoreError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            hint: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
            hint: None,
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
            hint: None,
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
            hint: None,
        }
    }

    pub fn not_implemented(message: impl Into<String>) -> Self {
        Self::NotImplemented {
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
            hint: None,
        }
    }

    pub fn invariant(message: impl Into<String>) -> Self {
        Self::Invariant {
            message: message.into(),
        }
    }

    pub fn with_hint(mut self, new_hint: impl Into<String>) -> Self {
        match &mut self {
            Self::Validation { hint, .. }
            | Self::NotFound { hint, .. }
            | Self::Conflict { hint, .. }
            | Self::Unavailable { hint, .. }
            | Self::Timeout { hint, .. } => *hint = Some(new_hint.into()),
            Self::NotImplemented { .. } | Self::Invariant { .. } => {}
        }
        self
    }

    /// Machine-readable kind string for transport layers.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation_error",
            Self::NotFound { .. } => "not_found",
            Self::Conflict { .. } => "conflict",
            Self::Unavailable { .. } => "unavailable",
            Self::NotImplemented { .. } => "not_implemented",
            Self::Timeout { .. } => "timeout",
            Self::Invariant { .. } => "invariant_violation",
        }
    }

    pub fn hint(&self) -> Option<&str> {
        match self {
            Self::Validation { hint, .. }
            | Self::NotFound { hint, .. }
            | Self::Conflict { hint, .. }
            | Self::Unavailable { hint, .. }
            | Self::Timeout { hint, .. } => hint.as_deref(),
            Self::NotImplemented { .. } | Self::Invariant { .. } => None,
        }
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => CoreError::not_found("row not found"),
            sqlx::Error::PoolClosed => {
                CoreError::unavailable("event store is closed").with_hint("reopen the store")
            }
            sqlx::Error::PoolTimedOut => {
                CoreError::timeout("timed out acquiring a store connection")
                    .with_hint("retry with a longer deadline")
            }
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                CoreError::conflict(format!("unique constraint violated: {}", db.message()))
                    .with_hint("look the record up before retrying the insert")
            }
            _ => CoreError::unavailable(format!("store error: {}", err)),
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
