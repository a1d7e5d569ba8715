use std::fmt;

/// Boot-level errors. The orchestration components carry their own richer
/// error enums; this one covers what `Engine::boot` and configuration
/// loading can surface.
#[derive(Debug, Clone, PartialEq)]
pub enum EvalError {
    DatabaseError(String),
    MalformedContent(String),
    ConfigurationError(String),
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvalError::DatabaseError(msg) => write!(f, "Database error: {msg}"),
            EvalError::MalformedContent(msg) => write!(f, "Malformed content: {msg}"),
            EvalError::ConfigurationError(msg) => write!(f, "Configuration error: {msg}"),
        }
    }
}

impl std::error::Error for EvalError {}

impl From<sqlx::Error> for EvalError {
    fn from(e: sqlx::Error) -> Self {
        EvalError::DatabaseError(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EvalError>;
