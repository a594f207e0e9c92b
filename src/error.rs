//! Error types for panel operations

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum PanelError {
    #[error("Resource not found")]
    NotFound,

    #[error("Resource already exists")]
    AlreadyExists,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Authentication failed")]
    AuthFailed,

    #[error("Not allowed: {0}")]
    Forbidden(String),

    #[error("Node unavailable: {detail} (status: {status_code})")]
    NodeUnavailable { status_code: u16, detail: String },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for PanelError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => PanelError::NotFound,
            sqlx::Error::Database(db) if db.is_unique_violation() => PanelError::AlreadyExists,
            _ => PanelError::Database(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for PanelError {
    fn from(err: serde_json::Error) -> Self {
        PanelError::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for PanelError {
    fn from(err: reqwest::Error) -> Self {
        let status_code = err.status().map(|s| s.as_u16()).unwrap_or(0);
        PanelError::NodeUnavailable {
            status_code,
            detail: err.to_string(),
        }
    }
}

impl PanelError {
    pub fn node_unavailable(detail: impl Into<String>) -> Self {
        PanelError::NodeUnavailable {
            status_code: 0,
            detail: detail.into(),
        }
    }

    /// Check if this is a not found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, PanelError::NotFound)
    }

    /// Check if this is an authentication error
    pub fn is_auth_failed(&self) -> bool {
        matches!(self, PanelError::AuthFailed)
    }

    /// Check if this is a uniqueness or state conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, PanelError::AlreadyExists) || matches!(self, PanelError::Conflict(_))
    }

    /// Check if this is a node communication failure
    pub fn is_node_unavailable(&self) -> bool {
        matches!(self, PanelError::NodeUnavailable { .. })
    }

    /// Check if this error is recoverable by the health-check loop
    pub fn is_retryable(&self) -> bool {
        self.is_node_unavailable()
    }
}

pub type Result<T> = std::result::Result<T, PanelError>;
