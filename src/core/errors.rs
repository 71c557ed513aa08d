// Domain error types - policy denials are user-visible, infrastructure detail is not

use thiserror::Error;

/// Main error type for reconciliation
#[derive(Error, Debug)]
pub enum ReconcileError {
    /// Token exchange, identity token verification or profile fetch failed (HTTP 401)
    #[error("Authentication error: {0}")]
    AuthenticationError(String),

    /// The identity provider reports the account as deactivated (HTTP 403)
    #[error("Account is banned by the identity provider")]
    BannedAccount,

    /// The local account is deactivated and must not be revived by a login (HTTP 403)
    #[error("Account {user_id} is suspended")]
    AccountSuspended { user_id: u64 },

    /// Claims are missing a required field (HTTP 400)
    #[error("Invalid claims: {0}")]
    InvalidClaims(String),

    /// Lookup or write against the store failed (HTTP 500)
    #[error("Storage error: {0}")]
    StorageError(String),

    /// Keyspace notification subscription or receive failed
    #[error("Notification error: {0}")]
    NotificationError(String),

    /// Configuration error (HTTP 500)
    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

impl ReconcileError {
    /// Get HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            ReconcileError::AuthenticationError(_) => 401,
            ReconcileError::BannedAccount => 403,
            ReconcileError::AccountSuspended { .. } => 403,
            ReconcileError::InvalidClaims(_) => 400,
            ReconcileError::StorageError(_) => 500,
            ReconcileError::NotificationError(_) => 503,
            ReconcileError::ConfigurationError(_) => 500,
        }
    }

    /// Get user-friendly error message (no sensitive information)
    pub fn user_message(&self) -> String {
        match self {
            ReconcileError::AuthenticationError(_) => "Login failed, please try again".to_string(),
            ReconcileError::BannedAccount => "This account has been banned".to_string(),
            ReconcileError::AccountSuspended { .. } => "This account has been suspended".to_string(),
            ReconcileError::InvalidClaims(reason) => format!("Invalid identity: {}", reason),
            ReconcileError::StorageError(_) => "Internal error".to_string(),
            ReconcileError::NotificationError(_) => "Service unavailable".to_string(),
            ReconcileError::ConfigurationError(_) => "Internal error".to_string(),
        }
    }

    /// Policy denials are final for this login and are shown to the user as-is
    pub fn is_policy_violation(&self) -> bool {
        matches!(
            self,
            ReconcileError::BannedAccount | ReconcileError::AccountSuspended { .. }
        )
    }
}

impl From<sqlx::Error> for ReconcileError {
    fn from(e: sqlx::Error) -> Self {
        ReconcileError::StorageError(e.to_string())
    }
}

impl From<redis::RedisError> for ReconcileError {
    fn from(e: redis::RedisError) -> Self {
        ReconcileError::NotificationError(e.to_string())
    }
}
