// Configuration management

use crate::core::errors::ReconcileError;
use crate::infra::oidc::OidcSettings;
use std::env;
use std::time::Duration;

pub const DEFAULT_ISSUER: &str = "https://connect.linux.do/";

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Database
    pub database_url: String,
    pub db_max_connections: u32,

    // Redis
    pub redis_url: String,
    pub redis_connection_timeout_secs: u64,

    // Identity provider
    pub oauth_client_id: String,
    pub oauth_client_secret: String,
    pub oauth_redirect_uri: String,
    pub oauth_issuer: String,
    pub oauth_authorization_endpoint: Option<String>,
    pub oauth_token_endpoint: Option<String>,
    pub oauth_user_endpoint: Option<String>,
    pub http_timeout_secs: u64,

    // Reconciliation
    pub expiry_sweep_interval_secs: u64,
    pub initial_credit: i64,

    // Logging
    pub log_level: String,
    pub log_format: String, // "json" or "text"
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Loads `.env` outside of tests and validates everything before returning.
    pub fn from_env() -> Result<Self, ReconcileError> {
        #[cfg(not(test))]
        {
            dotenv::dotenv().ok();
        }

        let config = Self {
            database_url: Self::get_required_env("DATABASE_URL")?,
            db_max_connections: Self::parse_u32_or_default("DB_MAX_CONNECTIONS", 10)?,
            redis_url: Self::get_env_or_default("REDIS_URL", "redis://localhost:6379/0")?,
            redis_connection_timeout_secs: Self::parse_u64_or_default("REDIS_CONNECTION_TIMEOUT_SECS", 5)?,
            oauth_client_id: Self::get_required_env("OAUTH_CLIENT_ID")?,
            oauth_client_secret: Self::get_required_env("OAUTH_CLIENT_SECRET")?,
            oauth_redirect_uri: Self::get_required_env("OAUTH_REDIRECT_URI")?,
            oauth_issuer: Self::get_env_or_default("OAUTH_ISSUER", DEFAULT_ISSUER)?,
            oauth_authorization_endpoint: Self::get_optional_env("OAUTH_AUTHORIZATION_ENDPOINT")?,
            oauth_token_endpoint: Self::get_optional_env("OAUTH_TOKEN_ENDPOINT")?,
            oauth_user_endpoint: Self::get_optional_env("OAUTH_USER_ENDPOINT")?,
            http_timeout_secs: Self::parse_u64_or_default("HTTP_TIMEOUT_SECS", 10)?,
            expiry_sweep_interval_secs: Self::parse_u64_or_default("EXPIRY_SWEEP_INTERVAL_SECS", 300)?,
            initial_credit: Self::parse_credit()?,
            log_level: Self::get_env_or_default("LOG_LEVEL", "info")?,
            log_format: Self::get_env_or_default("LOG_FORMAT", "json")?,
        };

        config.validate()?;

        Ok(config)
    }

    /// Get environment variable or return default value
    fn get_env_or_default(key: &str, default: &str) -> Result<String, ReconcileError> {
        Ok(env::var(key).unwrap_or_else(|_| default.to_string()))
    }

    /// Get optional environment variable (empty counts as unset)
    fn get_optional_env(key: &str) -> Result<Option<String>, ReconcileError> {
        match env::var(key) {
            Ok(value) if !value.is_empty() => Ok(Some(value)),
            _ => Ok(None),
        }
    }

    fn get_required_env(key: &str) -> Result<String, ReconcileError> {
        let value = env::var(key)
            .map_err(|_| ReconcileError::ConfigurationError(format!("{} not set", key)))?;

        if value.is_empty() {
            return Err(ReconcileError::ConfigurationError(format!("{} is empty", key)));
        }

        Ok(value)
    }

    /// Parse u64 from environment variable or return default
    fn parse_u64_or_default(key: &str, default: u64) -> Result<u64, ReconcileError> {
        match env::var(key) {
            Ok(value) => {
                let parsed = value.parse::<u64>().map_err(|e| {
                    ReconcileError::ConfigurationError(format!("Invalid {} value '{}': {}", key, value, e))
                })?;

                if parsed == 0 {
                    return Err(ReconcileError::ConfigurationError(format!(
                        "{} must be greater than 0",
                        key
                    )));
                }

                Ok(parsed)
            }
            _ => Ok(default),
        }
    }

    /// Parse u32 from environment variable or return default
    fn parse_u32_or_default(key: &str, default: u32) -> Result<u32, ReconcileError> {
        match env::var(key) {
            Ok(value) => {
                let parsed = value.parse::<u32>().map_err(|e| {
                    ReconcileError::ConfigurationError(format!("Invalid {} value '{}': {}", key, value, e))
                })?;

                if parsed == 0 {
                    return Err(ReconcileError::ConfigurationError(format!(
                        "{} must be greater than 0",
                        key
                    )));
                }

                Ok(parsed)
            }
            _ => Ok(default),
        }
    }

    /// INITIAL_CREDIT may be zero but never negative
    fn parse_credit() -> Result<i64, ReconcileError> {
        let value = env::var("INITIAL_CREDIT").unwrap_or_else(|_| "0".to_string());
        let credit = value.parse::<i64>().map_err(|e| {
            ReconcileError::ConfigurationError(format!("Invalid INITIAL_CREDIT value '{}': {}", value, e))
        })?;

        if credit < 0 {
            return Err(ReconcileError::ConfigurationError(
                "INITIAL_CREDIT must not be negative".to_string(),
            ));
        }

        Ok(credit)
    }

    /// Validate all configuration values
    fn validate(&self) -> Result<(), ReconcileError> {
        Self::validate_url(&self.database_url, "Database")?;
        Self::validate_url(&self.redis_url, "Redis")?;
        Self::validate_url(&self.oauth_issuer, "OAuth issuer")?;
        Self::validate_url(&self.oauth_redirect_uri, "OAuth redirect")?;

        for (endpoint, description) in [
            (&self.oauth_authorization_endpoint, "OAuth authorization endpoint"),
            (&self.oauth_token_endpoint, "OAuth token endpoint"),
            (&self.oauth_user_endpoint, "OAuth user endpoint"),
        ] {
            if let Some(ref url) = endpoint {
                Self::validate_url(url, description)?;
            }
        }

        Self::validate_log_level(&self.log_level)?;
        Self::validate_log_format(&self.log_format)?;

        Ok(())
    }

    /// Validate URL format
    fn validate_url(url: &str, description: &str) -> Result<(), ReconcileError> {
        url::Url::parse(url).map_err(|e| {
            ReconcileError::ConfigurationError(format!("Invalid {} URL '{}': {}", description, url, e))
        })?;
        Ok(())
    }

    /// Validate log level
    fn validate_log_level(level: &str) -> Result<(), ReconcileError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&level.to_lowercase().as_str()) {
            return Err(ReconcileError::ConfigurationError(format!(
                "Invalid LOG_LEVEL '{}': must be one of {}",
                level,
                valid_levels.join(", ")
            )));
        }
        Ok(())
    }

    /// Validate log format
    fn validate_log_format(format: &str) -> Result<(), ReconcileError> {
        if format != "json" && format != "text" {
            return Err(ReconcileError::ConfigurationError(format!(
                "Invalid LOG_FORMAT '{}': must be 'json' or 'text'",
                format
            )));
        }
        Ok(())
    }

    pub fn oidc_settings(&self) -> OidcSettings {
        OidcSettings {
            issuer: self.oauth_issuer.clone(),
            client_id: self.oauth_client_id.clone(),
            client_secret: self.oauth_client_secret.clone(),
            redirect_uri: self.oauth_redirect_uri.clone(),
            authorization_endpoint: self.oauth_authorization_endpoint.clone(),
            token_endpoint: self.oauth_token_endpoint.clone(),
            user_endpoint: self.oauth_user_endpoint.clone(),
            http_timeout_secs: self.http_timeout_secs,
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.expiry_sweep_interval_secs)
    }

    pub fn redis_connection_timeout(&self) -> Duration {
        Duration::from_secs(self.redis_connection_timeout_secs)
    }
}

impl Config {
    /// Configuration for tests, bypassing the environment
    pub fn test_config() -> Self {
        Self {
            database_url: "postgresql://localhost/test".to_string(),
            db_max_connections: 10,
            redis_url: "redis://localhost:6379/0".to_string(),
            redis_connection_timeout_secs: 5,
            oauth_client_id: "test-client".to_string(),
            oauth_client_secret: "test-secret".to_string(),
            oauth_redirect_uri: "http://localhost:8000/oauth2/callback".to_string(),
            oauth_issuer: DEFAULT_ISSUER.to_string(),
            oauth_authorization_endpoint: None,
            oauth_token_endpoint: None,
            oauth_user_endpoint: None,
            http_timeout_secs: 10,
            expiry_sweep_interval_secs: 300,
            initial_credit: 0,
            log_level: "info".to_string(),
            log_format: "json".to_string(),
        }
    }
}
