// Domain models shared by the identity and expiry paths

use crate::core::errors::ReconcileError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identity facts asserted by the provider for one login attempt.
///
/// The same shape is decoded from ID token claims and from the user endpoint.
/// ID tokens may carry the numeric id only in `sub`; see [`Claims::fill_id_from_sub`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    #[serde(default)]
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_username: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_template: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,
    #[serde(default)]
    pub trust_level: i32,
    #[serde(default)]
    pub active: bool,
}

impl Claims {
    /// Minimal claim set, mostly useful to callers constructing claims by hand.
    pub fn new(id: u64, username: impl Into<String>, active: bool) -> Self {
        Self {
            id,
            sub: None,
            username: username.into(),
            preferred_username: None,
            name: None,
            avatar_template: None,
            picture: None,
            trust_level: 0,
            active,
        }
    }

    /// Populate `id` from the `sub` claim when the token did not carry it directly.
    pub fn fill_id_from_sub(&mut self) -> Result<(), ReconcileError> {
        if self.id != 0 {
            return Ok(());
        }
        let sub = self.sub.as_deref().unwrap_or_default();
        self.id = sub.trim().parse::<u64>().map_err(|e| {
            ReconcileError::AuthenticationError(format!("Invalid sub claim '{}': {}", sub, e))
        })?;
        Ok(())
    }

    /// Normalise a provider claim set (ID token or userinfo): numeric id from
    /// `sub`, handle from `preferred_username` when the provider omits `username`.
    pub fn normalize_token_claims(&mut self) -> Result<(), ReconcileError> {
        self.fill_id_from_sub()?;
        if self.username.is_empty() {
            if let Some(preferred) = self.preferred_username.take() {
                self.username = preferred;
            }
        }
        Ok(())
    }

    /// Reject claim sets that cannot identify a user.
    pub fn validate(&self) -> Result<(), ReconcileError> {
        if self.id == 0 {
            return Err(ReconcileError::InvalidClaims("missing external id".to_string()));
        }
        if self.username.trim().is_empty() {
            return Err(ReconcileError::InvalidClaims("missing username".to_string()));
        }
        Ok(())
    }

    pub fn external_id(&self) -> u64 {
        self.id
    }

    pub fn nickname(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.username)
    }

    pub fn avatar_url(&self) -> &str {
        self.avatar_template
            .as_deref()
            .or(self.picture.as_deref())
            .unwrap_or_default()
    }
}

/// Local user record. `id` is the provider's external id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: u64,
    pub username: String,
    pub nickname: String,
    pub avatar_url: String,
    pub trust_level: i32,
    pub is_active: bool,
    pub balance: i64,
    pub last_login_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    /// Build the row for a first login. Persisting it is the account creator's job.
    pub fn from_claims(claims: &Claims, initial_balance: i64, now: DateTime<Utc>) -> Self {
        Self {
            id: claims.external_id(),
            username: claims.username.clone(),
            nickname: claims.nickname().to_string(),
            avatar_url: claims.avatar_url().to_string(),
            trust_level: claims.trust_level,
            is_active: true,
            balance: initial_balance,
            last_login_at: Some(now),
            created_at: now,
            updated_at: now,
        }
    }

    /// A locally deactivated account is only revived by an administrator.
    pub fn check_active(&self) -> Result<(), ReconcileError> {
        if self.is_active {
            Ok(())
        } else {
            Err(ReconcileError::AccountSuspended { user_id: self.id })
        }
    }

    /// Overwrite the provider-owned fields. `is_active` and `balance` are local state.
    pub fn apply_claims(&mut self, claims: &Claims, now: DateTime<Utc>) {
        self.username = claims.username.clone();
        self.nickname = claims.nickname().to_string();
        self.avatar_url = claims.avatar_url().to_string();
        self.trust_level = claims.trust_level;
        self.last_login_at = Some(now);
        self.updated_at = now;
    }
}

/// Payment order status. Only `Pending` can move, and only forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Paid,
    Failed,
    Expired,
    Refunded,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Paid => "paid",
            OrderStatus::Failed => "failed",
            OrderStatus::Expired => "expired",
            OrderStatus::Refunded => "refunded",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, OrderStatus::Pending)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = ReconcileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OrderStatus::Pending),
            "paid" => Ok(OrderStatus::Paid),
            "failed" => Ok(OrderStatus::Failed),
            "expired" => Ok(OrderStatus::Expired),
            "refunded" => Ok(OrderStatus::Refunded),
            other => Err(ReconcileError::StorageError(format!(
                "Unknown order status '{}'",
                other
            ))),
        }
    }
}

/// Payment order as seen by this crate: only the status is ever written here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: u64,
    pub status: OrderStatus,
    pub expires_at: DateTime<Utc>,
}

impl Order {
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.status == OrderStatus::Pending && self.expires_at <= now
    }
}

/// Tokens returned by the authorization code exchange
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
}
