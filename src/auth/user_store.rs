// User persistence seams used by the identity reconciler

use crate::core::errors::ReconcileError;
use crate::core::models::{Claims, User};
use async_trait::async_trait;

/// Trait for user store operations.
///
/// Lookups return `Ok(None)` for "not found"; every other failure is an error.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_by_username(&self, username: &str) -> Result<Option<User>, ReconcileError>;
    async fn find_by_id(&self, id: u64) -> Result<Option<User>, ReconcileError>;
    /// Persist an existing row (last write wins per row)
    async fn save(&self, user: &User) -> Result<(), ReconcileError>;
}

/// Account-creation hook. Owns first-login side effects such as the initial grant.
#[async_trait]
pub trait AccountCreator: Send + Sync {
    async fn create_with_initial_grant(&self, claims: &Claims) -> Result<User, ReconcileError>;
}
