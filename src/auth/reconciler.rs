// Identity reconciliation - merge provider claims into the local user table

use crate::auth::user_store::{AccountCreator, UserStore};
use crate::core::errors::ReconcileError;
use crate::core::models::{Claims, User};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Which row of the decision table matched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityMatch {
    /// Same id, same username: profile refresh
    Returning,
    /// Username held by another id: a new account now owns the handle
    RecycledUsername,
    /// Known id under a new username
    Renamed,
    /// Neither id nor username known
    FirstLogin,
}

/// Decides how a verified claim set maps onto local `User` rows.
///
/// Holds no locks across calls; every path is one lookup chain followed by a
/// single create or save.
pub struct IdentityReconciler {
    users: Arc<dyn UserStore>,
    accounts: Arc<dyn AccountCreator>,
}

impl IdentityReconciler {
    pub fn new(users: Arc<dyn UserStore>, accounts: Arc<dyn AccountCreator>) -> Self {
        Self { users, accounts }
    }

    /// Reconcile `claims` and return the persisted user
    pub async fn reconcile(&self, claims: &Claims) -> Result<User, ReconcileError> {
        self.reconcile_with_match(claims).await.map(|(user, _)| user)
    }

    /// Reconcile `claims`, also reporting which case applied.
    ///
    /// Evaluation order is fixed: username lookup, then id lookup. The
    /// provider-side ban is checked before anything touches the store.
    pub async fn reconcile_with_match(
        &self,
        claims: &Claims,
    ) -> Result<(User, IdentityMatch), ReconcileError> {
        if !claims.active {
            warn!(user_id = claims.id, username = %claims.username, "Login refused: account banned by provider");
            return Err(ReconcileError::BannedAccount);
        }
        claims.validate()?;

        let external_id = claims.external_id();

        if let Some(holder) = self.users.find_by_username(&claims.username).await? {
            if holder.id == external_id {
                let user = self.refresh(holder, claims).await?;
                return Ok((user, IdentityMatch::Returning));
            }

            info!(
                user_id = external_id,
                previous_holder = holder.id,
                username = %claims.username,
                "Username recycled by a different account"
            );
            // The recycler may already have a row from an earlier login while the
            // stale holder still carries the handle; never insert a second one.
            let user = match self.users.find_by_id(external_id).await? {
                Some(existing) => self.refresh(existing, claims).await?,
                None => self.accounts.create_with_initial_grant(claims).await?,
            };
            return Ok((user, IdentityMatch::RecycledUsername));
        }

        match self.users.find_by_id(external_id).await? {
            Some(existing) => {
                info!(
                    user_id = external_id,
                    old_username = %existing.username,
                    new_username = %claims.username,
                    "Username changed upstream"
                );
                let user = self.refresh(existing, claims).await?;
                Ok((user, IdentityMatch::Renamed))
            }
            None => {
                let user = self.accounts.create_with_initial_grant(claims).await?;
                info!(user_id = user.id, username = %user.username, "Created account on first login");
                Ok((user, IdentityMatch::FirstLogin))
            }
        }
    }

    async fn refresh(&self, mut user: User, claims: &Claims) -> Result<User, ReconcileError> {
        if let Err(e) = user.check_active() {
            warn!(user_id = user.id, "Login refused: local account suspended");
            return Err(e);
        }
        user.apply_claims(claims, Utc::now());
        self.users.save(&user).await?;
        debug!(user_id = user.id, "Profile refreshed from claims");
        Ok(user)
    }
}
