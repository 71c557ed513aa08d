// Login flow: authorization code -> claims -> reconciled user

use crate::auth::claims_source::{resolve_claims, ClaimsOrigin, ClaimsSource};
use crate::auth::reconciler::{IdentityMatch, IdentityReconciler};
use crate::core::errors::ReconcileError;
use crate::core::models::User;
use std::sync::Arc;
use tracing::{info, warn};

/// Result of a successful login
#[derive(Debug, Clone)]
pub struct LoginOutcome {
    pub user: User,
    pub origin: ClaimsOrigin,
    pub matched: IdentityMatch,
}

/// Wires a claims source to the identity reconciler.
///
/// The web layer owns sessions and the callback route; it hands the code here
/// and stores `outcome.user.id` on success.
pub struct LoginFlow {
    source: Arc<dyn ClaimsSource>,
    reconciler: Arc<IdentityReconciler>,
}

impl LoginFlow {
    pub fn new(source: Arc<dyn ClaimsSource>, reconciler: Arc<IdentityReconciler>) -> Self {
        Self { source, reconciler }
    }

    pub async fn login(&self, code: &str) -> Result<LoginOutcome, ReconcileError> {
        if code.trim().is_empty() {
            return Err(ReconcileError::AuthenticationError(
                "Missing authorization code".to_string(),
            ));
        }

        let resolved = resolve_claims(self.source.as_ref(), code).await?;

        let (user, matched) = self
            .reconciler
            .reconcile_with_match(&resolved.claims)
            .await
            .map_err(|e| {
                warn!(error = %e, user_id = resolved.claims.id, "Login rejected during reconciliation");
                e
            })?;

        info!(
            user_id = user.id,
            username = %user.username,
            origin = ?resolved.origin,
            matched = ?matched,
            "Login succeeded"
        );

        Ok(LoginOutcome {
            user,
            origin: resolved.origin,
            matched,
        })
    }
}
