// Two-step claims resolution: verified ID token first, user endpoint as fallback

use crate::core::errors::ReconcileError;
use crate::core::models::{Claims, TokenSet};
use async_trait::async_trait;
use tracing::{info, warn};

/// Capability that turns an authorization code into provider-asserted claims.
///
/// Implementations own the handshake (redirect, exchange, signature checks);
/// the reconcilers never see tokens.
#[async_trait]
pub trait ClaimsSource: Send + Sync {
    /// Exchange an authorization code for tokens
    async fn exchange(&self, code: &str) -> Result<TokenSet, ReconcileError>;

    /// Verify the ID token carried by `tokens`.
    ///
    /// Returns `Ok(None)` when there is nothing to verify (no `id_token`, or
    /// the provider was configured without a verifier).
    async fn verify_identity_token(&self, tokens: &TokenSet) -> Result<Option<Claims>, ReconcileError>;

    /// Fetch the profile from the provider's user endpoint
    async fn fetch_profile(&self, tokens: &TokenSet) -> Result<Claims, ReconcileError>;
}

/// Which step produced the claims
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimsOrigin {
    IdToken,
    UserEndpoint,
}

#[derive(Debug, Clone)]
pub struct ResolvedClaims {
    pub claims: Claims,
    pub origin: ClaimsOrigin,
}

/// Exchange `code` and resolve claims, preferring the verified ID token.
///
/// A failed or unavailable ID token is logged and the profile endpoint is used
/// instead. Only a failed exchange or a failed fallback is an error.
pub async fn resolve_claims(
    source: &dyn ClaimsSource,
    code: &str,
) -> Result<ResolvedClaims, ReconcileError> {
    let tokens = source.exchange(code).await?;

    match source.verify_identity_token(&tokens).await {
        Ok(Some(claims)) => {
            info!(user_id = claims.id, username = %claims.username, "Authenticated via ID token");
            return Ok(ResolvedClaims {
                claims,
                origin: ClaimsOrigin::IdToken,
            });
        }
        Ok(None) => {}
        Err(e) => {
            warn!(error = %e, "ID token rejected, falling back to user endpoint");
        }
    }

    info!("Using user endpoint fallback for authentication");
    let claims = source.fetch_profile(&tokens).await?;
    Ok(ResolvedClaims {
        claims,
        origin: ClaimsOrigin::UserEndpoint,
    })
}
