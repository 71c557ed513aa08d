// OIDC / OAuth2 claims source (reqwest + jsonwebtoken)

use crate::auth::claims_source::ClaimsSource;
use crate::core::errors::ReconcileError;
use crate::core::models::{Claims, TokenSet};
use async_trait::async_trait;
use jsonwebtoken::jwk::{JwkSet, KeyAlgorithm};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use rand::RngCore;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const DISCOVERY_PATH: &str = "/.well-known/openid-configuration";
const SCOPES: &str = "openid profile email";

/// Provider settings taken from configuration
#[derive(Debug, Clone)]
pub struct OidcSettings {
    pub issuer: String,
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    /// Static endpoints used when discovery is unavailable
    pub authorization_endpoint: Option<String>,
    pub token_endpoint: Option<String>,
    pub user_endpoint: Option<String>,
    pub http_timeout_secs: u64,
}

/// Subset of the discovery document we rely on
#[derive(Debug, Clone, Deserialize)]
struct ProviderMetadata {
    issuer: String,
    authorization_endpoint: String,
    token_endpoint: String,
    #[serde(default)]
    userinfo_endpoint: Option<String>,
    #[serde(default)]
    jwks_uri: Option<String>,
}

#[derive(Debug, Clone)]
struct Endpoints {
    authorization: String,
    token: String,
    user: String,
}

/// Verifies ID tokens against the provider's JWKS.
///
/// Keys are fetched lazily and refetched once when a token names an unknown `kid`.
struct IdTokenVerifier {
    issuer: String,
    audience: String,
    jwks_uri: String,
    keys: RwLock<Option<JwkSet>>,
}

impl IdTokenVerifier {
    async fn verify(&self, http: &Client, raw_token: &str) -> Result<Claims, ReconcileError> {
        let header = decode_header(raw_token)
            .map_err(|e| ReconcileError::AuthenticationError(format!("Malformed ID token: {}", e)))?;

        let (key, pinned) = match self.find_key(header.kid.as_deref()).await? {
            Some(found) => found,
            None => {
                debug!(kid = ?header.kid, "Unknown signing key, refreshing JWKS");
                self.refresh_keys(http).await?;
                self.find_key(header.kid.as_deref()).await?.ok_or_else(|| {
                    ReconcileError::AuthenticationError(format!(
                        "No JWKS key matches kid {:?}",
                        header.kid
                    ))
                })?
            }
        };

        // A key that declares its algorithm only verifies tokens signed with it
        let alg = match pinned {
            Some(alg) if alg != header.alg => {
                return Err(ReconcileError::AuthenticationError(format!(
                    "ID token alg {:?} does not match key alg {:?}",
                    header.alg, alg
                )));
            }
            Some(alg) => alg,
            None => header.alg,
        };

        let mut validation = Validation::new(alg);
        validation.set_audience(&[&self.audience]);
        validation.set_issuer(&[&self.issuer]);

        let data = decode::<Claims>(raw_token, &key, &validation).map_err(|e| {
            ReconcileError::AuthenticationError(format!("ID token verification failed: {}", e))
        })?;

        let mut claims = data.claims;
        claims.normalize_token_claims()?;
        Ok(claims)
    }

    async fn find_key(
        &self,
        kid: Option<&str>,
    ) -> Result<Option<(DecodingKey, Option<Algorithm>)>, ReconcileError> {
        let keys = self.keys.read().await;
        let Some(set) = keys.as_ref() else {
            return Ok(None);
        };

        let jwk = match kid {
            Some(kid) => set.find(kid),
            None if set.keys.len() == 1 => set.keys.first(),
            None => None,
        };

        let Some(jwk) = jwk else {
            return Ok(None);
        };

        let key = DecodingKey::from_jwk(jwk)
            .map_err(|e| ReconcileError::AuthenticationError(format!("Unusable JWKS key: {}", e)))?;
        let pinned = jwk.common.key_algorithm.map(signing_algorithm).transpose()?;
        Ok(Some((key, pinned)))
    }

    async fn refresh_keys(&self, http: &Client) -> Result<(), ReconcileError> {
        let set: JwkSet = http
            .get(&self.jwks_uri)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| ReconcileError::AuthenticationError(format!("JWKS fetch failed: {}", e)))?
            .json()
            .await
            .map_err(|e| ReconcileError::AuthenticationError(format!("Invalid JWKS document: {}", e)))?;

        debug!(keys = set.keys.len(), "JWKS refreshed");
        *self.keys.write().await = Some(set);
        Ok(())
    }
}

/// Map a JWK `alg` onto the signature algorithm used for validation.
fn signing_algorithm(alg: KeyAlgorithm) -> Result<Algorithm, ReconcileError> {
    match alg {
        KeyAlgorithm::HS256 => Ok(Algorithm::HS256),
        KeyAlgorithm::HS384 => Ok(Algorithm::HS384),
        KeyAlgorithm::HS512 => Ok(Algorithm::HS512),
        KeyAlgorithm::RS256 => Ok(Algorithm::RS256),
        KeyAlgorithm::RS384 => Ok(Algorithm::RS384),
        KeyAlgorithm::RS512 => Ok(Algorithm::RS512),
        KeyAlgorithm::PS256 => Ok(Algorithm::PS256),
        KeyAlgorithm::PS384 => Ok(Algorithm::PS384),
        KeyAlgorithm::PS512 => Ok(Algorithm::PS512),
        KeyAlgorithm::ES256 => Ok(Algorithm::ES256),
        KeyAlgorithm::ES384 => Ok(Algorithm::ES384),
        KeyAlgorithm::EdDSA => Ok(Algorithm::EdDSA),
        other => Err(ReconcileError::AuthenticationError(format!(
            "JWKS key alg {:?} is not a signature algorithm",
            other
        ))),
    }
}

/// Claims source backed by an OIDC provider, with plain OAuth2 fallback
pub struct OidcClaimsSource {
    http: Client,
    client_id: String,
    client_secret: String,
    redirect_uri: String,
    endpoints: Endpoints,
    verifier: Option<IdTokenVerifier>,
}

impl OidcClaimsSource {
    /// Build from discovery, falling back to static endpoints.
    ///
    /// Without discovery there is no ID token verifier and every login goes
    /// through the user endpoint. Fails only when neither discovery nor the
    /// static configuration yields a complete set of endpoints.
    pub async fn discover(settings: &OidcSettings) -> Result<Self, ReconcileError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(settings.http_timeout_secs))
            .connect_timeout(Duration::from_secs(2))
            .build()
            .map_err(|e| {
                ReconcileError::ConfigurationError(format!("Failed to create HTTP client: {}", e))
            })?;

        match Self::fetch_metadata(&http, &settings.issuer).await {
            Ok(metadata) => {
                let user = settings
                    .user_endpoint
                    .clone()
                    .or_else(|| metadata.userinfo_endpoint.clone())
                    .ok_or_else(|| {
                        ReconcileError::ConfigurationError(
                            "Provider has no userinfo endpoint and OAUTH_USER_ENDPOINT is not set"
                                .to_string(),
                        )
                    })?;

                let verifier = metadata.jwks_uri.clone().map(|jwks_uri| IdTokenVerifier {
                    issuer: metadata.issuer.clone(),
                    audience: settings.client_id.clone(),
                    jwks_uri,
                    keys: RwLock::new(None),
                });
                if verifier.is_none() {
                    warn!("Provider publishes no jwks_uri, ID tokens will not be verified");
                }

                info!(issuer = %metadata.issuer, "OIDC provider discovered");
                Ok(Self::assemble(
                    http,
                    settings,
                    Endpoints {
                        authorization: metadata.authorization_endpoint,
                        token: metadata.token_endpoint,
                        user,
                    },
                    verifier,
                ))
            }
            Err(e) => {
                warn!(error = %e, issuer = %settings.issuer, "OIDC discovery failed, using static OAuth2 endpoints");
                let endpoints = Self::static_endpoints(settings)?;
                Ok(Self::assemble(http, settings, endpoints, None))
            }
        }
    }

    fn assemble(
        http: Client,
        settings: &OidcSettings,
        endpoints: Endpoints,
        verifier: Option<IdTokenVerifier>,
    ) -> Self {
        Self {
            http,
            client_id: settings.client_id.clone(),
            client_secret: settings.client_secret.clone(),
            redirect_uri: settings.redirect_uri.clone(),
            endpoints,
            verifier,
        }
    }

    async fn fetch_metadata(http: &Client, issuer: &str) -> Result<ProviderMetadata, ReconcileError> {
        let url = format!("{}{}", issuer.trim_end_matches('/'), DISCOVERY_PATH);
        let metadata: ProviderMetadata = http
            .get(&url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| ReconcileError::ConfigurationError(format!("Discovery request failed: {}", e)))?
            .json()
            .await
            .map_err(|e| ReconcileError::ConfigurationError(format!("Invalid discovery document: {}", e)))?;

        if metadata.issuer.trim_end_matches('/') != issuer.trim_end_matches('/') {
            return Err(ReconcileError::ConfigurationError(format!(
                "Issuer mismatch: configured '{}', provider reports '{}'",
                issuer, metadata.issuer
            )));
        }
        Ok(metadata)
    }

    fn static_endpoints(settings: &OidcSettings) -> Result<Endpoints, ReconcileError> {
        let required = |value: &Option<String>, name: &str| {
            value
                .clone()
                .filter(|v| !v.is_empty())
                .ok_or_else(|| ReconcileError::ConfigurationError(format!("{} not set", name)))
        };
        Ok(Endpoints {
            authorization: required(&settings.authorization_endpoint, "OAUTH_AUTHORIZATION_ENDPOINT")?,
            token: required(&settings.token_endpoint, "OAUTH_TOKEN_ENDPOINT")?,
            user: required(&settings.user_endpoint, "OAUTH_USER_ENDPOINT")?,
        })
    }

    /// Whether ID tokens can be verified (false in static fallback mode)
    pub fn has_verifier(&self) -> bool {
        self.verifier.is_some()
    }

    /// Redirect URL for the authorization step
    pub fn authorization_url(&self, state: &str) -> Result<String, ReconcileError> {
        let mut url = url::Url::parse(&self.endpoints.authorization).map_err(|e| {
            ReconcileError::ConfigurationError(format!(
                "Invalid authorization endpoint '{}': {}",
                self.endpoints.authorization, e
            ))
        })?;
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.client_id)
            .append_pair("redirect_uri", &self.redirect_uri)
            .append_pair("scope", SCOPES)
            .append_pair("state", state);
        Ok(url.into())
    }
}

/// Random value for the OAuth2 `state` parameter
pub fn generate_state() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[async_trait]
impl ClaimsSource for OidcClaimsSource {
    async fn exchange(&self, code: &str) -> Result<TokenSet, ReconcileError> {
        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.redirect_uri.as_str()),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ];

        let response = self
            .http
            .post(&self.endpoints.token)
            .header("Accept", "application/json")
            .form(&params)
            .send()
            .await
            .map_err(|e| ReconcileError::AuthenticationError(format!("Token request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            warn!(status = %status, body = %text, "Token endpoint rejected the code");
            return Err(ReconcileError::AuthenticationError(format!(
                "Token exchange failed: HTTP {}",
                status
            )));
        }

        response
            .json::<TokenSet>()
            .await
            .map_err(|e| ReconcileError::AuthenticationError(format!("Invalid token response: {}", e)))
    }

    async fn verify_identity_token(&self, tokens: &TokenSet) -> Result<Option<Claims>, ReconcileError> {
        let (Some(verifier), Some(raw)) = (self.verifier.as_ref(), tokens.id_token.as_deref()) else {
            return Ok(None);
        };
        verifier.verify(&self.http, raw).await.map(Some)
    }

    async fn fetch_profile(&self, tokens: &TokenSet) -> Result<Claims, ReconcileError> {
        let response = self
            .http
            .get(&self.endpoints.user)
            .bearer_auth(&tokens.access_token)
            .send()
            .await
            .map_err(|e| ReconcileError::AuthenticationError(format!("Profile request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(ReconcileError::AuthenticationError(format!(
                "Profile fetch failed: HTTP {}",
                response.status()
            )));
        }

        let mut claims: Claims = response
            .json()
            .await
            .map_err(|e| ReconcileError::AuthenticationError(format!("Invalid profile response: {}", e)))?;
        claims.normalize_token_claims()?;
        Ok(claims)
    }
}
