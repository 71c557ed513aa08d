// Integration tests: OIDC claims source against a mock provider

use crate::common::MemoryUserStore;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use credit_reconciler::auth::claims_source::{resolve_claims, ClaimsOrigin, ClaimsSource};
use credit_reconciler::auth::login::LoginFlow;
use credit_reconciler::auth::reconciler::{IdentityMatch, IdentityReconciler};
use credit_reconciler::core::errors::ReconcileError;
use credit_reconciler::core::models::TokenSet;
use credit_reconciler::infra::oidc::{OidcClaimsSource, OidcSettings};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use mockito::{Matcher, Mock, ServerGuard};
use serde_json::json;
use std::sync::Arc;

const SECRET: &[u8] = b"reconcile-test-signing-secret-0123456789ab";
const CLIENT_ID: &str = "test-client";

fn settings(issuer: &str) -> OidcSettings {
    OidcSettings {
        issuer: issuer.to_string(),
        client_id: CLIENT_ID.to_string(),
        client_secret: "test-secret".to_string(),
        redirect_uri: "https://app.example/oauth2/callback".to_string(),
        authorization_endpoint: None,
        token_endpoint: None,
        user_endpoint: None,
        http_timeout_secs: 5,
    }
}

fn static_settings(server: &ServerGuard) -> OidcSettings {
    let base = server.url();
    OidcSettings {
        authorization_endpoint: Some(format!("{}/authorize", base)),
        token_endpoint: Some(format!("{}/token", base)),
        user_endpoint: Some(format!("{}/userinfo", base)),
        ..settings(&base)
    }
}

async fn mock_discovery(server: &mut ServerGuard) -> Mock {
    let base = server.url();
    let body = json!({
        "issuer": base,
        "authorization_endpoint": format!("{}/authorize", base),
        "token_endpoint": format!("{}/token", base),
        "userinfo_endpoint": format!("{}/userinfo", base),
        "jwks_uri": format!("{}/jwks", base),
    });
    server
        .mock("GET", "/.well-known/openid-configuration")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(body.to_string())
        .create_async()
        .await
}

async fn mock_jwks(server: &mut ServerGuard, hits: usize) -> Mock {
    mock_jwks_with_alg(server, hits, "HS256").await
}

async fn mock_jwks_with_alg(server: &mut ServerGuard, hits: usize, alg: &str) -> Mock {
    let body = json!({
        "keys": [{
            "kty": "oct",
            "k": URL_SAFE_NO_PAD.encode(SECRET),
            "kid": "k1",
            "alg": alg,
        }]
    });
    server
        .mock("GET", "/jwks")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(body.to_string())
        .expect(hits)
        .create_async()
        .await
}

fn id_token(issuer: &str, kid: &str, secret: &[u8]) -> String {
    let mut header = Header::new(Algorithm::HS256);
    header.kid = Some(kid.to_string());
    let claims = json!({
        "iss": issuer,
        "aud": CLIENT_ID,
        "exp": chrono::Utc::now().timestamp() + 600,
        "sub": "7",
        "username": "alice",
        "name": "Alice",
        "trust_level": 2,
        "active": true,
    });
    encode(&header, &claims, &EncodingKey::from_secret(secret)).unwrap()
}

async fn mock_token(server: &mut ServerGuard, id_token: Option<String>) -> Mock {
    let mut body = json!({
        "access_token": "access-1",
        "token_type": "bearer",
        "expires_in": 3600,
    });
    if let Some(token) = id_token {
        body["id_token"] = json!(token);
    }
    server
        .mock("POST", "/token")
        .match_body(Matcher::AllOf(vec![
            Matcher::UrlEncoded("grant_type".into(), "authorization_code".into()),
            Matcher::UrlEncoded("code".into(), "good-code".into()),
            Matcher::UrlEncoded("client_id".into(), CLIENT_ID.into()),
        ]))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(body.to_string())
        .create_async()
        .await
}

async fn mock_userinfo(server: &mut ServerGuard) -> Mock {
    server
        .mock("GET", "/userinfo")
        .match_header("authorization", "Bearer access-1")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            json!({
                "id": 7,
                "username": "alice",
                "name": "Alice (profile)",
                "avatar_template": "https://cdn.example/alice.png",
                "trust_level": 2,
                "active": true,
            })
            .to_string(),
        )
        .create_async()
        .await
}

fn tokens_with(id_token: String) -> TokenSet {
    TokenSet {
        access_token: "access-1".to_string(),
        token_type: Some("bearer".to_string()),
        id_token: Some(id_token),
        refresh_token: None,
        expires_in: None,
    }
}

#[tokio::test]
async fn test_verified_id_token_resolves_claims() {
    let mut server = mockito::Server::new_async().await;
    let issuer = server.url();
    let _discovery = mock_discovery(&mut server).await;
    let jwks = mock_jwks(&mut server, 1).await;
    let _token = mock_token(&mut server, Some(id_token(&issuer, "k1", SECRET))).await;

    let source = OidcClaimsSource::discover(&settings(&issuer)).await.unwrap();
    assert!(source.has_verifier());

    let resolved = resolve_claims(&source, "good-code").await.unwrap();

    assert_eq!(resolved.origin, ClaimsOrigin::IdToken);
    assert_eq!(resolved.claims.id, 7);
    assert_eq!(resolved.claims.username, "alice");
    assert_eq!(resolved.claims.trust_level, 2);
    assert!(resolved.claims.active);
    jwks.assert_async().await;
}

#[tokio::test]
async fn test_bad_signature_falls_back_to_user_endpoint() {
    let mut server = mockito::Server::new_async().await;
    let issuer = server.url();
    let _discovery = mock_discovery(&mut server).await;
    let _jwks = mock_jwks(&mut server, 1).await;
    let forged = id_token(&issuer, "k1", b"some-other-secret-entirely-0123456789");
    let _token = mock_token(&mut server, Some(forged)).await;
    let userinfo = mock_userinfo(&mut server).await;

    let source = OidcClaimsSource::discover(&settings(&issuer)).await.unwrap();
    let resolved = resolve_claims(&source, "good-code").await.unwrap();

    assert_eq!(resolved.origin, ClaimsOrigin::UserEndpoint);
    assert_eq!(resolved.claims.nickname(), "Alice (profile)");
    userinfo.assert_async().await;
}

#[tokio::test]
async fn test_missing_id_token_uses_user_endpoint() {
    let mut server = mockito::Server::new_async().await;
    let issuer = server.url();
    let _discovery = mock_discovery(&mut server).await;
    let jwks = mock_jwks(&mut server, 0).await;
    let _token = mock_token(&mut server, None).await;
    let _userinfo = mock_userinfo(&mut server).await;

    let source = OidcClaimsSource::discover(&settings(&issuer)).await.unwrap();
    let resolved = resolve_claims(&source, "good-code").await.unwrap();

    assert_eq!(resolved.origin, ClaimsOrigin::UserEndpoint);
    jwks.assert_async().await;
}

#[tokio::test]
async fn test_userinfo_preferred_username_becomes_username() {
    let mut server = mockito::Server::new_async().await;
    let issuer = server.url();
    let _discovery = mock_discovery(&mut server).await;
    let _token = mock_token(&mut server, None).await;
    let _userinfo = server
        .mock("GET", "/userinfo")
        .match_header("authorization", "Bearer access-1")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"sub":"7","preferred_username":"alice","active":true}"#)
        .create_async()
        .await;

    let source = Arc::new(OidcClaimsSource::discover(&settings(&issuer)).await.unwrap());
    let resolved = resolve_claims(source.as_ref(), "good-code").await.unwrap();

    assert_eq!(resolved.origin, ClaimsOrigin::UserEndpoint);
    assert_eq!(resolved.claims.id, 7);
    assert_eq!(resolved.claims.username, "alice");

    let store = Arc::new(MemoryUserStore::default());
    let flow = LoginFlow::new(
        source,
        Arc::new(IdentityReconciler::new(store.clone(), store.clone())),
    );
    let outcome = flow.login("good-code").await.unwrap();

    assert_eq!(outcome.origin, ClaimsOrigin::UserEndpoint);
    assert_eq!(outcome.user.username, "alice");
    assert_eq!(store.get(7).unwrap().username, "alice");
}

#[tokio::test]
async fn test_token_alg_must_match_key_alg() {
    let mut server = mockito::Server::new_async().await;
    let issuer = server.url();
    let _discovery = mock_discovery(&mut server).await;
    let _jwks = mock_jwks_with_alg(&mut server, 1, "HS384").await;

    let source = OidcClaimsSource::discover(&settings(&issuer)).await.unwrap();
    let tokens = tokens_with(id_token(&issuer, "k1", SECRET));

    match source.verify_identity_token(&tokens).await {
        Err(ReconcileError::AuthenticationError(msg)) => assert!(msg.contains("does not match")),
        other => panic!("expected alg mismatch, got {:?}", other),
    }
}

#[tokio::test]
async fn test_jwks_cached_between_verifications() {
    let mut server = mockito::Server::new_async().await;
    let issuer = server.url();
    let _discovery = mock_discovery(&mut server).await;
    let jwks = mock_jwks(&mut server, 1).await;

    let source = OidcClaimsSource::discover(&settings(&issuer)).await.unwrap();
    for _ in 0..3 {
        let tokens = tokens_with(id_token(&issuer, "k1", SECRET));
        let claims = source.verify_identity_token(&tokens).await.unwrap().unwrap();
        assert_eq!(claims.id, 7);
    }
    jwks.assert_async().await;
}

#[tokio::test]
async fn test_unknown_kid_refetches_jwks_once() {
    let mut server = mockito::Server::new_async().await;
    let issuer = server.url();
    let _discovery = mock_discovery(&mut server).await;
    let jwks = mock_jwks(&mut server, 2).await;

    let source = OidcClaimsSource::discover(&settings(&issuer)).await.unwrap();

    let known = tokens_with(id_token(&issuer, "k1", SECRET));
    assert!(source.verify_identity_token(&known).await.unwrap().is_some());

    let rotated = tokens_with(id_token(&issuer, "k2", SECRET));
    let result = source.verify_identity_token(&rotated).await;
    assert!(matches!(result, Err(ReconcileError::AuthenticationError(_))));

    jwks.assert_async().await;
}

#[tokio::test]
async fn test_wrong_audience_rejected() {
    let mut server = mockito::Server::new_async().await;
    let issuer = server.url();
    let _discovery = mock_discovery(&mut server).await;
    let _jwks = mock_jwks(&mut server, 1).await;

    let mut other_client = settings(&issuer);
    other_client.client_id = "someone-else".to_string();
    let source = OidcClaimsSource::discover(&other_client).await.unwrap();

    let tokens = tokens_with(id_token(&issuer, "k1", SECRET));
    assert!(source.verify_identity_token(&tokens).await.is_err());
}

#[tokio::test]
async fn test_discovery_failure_uses_static_endpoints() {
    let mut server = mockito::Server::new_async().await;
    let _token = mock_token(&mut server, Some("not-verified".to_string())).await;
    let userinfo = mock_userinfo(&mut server).await;

    let source = OidcClaimsSource::discover(&static_settings(&server)).await.unwrap();
    assert!(!source.has_verifier());

    let resolved = resolve_claims(&source, "good-code").await.unwrap();
    assert_eq!(resolved.origin, ClaimsOrigin::UserEndpoint);
    assert_eq!(resolved.claims.id, 7);
    userinfo.assert_async().await;
}

#[tokio::test]
async fn test_discovery_failure_without_static_endpoints() {
    let server = mockito::Server::new_async().await;

    let result = OidcClaimsSource::discover(&settings(&server.url())).await;
    assert!(matches!(result, Err(ReconcileError::ConfigurationError(_))));
}

#[tokio::test]
async fn test_issuer_mismatch_treated_as_discovery_failure() {
    let mut server = mockito::Server::new_async().await;
    let _discovery = server
        .mock("GET", "/.well-known/openid-configuration")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            json!({
                "issuer": "https://impostor.example",
                "authorization_endpoint": "https://impostor.example/authorize",
                "token_endpoint": "https://impostor.example/token",
                "jwks_uri": "https://impostor.example/jwks",
            })
            .to_string(),
        )
        .create_async()
        .await;

    let source = OidcClaimsSource::discover(&static_settings(&server)).await.unwrap();
    assert!(!source.has_verifier());
}

#[tokio::test]
async fn test_token_endpoint_rejection() {
    let mut server = mockito::Server::new_async().await;
    let _token = server
        .mock("POST", "/token")
        .with_status(400)
        .with_body(r#"{"error":"invalid_grant"}"#)
        .create_async()
        .await;

    let source = OidcClaimsSource::discover(&static_settings(&server)).await.unwrap();
    let result = source.exchange("stale-code").await;

    assert!(matches!(result, Err(ReconcileError::AuthenticationError(_))));
}

#[tokio::test]
async fn test_authorization_url() {
    let server = mockito::Server::new_async().await;
    let source = OidcClaimsSource::discover(&static_settings(&server)).await.unwrap();

    let url = source.authorization_url("abc123").unwrap();
    let parsed = url::Url::parse(&url).unwrap();
    let pairs: Vec<(String, String)> = parsed.query_pairs().into_owned().collect();

    assert!(url.starts_with(&format!("{}/authorize?", server.url())));
    assert!(pairs.contains(&("response_type".to_string(), "code".to_string())));
    assert!(pairs.contains(&("client_id".to_string(), CLIENT_ID.to_string())));
    assert!(pairs.contains(&("scope".to_string(), "openid profile email".to_string())));
    assert!(pairs.contains(&("state".to_string(), "abc123".to_string())));
}

#[tokio::test]
async fn test_login_flow_end_to_end() {
    let mut server = mockito::Server::new_async().await;
    let issuer = server.url();
    let _discovery = mock_discovery(&mut server).await;
    let _jwks = mock_jwks(&mut server, 1).await;
    let _token = mock_token(&mut server, Some(id_token(&issuer, "k1", SECRET))).await;

    let source = Arc::new(OidcClaimsSource::discover(&settings(&issuer)).await.unwrap());
    let store = Arc::new(MemoryUserStore::default());
    let flow = LoginFlow::new(
        source,
        Arc::new(IdentityReconciler::new(store.clone(), store.clone())),
    );

    let outcome = flow.login("good-code").await.unwrap();

    assert_eq!(outcome.origin, ClaimsOrigin::IdToken);
    assert_eq!(outcome.matched, IdentityMatch::FirstLogin);
    assert_eq!(outcome.user.id, 7);
    assert_eq!(store.get(7).unwrap().nickname, "Alice");

    let again = flow.login("good-code").await.unwrap();
    assert_eq!(again.matched, IdentityMatch::Returning);
    assert_eq!(store.len(), 1);
}
