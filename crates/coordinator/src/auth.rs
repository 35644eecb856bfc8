//! Bearer-token authentication. Tokens are JWTs issued by the configured
//! identity provider; the token subject becomes the actor identity stamped
//! on scan transitions.

use crate::error::ApiError;
use crate::AppState;
use async_trait::async_trait;
use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::{IntoResponse, Response},
};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use std::collections::HashMap;

#[derive(Clone, Debug)]
pub struct Identity {
    pub subject: String,
}

#[async_trait]
pub trait TokenVerifier: Send + Sync + 'static {
    async fn verify(&self, token: &str) -> Option<Identity>;
}

fn extract_bearer(req: &Request) -> Option<String> {
    let value = req.headers().get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if scheme.eq_ignore_ascii_case("bearer") {
        Some(token.trim().to_string())
    } else {
        None
    }
}

pub async fn auth_layer(State(state): State<AppState>, mut req: Request, next: Next) -> Result<Response, Response> {
    let path = req.uri().path();
    // Probes, server metadata and metrics exposition stay open.
    if matches!(path, "/" | "/health" | "/readyz" | "/metrics") {
        return Ok(next.run(req).await);
    }
    let Some(token) = extract_bearer(&req) else {
        tracing::debug!(%path, "auth_missing_bearer");
        return Err(ApiError::unauthorized("missing bearer token").into_response());
    };
    let Some(identity) = state.verifier.verify(&token).await else {
        tracing::debug!(%path, "auth_invalid_token");
        return Err(ApiError::unauthorized("invalid token").into_response());
    };
    req.extensions_mut().insert(identity);
    Ok(next.run(req).await)
}

#[derive(Deserialize)]
struct Claims {
    sub: String,
}

#[derive(Deserialize)]
struct Jwks {
    keys: Vec<Jwk>,
}

#[derive(Deserialize)]
struct Jwk {
    kid: String,
    kty: String,
    #[serde(default)]
    n: String,
    #[serde(default)]
    e: String,
}

/// RS256 validation against the identity provider's JWKS, with the key set
/// cached by `kid`. Unknown kids trigger one refetch (key rotation).
pub struct JwtVerifier {
    client: reqwest::Client,
    issuer: String,
    audience: String,
    jwks_url: String,
    keys: tokio::sync::RwLock<HashMap<String, DecodingKey>>,
}

impl JwtVerifier {
    pub fn new(domain: &str, audience: &str) -> Self {
        let issuer = format!("https://{domain}/");
        Self {
            client: reqwest::Client::new(),
            jwks_url: format!("{issuer}.well-known/jwks.json"),
            issuer,
            audience: audience.to_string(),
            keys: tokio::sync::RwLock::new(HashMap::new()),
        }
    }

    async fn refresh_keys(&self) -> Option<()> {
        let jwks: Jwks = self.client.get(&self.jwks_url).send().await.ok()?.json().await.ok()?;
        let mut keys = self.keys.write().await;
        keys.clear();
        for jwk in jwks.keys {
            if jwk.kty != "RSA" {
                continue;
            }
            if let Ok(key) = DecodingKey::from_rsa_components(&jwk.n, &jwk.e) {
                keys.insert(jwk.kid, key);
            }
        }
        Some(())
    }

    async fn key_for(&self, kid: &str) -> Option<DecodingKey> {
        if let Some(key) = self.keys.read().await.get(kid) {
            return Some(key.clone());
        }
        self.refresh_keys().await?;
        self.keys.read().await.get(kid).cloned()
    }
}

#[async_trait]
impl TokenVerifier for JwtVerifier {
    async fn verify(&self, token: &str) -> Option<Identity> {
        let header = decode_header(token).ok()?;
        let key = self.key_for(header.kid.as_deref()?).await?;
        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&[&self.audience]);
        validation.set_issuer(&[&self.issuer]);
        let data = decode::<Claims>(token, &key, &validation).ok()?;
        Some(Identity { subject: data.claims.sub })
    }
}

/// Test verifier: the bearer token itself is the subject.
pub struct StaticVerifier;

#[async_trait]
impl TokenVerifier for StaticVerifier {
    async fn verify(&self, token: &str) -> Option<Identity> {
        if token.is_empty() {
            return None;
        }
        Some(Identity { subject: token.to_string() })
    }
}
