//! Identity resolution for API requests
//!
//! A caller presents a token either as `Authorization: Bearer <token>` or in
//! the `auth-token` cookie. An [`IdentityProvider`] turns the token into an
//! [`Identity`]; handlers receive it through the [`AuthenticatedUser`]
//! extractor.

use async_trait::async_trait;
use axum::{
    extract::FromRequestParts,
    http::{
        header::{AUTHORIZATION, COOKIE},
        request::Parts,
        HeaderMap,
    },
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::config::AuthConfig;
use crate::error::Error;
use crate::server::state::AppState;
use crate::types::Identity;

/// Cookie carrying the session token for browser clients
pub const AUTH_COOKIE: &str = "auth-token";

/// One configured token and the identity it stands for
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenEntry {
    pub token: String,
    #[serde(flatten)]
    pub identity: Identity,
}

/// Resolves a presented token to a caller identity
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn resolve(&self, token: &str) -> Option<Identity>;
}

/// Fixed token table loaded from configuration
#[derive(Debug, Default)]
pub struct StaticTokenProvider {
    tokens: HashMap<String, Identity>,
}

impl StaticTokenProvider {
    pub fn new(entries: impl IntoIterator<Item = TokenEntry>) -> Self {
        let tokens = entries
            .into_iter()
            .map(|entry| (entry.token, entry.identity))
            .collect();
        Self { tokens }
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        let provider = Self::new(config.tokens.iter().cloned());
        if provider.tokens.is_empty() {
            tracing::warn!("No API tokens configured; every request will be rejected");
        } else {
            tracing::info!("Loaded {} API tokens", provider.tokens.len());
        }
        provider
    }
}

#[async_trait]
impl IdentityProvider for StaticTokenProvider {
    async fn resolve(&self, token: &str) -> Option<Identity> {
        self.tokens.get(token).cloned()
    }
}

/// Bearer header first, then the session cookie
pub fn extract_token(headers: &HeaderMap) -> Option<String> {
    let bearer = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty());
    if let Some(token) = bearer {
        return Some(token.to_string());
    }

    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, value)| *name == AUTH_COOKIE && !value.is_empty())
        .map(|(_, value)| value.to_string())
}

/// Extractor for the caller of an authenticated route
#[derive(Debug, Clone)]
pub struct AuthenticatedUser(pub Identity);

#[async_trait]
impl FromRequestParts<AppState> for AuthenticatedUser {
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = extract_token(&parts.headers)
            .ok_or_else(|| Error::Unauthorized("missing credentials".into()))?;

        match state.identity().resolve(&token).await {
            Some(identity) => Ok(AuthenticatedUser(identity)),
            None => {
                tracing::warn!("Rejected unknown token on {}", parts.uri.path());
                Err(Error::Unauthorized("invalid token".into()))
            }
        }
    }
}
