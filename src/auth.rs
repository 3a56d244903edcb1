//! Bearer-token authentication.
//!
//! Token issuance and signature verification belong to the identity
//! service; this crate only needs the `(client type, client id)` pair a
//! token resolves to, which [`Authenticator`] provides.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use thiserror::Error;

use crate::error::AppError;
use crate::models::claims::{Claims, ClientType};
use crate::state::AppState;

#[derive(Debug, Error, PartialEq)]
pub enum AuthError {
    #[error("invalid token")]
    InvalidToken,

    #[error("invalid token table entry: {0}")]
    InvalidTable(String),
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, token: &str) -> Result<Claims, AuthError>;
}

/// Fixed token table, parsed from `token=role:id` pairs separated by commas,
/// e.g. `alice-token=user:7,ops-token=admin:1`.
#[derive(Debug, Default)]
pub struct StaticTokenAuthenticator {
    tokens: HashMap<String, Claims>,
}

impl StaticTokenAuthenticator {
    pub fn new(tokens: impl IntoIterator<Item = (String, Claims)>) -> Self {
        Self {
            tokens: tokens.into_iter().collect(),
        }
    }

    pub fn parse(table: &str) -> Result<Self, AuthError> {
        let mut tokens = HashMap::new();

        for entry in table.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let invalid = || AuthError::InvalidTable(entry.to_string());

            let (token, identity) = entry.split_once('=').ok_or_else(invalid)?;
            let (role, id) = identity.split_once(':').ok_or_else(invalid)?;
            let client_type = role.trim().parse::<ClientType>().map_err(|_| invalid())?;
            let client_id = id.trim().parse::<i64>().map_err(|_| invalid())?;

            if token.trim().is_empty() || client_id <= 0 {
                return Err(invalid());
            }
            tokens.insert(token.trim().to_string(), Claims::new(client_type, client_id));
        }

        Ok(Self { tokens })
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuthenticator {
    async fn authenticate(&self, token: &str) -> Result<Claims, AuthError> {
        self.tokens.get(token).copied().ok_or(AuthError::InvalidToken)
    }
}

/// Accepts both `Bearer <token>` and a bare token, as older clients send.
pub fn bearer_token(header: &str) -> Option<&str> {
    let token = header
        .strip_prefix("Bearer ")
        .or_else(|| header.strip_prefix("bearer "))
        .unwrap_or(header)
        .trim();

    (!token.is_empty()).then_some(token)
}

/// Extractor yielding the caller's claims; rejects with 401. Claims already
/// resolved by the rate-limit middleware are reused.
#[derive(Debug, Clone, Copy)]
pub struct Authenticated(pub Claims);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for Authenticated {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        if let Some(claims) = parts.extensions.get::<Claims>() {
            return Ok(Authenticated(*claims));
        }

        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(bearer_token)
            .ok_or(AppError::Unauthorized)?;

        let claims = state.authenticator.authenticate(token).await.map_err(|err| {
            tracing::debug!(error = %err, "authentication failed");
            AppError::Unauthorized
        })?;

        Ok(Authenticated(claims))
    }
}
