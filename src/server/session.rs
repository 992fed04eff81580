//! Request identity.
//!
//! The authentication provider issues bearer tokens; we only resolve them.
//! Browsers cannot set headers on a WebSocket upgrade, so the token may also
//! arrive as the `access_token` query parameter.

use axum::extract::{FromRequestParts, Query};
use axum::http::{header, request::Parts};
use chrono::Utc;
use serde::Deserialize;
use subtle::ConstantTimeEq;
use tracing::debug;

use super::error::ApiError;
use super::AppState;
use crate::db;

/// A verified user identity.
#[derive(Debug, Clone)]
pub struct Session {
    pub user_id: String,
}

/// Proof that the caller is the external timer allowed to run sweeps.
#[derive(Debug, Clone, Copy)]
pub struct CronCaller;

fn token_from_headers(parts: &Parts) -> Option<String> {
    let value = parts.headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then(|| token.to_string())
}

#[derive(Debug, Deserialize)]
struct AccessTokenQuery {
    access_token: Option<String>,
}

fn token_from_query(parts: &Parts) -> Option<String> {
    let Query(query) = Query::<AccessTokenQuery>::try_from_uri(&parts.uri).ok()?;
    query.access_token.filter(|t| !t.is_empty())
}

fn secret_matches(presented: &str, expected: &str) -> bool {
    presented.as_bytes().ct_eq(expected.as_bytes()).into()
}

pub fn bearer_token(parts: &Parts) -> Option<String> {
    token_from_headers(parts).or_else(|| token_from_query(parts))
}

impl FromRequestParts<AppState> for Session {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let Some(token) = bearer_token(parts) else {
            debug!("no session token in request");
            return Err(ApiError::Unauthorized);
        };
        match db::resolve_session(&state.pool, &token, Utc::now()).await? {
            Some(user_id) => Ok(Session { user_id }),
            None => {
                debug!("unknown or expired session token");
                Err(ApiError::Unauthorized)
            }
        }
    }
}

impl FromRequestParts<AppState> for CronCaller {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        match token_from_headers(parts) {
            Some(token) if secret_matches(&token, &state.cron_secret) => Ok(CronCaller),
            _ => Err(ApiError::Unauthorized),
        }
    }
}
