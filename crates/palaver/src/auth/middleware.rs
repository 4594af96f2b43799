//! Token validation and the principal extractor.

use std::sync::Arc;

use axum::{
    extract::{FromRequestParts, Request, State},
    http::{
        header::{AUTHORIZATION, COOKIE},
        request::Parts,
    },
    middleware::Next,
    response::Response,
};
use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Validation, decode, encode};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::config::AuthConfig;

use super::AuthError;

/// Token claims. `sub` is the principal id everything downstream keys on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: i64,
    pub iat: i64,
}

/// Authentication state shared across handlers.
#[derive(Clone)]
pub struct AuthState {
    decoding_key: Arc<DecodingKey>,
    encoding_key: Arc<EncodingKey>,
}

impl AuthState {
    pub fn new(config: &AuthConfig) -> Self {
        let secret = config.jwt_secret.as_bytes();
        Self {
            decoding_key: Arc::new(DecodingKey::from_secret(secret)),
            encoding_key: Arc::new(EncodingKey::from_secret(secret)),
        }
    }

    /// Validate a token and return its claims.
    pub fn validate_token(&self, token: &str) -> Result<Claims, AuthError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;

        let data = decode::<Claims>(token, &self.decoding_key, &validation).map_err(|e| {
            warn!("token validation failed: {e:?}");
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                _ => AuthError::InvalidToken(e.to_string()),
            }
        })?;

        Ok(data.claims)
    }

    /// Issue a token for a principal. The session layer owning credentials
    /// calls this after its own checks; here it also backs the test suite.
    pub fn issue_token(&self, principal: &str, ttl_secs: i64) -> Result<String, AuthError> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: principal.to_string(),
            exp: now + ttl_secs,
            iat: now,
        };
        encode(&jsonwebtoken::Header::default(), &claims, &self.encoding_key)
            .map_err(|e| AuthError::Internal(e.to_string()))
    }
}

/// The authenticated principal, injected by [`auth_middleware`].
#[derive(Debug, Clone)]
pub struct Principal {
    pub id: String,
}

impl<S> FromRequestParts<S> for Principal
where
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Principal>()
            .cloned()
            .ok_or(AuthError::MissingToken)
    }
}

/// Validate the request's token and inject [`Principal`].
///
/// Token sources in priority order: `Authorization: Bearer`, the
/// `auth_token` cookie, the `token` query parameter.
pub async fn auth_middleware(
    State(auth): State<AuthState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let token = token_from_request(&request).ok_or(AuthError::MissingToken)?;
    let claims = auth.validate_token(&token)?;
    request.extensions_mut().insert(Principal { id: claims.sub });
    Ok(next.run(request).await)
}

fn token_from_request(request: &Request) -> Option<String> {
    if let Some(header) = request.headers().get(AUTHORIZATION)
        && let Ok(value) = header.to_str()
        && let Some(token) = bearer_token(value)
    {
        return Some(token.to_string());
    }

    if let Some(header) = request.headers().get(COOKIE)
        && let Ok(value) = header.to_str()
        && let Some(token) = cookie_value(value, "auth_token")
    {
        return Some(token.to_string());
    }

    query_value(request.uri().query()?, "token").map(str::to_string)
}

fn bearer_token(header_value: &str) -> Option<&str> {
    let mut parts = header_value.split_whitespace();
    let scheme = parts.next()?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = parts.next().filter(|t| !t.is_empty())?;
    if parts.next().is_some() {
        return None;
    }
    Some(token)
}

fn cookie_value<'a>(cookie_header: &'a str, name: &str) -> Option<&'a str> {
    cookie_header.split(';').map(str::trim).find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key.trim() == name).then_some(value.trim())
    })
}

fn query_value<'a>(query: &'a str, name: &str) -> Option<&'a str> {
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == name && !value.is_empty()).then_some(value)
    })
}
