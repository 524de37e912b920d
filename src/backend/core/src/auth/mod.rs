//! Caller authentication.
//!
//! Identity verification is an external concern; the core only needs
//! `verify(token) -> principal`. [`TokenVerifier`] is that seam: the server
//! installs a JWT-backed verifier, tests install a static one.

use axum::http::{header, HeaderMap};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::error::{CausewayError, ErrorCode};

/// Authentication errors.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Missing authentication credentials")]
    MissingCredentials,

    #[error("Invalid authentication token")]
    InvalidToken,

    #[error("Token has expired")]
    TokenExpired,
}

impl From<AuthError> for CausewayError {
    fn from(err: AuthError) -> Self {
        let code = match err {
            AuthError::MissingCredentials => ErrorCode::Unauthenticated,
            AuthError::InvalidToken => ErrorCode::InvalidToken,
            AuthError::TokenExpired => ErrorCode::TokenExpired,
        };
        CausewayError::new(code, err.to_string())
    }
}

/// An authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    /// Stable caller identifier (token subject)
    pub id: String,
    /// Caller email, when the identity provider supplies one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl Principal {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            email: None,
        }
    }
}

/// Verifies bearer tokens and resolves them to principals.
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<Principal, AuthError>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// JWT Verifier
// ═══════════════════════════════════════════════════════════════════════════════

/// Claims expected in a bearer token.
#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    #[serde(default)]
    email: Option<String>,
    exp: i64,
}

/// HS256 JWT verification against a shared secret.
pub struct JwtVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }
}

impl TokenVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> Result<Principal, AuthError> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation).map_err(|e| {
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                _ => AuthError::InvalidToken,
            }
        })?;

        Ok(Principal {
            id: data.claims.sub,
            email: data.claims.email,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Static Verifier
// ═══════════════════════════════════════════════════════════════════════════════

/// Fixed token-to-principal table. Used by tests and local development.
#[derive(Default)]
pub struct StaticTokenVerifier {
    tokens: HashMap<String, Principal>,
}

impl StaticTokenVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, principal: Principal) -> Self {
        self.tokens.insert(token.into(), principal);
        self
    }
}

impl TokenVerifier for StaticTokenVerifier {
    fn verify(&self, token: &str) -> Result<Principal, AuthError> {
        self.tokens
            .get(token)
            .cloned()
            .ok_or(AuthError::InvalidToken)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Header Extraction
// ═══════════════════════════════════════════════════════════════════════════════

/// Pull the bearer token out of an `Authorization` header and verify it.
pub fn authenticate(
    verifier: &dyn TokenVerifier,
    headers: &HeaderMap,
) -> Result<Principal, AuthError> {
    let header = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(AuthError::MissingCredentials)?;

    let token = header
        .strip_prefix("Bearer ")
        .ok_or(AuthError::MissingCredentials)?;

    verifier.verify(token.trim())
}
