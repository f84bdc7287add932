//! Session Token Verification
//!
//! Upgrade requests carry an HS256 token minted by the account service.
//! This module only verifies tokens; it never issues them. The decoding key
//! and validation rules are built once into a [`TokenVerifier`] and shared
//! by every handshake.

use std::collections::HashSet;

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::ParticipantId;

/// Token settings, usually read from the environment.
#[derive(Clone, Debug, Default)]
pub struct AuthConfig {
    /// Shared HS256 secret.
    pub secret: Option<String>,
    /// Required `iss` claim, if any.
    pub issuer: Option<String>,
    /// Clock skew tolerated on `exp`, in seconds.
    pub leeway_secs: u64,
    /// Accept expired tokens. Local testing only.
    pub skip_expiry: bool,
}

impl AuthConfig {
    /// `JWT_SECRET`, `AUTH_ISSUER`, `AUTH_LEEWAY_SECS`, `AUTH_SKIP_EXPIRY`.
    pub fn from_env() -> Self {
        let flag = |name: &str| {
            std::env::var(name)
                .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
                .unwrap_or(false)
        };

        Self {
            secret: std::env::var("JWT_SECRET").ok().filter(|s| !s.is_empty()),
            issuer: std::env::var("AUTH_ISSUER").ok().filter(|s| !s.is_empty()),
            leeway_secs: std::env::var("AUTH_LEEWAY_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            skip_expiry: flag("AUTH_SKIP_EXPIRY"),
        }
    }

    /// Config with only a secret set.
    pub fn with_secret(secret: impl Into<String>) -> Self {
        Self {
            secret: Some(secret.into()),
            ..Self::default()
        }
    }
}

/// Claims the hub reads from a session token. Unknown claims are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    /// Account id; becomes the participant id.
    pub user_id: i64,
    /// Account email, informational only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Display name, informational only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Unix seconds. Tokens without one never expire.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<u64>,
    /// Issuer, checked only when `AuthConfig::issuer` is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
}

impl SessionClaims {
    /// Claims for `user_id` expiring at `exp`.
    pub fn new(user_id: i64, exp: Option<u64>) -> Self {
        Self {
            user_id,
            email: None,
            name: None,
            exp,
            iss: None,
        }
    }

    /// Participant the token authenticates.
    pub fn participant_id(&self) -> ParticipantId {
        ParticipantId::new(self.user_id)
    }
}

/// Why a token was refused.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Server has no secret to verify against.
    #[error("no JWT secret configured")]
    NotConfigured,
    /// Not three base64url segments.
    #[error("malformed token")]
    Malformed,
    /// Signed with a different secret.
    #[error("bad signature")]
    BadSignature,
    /// `exp` is in the past.
    #[error("token expired")]
    Expired,
    /// `iss` does not match the configured issuer.
    #[error("wrong issuer")]
    WrongIssuer,
    /// Claims missing `user_id` or of the wrong shape.
    #[error("unusable claims: {0}")]
    Claims(String),
    /// Any other validation failure.
    #[error("token rejected: {0}")]
    Rejected(String),
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        match err.kind() {
            ErrorKind::ExpiredSignature => AuthError::Expired,
            ErrorKind::InvalidSignature => AuthError::BadSignature,
            ErrorKind::InvalidIssuer => AuthError::WrongIssuer,
            ErrorKind::InvalidToken | ErrorKind::Base64(_) | ErrorKind::Utf8(_) => AuthError::Malformed,
            ErrorKind::Json(e) => AuthError::Claims(e.to_string()),
            _ => AuthError::Rejected(err.to_string()),
        }
    }
}

/// Verifies session tokens against one secret.
#[derive(Clone)]
pub struct TokenVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    /// Build a verifier. Fails if no secret is configured.
    pub fn new(config: &AuthConfig) -> Result<Self, AuthError> {
        let secret = config.secret.as_deref().ok_or(AuthError::NotConfigured)?;

        let mut validation = Validation::new(Algorithm::HS256);
        // `exp` is enforced only when present.
        validation.required_spec_claims = HashSet::new();
        validation.validate_exp = !config.skip_expiry;
        validation.leeway = config.leeway_secs;
        if let Some(issuer) = &config.issuer {
            validation.set_issuer(&[issuer]);
        }

        Ok(Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        })
    }

    /// Shorthand for a verifier with only a secret.
    pub fn from_secret(secret: impl Into<String>) -> Result<Self, AuthError> {
        Self::new(&AuthConfig::with_secret(secret))
    }

    /// Decode and check a token.
    pub fn verify(&self, token: &str) -> Result<SessionClaims, AuthError> {
        Ok(decode::<SessionClaims>(token, &self.key, &self.validation)?.claims)
    }

    /// Verify a token and return who it authenticates.
    pub fn authenticate(&self, token: &str) -> Result<ParticipantId, AuthError> {
        self.verify(token).map(|claims| claims.participant_id())
    }
}
