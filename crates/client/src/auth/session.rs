//! Authentication session data and reply parsing.

use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tether_core::Timestamp;

/// Permission that grants everything.
pub const WILDCARD_PERMISSION: &str = "*";

/// Result of a successful authentication handshake.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuthSession {
    pub token: String,
    /// Identity returned by the server, verbatim.
    pub user: Option<Value>,
    pub permissions: Vec<String>,
    pub authenticated_at: Timestamp,
    /// Taken from the token's `exp` claim when the token is a JWT.
    pub expires_at: Option<Timestamp>,
}

impl AuthSession {
    pub(crate) fn from_reply(token: String, reply: AuthReply) -> Self {
        let expires_at = jwt_expiry(&token);
        Self {
            token,
            user: reply.user,
            permissions: reply.permissions,
            authenticated_at: Utc::now(),
            expires_at,
        }
    }

    /// Exact permission or the wildcard.
    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions
            .iter()
            .any(|p| p == permission || p == WILDCARD_PERMISSION)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

/// Payload of the `ack` answering an auth request.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct AuthReply {
    pub success: bool,
    #[serde(default)]
    pub user: Option<Value>,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default, alias = "error")]
    pub message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExpiryClaim {
    exp: Option<i64>,
}

/// Read the `exp` claim of a JWT without verifying its signature. Returns
/// `None` for opaque tokens or tokens without `exp`.
pub(crate) fn jwt_expiry(token: &str) -> Option<Timestamp> {
    let mut validation = Validation::default();
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    let data = decode::<ExpiryClaim>(token, &DecodingKey::from_secret(&[]), &validation).ok()?;
    let exp = data.claims.exp?;
    Utc.timestamp_opt(exp, 0).single()
}
