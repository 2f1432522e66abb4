//! Current-user identity.
//!
//! The binder never owns the identity. It reads it through an
//! [`IdentityCell`], a watch-backed live cell, so the author filter always
//! compares against the value that is current when a message arrives.

use std::fmt;
use std::sync::Arc;

use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::warn;

/// Opaque user identifier used to address a session on the remote service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    /// Wrap a raw identifier. Blank identifiers are not identities.
    pub fn new(id: impl Into<String>) -> Option<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            None
        } else {
            Some(Self(id))
        }
    }

    /// The raw identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Identity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for Identity {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

/// Synchronous "current identifier or none" accessor.
pub trait IdentitySource: Send + Sync {
    fn current_identity(&self) -> Option<Identity>;
}

/// Live identity cell.
///
/// Writers call [`IdentityCell::set`]; readers either poll
/// [`IdentityCell::current`] or hold a receiver from
/// [`IdentityCell::subscribe`] and are woken only on real value changes.
#[derive(Debug, Clone)]
pub struct IdentityCell {
    tx: Arc<watch::Sender<Option<Identity>>>,
}

impl Default for IdentityCell {
    fn default() -> Self {
        Self::new(None)
    }
}

impl IdentityCell {
    /// Create a cell holding `initial`.
    #[must_use]
    pub fn new(initial: Option<Identity>) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    /// Replace the identity. Returns `true` when the value actually changed.
    pub fn set(&self, identity: Option<Identity>) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == identity {
                false
            } else {
                *current = identity;
                true
            }
        })
    }

    /// Snapshot of the current identity.
    #[must_use]
    pub fn current(&self) -> Option<Identity> {
        self.tx.borrow().clone()
    }

    /// Receiver that observes every change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Option<Identity>> {
        self.tx.subscribe()
    }
}

impl IdentitySource for IdentityCell {
    fn current_identity(&self) -> Option<Identity> {
        self.current()
    }
}

#[derive(Debug, Deserialize)]
struct TokenClaims {
    #[serde(default)]
    sub: Option<String>,
    #[serde(default, rename = "_id")]
    legacy_id: Option<String>,
    #[serde(default, rename = "userId")]
    user_id: Option<String>,
}

impl TokenClaims {
    fn into_identity(self) -> Option<Identity> {
        [self.sub, self.legacy_id, self.user_id]
            .into_iter()
            .flatten()
            .find_map(Identity::new)
    }
}

/// Identity read out of a stored bearer token.
///
/// With a secret the token is verified (HS256 signature and expiry). Without
/// one the claims are read as-is: the token was issued to this client and
/// the server re-validates it anyway.
#[derive(Clone)]
pub struct JwtIdentity {
    token: Option<String>,
    secret: Option<String>,
}

impl fmt::Debug for JwtIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JwtIdentity")
            .field("has_token", &self.token.is_some())
            .field("verifies_signature", &self.secret.is_some())
            .finish()
    }
}

impl JwtIdentity {
    #[must_use]
    pub fn new(token: Option<String>, secret: Option<String>) -> Self {
        Self {
            token: token.filter(|t| !t.trim().is_empty()),
            secret: secret.filter(|s| !s.is_empty()),
        }
    }

    /// The raw token, if any.
    #[must_use]
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    fn decode_claims(&self, token: &str) -> Result<TokenClaims, jsonwebtoken::errors::Error> {
        let (key, validation) = match &self.secret {
            Some(secret) => (
                DecodingKey::from_secret(secret.as_bytes()),
                Validation::new(Algorithm::HS256),
            ),
            None => {
                let mut validation = Validation::default();
                validation.insecure_disable_signature_validation();
                validation.required_spec_claims.clear();
                validation.validate_exp = false;
                (DecodingKey::from_secret(&[]), validation)
            }
        };
        decode::<TokenClaims>(token, &key, &validation).map(|data| data.claims)
    }
}

impl IdentitySource for JwtIdentity {
    fn current_identity(&self) -> Option<Identity> {
        let token = self.token.as_deref()?;
        match self.decode_claims(token) {
            Ok(claims) => claims.into_identity(),
            Err(e) => {
                warn!(name: "identity.token.invalid", error = %e, "Ignoring unreadable token");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{EncodingKey, Header, encode};
    use serde_json::json;

    fn token(claims: &serde_json::Value, secret: &str) -> String {
        encode(
            &Header::default(),
            claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn far_future() -> i64 {
        chrono::Utc::now().timestamp() + 3600
    }

    #[test]
    fn test_blank_identity_rejected() {
        assert!(Identity::new("").is_none());
        assert!(Identity::new("   ").is_none());
        assert_eq!(Identity::new("u1").unwrap().as_str(), "u1");
    }

    #[test]
    fn test_cell_reports_only_real_changes() {
        let cell = IdentityCell::default();
        let mut rx = cell.subscribe();

        assert!(!cell.set(None));
        assert!(!rx.has_changed().unwrap());

        assert!(cell.set(Identity::new("u1")));
        assert!(rx.has_changed().unwrap());
        rx.mark_unchanged();

        assert!(!cell.set(Identity::new("u1")));
        assert!(!rx.has_changed().unwrap());
        assert_eq!(cell.current_identity(), Identity::new("u1"));
    }

    #[test]
    fn test_verified_token() {
        let jwt = token(&json!({ "sub": "u1", "exp": far_future() }), "s3cret");

        let identity = JwtIdentity::new(Some(jwt.clone()), Some("s3cret".into()));
        assert_eq!(identity.current_identity(), Identity::new("u1"));

        let wrong = JwtIdentity::new(Some(jwt), Some("other".into()));
        assert!(wrong.current_identity().is_none());
    }

    #[test]
    fn test_unverified_token_reads_legacy_claim() {
        let jwt = token(&json!({ "_id": "64f0c0ffee" }), "whatever");
        let identity = JwtIdentity::new(Some(jwt), None);
        assert_eq!(identity.current_identity(), Identity::new("64f0c0ffee"));
    }

    #[test]
    fn test_missing_or_garbage_token() {
        assert!(JwtIdentity::new(None, None).current_identity().is_none());
        assert!(
            JwtIdentity::new(Some("not-a-jwt".into()), None)
                .current_identity()
                .is_none()
        );
    }
}
