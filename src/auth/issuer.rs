//! RS256 assertion minting.

use std::fmt;
use std::time::Duration;

use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::identity::Identity;
use super::key::SigningKey;
use crate::constants::MAX_ASSERTION_LIFETIME_SECS;

/// Errors that can arise minting an assertion.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TokenError {
    /// The key cannot produce an RS256 signature (wrong size, corrupt material).
    #[error("cannot sign assertion")]
    Signing(#[from] jsonwebtoken::errors::Error),

    /// The configured lifetime is zero or not strictly below the platform ceiling.
    #[error("invalid assertion lifetime: {0:?} (must be > 0 and < {MAX_ASSERTION_LIFETIME_SECS}s)")]
    InvalidLifetime(Duration),

    /// The refresh margin leaves no window in which a cached assertion is reusable.
    #[error("refresh margin {margin:?} must be shorter than assertion lifetime {lifetime:?}")]
    InvalidRefreshMargin {
        /// Configured margin.
        margin: Duration,
        /// Issuer lifetime.
        lifetime: Duration,
    },
}

impl TokenError {
    /// Token errors are configuration problems; none of them heal by retrying.
    pub const fn is_fatal(&self) -> bool {
        true
    }
}

/// Claims carried by every assertion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssertionClaims {
    /// `ACCOUNT.PRINCIPAL.SHA256:<fingerprint>`.
    pub iss: String,
    /// `ACCOUNT.PRINCIPAL`.
    pub sub: String,
    /// Issued-at, seconds since the epoch.
    pub iat: i64,
    /// Expiry, seconds since the epoch.
    pub exp: i64,
    /// Optional audience (the account URL).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
}

/// Signed, time-bounded bearer credential for account-level calls.
///
/// Immutable once minted. The serialized token is zeroized on drop and never
/// printed by `Debug`.
#[derive(Clone, PartialEq, Eq)]
pub struct Assertion {
    token: SecretToken,
    issued_at: OffsetDateTime,
    expires_at: OffsetDateTime,
}

#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
struct SecretToken(String);

impl Assertion {
    /// Returns the serialized JWT to present as `Authorization: Bearer`.
    pub fn bearer(&self) -> &str {
        &self.token.0
    }

    /// Returns when the assertion was minted.
    pub const fn issued_at(&self) -> OffsetDateTime {
        self.issued_at
    }

    /// Returns when the platform stops accepting the assertion.
    pub const fn expires_at(&self) -> OffsetDateTime {
        self.expires_at
    }

    /// Returns `true` if at least `margin` of validity remains at `now`.
    pub fn is_fresh(&self, now: OffsetDateTime, margin: Duration) -> bool {
        self.expires_at - now >= margin
    }
}

impl fmt::Debug for Assertion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Assertion")
            .field("token", &"<redacted>")
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Builds and signs RS256 assertions.
///
/// A pure function of (identity, key, clock): the only state is the fixed
/// lifetime and optional audience.
#[derive(Debug, Clone)]
pub struct TokenIssuer {
    lifetime: Duration,
    audience: Option<String>,
}

impl TokenIssuer {
    /// Creates an issuer minting assertions valid for `lifetime`.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::InvalidLifetime`] unless `0 < lifetime < 60 min`.
    pub fn new(lifetime: Duration) -> Result<Self, TokenError> {
        if lifetime.is_zero() || lifetime >= Duration::from_secs(MAX_ASSERTION_LIFETIME_SECS) {
            return Err(TokenError::InvalidLifetime(lifetime));
        }
        Ok(Self {
            lifetime,
            audience: None,
        })
    }

    /// Adds an `aud` claim to every minted assertion.
    #[must_use]
    pub fn with_audience(mut self, audience: impl Into<String>) -> Self {
        self.audience = Some(audience.into());
        self
    }

    /// Returns the configured lifetime.
    pub const fn lifetime(&self) -> Duration {
        self.lifetime
    }

    /// Mints an assertion for `identity`, signed with `key`, issued at `now`.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Signing`] if the key is unusable for RS256.
    pub fn mint(
        &self,
        identity: &Identity,
        key: &SigningKey,
        now: OffsetDateTime,
    ) -> Result<Assertion, TokenError> {
        let issued_at = now.replace_nanosecond(0).unwrap_or(now);
        let expires_at = issued_at + self.lifetime;
        let qualified = identity.qualified_name();

        let claims = AssertionClaims {
            iss: format!("{qualified}.{}", key.fingerprint()),
            sub: qualified,
            iat: issued_at.unix_timestamp(),
            exp: expires_at.unix_timestamp(),
            aud: self.audience.clone(),
        };

        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(key.fingerprint().to_owned());

        let token = jsonwebtoken::encode(
            &header,
            &claims,
            &EncodingKey::from_rsa_der(key.pkcs1_der()),
        )?;

        Ok(Assertion {
            token: SecretToken(token),
            issued_at,
            expires_at,
        })
    }
}
