//! Shared per-identity assertion cache.
//!
//! [`TokenCache`] hands every session the same current [`Assertion`](super::Assertion)
//! and mints a replacement once, however many callers ask, when the current
//! one enters its refresh margin or is rejected.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use time::OffsetDateTime;

use super::identity::Identity;
use super::issuer::{Assertion, TokenError, TokenIssuer};
use super::key::SigningKey;
use crate::metrics::{MetricsErrorKind, MetricsRecorder};
use crate::prelude::{debug, warn};

/// Owns the current [`Assertion`] for one [`Identity`] and replaces it when stale.
///
/// Reads of a still-fresh assertion are lock-free (`ArcSwap` load). Minting is
/// single-flight: callers that find the cached assertion stale serialize on a
/// mutex and re-check after acquiring it, so concurrent callers never mint
/// more than one replacement.
///
/// Share it behind an `Arc` across every session of the identity.
pub struct TokenCache {
    identity: Identity,
    key: Arc<SigningKey>,
    issuer: TokenIssuer,
    refresh_margin: Duration,

    // Atomically replaced, last minted assertion.
    current: ArcSwapOption<Assertion>,
    mint_lock: Mutex<()>,
    mints: AtomicU64,
    metrics: Option<Arc<dyn MetricsRecorder>>,
}

impl TokenCache {
    /// Creates an empty cache. The first [`TokenCache::get`] mints.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::InvalidRefreshMargin`] if `refresh_margin` is not
    /// strictly shorter than the issuer's lifetime (every call would mint).
    pub fn new(
        identity: Identity,
        key: Arc<SigningKey>,
        issuer: TokenIssuer,
        refresh_margin: Duration,
    ) -> Result<Self, TokenError> {
        if refresh_margin >= issuer.lifetime() {
            return Err(TokenError::InvalidRefreshMargin {
                margin: refresh_margin,
                lifetime: issuer.lifetime(),
            });
        }
        Ok(Self {
            identity,
            key,
            issuer,
            refresh_margin,
            current: ArcSwapOption::empty(),
            mint_lock: Mutex::new(()),
            mints: AtomicU64::new(0),
            metrics: None,
        })
    }

    /// Attaches a metrics recorder.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Returns the identity this cache mints for.
    pub const fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Returns an assertion with at least the refresh margin of validity left at `now`.
    ///
    /// The cached assertion is returned unchanged while
    /// `expires_at - now >= refresh_margin`; otherwise exactly one caller mints a
    /// replacement and the others reuse it.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Signing`] if minting fails.
    pub fn get(&self, now: OffsetDateTime) -> Result<Arc<Assertion>, TokenError> {
        if let Some(assertion) = self.fresh(now) {
            return Ok(assertion);
        }

        let _guard = self
            .mint_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        // Another caller may have minted while we waited.
        if let Some(assertion) = self.fresh(now) {
            return Ok(assertion);
        }

        let minted = self
            .issuer
            .mint(&self.identity, &self.key, now)
            .map_err(|e| {
                warn!(
                    "Failed to mint assertion: identity={}, error={}",
                    self.identity, e
                );
                if let Some(m) = self.metrics.as_deref() {
                    m.record_error(MetricsErrorKind::TokenMint);
                }
                e
            })?;
        let minted = Arc::new(minted);

        self.current.store(Some(Arc::clone(&minted)));
        let count = self.mints.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(m) = self.metrics.as_deref() {
            m.record_token_minted();
        }
        debug!(
            "Minted assertion: identity={}, expires_at={}, mint_count={}",
            self.identity,
            minted.expires_at(),
            count
        );

        Ok(minted)
    }

    /// Returns an assertion valid at the current wall-clock time.
    ///
    /// # Errors
    ///
    /// See [`TokenCache::get`].
    pub fn get_current(&self) -> Result<Arc<Assertion>, TokenError> {
        self.get(OffsetDateTime::now_utc())
    }

    /// Drops `rejected` from the cache so the next [`TokenCache::get`] mints.
    ///
    /// Only clears the cache if `rejected` is still the cached assertion, so a
    /// replacement minted by a concurrent caller is kept.
    pub fn invalidate(&self, rejected: &Assertion) {
        let _guard = self
            .mint_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let cached = self.current.load();
        if cached.as_deref() == Some(rejected) {
            self.current.store(None);
            debug!("Invalidated rejected assertion: identity={}", self.identity);
        }
    }

    /// Returns how many assertions this cache has minted.
    pub fn mint_count(&self) -> u64 {
        self.mints.load(Ordering::Relaxed)
    }

    fn fresh(&self, now: OffsetDateTime) -> Option<Arc<Assertion>> {
        self.current
            .load_full()
            .filter(|a| a.is_fresh(now, self.refresh_margin))
    }
}

impl Debug for TokenCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCache")
            .field("identity", &self.identity)
            .field("key", &self.key)
            .field("issuer", &self.issuer)
            .field("refresh_margin", &self.refresh_margin)
            .field("current", &self.current.load().as_deref())
            .field("mint_lock", &"<Mutex<()>>")
            .field("mints", &self.mint_count())
            .field(
                "metrics",
                &self.metrics.as_ref().map(|_| "<MetricsRecorder>"),
            )
            .finish()
    }
}
