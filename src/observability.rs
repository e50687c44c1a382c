//! Crate-internal logging macros.
//!
//! Backend selection, in order:
//! 1) `tracing` feature => `tracing::*` events
//! 2) `logging` feature => `log::*` records
//! 3) neither => no-op; format args are still type-checked
//!
//! Callers never pass secrets (assertions, scoped tokens, key material) to
//! these macros. Use [`token_prefix`] when a continuation token has to appear
//! in a message.

#[allow(unused_macros)]
macro_rules! log_debug {
    ($($arg:tt)*) => {{
        #[cfg(feature = "tracing")]
        { tracing::debug!($($arg)*); }

        #[cfg(all(not(feature = "tracing"), feature = "logging"))]
        { log::debug!($($arg)*); }

        #[cfg(all(not(feature = "tracing"), not(feature = "logging")))]
        { let _ = format_args!($($arg)*); }
    }};
}

#[allow(unused_macros)]
macro_rules! log_info {
    ($($arg:tt)*) => {{
        #[cfg(feature = "tracing")]
        { tracing::info!($($arg)*); }

        #[cfg(all(not(feature = "tracing"), feature = "logging"))]
        { log::info!($($arg)*); }

        #[cfg(all(not(feature = "tracing"), not(feature = "logging")))]
        { let _ = format_args!($($arg)*); }
    }};
}

#[allow(unused_macros)]
macro_rules! log_warn {
    ($($arg:tt)*) => {{
        #[cfg(feature = "tracing")]
        { tracing::warn!($($arg)*); }

        #[cfg(all(not(feature = "tracing"), feature = "logging"))]
        { log::warn!($($arg)*); }

        #[cfg(all(not(feature = "tracing"), not(feature = "logging")))]
        { let _ = format_args!($($arg)*); }
    }};
}

#[allow(unused_macros)]
macro_rules! log_error {
    ($($arg:tt)*) => {{
        #[cfg(feature = "tracing")]
        { tracing::error!($($arg)*); }

        #[cfg(all(not(feature = "tracing"), feature = "logging"))]
        { log::error!($($arg)*); }

        #[cfg(all(not(feature = "tracing"), not(feature = "logging")))]
        { let _ = format_args!($($arg)*); }
    }};
}

pub(crate) use log_debug;
pub(crate) use log_error;
pub(crate) use log_info;
pub(crate) use log_warn;

/// Number of leading characters of an opaque token that may appear in logs.
const TOKEN_PREFIX_LEN: usize = 12;

/// Returns a short, log-safe prefix of an opaque continuation token.
pub(crate) fn token_prefix(token: &str) -> &str {
    match token.char_indices().nth(TOKEN_PREFIX_LEN) {
        Some((idx, _)) => &token[..idx],
        None => token,
    }
}

/// Tracks consecutive occurrences of the same failure to keep retry logs quiet.
///
/// The first `max_consecutive` repeats of a key are reported as loud (WARN);
/// after that the caller should downgrade to DEBUG. A different key starts
/// counting again.
#[derive(Debug)]
pub(crate) struct ErrorTracker<K> {
    last: Option<K>,
    consecutive: u32,
    max_consecutive: u32,
}

impl<K: Copy + PartialEq> ErrorTracker<K> {
    pub(crate) const fn new(max_consecutive: u32) -> Self {
        Self {
            last: None,
            consecutive: 0,
            max_consecutive,
        }
    }

    /// Records an occurrence of `key` and returns `true` if it should be logged loudly.
    pub(crate) fn record(&mut self, key: K) -> bool {
        let loud = self.last != Some(key) || self.consecutive < self.max_consecutive;

        if self.last == Some(key) {
            self.consecutive = self.consecutive.saturating_add(1);
        } else {
            self.consecutive = 1;
            self.last = Some(key);
        }

        loud
    }

    pub(crate) const fn consecutive(&self) -> u32 {
        self.consecutive
    }
}
