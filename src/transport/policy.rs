use std::time::Duration;

/// What the transport does with a response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Return the response to the caller.
    Success,
    /// Back off and send the request again, within the attempt budget.
    Retry,
    /// Surface the response as [`TransportError::Request`](super::TransportError::Request).
    FailFast,
    /// Surface [`TransportError::Reauthenticate`](super::TransportError::Reauthenticate)
    /// so the caller can refresh its credential.
    Reauthenticate,
}

/// Maps a status code to a [`Disposition`].
pub type StatusClassifier = fn(u16) -> Disposition;

/// Default classifier.
///
/// - 2xx: success
/// - 401: re-authenticate
/// - 408, 429, 5xx: retry
/// - everything else (400, 403, 404, 413, 3xx): fail fast
pub const fn classify_status(status: u16) -> Disposition {
    match status {
        200..=299 => Disposition::Success,
        401 => Disposition::Reauthenticate,
        408 | 429 | 500..=599 => Disposition::Retry,
        _ => Disposition::FailFast,
    }
}

/// Retry and backoff parameters for one logical operation.
///
/// Delay before retry `n` (1-based) is
/// `min(max_delay, base_delay * multiplier^(n-1))` plus a uniform jitter of up
/// to `jitter` times that value, capped again at `max_delay`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    multiplier: f64,
    max_delay: Duration,
    jitter: f64,
    attempt_timeout: Duration,
    overall_timeout: Option<Duration>,
    classifier: StatusClassifier,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(200),
            multiplier: 2.0,
            max_delay: Duration::from_secs(10),
            jitter: 0.1,
            attempt_timeout: Duration::from_secs(30),
            overall_timeout: None,
            classifier: classify_status,
        }
    }
}

impl RetryPolicy {
    /// Sets the total attempt budget, first attempt included. Clamped to at least 1.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Sets the delay before the first retry.
    #[must_use]
    pub const fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Sets the growth factor between consecutive delays. Values below 1 are treated as 1.
    #[must_use]
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = if multiplier.is_finite() {
            multiplier.max(1.0)
        } else {
            1.0
        };
        self
    }

    /// Sets the ceiling for any single delay.
    #[must_use]
    pub const fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Sets the jitter fraction, clamped to `0.0..=1.0`.
    #[must_use]
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = if jitter.is_finite() {
            jitter.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self
    }

    /// Sets the timeout applied to each individual attempt.
    #[must_use]
    pub const fn with_attempt_timeout(mut self, attempt_timeout: Duration) -> Self {
        self.attempt_timeout = attempt_timeout;
        self
    }

    /// Bounds the whole operation, sleeps included. No retry starts past this budget.
    #[must_use]
    pub const fn with_overall_timeout(mut self, overall_timeout: Duration) -> Self {
        self.overall_timeout = Some(overall_timeout);
        self
    }

    /// Replaces the status classifier.
    #[must_use]
    pub const fn with_classifier(mut self, classifier: StatusClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Returns the attempt budget.
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Returns the per-attempt timeout.
    pub const fn attempt_timeout(&self) -> Duration {
        self.attempt_timeout
    }

    /// Returns the overall budget, if any.
    pub const fn overall_timeout(&self) -> Option<Duration> {
        self.overall_timeout
    }

    /// Classifies `status`.
    pub fn classify(&self, status: u16) -> Disposition {
        (self.classifier)(status)
    }

    /// Returns the `(min, max)` delay before retry `retry` (1-based).
    pub fn delay_bounds(&self, retry: u32) -> (Duration, Duration) {
        let base = self.undithered(retry);
        let max = base.saturating_add(scale(base, self.jitter)).min(self.max_delay);
        (base, max)
    }

    /// Returns a jittered delay before retry `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let (min, max) = self.delay_bounds(retry);
        let spread = max.saturating_sub(min);
        if spread.is_zero() {
            return min;
        }
        min + scale(spread, fastrand::f64())
    }

    fn undithered(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
        scale(self.base_delay, self.multiplier.powi(exponent)).min(self.max_delay)
    }
}

// Multiplies at nanosecond precision, rounding to the nearest nanosecond and
// saturating on overflow.
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn scale(d: Duration, factor: f64) -> Duration {
    let nanos = (d.as_nanos() as f64 * factor).round();
    if nanos.is_nan() || nanos <= 0.0 {
        Duration::ZERO
    } else if nanos >= u64::MAX as f64 {
        Duration::from_nanos(u64::MAX)
    } else {
        Duration::from_nanos(nanos as u64)
    }
}
