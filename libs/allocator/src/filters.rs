//! Offer and inverse-offer refusal filters.
//!
//! A filter is a time-bound suppression token. It lives in the owning
//! framework's filter map (the only strong reference); the expiry timer
//! holds a weak handle, so removing the filter both cancels the timer
//! (through the drop-guard) and turns any in-flight expiry notification
//! into a no-op.

use std::sync::Arc;
use std::time::Duration;

use strata_resources::Resources;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::warn;

/// Default refusal duration when none (or an invalid one) is supplied.
pub const DEFAULT_REFUSE_SECONDS: f64 = 5.0;

/// Upper bound on refusal durations.
pub const MAX_REFUSE: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Caller-supplied refusal parameters accompanying a declined offer or
/// inverse offer.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct Refusal {
    /// How long to suppress re-offers, in seconds. Values outside
    /// `[0, 365 days]` (or non-finite values) are clamped with a warning.
    pub refuse_seconds: f64,
}

impl Default for Refusal {
    fn default() -> Self {
        Self {
            refuse_seconds: DEFAULT_REFUSE_SECONDS,
        }
    }
}

impl Refusal {
    /// The effective filter duration after clamping. Zero means "install
    /// no filter".
    #[must_use]
    pub fn timeout(&self) -> Duration {
        if !self.refuse_seconds.is_finite() {
            warn!(
                refuse_seconds = self.refuse_seconds,
                "Using the default refusal timeout: input is not a valid duration"
            );
            return Duration::from_secs_f64(DEFAULT_REFUSE_SECONDS);
        }
        if self.refuse_seconds < 0.0 {
            warn!(
                refuse_seconds = self.refuse_seconds,
                "Using the default refusal timeout: input is negative"
            );
            return Duration::from_secs_f64(DEFAULT_REFUSE_SECONDS);
        }
        if self.refuse_seconds > MAX_REFUSE.as_secs_f64() {
            warn!(
                refuse_seconds = self.refuse_seconds,
                "Clamping refusal timeout to 365 days: input is too big"
            );
            return MAX_REFUSE;
        }
        Duration::from_secs_f64(self.refuse_seconds)
    }
}

/// Suppresses re-offering a superset of previously refused resources to a
/// (framework, role, agent) tuple.
#[derive(Debug)]
pub struct RefusedOfferFilter {
    /// The refused resources, with allocation tags stripped.
    resources: Resources,

    /// Cancels the expiry timer when the filter is dropped.
    _guard: DropGuard,
}

impl RefusedOfferFilter {
    /// Creates the filter and the token its expiry timer watches for
    /// cancellation.
    #[must_use]
    pub fn new(resources: Resources) -> (Arc<Self>, CancellationToken) {
        let token = CancellationToken::new();
        let watch = token.clone();
        (
            Arc::new(Self {
                resources,
                _guard: token.drop_guard(),
            }),
            watch,
        )
    }

    /// True when `resources` are covered by the refused set.
    ///
    /// Expiry does not weaken the predicate: a filter applies until it is
    /// removed from the framework's map.
    #[must_use]
    pub fn filter(&self, resources: &Resources) -> bool {
        self.resources.contains(resources)
    }
}

/// Suppresses re-sending inverse offers to a (framework, agent) pair.
/// Maintenance inverse offers are whole-agent, so only the timeout matters.
#[derive(Debug)]
pub struct RefusedInverseOfferFilter {
    expires_at: tokio::time::Instant,
    _guard: DropGuard,
}

impl RefusedInverseOfferFilter {
    #[must_use]
    pub fn new(timeout: Duration) -> (Arc<Self>, CancellationToken) {
        let token = CancellationToken::new();
        let watch = token.clone();
        (
            Arc::new(Self {
                expires_at: tokio::time::Instant::now() + timeout,
                _guard: token.drop_guard(),
            }),
            watch,
        )
    }

    /// True while the expiry is still pending.
    #[must_use]
    pub fn filter(&self) -> bool {
        tokio::time::Instant::now() < self.expires_at
    }
}

/// Spawns the expiry timer for a filter: after `timeout`, `notify` runs
/// unless the watched token was cancelled first (i.e. the filter was
/// dropped).
pub(crate) fn schedule_expiry(
    timeout: Duration,
    cancel: CancellationToken,
    notify: impl FnOnce() + Send + 'static,
) {
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(timeout) => notify(),
        }
    });
}
