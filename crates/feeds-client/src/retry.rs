//! Reconnect policies for resumable subscriptions.
//!
//! A strategy is stateful and belongs to one logical subscription: it is
//! built fresh by [`RetryPolicy::strategy`] when `subscribe()` starts and
//! consulted after every failed attempt.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

pub(crate) const DEFAULT_MAX_ATTEMPTS: u32 = 12;
pub(crate) const DEFAULT_MAX_DELAY_UNITS: u64 = 80;
pub(crate) const DEFAULT_DELAY_UNIT: Duration = Duration::from_secs(1);

/// What to do after a failed attempt.
#[derive(Debug)]
pub enum RetryDecision {
    /// Reconnect once the delay has passed.
    Scheduled(ScheduledRetry),
    /// Give up; the reason is reported with the final error.
    Terminate(String),
}

/// A pending reconnect. Cancelling the owning strategy aborts the wait.
#[derive(Debug)]
pub struct ScheduledRetry {
    delay: Duration,
    cancel: CancellationToken,
}

impl ScheduledRetry {
    pub fn new(delay: Duration, cancel: CancellationToken) -> Self {
        Self { delay, cancel }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Sleep for the delay. Returns `false` if cancelled first.
    pub async fn wait(self) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.delay) => true,
            _ = self.cancel.cancelled() => false,
        }
    }
}

pub trait RetryStrategy: Send {
    /// Called after a failed attempt.
    fn try_again(&mut self) -> RetryDecision;

    /// Abort any pending scheduled retry so it never fires.
    fn cancel(&mut self);

    /// Called every time a stream opens successfully.
    fn on_open(&mut self) {}
}

/// Parameters of [`DefaultRetryStrategy`].
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Failed attempts tolerated before terminating.
    pub max_attempts: u32,
    /// Cap on the squared attempt number, in units.
    pub max_delay_units: u64,
    pub unit: Duration,
    /// Restart the attempt count whenever a stream opens.
    pub reset_on_open: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            max_delay_units: DEFAULT_MAX_DELAY_UNITS,
            unit: DEFAULT_DELAY_UNIT,
            reset_on_open: false,
        }
    }
}

/// Quadratic backoff: attempt `k` waits `min(cap, k²)` units.
#[derive(Debug)]
pub struct DefaultRetryStrategy {
    config: BackoffConfig,
    attempts: u32,
    cancel: CancellationToken,
}

impl DefaultRetryStrategy {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            attempts: 0,
            cancel: CancellationToken::new(),
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let units = u64::from(attempt)
            .saturating_mul(u64::from(attempt))
            .min(self.config.max_delay_units);
        self.config
            .unit
            .saturating_mul(u32::try_from(units).unwrap_or(u32::MAX))
    }
}

impl RetryStrategy for DefaultRetryStrategy {
    fn try_again(&mut self) -> RetryDecision {
        if self.attempts >= self.config.max_attempts {
            return RetryDecision::Terminate("too many reconnects".into());
        }
        self.attempts += 1;
        RetryDecision::Scheduled(ScheduledRetry::new(
            self.delay_for(self.attempts),
            self.cancel.child_token(),
        ))
    }

    fn cancel(&mut self) {
        self.cancel.cancel();
        // Retries scheduled after a cancel start from a fresh token.
        self.cancel = CancellationToken::new();
    }

    fn on_open(&mut self) {
        if self.config.reset_on_open {
            self.attempts = 0;
        }
    }
}

/// Terminates on the first failure.
#[derive(Debug, Default)]
pub struct NoRetryStrategy;

impl RetryStrategy for NoRetryStrategy {
    fn try_again(&mut self) -> RetryDecision {
        RetryDecision::Terminate("retrying disabled".into())
    }

    fn cancel(&mut self) {}
}

type StrategyFactory = Arc<dyn Fn() -> Box<dyn RetryStrategy> + Send + Sync>;

/// Which strategy a subscription builds for itself.
#[derive(Clone)]
pub enum RetryPolicy {
    Default(BackoffConfig),
    Disabled,
    Custom(StrategyFactory),
}

impl RetryPolicy {
    pub fn custom(factory: impl Fn() -> Box<dyn RetryStrategy> + Send + Sync + 'static) -> Self {
        Self::Custom(Arc::new(factory))
    }

    /// A fresh strategy for one logical subscription.
    pub fn strategy(&self) -> Box<dyn RetryStrategy> {
        match self {
            Self::Default(config) => Box::new(DefaultRetryStrategy::new(config.clone())),
            Self::Disabled => Box::new(NoRetryStrategy),
            Self::Custom(factory) => factory(),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::Default(BackoffConfig::default())
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default(config) => f.debug_tuple("Default").field(config).finish(),
            Self::Disabled => f.write_str("Disabled"),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}
