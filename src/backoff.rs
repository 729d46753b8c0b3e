//! Exponential-backoff loops that drive every reporting duty

use crate::errors::ReporterError;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, Instrument};

/// Wait applied after the first failure of a duty whose base interval is zero.
const MIN_FAILURE_WAIT: Duration = Duration::from_secs(1);

/// Process-wide stop flag. Set once, never reset.
#[derive(Clone, Debug)]
pub struct ShutdownSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn set(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once the signal is set.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|set| *set).await;
    }

    /// Sleep for `duration`, waking early on shutdown. Returns `true` if the signal is set.
    pub async fn sleep(&self, duration: Duration) -> bool {
        if self.is_set() {
            return true;
        }

        tokio::select! {
            _ = self.wait() => true,
            _ = tokio::time::sleep(duration) => self.is_set(),
        }
    }
}

/// Retry state of one duty, owned by the loop driving it
#[derive(Debug, Clone)]
pub struct ReporterState {
    base: Duration,
    ceiling: Duration,
    wait: Duration,
    consecutive_failures: u32,
    last_error: Option<String>,
}

impl ReporterState {
    pub fn new(base: Duration, ceiling: Duration) -> Self {
        Self {
            base,
            ceiling,
            wait: base,
            consecutive_failures: 0,
            last_error: None,
        }
    }

    /// Current wait interval
    pub fn wait_interval(&self) -> Duration {
        self.wait
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Back to the base cadence. Returns the next wait.
    pub fn record_success(&mut self) -> Duration {
        self.wait = self.base;
        self.consecutive_failures = 0;
        self.last_error = None;
        self.wait
    }

    /// Double the wait up to the ceiling. Returns the next wait.
    pub fn record_failure(&mut self, err: &ReporterError) -> Duration {
        let doubled = if self.wait.is_zero() {
            MIN_FAILURE_WAIT
        } else {
            self.wait.saturating_mul(2)
        };
        self.wait = doubled.min(self.ceiling);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_error = Some(err.to_string());
        self.wait
    }
}

/// Runs a unit of work repeatedly until shutdown, backing off on failure
#[derive(Debug)]
pub struct BackoffRunner {
    duty: &'static str,
    state: ReporterState,
    shutdown: ShutdownSignal,
}

impl BackoffRunner {
    pub fn new(duty: &'static str, base: Duration, ceiling: Duration, shutdown: ShutdownSignal) -> Self {
        Self {
            duty,
            state: ReporterState::new(base, ceiling),
            shutdown,
        }
    }

    pub fn duty(&self) -> &'static str {
        self.duty
    }

    /// Drive `work` until the shutdown signal is observed. Errors from `work`
    /// never escape; they only lengthen the next wait.
    pub async fn run<F, Fut>(self, work: F) -> ReporterState
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = crate::Result<()>>,
    {
        let span = info_span!("duty", name = self.duty);
        self.run_loop(work).instrument(span).await
    }

    async fn run_loop<F, Fut>(mut self, mut work: F) -> ReporterState
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = crate::Result<()>>,
    {
        debug!("reporter duty started");

        while !self.shutdown.is_set() {
            let wait = match work().await {
                Ok(()) => {
                    if self.state.consecutive_failures > 0 {
                        info!(
                            failures = self.state.consecutive_failures,
                            "reporter duty recovered"
                        );
                    }
                    self.state.record_success()
                }
                Err(e) => {
                    let wait = self.state.record_failure(&e);
                    if self.state.consecutive_failures == 1 {
                        error!(
                            retryable = e.is_retryable(),
                            "reporter duty failed in pid {}, retry in {:?}: {}",
                            std::process::id(),
                            wait,
                            e
                        );
                    } else {
                        debug!(
                            failures = self.state.consecutive_failures,
                            "reporter duty still failing, retry in {:?}: {}", wait, e
                        );
                    }
                    wait
                }
            };

            if self.shutdown.sleep(wait).await {
                break;
            }
        }

        info!("finished reporter duty");
        self.state
    }
}
