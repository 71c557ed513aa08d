// Background tasks feeding the expiry reconciler: notification consumer and periodic sweep

use crate::core::errors::ReconcileError;
use crate::state::expiry::ExpiryReconciler;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Stream of expired key names. Items may be receive errors; the end of the
/// stream means the subscription was lost.
pub type KeyStream = BoxStream<'static, Result<String, ReconcileError>>;

/// Best-effort source of expired-key notifications (at-most-once delivery)
#[async_trait]
pub trait NotificationSource: Send + Sync {
    async fn subscribe(&self, pattern: &str) -> Result<KeyStream, ReconcileError>;
}

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Default interval between compensating sweeps
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// Long-lived consumer of expiry notifications.
///
/// Events are handled one at a time in arrival order. The loop only exits on
/// cancellation; lost subscriptions are re-established with backoff.
pub struct ExpiryListener {
    source: Arc<dyn NotificationSource>,
    reconciler: Arc<ExpiryReconciler>,
    pattern: String,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl ExpiryListener {
    pub fn new(
        source: Arc<dyn NotificationSource>,
        reconciler: Arc<ExpiryReconciler>,
        pattern: impl Into<String>,
    ) -> Self {
        Self {
            source,
            reconciler,
            pattern: pattern.into(),
            initial_backoff: INITIAL_BACKOFF,
            max_backoff: MAX_BACKOFF,
        }
    }

    /// Override resubscribe backoff bounds
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max.max(initial);
        self
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!(pattern = %self.pattern, "Expiry listener started");
        let mut backoff = self.initial_backoff;

        loop {
            let subscribed = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.source.subscribe(&self.pattern) => result,
            };

            match subscribed {
                Ok(stream) => {
                    backoff = self.initial_backoff;
                    if self.consume(stream, &cancel).await {
                        break;
                    }
                    warn!(pattern = %self.pattern, "Notification stream ended, resubscribing");
                }
                Err(e) => {
                    error!(error = %e, pattern = %self.pattern, "Failed to subscribe to expiry notifications");
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(self.max_backoff);
        }

        info!("Expiry listener stopped");
    }

    /// Drain one subscription. Returns `true` when stopped by cancellation.
    async fn consume(&self, mut stream: KeyStream, cancel: &CancellationToken) -> bool {
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return true,
                next = stream.next() => next,
            };

            match next {
                Some(Ok(key)) => {
                    if let Err(e) = self.reconciler.on_expiry_event(&key).await {
                        error!(key = %key, error = %e, "Failed to handle expired key");
                    }
                }
                Some(Err(e)) => {
                    error!(error = %e, "Failed to receive expiry notification");
                }
                None => return false,
            }
        }
    }
}

/// Periodic compensating sweep. The first run happens immediately, which
/// covers notifications missed while the service was down.
pub struct ExpirySweeper {
    reconciler: Arc<ExpiryReconciler>,
    interval: Duration,
}

impl ExpirySweeper {
    /// A zero `interval` falls back to [`DEFAULT_SWEEP_INTERVAL`].
    pub fn new(reconciler: Arc<ExpiryReconciler>, interval: Duration) -> Self {
        let interval = if interval.is_zero() {
            warn!(
                fallback_secs = DEFAULT_SWEEP_INTERVAL.as_secs(),
                "Zero sweep interval, using default"
            );
            DEFAULT_SWEEP_INTERVAL
        } else {
            interval
        };
        Self {
            reconciler,
            interval,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match self.reconciler.sweep_expired().await {
                        Ok(count) => debug!(count, "Expiry sweep finished"),
                        Err(e) => warn!(error = %e, "Expiry sweep failed"),
                    }
                }
            }
        }

        info!("Expiry sweeper stopped");
    }
}

/// Start the sweeper and the notification listener for `reconciler`.
///
/// The sweeper is spawned first so overdue orders are reconciled even when
/// the subscription cannot be established.
pub fn spawn_expiry_tasks(
    reconciler: Arc<ExpiryReconciler>,
    source: Arc<dyn NotificationSource>,
    pattern: impl Into<String>,
    sweep_interval: Duration,
    cancel: &CancellationToken,
) -> Vec<JoinHandle<()>> {
    vec![
        ExpirySweeper::new(reconciler.clone(), sweep_interval).spawn(cancel.clone()),
        ExpiryListener::new(source, reconciler, pattern).spawn(cancel.clone()),
    ]
}
