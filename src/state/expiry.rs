// Order expiry reconciliation - keyspace events and the compensating sweep

use crate::core::errors::ReconcileError;
use crate::core::models::OrderStatus;
use crate::state::order_store::OrderStore;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Namespace of the per-order TTL keys set by the payment subsystem
pub const EXPIRE_KEY_PREFIX: &str = "payment:order:expire:";

/// Key the payment subsystem sets (with a TTL) for `order_id`
pub fn expiry_key(order_id: u64) -> String {
    format!("{}{}", EXPIRE_KEY_PREFIX, order_id)
}

/// Classification of a raw expired-key payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpiryKey {
    /// Recognised order key
    Order(u64),
    /// Key from another namespace sharing the channel
    Foreign,
    /// In our namespace but the suffix is not an unsigned integer
    Malformed(String),
}

/// Classify a raw key without touching any storage.
pub fn parse_expiry_key(raw_key: &str) -> ExpiryKey {
    let Some(suffix) = raw_key.strip_prefix(EXPIRE_KEY_PREFIX) else {
        return ExpiryKey::Foreign;
    };
    match suffix.parse::<u64>() {
        Ok(order_id) => ExpiryKey::Order(order_id),
        Err(e) => ExpiryKey::Malformed(e.to_string()),
    }
}

/// What handling one event did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpiryOutcome {
    Ignored,
    Malformed,
    Expired(u64),
    /// Zero rows affected: paid, failed or already expired by an earlier delivery
    AlreadyFinalized(u64),
}

/// Transitions stale pending orders to expired without ever overwriting a
/// status reached by another writer.
pub struct ExpiryReconciler {
    orders: Arc<dyn OrderStore>,
}

impl ExpiryReconciler {
    pub fn new(orders: Arc<dyn OrderStore>) -> Self {
        Self { orders }
    }

    /// Handle one expired-key notification.
    ///
    /// Foreign and malformed keys never reach the store and are not errors.
    pub async fn on_expiry_event(&self, raw_key: &str) -> Result<ExpiryOutcome, ReconcileError> {
        let order_id = match parse_expiry_key(raw_key) {
            ExpiryKey::Order(order_id) => order_id,
            ExpiryKey::Foreign => return Ok(ExpiryOutcome::Ignored),
            ExpiryKey::Malformed(reason) => {
                error!(key = %raw_key, error = %reason, "Failed to parse order id from expired key");
                return Ok(ExpiryOutcome::Malformed);
            }
        };

        let affected = self
            .orders
            .update_status_if(order_id, OrderStatus::Pending, OrderStatus::Expired)
            .await
            .map_err(|e| {
                error!(order_id, error = %e, "Failed to mark order expired");
                e
            })?;

        if affected > 0 {
            info!(order_id, "Order expired");
            Ok(ExpiryOutcome::Expired(order_id))
        } else {
            debug!(order_id, "Order no longer pending, expiry skipped");
            Ok(ExpiryOutcome::AlreadyFinalized(order_id))
        }
    }

    /// Expire every pending order past its deadline
    pub async fn sweep_expired(&self) -> Result<u64, ReconcileError> {
        self.sweep_expired_at(Utc::now()).await
    }

    pub async fn sweep_expired_at(&self, now: DateTime<Utc>) -> Result<u64, ReconcileError> {
        let count = self.orders.expire_overdue(now).await?;
        if count > 0 {
            info!(count, "Sweep expired overdue pending orders");
        } else {
            debug!("Sweep found no overdue pending orders");
        }
        Ok(count)
    }
}
