// Order persistence seam: conditional status writes only

use crate::core::errors::ReconcileError;
use crate::core::models::OrderStatus;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Trait for order store operations.
///
/// Both methods must be single atomic statements at the storage layer. A
/// return of `0` means the predicate did not hold and is not an error.
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Set `status = to` on `order_id` only if its current status is `from`.
    /// Returns rows affected.
    async fn update_status_if(
        &self,
        order_id: u64,
        from: OrderStatus,
        to: OrderStatus,
    ) -> Result<u64, ReconcileError>;

    /// Move every pending order with `expires_at <= now` to expired.
    /// Returns rows affected.
    async fn expire_overdue(&self, now: DateTime<Utc>) -> Result<u64, ReconcileError>;
}
