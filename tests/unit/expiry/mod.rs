// Unit tests for order expiry reconciliation

use crate::common::MemoryOrderStore;
use chrono::{Duration, Utc};
use credit_reconciler::core::errors::ReconcileError;
use credit_reconciler::core::models::OrderStatus;
use credit_reconciler::state::expiry::{expiry_key, ExpiryOutcome, ExpiryReconciler};
use std::sync::Arc;

fn setup() -> (ExpiryReconciler, Arc<MemoryOrderStore>) {
    let store = Arc::new(MemoryOrderStore::default());
    (ExpiryReconciler::new(store.clone()), store)
}

#[tokio::test]
async fn test_expiry_event_moves_pending_to_expired() {
    let (reconciler, store) = setup();
    store.insert_pending(100, Utc::now());

    let outcome = reconciler.on_expiry_event("payment:order:expire:100").await.unwrap();

    assert_eq!(outcome, ExpiryOutcome::Expired(100));
    assert_eq!(store.status(100), Some(OrderStatus::Expired));
}

#[tokio::test]
async fn test_expiry_after_payment_is_noop() {
    let (reconciler, store) = setup();
    store.insert_pending(100, Utc::now());
    assert!(store.mark_paid(100));

    let outcome = reconciler.on_expiry_event(&expiry_key(100)).await.unwrap();

    assert_eq!(outcome, ExpiryOutcome::AlreadyFinalized(100));
    assert_eq!(store.status(100), Some(OrderStatus::Paid));
}

#[tokio::test]
async fn test_payment_after_expiry_is_rejected() {
    let (reconciler, store) = setup();
    store.insert_pending(100, Utc::now());

    reconciler.on_expiry_event(&expiry_key(100)).await.unwrap();

    assert!(!store.mark_paid(100));
    assert_eq!(store.status(100), Some(OrderStatus::Expired));
}

#[tokio::test]
async fn test_terminal_statuses_never_overwritten() {
    let (reconciler, store) = setup();
    let past = Utc::now() - Duration::minutes(5);
    store.insert(1, OrderStatus::Paid, past);
    store.insert(2, OrderStatus::Failed, past);
    store.insert(3, OrderStatus::Refunded, past);

    for id in 1..=3 {
        let outcome = reconciler.on_expiry_event(&expiry_key(id)).await.unwrap();
        assert_eq!(outcome, ExpiryOutcome::AlreadyFinalized(id));
    }
    assert_eq!(reconciler.sweep_expired().await.unwrap(), 0);

    assert_eq!(store.status(1), Some(OrderStatus::Paid));
    assert_eq!(store.status(2), Some(OrderStatus::Failed));
    assert_eq!(store.status(3), Some(OrderStatus::Refunded));
}

#[tokio::test]
async fn test_duplicate_event_is_idempotent() {
    let (reconciler, store) = setup();
    store.insert_pending(100, Utc::now());

    assert_eq!(
        reconciler.on_expiry_event(&expiry_key(100)).await.unwrap(),
        ExpiryOutcome::Expired(100)
    );
    assert_eq!(
        reconciler.on_expiry_event(&expiry_key(100)).await.unwrap(),
        ExpiryOutcome::AlreadyFinalized(100)
    );
    assert_eq!(store.status(100), Some(OrderStatus::Expired));
}

#[tokio::test]
async fn test_unknown_order_is_not_an_error() {
    let (reconciler, _store) = setup();
    let outcome = reconciler.on_expiry_event(&expiry_key(404)).await.unwrap();
    assert_eq!(outcome, ExpiryOutcome::AlreadyFinalized(404));
}

#[tokio::test]
async fn test_malformed_key_makes_no_storage_call() {
    let (reconciler, store) = setup();

    let outcome = reconciler.on_expiry_event("payment:order:expire:abc").await.unwrap();

    assert_eq!(outcome, ExpiryOutcome::Malformed);
    assert_eq!(store.call_count(), 0);
}

#[tokio::test]
async fn test_foreign_key_ignored() {
    let (reconciler, store) = setup();

    let outcome = reconciler.on_expiry_event("session:42:taints").await.unwrap();

    assert_eq!(outcome, ExpiryOutcome::Ignored);
    assert_eq!(store.call_count(), 0);
}

#[tokio::test]
async fn test_store_failure_propagates() {
    let store = Arc::new(MemoryOrderStore {
        should_fail: true,
        ..Default::default()
    });
    let reconciler = ExpiryReconciler::new(store.clone());

    let result = reconciler.on_expiry_event(&expiry_key(100)).await;
    assert!(matches!(result, Err(ReconcileError::StorageError(_))));
    assert!(reconciler.sweep_expired().await.is_err());
}

#[tokio::test]
async fn test_sweep_recovers_missed_notifications() {
    let (reconciler, store) = setup();
    let now = Utc::now();
    store.insert_pending(1, now - Duration::minutes(10));
    store.insert_pending(2, now - Duration::seconds(1));
    store.insert_pending(3, now + Duration::minutes(10));

    let count = reconciler.sweep_expired_at(now).await.unwrap();

    assert_eq!(count, 2);
    assert_eq!(store.status(1), Some(OrderStatus::Expired));
    assert_eq!(store.status(2), Some(OrderStatus::Expired));
    assert_eq!(store.status(3), Some(OrderStatus::Pending));
}

#[tokio::test]
async fn test_sweep_boundary_is_inclusive() {
    let (reconciler, store) = setup();
    let now = Utc::now();
    store.insert_pending(1, now);

    assert_eq!(reconciler.sweep_expired_at(now).await.unwrap(), 1);
    assert_eq!(store.status(1), Some(OrderStatus::Expired));
}

#[tokio::test]
async fn test_sweep_is_idempotent() {
    let (reconciler, store) = setup();
    let now = Utc::now();
    store.insert_pending(1, now - Duration::minutes(1));

    assert_eq!(reconciler.sweep_expired_at(now).await.unwrap(), 1);
    assert_eq!(reconciler.sweep_expired_at(now).await.unwrap(), 0);
}

fn assert_single_winner(store: &MemoryOrderStore, outcome: ExpiryOutcome, paid: bool, id: u64) {
    match outcome {
        ExpiryOutcome::Expired(order_id) => {
            assert_eq!(order_id, id);
            assert!(!paid, "order {} both expired and paid", id);
            assert_eq!(store.status(id), Some(OrderStatus::Expired));
        }
        ExpiryOutcome::AlreadyFinalized(order_id) => {
            assert_eq!(order_id, id);
            assert!(paid, "order {} neither expired nor paid", id);
            assert_eq!(store.status(id), Some(OrderStatus::Paid));
        }
        other => panic!("unexpected outcome {:?} for order {}", other, id),
    }
}

#[tokio::test]
async fn test_concurrent_expiry_and_payment_agree() {
    let (reconciler, store) = setup();

    for id in 1..=200 {
        store.insert_pending(id, Utc::now());
        let key = expiry_key(id);

        let (outcome, paid) = tokio::join!(reconciler.on_expiry_event(&key), async {
            tokio::task::yield_now().await;
            store.mark_paid(id)
        });

        assert_single_winner(&store, outcome.unwrap(), paid, id);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_parallel_expiry_and_payment_agree() {
    let (reconciler, store) = setup();
    let reconciler = Arc::new(reconciler);

    for id in 1..=200 {
        store.insert_pending(id, Utc::now());

        let expire = {
            let reconciler = reconciler.clone();
            tokio::spawn(async move { reconciler.on_expiry_event(&expiry_key(id)).await })
        };
        let pay = {
            let store = store.clone();
            tokio::spawn(async move { store.mark_paid(id) })
        };

        let (outcome, paid) = tokio::join!(expire, pay);
        assert_single_winner(&store, outcome.unwrap().unwrap(), paid.unwrap(), id);
    }
}
