mod common;

use common::*;
use rust_decimal_macros::dec;
use spotkeeper::domain::{FillEvent, LifecycleState, OrderRef, OrderStatus};
use spotkeeper::error::KeeperError;
use spotkeeper::persistence::MemoryStore;
use std::sync::Arc;

#[tokio::test]
async fn lost_ack_retry_does_not_duplicate_the_order() {
    let config = config();
    let store = Arc::new(MemoryStore::new());
    let exchange = paper(dec!(1000));
    let manager = start(&config, exchange.clone(), store.clone(), Some(dec!(100))).await;
    manager.reconcile().await.unwrap();

    exchange.lose_next_acks(1).await;
    let order = manager.submit_intent(open_intent(dec!(100))).await.unwrap();

    assert_eq!(order.status, OrderStatus::Submitted);
    assert!(order.exchange_order_id.is_some());
    // Second call was answered with "duplicate" and resolved to the first order
    assert_eq!(exchange.submit_calls().await, 2);
    assert_eq!(exchange.order_count().await, 1);
    assert!(manager.is_ready().await);
}

#[tokio::test]
async fn second_open_while_order_is_live_is_refused() {
    let config = config();
    let store = Arc::new(MemoryStore::new());
    let exchange = paper(dec!(1000));
    let manager = start(&config, exchange.clone(), store.clone(), Some(dec!(100))).await;
    manager.reconcile().await.unwrap();

    let first = manager.submit_intent(open_intent(dec!(100))).await.unwrap();
    let err = manager.submit_intent(open_intent(dec!(100))).await.unwrap_err();
    assert!(matches!(err, KeeperError::Busy(_)));

    // Still refused once the position is open
    exchange
        .fill(&OrderRef::Client(first.client_order_id.clone()), dec!(5), dec!(100))
        .await
        .unwrap();
    manager.poll_live_order().await.unwrap();
    assert_eq!(manager.state().await, LifecycleState::Open);
    let err = manager.submit_intent(open_intent(dec!(100))).await.unwrap_err();
    assert!(matches!(err, KeeperError::Busy(_)));

    assert_eq!(exchange.order_count().await, 1);
}

#[tokio::test]
async fn concurrent_opens_yield_exactly_one_order() {
    let config = config();
    let store = Arc::new(MemoryStore::new());
    let exchange = paper(dec!(1000));
    let manager = start(&config, exchange.clone(), store.clone(), Some(dec!(100))).await;
    manager.reconcile().await.unwrap();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let manager = manager.clone();
            tokio::spawn(async move { manager.submit_intent(open_intent(dec!(100))).await })
        })
        .collect();

    let mut accepted = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => accepted += 1,
            Err(KeeperError::Busy(_)) => {}
            Err(other) => panic!("unexpected error {other}"),
        }
    }
    assert_eq!(accepted, 1);
    assert_eq!(exchange.order_count().await, 1);
}

#[tokio::test]
async fn overfill_is_clamped_to_order_quantity() {
    let config = config();
    let store = Arc::new(MemoryStore::new());
    let exchange = paper(dec!(1000));
    let manager = start(&config, exchange.clone(), store.clone(), Some(dec!(100))).await;
    manager.reconcile().await.unwrap();

    let order = manager.submit_intent(open_intent(dec!(100))).await.unwrap();
    assert_eq!(order.quantity, dec!(5));
    let order_ref = OrderRef::Client(order.client_order_id.clone());

    manager
        .on_fill_event(FillEvent {
            order_ref: order_ref.clone(),
            quantity_delta: dec!(3),
            price: dec!(100),
        })
        .await
        .unwrap();
    manager
        .on_fill_event(FillEvent {
            order_ref,
            quantity_delta: dec!(4),
            price: dec!(100),
        })
        .await
        .unwrap();

    let snap = store.current().await.unwrap();
    assert!(snap.live_order.is_none());
    let settled = snap.last_order.unwrap();
    assert_eq!(settled.filled_quantity, dec!(5));
    assert_eq!(settled.status, OrderStatus::Filled);
    assert_eq!(snap.position.unwrap().quantity, dec!(5));
}

#[tokio::test]
async fn fill_for_unknown_order_changes_nothing() {
    let config = config();
    let store = Arc::new(MemoryStore::new());
    let exchange = paper(dec!(1000));
    let manager = start(&config, exchange.clone(), store.clone(), Some(dec!(100))).await;
    manager.reconcile().await.unwrap();
    manager.submit_intent(open_intent(dec!(100))).await.unwrap();
    let before = store.current().await.unwrap();

    let applied = manager
        .on_fill_event(FillEvent {
            order_ref: OrderRef::Exchange("someone-else".into()),
            quantity_delta: dec!(1),
            price: dec!(100),
        })
        .await
        .unwrap();
    assert!(!applied.transition.is_applied());
    assert_eq!(store.current().await.unwrap(), before);
}
