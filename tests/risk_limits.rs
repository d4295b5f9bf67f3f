mod common;

use common::*;
use rust_decimal_macros::dec;
use spotkeeper::domain::{LifecycleState, OrderRef, OrderSide};
use spotkeeper::error::{KeeperError, RiskVeto};
use spotkeeper::persistence::MemoryStore;
use spotkeeper::strategy::OrderLifecycleManager;
use spotkeeper::PaperExchange;
use std::sync::Arc;

/// Open 5 @ 100, stop out at 75: realized -125 on a 1000 balance
async fn lose_one_trade(
    manager: &OrderLifecycleManager,
    exchange: &PaperExchange,
) {
    let open = manager.submit_intent(open_intent(dec!(100))).await.unwrap();
    assert_eq!(open.quantity, dec!(5));
    exchange
        .fill(&OrderRef::Client(open.client_order_id.clone()), dec!(5), dec!(100))
        .await
        .unwrap();
    manager.poll_live_order().await.unwrap();
    assert_eq!(manager.state().await, LifecycleState::Open);

    manager.prices().update(market(dec!(75))).await;
    let close = manager.tick().await.unwrap().expect("stop loss fires");
    assert_eq!(close.side, OrderSide::Sell);
    assert_eq!(close.quantity, dec!(5));
    assert_eq!(manager.state().await, LifecycleState::AwaitingClose);

    exchange
        .fill(&OrderRef::Client(close.client_order_id.clone()), dec!(5), dec!(75))
        .await
        .unwrap();
    manager.poll_live_order().await.unwrap();
    assert_eq!(manager.state().await, LifecycleState::Idle);
}

#[tokio::test]
async fn daily_loss_cap_blocks_new_entries() {
    let config = config();
    let store = Arc::new(MemoryStore::new());
    let exchange = paper(dec!(1000));
    let manager = start(&config, exchange.clone(), store.clone(), Some(dec!(100))).await;
    manager.reconcile().await.unwrap();

    lose_one_trade(&manager, &exchange).await;

    let risk = store.current().await.unwrap().risk;
    assert_eq!(risk.current_balance, dec!(875));
    assert_eq!(risk.daily_pnl, dec!(-125));
    assert!(risk.halted.is_none());

    let err = manager.submit_intent(open_intent(dec!(75))).await.unwrap_err();
    assert!(matches!(
        err,
        KeeperError::RiskRejected(RiskVeto::DailyLossCap { .. })
    ));
    assert_eq!(exchange.order_count().await, 2);
}

#[tokio::test]
async fn hard_drawdown_halt_is_sticky_until_reset() {
    let mut config = config();
    config.risk.hard_drawdown = dec!(0.10);
    config.risk.daily_loss_cap = dec!(0.50);
    let store = Arc::new(MemoryStore::new());
    let exchange = paper(dec!(1000));
    let manager = start(&config, exchange.clone(), store.clone(), Some(dec!(100))).await;
    manager.reconcile().await.unwrap();

    lose_one_trade(&manager, &exchange).await;
    assert!(store.current().await.unwrap().risk.halted.is_some());

    manager.prices().update(market(dec!(100))).await;
    let err = manager.submit_intent(open_intent(dec!(100))).await.unwrap_err();
    assert!(matches!(err, KeeperError::RiskRejected(RiskVeto::Halted { .. })));

    assert!(manager.reset_halt().await.unwrap());
    assert!(store.current().await.unwrap().risk.halted.is_none());
    // Drawdown is still past the hard limit
    let err = manager.submit_intent(open_intent(dec!(100))).await.unwrap_err();
    assert!(matches!(
        err,
        KeeperError::RiskRejected(RiskVeto::HardDrawdown { .. })
    ));
}

#[tokio::test]
async fn halt_survives_restart() {
    let mut config = config();
    config.risk.hard_drawdown = dec!(0.10);
    config.risk.daily_loss_cap = dec!(0.50);
    let path = temp_state_path();
    let exchange = paper(dec!(1000));

    let first = start(&config, exchange.clone(), file_store(&path), Some(dec!(100))).await;
    first.reconcile().await.unwrap();
    lose_one_trade(&first, &exchange).await;
    first.drain().await.unwrap();
    drop(first);

    let second = start(&config, exchange.clone(), file_store(&path), Some(dec!(100))).await;
    second.reconcile().await.unwrap();
    let snap = second.snapshot().await;
    assert!(snap.risk.halted.is_some());
    assert_eq!(snap.risk.current_balance, dec!(875));
    let err = second.submit_intent(open_intent(dec!(100))).await.unwrap_err();
    assert!(matches!(err, KeeperError::RiskRejected(RiskVeto::Halted { .. })));

    let _ = std::fs::remove_dir_all(path.parent().unwrap());
}

/// Open 5 @ 100 and let the price run to 116 before the exit fires
async fn ride_to_target(
    manager: &OrderLifecycleManager,
    exchange: &PaperExchange,
) -> spotkeeper::domain::Order {
    let open = manager.submit_intent(open_intent(dec!(100))).await.unwrap();
    exchange
        .fill(&OrderRef::Client(open.client_order_id.clone()), dec!(5), dec!(100))
        .await
        .unwrap();
    manager.poll_live_order().await.unwrap();

    manager.prices().update(market(dec!(116))).await;
    // Unrealized gain is not part of the balance yet
    assert_eq!(manager.refresh_balance().await.unwrap(), dec!(1000));
    let risk = manager.snapshot().await.risk;
    assert_eq!(risk.current_balance, dec!(1000));
    assert_eq!(risk.peak_balance, dec!(1000));

    let close = manager.tick().await.unwrap().expect("profit target fires");
    assert_eq!(close.side, OrderSide::Sell);
    close
}

#[tokio::test]
async fn profitable_close_after_refresh_books_gain_once() {
    let config = config();
    let store = Arc::new(MemoryStore::new());
    let exchange = paper(dec!(1000));
    let manager = start(&config, exchange.clone(), store.clone(), Some(dec!(100))).await;
    manager.reconcile().await.unwrap();

    let close = ride_to_target(&manager, &exchange).await;
    exchange
        .fill(&OrderRef::Client(close.client_order_id.clone()), dec!(5), dec!(116))
        .await
        .unwrap();
    manager.poll_live_order().await.unwrap();
    assert_eq!(manager.state().await, LifecycleState::Idle);

    let risk = manager.snapshot().await.risk;
    assert_eq!(risk.current_balance, dec!(1080));
    assert_eq!(risk.peak_balance, dec!(1080));

    assert_eq!(manager.refresh_balance().await.unwrap(), dec!(1080));
    let risk = store.current().await.unwrap().risk;
    assert_eq!(risk.current_balance, dec!(1080));
    assert_eq!(risk.peak_balance, dec!(1080));
    assert_eq!(risk.drawdown, dec!(0));
}

#[tokio::test]
async fn close_settled_during_downtime_books_gain_once() {
    let config = config();
    let path = temp_state_path();
    let exchange = paper(dec!(1000));

    let first = start(&config, exchange.clone(), file_store(&path), Some(dec!(100))).await;
    first.reconcile().await.unwrap();
    let close = ride_to_target(&first, &exchange).await;
    drop(first);

    exchange
        .fill(&OrderRef::Client(close.client_order_id.clone()), dec!(5), dec!(116))
        .await
        .unwrap();

    let second = start(&config, exchange.clone(), file_store(&path), Some(dec!(116))).await;
    let report = second.reconcile().await.unwrap();
    assert_eq!(report.equity, dec!(1080));
    let risk = second.snapshot().await.risk;
    assert_eq!(risk.current_balance, dec!(1080));
    assert_eq!(risk.peak_balance, dec!(1080));
    assert_eq!(risk.drawdown, dec!(0));
    assert!(risk.halted.is_none());

    let _ = std::fs::remove_dir_all(path.parent().unwrap());
}
