use spotkeeper::adapters::OkxTickerFeed;
use spotkeeper::config::{AppConfig, LoggingConfig};
use spotkeeper::coordination::{
    health, install_signal_handlers, GracefulShutdown, HealthState, ShutdownConfig,
};
use spotkeeper::domain::LifecycleState;
use spotkeeper::error::Result;
use spotkeeper::exchange::{build_exchange_client, ExchangeGateway, ExchangeHandle, RetryPolicy};
use spotkeeper::persistence::{JsonFileStore, SnapshotStore};
use spotkeeper::strategy::{
    JsonLinesSignalSource, LifecycleSettings, MarketFeedConsumer, OrderLifecycleManager,
    PriceCache, RiskGovernor, SignalSource, SizingParams,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::BufReader;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Minimum spacing between automatic re-reconciliation attempts
const RECONCILE_RETRY_SECS: u64 = 5;

pub fn init_logging(config: &LoggingConfig) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let level = if config.level.is_empty() { "info" } else { config.level.as_str() };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},spotkeeper={}", level, level)));

    // `tracing_appender::rolling::daily` panics if it cannot create the
    // initial file, so writability is checked first.
    let file_layer = config.dir.as_ref().and_then(|dir| {
        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!(
                "Warning: Could not create log directory {} ({}), file logging disabled",
                dir.display(),
                e
            );
            return None;
        }
        let test_path = dir.join(".spotkeeper_write_test");
        match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&test_path)
        {
            Ok(_) => {
                let _ = std::fs::remove_file(&test_path);
                let file_appender = tracing_appender::rolling::daily(dir, "spotkeeper.log");
                let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
                // Lives for the whole process
                Box::leak(Box::new(guard));
                Some(
                    tracing_subscriber::fmt::layer()
                        .with_writer(non_blocking)
                        .with_ansi(false)
                        .with_target(true),
                )
            }
            Err(e) => {
                eprintln!(
                    "Warning: Could not write to log directory {} ({}), file logging disabled",
                    dir.display(),
                    e
                );
                None
            }
        }
    });

    let (console_plain, console_json) = if config.json {
        (
            None,
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(false)
                    .with_target(true),
            ),
        )
    } else {
        (
            Some(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            ),
            None,
        )
    };

    let file_logging_enabled = file_layer.is_some();
    tracing_subscriber::registry()
        .with(filter)
        .with(console_plain)
        .with(console_json)
        .with(file_layer)
        .init();

    if let (true, Some(dir)) = (file_logging_enabled, &config.dir) {
        eprintln!("Logging to: {}/spotkeeper.log", dir.display());
    }
}

pub fn init_logging_simple() {
    // Minimal logging for one-shot commands
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .try_init();
}

struct Runtime {
    manager: Arc<OrderLifecycleManager>,
    gateway: ExchangeGateway,
    handle: ExchangeHandle,
    prices: PriceCache,
}

fn build_runtime(config: &AppConfig) -> Result<Runtime> {
    let handle = build_exchange_client(config)?;
    let gateway = ExchangeGateway::new(
        handle.client.clone(),
        RetryPolicy::from_config(&config.execution),
    );
    let store = Arc::new(JsonFileStore::new(&config.state.path));
    let prices = PriceCache::new();
    let governor = RiskGovernor::new(
        config.risk.clone(),
        SizingParams {
            stop_loss: config.execution.stop_loss,
            taker_fee: config.execution.taker_fee,
        },
    );
    let manager = Arc::new(OrderLifecycleManager::new(
        gateway.clone(),
        store,
        governor,
        prices.clone(),
        LifecycleSettings::from_config(config),
    ));
    Ok(Runtime {
        manager,
        gateway,
        handle,
        prices,
    })
}

/// Best-effort REST ticker snapshot for `pairs`
async fn poll_markets(rt: &Runtime, pairs: &[String]) {
    for pair in pairs {
        match rt.gateway.get_market(pair).await {
            Ok(market) => {
                if let Some(paper) = &rt.handle.paper {
                    paper.mark_price(pair, market.last).await;
                }
                rt.prices.update(market).await;
            }
            Err(e) => debug!(%pair, "ticker poll failed: {}", e),
        }
    }
}

pub async fn run_agent(config: AppConfig, read_signals: bool) -> Result<()> {
    info!(
        pairs = ?config.pairs,
        dry_run = config.exchange.dry_run,
        state = %config.state.path.display(),
        "starting spotkeeper"
    );
    let rt = Arc::new(build_runtime(&config)?);

    let shutdown = Arc::new(GracefulShutdown::new(ShutdownConfig::from_timeout(
        config.runtime.shutdown_timeout_secs,
    )));
    install_signal_handlers(shutdown.clone());

    // Prices first so equity is marked to market, then reconcile before any order activity
    poll_markets(&rt, &config.pairs).await;
    let report = rt.manager.reconcile().await?;
    if !report.is_consistent() {
        error!(
            discrepancies = report.discrepancies.len(),
            "starting with unresolved position mismatch; new orders refused until it clears"
        );
    }

    let health_task = config.runtime.health_addr.clone().map(|addr| {
        let state = Arc::new(HealthState::new(rt.manager.clone(), config.exchange.dry_run));
        let token = shutdown.token();
        tokio::spawn(async move {
            if let Err(e) = health::serve(&addr, state, token).await {
                error!(%addr, "health endpoint stopped: {}", e);
            }
        })
    });

    // Market feed -> consumer
    let (feed_tx, feed_rx) = mpsc::channel(1024);
    let feed = OkxTickerFeed::new(&config.exchange.ws_url, config.pairs.clone(), config.feed.clone());
    let feed_task: JoinHandle<()> = {
        let token = shutdown.token();
        tokio::spawn(async move { feed.run(feed_tx, token).await })
    };
    let consumer = Arc::new(MarketFeedConsumer::new(rt.prices.clone(), rt.manager.clone()));
    let paper_task = rt.handle.paper.clone().map(|paper| {
        let mut updates = consumer.subscribe();
        let mut token = shutdown.token();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.wait_for_shutdown() => break,
                    update = updates.recv() => match update {
                        Ok(u) => paper.mark_price(&u.pair, u.price).await,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            debug!(skipped = n, "paper price marks lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        })
    });
    let consumer_task = {
        let consumer = consumer.clone();
        let token = shutdown.token();
        tokio::spawn(async move { consumer.run(feed_rx, token).await })
    };

    let driver_task = tokio::spawn(drive(rt.clone(), config.clone(), shutdown.clone()));

    // Intents until shutdown
    let mut token = shutdown.token();
    let mut source = JsonLinesSignalSource::new(BufReader::new(tokio::io::stdin()));
    let mut signals_open = read_signals;
    if !read_signals {
        info!("signal input disabled, managing existing position only");
    }
    loop {
        tokio::select! {
            _ = token.wait_for_shutdown() => break,
            intent = source.next_intent(), if signals_open => match intent {
                Some(intent) => match rt.manager.submit_intent(intent).await {
                    Ok(order) => info!(
                        client_order_id = %order.client_order_id,
                        status = %order.status,
                        "intent accepted"
                    ),
                    Err(e @ spotkeeper::error::KeeperError::RiskRejected(_)) => {
                        info!("intent declined: {}", e)
                    }
                    Err(e) => warn!("intent failed: {}", e),
                },
                None => {
                    info!("signal input closed, managing existing position only");
                    signals_open = false;
                }
            }
        }
    }

    let manager = rt.manager.clone();
    let result = shutdown
        .execute(
            async move {
                let _ = driver_task.await;
            },
            async move { manager.drain().await.map_err(|e| e.to_string()) },
            async move {
                let _ = consumer_task.await;
                let _ = feed_task.await;
                if let Some(t) = paper_task {
                    let _ = t.await;
                }
                if let Some(t) = health_task {
                    let _ = t.await;
                }
            },
        )
        .await;

    let state = rt.manager.state().await;
    match result {
        Ok(()) => {
            info!(%state, "spotkeeper stopped");
            Ok(())
        }
        Err(e) => {
            error!(%state, "shutdown incomplete: {}", e);
            Err(spotkeeper::error::KeeperError::Persistence(e.to_string()))
        }
    }
}

/// Periodic driver: live order polling, exit checks, balance refresh,
/// automatic re-reconciliation and the ticker polling fallback.
async fn drive(rt: Arc<Runtime>, config: AppConfig, shutdown: Arc<GracefulShutdown>) {
    let mut token = shutdown.token();
    let mut ticker = tokio::time::interval(Duration::from_millis(config.runtime.tick_interval_ms.max(50)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let balance_every = Duration::from_secs(config.runtime.balance_refresh_secs.max(1));
    let mut last_balance = Instant::now();
    let mut next_reconcile = Instant::now();

    loop {
        tokio::select! {
            _ = token.wait_for_shutdown() => break,
            _ = ticker.tick() => {}
        }

        if rt.manager.needs_reconciliation().await {
            if Instant::now() >= next_reconcile {
                warn!("re-verifying exchange state");
                if let Err(e) = rt.manager.reconcile().await {
                    warn!("reconciliation retry failed: {}", e);
                }
                next_reconcile = Instant::now() + Duration::from_secs(RECONCILE_RETRY_SECS);
            }
            continue;
        }

        if let Err(e) = rt.manager.poll_live_order().await {
            warn!("live order poll failed: {}", e);
        }

        if rt.prices.is_feed_lost() {
            // Exits only: keep the open position's price fresh
            let snapshot = rt.manager.snapshot().await;
            if let Some(pos) = snapshot.position {
                poll_markets(&rt, std::slice::from_ref(&pos.pair)).await;
            }
        }

        match rt.manager.tick().await {
            Ok(Some(order)) => info!(client_order_id = %order.client_order_id, "exit order placed"),
            Ok(None) => {}
            Err(e) => warn!("exit check failed: {}", e),
        }

        if last_balance.elapsed() >= balance_every {
            last_balance = Instant::now();
            if let Err(e) = rt.manager.refresh_balance().await {
                warn!("balance refresh failed: {}", e);
            }
        }
    }
    debug!("driver stopped");
}

pub async fn run_reconcile(config: AppConfig) -> Result<()> {
    let rt = build_runtime(&config)?;
    poll_markets(&rt, &config.pairs).await;
    let report = rt.manager.reconcile().await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.is_consistent() {
        eprintln!("reconciliation found mismatches; new orders stay blocked");
    }
    Ok(())
}

pub async fn show_status(config: &AppConfig) -> Result<()> {
    let store = JsonFileStore::new(&config.state.path);
    let Some(snapshot) = store.load().await? else {
        println!("no snapshot at {}", config.state.path.display());
        return Ok(());
    };
    let state = LifecycleState::derive(snapshot.position.as_ref(), snapshot.live_order.as_ref());
    println!("state: {}", state);
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

pub async fn reset_halt(config: &AppConfig) -> Result<()> {
    let store = JsonFileStore::new(&config.state.path);
    let Some(mut snapshot) = store.load().await? else {
        println!("no snapshot at {}", config.state.path.display());
        return Ok(());
    };
    let governor = RiskGovernor::new(
        config.risk.clone(),
        SizingParams {
            stop_loss: config.execution.stop_loss,
            taker_fee: config.execution.taker_fee,
        },
    );
    if governor.reset_halt(&mut snapshot.risk) {
        store.save(&snapshot).await?;
        println!("halt cleared");
    } else {
        println!("not halted");
    }
    Ok(())
}
