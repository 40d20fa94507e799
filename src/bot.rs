//! Component wiring and the two top-level loops: the periodic scan loop and
//! the immediate (book-update driven) execute path.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::time::Duration;

use crate::analyzer::Analyzer;
use crate::breaker::CircuitBreaker;
use crate::capital::CapitalManager;
use crate::config::Settings;
use crate::daily_loss::DailyLossManager;
use crate::engine::{AccumulationEngine, SnapshotInput};
use crate::exchange::{ExchangeClient, MarketCatalog, ShadowExchange, StaticCatalog};
use crate::executor::Executor;
use crate::fill_manager::{FillManager, FillSink};
use crate::http;
use crate::kelly::KellySizer;
use crate::lifecycle::{ComponentHealth, GracefulShutdown, HealthChecker, Metrics};
use crate::optimizer::{AutoOptimizer, OptimizerMode};
use crate::oracle::MomentumOracle;
use crate::orderbook::{BookManager, FeedEvent};
use crate::order_queue::OrderQueue;
use crate::rate_limiter::AdaptiveRateLimiter;
use crate::scanner::Scanner;
use crate::store::Store;

pub async fn run(settings: Settings) -> Result<()> {
    let store = Store::new(&settings.data_dir)?;
    let metrics = Arc::new(Metrics::new(Some(store.clone())));
    let health = Arc::new(HealthChecker::new());
    let shutdown = Arc::new(GracefulShutdown::new(metrics.clone()));

    // Exchange collaborators. The HTTP/WS adapters are external; shadow
    // doubles keep the full pipeline running without them.
    let client: Arc<dyn ExchangeClient> = Arc::new(ShadowExchange);
    let catalog: Arc<dyn MarketCatalog> = Arc::new(StaticCatalog);

    let limiter = Arc::new(AdaptiveRateLimiter::new(settings.rate_limiter_config()));
    let breaker = Arc::new(CircuitBreaker::new("exchange", settings.breaker_config()));
    let queue = Arc::new(OrderQueue::new(
        client.clone(),
        limiter.clone(),
        breaker.clone(),
        settings.queue_config(),
    ));
    let fills = Arc::new(FillManager::new(
        client.clone(),
        Duration::from_secs_f64(settings.fill_poll_interval_secs),
        Some(store.clone()),
    ));
    let capital = Arc::new(CapitalManager::new(
        settings.capital_config(),
        Some(store.clone()),
    )?);
    let daily = Arc::new(DailyLossManager::new(
        settings.daily_loss_config(),
        Some(store.clone()),
    ));
    let kelly = Arc::new(KellySizer::new(settings.kelly_config(), Some(store.clone())));

    let executor = Arc::new(Executor::new(
        client.clone(),
        queue.clone(),
        fills.clone(),
        limiter.clone(),
        breaker.clone(),
        capital.clone(),
        daily.clone(),
        kelly.clone(),
        metrics.clone(),
        settings.executor_config(),
        settings.auto_trading_enabled,
    ));

    let books = Arc::new(BookManager::new(settings.book_max_levels));
    let scanner = Arc::new(Scanner::new(catalog, books.clone(), settings.scanner_config()));
    let analyzer = Analyzer::new(settings.analyzer_config());

    let oracle = settings.oracle_enabled.then(|| {
        Arc::new(MomentumOracle::new(
            settings.oracle_pump_threshold,
            settings.oracle_dump_threshold,
        ))
    });

    let engine = Arc::new(AccumulationEngine::new(
        executor.clone(),
        kelly.clone(),
        metrics.clone(),
        oracle,
        settings.engine_params(),
        Some(store.clone()),
    ));

    let optimizer_mode =
        OptimizerMode::parse(&settings.optimizer_mode).unwrap_or(OptimizerMode::Manual);
    let optimizer = Arc::new(AutoOptimizer::new(
        scanner.clone(),
        engine.clone(),
        None,
        optimizer_mode,
        Duration::from_secs_f64(settings.optimizer_interval_secs),
    ));

    // Book feed: the WS wrapper owns the sender; we keep one alive so the
    // pump task stays up in shadow runs.
    let (_feed_tx, feed_rx) = mpsc::channel::<FeedEvent>(1024);
    scanner.start_feed_task(feed_rx);

    let (immediate_tx, mut immediate_rx) = mpsc::channel(256);
    scanner.set_immediate_channel(immediate_tx);

    register_health_probes(&health, &books, &queue, &daily);
    register_shutdown(&shutdown, &optimizer, &engine, &executor, &daily);

    // Fills flow straight into the strategy core.
    fills.set_sink(Arc::downgrade(&(engine.clone() as Arc<dyn FillSink>)));

    executor.start();
    engine.start();
    daily.start_reset_loop();
    optimizer.start();

    if settings.health_enabled {
        let health = health.clone();
        let metrics = metrics.clone();
        let host = settings.health_host.clone();
        let port = settings.health_port;
        tokio::spawn(async move {
            if let Err(e) = http::serve(&host, port, health, metrics).await {
                log::error!("http.error err={e:#}");
            }
        });
    }

    // Ctrl-C runs the shutdown registry.
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::warn!("signal.ctrl_c");
                shutdown.run().await;
            }
        });
    }

    let trading = settings.run_mode == "trade";
    let mut scan_tick =
        tokio::time::interval(Duration::from_secs(settings.market_refresh_secs));
    scan_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    log::info!(
        "bot.run mode={} markets_keywords={:?} max_pair_cost={}",
        settings.run_mode,
        settings.market_keywords,
        settings.max_pair_cost
    );

    loop {
        tokio::select! {
            _ = scan_tick.tick() => {
                scanner.refresh().await;
                scanner.set_priority(engine.active_market_ids());
                if !trading {
                    continue;
                }
                scan_pass(&scanner, &engine).await;
            }
            Some(snapshot) = immediate_rx.recv() => {
                if !trading {
                    continue;
                }
                // Low-latency pre-filter: a book update that scores as
                // immediately tradable bypasses the periodic loop.
                let has_position = engine.position(&snapshot.market.id).is_some();
                if let Some(input) = SnapshotInput::from_snapshot(&snapshot) {
                    let max_pair_cost = engine.params().max_pair_cost;
                    if input.price_yes + input.price_no < max_pair_cost {
                        engine.on_snapshot(&input).await;
                    } else if !has_position {
                        if let Some(opp) = analyzer.analyze_immediate(&snapshot, None) {
                            let result = executor.execute_opportunity(&opp).await;
                            if !result.success {
                                log::debug!(
                                    "bot.immediate_rejected market={} err={}",
                                    opp.market_id,
                                    result.error.as_deref().unwrap_or("?")
                                );
                            }
                        }
                    }
                }
            }
            _ = shutdown.wait() => {
                break;
            }
        }
    }

    log::info!("bot.exit");
    Ok(())
}

/// Periodic pass: every tracked market whose combined asks leave room under
/// the cap is handed to the strategy core.
async fn scan_pass(scanner: &Arc<Scanner>, engine: &Arc<AccumulationEngine>) {
    let max_pair_cost = engine.params().max_pair_cost;
    for snapshot in scanner.snapshots() {
        let Some(input) = SnapshotInput::from_snapshot(&snapshot) else {
            continue;
        };
        if input.price_yes + input.price_no < max_pair_cost
            || engine.position(&input.market_id).is_some()
        {
            engine.on_snapshot(&input).await;
        }
    }
}

fn register_health_probes(
    health: &Arc<HealthChecker>,
    books: &Arc<BookManager>,
    queue: &Arc<OrderQueue>,
    daily: &Arc<DailyLossManager>,
) {
    {
        let books = books.clone();
        health.register(
            "order_books",
            Box::new(move || {
                let stale = books.stale_tokens().len();
                let total = books.count();
                if total == 0 {
                    ComponentHealth::degraded("order_books", "no books yet")
                } else if stale * 2 > total {
                    ComponentHealth::degraded("order_books", format!("{stale}/{total} stale"))
                } else {
                    ComponentHealth::healthy("order_books")
                }
            }),
        );
    }
    {
        let queue = queue.clone();
        health.register(
            "order_queue",
            Box::new(move || {
                if queue.is_running() {
                    ComponentHealth::healthy("order_queue")
                } else {
                    ComponentHealth::unhealthy("order_queue", "processor stopped")
                }
            }),
        );
    }
    {
        let daily = daily.clone();
        health.register(
            "daily_loss",
            Box::new(move || {
                let summary = daily.summary();
                if summary.can_trade {
                    ComponentHealth::healthy("daily_loss")
                } else {
                    ComponentHealth::degraded("daily_loss", "trading blocked")
                }
            }),
        );
    }
}

/// Shutdown callbacks run in registration order: stop the slow movers
/// first, persist last (reverse of component creation).
fn register_shutdown(
    shutdown: &Arc<GracefulShutdown>,
    optimizer: &Arc<AutoOptimizer>,
    engine: &Arc<AccumulationEngine>,
    executor: &Arc<Executor>,
    daily: &Arc<DailyLossManager>,
) {
    {
        let optimizer = optimizer.clone();
        shutdown.register(
            "optimizer",
            Box::new(move || {
                let optimizer = optimizer.clone();
                Box::pin(async move {
                    optimizer.shutdown();
                })
            }),
        );
    }
    {
        let engine = engine.clone();
        shutdown.register(
            "engine",
            Box::new(move || {
                let engine = engine.clone();
                Box::pin(async move {
                    engine.shutdown();
                })
            }),
        );
    }
    {
        let executor = executor.clone();
        shutdown.register(
            "executor",
            Box::new(move || {
                let executor = executor.clone();
                Box::pin(async move {
                    executor.stop();
                })
            }),
        );
    }
    {
        let daily = daily.clone();
        shutdown.register(
            "daily_loss",
            Box::new(move || {
                let daily = daily.clone();
                Box::pin(async move {
                    daily.shutdown();
                })
            }),
        );
    }
}
