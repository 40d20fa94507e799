//! Order execution: validation, capital gating, bilateral submission with
//! orphan-leg cleanup, and the non-blocking queue path.
//!
//! Per-market serialization is a map of async locks keyed by market id;
//! distinct markets execute in parallel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;

use crate::analyzer::{Opportunity, OpportunityAction};
use crate::breaker::CircuitBreaker;
use crate::capital::{CapitalManager, Strategy};
use crate::daily_loss::DailyLossManager;
use crate::exchange::{ExchangeClient, ExchangeError, OrderStatus, Side, Tif};
use crate::fill_manager::{FillManager, Leg};
use crate::kelly::KellySizer;
use crate::lifecycle::Metrics;
use crate::order_queue::{OrderPriority, OrderQueue, OrderType, QueueEvents, QueuedOrder};
use crate::rate_limiter::AdaptiveRateLimiter;
use crate::utils::dec;
use tokio::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
    Stopped,
    Ready,
    Executing,
    Paused,
}

#[derive(Debug, Clone)]
pub struct TradeResult {
    pub opportunity_id: String,
    pub success: bool,
    pub order_yes_id: Option<String>,
    pub order_no_id: Option<String>,
    pub error: Option<String>,
    pub executed_at: DateTime<Utc>,
}

impl TradeResult {
    fn failure(opportunity_id: &str, error: impl Into<String>) -> Self {
        Self {
            opportunity_id: opportunity_id.to_string(),
            success: false,
            order_yes_id: None,
            order_no_id: None,
            error: Some(error.into()),
            executed_at: Utc::now(),
        }
    }

    /// Exactly one leg made it to the exchange.
    pub fn is_partial(&self) -> bool {
        self.order_yes_id.is_some() != self.order_no_id.is_some()
    }
}

/// A live exchange order as the executor knows it (the fill manager is
/// authoritative for fill state; this registry is a lookup surface).
#[derive(Debug, Clone)]
pub struct ActiveOrder {
    pub id: String,
    pub opportunity_id: String,
    pub market_id: String,
    pub token_id: String,
    pub leg: Leg,
    pub price: f64,
    pub size: f64,
    pub status: OrderStatus,
    pub filled_size: f64,
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub capital_per_trade: f64,
    pub min_time_between_trades: Duration,
    pub max_open_positions: usize,
    pub max_total_exposure: f64,
    pub max_pair_cost_slippage_check: f64,
    pub capital_multiplier_score_5: f64,
    pub capital_multiplier_score_4: f64,
    pub max_consecutive_failures: u32,
    pub pause_duration: Duration,
    pub fill_wait_timeout: Duration,
    pub kelly_enabled: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            capital_per_trade: 25.0,
            min_time_between_trades: Duration::from_millis(200),
            max_open_positions: 15,
            max_total_exposure: 1000.0,
            max_pair_cost_slippage_check: 0.980,
            capital_multiplier_score_5: 1.2,
            capital_multiplier_score_4: 1.0,
            max_consecutive_failures: 5,
            pause_duration: Duration::from_secs(60),
            fill_wait_timeout: Duration::from_secs(5),
            kelly_enabled: false,
        }
    }
}

pub struct Executor {
    client: Arc<dyn ExchangeClient>,
    queue: Arc<OrderQueue>,
    fills: Arc<FillManager>,
    limiter: Arc<AdaptiveRateLimiter>,
    breaker: Arc<CircuitBreaker>,
    capital: Arc<CapitalManager>,
    daily: Arc<DailyLossManager>,
    kelly: Arc<KellySizer>,
    metrics: Arc<Metrics>,
    config: ExecutorConfig,
    state: RwLock<ExecutorState>,
    auto_trading: AtomicBool,
    consecutive_failures: AtomicU32,
    trades_today: AtomicU64,
    successful_trades: AtomicU64,
    failed_trades: AtomicU64,
    last_trade_at: Mutex<Option<Instant>>,
    market_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    orders: Mutex<HashMap<String, ActiveOrder>>,
    // Set in start(); lets &self methods schedule the auto-resume task.
    self_ref: RwLock<std::sync::Weak<Executor>>,
}

#[derive(Debug, Clone, Default)]
pub struct ExecutorStats {
    pub trades_today: u64,
    pub successful: u64,
    pub failed: u64,
    pub consecutive_failures: u32,
    pub open_orders: usize,
    pub total_exposure: f64,
}

impl Executor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Arc<dyn ExchangeClient>,
        queue: Arc<OrderQueue>,
        fills: Arc<FillManager>,
        limiter: Arc<AdaptiveRateLimiter>,
        breaker: Arc<CircuitBreaker>,
        capital: Arc<CapitalManager>,
        daily: Arc<DailyLossManager>,
        kelly: Arc<KellySizer>,
        metrics: Arc<Metrics>,
        config: ExecutorConfig,
        auto_trading: bool,
    ) -> Self {
        Self {
            client,
            queue,
            fills,
            limiter,
            breaker,
            capital,
            daily,
            kelly,
            metrics,
            config,
            state: RwLock::new(ExecutorState::Stopped),
            auto_trading: AtomicBool::new(auto_trading),
            consecutive_failures: AtomicU32::new(0),
            trades_today: AtomicU64::new(0),
            successful_trades: AtomicU64::new(0),
            failed_trades: AtomicU64::new(0),
            last_trade_at: Mutex::new(None),
            market_locks: Mutex::new(HashMap::new()),
            orders: Mutex::new(HashMap::new()),
            self_ref: RwLock::new(std::sync::Weak::new()),
        }
    }

    pub fn start(self: &Arc<Self>) {
        *self.self_ref.write() = Arc::downgrade(self);
        *self.state.write() = ExecutorState::Ready;
        self.queue.start();
        self.fills.start();
        let weak: std::sync::Weak<dyn QueueEvents> =
            Arc::downgrade(&(Arc::clone(self) as Arc<dyn QueueEvents>));
        self.queue.set_events(weak);
        log::info!("executor.started");
    }

    pub fn stop(&self) {
        self.queue.shutdown();
        self.fills.shutdown();
        self.market_locks.lock().clear();
        *self.state.write() = ExecutorState::Stopped;
        log::info!("executor.stopped");
    }

    pub fn state(&self) -> ExecutorState {
        *self.state.read()
    }

    pub fn set_auto_trading(&self, enabled: bool) {
        self.auto_trading.store(enabled, Ordering::SeqCst);
    }

    pub fn pause(&self) {
        let mut state = self.state.write();
        if matches!(*state, ExecutorState::Ready | ExecutorState::Executing) {
            *state = ExecutorState::Paused;
        }
    }

    pub fn resume(&self) {
        let mut state = self.state.write();
        if *state == ExecutorState::Paused {
            self.consecutive_failures.store(0, Ordering::SeqCst);
            *state = ExecutorState::Ready;
        }
    }

    pub fn stats(&self) -> ExecutorStats {
        let orders = self.orders.lock();
        let open: Vec<&ActiveOrder> = orders
            .values()
            .filter(|o| !o.status.is_terminal())
            .collect();
        ExecutorStats {
            trades_today: self.trades_today.load(Ordering::SeqCst),
            successful: self.successful_trades.load(Ordering::SeqCst),
            failed: self.failed_trades.load(Ordering::SeqCst),
            consecutive_failures: self.consecutive_failures.load(Ordering::SeqCst),
            open_orders: open.len(),
            total_exposure: open.iter().map(|o| o.price * o.size).sum(),
        }
    }

    fn open_position_markets(&self) -> usize {
        let orders = self.orders.lock();
        let mut markets: Vec<&str> = orders
            .values()
            .filter(|o| !o.status.is_terminal())
            .map(|o| o.market_id.as_str())
            .collect();
        markets.sort_unstable();
        markets.dedup();
        markets.len()
    }

    fn total_exposure(&self) -> f64 {
        self.orders
            .lock()
            .values()
            .filter(|o| !o.status.is_terminal())
            .map(|o| o.price * o.size)
            .sum()
    }

    pub fn can_trade(&self) -> (bool, String) {
        let state = self.state();
        if state != ExecutorState::Ready {
            return (false, format!("executor not ready (state {state:?})"));
        }
        if !self.auto_trading.load(Ordering::SeqCst) {
            return (false, "auto trading disabled".to_string());
        }
        let (daily_ok, daily_reason) = self.daily.can_trade();
        if !daily_ok {
            return (false, daily_reason);
        }
        if let Some(last) = *self.last_trade_at.lock() {
            let elapsed = last.elapsed();
            if elapsed < self.config.min_time_between_trades {
                let wait = self.config.min_time_between_trades - elapsed;
                return (false, format!("inter-trade interval ({}ms left)", wait.as_millis()));
            }
        }
        let open = self.open_position_markets();
        if open >= self.config.max_open_positions {
            return (
                false,
                format!("open position limit ({open}/{})", self.config.max_open_positions),
            );
        }
        let exposure = self.total_exposure();
        if exposure + self.config.capital_per_trade > self.config.max_total_exposure {
            return (
                false,
                format!(
                    "max exposure (${exposure:.2}/${:.2})",
                    self.config.max_total_exposure
                ),
            );
        }
        (true, String::new())
    }

    fn market_lock(&self, market_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.market_locks
            .lock()
            .entry(market_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Bilateral execution of a scored opportunity: both legs submitted
    /// concurrently; exactly-one-success triggers a best-effort cancel of
    /// the orphan leg.
    pub async fn execute_opportunity(self: &Arc<Self>, opp: &Opportunity) -> TradeResult {
        let lock = self.market_lock(&opp.market_id);
        let _guard = lock.lock().await;

        let result = self.execute_inner(opp).await;

        self.trades_today.fetch_add(1, Ordering::SeqCst);
        *self.last_trade_at.lock() = Some(Instant::now());

        if result.success {
            self.successful_trades.fetch_add(1, Ordering::SeqCst);
            self.consecutive_failures.store(0, Ordering::SeqCst);
            let volume = dec(self.config.capital_per_trade);
            self.metrics.record_trade(true, volume, Decimal::ZERO);
        } else {
            self.handle_failure(result.error.as_deref().unwrap_or("unknown"));
        }
        result
    }

    async fn execute_inner(self: &Arc<Self>, opp: &Opportunity) -> TradeResult {
        let (ok, reason) = self.can_trade();
        if !ok {
            self.metrics.record_rejected();
            return TradeResult::failure(&opp.id, reason);
        }
        if opp.action != OpportunityAction::Trade {
            self.metrics.record_rejected();
            return TradeResult::failure(&opp.id, "opportunity not tradable");
        }

        // Slippage re-check at execution time: the book may have moved
        // since the snapshot was scored.
        let pair_cost = opp.recommended_price_yes + opp.recommended_price_no;
        if pair_cost > self.config.max_pair_cost_slippage_check {
            self.metrics.record_rejected();
            return TradeResult::failure(
                &opp.id,
                format!(
                    "slippage: pair cost {pair_cost:.4} > {:.4}",
                    self.config.max_pair_cost_slippage_check
                ),
            );
        }

        let size = self.order_size(opp);
        if size <= 0.0 {
            self.metrics.record_rejected();
            return TradeResult::failure(&opp.id, "size collapsed to zero");
        }

        // Reserve capital for both legs before touching the exchange.
        let total_cost = size * pair_cost;
        if !self
            .capital
            .allocate(dec(total_cost), &opp.market_id, Strategy::Gabagool)
        {
            return TradeResult::failure(&opp.id, "insufficient capital");
        }

        // Validation passed; the state machine leaves Ready only for the
        // actual submission window.
        *self.state.write() = ExecutorState::Executing;
        let mut result = self.place_bilateral(opp, size).await;

        if result.success {
            self.wait_for_fills(&result).await;
        } else {
            // Nothing (or nothing covered) is resting; hand the
            // reservation back.
            self.capital
                .release(&opp.market_id, Decimal::ZERO, Decimal::ZERO, Decimal::ZERO, Strategy::Gabagool);
        }

        {
            let mut state = self.state.write();
            if *state == ExecutorState::Executing {
                *state = ExecutorState::Ready;
            }
        }

        result.executed_at = Utc::now();
        result
    }

    fn order_size(&self, opp: &Opportunity) -> f64 {
        let score_multiplier = match opp.score {
            5 => self.config.capital_multiplier_score_5,
            4 => self.config.capital_multiplier_score_4,
            _ => 1.0,
        };
        let mut capital = self.config.capital_per_trade
            * score_multiplier
            * self.daily.position_size_multiplier();
        if self.config.kelly_enabled {
            let (scaled, _) = self.kelly.size_for(Strategy::Gabagool, capital);
            capital = scaled;
        }
        let pair = opp.recommended_price_yes + opp.recommended_price_no;
        if pair <= 0.0 {
            return 0.0;
        }
        // Per-side shares.
        ((capital / pair) / 2.0 * 100.0).round() / 100.0
    }

    async fn place_bilateral(self: &Arc<Self>, opp: &Opportunity, size: f64) -> TradeResult {
        self.limiter.acquire(2.0).await;

        let yes_fut = self.breaker.call(self.client.create_limit_order(
            &opp.token_yes_id,
            Side::Buy,
            opp.recommended_price_yes,
            size,
            Tif::Gtc,
        ));
        let no_fut = self.breaker.call(self.client.create_limit_order(
            &opp.token_no_id,
            Side::Buy,
            opp.recommended_price_no,
            size,
            Tif::Gtc,
        ));
        let (yes_res, no_res) = tokio::join!(yes_fut, no_fut);

        match (yes_res, no_res) {
            (Ok(yes), Ok(no)) => {
                self.register_order(opp, &yes.order_id, Leg::Yes, opp.recommended_price_yes, size);
                self.register_order(opp, &no.order_id, Leg::No, opp.recommended_price_no, size);
                self.fills
                    .track(&yes.order_id, &opp.market_id, Leg::Yes, size);
                self.fills.track(&no.order_id, &opp.market_id, Leg::No, size);
                log::info!(
                    "executor.bilateral market={} size={:.2} yes={} no={}",
                    opp.market_id,
                    size,
                    yes.order_id,
                    no.order_id
                );
                TradeResult {
                    opportunity_id: opp.id.clone(),
                    success: true,
                    order_yes_id: Some(yes.order_id),
                    order_no_id: Some(no.order_id),
                    error: None,
                    executed_at: Utc::now(),
                }
            }
            (Ok(yes), Err(no_err)) => {
                self.cancel_orphan(&yes.order_id, "NO", &no_err).await;
                TradeResult {
                    opportunity_id: opp.id.clone(),
                    success: false,
                    order_yes_id: Some(yes.order_id),
                    order_no_id: None,
                    error: Some(format!("NO leg failed: {no_err}")),
                    executed_at: Utc::now(),
                }
            }
            (Err(yes_err), Ok(no)) => {
                self.cancel_orphan(&no.order_id, "YES", &yes_err).await;
                TradeResult {
                    opportunity_id: opp.id.clone(),
                    success: false,
                    order_yes_id: None,
                    order_no_id: Some(no.order_id),
                    error: Some(format!("YES leg failed: {yes_err}")),
                    executed_at: Utc::now(),
                }
            }
            (Err(yes_err), Err(no_err)) => TradeResult {
                opportunity_id: opp.id.clone(),
                success: false,
                order_yes_id: None,
                order_no_id: None,
                error: Some(format!("both legs failed: YES {yes_err}; NO {no_err}")),
                executed_at: Utc::now(),
            },
        }
    }

    /// One leg is resting without its hedge; cancel it. A failed cancel is
    /// an uncovered directional position and is surfaced at critical level.
    async fn cancel_orphan(&self, order_id: &str, failed_leg: &str, cause: &ExchangeError) {
        match self.client.cancel_order(order_id).await {
            Ok(()) => {
                log::warn!(
                    "executor.orphan_cancelled order={} failed_leg={} cause={}",
                    order_id,
                    failed_leg,
                    cause
                );
            }
            Err(cancel_err) => {
                self.metrics.record_error();
                log::error!(
                    "executor.uncovered_position order={} failed_leg={} cause={} cancel_err={}",
                    order_id,
                    failed_leg,
                    cause,
                    cancel_err
                );
            }
        }
    }

    fn register_order(&self, opp: &Opportunity, order_id: &str, leg: Leg, price: f64, size: f64) {
        let token_id = match leg {
            Leg::Yes => opp.token_yes_id.clone(),
            Leg::No => opp.token_no_id.clone(),
        };
        self.orders.lock().insert(
            order_id.to_string(),
            ActiveOrder {
                id: order_id.to_string(),
                opportunity_id: opp.id.clone(),
                market_id: opp.market_id.clone(),
                token_id,
                leg,
                price,
                size,
                status: OrderStatus::Open,
                filled_size: 0.0,
            },
        );
    }

    /// Short courtesy poll after a bilateral submit so the registry reflects
    /// quick fills; the fill manager converges regardless.
    async fn wait_for_fills(&self, result: &TradeResult) {
        let ids: Vec<String> = [result.order_yes_id.clone(), result.order_no_id.clone()]
            .into_iter()
            .flatten()
            .collect();
        if ids.is_empty() {
            return;
        }

        let deadline = Instant::now() + self.config.fill_wait_timeout;
        loop {
            let mut all_done = true;
            for id in &ids {
                match self.client.get_order(id).await {
                    Ok(Some(state)) => {
                        let mut orders = self.orders.lock();
                        if let Some(order) = orders.get_mut(id) {
                            order.status = state.status;
                            order.filled_size = state.size_matched;
                            if !state.status.is_terminal() && state.size_matched < order.size {
                                all_done = false;
                            }
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        log::debug!("executor.fill_check_error order={id} err={e}");
                        all_done = false;
                    }
                }
            }
            if all_done || Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    fn handle_failure(&self, error: &str) {
        self.failed_trades.fetch_add(1, Ordering::SeqCst);
        self.metrics.record_trade(false, Decimal::ZERO, Decimal::ZERO);
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        log::warn!("executor.trade_failed consecutive={failures} err={error}");

        if failures >= self.config.max_consecutive_failures {
            log::error!(
                "executor.pausing consecutive_failures={failures} pause={:?}",
                self.config.pause_duration
            );
            self.metrics.record_circuit_break();
            self.pause();
            if let Some(executor) = self.self_ref.read().upgrade() {
                tokio::spawn(async move {
                    tokio::time::sleep(executor.config.pause_duration).await;
                    log::info!("executor.auto_resume");
                    executor.resume();
                });
            }
        }
    }

    /// Non-blocking path: push one order through the priority queue.
    pub fn queue_order(
        &self,
        token_id: &str,
        side: Side,
        price: f64,
        size: f64,
        order_type: OrderType,
        priority: OrderPriority,
        market_id: Option<&str>,
        metadata: serde_json::Value,
    ) -> String {
        let mut order = QueuedOrder::new(token_id, side, price, size, order_type, priority)
            .with_metadata(metadata);
        if let Some(market_id) = market_id {
            order = order.with_market(market_id);
        }
        self.queue.enqueue(order)
    }

    /// Direct single-order placement, bypassing the queue.
    pub async fn place_order(
        &self,
        token_id: &str,
        side: Side,
        price: f64,
        size: f64,
        tif: Tif,
    ) -> Result<String, ExchangeError> {
        self.limiter.acquire(1.0).await;
        let placed = self
            .breaker
            .call(self.client.create_limit_order(token_id, side, price, size, tif))
            .await?;
        Ok(placed.order_id)
    }

    pub async fn cancel_order(&self, order_id: &str) -> Result<(), ExchangeError> {
        self.client.cancel_order(order_id).await?;
        if let Some(order) = self.orders.lock().get_mut(order_id) {
            order.status = OrderStatus::Canceled;
        }
        Ok(())
    }

    pub async fn cancel_all(&self) -> Result<u64, ExchangeError> {
        let n = self.client.cancel_all().await?;
        self.orders.lock().clear();
        Ok(n)
    }

    pub async fn get_balance(&self) -> Result<f64, ExchangeError> {
        self.client.get_balance().await
    }

    pub async fn redeem_all(&self, market_id: &str) -> Result<(), ExchangeError> {
        self.client.redeem_all(market_id).await
    }

    /// Post-resolution settlement: releases the market's capital
    /// reservation, books realized P&L into the daily ledger, feeds the
    /// Kelly history and the metrics counters. Fees apply to wins only.
    pub fn settle_position(
        &self,
        market_id: &str,
        pnl: Decimal,
        size_usd: Decimal,
        strategy: Strategy,
        pair_cost: Option<f64>,
    ) {
        let fees = self.capital.calculate_fee(pnl);
        self.capital
            .release(market_id, pnl, fees, Decimal::ZERO, strategy);
        self.daily.record_trade(pnl - fees);
        self.kelly
            .record_trade(strategy, size_usd, pnl, pair_cost, None);
        self.metrics.record_trade(true, size_usd, pnl);
        log::info!(
            "executor.settled market={} strategy={} pnl={} fees={}",
            market_id,
            strategy.as_str(),
            pnl,
            fees
        );
    }

    pub fn get_order(&self, order_id: &str) -> Option<ActiveOrder> {
        self.orders.lock().get(order_id).cloned()
    }
}

#[async_trait]
impl QueueEvents for Executor {
    async fn on_order_complete(&self, order: &QueuedOrder) {
        let Some(placed) = &order.result else { return };
        self.successful_trades.fetch_add(1, Ordering::SeqCst);

        let leg = order
            .metadata
            .get("leg")
            .and_then(|v| v.as_str())
            .and_then(Leg::parse);

        if let (Some(market_id), Some(leg)) = (&order.market_id, leg) {
            self.orders.lock().insert(
                placed.order_id.clone(),
                ActiveOrder {
                    id: placed.order_id.clone(),
                    opportunity_id: order.id.clone(),
                    market_id: market_id.clone(),
                    token_id: order.token_id.clone(),
                    leg,
                    price: order.price,
                    size: order.size,
                    status: OrderStatus::Open,
                    filled_size: 0.0,
                },
            );
            // Sells (reconciliation, liquidation) reduce inventory and are
            // not reconciled through the fill callbacks.
            if order.side == Side::Buy {
                self.fills.track(&placed.order_id, market_id, leg, order.size);
            }
        }
    }

    async fn on_order_failed(&self, order: &QueuedOrder) {
        // The queue has exhausted its retries; count one trade failure.
        log::warn!(
            "executor.queue_order_failed id={} err={}",
            order.id,
            order.error.as_deref().unwrap_or("?")
        );
        self.handle_failure(order.error.as_deref().unwrap_or("queue order failed"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::OpportunityAction;
    use crate::breaker::CircuitBreakerConfig;
    use crate::capital::CapitalConfig;
    use crate::daily_loss::DailyLossConfig;
    use crate::kelly::KellyConfig;
    use crate::order_queue::QueueConfig;
    use crate::rate_limiter::RateLimiterConfig;
    use crate::test_support::MockExchange;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn opportunity() -> Opportunity {
        Opportunity {
            id: "opp-1".into(),
            market_id: "m1".into(),
            question: "Will BTC go up this hour?".into(),
            token_yes_id: "t-yes".into(),
            token_no_id: "t-no".into(),
            best_bid_yes: 0.47,
            best_ask_yes: 0.49,
            best_bid_no: 0.48,
            best_ask_no: 0.50,
            spread_yes: 0.02,
            spread_no: 0.02,
            recommended_price_yes: 0.473,
            recommended_price_no: 0.483,
            volume: 50_000.0,
            liquidity: 20_000.0,
            obi_yes: 0.0,
            obi_no: 0.0,
            score: 4,
            action: OpportunityAction::Trade,
            detected_at: Utc::now(),
        }
    }

    struct Harness {
        client: Arc<MockExchange>,
        capital: Arc<CapitalManager>,
        executor: Arc<Executor>,
    }

    fn harness(config: ExecutorConfig) -> Harness {
        let client = Arc::new(MockExchange::default());
        let limiter = Arc::new(AdaptiveRateLimiter::new(RateLimiterConfig {
            tokens_per_second: 1000.0,
            capacity: 1000.0,
            ..Default::default()
        }));
        let breaker = Arc::new(CircuitBreaker::new(
            "exec-test",
            CircuitBreakerConfig {
                failure_threshold: 100,
                ..Default::default()
            },
        ));
        let queue = Arc::new(OrderQueue::new(
            client.clone(),
            limiter.clone(),
            breaker.clone(),
            QueueConfig::default(),
        ));
        let fills = Arc::new(FillManager::new(client.clone(), Duration::from_secs(2), None));
        let capital = Arc::new(
            CapitalManager::new(
                CapitalConfig {
                    starting_capital: dec!(1000),
                    gabagool_pct: dec!(100),
                    smart_ape_pct: dec!(0),
                    fee_rate: dec!(0.02),
                },
                None,
            )
            .unwrap(),
        );
        let daily = Arc::new(DailyLossManager::new(DailyLossConfig::default(), None));
        let kelly = Arc::new(KellySizer::new(KellyConfig::default(), None));
        let metrics = Arc::new(Metrics::new(None));

        let executor = Arc::new(Executor::new(
            client.clone(),
            queue,
            fills,
            limiter,
            breaker,
            capital.clone(),
            daily,
            kelly,
            metrics,
            config,
            true,
        ));
        *executor.state.write() = ExecutorState::Ready;
        *executor.self_ref.write() = Arc::downgrade(&executor);
        Harness {
            client,
            capital,
            executor,
        }
    }

    fn fast_config() -> ExecutorConfig {
        ExecutorConfig {
            min_time_between_trades: Duration::from_millis(0),
            fill_wait_timeout: Duration::from_millis(50),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn bilateral_success_registers_and_tracks_both_legs() {
        let h = harness(fast_config());
        // Mark both orders matched instantly so the courtesy wait exits.
        let result = h.executor.execute_opportunity(&opportunity()).await;
        assert!(result.success, "err: {:?}", result.error);
        assert!(!result.is_partial());
        assert_eq!(h.client.limit_orders.lock().len(), 2);
        assert_eq!(h.executor.fills.tracked_count(), 2);
        assert_eq!(h.executor.stats().successful, 1);
        // Capital stays reserved while the position is live.
        assert_eq!(h.capital.allocated_total() > dec!(0), true);
    }

    #[tokio::test]
    async fn bilateral_partial_cancels_orphan_leg() {
        let h = harness(fast_config());
        h.client.fail_with(
            "t-no",
            ExchangeError::Transient("NO order rejected".into()),
        );

        let result = h.executor.execute_opportunity(&opportunity()).await;
        assert!(!result.success);
        assert!(result.is_partial());
        assert!(result.order_yes_id.is_some());
        assert!(result.order_no_id.is_none());
        let err = result.error.unwrap();
        assert!(err.contains("NO leg failed"), "err: {err}");

        // Exactly one cancel, for the YES order that made it out.
        let cancels = h.client.cancels.lock().clone();
        assert_eq!(cancels.len(), 1);
        assert_eq!(cancels[0], result.order_yes_id.unwrap());

        // Reservation was refunded.
        assert_eq!(h.capital.allocated_total(), dec!(0));
        assert_eq!(h.capital.balance(), dec!(1000));
    }

    #[tokio::test]
    async fn failed_orphan_cancel_is_surfaced_not_panicked() {
        let h = harness(fast_config());
        h.client.fail_with(
            "t-no",
            ExchangeError::Transient("NO order rejected".into()),
        );
        // The YES order will be mock-0; make its cancel fail too.
        h.client.fail_cancel("mock-0", 1);

        let result = h.executor.execute_opportunity(&opportunity()).await;
        assert!(!result.success);
        assert!(result.is_partial());
        assert!(h.client.cancels.lock().is_empty());
        assert!(h.executor.metrics.snapshot().errors_count >= 1);
    }

    #[tokio::test]
    async fn slippage_check_rejects_before_submission() {
        let h = harness(fast_config());
        let mut opp = opportunity();
        opp.recommended_price_yes = 0.50;
        opp.recommended_price_no = 0.49; // 0.99 > 0.980
        let result = h.executor.execute_opportunity(&opp).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("slippage"));
        assert!(h.client.limit_orders.lock().is_empty());
        assert_eq!(h.capital.balance(), dec!(1000));
    }

    #[tokio::test]
    async fn non_trade_action_is_rejected() {
        let h = harness(fast_config());
        let mut opp = opportunity();
        opp.action = OpportunityAction::Watch;
        let result = h.executor.execute_opportunity(&opp).await;
        assert!(!result.success);
        assert!(h.client.limit_orders.lock().is_empty());
    }

    #[tokio::test]
    async fn consecutive_failures_pause_then_auto_resume() {
        let mut config = fast_config();
        config.max_consecutive_failures = 2;
        config.pause_duration = Duration::from_millis(50);
        let h = harness(config);
        h.client.fail_with("t-yes", ExchangeError::Transient("down".into()));
        h.client.fail_with("t-no", ExchangeError::Transient("down".into()));

        let r1 = h.executor.execute_opportunity(&opportunity()).await;
        assert!(!r1.success);
        assert_eq!(h.executor.state(), ExecutorState::Ready);

        let r2 = h.executor.execute_opportunity(&opportunity()).await;
        assert!(!r2.success);
        assert_eq!(h.executor.state(), ExecutorState::Paused);

        // While paused, can_trade refuses.
        let (ok, reason) = h.executor.can_trade();
        assert!(!ok);
        assert!(reason.contains("not ready"));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(h.executor.state(), ExecutorState::Ready);
        assert_eq!(h.executor.stats().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn min_interval_gates_back_to_back_trades() {
        let mut config = fast_config();
        config.min_time_between_trades = Duration::from_secs(60);
        let h = harness(config);

        let r1 = h.executor.execute_opportunity(&opportunity()).await;
        assert!(r1.success);

        let mut opp2 = opportunity();
        opp2.market_id = "m2".into();
        opp2.token_yes_id = "u-yes".into();
        opp2.token_no_id = "u-no".into();
        let r2 = h.executor.execute_opportunity(&opp2).await;
        assert!(!r2.success);
        assert!(r2.error.unwrap().contains("inter-trade interval"));
    }

    #[tokio::test]
    async fn exposure_cap_blocks_new_trades() {
        let mut config = fast_config();
        config.max_total_exposure = 10.0; // capital_per_trade 25 never fits
        let h = harness(config);
        let result = h.executor.execute_opportunity(&opportunity()).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("max exposure"));
    }

    #[tokio::test]
    async fn daily_block_stops_trading() {
        let h = harness(fast_config());
        h.executor.daily.record_trade(dec!(-100));
        let result = h.executor.execute_opportunity(&opportunity()).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("daily loss limit"));
    }

    #[tokio::test]
    async fn queue_completion_registers_and_tracks_buys_only() {
        let h = harness(fast_config());

        let mut buy = QueuedOrder::new(
            "t-yes",
            Side::Buy,
            0.47,
            10.0,
            OrderType::Gtc,
            OrderPriority::Normal,
        )
        .with_market("m1")
        .with_metadata(json!({"leg": "YES"}));
        buy.result = Some(crate::exchange::PlacedOrder {
            order_id: "x-1".into(),
        });
        buy.status = crate::order_queue::QueueOrderStatus::Completed;
        h.executor.on_order_complete(&buy).await;
        assert!(h.executor.get_order("x-1").is_some());
        assert_eq!(h.executor.fills.tracked_count(), 1);

        let mut sell = QueuedOrder::new(
            "t-yes",
            Side::Sell,
            0.0,
            6.0,
            OrderType::Market,
            OrderPriority::Normal,
        )
        .with_market("m1")
        .with_metadata(json!({"leg": "YES", "reason": "reconciliation"}));
        sell.result = Some(crate::exchange::PlacedOrder {
            order_id: "x-2".into(),
        });
        h.executor.on_order_complete(&sell).await;
        assert!(h.executor.get_order("x-2").is_some());
        // Sells are not fill-tracked.
        assert_eq!(h.executor.fills.tracked_count(), 1);
    }

    #[tokio::test]
    async fn settlement_books_capital_daily_and_kelly() {
        let h = harness(fast_config());
        assert!(h.capital.allocate(dec!(50), "m1", Strategy::Gabagool));

        h.executor
            .settle_position("m1", dec!(5), dec!(50), Strategy::Gabagool, Some(0.96));

        // Principal back plus pnl minus the 2% win fee.
        assert_eq!(h.capital.balance(), dec!(1000) + dec!(5) - dec!(0.10));
        assert_eq!(h.capital.allocated_total(), dec!(0));
        assert_eq!(h.executor.daily.summary().realized_pnl, dec!(4.90));
        assert_eq!(h.executor.kelly.sample_count(Strategy::Gabagool), 1);
        assert_eq!(h.executor.metrics.snapshot().total_profit_usd, dec!(5));
    }
}
