//! Accumulation strategy core.
//!
//! Per market, inventory is accumulated on both outcome legs until
//! `avg_price(YES) + avg_price(NO)` drops under the configured cap with
//! both legs covered, at which point the payout at resolution exceeds total
//! cost regardless of outcome and the position is locked.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::capital::Strategy;
use crate::executor::Executor;
use crate::fill_manager::{FillSink, Leg};
use crate::indicators::rsi;
use crate::kelly::KellySizer;
use crate::lifecycle::Metrics;
use crate::oracle::{detect_asset, MomentumOracle, OracleSignal};
use crate::order_queue::{OrderPriority, OrderType};
use crate::scanner::MarketSnapshot;
use crate::exchange::Side;
use crate::store::{Store, POSITIONS_FILE};
use crate::utils::{dec, dec_to_f64};

const PRICE_HISTORY_CAP: usize = 100;

#[derive(Debug, Clone)]
pub struct EngineParams {
    pub max_pair_cost: f64,
    pub min_improvement: f64,
    pub order_size_usd: f64,
    pub max_position_usd: f64,
    pub balance_ratio_threshold: f64,
    pub kill_switch_minutes: i64,
    pub rsi_period: usize,
    pub rsi_overbought: f64,
    pub rsi_oversold: f64,
    pub trend_filter_enabled: bool,
    pub kelly_enabled: bool,
    pub reconcile_threshold_shares: f64,
}

impl Default for EngineParams {
    fn default() -> Self {
        Self {
            max_pair_cost: 0.975,
            min_improvement: 0.0,
            order_size_usd: 25.0,
            max_position_usd: 500.0,
            balance_ratio_threshold: 1.5,
            kill_switch_minutes: 20,
            rsi_period: 14,
            rsi_overbought: 70.0,
            rsi_oversold: 30.0,
            trend_filter_enabled: true,
            kelly_enabled: false,
            reconcile_threshold_shares: 2.0,
        }
    }
}

/// One accumulation position. Money fields are decimals; prices cross the
/// boundary once, in `apply_fill` and the hypothetical-cost math.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub market_id: String,
    pub question: String,
    pub token_yes_id: String,
    pub token_no_id: String,
    pub qty_yes: Decimal,
    pub cost_yes: Decimal,
    pub qty_no: Decimal,
    pub cost_no: Decimal,
    pub pending_qty_yes: Decimal,
    pub pending_cost_yes: Decimal,
    pub pending_qty_no: Decimal,
    pub pending_cost_no: Decimal,
    pub is_locked: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    pub fn new(
        market_id: impl Into<String>,
        question: impl Into<String>,
        token_yes_id: impl Into<String>,
        token_no_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            market_id: market_id.into(),
            question: question.into(),
            token_yes_id: token_yes_id.into(),
            token_no_id: token_no_id.into(),
            qty_yes: Decimal::ZERO,
            cost_yes: Decimal::ZERO,
            qty_no: Decimal::ZERO,
            cost_no: Decimal::ZERO,
            pending_qty_yes: Decimal::ZERO,
            pending_cost_yes: Decimal::ZERO,
            pending_qty_no: Decimal::ZERO,
            pending_cost_no: Decimal::ZERO,
            is_locked: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn avg_price_yes(&self) -> Option<Decimal> {
        (self.qty_yes > Decimal::ZERO).then(|| self.cost_yes / self.qty_yes)
    }

    pub fn avg_price_no(&self) -> Option<Decimal> {
        (self.qty_no > Decimal::ZERO).then(|| self.cost_no / self.qty_no)
    }

    /// Combined average acquisition price; 2.0 sentinel while a leg is
    /// missing (not tradable toward a lock yet).
    pub fn pair_cost(&self) -> Decimal {
        match (self.avg_price_yes(), self.avg_price_no()) {
            (Some(yes), Some(no)) => yes + no,
            _ => Decimal::TWO,
        }
    }

    pub fn total_cost(&self) -> Decimal {
        self.cost_yes + self.cost_no
    }

    pub fn hedged_qty(&self) -> Decimal {
        self.qty_yes.min(self.qty_no)
    }

    /// Guaranteed payout minus cost once locked (hedged shares pay 1.00).
    pub fn locked_profit(&self) -> Decimal {
        if self.is_locked {
            self.hedged_qty() - self.total_cost()
        } else {
            Decimal::ZERO
        }
    }

    pub fn has_pending(&self) -> bool {
        self.pending_qty_yes > Decimal::ZERO || self.pending_qty_no > Decimal::ZERO
    }

    /// Locks when the pair cost is under the cap and the hedged payout
    /// covers the total cost. Never unlocks.
    pub fn check_and_lock(&mut self, max_pair_cost: Decimal) -> bool {
        if !self.is_locked
            && self.pair_cost() < max_pair_cost
            && self.hedged_qty() > self.total_cost()
        {
            self.is_locked = true;
            return true;
        }
        false
    }

    /// Confirmed fill: pending moves to real, clamped at zero so that
    /// out-of-order callbacks cannot drive pending negative.
    pub fn apply_fill(&mut self, leg: Leg, qty: Decimal, price: Decimal) {
        let cost = qty * price;
        match leg {
            Leg::Yes => {
                self.qty_yes += qty;
                self.cost_yes += cost;
                self.pending_qty_yes = (self.pending_qty_yes - qty).max(Decimal::ZERO);
                self.pending_cost_yes = (self.pending_cost_yes - cost).max(Decimal::ZERO);
            }
            Leg::No => {
                self.qty_no += qty;
                self.cost_no += cost;
                self.pending_qty_no = (self.pending_qty_no - qty).max(Decimal::ZERO);
                self.pending_cost_no = (self.pending_cost_no - cost).max(Decimal::ZERO);
            }
        }
        self.updated_at = Utc::now();
    }

    /// Terminal order event: the unfilled remainder leaves pending.
    pub fn apply_order_end(&mut self, leg: Leg, remaining: Decimal) {
        let (pending_qty, pending_cost) = match leg {
            Leg::Yes => (&mut self.pending_qty_yes, &mut self.pending_cost_yes),
            Leg::No => (&mut self.pending_qty_no, &mut self.pending_cost_no),
        };
        let old_qty = *pending_qty;
        let new_qty = (old_qty - remaining).max(Decimal::ZERO);
        *pending_qty = new_qty;
        *pending_cost = if old_qty > Decimal::ZERO {
            (*pending_cost * new_qty / old_qty).max(Decimal::ZERO)
        } else {
            Decimal::ZERO
        };
        self.updated_at = Utc::now();
    }
}

/// Per-snapshot input for one market; prices are current best asks.
#[derive(Debug, Clone)]
pub struct SnapshotInput {
    pub market_id: String,
    pub question: String,
    pub token_yes_id: String,
    pub token_no_id: String,
    pub price_yes: f64,
    pub price_no: f64,
    pub obi_yes: f64,
    pub obi_no: f64,
}

impl SnapshotInput {
    pub fn from_snapshot(snap: &MarketSnapshot) -> Option<Self> {
        Some(Self {
            market_id: snap.market.id.clone(),
            question: snap.market.question.clone(),
            token_yes_id: snap.market.token_yes_id.clone(),
            token_no_id: snap.market.token_no_id.clone(),
            price_yes: snap.best_ask_yes?,
            price_no: snap.best_ask_no?,
            obi_yes: snap.obi_yes,
            obi_no: snap.obi_no,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Buy { leg: Leg, size_usd: f64, price: f64 },
    Liquidated,
    Hold,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub active_positions: usize,
    pub locked_positions: usize,
    pub total_locked_profit: Decimal,
    pub best_pair_cost: f64,
    pub avg_pair_cost: f64,
}

pub struct AccumulationEngine {
    params: RwLock<EngineParams>,
    executor: Arc<Executor>,
    kelly: Arc<KellySizer>,
    metrics: Arc<Metrics>,
    oracle: Option<Arc<MomentumOracle>>,
    positions: Mutex<HashMap<String, Position>>,
    price_history: Mutex<HashMap<String, Vec<f64>>>,
    store: Option<Store>,
    running: AtomicBool,
    maintenance_interval: tokio::time::Duration,
}

impl AccumulationEngine {
    pub fn new(
        executor: Arc<Executor>,
        kelly: Arc<KellySizer>,
        metrics: Arc<Metrics>,
        oracle: Option<Arc<MomentumOracle>>,
        params: EngineParams,
        store: Option<Store>,
    ) -> Self {
        let positions = store
            .as_ref()
            .and_then(|s| s.load::<HashMap<String, Position>>(POSITIONS_FILE))
            .unwrap_or_default();
        if !positions.is_empty() {
            log::info!("engine.loaded positions={}", positions.len());
        }
        Self {
            params: RwLock::new(params),
            executor,
            kelly,
            metrics,
            oracle,
            positions: Mutex::new(positions),
            price_history: Mutex::new(HashMap::new()),
            store,
            running: AtomicBool::new(false),
            maintenance_interval: tokio::time::Duration::from_secs(60),
        }
    }

    pub fn params(&self) -> EngineParams {
        self.params.read().clone()
    }

    /// Live-config mutation point for the auto-optimizer.
    pub fn update_params(&self, f: impl FnOnce(&mut EngineParams)) {
        let mut params = self.params.write();
        f(&mut params);
    }

    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(engine.maintenance_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The immediate first tick would reconcile before any fills.
            tick.tick().await;
            while engine.running.load(Ordering::SeqCst) {
                tick.tick().await;
                engine.maintenance_tick().await;
            }
        });
        log::info!(
            "engine.started positions={} max_pair_cost={}",
            self.positions.lock().len(),
            self.params.read().max_pair_cost
        );
    }

    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.persist();
        log::info!("engine.shutdown positions_saved={}", self.positions.lock().len());
    }

    pub fn active_market_ids(&self) -> HashSet<String> {
        self.positions.lock().keys().cloned().collect()
    }

    pub fn position(&self, market_id: &str) -> Option<Position> {
        self.positions.lock().get(market_id).cloned()
    }

    pub fn stats(&self) -> EngineStats {
        let positions = self.positions.lock();
        let active: Vec<&Position> = positions.values().filter(|p| !p.is_locked).collect();
        let locked: Vec<&Position> = positions.values().filter(|p| p.is_locked).collect();
        let pair_costs: Vec<f64> = active
            .iter()
            .map(|p| dec_to_f64(p.pair_cost()))
            .filter(|c| *c < 2.0)
            .collect();
        EngineStats {
            active_positions: active.len(),
            locked_positions: locked.len(),
            total_locked_profit: locked.iter().map(|p| p.locked_profit()).sum(),
            best_pair_cost: pair_costs.iter().copied().fold(1.0, f64::min),
            avg_pair_cost: if pair_costs.is_empty() {
                1.0
            } else {
                pair_costs.iter().sum::<f64>() / pair_costs.len() as f64
            },
        }
    }

    /// Per-snapshot decision: kill switch, admission, candidate evaluation,
    /// veto filters, balance preference, then at most one buy.
    pub async fn on_snapshot(&self, input: &SnapshotInput) -> Decision {
        let params = self.params();
        self.push_mid_history(input);

        // Kill switch first: an unlocked position past its age cap is
        // liquidated regardless of anything else this tick.
        if let Some(expired) = self.take_expired_position(input, &params) {
            self.liquidate(expired, "kill_switch").await;
            return Decision::Liquidated;
        }

        let Some((leg, size_usd, price, qty)) = self.decide(input, &params) else {
            return Decision::Hold;
        };

        let token_id = match leg {
            Leg::Yes => input.token_yes_id.clone(),
            Leg::No => input.token_no_id.clone(),
        };
        self.executor.queue_order(
            &token_id,
            Side::Buy,
            price,
            qty,
            OrderType::Gtc,
            OrderPriority::Normal,
            Some(&input.market_id),
            json!({ "leg": leg.as_str() }),
        );
        log::info!(
            "engine.buy market={} leg={} px={:.4} usd={:.2}",
            input.market_id,
            leg.as_str(),
            price,
            size_usd
        );
        Decision::Buy {
            leg,
            size_usd,
            price,
        }
    }

    fn push_mid_history(&self, input: &SnapshotInput) {
        // Mid proxy over both legs' asks.
        let mid = (input.price_yes + (1.0 - input.price_no)) / 2.0;
        let mut history = self.price_history.lock();
        let ticks = history.entry(input.market_id.clone()).or_default();
        ticks.push(mid);
        if ticks.len() > PRICE_HISTORY_CAP {
            let excess = ticks.len() - PRICE_HISTORY_CAP;
            ticks.drain(..excess);
        }
    }

    fn take_expired_position(
        &self,
        input: &SnapshotInput,
        params: &EngineParams,
    ) -> Option<Position> {
        let mut positions = self.positions.lock();
        let position = positions.get(&input.market_id)?;
        if position.is_locked {
            return None;
        }
        let age = Utc::now() - position.created_at;
        if age > ChronoDuration::minutes(params.kill_switch_minutes) {
            let expired = positions.remove(&input.market_id);
            drop(positions);
            self.persist();
            return expired;
        }
        None
    }

    /// Decision step; mutates the position's pending amounts when a buy is
    /// chosen (before the order leaves, to prevent double-ordering).
    fn decide(
        &self,
        input: &SnapshotInput,
        params: &EngineParams,
    ) -> Option<(Leg, f64, f64, f64)> {
        if !(input.price_yes > 0.0 && input.price_no > 0.0) {
            return None;
        }

        let mut positions = self.positions.lock();

        if !positions.contains_key(&input.market_id) {
            // Admission: only open a position while the combined asks leave
            // room under the cap.
            if input.price_yes + input.price_no >= params.max_pair_cost {
                return None;
            }
            self.metrics.record_position_opened();
            log::info!(
                "engine.open market={} pair_ask={:.4}",
                input.market_id,
                input.price_yes + input.price_no
            );
            positions.insert(
                input.market_id.clone(),
                Position::new(
                    &input.market_id,
                    &input.question,
                    &input.token_yes_id,
                    &input.token_no_id,
                ),
            );
        }
        let position = positions.get_mut(&input.market_id)?;

        if position.is_locked {
            return None;
        }

        let mut size_usd = params.order_size_usd;
        if params.kelly_enabled {
            let (scaled, _) = self.kelly.size_for(Strategy::Gabagool, size_usd);
            size_usd = scaled;
        }

        // Position budget, counting in-flight cost.
        let committed = position.total_cost()
            + position.pending_cost_yes
            + position.pending_cost_no;
        if dec_to_f64(committed) + size_usd > params.max_position_usd {
            return None;
        }

        let size = dec(size_usd);
        let py = dec(input.price_yes);
        let pn = dec(input.price_no);
        let current_pair_cost = position.pair_cost();

        // Hypothetical pair cost per candidate. An empty opposite leg is
        // priced at its current ask, which is what the follow-up buy would
        // roughly pay.
        let hyp_yes = {
            let new_qty = position.qty_yes + size / py;
            let new_avg = (position.cost_yes + size) / new_qty;
            new_avg + position.avg_price_no().unwrap_or(pn)
        };
        let hyp_no = {
            let new_qty = position.qty_no + size / pn;
            let new_avg = (position.cost_no + size) / new_qty;
            position.avg_price_yes().unwrap_or(py) + new_avg
        };

        let improvement_yes = current_pair_cost - hyp_yes;
        let improvement_no = current_pair_cost - hyp_no;
        let min_improvement = dec(params.min_improvement);
        let max_pair_cost = dec(params.max_pair_cost);

        let mut buy_yes = improvement_yes > min_improvement && hyp_yes < max_pair_cost;
        let mut buy_no = improvement_no > min_improvement && hyp_no < max_pair_cost;

        // Lead-lag oracle: a strong spot move on the referenced asset
        // forces the aligned leg and forbids fading it.
        if let Some(oracle) = &self.oracle {
            if let Some(asset) = detect_asset(&input.question) {
                match oracle.signal(asset) {
                    OracleSignal::Buy => {
                        buy_yes = true;
                        buy_no = false;
                    }
                    OracleSignal::Sell => {
                        buy_no = true;
                        buy_yes = false;
                    }
                    OracleSignal::Neutral => {}
                }
            }
        }

        // Book-pressure veto: do not fade heavy bid pressure on a leg.
        if input.obi_yes > 0.3 {
            buy_no = false;
        }
        if input.obi_no > 0.3 {
            buy_yes = false;
        }

        // Trend veto from RSI on the mid history.
        if params.trend_filter_enabled {
            let history = self.price_history.lock();
            if let Some(value) = history
                .get(&input.market_id)
                .and_then(|ticks| rsi(ticks, params.rsi_period))
            {
                if value > params.rsi_overbought {
                    buy_no = false;
                }
                if value < params.rsi_oversold {
                    buy_yes = false;
                }
            }
        }

        let ratio = dec_to_f64((position.qty_yes + Decimal::ONE) / (position.qty_no + Decimal::ONE));
        let threshold = params.balance_ratio_threshold;

        let leg = match (buy_yes, buy_no) {
            (true, true) => {
                if ratio > threshold {
                    Leg::No
                } else if 1.0 / ratio > threshold {
                    Leg::Yes
                } else if improvement_yes > improvement_no {
                    Leg::Yes
                } else {
                    Leg::No
                }
            }
            // A lone candidate must not worsen the balance past the cap.
            (true, false) if ratio < threshold => Leg::Yes,
            (false, true) if 1.0 / ratio < threshold => Leg::No,
            _ => return None,
        };

        let price = match leg {
            Leg::Yes => input.price_yes,
            Leg::No => input.price_no,
        };
        let qty = ((size_usd / price) * 100.0).round() / 100.0;
        let qty_dec = dec(qty);
        let cost_dec = qty_dec * dec(price);
        match leg {
            Leg::Yes => {
                position.pending_qty_yes += qty_dec;
                position.pending_cost_yes += cost_dec;
            }
            Leg::No => {
                position.pending_qty_no += qty_dec;
                position.pending_cost_no += cost_dec;
            }
        }
        position.updated_at = Utc::now();
        drop(positions);
        self.persist();

        Some((leg, size_usd, price, qty))
    }

    /// Market-sells all real inventory and drops the position.
    async fn liquidate(&self, position: Position, reason: &str) {
        log::warn!(
            "engine.liquidate market={} reason={} qty_yes={} qty_no={}",
            position.market_id,
            reason,
            position.qty_yes,
            position.qty_no
        );
        for (leg, token, qty) in [
            (Leg::Yes, &position.token_yes_id, position.qty_yes),
            (Leg::No, &position.token_no_id, position.qty_no),
        ] {
            if qty > Decimal::ZERO {
                self.executor.queue_order(
                    token,
                    Side::Sell,
                    0.0,
                    dec_to_f64(qty),
                    OrderType::Market,
                    OrderPriority::Urgent,
                    Some(&position.market_id),
                    json!({ "leg": leg.as_str(), "reason": reason }),
                );
            }
        }
        self.metrics.record_position_closed();
    }

    /// Once-a-minute maintenance: best-effort redemption of resolved
    /// markets and inventory-balance reconciliation.
    pub async fn maintenance_tick(&self) {
        let snapshot: Vec<Position> = self.positions.lock().values().cloned().collect();
        if snapshot.is_empty() {
            return;
        }

        // Redemption in parallel; failures are silently ignored.
        let mut redeems = Vec::with_capacity(snapshot.len());
        for position in &snapshot {
            let executor = Arc::clone(&self.executor);
            let market_id = position.market_id.clone();
            redeems.push(tokio::spawn(async move {
                let _ = executor.redeem_all(&market_id).await;
            }));
        }
        for handle in redeems {
            let _ = handle.await;
        }

        let threshold = dec(self.params.read().reconcile_threshold_shares);
        for position in snapshot {
            if position.has_pending() {
                continue;
            }
            let balance = position.qty_yes - position.qty_no;
            if balance.abs() <= threshold {
                continue;
            }
            let (leg, token) = if balance > Decimal::ZERO {
                (Leg::Yes, position.token_yes_id.clone())
            } else {
                (Leg::No, position.token_no_id.clone())
            };
            let excess = dec_to_f64(balance.abs());
            log::warn!(
                "engine.reconcile market={} sell_leg={} excess={:.2}",
                position.market_id,
                leg.as_str(),
                excess
            );
            self.executor.queue_order(
                &token,
                Side::Sell,
                0.0,
                excess,
                OrderType::Market,
                OrderPriority::High,
                Some(&position.market_id),
                json!({ "leg": leg.as_str(), "reason": "reconciliation" }),
            );
        }
    }

    fn persist(&self) {
        if let Some(store) = &self.store {
            let positions = self.positions.lock().clone();
            if let Err(e) = store.save(POSITIONS_FILE, &positions) {
                log::warn!("engine.persist_error err={e:#}");
            }
        }
    }
}

#[async_trait]
impl FillSink for AccumulationEngine {
    async fn on_fill(&self, market_id: &str, leg: Leg, qty: f64, price: f64) {
        let max_pair_cost = dec(self.params.read().max_pair_cost);
        let locked_profit = {
            let mut positions = self.positions.lock();
            let Some(position) = positions.get_mut(market_id) else {
                return;
            };
            position.apply_fill(leg, dec(qty), dec(price));
            log::info!(
                "engine.fill market={} leg={} qty=+{:.2} px={:.4} pair_cost={}",
                market_id,
                leg.as_str(),
                qty,
                price,
                position.pair_cost()
            );
            position
                .check_and_lock(max_pair_cost)
                .then(|| position.locked_profit())
        };
        if let Some(profit) = locked_profit {
            log::info!("engine.locked market={} profit={}", market_id, profit);
            self.metrics.record_position_locked(profit);
        }
        self.persist();
    }

    async fn on_order_end(&self, market_id: &str, leg: Leg, remaining: f64) {
        {
            let mut positions = self.positions.lock();
            let Some(position) = positions.get_mut(market_id) else {
                return;
            };
            position.apply_order_end(leg, dec(remaining));
        }
        self.persist();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::{CircuitBreaker, CircuitBreakerConfig};
    use crate::capital::{CapitalConfig, CapitalManager};
    use crate::daily_loss::{DailyLossConfig, DailyLossManager};
    use crate::executor::ExecutorConfig;
    use crate::fill_manager::FillManager;
    use crate::kelly::KellyConfig;
    use crate::order_queue::{OrderQueue, QueueConfig};
    use crate::rate_limiter::{AdaptiveRateLimiter, RateLimiterConfig};
    use crate::test_support::MockExchange;
    use rust_decimal_macros::dec as d;

    struct Harness {
        client: Arc<MockExchange>,
        queue: Arc<OrderQueue>,
        engine: Arc<AccumulationEngine>,
    }

    fn harness_with(params: EngineParams, store: Option<Store>) -> Harness {
        let client = Arc::new(MockExchange::default());
        let limiter = Arc::new(AdaptiveRateLimiter::new(RateLimiterConfig {
            tokens_per_second: 1000.0,
            capacity: 1000.0,
            ..Default::default()
        }));
        let breaker = Arc::new(CircuitBreaker::new(
            "engine-test",
            CircuitBreakerConfig::default(),
        ));
        let queue = Arc::new(OrderQueue::new(
            client.clone(),
            limiter.clone(),
            breaker.clone(),
            QueueConfig::default(),
        ));
        let fills = Arc::new(FillManager::new(
            client.clone(),
            tokio::time::Duration::from_secs(2),
            None,
        ));
        let capital = Arc::new(
            CapitalManager::new(
                CapitalConfig {
                    starting_capital: d!(1000),
                    gabagool_pct: d!(100),
                    smart_ape_pct: d!(0),
                    fee_rate: d!(0.02),
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
            queue.clone(),
            fills,
            limiter,
            breaker,
            capital,
            daily,
            kelly.clone(),
            metrics.clone(),
            ExecutorConfig::default(),
            true,
        ));
        let engine = Arc::new(AccumulationEngine::new(
            executor,
            kelly,
            metrics,
            None,
            params,
            store,
        ));
        Harness {
            client,
            queue,
            engine,
        }
    }

    fn harness() -> Harness {
        harness_with(EngineParams::default(), None)
    }

    fn input(py: f64, pn: f64) -> SnapshotInput {
        SnapshotInput {
            market_id: "m1".into(),
            question: "Will BTC close above 100k this hour?".into(),
            token_yes_id: "t-yes".into(),
            token_no_id: "t-no".into(),
            price_yes: py,
            price_no: pn,
            obi_yes: 0.0,
            obi_no: 0.0,
        }
    }

    fn seeded_position() -> Position {
        Position::new("m1", "Will BTC close above 100k this hour?", "t-yes", "t-no")
    }

    #[tokio::test]
    async fn lock_transition_at_exact_numbers() {
        let h = harness();
        let mut pos = seeded_position();
        pos.qty_yes = d!(100);
        pos.cost_yes = d!(48.0);
        h.engine.positions.lock().insert("m1".into(), pos);

        h.engine.on_fill("m1", Leg::No, 100.0, 0.49).await;

        let pos = h.engine.position("m1").unwrap();
        assert_eq!(pos.pair_cost(), d!(0.97));
        assert_eq!(pos.hedged_qty(), d!(100));
        assert_eq!(pos.total_cost(), d!(97.00));
        assert!(pos.is_locked);
        assert_eq!(pos.locked_profit(), d!(3.00));
        assert_eq!(h.engine.metrics.snapshot().positions_locked, 1);
    }

    #[tokio::test]
    async fn locked_never_unlocks_and_never_buys() {
        let h = harness();
        let mut pos = seeded_position();
        pos.qty_yes = d!(100);
        pos.cost_yes = d!(48);
        pos.qty_no = d!(100);
        pos.cost_no = d!(49);
        pos.is_locked = true;
        h.engine.positions.lock().insert("m1".into(), pos);

        // A terrible fill cannot unlock it.
        h.engine.on_fill("m1", Leg::Yes, 10.0, 0.99).await;
        let pos = h.engine.position("m1").unwrap();
        assert!(pos.is_locked);

        assert_eq!(h.engine.on_snapshot(&input(0.48, 0.49)).await, Decision::Hold);
        assert!(h.queue.pending_orders().is_empty());
    }

    #[tokio::test]
    async fn kill_switch_liquidates_old_unlocked_position() {
        let h = harness();
        let mut pos = seeded_position();
        pos.qty_yes = d!(50);
        pos.cost_yes = d!(24);
        pos.created_at = Utc::now() - ChronoDuration::minutes(21);
        h.engine.positions.lock().insert("m1".into(), pos);

        let decision = h.engine.on_snapshot(&input(0.48, 0.49)).await;
        assert_eq!(decision, Decision::Liquidated);
        assert!(h.engine.position("m1").is_none());

        // One urgent market sell for the YES inventory, nothing else.
        let pending = h.queue.pending_orders();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].side, Side::Sell);
        assert_eq!(pending[0].order_type, OrderType::Market);
        assert_eq!(pending[0].size, 50.0);
        assert_eq!(pending[0].metadata["reason"], "kill_switch");
    }

    #[tokio::test]
    async fn fresh_young_position_is_not_killed() {
        let h = harness();
        let mut pos = seeded_position();
        pos.qty_yes = d!(50);
        pos.cost_yes = d!(24);
        h.engine.positions.lock().insert("m1".into(), pos);

        let decision = h.engine.on_snapshot(&input(0.48, 0.49)).await;
        assert_ne!(decision, Decision::Liquidated);
        assert!(h.engine.position("m1").is_some());
    }

    #[tokio::test]
    async fn admission_requires_pair_under_cap() {
        let h = harness();
        assert_eq!(h.engine.on_snapshot(&input(0.52, 0.49)).await, Decision::Hold);
        assert!(h.engine.position("m1").is_none());

        match h.engine.on_snapshot(&input(0.48, 0.49)).await {
            Decision::Buy { size_usd, .. } => assert_eq!(size_usd, 25.0),
            other => panic!("expected buy, got {other:?}"),
        }
        let pos = h.engine.position("m1").unwrap();
        assert!(pos.has_pending());
        assert_eq!(h.queue.pending_orders().len(), 1);
    }

    #[tokio::test]
    async fn accumulates_to_lock_across_two_decisions() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        let h = harness_with(EngineParams::default(), Some(store.clone()));

        let first = h.engine.on_snapshot(&input(0.48, 0.49)).await;
        let Decision::Buy { leg: leg1, size_usd, price: p1 } = first else {
            panic!("expected first buy, got {first:?}");
        };
        let qty1 = ((size_usd / p1) * 100.0).round() / 100.0;
        h.engine.on_fill("m1", leg1, qty1, p1).await;

        let second = h.engine.on_snapshot(&input(0.48, 0.49)).await;
        let Decision::Buy { leg: leg2, size_usd: s2, price: p2 } = second else {
            panic!("expected second buy, got {second:?}");
        };
        assert_ne!(leg1, leg2, "balance preference must pick the other leg");
        let qty2 = ((s2 / p2) * 100.0).round() / 100.0;
        h.engine.on_fill("m1", leg2, qty2, p2).await;

        let pos = h.engine.position("m1").unwrap();
        assert!(pos.is_locked, "pair_cost={}", pos.pair_cost());
        assert!(pos.pair_cost() <= d!(0.975));
        assert!(!pos.has_pending());

        // Persisted state reflects the lock.
        let saved: HashMap<String, Position> = store.load(POSITIONS_FILE).unwrap();
        assert!(saved["m1"].is_locked);
        assert!(saved["m1"].pair_cost() <= d!(0.975));
    }

    #[tokio::test]
    async fn obi_pressure_vetoes_fading_leg() {
        let h = harness();
        let mut snap = input(0.48, 0.49);
        snap.obi_yes = 0.4; // heavy YES bid pressure: do not buy NO
        match h.engine.on_snapshot(&snap).await {
            Decision::Buy { leg, .. } => assert_eq!(leg, Leg::Yes),
            other => panic!("expected buy yes, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rsi_vetoes_knife_catching_and_shorting() {
        let h = harness();
        // Strong downtrend: do not buy YES.
        h.engine.price_history.lock().insert(
            "m1".into(),
            (0..30).map(|i| 0.90 - i as f64 * 0.01).collect(),
        );
        match h.engine.on_snapshot(&input(0.48, 0.49)).await {
            Decision::Buy { leg, .. } => assert_eq!(leg, Leg::No),
            other => panic!("expected buy no, got {other:?}"),
        }

        // Strong uptrend on a fresh market: do not buy NO.
        let h = harness();
        h.engine.price_history.lock().insert(
            "m1".into(),
            (0..30).map(|i| 0.10 + i as f64 * 0.01).collect(),
        );
        match h.engine.on_snapshot(&input(0.48, 0.49)).await {
            Decision::Buy { leg, .. } => assert_eq!(leg, Leg::Yes),
            other => panic!("expected buy yes, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn oracle_signal_forces_aligned_leg() {
        let oracle = Arc::new(MomentumOracle::new(0.003, 0.003));
        let t = crate::utils::now_ts();
        oracle.record_trade("btcusdt", 100_000.0, t - 0.9);
        oracle.record_trade("btcusdt", 100_500.0, t);
        assert_eq!(oracle.signal("btcusdt"), OracleSignal::Buy);

        let h = harness();
        let engine = Arc::new(AccumulationEngine::new(
            h.engine.executor.clone(),
            h.engine.kelly.clone(),
            h.engine.metrics.clone(),
            Some(oracle),
            EngineParams {
                trend_filter_enabled: false,
                ..Default::default()
            },
            None,
        ));
        match engine.on_snapshot(&input(0.48, 0.49)).await {
            Decision::Buy { leg, .. } => assert_eq!(leg, Leg::Yes),
            other => panic!("expected forced yes, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn pending_is_clamped_at_zero() {
        let h = harness();
        let mut pos = seeded_position();
        pos.pending_qty_yes = d!(10);
        pos.pending_cost_yes = d!(5);
        h.engine.positions.lock().insert("m1".into(), pos);

        // More remainder reported than pending: clamp, don't go negative.
        h.engine.on_order_end("m1", Leg::Yes, 15.0).await;
        let pos = h.engine.position("m1").unwrap();
        assert_eq!(pos.pending_qty_yes, Decimal::ZERO);
        assert_eq!(pos.pending_cost_yes, Decimal::ZERO);

        // A late fill still lands on the real side.
        h.engine.on_fill("m1", Leg::Yes, 4.0, 0.50).await;
        let pos = h.engine.position("m1").unwrap();
        assert_eq!(pos.qty_yes, d!(4));
        assert_eq!(pos.pending_qty_yes, Decimal::ZERO);
    }

    #[tokio::test]
    async fn partial_order_end_scales_pending_cost() {
        let h = harness();
        let mut pos = seeded_position();
        pos.pending_qty_yes = d!(10);
        pos.pending_cost_yes = d!(5);
        h.engine.positions.lock().insert("m1".into(), pos);

        h.engine.on_order_end("m1", Leg::Yes, 4.0).await;
        let pos = h.engine.position("m1").unwrap();
        assert_eq!(pos.pending_qty_yes, d!(6));
        assert_eq!(pos.pending_cost_yes, d!(3));
    }

    #[tokio::test]
    async fn reconciliation_sells_the_excess_leg() {
        let h = harness();
        let mut pos = seeded_position();
        pos.qty_yes = d!(10);
        pos.cost_yes = d!(4.8);
        pos.qty_no = d!(4);
        pos.cost_no = d!(2.0);
        h.engine.positions.lock().insert("m1".into(), pos);

        h.engine.maintenance_tick().await;

        let pending = h.queue.pending_orders();
        assert_eq!(pending.len(), 1);
        let order = &pending[0];
        assert_eq!(order.side, Side::Sell);
        assert_eq!(order.order_type, OrderType::Market);
        assert_eq!(order.token_id, "t-yes");
        assert_eq!(order.size, 6.0);
        assert_eq!(order.metadata["reason"], "reconciliation");

        // Redemption was attempted for the active market.
        assert_eq!(h.client.redeems.lock().clone(), vec!["m1".to_string()]);
    }

    #[tokio::test]
    async fn reconciliation_waits_for_inflight_orders_and_tolerance() {
        let h = harness();
        let mut pos = seeded_position();
        pos.qty_yes = d!(10);
        pos.qty_no = d!(4);
        pos.pending_qty_no = d!(6); // in flight: hands off
        h.engine.positions.lock().insert("m1".into(), pos);
        h.engine.maintenance_tick().await;
        assert!(h.queue.pending_orders().is_empty());

        let mut pos = seeded_position();
        pos.qty_yes = d!(10);
        pos.qty_no = d!(9); // |balance| = 1 <= 2 shares
        h.engine.positions.lock().insert("m1".into(), pos);
        h.engine.maintenance_tick().await;
        assert!(h.queue.pending_orders().is_empty());
    }

    #[tokio::test]
    async fn position_budget_caps_further_buys() {
        let h = harness_with(
            EngineParams {
                max_position_usd: 40.0,
                ..Default::default()
            },
            None,
        );
        let mut pos = seeded_position();
        pos.qty_yes = d!(50);
        pos.cost_yes = d!(24);
        pos.qty_no = d!(1);
        pos.cost_no = d!(0.5);
        h.engine.positions.lock().insert("m1".into(), pos);

        // 24.5 committed + 25 order > 40 cap.
        assert_eq!(h.engine.on_snapshot(&input(0.48, 0.49)).await, Decision::Hold);
    }

    #[tokio::test]
    async fn position_round_trips_through_persistence() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        let h = harness_with(EngineParams::default(), Some(store.clone()));

        let mut pos = seeded_position();
        pos.qty_yes = d!(51.02);
        pos.cost_yes = d!(24.4896);
        pos.pending_qty_no = d!(51.02);
        pos.pending_cost_no = d!(25);
        h.engine.positions.lock().insert("m1".into(), pos.clone());
        h.engine.persist();

        let h2 = harness_with(EngineParams::default(), Some(store));
        let loaded = h2.engine.position("m1").unwrap();
        assert_eq!(loaded, pos);
    }
}
