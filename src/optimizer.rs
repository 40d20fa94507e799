//! Periodic recomputation of strategy parameters from market aggregates,
//! engine telemetry and external signals.
//!
//! manual: computes nothing. semi_auto: computes and records a suggestion.
//! full_auto: writes changed values (>1% relative move) into the engine's
//! live configuration.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::engine::AccumulationEngine;
use crate::scanner::Scanner;

const EVENT_RING: usize = 100;
const APPLY_THRESHOLD: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizerMode {
    Manual,
    SemiAuto,
    FullAuto,
}

impl OptimizerMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "manual" => Some(Self::Manual),
            "semi_auto" | "semi-auto" => Some(Self::SemiAuto),
            "full_auto" | "full-auto" => Some(Self::FullAuto),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::SemiAuto => "semi_auto",
            Self::FullAuto => "full_auto",
        }
    }
}

/// External market context. The HTTP/WebSocket sources live outside the
/// core; absent signals fall back to neutral values.
#[async_trait]
pub trait ExternalSignals: Send + Sync {
    /// Crypto volatility index, 0..100.
    async fn volatility_index(&self) -> Option<f64>;
    /// Latest spot price for the given symbol (e.g. "btcusdt").
    async fn spot_price(&self, symbol: &str) -> Option<f64>;
}

#[derive(Debug, Clone, Serialize)]
pub struct MarketConditions {
    pub avg_spread: f64,
    pub avg_volume: f64,
    pub avg_liquidity: f64,
    pub volatility_score: f64,
    pub spot_change_1m_pct: f64,
    pub spot_change_5m_pct: f64,
    pub spot_volatility_1m: f64,
    pub active_positions: usize,
    pub avg_pair_cost: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct OptimizedParams {
    pub max_pair_cost: f64,
    pub min_improvement: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct OptimizationEvent {
    pub timestamp: DateTime<Utc>,
    pub param: String,
    pub old: f64,
    pub new: f64,
    pub reason: String,
}

pub struct AutoOptimizer {
    scanner: Arc<Scanner>,
    engine: Arc<AccumulationEngine>,
    signals: Option<Arc<dyn ExternalSignals>>,
    mode: RwLock<OptimizerMode>,
    interval: tokio::time::Duration,
    spot_history: Mutex<Vec<(DateTime<Utc>, f64)>>,
    events: Mutex<Vec<OptimizationEvent>>,
    total_adjustments: AtomicU64,
    last_suggestion: RwLock<Option<(MarketConditions, OptimizedParams)>>,
    running: AtomicBool,
}

impl AutoOptimizer {
    pub fn new(
        scanner: Arc<Scanner>,
        engine: Arc<AccumulationEngine>,
        signals: Option<Arc<dyn ExternalSignals>>,
        mode: OptimizerMode,
        interval: tokio::time::Duration,
    ) -> Self {
        Self {
            scanner,
            engine,
            signals,
            mode: RwLock::new(mode),
            interval,
            spot_history: Mutex::new(Vec::new()),
            events: Mutex::new(Vec::new()),
            total_adjustments: AtomicU64::new(0),
            last_suggestion: RwLock::new(None),
            running: AtomicBool::new(false),
        }
    }

    pub fn mode(&self) -> OptimizerMode {
        *self.mode.read()
    }

    pub fn set_mode(&self, mode: OptimizerMode) {
        let old = std::mem::replace(&mut *self.mode.write(), mode);
        if old != mode {
            log::info!("optimizer.mode {} -> {}", old.as_str(), mode.as_str());
        }
    }

    pub fn total_adjustments(&self) -> u64 {
        self.total_adjustments.load(Ordering::SeqCst)
    }

    pub fn recent_events(&self) -> Vec<OptimizationEvent> {
        self.events.lock().clone()
    }

    pub fn suggestion(&self) -> Option<(MarketConditions, OptimizedParams)> {
        self.last_suggestion.read().clone()
    }

    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let optimizer = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(optimizer.interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            while optimizer.running.load(Ordering::SeqCst) {
                tick.tick().await;
                optimizer.tick().await;
            }
        });
        log::info!(
            "optimizer.started mode={} interval={:?}",
            self.mode().as_str(),
            self.interval
        );
    }

    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub async fn tick(&self) {
        let mode = self.mode();
        if mode == OptimizerMode::Manual {
            return;
        }
        let conditions = self.collect_conditions().await;
        let params = Self::compute_params(&conditions);

        match mode {
            OptimizerMode::FullAuto => {
                let changes = self.apply(&params, &conditions);
                if !changes.is_empty() {
                    log::info!("optimizer.applied {}", changes.join(", "));
                }
            }
            OptimizerMode::SemiAuto => {
                *self.last_suggestion.write() = Some((conditions, params));
            }
            OptimizerMode::Manual => {}
        }
    }

    pub async fn collect_conditions(&self) -> MarketConditions {
        let (avg_spread, avg_volume, avg_liquidity) = self.scanner.aggregates();
        let engine_stats = self.engine.stats();

        let volatility_score = match &self.signals {
            Some(s) => s.volatility_index().await.unwrap_or(50.0),
            None => 50.0,
        };

        let (change_1m, change_5m, vol_1m) = match &self.signals {
            Some(s) => match s.spot_price("btcusdt").await {
                Some(price) => self.update_spot_history(price),
                None => (0.0, 0.0, 0.0),
            },
            None => (0.0, 0.0, 0.0),
        };

        MarketConditions {
            avg_spread,
            avg_volume,
            avg_liquidity,
            volatility_score,
            spot_change_1m_pct: change_1m,
            spot_change_5m_pct: change_5m,
            spot_volatility_1m: vol_1m,
            active_positions: engine_stats.active_positions,
            avg_pair_cost: engine_stats.avg_pair_cost,
            timestamp: Utc::now(),
        }
    }

    /// Rolls the spot history (10 minutes retained) and derives the 1m/5m
    /// percentage change plus the short-horizon volatility (stdev/mean over
    /// the last minute).
    fn update_spot_history(&self, price: f64) -> (f64, f64, f64) {
        let now = Utc::now();
        let mut history = self.spot_history.lock();
        history.push((now, price));
        let cutoff = now - ChronoDuration::minutes(10);
        history.retain(|(t, _)| *t > cutoff);

        let one_min_ago = now - ChronoDuration::minutes(1);
        let five_min_ago = now - ChronoDuration::minutes(5);

        let pct_from = |past: Option<f64>| match past {
            Some(p) if p > 0.0 => (price - p) / p * 100.0,
            _ => 0.0,
        };
        let change_1m = pct_from(
            history
                .iter()
                .filter(|(t, _)| *t < one_min_ago)
                .map(|(_, p)| *p)
                .next_back(),
        );
        let change_5m = pct_from(
            history
                .iter()
                .filter(|(t, _)| *t < five_min_ago)
                .map(|(_, p)| *p)
                .next_back(),
        );

        let recent: Vec<f64> = history
            .iter()
            .filter(|(t, _)| *t > one_min_ago)
            .map(|(_, p)| *p)
            .collect();
        let vol_1m = if recent.len() >= 3 {
            let mean = recent.iter().sum::<f64>() / recent.len() as f64;
            let variance =
                recent.iter().map(|p| (p - mean).powi(2)).sum::<f64>() / recent.len() as f64;
            if mean > 0.0 {
                variance.sqrt() / mean * 100.0
            } else {
                0.0
            }
        } else {
            0.0
        };

        (change_1m, change_5m, vol_1m)
    }

    /// Parameter rules: the pair-cost cap moves down (stricter) as spreads
    /// widen and volatility rises; the improvement floor rises as the
    /// average pair cost approaches the cap.
    pub fn compute_params(conditions: &MarketConditions) -> OptimizedParams {
        let mut max_pair_cost: f64 = if conditions.avg_spread > 0.15 {
            0.965
        } else if conditions.avg_spread > 0.10 {
            0.970
        } else if conditions.avg_spread < 0.05 {
            0.980
        } else {
            0.975
        };
        if conditions.volatility_score > 70.0 {
            max_pair_cost -= 0.005;
        } else if conditions.volatility_score < 30.0 {
            max_pair_cost += 0.005;
        }
        let max_pair_cost = max_pair_cost.clamp(0.950, 0.985);

        let min_improvement = if conditions.active_positions == 0 {
            0.0
        } else if conditions.avg_pair_cost > 0.98 {
            0.001
        } else if conditions.avg_pair_cost > 0.96 {
            0.002
        } else if conditions.avg_pair_cost > 0.94 {
            0.005
        } else {
            0.008
        };

        OptimizedParams {
            max_pair_cost,
            min_improvement,
        }
    }

    fn apply(&self, params: &OptimizedParams, conditions: &MarketConditions) -> Vec<String> {
        let current = self.engine.params();
        let mut changes = Vec::new();

        let mpc_changed = relative_change(current.max_pair_cost, params.max_pair_cost)
            > APPLY_THRESHOLD;
        if mpc_changed {
            self.engine
                .update_params(|p| p.max_pair_cost = params.max_pair_cost);
            changes.push(format!(
                "max_pair_cost: {:.3} -> {:.3}",
                current.max_pair_cost, params.max_pair_cost
            ));
            self.log_event(
                "max_pair_cost",
                current.max_pair_cost,
                params.max_pair_cost,
                "spread/volatility",
            );
        }

        // Zero crossings always count as a change; a relative threshold is
        // meaningless against a zero baseline.
        let imp_changed = if current.min_improvement == 0.0 || params.min_improvement == 0.0 {
            current.min_improvement != params.min_improvement
        } else {
            relative_change(current.min_improvement, params.min_improvement) > APPLY_THRESHOLD
        };
        if imp_changed {
            self.engine
                .update_params(|p| p.min_improvement = params.min_improvement);
            changes.push(format!(
                "min_improvement: {:.4} -> {:.4}",
                current.min_improvement, params.min_improvement
            ));
            self.log_event(
                "min_improvement",
                current.min_improvement,
                params.min_improvement,
                "position_state",
            );
        }

        if !changes.is_empty() {
            self.total_adjustments
                .fetch_add(changes.len() as u64, Ordering::SeqCst);
        }
        let _ = conditions;
        changes
    }

    fn log_event(&self, param: &str, old: f64, new: f64, reason: &str) {
        let mut events = self.events.lock();
        events.push(OptimizationEvent {
            timestamp: Utc::now(),
            param: param.to_string(),
            old,
            new,
            reason: reason.to_string(),
        });
        let excess = events.len().saturating_sub(EVENT_RING);
        if excess > 0 {
            events.drain(..excess);
        }
    }
}

fn relative_change(old: f64, new: f64) -> f64 {
    if old == 0.0 {
        if new == 0.0 {
            0.0
        } else {
            f64::INFINITY
        }
    } else {
        ((new - old) / old).abs()
    }
}
