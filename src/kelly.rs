//! Fractional-Kelly position sizing from recent trade history.
//!
//! `f* = (p*b - q) / b` with `b = avg_win / avg_loss`; a conservative
//! fraction of that drives a size multiplier clamped to `[0, max_multiplier]`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::capital::Strategy;
use crate::store::{Store, KELLY_FILE};
use crate::utils::dec_to_f64;

const MIN_SAMPLES: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeSample {
    pub timestamp: DateTime<Utc>,
    pub size_usd: Decimal,
    pub pnl_usd: Decimal,
    /// Accumulation strategy context.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pair_cost: Option<f64>,
    /// Short-horizon asymmetric strategy context.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payout_ratio: Option<f64>,
}

impl TradeSample {
    pub fn is_win(&self) -> bool {
        self.pnl_usd > Decimal::ZERO
    }

    pub fn return_pct(&self) -> f64 {
        if self.size_usd == Decimal::ZERO {
            0.0
        } else {
            dec_to_f64(self.pnl_usd / self.size_usd)
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct KellyStats {
    pub strategy: Strategy,
    pub win_rate: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub edge: f64,
    pub kelly_fraction: f64,
    pub recommended_multiplier: f64,
    pub sample_size: usize,
    pub last_updated: DateTime<Utc>,
}

impl KellyStats {
    fn default_for(strategy: Strategy, sample_size: usize) -> Self {
        Self {
            strategy,
            win_rate: 0.0,
            avg_win: 0.0,
            avg_loss: 0.0,
            edge: 0.0,
            kelly_fraction: 0.0,
            recommended_multiplier: 1.0,
            sample_size,
            last_updated: Utc::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct KellyConfig {
    pub fraction: f64,
    pub min_edge: f64,
    pub max_multiplier: f64,
    pub lookback_trades: usize,
}

impl Default for KellyConfig {
    fn default() -> Self {
        Self {
            fraction: 0.25,
            min_edge: 0.02,
            max_multiplier: 2.0,
            lookback_trades: 50,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PersistedKelly {
    gabagool: Vec<TradeSample>,
    smart_ape: Vec<TradeSample>,
}

pub struct KellySizer {
    config: KellyConfig,
    trades: Mutex<HashMap<Strategy, Vec<TradeSample>>>,
    store: Option<Store>,
}

impl KellySizer {
    pub fn new(config: KellyConfig, store: Option<Store>) -> Self {
        let mut trades = HashMap::new();
        let persisted = store
            .as_ref()
            .and_then(|s| s.load::<PersistedKelly>(KELLY_FILE))
            .unwrap_or_default();
        trades.insert(Strategy::Gabagool, persisted.gabagool);
        trades.insert(Strategy::SmartApe, persisted.smart_ape);
        Self {
            config,
            trades: Mutex::new(trades),
            store,
        }
    }

    pub fn record_trade(
        &self,
        strategy: Strategy,
        size_usd: Decimal,
        pnl_usd: Decimal,
        pair_cost: Option<f64>,
        payout_ratio: Option<f64>,
    ) {
        let mut trades = self.trades.lock();
        let ring = trades.entry(strategy).or_default();
        ring.push(TradeSample {
            timestamp: Utc::now(),
            size_usd,
            pnl_usd,
            pair_cost,
            payout_ratio,
        });
        // Bounded ring: keep 2x the lookback, trim to lookback when exceeded.
        if ring.len() > self.config.lookback_trades * 2 {
            let excess = ring.len() - self.config.lookback_trades;
            ring.drain(..excess);
        }
        self.persist(&trades);
    }

    pub fn calculate(&self, strategy: Strategy) -> KellyStats {
        let trades = self.trades.lock();
        let all = trades.get(&strategy).map(Vec::as_slice).unwrap_or(&[]);
        let start = all.len().saturating_sub(self.config.lookback_trades);
        let recent = &all[start..];

        if recent.len() < MIN_SAMPLES {
            return KellyStats::default_for(strategy, recent.len());
        }

        let wins: Vec<&TradeSample> = recent.iter().filter(|t| t.is_win()).collect();
        let losses: Vec<&TradeSample> = recent.iter().filter(|t| !t.is_win()).collect();

        let win_rate = wins.len() as f64 / recent.len() as f64;
        let loss_rate = 1.0 - win_rate;
        let avg_win = if wins.is_empty() {
            0.0
        } else {
            wins.iter().map(|t| t.return_pct()).sum::<f64>() / wins.len() as f64
        };
        let avg_loss = if losses.is_empty() {
            0.0
        } else {
            (losses.iter().map(|t| t.return_pct()).sum::<f64>() / losses.len() as f64).abs()
        };

        let edge = win_rate * avg_win - loss_rate * avg_loss;

        let kelly_fraction = if avg_loss > 0.0 {
            let odds = avg_win / avg_loss;
            if odds > 0.0 {
                (win_rate * odds - loss_rate) / odds
            } else {
                0.0
            }
        } else {
            0.0
        };

        let adjusted = kelly_fraction * self.config.fraction;
        let recommended_multiplier = if edge < self.config.min_edge {
            1.0
        } else if adjusted <= 0.0 {
            0.5
        } else {
            (1.0 + adjusted).min(self.config.max_multiplier)
        };

        KellyStats {
            strategy,
            win_rate,
            avg_win,
            avg_loss,
            edge,
            kelly_fraction,
            recommended_multiplier,
            sample_size: recent.len(),
            last_updated: Utc::now(),
        }
    }

    /// Scales a base USD size by the strategy's current multiplier.
    pub fn size_for(&self, strategy: Strategy, base_size: f64) -> (f64, KellyStats) {
        let stats = self.calculate(strategy);
        (base_size * stats.recommended_multiplier, stats)
    }

    pub fn sample_count(&self, strategy: Strategy) -> usize {
        self.trades
            .lock()
            .get(&strategy)
            .map(Vec::len)
            .unwrap_or(0)
    }

    fn persist(&self, trades: &HashMap<Strategy, Vec<TradeSample>>) {
        if let Some(store) = &self.store {
            let payload = PersistedKelly {
                gabagool: trades.get(&Strategy::Gabagool).cloned().unwrap_or_default(),
                smart_ape: trades.get(&Strategy::SmartApe).cloned().unwrap_or_default(),
            };
            if let Err(e) = store.save(KELLY_FILE, &payload) {
                log::warn!("kelly.persist_error err={e:#}");
            }
        }
    }
}
