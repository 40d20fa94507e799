//! Lead-lag momentum oracle fed by an external spot-trade stream.
//!
//! The wire client pushing ticks in is an external collaborator; this module
//! only keeps a short per-asset price history and derives the 1-second
//! momentum signal the strategy core consumes.

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OracleSignal {
    Buy,
    Sell,
    Neutral,
}

impl Default for OracleSignal {
    fn default() -> Self {
        OracleSignal::Neutral
    }
}

#[derive(Default)]
struct AssetState {
    // (epoch seconds, price), newest last, ~2s retained
    history: VecDeque<(f64, f64)>,
    last_price: f64,
    signal: OracleSignal,
}

pub struct MomentumOracle {
    pump_threshold: f64,
    dump_threshold: f64,
    assets: RwLock<HashMap<String, AssetState>>,
}

impl MomentumOracle {
    pub fn new(pump_threshold: f64, dump_threshold: f64) -> Self {
        Self {
            pump_threshold,
            dump_threshold,
            assets: RwLock::new(HashMap::new()),
        }
    }

    /// Ingest one spot trade (called by the feed wrapper).
    pub fn record_trade(&self, symbol: &str, price: f64, ts: f64) {
        if !(price > 0.0) {
            return;
        }
        let mut assets = self.assets.write();
        let state = assets.entry(symbol.to_ascii_lowercase()).or_default();

        state.last_price = price;
        state.history.push_back((ts, price));
        let cutoff = ts - 2.0;
        while state.history.front().is_some_and(|(t, _)| *t <= cutoff) {
            state.history.pop_front();
        }

        // Percentage change over the last second.
        let target = ts - 1.0;
        let past = state
            .history
            .iter()
            .find(|(t, _)| *t >= target)
            .map(|(_, p)| *p);
        let delta_1s = match past {
            Some(p) if p > 0.0 => (price - p) / p,
            _ => 0.0,
        };

        let new_signal = if delta_1s > self.pump_threshold {
            OracleSignal::Buy
        } else if delta_1s < -self.dump_threshold {
            OracleSignal::Sell
        } else {
            OracleSignal::Neutral
        };

        if new_signal != state.signal && new_signal != OracleSignal::Neutral {
            log::info!(
                "oracle.signal symbol={} signal={:?} delta_1s={:+.3}%",
                symbol,
                new_signal,
                delta_1s * 100.0
            );
        }
        state.signal = new_signal;
    }

    pub fn signal(&self, symbol: &str) -> OracleSignal {
        self.assets
            .read()
            .get(&symbol.to_ascii_lowercase())
            .map(|s| s.signal)
            .unwrap_or(OracleSignal::Neutral)
    }

    pub fn price(&self, symbol: &str) -> Option<f64> {
        self.assets
            .read()
            .get(&symbol.to_ascii_lowercase())
            .map(|s| s.last_price)
            .filter(|p| *p > 0.0)
    }
}

/// Maps a market question to the oracle symbol it references, if any.
pub fn detect_asset(question: &str) -> Option<&'static str> {
    let q = question.to_ascii_lowercase();
    if q.contains("bitcoin") || q.contains("btc") {
        Some("btcusdt")
    } else if q.contains("ethereum") || q.contains("eth") {
        Some("ethusdt")
    } else if q.contains("solana") || q.contains("sol") {
        Some("solusdt")
    } else {
        None
    }
}
