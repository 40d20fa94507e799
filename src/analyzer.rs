//! Opportunity scoring over market snapshots.
//!
//! A snapshot is scored 1..5 from spread, volume, liquidity, market balance,
//! remaining duration, optional external volatility and book depth, then
//! mapped to an advisory action (trade / watch / skip). Opportunities are
//! input for the strategy core, not orders.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::scanner::MarketSnapshot;

const ESTIMATED_FEE_PCT: f64 = 0.02;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OpportunityAction {
    Trade,
    Watch,
    Skip,
}

#[derive(Debug, Clone, Serialize)]
pub struct Opportunity {
    pub id: String,
    pub market_id: String,
    pub question: String,
    pub token_yes_id: String,
    pub token_no_id: String,
    pub best_bid_yes: f64,
    pub best_ask_yes: f64,
    pub best_bid_no: f64,
    pub best_ask_no: f64,
    pub spread_yes: f64,
    pub spread_no: f64,
    pub recommended_price_yes: f64,
    pub recommended_price_no: f64,
    pub volume: f64,
    pub liquidity: f64,
    pub obi_yes: f64,
    pub obi_no: f64,
    pub score: u8,
    pub action: OpportunityAction,
    pub detected_at: DateTime<Utc>,
}

impl Opportunity {
    pub fn effective_spread(&self) -> f64 {
        (self.spread_yes + self.spread_no) / 2.0
    }
}

#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    pub min_spread: f64,
    pub max_spread: f64,
    pub min_volume_usd: f64,
    pub max_duration_hours: f64,
    pub order_offset: f64,
    pub min_depth_usd: f64,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            min_spread: 0.0,
            max_spread: 1.0,
            min_volume_usd: 500.0,
            max_duration_hours: 4.0,
            order_offset: 0.003,
            min_depth_usd: 10.0,
        }
    }
}

pub struct Analyzer {
    config: AnalyzerConfig,
}

impl Analyzer {
    pub fn new(config: AnalyzerConfig) -> Self {
        Self { config }
    }

    /// Scores one snapshot; `None` when the market fails admission
    /// (invalid book, spread band, volume, duration).
    pub fn analyze(
        &self,
        snap: &MarketSnapshot,
        volatility_map: Option<&HashMap<String, f64>>,
    ) -> Option<Opportunity> {
        if !snap.is_valid() {
            return None;
        }

        let effective_spread = snap.effective_spread();
        if effective_spread < self.config.min_spread
            || effective_spread > self.config.max_spread
        {
            return None;
        }
        if snap.market.volume < self.config.min_volume_usd {
            return None;
        }
        let duration_hours = snap.market.hours_until_end()?;
        if duration_hours <= 0.0 || duration_hours > self.config.max_duration_hours {
            return None;
        }

        // Off-best limit prices, clamped into the valid band.
        let recommended_yes =
            (snap.best_bid_yes.unwrap_or(0.0) + self.config.order_offset).clamp(0.01, 0.99);
        let recommended_no =
            (snap.best_bid_no.unwrap_or(0.0) + self.config.order_offset).clamp(0.01, 0.99);

        let score = self.score(snap, effective_spread, duration_hours, volatility_map);
        let action = match score {
            4..=5 => OpportunityAction::Trade,
            3 => OpportunityAction::Watch,
            _ => OpportunityAction::Skip,
        };

        Some(Opportunity {
            id: Uuid::new_v4().to_string()[..8].to_string(),
            market_id: snap.market.id.clone(),
            question: snap.market.question.clone(),
            token_yes_id: snap.market.token_yes_id.clone(),
            token_no_id: snap.market.token_no_id.clone(),
            best_bid_yes: snap.best_bid_yes.unwrap_or(0.0),
            best_ask_yes: snap.best_ask_yes.unwrap_or(0.0),
            best_bid_no: snap.best_bid_no.unwrap_or(0.0),
            best_ask_no: snap.best_ask_no.unwrap_or(0.0),
            spread_yes: snap.spread_yes.unwrap_or(0.0),
            spread_no: snap.spread_no.unwrap_or(0.0),
            recommended_price_yes: recommended_yes,
            recommended_price_no: recommended_no,
            volume: snap.market.volume,
            liquidity: snap.market.liquidity,
            obi_yes: snap.obi_yes,
            obi_no: snap.obi_no,
            score,
            action,
            detected_at: Utc::now(),
        })
    }

    fn score(
        &self,
        snap: &MarketSnapshot,
        effective_spread: f64,
        duration_hours: f64,
        volatility_map: Option<&HashMap<String, f64>>,
    ) -> u8 {
        // Profitability gate: expected capture must clear the fee estimate.
        let potential_profit = effective_spread * 0.5;
        if potential_profit <= ESTIMATED_FEE_PCT {
            return 1;
        }

        let mut total: f64 = 0.0;
        let mut max: f64 = 0.0;

        // External volatility bonus when the question references a ranked
        // asset.
        if let Some(map) = volatility_map {
            let text = snap.market.question.to_uppercase();
            let vol = map
                .iter()
                .find(|(asset, _)| text.contains(&asset.to_uppercase()))
                .map(|(_, v)| *v)
                .unwrap_or(0.0);
            if vol > 0.0 {
                max += 20.0;
                total += if vol >= 5.0 {
                    20.0
                } else if vol >= 3.0 {
                    15.0
                } else if vol >= 1.5 {
                    10.0
                } else {
                    5.0
                };
            }
        }

        // Remaining duration: shorter is better.
        max += 30.0;
        total += if duration_hours <= 1.0 {
            30.0
        } else if duration_hours <= 4.0 {
            25.0
        } else if duration_hours <= 12.0 {
            20.0
        } else if duration_hours <= 24.0 {
            15.0
        } else if duration_hours <= 48.0 {
            10.0
        } else {
            5.0
        };

        max += 25.0;
        total += if effective_spread >= 0.10 {
            25.0
        } else if effective_spread >= 0.08 {
            20.0
        } else if effective_spread >= 0.06 {
            15.0
        } else if effective_spread >= 0.04 {
            10.0
        } else {
            5.0
        };

        max += 25.0;
        let volume = snap.market.volume;
        total += if volume >= 100_000.0 {
            25.0
        } else if volume >= 50_000.0 {
            20.0
        } else if volume >= 20_000.0 {
            15.0
        } else if volume >= 5_000.0 {
            10.0
        } else {
            5.0
        };

        max += 25.0;
        let liquidity = snap.market.liquidity;
        total += if liquidity >= 50_000.0 {
            25.0
        } else if liquidity >= 20_000.0 {
            20.0
        } else if liquidity >= 10_000.0 {
            15.0
        } else if liquidity >= 5_000.0 {
            10.0
        } else {
            5.0
        };

        // Price balance: closer to 0.50 means a livelier market.
        max += 25.0;
        let distance = (snap.market.price_yes - 0.50).abs();
        total += if distance <= 0.10 {
            25.0
        } else if distance <= 0.20 {
            20.0
        } else if distance <= 0.30 {
            15.0
        } else if distance <= 0.40 {
            10.0
        } else {
            5.0
        };

        // Thin top-of-book penalty per leg.
        let mut depth_penalty = 0.0;
        for top in [snap.top_ask_yes, snap.top_ask_no].into_iter().flatten() {
            let (price, size) = top;
            if price * size < self.config.min_depth_usd {
                depth_penalty += 10.0;
            }
        }
        total = (total - depth_penalty).max(0.0);

        let percentage = total / max * 100.0;
        if percentage >= 80.0 {
            5
        } else if percentage >= 60.0 {
            4
        } else if percentage >= 40.0 {
            3
        } else if percentage >= 20.0 {
            2
        } else {
            1
        }
    }

    /// All opportunities sorted best-first.
    pub fn analyze_all(
        &self,
        snapshots: &[MarketSnapshot],
        volatility_map: Option<&HashMap<String, f64>>,
    ) -> Vec<Opportunity> {
        let mut out: Vec<Opportunity> = snapshots
            .iter()
            .filter_map(|s| self.analyze(s, volatility_map))
            .collect();
        out.sort_by(|a, b| {
            b.score
                .cmp(&a.score)
                .then_with(|| {
                    b.effective_spread()
                        .partial_cmp(&a.effective_spread())
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
        });
        out
    }

    /// Event-driven fast path: returns the opportunity only when it is
    /// immediately tradable.
    pub fn analyze_immediate(
        &self,
        snap: &MarketSnapshot,
        volatility_map: Option<&HashMap<String, f64>>,
    ) -> Option<Opportunity> {
        let opp = self.analyze(snap, volatility_map)?;
        (opp.action == OpportunityAction::Trade).then_some(opp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::Market;
    use crate::utils::now_ts;
    use chrono::Duration;

    fn snapshot(spread: f64, volume: f64, liquidity: f64, hours_out: i64) -> MarketSnapshot {
        let mid = 0.50;
        let bid = mid - spread / 2.0;
        let ask = mid + spread / 2.0;
        MarketSnapshot {
            market: Market {
                id: "m1".into(),
                condition_id: "0xc".into(),
                question: "Will BTC go up this hour?".into(),
                token_yes_id: "t-yes".into(),
                token_no_id: "t-no".into(),
                price_yes: 0.50,
                price_no: 0.50,
                volume,
                liquidity,
                end_date: Some(Utc::now() + Duration::hours(hours_out)),
                active: true,
            },
            best_bid_yes: Some(bid),
            best_ask_yes: Some(ask),
            best_bid_no: Some(bid),
            best_ask_no: Some(ask),
            spread_yes: Some(spread),
            spread_no: Some(spread),
            obi_yes: 0.0,
            obi_no: 0.0,
            top_ask_yes: Some((ask, 500.0)),
            top_ask_no: Some((ask, 500.0)),
            updated_at: now_ts(),
        }
    }

    #[test]
    fn strong_market_scores_trade() {
        let a = Analyzer::new(AnalyzerConfig::default());
        let opp = a
            .analyze(&snapshot(0.10, 120_000.0, 60_000.0, 1), None)
            .unwrap();
        assert_eq!(opp.score, 5);
        assert_eq!(opp.action, OpportunityAction::Trade);
        assert!((opp.effective_spread() - 0.10).abs() < 1e-12);
    }

    #[test]
    fn thin_spread_fails_fee_gate() {
        let a = Analyzer::new(AnalyzerConfig::default());
        let opp = a
            .analyze(&snapshot(0.03, 120_000.0, 60_000.0, 1), None)
            .unwrap();
        // 0.03 * 0.5 = 0.015 <= 0.02 estimated fee -> floor score.
        assert_eq!(opp.score, 1);
        assert_eq!(opp.action, OpportunityAction::Skip);
    }

    #[test]
    fn low_volume_is_not_admitted() {
        let a = Analyzer::new(AnalyzerConfig::default());
        assert!(a.analyze(&snapshot(0.10, 100.0, 60_000.0, 1), None).is_none());
    }

    #[test]
    fn long_duration_is_not_admitted() {
        let a = Analyzer::new(AnalyzerConfig::default());
        assert!(a
            .analyze(&snapshot(0.10, 120_000.0, 60_000.0, 48), None)
            .is_none());
    }

    #[test]
    fn one_sided_book_is_not_admitted() {
        let a = Analyzer::new(AnalyzerConfig::default());
        let mut snap = snapshot(0.10, 120_000.0, 60_000.0, 1);
        snap.best_ask_no = None;
        assert!(a.analyze(&snap, None).is_none());
    }

    #[test]
    fn depth_penalty_can_downgrade_action() {
        let a = Analyzer::new(AnalyzerConfig::default());
        // Mediocre-but-tradable setup, then starve the book depth.
        let mut snap = snapshot(0.09, 6_000.0, 15_000.0, 3);
        let strong = a.analyze(&snap, None).unwrap();
        assert_eq!(strong.action, OpportunityAction::Trade);

        snap.top_ask_yes = Some((0.545, 1.0)); // < $10 visible
        snap.top_ask_no = Some((0.545, 1.0));
        let weak = a.analyze(&snap, None).unwrap();
        assert!(weak.score < strong.score);
    }

    #[test]
    fn volatility_bonus_lifts_referenced_assets() {
        let a = Analyzer::new(AnalyzerConfig::default());
        let snap = snapshot(0.07, 30_000.0, 15_000.0, 3);
        let mut vols = HashMap::new();
        vols.insert("BTC".to_string(), 6.0);

        let without = a.analyze(&snap, None).unwrap();
        let with = a.analyze(&snap, Some(&vols)).unwrap();
        assert!(with.score >= without.score);
    }

    #[test]
    fn recommended_prices_are_off_best_and_clamped() {
        let a = Analyzer::new(AnalyzerConfig::default());
        let opp = a
            .analyze(&snapshot(0.10, 120_000.0, 60_000.0, 1), None)
            .unwrap();
        assert!((opp.recommended_price_yes - (opp.best_bid_yes + 0.003)).abs() < 1e-12);
        assert!(opp.recommended_price_yes < opp.best_ask_yes);
    }

    #[test]
    fn analyze_all_sorts_best_first() {
        let a = Analyzer::new(AnalyzerConfig::default());
        let snaps = vec![
            snapshot(0.05, 6_000.0, 6_000.0, 3),
            snapshot(0.10, 120_000.0, 60_000.0, 1),
        ];
        let opps = a.analyze_all(&snaps, None);
        assert_eq!(opps.len(), 2);
        assert!(opps[0].score >= opps[1].score);
    }

    #[test]
    fn immediate_path_only_returns_tradable() {
        let a = Analyzer::new(AnalyzerConfig::default());
        assert!(a
            .analyze_immediate(&snapshot(0.10, 120_000.0, 60_000.0, 1), None)
            .is_some());
        assert!(a
            .analyze_immediate(&snapshot(0.03, 120_000.0, 60_000.0, 1), None)
            .is_none());
    }
}
