//! Virtual/real balance accounting split by strategy.
//!
//! Two layers: legacy global counters and per-strategy pools. Every
//! operation updates both; the invariant `global == sum(pools)` is relied
//! on by the daily-loss manager and the metrics surface.

use std::collections::HashMap;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::store::{Store, CAPITAL_FILE};

const SNAPSHOT_RING: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Strategy {
    Gabagool,
    SmartApe,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Gabagool => "gabagool",
            Strategy::SmartApe => "smart_ape",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StrategyPool {
    pub starting: Decimal,
    pub balance: Decimal,
    pub allocated: HashMap<String, Decimal>,
    pub unrealized_pnl: HashMap<String, Decimal>,
    pub realized_pnl: Decimal,
    pub fees_paid: Decimal,
    pub slippage_cost: Decimal,
    pub trades_count: u64,
}

impl StrategyPool {
    fn with_starting(starting: Decimal) -> Self {
        Self {
            starting,
            balance: starting,
            ..Default::default()
        }
    }

    pub fn allocated_total(&self) -> Decimal {
        self.allocated.values().copied().sum()
    }

    pub fn unrealized_total(&self) -> Decimal {
        self.unrealized_pnl.values().copied().sum()
    }

    pub fn equity(&self) -> Decimal {
        self.balance + self.allocated_total() + self.unrealized_total()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapitalSnapshot {
    pub timestamp: DateTime<Utc>,
    pub balance: Decimal,
    pub allocated: Decimal,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub fees_paid: Decimal,
    pub slippage_cost: Decimal,
    pub total_equity: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CapitalState {
    starting: Decimal,
    balance: Decimal,
    allocated: HashMap<String, Decimal>,
    realized_pnl: Decimal,
    fees_paid: Decimal,
    slippage_cost: Decimal,
    trades_count: u64,
    gabagool: StrategyPool,
    smart_ape: StrategyPool,
}

#[derive(Debug, Clone)]
pub struct CapitalConfig {
    pub starting_capital: Decimal,
    pub gabagool_pct: Decimal,
    pub smart_ape_pct: Decimal,
    /// Exchange fee rate applied to winnings only.
    pub fee_rate: Decimal,
}

pub struct CapitalManager {
    fee_rate: Decimal,
    inner: Mutex<Inner>,
    store: Option<Store>,
}

struct Inner {
    state: CapitalState,
    snapshots: Vec<CapitalSnapshot>,
}

impl CapitalManager {
    pub fn new(config: CapitalConfig, store: Option<Store>) -> Result<Self> {
        if config.gabagool_pct + config.smart_ape_pct != Decimal::ONE_HUNDRED {
            bail!(
                "strategy capital split must sum to 100 (gabagool={} smart_ape={})",
                config.gabagool_pct,
                config.smart_ape_pct
            );
        }

        let state = store
            .as_ref()
            .and_then(|s| s.load::<CapitalState>(CAPITAL_FILE))
            .unwrap_or_else(|| {
                let gabagool_start =
                    config.starting_capital * config.gabagool_pct / Decimal::ONE_HUNDRED;
                let smart_ape_start =
                    config.starting_capital * config.smart_ape_pct / Decimal::ONE_HUNDRED;
                CapitalState {
                    starting: config.starting_capital,
                    balance: config.starting_capital,
                    allocated: HashMap::new(),
                    realized_pnl: Decimal::ZERO,
                    fees_paid: Decimal::ZERO,
                    slippage_cost: Decimal::ZERO,
                    trades_count: 0,
                    gabagool: StrategyPool::with_starting(gabagool_start),
                    smart_ape: StrategyPool::with_starting(smart_ape_start),
                }
            });

        Ok(Self {
            fee_rate: config.fee_rate,
            inner: Mutex::new(Inner {
                state,
                snapshots: Vec::new(),
            }),
            store,
        })
    }

    fn pool_mut(state: &mut CapitalState, strategy: Strategy) -> &mut StrategyPool {
        match strategy {
            Strategy::Gabagool => &mut state.gabagool,
            Strategy::SmartApe => &mut state.smart_ape,
        }
    }

    fn pool(state: &CapitalState, strategy: Strategy) -> &StrategyPool {
        match strategy {
            Strategy::Gabagool => &state.gabagool,
            Strategy::SmartApe => &state.smart_ape,
        }
    }

    pub fn is_strategy_enabled(&self, strategy: Strategy) -> bool {
        let inner = self.inner.lock();
        Self::pool(&inner.state, strategy).starting > Decimal::ZERO
    }

    /// Debits the strategy pool for one market. Refuses double allocation
    /// for the same market within a strategy and over-allocation beyond the
    /// pool's balance.
    pub fn allocate(&self, amount: Decimal, market_id: &str, strategy: Strategy) -> bool {
        if amount <= Decimal::ZERO {
            return false;
        }
        let mut inner = self.inner.lock();
        let pool = Self::pool_mut(&mut inner.state, strategy);

        if pool.starting <= Decimal::ZERO {
            log::debug!("capital.allocate_rejected strategy={} reason=disabled", strategy.as_str());
            return false;
        }
        if pool.allocated.contains_key(market_id) {
            log::warn!(
                "capital.double_allocation market={} strategy={}",
                market_id,
                strategy.as_str()
            );
            return false;
        }
        if pool.balance < amount {
            log::debug!(
                "capital.allocate_rejected strategy={} reason=insufficient balance={} amount={}",
                strategy.as_str(),
                pool.balance,
                amount
            );
            return false;
        }

        pool.balance -= amount;
        pool.allocated.insert(market_id.to_string(), amount);

        inner.state.balance -= amount;
        *inner
            .state
            .allocated
            .entry(market_id.to_string())
            .or_insert(Decimal::ZERO) += amount;

        log::info!(
            "capital.allocated market={} strategy={} amount={}",
            market_id,
            strategy.as_str(),
            amount
        );
        true
    }

    /// Closes an allocation: credits back principal plus P&L minus costs,
    /// books realized P&L, pops the allocation entry and snapshots.
    pub fn release(
        &self,
        market_id: &str,
        pnl: Decimal,
        fees: Decimal,
        slippage: Decimal,
        strategy: Strategy,
    ) -> bool {
        let mut inner = self.inner.lock();
        let pool = Self::pool_mut(&mut inner.state, strategy);

        let Some(allocated) = pool.allocated.remove(market_id) else {
            log::warn!(
                "capital.release_unknown market={} strategy={}",
                market_id,
                strategy.as_str()
            );
            return false;
        };

        let credit = allocated + pnl - fees - slippage;
        pool.balance += credit;
        pool.realized_pnl += pnl;
        pool.fees_paid += fees;
        pool.slippage_cost += slippage;
        pool.trades_count += 1;
        pool.unrealized_pnl.remove(market_id);

        inner.state.balance += credit;
        inner.state.realized_pnl += pnl;
        inner.state.fees_paid += fees;
        inner.state.slippage_cost += slippage;
        inner.state.trades_count += 1;
        if let Some(total) = inner.state.allocated.get_mut(market_id) {
            *total -= allocated;
            if *total <= Decimal::ZERO {
                inner.state.allocated.remove(market_id);
            }
        }

        log::info!(
            "capital.released market={} strategy={} pnl={} fees={} slippage={}",
            market_id,
            strategy.as_str(),
            pnl,
            fees,
            slippage
        );

        let snap = Self::snapshot_of(&inner.state);
        inner.snapshots.push(snap);
        if inner.snapshots.len() > SNAPSHOT_RING {
            inner.snapshots.remove(0);
        }

        self.persist(&inner.state);
        true
    }

    pub fn update_unrealized_pnl(&self, market_id: &str, value: Decimal, strategy: Strategy) {
        let mut inner = self.inner.lock();
        let pool = Self::pool_mut(&mut inner.state, strategy);
        pool.unrealized_pnl.insert(market_id.to_string(), value);
    }

    /// Exchange fee policy: fee rate applied to positive P&L only.
    pub fn calculate_fee(&self, pnl: Decimal) -> Decimal {
        self.fee_rate * pnl.max(Decimal::ZERO)
    }

    pub fn balance(&self) -> Decimal {
        self.inner.lock().state.balance
    }

    pub fn allocated_total(&self) -> Decimal {
        self.inner.lock().state.allocated.values().copied().sum()
    }

    pub fn unrealized_total(&self) -> Decimal {
        let inner = self.inner.lock();
        inner.state.gabagool.unrealized_total() + inner.state.smart_ape.unrealized_total()
    }

    pub fn realized_pnl(&self) -> Decimal {
        self.inner.lock().state.realized_pnl
    }

    pub fn total_equity(&self) -> Decimal {
        let inner = self.inner.lock();
        let unrealized =
            inner.state.gabagool.unrealized_total() + inner.state.smart_ape.unrealized_total();
        inner.state.balance + inner.state.allocated.values().copied().sum::<Decimal>() + unrealized
    }

    pub fn strategy_pool(&self, strategy: Strategy) -> StrategyPool {
        let inner = self.inner.lock();
        Self::pool(&inner.state, strategy).clone()
    }

    pub fn last_snapshot(&self) -> Option<CapitalSnapshot> {
        self.inner.lock().snapshots.last().cloned()
    }

    fn snapshot_of(state: &CapitalState) -> CapitalSnapshot {
        let allocated: Decimal = state.allocated.values().copied().sum();
        let unrealized =
            state.gabagool.unrealized_total() + state.smart_ape.unrealized_total();
        CapitalSnapshot {
            timestamp: Utc::now(),
            balance: state.balance,
            allocated,
            realized_pnl: state.realized_pnl,
            unrealized_pnl: unrealized,
            fees_paid: state.fees_paid,
            slippage_cost: state.slippage_cost,
            total_equity: state.balance + allocated + unrealized,
        }
    }

    fn persist(&self, state: &CapitalState) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save(CAPITAL_FILE, state) {
                log::warn!("capital.persist_error err={e:#}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn manager() -> CapitalManager {
        CapitalManager::new(
            CapitalConfig {
                starting_capital: dec!(1000),
                gabagool_pct: dec!(60),
                smart_ape_pct: dec!(40),
                fee_rate: dec!(0.02),
            },
            None,
        )
        .unwrap()
    }

    fn assert_consistent(m: &CapitalManager) {
        let g = m.strategy_pool(Strategy::Gabagool);
        let s = m.strategy_pool(Strategy::SmartApe);
        assert_eq!(m.balance(), g.balance + s.balance);
        assert_eq!(m.allocated_total(), g.allocated_total() + s.allocated_total());
        assert_eq!(m.realized_pnl(), g.realized_pnl + s.realized_pnl);
    }

    #[test]
    fn split_must_sum_to_100() {
        let bad = CapitalManager::new(
            CapitalConfig {
                starting_capital: dec!(1000),
                gabagool_pct: dec!(70),
                smart_ape_pct: dec!(40),
                fee_rate: dec!(0.02),
            },
            None,
        );
        assert!(bad.is_err());
    }

    #[test]
    fn allocate_release_round_trip() {
        let m = manager();
        assert_eq!(m.strategy_pool(Strategy::Gabagool).balance, dec!(600));

        assert!(m.allocate(dec!(50), "m1", Strategy::Gabagool));
        assert_eq!(m.strategy_pool(Strategy::Gabagool).balance, dec!(550));
        assert_eq!(m.allocated_total(), dec!(50));
        assert_consistent(&m);

        assert!(m.release("m1", dec!(5), dec!(0.10), dec!(0.05), Strategy::Gabagool));
        assert_eq!(
            m.strategy_pool(Strategy::Gabagool).balance,
            dec!(550) + dec!(50) + dec!(5) - dec!(0.10) - dec!(0.05)
        );
        assert_eq!(m.realized_pnl(), dec!(5));
        assert_eq!(m.allocated_total(), dec!(0));
        assert_eq!(m.strategy_pool(Strategy::Gabagool).trades_count, 1);
        assert_consistent(&m);

        let snap = m.last_snapshot().unwrap();
        assert_eq!(snap.total_equity, snap.balance + snap.allocated + snap.unrealized_pnl);
    }

    #[test]
    fn no_double_allocation_per_market_and_strategy() {
        let m = manager();
        assert!(m.allocate(dec!(50), "m1", Strategy::Gabagool));
        assert!(!m.allocate(dec!(50), "m1", Strategy::Gabagool));
        // A different strategy may hold the same market.
        assert!(m.allocate(dec!(50), "m1", Strategy::SmartApe));
        assert_consistent(&m);
    }

    #[test]
    fn insufficient_pool_is_rejected_without_side_effect() {
        let m = manager();
        assert!(!m.allocate(dec!(700), "m1", Strategy::Gabagool));
        assert_eq!(m.balance(), dec!(1000));
        assert!(!m.allocate(dec!(-5), "m2", Strategy::Gabagool));
        assert_consistent(&m);
    }

    #[test]
    fn disabled_strategy_rejects_allocation() {
        let m = CapitalManager::new(
            CapitalConfig {
                starting_capital: dec!(1000),
                gabagool_pct: dec!(100),
                smart_ape_pct: dec!(0),
                fee_rate: dec!(0.02),
            },
            None,
        )
        .unwrap();
        assert!(!m.is_strategy_enabled(Strategy::SmartApe));
        assert!(!m.allocate(dec!(10), "m1", Strategy::SmartApe));
    }

    #[test]
    fn fee_applies_to_wins_only() {
        let m = manager();
        assert_eq!(m.calculate_fee(dec!(10)), dec!(0.20));
        assert_eq!(m.calculate_fee(dec!(-10)), dec!(0));
    }

    #[test]
    fn equity_identity_holds_with_unrealized() {
        let m = manager();
        m.allocate(dec!(100), "m1", Strategy::Gabagool);
        m.update_unrealized_pnl("m1", dec!(7.5), Strategy::Gabagool);
        assert_eq!(m.total_equity(), m.balance() + m.allocated_total() + dec!(7.5));
    }

    #[test]
    fn state_persists_and_reloads() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        let cfg = CapitalConfig {
            starting_capital: dec!(1000),
            gabagool_pct: dec!(60),
            smart_ape_pct: dec!(40),
            fee_rate: dec!(0.02),
        };

        let m = CapitalManager::new(cfg.clone(), Some(store.clone())).unwrap();
        m.allocate(dec!(50), "m1", Strategy::Gabagool);
        m.release("m1", dec!(3), dec!(0.06), dec!(0), Strategy::Gabagool);

        let revived = CapitalManager::new(cfg, Some(store)).unwrap();
        assert_eq!(revived.realized_pnl(), dec!(3));
        assert_eq!(revived.strategy_pool(Strategy::Gabagool).trades_count, 1);
    }
}
