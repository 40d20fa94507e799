//! Daily realized+unrealized loss tracking with trading throttles.
//!
//! Loss ratio against `min(max_daily_loss_usd, pct * capital)` drives a
//! four-state ladder: normal, reduced, warning, blocked. The day rolls at a
//! configured UTC hour; completed days are archived (last 30 kept).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{Datelike, Duration as ChronoDuration, TimeZone, Utc};
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::store::{Store, DAILY_STATS_FILE};
use crate::utils::dec_to_f64;

const HISTORY_DAYS: usize = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DailyLossStatus {
    Normal,
    Reduced,
    Warning,
    Blocked,
}

impl DailyLossStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DailyLossStatus::Normal => "normal",
            DailyLossStatus::Reduced => "reduced",
            DailyLossStatus::Warning => "warning",
            DailyLossStatus::Blocked => "blocked",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DayStats {
    pub date: String,
    pub starting_balance: Decimal,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub trades: u64,
    pub wins: u64,
    pub losses: u64,
    pub largest_win: Decimal,
    pub largest_loss: Decimal,
    pub blocked_at: Option<String>,
}

impl DayStats {
    fn fresh(date: String, starting_balance: Decimal) -> Self {
        Self {
            date,
            starting_balance,
            realized_pnl: Decimal::ZERO,
            unrealized_pnl: Decimal::ZERO,
            trades: 0,
            wins: 0,
            losses: 0,
            largest_win: Decimal::ZERO,
            largest_loss: Decimal::ZERO,
            blocked_at: None,
        }
    }

    pub fn total_pnl(&self) -> Decimal {
        self.realized_pnl + self.unrealized_pnl
    }

    pub fn win_rate(&self) -> f64 {
        if self.trades == 0 {
            0.0
        } else {
            self.wins as f64 / self.trades as f64 * 100.0
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedDaily {
    current: DayStats,
    history: Vec<DayStats>,
}

#[derive(Debug, Clone)]
pub struct DailyLossConfig {
    pub max_daily_loss_usd: Decimal,
    pub max_daily_loss_pct: Decimal,
    pub total_capital: Decimal,
    pub reset_hour_utc: u32,
    pub warning_threshold: f64,
    pub reduction_threshold: f64,
}

impl Default for DailyLossConfig {
    fn default() -> Self {
        Self {
            max_daily_loss_usd: Decimal::ONE_HUNDRED,
            max_daily_loss_pct: Decimal::TEN,
            total_capital: Decimal::new(1000, 0),
            reset_hour_utc: 0,
            warning_threshold: 0.7,
            reduction_threshold: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DailySummary {
    pub status: DailyLossStatus,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub current_loss: Decimal,
    pub loss_limit: Decimal,
    pub loss_pct_of_limit: f64,
    pub position_size_multiplier: f64,
    pub trades: u64,
    pub win_rate: f64,
    pub can_trade: bool,
}

struct State {
    stats: DayStats,
    history: Vec<DayStats>,
    status: DailyLossStatus,
}

type StatusCallback = Box<dyn Fn(DailyLossStatus) + Send + Sync>;

pub struct DailyLossManager {
    config: DailyLossConfig,
    inner: Mutex<State>,
    on_status_change: RwLock<Option<StatusCallback>>,
    store: Option<Store>,
    running: AtomicBool,
}

impl DailyLossManager {
    pub fn new(config: DailyLossConfig, store: Option<Store>) -> Self {
        let today = Self::today_str();
        let loaded = store
            .as_ref()
            .and_then(|s| s.load::<PersistedDaily>(DAILY_STATS_FILE));

        let (mut stats, mut history) = match loaded {
            Some(p) => (p.current, p.history),
            None => (
                DayStats::fresh(today.clone(), config.total_capital),
                Vec::new(),
            ),
        };

        // A restart across midnight archives the stale day.
        if stats.date != today {
            if stats.trades > 0 {
                history.push(stats.clone());
            }
            stats = DayStats::fresh(today, config.total_capital);
        }

        let mut mgr = State {
            stats,
            history,
            status: DailyLossStatus::Normal,
        };
        mgr.status = Self::status_for(&config, &mgr.stats);

        Self {
            config,
            inner: Mutex::new(mgr),
            on_status_change: RwLock::new(None),
            store,
            running: AtomicBool::new(false),
        }
    }

    fn today_str() -> String {
        Utc::now().format("%Y-%m-%d").to_string()
    }

    pub fn set_on_status_change(&self, cb: StatusCallback) {
        *self.on_status_change.write() = Some(cb);
    }

    pub fn effective_limit(&self) -> Decimal {
        let pct_limit = self.config.max_daily_loss_pct / Decimal::ONE_HUNDRED
            * self.config.total_capital;
        self.config.max_daily_loss_usd.min(pct_limit)
    }

    fn current_loss_of(stats: &DayStats) -> Decimal {
        let pnl = stats.total_pnl();
        if pnl < Decimal::ZERO {
            -pnl
        } else {
            Decimal::ZERO
        }
    }

    fn status_for(config: &DailyLossConfig, stats: &DayStats) -> DailyLossStatus {
        let pct_limit =
            config.max_daily_loss_pct / Decimal::ONE_HUNDRED * config.total_capital;
        let limit = config.max_daily_loss_usd.min(pct_limit);
        if limit <= Decimal::ZERO {
            return DailyLossStatus::Normal;
        }
        let ratio = dec_to_f64(Self::current_loss_of(stats) / limit);
        if ratio >= 1.0 {
            DailyLossStatus::Blocked
        } else if ratio >= config.warning_threshold {
            DailyLossStatus::Warning
        } else if ratio >= config.reduction_threshold {
            DailyLossStatus::Reduced
        } else {
            DailyLossStatus::Normal
        }
    }

    pub fn status(&self) -> DailyLossStatus {
        self.inner.lock().status
    }

    pub fn current_loss(&self) -> Decimal {
        Self::current_loss_of(&self.inner.lock().stats)
    }

    pub fn can_trade(&self) -> (bool, String) {
        let inner = self.inner.lock();
        if inner.status == DailyLossStatus::Blocked {
            let loss = Self::current_loss_of(&inner.stats);
            (
                false,
                format!(
                    "daily loss limit reached ({loss}/{})",
                    self.effective_limit()
                ),
            )
        } else {
            (true, String::new())
        }
    }

    /// Size throttle: 1.0 normal, shrinking toward 0.25 while reduced,
    /// 0.75 in warning, 0 when blocked.
    pub fn position_size_multiplier(&self) -> f64 {
        let inner = self.inner.lock();
        match inner.status {
            DailyLossStatus::Blocked => 0.0,
            DailyLossStatus::Warning => 0.75,
            DailyLossStatus::Reduced => {
                let limit = self.effective_limit();
                if limit <= Decimal::ZERO {
                    return 1.0;
                }
                let ratio = dec_to_f64(Self::current_loss_of(&inner.stats) / limit);
                (1.0 - ratio).max(0.25)
            }
            DailyLossStatus::Normal => 1.0,
        }
    }

    pub fn record_trade(&self, pnl: Decimal) {
        let mut inner = self.inner.lock();
        inner.stats.realized_pnl += pnl;
        inner.stats.trades += 1;
        if pnl >= Decimal::ZERO {
            inner.stats.wins += 1;
            if pnl > inner.stats.largest_win {
                inner.stats.largest_win = pnl;
            }
        } else {
            inner.stats.losses += 1;
            if pnl < inner.stats.largest_loss {
                inner.stats.largest_loss = pnl;
            }
        }

        let previous = inner.status;
        inner.status = Self::status_for(&self.config, &inner.stats);
        if inner.status == DailyLossStatus::Blocked && inner.stats.blocked_at.is_none() {
            inner.stats.blocked_at = Some(Utc::now().to_rfc3339());
        }

        log::info!(
            "daily.trade pnl={:+} day_pnl={:+} status={}",
            pnl,
            inner.stats.realized_pnl,
            inner.status.as_str()
        );

        let changed = (inner.status != previous).then_some(inner.status);
        self.persist(&inner);
        drop(inner);

        if let Some(status) = changed {
            log::warn!("daily.status_change status={}", status.as_str());
            if let Some(cb) = self.on_status_change.read().as_ref() {
                cb(status);
            }
        }
    }

    pub fn update_unrealized(&self, unrealized: Decimal) {
        let mut inner = self.inner.lock();
        inner.stats.unrealized_pnl = unrealized;
        inner.status = Self::status_for(&self.config, &inner.stats);
    }

    /// Archives the finished day and starts a fresh one. Called by the reset
    /// loop at the configured hour and defensively on load.
    pub fn roll_day(&self) {
        let mut inner = self.inner.lock();
        let finished = std::mem::replace(
            &mut inner.stats,
            DayStats::fresh(Self::today_str(), self.config.total_capital),
        );
        if finished.trades > 0 {
            inner.history.push(finished);
            let excess = inner.history.len().saturating_sub(HISTORY_DAYS);
            if excess > 0 {
                inner.history.drain(..excess);
            }
        }
        let previous = inner.status;
        inner.status = DailyLossStatus::Normal;
        self.persist(&inner);
        log::info!("daily.reset");
        let changed = (previous != DailyLossStatus::Normal).then_some(DailyLossStatus::Normal);
        drop(inner);
        if changed.is_some() {
            if let Some(cb) = self.on_status_change.read().as_ref() {
                cb(DailyLossStatus::Normal);
            }
        }
    }

    pub fn history_len(&self) -> usize {
        self.inner.lock().history.len()
    }

    pub fn summary(&self) -> DailySummary {
        let inner = self.inner.lock();
        let limit = self.effective_limit();
        let loss = Self::current_loss_of(&inner.stats);
        let pct = if limit > Decimal::ZERO {
            dec_to_f64(loss / limit) * 100.0
        } else {
            0.0
        };
        let multiplier = match inner.status {
            DailyLossStatus::Blocked => 0.0,
            DailyLossStatus::Warning => 0.75,
            DailyLossStatus::Reduced => {
                if limit > Decimal::ZERO {
                    (1.0 - dec_to_f64(loss / limit)).max(0.25)
                } else {
                    1.0
                }
            }
            DailyLossStatus::Normal => 1.0,
        };
        DailySummary {
            status: inner.status,
            realized_pnl: inner.stats.realized_pnl,
            unrealized_pnl: inner.stats.unrealized_pnl,
            current_loss: loss,
            loss_limit: limit,
            loss_pct_of_limit: pct,
            position_size_multiplier: multiplier,
            trades: inner.stats.trades,
            win_rate: inner.stats.win_rate(),
            can_trade: inner.status != DailyLossStatus::Blocked,
        }
    }

    /// Background task sleeping until the configured UTC reset hour.
    pub fn start_reset_loop(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let mgr = Arc::clone(self);
        tokio::spawn(async move {
            while mgr.running.load(Ordering::SeqCst) {
                let wait = mgr.seconds_until_reset();
                tokio::time::sleep(tokio::time::Duration::from_secs_f64(wait)).await;
                if mgr.running.load(Ordering::SeqCst) {
                    mgr.roll_day();
                }
            }
        });
    }

    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn seconds_until_reset(&self) -> f64 {
        let now = Utc::now();
        let mut next = Utc
            .with_ymd_and_hms(
                now.year(),
                now.month(),
                now.day(),
                self.config.reset_hour_utc,
                0,
                0,
            )
            .single()
            .unwrap_or(now);
        if next <= now {
            next += ChronoDuration::days(1);
        }
        (next - now).num_milliseconds().max(1000) as f64 / 1000.0
    }

    fn persist(&self, state: &State) {
        if let Some(store) = &self.store {
            let payload = PersistedDaily {
                current: state.stats.clone(),
                history: state.history.clone(),
            };
            if let Err(e) = store.save(DAILY_STATS_FILE, &payload) {
                log::warn!("daily.persist_error err={e:#}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn manager() -> DailyLossManager {
        DailyLossManager::new(
            DailyLossConfig {
                max_daily_loss_usd: dec!(100),
                max_daily_loss_pct: dec!(10),
                total_capital: dec!(1000),
                reset_hour_utc: 0,
                warning_threshold: 0.7,
                reduction_threshold: 0.5,
            },
            None,
        )
    }

    #[test]
    fn effective_limit_is_min_of_usd_and_pct() {
        let m = manager();
        // 10% of 1000 == 100 == usd cap
        assert_eq!(m.effective_limit(), dec!(100));

        let tight = DailyLossManager::new(
            DailyLossConfig {
                max_daily_loss_usd: dec!(100),
                max_daily_loss_pct: dec!(5),
                total_capital: dec!(1000),
                ..DailyLossConfig::default()
            },
            None,
        );
        assert_eq!(tight.effective_limit(), dec!(50));
    }

    #[test]
    fn status_ladder_follows_loss_ratio() {
        let m = manager();
        assert_eq!(m.status(), DailyLossStatus::Normal);
        assert_eq!(m.position_size_multiplier(), 1.0);

        m.record_trade(dec!(-40));
        assert_eq!(m.status(), DailyLossStatus::Normal);

        m.record_trade(dec!(-20)); // 60% of limit
        assert_eq!(m.status(), DailyLossStatus::Reduced);
        let mult = m.position_size_multiplier();
        assert!((mult - 0.4).abs() < 1e-9, "got {mult}");

        m.record_trade(dec!(-15)); // 75%
        assert_eq!(m.status(), DailyLossStatus::Warning);
        assert_eq!(m.position_size_multiplier(), 0.75);
    }

    #[test]
    fn blocked_at_limit_and_multiplier_zero() {
        let m = manager();
        m.record_trade(dec!(-60));
        m.record_trade(dec!(-40));
        assert_eq!(m.status(), DailyLossStatus::Blocked);
        let (ok, reason) = m.can_trade();
        assert!(!ok);
        assert!(reason.contains("daily loss limit"));
        assert_eq!(m.position_size_multiplier(), 0.0);

        let summary = m.summary();
        assert!(!summary.can_trade);
        assert_eq!(summary.current_loss, dec!(100));
    }

    #[test]
    fn unrealized_losses_count_toward_ratio() {
        let m = manager();
        // Unrealized losses count toward the ratio too.
        m.update_unrealized(dec!(-69));
        assert_eq!(m.status(), DailyLossStatus::Reduced);
        m.update_unrealized(dec!(-99));
        assert_eq!(m.status(), DailyLossStatus::Warning);
        assert_eq!(m.position_size_multiplier(), 0.75);
    }

    #[test]
    fn wins_and_losses_are_tallied() {
        let m = manager();
        m.record_trade(dec!(12));
        m.record_trade(dec!(-3));
        m.record_trade(dec!(20));
        let s = m.summary();
        assert_eq!(s.trades, 3);
        assert!((s.win_rate - 66.6666).abs() < 0.01);
        let inner = m.inner.lock();
        assert_eq!(inner.stats.largest_win, dec!(20));
        assert_eq!(inner.stats.largest_loss, dec!(-3));
    }

    #[test]
    fn roll_day_archives_and_unblocks() {
        let m = manager();
        m.record_trade(dec!(-100));
        assert_eq!(m.status(), DailyLossStatus::Blocked);

        m.roll_day();
        assert_eq!(m.status(), DailyLossStatus::Normal);
        assert!(m.can_trade().0);
        assert_eq!(m.history_len(), 1);
        assert_eq!(m.current_loss(), dec!(0));
    }

    #[test]
    fn history_is_capped_at_30_days() {
        let m = manager();
        for _ in 0..40 {
            m.record_trade(dec!(-1));
            m.roll_day();
        }
        assert_eq!(m.history_len(), 30);
    }

    #[test]
    fn status_callback_fires_on_change() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let m = manager();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        m.set_on_status_change(Box::new(move |_s| {
            h.fetch_add(1, Ordering::SeqCst);
        }));

        m.record_trade(dec!(-10)); // still normal, no callback
        m.record_trade(dec!(-60)); // -> reduced
        m.record_trade(dec!(-40)); // -> blocked
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn persists_current_and_history() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        let cfg = DailyLossConfig {
            max_daily_loss_usd: dec!(100),
            max_daily_loss_pct: dec!(10),
            total_capital: dec!(1000),
            ..DailyLossConfig::default()
        };

        let m = DailyLossManager::new(cfg.clone(), Some(store.clone()));
        m.record_trade(dec!(-42));
        drop(m);

        let revived = DailyLossManager::new(cfg, Some(store));
        assert_eq!(revived.current_loss(), dec!(42));
        assert_eq!(revived.summary().trades, 1);
    }
}
