use std::env;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tokio::time::Duration;

use crate::analyzer::AnalyzerConfig;
use crate::breaker::CircuitBreakerConfig;
use crate::capital::CapitalConfig;
use crate::daily_loss::DailyLossConfig;
use crate::engine::EngineParams;
use crate::executor::ExecutorConfig;
use crate::kelly::KellyConfig;
use crate::order_queue::QueueConfig;
use crate::rate_limiter::RateLimiterConfig;
use crate::scanner::ScannerConfig;
use crate::utils::dec;

fn get_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn get_env_bool(key: &str, default: bool) -> bool {
    match get_env(key) {
        None => default,
        Some(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "y" | "on"),
    }
}

fn get_env_f64(key: &str, default: f64) -> Result<f64> {
    match get_env(key) {
        None => Ok(default),
        Some(v) => v
            .parse::<f64>()
            .map_err(|e| anyhow!("{key} invalid float: {e}")),
    }
}

fn get_env_usize(key: &str, default: usize) -> Result<usize> {
    match get_env(key) {
        None => Ok(default),
        Some(v) => v
            .parse::<usize>()
            .map_err(|e| anyhow!("{key} invalid int: {e}")),
    }
}

fn get_env_string(key: &str, default: &str) -> String {
    get_env(key).unwrap_or_else(|| default.to_string())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // Modes
    pub run_mode: String,   // trade|scanner
    pub trade_mode: String, // shadow only, until a live adapter is wired in

    // Storage / health surface
    pub data_dir: String,
    pub health_enabled: bool,
    pub health_host: String,
    pub health_port: u16,

    // Scanner
    pub market_keywords: Vec<String>,
    pub market_refresh_secs: u64,
    pub max_catalog_pages: usize,
    pub max_duration_hours: f64,

    // Analyzer
    pub min_spread: f64,
    pub max_spread: f64,
    pub min_volume_usd: f64,
    pub order_offset: f64,
    pub min_depth_usd: f64,

    // Order books
    pub book_max_levels: usize,

    // Rate limiter
    pub rate_tokens_per_sec: f64,
    pub rate_capacity: f64,
    pub rate_min: f64,
    pub rate_max: f64,
    pub rate_backoff_factor: f64,
    pub rate_recovery_factor: f64,
    pub rate_recovery_threshold: usize,

    // Circuit breaker
    pub breaker_failure_threshold: u32,
    pub breaker_success_threshold: u32,
    pub breaker_timeout_secs: f64,
    pub breaker_half_open_max_calls: u32,

    // Order queue
    pub queue_max_concurrent: usize,
    pub queue_max_retries: u32,
    pub queue_retry_delay_ms: u64,

    // Fill manager
    pub fill_poll_interval_secs: f64,

    // Executor
    pub auto_trading_enabled: bool,
    pub capital_per_trade: f64,
    pub min_time_between_trades_ms: u64,
    pub max_open_positions: usize,
    pub max_total_exposure: f64,
    pub max_pair_cost_slippage_check: f64,
    pub capital_multiplier_score_5: f64,
    pub capital_multiplier_score_4: f64,
    pub max_consecutive_failures: u32,
    pub pause_duration_secs: u64,
    pub fill_wait_timeout_secs: f64,

    // Accumulation strategy
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
    pub reconcile_threshold_shares: f64,

    // Capital
    pub starting_capital: f64,
    pub gabagool_capital_pct: f64,
    pub smart_ape_capital_pct: f64,
    pub fee_rate: f64,

    // Daily loss
    pub max_daily_loss_usd: f64,
    pub max_daily_loss_pct: f64,
    pub daily_reset_hour_utc: u32,
    pub daily_warning_threshold: f64,
    pub daily_reduction_threshold: f64,

    // Kelly
    pub kelly_enabled: bool,
    pub kelly_fraction: f64,
    pub kelly_min_edge: f64,
    pub kelly_max_multiplier: f64,
    pub kelly_lookback_trades: usize,

    // Auto-optimizer
    pub optimizer_mode: String, // manual|semi_auto|full_auto
    pub optimizer_interval_secs: f64,

    // Oracle
    pub oracle_enabled: bool,
    pub oracle_pump_threshold: f64,
    pub oracle_dump_threshold: f64,

    // HTTP client budget (consumed by the exchange adapter)
    pub http_connect_timeout_secs: f64,
    pub http_read_timeout_secs: f64,
}

impl Settings {
    pub fn load() -> Result<Self> {
        let run_mode = get_env_string("RUN_MODE", "trade").to_lowercase();
        let trade_mode = get_env_string("TRADE_MODE", "shadow").to_lowercase();

        if !matches!(run_mode.as_str(), "trade" | "scanner") {
            return Err(anyhow!("RUN_MODE must be trade|scanner (got {run_mode})"));
        }
        if trade_mode != "shadow" {
            return Err(anyhow!(
                "Only TRADE_MODE=shadow is supported until an exchange adapter is wired in (got {trade_mode})"
            ));
        }

        let market_keywords = get_env_string("MARKET_KEYWORDS", "")
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let s = Self {
            run_mode,
            trade_mode,
            data_dir: get_env_string("DATA_DIR", "./data"),
            health_enabled: get_env_bool("HEALTH_ENABLED", true),
            health_host: get_env_string("HEALTH_HOST", "127.0.0.1"),
            health_port: get_env_usize("HEALTH_PORT", 8000)? as u16,
            market_keywords,
            market_refresh_secs: get_env_usize("MARKET_REFRESH_SECS", 10)? as u64,
            max_catalog_pages: get_env_usize("MAX_CATALOG_PAGES", 20)?,
            max_duration_hours: get_env_f64("MAX_DURATION_HOURS", 4.0)?,
            min_spread: get_env_f64("MIN_SPREAD", 0.0)?,
            max_spread: get_env_f64("MAX_SPREAD", 1.0)?,
            min_volume_usd: get_env_f64("MIN_VOLUME_USD", 500.0)?,
            order_offset: get_env_f64("ORDER_OFFSET", 0.003)?,
            min_depth_usd: get_env_f64("MIN_DEPTH_USD", 10.0)?,
            book_max_levels: get_env_usize("BOOK_MAX_LEVELS", 50)?,
            rate_tokens_per_sec: get_env_f64("RATE_TOKENS_PER_SEC", 8.0)?,
            rate_capacity: get_env_f64("RATE_CAPACITY", 15.0)?,
            rate_min: get_env_f64("RATE_MIN", 2.0)?,
            rate_max: get_env_f64("RATE_MAX", 12.0)?,
            rate_backoff_factor: get_env_f64("RATE_BACKOFF_FACTOR", 0.5)?,
            rate_recovery_factor: get_env_f64("RATE_RECOVERY_FACTOR", 1.1)?,
            rate_recovery_threshold: get_env_usize("RATE_RECOVERY_THRESHOLD", 10)?,
            breaker_failure_threshold: get_env_usize("BREAKER_FAILURE_THRESHOLD", 5)? as u32,
            breaker_success_threshold: get_env_usize("BREAKER_SUCCESS_THRESHOLD", 2)? as u32,
            breaker_timeout_secs: get_env_f64("BREAKER_TIMEOUT_SECS", 30.0)?,
            breaker_half_open_max_calls: get_env_usize("BREAKER_HALF_OPEN_MAX_CALLS", 3)? as u32,
            queue_max_concurrent: get_env_usize("QUEUE_MAX_CONCURRENT", 3)?,
            queue_max_retries: get_env_usize("QUEUE_MAX_RETRIES", 2)? as u32,
            queue_retry_delay_ms: get_env_usize("QUEUE_RETRY_DELAY_MS", 50)? as u64,
            fill_poll_interval_secs: get_env_f64("FILL_POLL_INTERVAL_SECS", 2.0)?,
            auto_trading_enabled: get_env_bool("AUTO_TRADING_ENABLED", true),
            capital_per_trade: get_env_f64("CAPITAL_PER_TRADE", 25.0)?,
            min_time_between_trades_ms: get_env_usize("MIN_TIME_BETWEEN_TRADES_MS", 200)? as u64,
            max_open_positions: get_env_usize("MAX_OPEN_POSITIONS", 15)?,
            max_total_exposure: get_env_f64("MAX_TOTAL_EXPOSURE", 1000.0)?,
            max_pair_cost_slippage_check: get_env_f64("MAX_PAIR_COST_SLIPPAGE_CHECK", 0.980)?,
            capital_multiplier_score_5: get_env_f64("CAPITAL_MULTIPLIER_SCORE_5", 1.2)?,
            capital_multiplier_score_4: get_env_f64("CAPITAL_MULTIPLIER_SCORE_4", 1.0)?,
            max_consecutive_failures: get_env_usize("MAX_CONSECUTIVE_FAILURES", 5)? as u32,
            pause_duration_secs: get_env_usize("PAUSE_DURATION_SECS", 60)? as u64,
            fill_wait_timeout_secs: get_env_f64("FILL_WAIT_TIMEOUT_SECS", 5.0)?,
            max_pair_cost: get_env_f64("MAX_PAIR_COST", 0.975)?,
            min_improvement: get_env_f64("MIN_IMPROVEMENT", 0.0)?,
            order_size_usd: get_env_f64("ORDER_SIZE_USD", 25.0)?,
            max_position_usd: get_env_f64("MAX_POSITION_USD", 500.0)?,
            balance_ratio_threshold: get_env_f64("BALANCE_RATIO_THRESHOLD", 1.5)?,
            kill_switch_minutes: get_env_usize("KILL_SWITCH_MINUTES", 20)? as i64,
            rsi_period: get_env_usize("RSI_PERIOD", 14)?,
            rsi_overbought: get_env_f64("RSI_OVERBOUGHT", 70.0)?,
            rsi_oversold: get_env_f64("RSI_OVERSOLD", 30.0)?,
            trend_filter_enabled: get_env_bool("TREND_FILTER_ENABLED", true),
            reconcile_threshold_shares: get_env_f64("RECONCILE_THRESHOLD_SHARES", 2.0)?,
            starting_capital: get_env_f64("STARTING_CAPITAL", 1000.0)?,
            gabagool_capital_pct: get_env_f64("GABAGOOL_CAPITAL_PCT", 60.0)?,
            smart_ape_capital_pct: get_env_f64("SMART_APE_CAPITAL_PCT", 40.0)?,
            fee_rate: get_env_f64("FEE_RATE", 0.02)?,
            max_daily_loss_usd: get_env_f64("MAX_DAILY_LOSS_USD", 100.0)?,
            max_daily_loss_pct: get_env_f64("MAX_DAILY_LOSS_PCT", 10.0)?,
            daily_reset_hour_utc: get_env_usize("DAILY_RESET_HOUR_UTC", 0)? as u32,
            daily_warning_threshold: get_env_f64("DAILY_WARNING_THRESHOLD", 0.7)?,
            daily_reduction_threshold: get_env_f64("DAILY_REDUCTION_THRESHOLD", 0.5)?,
            kelly_enabled: get_env_bool("KELLY_ENABLED", false),
            kelly_fraction: get_env_f64("KELLY_FRACTION", 0.25)?,
            kelly_min_edge: get_env_f64("KELLY_MIN_EDGE", 0.02)?,
            kelly_max_multiplier: get_env_f64("KELLY_MAX_MULTIPLIER", 2.0)?,
            kelly_lookback_trades: get_env_usize("KELLY_LOOKBACK_TRADES", 50)?,
            optimizer_mode: get_env_string("OPTIMIZER_MODE", "full_auto").to_lowercase(),
            optimizer_interval_secs: get_env_f64("OPTIMIZER_INTERVAL_SECS", 5.0)?,
            oracle_enabled: get_env_bool("ORACLE_ENABLED", false),
            oracle_pump_threshold: get_env_f64("ORACLE_PUMP_THRESHOLD", 0.003)?,
            oracle_dump_threshold: get_env_f64("ORACLE_DUMP_THRESHOLD", 0.003)?,
            http_connect_timeout_secs: get_env_f64("HTTP_CONNECT_TIMEOUT_SECS", 1.0)?,
            http_read_timeout_secs: get_env_f64("HTTP_READ_TIMEOUT_SECS", 1.5)?,
        };

        s.validate()?;
        Ok(s)
    }

    pub fn validate(&self) -> Result<()> {
        if !matches!(self.run_mode.as_str(), "trade" | "scanner") {
            return Err(anyhow!("RUN_MODE must be trade|scanner (got {})", self.run_mode));
        }
        if !(0.0..1.0).contains(&self.max_pair_cost) || self.max_pair_cost <= 0.5 {
            return Err(anyhow!(
                "MAX_PAIR_COST must be in (0.5, 1.0) (got {})",
                self.max_pair_cost
            ));
        }
        if self.max_pair_cost_slippage_check < self.max_pair_cost {
            return Err(anyhow!(
                "MAX_PAIR_COST_SLIPPAGE_CHECK must be >= MAX_PAIR_COST ({} < {})",
                self.max_pair_cost_slippage_check,
                self.max_pair_cost
            ));
        }
        if self.min_improvement < 0.0 {
            return Err(anyhow!(
                "MIN_IMPROVEMENT must be >= 0 (got {})",
                self.min_improvement
            ));
        }
        if self.order_size_usd <= 0.0 || !self.order_size_usd.is_finite() {
            return Err(anyhow!(
                "ORDER_SIZE_USD must be > 0 (got {})",
                self.order_size_usd
            ));
        }
        if self.max_position_usd < self.order_size_usd {
            return Err(anyhow!(
                "MAX_POSITION_USD must be >= ORDER_SIZE_USD ({} < {})",
                self.max_position_usd,
                self.order_size_usd
            ));
        }
        if self.balance_ratio_threshold <= 1.0 {
            return Err(anyhow!(
                "BALANCE_RATIO_THRESHOLD must be > 1 (got {})",
                self.balance_ratio_threshold
            ));
        }
        if self.kill_switch_minutes < 1 {
            return Err(anyhow!(
                "KILL_SWITCH_MINUTES must be >= 1 (got {})",
                self.kill_switch_minutes
            ));
        }
        if self.rsi_period < 2 {
            return Err(anyhow!("RSI_PERIOD must be >= 2 (got {})", self.rsi_period));
        }
        if !(self.rsi_oversold < self.rsi_overbought) {
            return Err(anyhow!(
                "RSI_OVERSOLD must be < RSI_OVERBOUGHT ({} >= {})",
                self.rsi_oversold,
                self.rsi_overbought
            ));
        }
        if self.min_spread > self.max_spread {
            return Err(anyhow!(
                "MIN_SPREAD must be <= MAX_SPREAD ({} > {})",
                self.min_spread,
                self.max_spread
            ));
        }
        if self.capital_per_trade < 1.0 {
            return Err(anyhow!(
                "CAPITAL_PER_TRADE must be >= 1 (got {})",
                self.capital_per_trade
            ));
        }
        if self.max_open_positions < 1 {
            return Err(anyhow!(
                "MAX_OPEN_POSITIONS must be >= 1 (got {})",
                self.max_open_positions
            ));
        }
        if self.capital_per_trade * self.max_open_positions as f64 > self.max_total_exposure {
            return Err(anyhow!(
                "CAPITAL_PER_TRADE * MAX_OPEN_POSITIONS exceeds MAX_TOTAL_EXPOSURE ({} * {} > {})",
                self.capital_per_trade,
                self.max_open_positions,
                self.max_total_exposure
            ));
        }
        if (self.gabagool_capital_pct + self.smart_ape_capital_pct - 100.0).abs() > 1e-9 {
            return Err(anyhow!(
                "GABAGOOL_CAPITAL_PCT + SMART_APE_CAPITAL_PCT must sum to 100 ({} + {})",
                self.gabagool_capital_pct,
                self.smart_ape_capital_pct
            ));
        }
        if !(0.0..=1.0).contains(&self.fee_rate) {
            return Err(anyhow!("FEE_RATE must be in [0, 1] (got {})", self.fee_rate));
        }
        if self.max_daily_loss_usd <= 0.0 || self.max_daily_loss_pct <= 0.0 {
            return Err(anyhow!(
                "daily loss limits must be > 0 (usd={} pct={})",
                self.max_daily_loss_usd,
                self.max_daily_loss_pct
            ));
        }
        if self.daily_reset_hour_utc > 23 {
            return Err(anyhow!(
                "DAILY_RESET_HOUR_UTC must be 0..=23 (got {})",
                self.daily_reset_hour_utc
            ));
        }
        if !(self.daily_reduction_threshold < self.daily_warning_threshold
            && self.daily_warning_threshold < 1.0)
        {
            return Err(anyhow!(
                "daily thresholds must satisfy reduction < warning < 1 ({} / {})",
                self.daily_reduction_threshold,
                self.daily_warning_threshold
            ));
        }
        if !(0.0..=1.0).contains(&self.kelly_fraction) {
            return Err(anyhow!(
                "KELLY_FRACTION must be in [0, 1] (got {})",
                self.kelly_fraction
            ));
        }
        if self.kelly_max_multiplier < 1.0 {
            return Err(anyhow!(
                "KELLY_MAX_MULTIPLIER must be >= 1 (got {})",
                self.kelly_max_multiplier
            ));
        }
        if self.rate_tokens_per_sec <= 0.0 || self.rate_capacity <= 0.0 {
            return Err(anyhow!(
                "rate limiter needs positive rate and capacity ({}/{})",
                self.rate_tokens_per_sec,
                self.rate_capacity
            ));
        }
        if !(self.rate_min <= self.rate_tokens_per_sec && self.rate_tokens_per_sec <= self.rate_max)
        {
            return Err(anyhow!(
                "RATE_TOKENS_PER_SEC must be within [RATE_MIN, RATE_MAX] ({} not in [{}, {}])",
                self.rate_tokens_per_sec,
                self.rate_min,
                self.rate_max
            ));
        }
        if !(0.0 < self.rate_backoff_factor && self.rate_backoff_factor < 1.0) {
            return Err(anyhow!(
                "RATE_BACKOFF_FACTOR must be in (0, 1) (got {})",
                self.rate_backoff_factor
            ));
        }
        if self.rate_recovery_factor <= 1.0 {
            return Err(anyhow!(
                "RATE_RECOVERY_FACTOR must be > 1 (got {})",
                self.rate_recovery_factor
            ));
        }
        if self.breaker_failure_threshold == 0 || self.breaker_success_threshold == 0 {
            return Err(anyhow!("breaker thresholds must be >= 1"));
        }
        if self.queue_max_concurrent == 0 {
            return Err(anyhow!("QUEUE_MAX_CONCURRENT must be >= 1"));
        }
        if self.fill_poll_interval_secs <= 0.0 {
            return Err(anyhow!(
                "FILL_POLL_INTERVAL_SECS must be > 0 (got {})",
                self.fill_poll_interval_secs
            ));
        }
        if self.market_refresh_secs == 0 {
            return Err(anyhow!("MARKET_REFRESH_SECS must be >= 1"));
        }
        if self.optimizer_interval_secs <= 0.0 {
            return Err(anyhow!(
                "OPTIMIZER_INTERVAL_SECS must be > 0 (got {})",
                self.optimizer_interval_secs
            ));
        }
        if crate::optimizer::OptimizerMode::parse(&self.optimizer_mode).is_none() {
            return Err(anyhow!(
                "OPTIMIZER_MODE must be manual|semi_auto|full_auto (got {})",
                self.optimizer_mode
            ));
        }
        if self.oracle_pump_threshold <= 0.0 || self.oracle_dump_threshold <= 0.0 {
            return Err(anyhow!("oracle thresholds must be > 0"));
        }
        if self.http_connect_timeout_secs <= 0.0 || self.http_read_timeout_secs <= 0.0 {
            return Err(anyhow!("http timeouts must be > 0"));
        }
        Ok(())
    }

    pub fn scanner_config(&self) -> ScannerConfig {
        ScannerConfig {
            keywords: self.market_keywords.clone(),
            max_pages: self.max_catalog_pages,
            max_duration_hours: self.max_duration_hours,
        }
    }

    pub fn analyzer_config(&self) -> AnalyzerConfig {
        AnalyzerConfig {
            min_spread: self.min_spread,
            max_spread: self.max_spread,
            min_volume_usd: self.min_volume_usd,
            max_duration_hours: self.max_duration_hours,
            order_offset: self.order_offset,
            min_depth_usd: self.min_depth_usd,
        }
    }

    pub fn rate_limiter_config(&self) -> RateLimiterConfig {
        RateLimiterConfig {
            tokens_per_second: self.rate_tokens_per_sec,
            capacity: self.rate_capacity,
            initial: None,
            min_rate: self.rate_min,
            max_rate: self.rate_max,
            backoff_factor: self.rate_backoff_factor,
            recovery_factor: self.rate_recovery_factor,
            recovery_threshold: self.rate_recovery_threshold as u32,
        }
    }

    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.breaker_failure_threshold,
            success_threshold: self.breaker_success_threshold,
            timeout: Duration::from_secs_f64(self.breaker_timeout_secs),
            half_open_max_calls: self.breaker_half_open_max_calls,
        }
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            max_concurrent: self.queue_max_concurrent,
            max_retries: self.queue_max_retries,
            retry_delay: Duration::from_millis(self.queue_retry_delay_ms),
        }
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            capital_per_trade: self.capital_per_trade,
            min_time_between_trades: Duration::from_millis(self.min_time_between_trades_ms),
            max_open_positions: self.max_open_positions,
            max_total_exposure: self.max_total_exposure,
            max_pair_cost_slippage_check: self.max_pair_cost_slippage_check,
            capital_multiplier_score_5: self.capital_multiplier_score_5,
            capital_multiplier_score_4: self.capital_multiplier_score_4,
            max_consecutive_failures: self.max_consecutive_failures,
            pause_duration: Duration::from_secs(self.pause_duration_secs),
            fill_wait_timeout: Duration::from_secs_f64(self.fill_wait_timeout_secs),
            kelly_enabled: self.kelly_enabled,
        }
    }

    pub fn engine_params(&self) -> EngineParams {
        EngineParams {
            max_pair_cost: self.max_pair_cost,
            min_improvement: self.min_improvement,
            order_size_usd: self.order_size_usd,
            max_position_usd: self.max_position_usd,
            balance_ratio_threshold: self.balance_ratio_threshold,
            kill_switch_minutes: self.kill_switch_minutes,
            rsi_period: self.rsi_period,
            rsi_overbought: self.rsi_overbought,
            rsi_oversold: self.rsi_oversold,
            trend_filter_enabled: self.trend_filter_enabled,
            kelly_enabled: self.kelly_enabled,
            reconcile_threshold_shares: self.reconcile_threshold_shares,
        }
    }

    pub fn capital_config(&self) -> CapitalConfig {
        CapitalConfig {
            starting_capital: dec(self.starting_capital),
            gabagool_pct: dec(self.gabagool_capital_pct),
            smart_ape_pct: dec(self.smart_ape_capital_pct),
            fee_rate: dec(self.fee_rate),
        }
    }

    pub fn daily_loss_config(&self) -> DailyLossConfig {
        DailyLossConfig {
            max_daily_loss_usd: dec(self.max_daily_loss_usd),
            max_daily_loss_pct: dec(self.max_daily_loss_pct),
            total_capital: dec(self.starting_capital),
            reset_hour_utc: self.daily_reset_hour_utc,
            warning_threshold: self.daily_warning_threshold,
            reduction_threshold: self.daily_reduction_threshold,
        }
    }

    pub fn kelly_config(&self) -> KellyConfig {
        KellyConfig {
            fraction: self.kelly_fraction,
            min_edge: self.kelly_min_edge,
            max_multiplier: self.kelly_max_multiplier,
            lookback_trades: self.kelly_lookback_trades,
        }
    }
}

impl Default for Settings {
    /// Defaults identical to an empty environment.
    fn default() -> Self {
        Self {
            run_mode: "trade".into(),
            trade_mode: "shadow".into(),
            data_dir: "./data".into(),
            health_enabled: true,
            health_host: "127.0.0.1".into(),
            health_port: 8000,
            market_keywords: Vec::new(),
            market_refresh_secs: 10,
            max_catalog_pages: 20,
            max_duration_hours: 4.0,
            min_spread: 0.0,
            max_spread: 1.0,
            min_volume_usd: 500.0,
            order_offset: 0.003,
            min_depth_usd: 10.0,
            book_max_levels: 50,
            rate_tokens_per_sec: 8.0,
            rate_capacity: 15.0,
            rate_min: 2.0,
            rate_max: 12.0,
            rate_backoff_factor: 0.5,
            rate_recovery_factor: 1.1,
            rate_recovery_threshold: 10,
            breaker_failure_threshold: 5,
            breaker_success_threshold: 2,
            breaker_timeout_secs: 30.0,
            breaker_half_open_max_calls: 3,
            queue_max_concurrent: 3,
            queue_max_retries: 2,
            queue_retry_delay_ms: 50,
            fill_poll_interval_secs: 2.0,
            auto_trading_enabled: true,
            capital_per_trade: 25.0,
            min_time_between_trades_ms: 200,
            max_open_positions: 15,
            max_total_exposure: 1000.0,
            max_pair_cost_slippage_check: 0.980,
            capital_multiplier_score_5: 1.2,
            capital_multiplier_score_4: 1.0,
            max_consecutive_failures: 5,
            pause_duration_secs: 60,
            fill_wait_timeout_secs: 5.0,
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
            reconcile_threshold_shares: 2.0,
            starting_capital: 1000.0,
            gabagool_capital_pct: 60.0,
            smart_ape_capital_pct: 40.0,
            fee_rate: 0.02,
            max_daily_loss_usd: 100.0,
            max_daily_loss_pct: 10.0,
            daily_reset_hour_utc: 0,
            daily_warning_threshold: 0.7,
            daily_reduction_threshold: 0.5,
            kelly_enabled: false,
            kelly_fraction: 0.25,
            kelly_min_edge: 0.02,
            kelly_max_multiplier: 2.0,
            kelly_lookback_trades: 50,
            optimizer_mode: "full_auto".into(),
            optimizer_interval_secs: 5.0,
            oracle_enabled: false,
            oracle_pump_threshold: 0.003,
            oracle_dump_threshold: 0.003,
            http_connect_timeout_secs: 1.0,
            http_read_timeout_secs: 1.5,
        }
    }
}
