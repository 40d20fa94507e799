//! Process lifecycle: metrics counters, health probes, graceful shutdown.
//!
//! These are process-wide singletons at runtime but plain values here;
//! construction happens once in `main` and instances are passed explicitly,
//! which keeps them injectable in tests.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::store::{Store, METRICS_FILE};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BotMetrics {
    pub trades_executed: u64,
    pub trades_success: u64,
    pub trades_failed: u64,
    pub trades_rejected: u64,
    pub total_profit_usd: Decimal,
    pub total_volume_usd: Decimal,
    pub total_latency_ms: f64,
    pub latency_samples: u64,
    pub positions_opened: u64,
    pub positions_closed: u64,
    pub positions_locked: u64,
    pub errors_count: u64,
    pub circuit_breaks: u64,
    pub start_time: Option<DateTime<Utc>>,
    pub last_updated: Option<DateTime<Utc>>,
}

impl BotMetrics {
    pub fn avg_latency_ms(&self) -> f64 {
        if self.latency_samples == 0 {
            0.0
        } else {
            self.total_latency_ms / self.latency_samples as f64
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.trades_executed == 0 {
            0.0
        } else {
            self.trades_success as f64 / self.trades_executed as f64 * 100.0
        }
    }
}

pub struct Metrics {
    inner: Mutex<BotMetrics>,
    store: Option<Store>,
}

impl Metrics {
    pub fn new(store: Option<Store>) -> Self {
        let mut metrics: BotMetrics = store
            .as_ref()
            .and_then(|s| s.load(METRICS_FILE))
            .unwrap_or_default();
        metrics.start_time = Some(Utc::now());
        Self {
            inner: Mutex::new(metrics),
            store,
        }
    }

    pub fn record_trade(&self, success: bool, volume_usd: Decimal, profit_usd: Decimal) {
        let mut m = self.inner.lock();
        m.trades_executed += 1;
        if success {
            m.trades_success += 1;
            m.total_volume_usd += volume_usd;
            m.total_profit_usd += profit_usd;
        } else {
            m.trades_failed += 1;
        }
        self.persist(&mut m);
    }

    pub fn record_rejected(&self) {
        self.inner.lock().trades_rejected += 1;
    }

    pub fn record_latency(&self, latency_ms: f64) {
        let mut m = self.inner.lock();
        m.total_latency_ms += latency_ms;
        m.latency_samples += 1;
    }

    pub fn record_error(&self) {
        self.inner.lock().errors_count += 1;
    }

    pub fn record_circuit_break(&self) {
        self.inner.lock().circuit_breaks += 1;
    }

    pub fn record_position_opened(&self) {
        self.inner.lock().positions_opened += 1;
    }

    pub fn record_position_closed(&self) {
        self.inner.lock().positions_closed += 1;
    }

    pub fn record_position_locked(&self, profit_usd: Decimal) {
        let mut m = self.inner.lock();
        m.positions_locked += 1;
        m.total_profit_usd += profit_usd;
        self.persist(&mut m);
    }

    pub fn snapshot(&self) -> BotMetrics {
        self.inner.lock().clone()
    }

    pub fn save(&self) {
        let mut m = self.inner.lock();
        self.persist(&mut m);
    }

    fn persist(&self, metrics: &mut BotMetrics) {
        metrics.last_updated = Some(Utc::now());
        if let Some(store) = &self.store {
            if let Err(e) = store.save(METRICS_FILE, metrics) {
                log::warn!("metrics.persist_error err={e:#}");
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    pub message: String,
}

impl ComponentHealth {
    pub fn healthy(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: HealthStatus::Healthy,
            message: String::new(),
        }
    }

    pub fn degraded(name: &str, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status: HealthStatus::Degraded,
            message: message.into(),
        }
    }

    pub fn unhealthy(name: &str, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status: HealthStatus::Unhealthy,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub components: Vec<ComponentHealth>,
}

type HealthProbe = Box<dyn Fn() -> ComponentHealth + Send + Sync>;

#[derive(Default)]
pub struct HealthChecker {
    probes: RwLock<Vec<(String, HealthProbe)>>,
}

impl HealthChecker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, probe: HealthProbe) {
        self.probes.write().push((name.to_string(), probe));
        log::debug!("health.registered component={name}");
    }

    /// Overall status is unhealthy if any probe is, else degraded if any
    /// probe is, else healthy.
    pub fn check_all(&self) -> HealthReport {
        let probes = self.probes.read();
        let mut overall = HealthStatus::Healthy;
        let mut components = Vec::with_capacity(probes.len());
        for (name, probe) in probes.iter() {
            let health = probe();
            match health.status {
                HealthStatus::Unhealthy => overall = HealthStatus::Unhealthy,
                HealthStatus::Degraded if overall == HealthStatus::Healthy => {
                    overall = HealthStatus::Degraded
                }
                _ => {}
            }
            let mut health = health;
            health.name = name.clone();
            components.push(health);
        }
        HealthReport {
            status: overall,
            timestamp: Utc::now(),
            components,
        }
    }
}

type ShutdownFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type ShutdownCallback = Box<dyn Fn() -> ShutdownFuture + Send + Sync>;

/// Callback registry run in registration order on the termination signal.
pub struct GracefulShutdown {
    requested: AtomicBool,
    callbacks: Mutex<Vec<(String, ShutdownCallback)>>,
    notify: Notify,
    metrics: Arc<Metrics>,
}

impl GracefulShutdown {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            requested: AtomicBool::new(false),
            callbacks: Mutex::new(Vec::new()),
            notify: Notify::new(),
            metrics,
        }
    }

    pub fn register(&self, name: &str, callback: ShutdownCallback) {
        self.callbacks.lock().push((name.to_string(), callback));
        log::debug!("shutdown.registered callback={name}");
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Resolves once a shutdown has been requested.
    pub async fn wait(&self) {
        while !self.is_requested() {
            let _ = tokio::time::timeout(
                std::time::Duration::from_millis(200),
                self.notify.notified(),
            )
            .await;
        }
    }

    /// Marks shutdown requested, runs every callback in registration order
    /// (awaiting each), then persists metrics.
    pub async fn run(&self) {
        if self.requested.swap(true, Ordering::SeqCst) {
            return;
        }
        self.notify.notify_waiters();

        let callbacks: Vec<(String, ShutdownFuture)> = {
            let cbs = self.callbacks.lock();
            cbs.iter().map(|(name, cb)| (name.clone(), cb())).collect()
        };
        log::info!("shutdown.begin callbacks={}", callbacks.len());
        for (name, fut) in callbacks {
            log::info!("shutdown.callback name={name}");
            fut.await;
        }
        self.metrics.save();
        log::info!("shutdown.complete");
    }
}
