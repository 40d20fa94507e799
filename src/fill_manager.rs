//! Poll-based reconciler of live exchange order ids into fill deltas and
//! terminal events for the strategy core.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::time::Duration;

use crate::exchange::{ExchangeClient, OrderStatus};
use crate::store::{Store, TRACKED_ORDERS_FILE};

/// Which side of the binary market an order accumulates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Leg {
    Yes,
    No,
}

impl Leg {
    pub fn as_str(&self) -> &'static str {
        match self {
            Leg::Yes => "YES",
            Leg::No => "NO",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_uppercase().as_str() {
            "YES" => Some(Leg::Yes),
            "NO" => Some(Leg::No),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedOrder {
    pub order_id: String,
    pub market_id: String,
    pub leg: Leg,
    pub initial_qty: f64,
    pub filled_qty: f64,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub last_check_at: DateTime<Utc>,
}

/// Fill notifications toward the strategy core. Quantities are share deltas
/// since the last poll; `remaining` on order end is the unfilled remainder.
#[async_trait]
pub trait FillSink: Send + Sync {
    async fn on_fill(&self, market_id: &str, leg: Leg, qty: f64, price: f64);
    async fn on_order_end(&self, market_id: &str, leg: Leg, remaining: f64);
}

pub struct FillManager {
    client: Arc<dyn ExchangeClient>,
    poll_interval: Duration,
    tracked: Mutex<HashMap<String, TrackedOrder>>,
    sink: RwLock<Option<Weak<dyn FillSink>>>,
    store: Option<Store>,
    running: AtomicBool,
}

impl FillManager {
    pub fn new(
        client: Arc<dyn ExchangeClient>,
        poll_interval: Duration,
        store: Option<Store>,
    ) -> Self {
        let tracked = store
            .as_ref()
            .and_then(|s| s.load::<Vec<TrackedOrder>>(TRACKED_ORDERS_FILE))
            .map(|orders| {
                orders
                    .into_iter()
                    .map(|o| (o.order_id.clone(), o))
                    .collect()
            })
            .unwrap_or_default();
        Self {
            client,
            poll_interval,
            tracked: Mutex::new(tracked),
            sink: RwLock::new(None),
            store,
            running: AtomicBool::new(false),
        }
    }

    pub fn set_sink(&self, sink: Weak<dyn FillSink>) {
        *self.sink.write() = Some(sink);
    }

    pub fn track(&self, order_id: &str, market_id: &str, leg: Leg, qty: f64) {
        let now = Utc::now();
        self.tracked.lock().insert(
            order_id.to_string(),
            TrackedOrder {
                order_id: order_id.to_string(),
                market_id: market_id.to_string(),
                leg,
                initial_qty: qty,
                filled_qty: 0.0,
                status: OrderStatus::Open,
                created_at: now,
                last_check_at: now,
            },
        );
        self.persist();
        log::debug!("fills.track order={} market={} leg={} qty={}", order_id, market_id, leg.as_str(), qty);
    }

    pub fn tracked_count(&self) -> usize {
        self.tracked.lock().len()
    }

    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let mgr = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(mgr.poll_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            while mgr.running.load(Ordering::SeqCst) {
                tick.tick().await;
                mgr.poll_once().await;
            }
            log::info!("fills.stopped");
        });
        log::info!("fills.started poll_interval={:?}", self.poll_interval);
    }

    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// One reconciliation pass over a snapshot of the tracked set. Fetch
    /// errors are logged; the record is retried on the next tick.
    pub async fn poll_once(&self) {
        let snapshot: Vec<TrackedOrder> = self.tracked.lock().values().cloned().collect();
        if snapshot.is_empty() {
            return;
        }

        for order in snapshot {
            let state = match self.client.get_order(&order.order_id).await {
                Ok(Some(state)) => state,
                Ok(None) => continue,
                Err(e) => {
                    log::warn!("fills.poll_error order={} err={}", order.order_id, e);
                    continue;
                }
            };

            let (delta, remaining, done) = {
                let mut tracked = self.tracked.lock();
                let Some(rec) = tracked.get_mut(&order.order_id) else {
                    continue;
                };
                rec.last_check_at = Utc::now();
                rec.status = state.status;

                let delta = (state.size_matched - rec.filled_qty).max(0.0);
                if delta > 0.0 {
                    rec.filled_qty = state.size_matched;
                }

                let done = state.status.is_terminal() || rec.filled_qty >= rec.initial_qty;
                let remaining = (rec.initial_qty - rec.filled_qty).max(0.0);
                if done {
                    tracked.remove(&order.order_id);
                }
                (delta, remaining, done)
            };

            if delta > 0.0 {
                log::info!(
                    "fills.delta order={} market={} leg={} qty=+{:.2} px={:.4}",
                    order.order_id,
                    order.market_id,
                    order.leg.as_str(),
                    delta,
                    state.avg_price
                );
                self.dispatch_fill(&order.market_id, order.leg, delta, state.avg_price)
                    .await;
            }

            if done {
                self.persist();
                self.dispatch_order_end(&order.market_id, order.leg, remaining)
                    .await;
            } else if delta > 0.0 {
                self.persist();
            }
        }
    }

    async fn dispatch_fill(&self, market_id: &str, leg: Leg, qty: f64, price: f64) {
        if let Some(sink) = self.upgrade_sink() {
            sink.on_fill(market_id, leg, qty, price).await;
        }
    }

    async fn dispatch_order_end(&self, market_id: &str, leg: Leg, remaining: f64) {
        if let Some(sink) = self.upgrade_sink() {
            sink.on_order_end(market_id, leg, remaining).await;
        }
    }

    fn upgrade_sink(&self) -> Option<Arc<dyn FillSink>> {
        self.sink.read().as_ref().and_then(|w| w.upgrade())
    }

    fn persist(&self) {
        if let Some(store) = &self.store {
            let orders: Vec<TrackedOrder> = self.tracked.lock().values().cloned().collect();
            if let Err(e) = store.save(TRACKED_ORDERS_FILE, &orders) {
                log::warn!("fills.persist_error err={e:#}");
            }
        }
    }
}
