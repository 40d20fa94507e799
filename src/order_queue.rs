//! Priority FIFO of outbound orders with bounded concurrency, retry with
//! back-off, and a dedup window against accidental duplicates from the same
//! decision.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::Value as JsonValue;
use tokio::sync::{Notify, Semaphore};
use tokio::time::{Duration, Instant};
use uuid::Uuid;

use crate::breaker::CircuitBreaker;
use crate::exchange::{ExchangeClient, ExchangeError, PlacedOrder, Side, Tif};
use crate::rate_limiter::AdaptiveRateLimiter;

const DEDUP_WINDOW: usize = 200;
const PROCESSING_TIME_SAMPLES: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum OrderPriority {
    Normal,
    High,
    Urgent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOrderStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderType {
    Gtc,
    Fok,
    Market,
}

#[derive(Debug, Clone)]
pub struct QueuedOrder {
    pub id: String,
    pub token_id: String,
    pub side: Side,
    pub price: f64,
    pub size: f64,
    pub order_type: OrderType,
    pub priority: OrderPriority,
    pub status: QueueOrderStatus,
    pub created_at: DateTime<Utc>,
    pub retries: u32,
    pub result: Option<PlacedOrder>,
    pub error: Option<String>,
    pub market_id: Option<String>,
    pub metadata: JsonValue,
}

impl QueuedOrder {
    pub fn new(
        token_id: impl Into<String>,
        side: Side,
        price: f64,
        size: f64,
        order_type: OrderType,
        priority: OrderPriority,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string()[..8].to_string(),
            token_id: token_id.into(),
            side,
            price,
            size,
            order_type,
            priority,
            status: QueueOrderStatus::Pending,
            created_at: Utc::now(),
            retries: 0,
            result: None,
            error: None,
            market_id: None,
            metadata: JsonValue::Null,
        }
    }

    pub fn with_market(mut self, market_id: impl Into<String>) -> Self {
        self.market_id = Some(market_id.into());
        self
    }

    pub fn with_metadata(mut self, metadata: JsonValue) -> Self {
        self.metadata = metadata;
        self
    }

    fn dedup_key(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.token_id,
            self.side.as_str(),
            self.price,
            self.size
        )
    }
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub max_concurrent: usize,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            max_retries: 2,
            retry_delay: Duration::from_millis(50),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    pub total_enqueued: u64,
    pub total_completed: u64,
    pub total_failed: u64,
    pub total_retried: u64,
    pub avg_processing_ms: f64,
    pub queue_size: usize,
    pub processing: usize,
}

/// Completion/failure notifications. Implementors that have nothing async to
/// do simply return without awaiting.
#[async_trait]
pub trait QueueEvents: Send + Sync {
    async fn on_order_complete(&self, order: &QueuedOrder);
    async fn on_order_failed(&self, order: &QueuedOrder);
}

struct QueueInner {
    urgent: VecDeque<String>,
    high: VecDeque<String>,
    normal: VecDeque<String>,
    orders: HashMap<String, QueuedOrder>,
    // (dedup key, order id), oldest first, bounded to DEDUP_WINDOW
    recent_keys: VecDeque<(String, String)>,
    processing_times: VecDeque<f64>,
    processing: usize,
    total_enqueued: u64,
    total_completed: u64,
    total_failed: u64,
    total_retried: u64,
}

pub struct OrderQueue {
    client: Arc<dyn ExchangeClient>,
    limiter: Arc<AdaptiveRateLimiter>,
    breaker: Arc<CircuitBreaker>,
    config: QueueConfig,
    inner: Mutex<QueueInner>,
    semaphore: Arc<Semaphore>,
    notify: Notify,
    running: AtomicBool,
    events: RwLock<Option<Weak<dyn QueueEvents>>>,
}

struct ExecSpec {
    token_id: String,
    side: Side,
    price: f64,
    size: f64,
    order_type: OrderType,
}

impl OrderQueue {
    pub fn new(
        client: Arc<dyn ExchangeClient>,
        limiter: Arc<AdaptiveRateLimiter>,
        breaker: Arc<CircuitBreaker>,
        config: QueueConfig,
    ) -> Self {
        let max_concurrent = config.max_concurrent.max(1);
        Self {
            client,
            limiter,
            breaker,
            config,
            inner: Mutex::new(QueueInner {
                urgent: VecDeque::new(),
                high: VecDeque::new(),
                normal: VecDeque::new(),
                orders: HashMap::new(),
                recent_keys: VecDeque::new(),
                processing_times: VecDeque::new(),
                processing: 0,
                total_enqueued: 0,
                total_completed: 0,
                total_failed: 0,
                total_retried: 0,
            }),
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            notify: Notify::new(),
            running: AtomicBool::new(false),
            events: RwLock::new(None),
        }
    }

    pub fn set_events(&self, events: Weak<dyn QueueEvents>) {
        *self.events.write() = Some(events);
    }

    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            queue.process_loop().await;
        });
        log::info!(
            "queue.started max_concurrent={} max_retries={}",
            self.config.max_concurrent,
            self.config.max_retries
        );
    }

    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.notify.notify_waiters();
        log::info!("queue.shutdown");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Adds an order. If an identical (token, side, price, size) key was
    /// enqueued within the dedup window, returns the original id without
    /// adding a new entry.
    pub fn enqueue(&self, order: QueuedOrder) -> String {
        let key = order.dedup_key();
        let mut inner = self.inner.lock();

        if let Some((_, existing)) = inner.recent_keys.iter().find(|(k, _)| *k == key) {
            return existing.clone();
        }

        let id = order.id.clone();
        inner.recent_keys.push_back((key, id.clone()));
        while inner.recent_keys.len() > DEDUP_WINDOW {
            inner.recent_keys.pop_front();
        }

        self.push_fifo(&mut inner, order.priority, id.clone());
        inner.orders.insert(id.clone(), order);
        inner.total_enqueued += 1;
        drop(inner);

        self.notify.notify_one();
        id
    }

    pub fn enqueue_batch(&self, orders: Vec<QueuedOrder>) -> Vec<String> {
        orders.into_iter().map(|o| self.enqueue(o)).collect()
    }

    fn push_fifo(&self, inner: &mut QueueInner, priority: OrderPriority, id: String) {
        match priority {
            OrderPriority::Urgent => inner.urgent.push_back(id),
            OrderPriority::High => inner.high.push_back(id),
            OrderPriority::Normal => inner.normal.push_back(id),
        }
    }

    /// Cancels a still-pending order; anything already picked up by the
    /// processor can no longer be cancelled here.
    pub fn cancel(&self, order_id: &str) -> bool {
        let mut inner = self.inner.lock();
        match inner.orders.get_mut(order_id) {
            Some(o) if o.status == QueueOrderStatus::Pending => {
                o.status = QueueOrderStatus::Cancelled;
                true
            }
            _ => false,
        }
    }

    /// Drops terminal orders from the table; returns how many were removed.
    pub fn clear_completed(&self) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.orders.len();
        inner.orders.retain(|_, o| {
            !matches!(
                o.status,
                QueueOrderStatus::Completed | QueueOrderStatus::Failed | QueueOrderStatus::Cancelled
            )
        });
        before - inner.orders.len()
    }

    pub fn get_order(&self, order_id: &str) -> Option<QueuedOrder> {
        self.inner.lock().orders.get(order_id).cloned()
    }

    fn orders_with_status(&self, status: QueueOrderStatus) -> Vec<QueuedOrder> {
        self.inner
            .lock()
            .orders
            .values()
            .filter(|o| o.status == status)
            .cloned()
            .collect()
    }

    pub fn pending_orders(&self) -> Vec<QueuedOrder> {
        self.orders_with_status(QueueOrderStatus::Pending)
    }

    pub fn completed_orders(&self) -> Vec<QueuedOrder> {
        self.orders_with_status(QueueOrderStatus::Completed)
    }

    pub fn failed_orders(&self) -> Vec<QueuedOrder> {
        self.orders_with_status(QueueOrderStatus::Failed)
    }

    pub fn get_status(&self, order_id: &str) -> Option<QueueOrderStatus> {
        self.inner.lock().orders.get(order_id).map(|o| o.status)
    }

    pub fn queue_size(&self) -> usize {
        let inner = self.inner.lock();
        inner.urgent.len() + inner.high.len() + inner.normal.len()
    }

    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock();
        let avg = if inner.processing_times.is_empty() {
            0.0
        } else {
            inner.processing_times.iter().sum::<f64>() / inner.processing_times.len() as f64
        };
        QueueStats {
            total_enqueued: inner.total_enqueued,
            total_completed: inner.total_completed,
            total_failed: inner.total_failed,
            total_retried: inner.total_retried,
            avg_processing_ms: avg,
            queue_size: inner.urgent.len() + inner.high.len() + inner.normal.len(),
            processing: inner.processing,
        }
    }

    async fn process_loop(self: Arc<Self>) {
        while self.is_running() {
            match self.pop_next() {
                Some(order_id) => {
                    let queue = Arc::clone(&self);
                    tokio::spawn(async move {
                        queue.process_order(order_id).await;
                    });
                }
                None => {
                    let _ =
                        tokio::time::timeout(Duration::from_millis(100), self.notify.notified())
                            .await;
                }
            }
        }
        log::info!("queue.loop_exit");
    }

    fn pop_next(&self) -> Option<String> {
        let mut inner = self.inner.lock();
        loop {
            let id = inner
                .urgent
                .pop_front()
                .or_else(|| inner.high.pop_front())
                .or_else(|| inner.normal.pop_front())?;
            // Skip entries cancelled while queued.
            if inner
                .orders
                .get(&id)
                .is_some_and(|o| o.status == QueueOrderStatus::Pending)
            {
                return Some(id);
            }
        }
    }

    async fn process_order(self: Arc<Self>, order_id: String) {
        let Ok(_permit) = Arc::clone(&self.semaphore).acquire_owned().await else {
            return;
        };

        let Some(spec) = self.begin_processing(&order_id) else {
            return;
        };

        let started = Instant::now();
        let result = self.execute(&spec).await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        {
            let mut inner = self.inner.lock();
            inner.processing = inner.processing.saturating_sub(1);
            inner.processing_times.push_back(elapsed_ms);
            while inner.processing_times.len() > PROCESSING_TIME_SAMPLES {
                inner.processing_times.pop_front();
            }
        }

        match result {
            Ok(placed) => self.complete_order(&order_id, placed).await,
            Err(e) => self.handle_failure(order_id, e).await,
        }
    }

    fn begin_processing(&self, order_id: &str) -> Option<ExecSpec> {
        let mut inner = self.inner.lock();
        let order = inner.orders.get_mut(order_id)?;
        if order.status != QueueOrderStatus::Pending {
            return None;
        }
        order.status = QueueOrderStatus::Processing;
        let spec = ExecSpec {
            token_id: order.token_id.clone(),
            side: order.side,
            price: order.price,
            size: order.size,
            order_type: order.order_type,
        };
        inner.processing += 1;
        Some(spec)
    }

    async fn execute(&self, spec: &ExecSpec) -> Result<PlacedOrder, ExchangeError> {
        self.limiter.acquire(1.0).await;

        let result = match spec.order_type {
            OrderType::Market => {
                self.breaker
                    .call(self.client.create_market_order(&spec.token_id, spec.side, spec.size))
                    .await
            }
            OrderType::Gtc | OrderType::Fok => {
                let tif = if spec.order_type == OrderType::Fok {
                    Tif::Fok
                } else {
                    Tif::Gtc
                };
                self.breaker
                    .call(self.client.create_limit_order(
                        &spec.token_id,
                        spec.side,
                        spec.price,
                        spec.size,
                        tif,
                    ))
                    .await
            }
        };

        match &result {
            Ok(_) => self.limiter.on_success().await,
            Err(ExchangeError::RateLimited) => self.limiter.on_rate_limited().await,
            Err(_) => {}
        }
        result
    }

    async fn complete_order(&self, order_id: &str, placed: PlacedOrder) {
        let order = {
            let mut inner = self.inner.lock();
            inner.total_completed += 1;
            let order = inner.orders.get_mut(order_id);
            order.map(|o| {
                o.status = QueueOrderStatus::Completed;
                o.result = Some(placed);
                o.clone()
            })
        };
        if let Some(order) = order {
            log::info!(
                "queue.completed id={} token={} side={} px={:.4} size={:.2}",
                order.id,
                order.token_id,
                order.side.as_str(),
                order.price,
                order.size
            );
            self.fire(|e, o| async move { e.on_order_complete(&o).await }, order)
                .await;
        }
    }

    async fn handle_failure(self: &Arc<Self>, order_id: String, error: ExchangeError) {
        let retry = {
            let mut inner = self.inner.lock();
            let Some(order) = inner.orders.get_mut(&order_id) else {
                return;
            };
            order.error = Some(error.to_string());
            if error.is_retryable() && order.retries < self.config.max_retries {
                order.retries += 1;
                order.status = QueueOrderStatus::Pending;
                let delay = self.config.retry_delay * order.retries
                    + Duration::from_millis(rand::random::<u64>() % 20);
                let priority = order.priority;
                inner.total_retried += 1;
                Some((delay, priority))
            } else {
                order.status = QueueOrderStatus::Failed;
                inner.total_failed += 1;
                None
            }
        };

        match retry {
            Some((delay, priority)) => {
                log::warn!("queue.retry id={} delay_ms={}", order_id, delay.as_millis());
                let queue = Arc::clone(self);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    // Re-issue the same id; dedup only guards fresh enqueues.
                    let mut inner = queue.inner.lock();
                    queue.push_fifo(&mut inner, priority, order_id);
                    drop(inner);
                    queue.notify.notify_one();
                });
            }
            None => {
                let order = self.inner.lock().orders.get(&order_id).cloned();
                if let Some(order) = order {
                    log::error!(
                        "queue.failed id={} token={} err={}",
                        order.id,
                        order.token_id,
                        order.error.as_deref().unwrap_or("?")
                    );
                    self.fire(|e, o| async move { e.on_order_failed(&o).await }, order)
                        .await;
                }
            }
        }
    }

    async fn fire<F, Fut>(&self, f: F, order: QueuedOrder)
    where
        F: FnOnce(Arc<dyn QueueEvents>, QueuedOrder) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        let events = self.events.read().as_ref().and_then(|w| w.upgrade());
        if let Some(events) = events {
            f(events, order).await;
        }
    }
}
