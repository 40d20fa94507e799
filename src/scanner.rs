//! Market catalog refresh and per-market snapshot maintenance.
//!
//! The scanner pages through the exchange catalog (cursor-based), filters by
//! keyword and recency, and composes per-market snapshots from the local
//! books. Book feed events flow through here so a single writer owns the
//! book mirror; every applied update re-derives the market snapshot and
//! offers it to the immediate-analysis channel for the low-latency path.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::exchange::{CatalogMarket, MarketCatalog};
use crate::orderbook::{BookManager, FeedEvent};
use crate::utils::now_ts;

#[derive(Debug, Clone, Serialize)]
pub struct Market {
    pub id: String,
    pub condition_id: String,
    pub question: String,
    pub token_yes_id: String,
    pub token_no_id: String,
    pub price_yes: f64,
    pub price_no: f64,
    pub volume: f64,
    pub liquidity: f64,
    pub end_date: Option<DateTime<Utc>>,
    pub active: bool,
}

impl Market {
    pub fn hours_until_end(&self) -> Option<f64> {
        self.end_date
            .map(|end| (end - Utc::now()).num_milliseconds() as f64 / 3_600_000.0)
    }

    pub fn matches_keywords(&self, keywords: &[String]) -> bool {
        if keywords.is_empty() {
            return true;
        }
        let q = self.question.to_ascii_lowercase();
        keywords.iter().any(|k| q.contains(&k.to_ascii_lowercase()))
    }
}

impl From<CatalogMarket> for Market {
    fn from(m: CatalogMarket) -> Self {
        Self {
            id: m.id,
            condition_id: m.condition_id,
            question: m.question,
            token_yes_id: m.token_yes_id,
            token_no_id: m.token_no_id,
            price_yes: m.price_yes,
            price_no: m.price_no,
            volume: m.volume,
            liquidity: m.liquidity,
            end_date: m.end_date,
            active: m.active,
        }
    }
}

/// One market at one instant: top-of-book per outcome plus derived spreads
/// and order-book imbalance, composed from the local books.
#[derive(Debug, Clone, Serialize)]
pub struct MarketSnapshot {
    pub market: Market,
    pub best_bid_yes: Option<f64>,
    pub best_ask_yes: Option<f64>,
    pub best_bid_no: Option<f64>,
    pub best_ask_no: Option<f64>,
    pub spread_yes: Option<f64>,
    pub spread_no: Option<f64>,
    pub obi_yes: f64,
    pub obi_no: f64,
    pub top_ask_yes: Option<(f64, f64)>,
    pub top_ask_no: Option<(f64, f64)>,
    pub updated_at: f64,
}

impl MarketSnapshot {
    pub fn is_valid(&self) -> bool {
        self.best_ask_yes.is_some() && self.best_ask_no.is_some()
    }

    pub fn effective_spread(&self) -> f64 {
        (self.spread_yes.unwrap_or(0.0) + self.spread_no.unwrap_or(0.0)) / 2.0
    }
}

#[derive(Debug, Clone)]
pub struct ScannerConfig {
    pub keywords: Vec<String>,
    pub max_pages: usize,
    pub max_duration_hours: f64,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            keywords: Vec::new(),
            max_pages: 20,
            max_duration_hours: 4.0,
        }
    }
}

pub struct Scanner {
    catalog: Arc<dyn MarketCatalog>,
    books: Arc<BookManager>,
    config: ScannerConfig,
    markets: RwLock<HashMap<String, MarketSnapshot>>,
    priority: RwLock<HashSet<String>>,
    token_routes: RwLock<HashMap<String, String>>,
    immediate_tx: Mutex<Option<mpsc::Sender<MarketSnapshot>>>,
}

impl Scanner {
    pub fn new(
        catalog: Arc<dyn MarketCatalog>,
        books: Arc<BookManager>,
        config: ScannerConfig,
    ) -> Self {
        Self {
            catalog,
            books,
            config,
            markets: RwLock::new(HashMap::new()),
            priority: RwLock::new(HashSet::new()),
            token_routes: RwLock::new(HashMap::new()),
            immediate_tx: Mutex::new(None),
        }
    }

    /// Wires the low-latency pre-filter channel; every applied book update
    /// offers the re-derived snapshot here (lossy when the consumer lags).
    pub fn set_immediate_channel(&self, tx: mpsc::Sender<MarketSnapshot>) {
        *self.immediate_tx.lock() = Some(tx);
    }

    /// Markets with active positions; these are force-refreshed each tick
    /// and survive catalog turnover.
    pub fn set_priority(&self, ids: HashSet<String>) {
        *self.priority.write() = ids;
    }

    /// One full catalog sweep. Returns the number of markets tracked after
    /// the sweep.
    pub async fn refresh(&self) -> usize {
        let mut cursor: Option<String> = None;
        let mut seen: HashMap<String, Market> = HashMap::new();

        for _ in 0..self.config.max_pages {
            let page = match self.catalog.fetch_page(cursor.as_deref()).await {
                Ok(page) => page,
                Err(e) => {
                    log::warn!("scanner.page_error err={e}");
                    break;
                }
            };
            for raw in page.markets {
                let market = Market::from(raw);
                if !market.active {
                    continue;
                }
                if !market.matches_keywords(&self.config.keywords) {
                    continue;
                }
                // Recency: resolved markets and far-out expiries are skipped.
                match market.hours_until_end() {
                    Some(h) if h <= 0.0 || h > self.config.max_duration_hours => continue,
                    None => continue,
                    _ => {}
                }
                seen.insert(market.id.clone(), market);
            }
            cursor = page.next_cursor;
            if cursor.is_none() {
                break;
            }
        }

        {
            let mut routes = self.token_routes.write();
            for market in seen.values() {
                routes.insert(market.token_yes_id.clone(), market.id.clone());
                routes.insert(market.token_no_id.clone(), market.id.clone());
            }
        }

        let priority = self.priority.read().clone();
        let mut markets = self.markets.write();
        // Drop markets that fell out of the catalog, unless they carry an
        // active position.
        markets.retain(|id, _| seen.contains_key(id) || priority.contains(id));
        for (id, market) in seen {
            let snap = self.snapshot_of(market);
            markets.insert(id, snap);
        }
        let count = markets.len();
        drop(markets);

        // Force-refresh priority markets from the books even if the catalog
        // no longer lists them.
        for id in priority {
            self.refresh_market(&id);
        }

        log::info!("scanner.refresh markets={count}");
        count
    }

    fn snapshot_of(&self, market: Market) -> MarketSnapshot {
        let yes = &market.token_yes_id;
        let no = &market.token_no_id;

        let (best_bid_yes, best_ask_yes, obi_yes, top_ask_yes) = self
            .books
            .with_book(yes, |b| {
                (b.best_bid(), b.best_ask(), b.imbalance(5), b.depth(1).1.first().copied())
            })
            .unwrap_or((None, None, 0.0, None));
        let (best_bid_no, best_ask_no, obi_no, top_ask_no) = self
            .books
            .with_book(no, |b| {
                (b.best_bid(), b.best_ask(), b.imbalance(5), b.depth(1).1.first().copied())
            })
            .unwrap_or((None, None, 0.0, None));

        let spread_yes = match (best_bid_yes, best_ask_yes) {
            (Some(b), Some(a)) => Some(a - b),
            _ => None,
        };
        let spread_no = match (best_bid_no, best_ask_no) {
            (Some(b), Some(a)) => Some(a - b),
            _ => None,
        };

        MarketSnapshot {
            market,
            best_bid_yes,
            best_ask_yes,
            best_bid_no,
            best_ask_no,
            spread_yes,
            spread_no,
            obi_yes,
            obi_no,
            top_ask_yes,
            top_ask_no,
            updated_at: now_ts(),
        }
    }

    /// Recomputes one market's snapshot from the current books.
    pub fn refresh_market(&self, market_id: &str) -> Option<MarketSnapshot> {
        let market = self.markets.read().get(market_id)?.market.clone();
        let snap = self.snapshot_of(market);
        self.markets
            .write()
            .insert(market_id.to_string(), snap.clone());
        Some(snap)
    }

    /// Applies one feed event to the books and re-derives the snapshot for
    /// the owning market; the updated snapshot is offered to the immediate
    /// channel.
    pub fn on_feed_event(&self, event: FeedEvent) {
        let token_id = match &event {
            FeedEvent::Snapshot { token_id, .. } | FeedEvent::Delta { token_id, .. } => {
                token_id.clone()
            }
        };
        self.books.apply(event);

        let market_id = self.token_routes.read().get(&token_id).cloned();
        if let Some(market_id) = market_id {
            if let Some(snap) = self.refresh_market(&market_id) {
                let tx = self.immediate_tx.lock().clone();
                if let Some(tx) = tx {
                    // Lossy by design; the periodic loop converges anyway.
                    let _ = tx.try_send(snap);
                }
            }
        }
    }

    /// Pumps feed events (produced by the WebSocket wrapper) into the books.
    pub fn start_feed_task(self: &Arc<Self>, mut rx: mpsc::Receiver<FeedEvent>) {
        let scanner = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                scanner.on_feed_event(event);
            }
            log::info!("scanner.feed_closed");
        });
    }

    pub fn get(&self, market_id: &str) -> Option<MarketSnapshot> {
        self.markets.read().get(market_id).cloned()
    }

    pub fn snapshots(&self) -> Vec<MarketSnapshot> {
        self.markets.read().values().cloned().collect()
    }

    pub fn market_count(&self) -> usize {
        self.markets.read().len()
    }

    /// (avg effective spread, avg volume, avg liquidity) over valid
    /// snapshots; consumed by the auto-optimizer.
    pub fn aggregates(&self) -> (f64, f64, f64) {
        let markets = self.markets.read();
        let mut spreads = Vec::new();
        let mut volumes = Vec::new();
        let mut liquidities = Vec::new();
        for snap in markets.values() {
            if snap.is_valid() && snap.effective_spread() > 0.0 {
                spreads.push(snap.effective_spread());
            }
            if snap.market.volume > 0.0 {
                volumes.push(snap.market.volume);
            }
            if snap.market.liquidity > 0.0 {
                liquidities.push(snap.market.liquidity);
            }
        }
        let avg = |v: &[f64], default: f64| {
            if v.is_empty() {
                default
            } else {
                v.iter().sum::<f64>() / v.len() as f64
            }
        };
        (avg(&spreads, 0.10), avg(&volumes, 20_000.0), avg(&liquidities, 10_000.0))
    }
}
