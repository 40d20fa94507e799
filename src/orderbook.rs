//! Local order-book mirror maintained from feed snapshots and deltas.
//!
//! Prices on this exchange are 4-decimal rationals in [0, 1], so ladders are
//! keyed by integer ticks (price * 10_000) inside `BTreeMap`s. Best bid is
//! the last bid key, best ask the first ask key.

use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;

use crate::utils::now_ts;

const TICKS_PER_UNIT: f64 = 10_000.0;
pub const DEFAULT_MAX_LEVELS: usize = 50;
pub const STALE_AFTER_SECS: f64 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookSide {
    Bid,
    Ask,
}

/// Feed messages produced by the exchange WebSocket wrapper.
/// `size == 0` inside a delta removes the level.
#[derive(Debug, Clone)]
pub enum FeedEvent {
    Snapshot {
        token_id: String,
        bids: Vec<(f64, f64)>,
        asks: Vec<(f64, f64)>,
        seq: Option<u64>,
    },
    Delta {
        token_id: String,
        bids: Vec<(f64, f64)>,
        asks: Vec<(f64, f64)>,
        seq: Option<u64>,
    },
}

fn to_ticks(price: f64) -> Option<u32> {
    if !price.is_finite() || price < 0.0 || price > 1.0 {
        return None;
    }
    Some((price * TICKS_PER_UNIT).round() as u32)
}

fn from_ticks(ticks: u32) -> f64 {
    ticks as f64 / TICKS_PER_UNIT
}

pub struct LocalBook {
    pub token_id: String,
    max_levels: usize,
    bids: BTreeMap<u32, f64>,
    asks: BTreeMap<u32, f64>,
    last_update: f64,
    update_count: u64,
    last_seq: Option<u64>,
    initialized: bool,
}

impl LocalBook {
    pub fn new(token_id: impl Into<String>, max_levels: usize) -> Self {
        Self {
            token_id: token_id.into(),
            max_levels: max_levels.max(1),
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            last_update: 0.0,
            update_count: 0,
            last_seq: None,
            initialized: false,
        }
    }

    /// Replaces both ladders. Invalid levels (negative size, price outside
    /// [0,1]) are dropped and logged, never applied.
    pub fn apply_snapshot(&mut self, bids: &[(f64, f64)], asks: &[(f64, f64)], seq: Option<u64>) {
        self.bids.clear();
        self.asks.clear();
        for &(price, size) in bids {
            self.set_level(BookSide::Bid, price, size);
        }
        for &(price, size) in asks {
            self.set_level(BookSide::Ask, price, size);
        }
        self.trim();
        self.last_seq = seq;
        self.touch();
        self.initialized = true;
    }

    /// In-place level updates. A delta on an uninitialized book silently
    /// initializes it. A sequence gap invalidates the book until the next
    /// snapshot.
    pub fn apply_delta(&mut self, bids: &[(f64, f64)], asks: &[(f64, f64)], seq: Option<u64>) {
        if let (Some(prev), Some(cur)) = (self.last_seq, seq) {
            if cur > prev + 1 {
                log::warn!(
                    "book.gap token={} prev_seq={} seq={}",
                    self.token_id,
                    prev,
                    cur
                );
                self.bids.clear();
                self.asks.clear();
                self.initialized = false;
                self.last_seq = None;
                return;
            }
        }
        for &(price, size) in bids {
            self.set_level(BookSide::Bid, price, size);
        }
        for &(price, size) in asks {
            self.set_level(BookSide::Ask, price, size);
        }
        self.trim();
        if seq.is_some() {
            self.last_seq = seq;
        }
        self.touch();
        self.initialized = true;
    }

    fn set_level(&mut self, side: BookSide, price: f64, size: f64) {
        let Some(ticks) = to_ticks(price) else {
            log::warn!("book.invalid_price token={} px={}", self.token_id, price);
            return;
        };
        let ladder = match side {
            BookSide::Bid => &mut self.bids,
            BookSide::Ask => &mut self.asks,
        };
        if !size.is_finite() || size < 0.0 {
            log::warn!("book.invalid_size token={} size={}", self.token_id, size);
            return;
        }
        if size == 0.0 {
            ladder.remove(&ticks);
        } else {
            ladder.insert(ticks, size);
        }
    }

    fn trim(&mut self) {
        // Worst levels drop first: lowest bids, highest asks.
        while self.bids.len() > self.max_levels {
            let k = *self.bids.keys().next().unwrap();
            self.bids.remove(&k);
        }
        while self.asks.len() > self.max_levels {
            let k = *self.asks.keys().next_back().unwrap();
            self.asks.remove(&k);
        }
    }

    fn touch(&mut self) {
        self.last_update = now_ts();
        self.update_count += 1;
    }

    pub fn best_bid(&self) -> Option<f64> {
        self.bids.keys().next_back().map(|&t| from_ticks(t))
    }

    pub fn best_ask(&self) -> Option<f64> {
        self.asks.keys().next().map(|&t| from_ticks(t))
    }

    pub fn mid(&self) -> Option<f64> {
        match (self.best_bid(), self.best_ask()) {
            (Some(b), Some(a)) => Some(0.5 * (a + b)),
            _ => None,
        }
    }

    pub fn spread(&self) -> Option<f64> {
        match (self.best_bid(), self.best_ask()) {
            (Some(b), Some(a)) => Some(a - b),
            _ => None,
        }
    }

    /// Top `levels` of each ladder: bids best-first (descending price),
    /// asks best-first (ascending price).
    pub fn depth(&self, levels: usize) -> (Vec<(f64, f64)>, Vec<(f64, f64)>) {
        let bids = self
            .bids
            .iter()
            .rev()
            .take(levels)
            .map(|(&t, &s)| (from_ticks(t), s))
            .collect();
        let asks = self
            .asks
            .iter()
            .take(levels)
            .map(|(&t, &s)| (from_ticks(t), s))
            .collect();
        (bids, asks)
    }

    /// Total size within `pct_of_mid` percent of the mid on one side.
    pub fn volume_within(&self, side: BookSide, pct_of_mid: f64) -> f64 {
        let Some(mid) = self.mid() else { return 0.0 };
        let threshold = mid * (pct_of_mid / 100.0);
        match side {
            BookSide::Bid => self
                .bids
                .iter()
                .filter(|(&t, _)| mid - from_ticks(t) <= threshold)
                .map(|(_, &s)| s)
                .sum(),
            BookSide::Ask => self
                .asks
                .iter()
                .filter(|(&t, _)| from_ticks(t) - mid <= threshold)
                .map(|(_, &s)| s)
                .sum(),
        }
    }

    /// Order-book imbalance on the top `levels`: (bids - asks) / (bids + asks),
    /// in [-1, 1].
    pub fn imbalance(&self, levels: usize) -> f64 {
        let (bids, asks) = self.depth(levels);
        let bid_vol: f64 = bids.iter().map(|(_, s)| s).sum();
        let ask_vol: f64 = asks.iter().map(|(_, s)| s).sum();
        let total = bid_vol + ask_vol;
        if total > 0.0 {
            (bid_vol - ask_vol) / total
        } else {
            0.0
        }
    }

    pub fn is_stale(&self) -> bool {
        now_ts() - self.last_update > STALE_AFTER_SECS
    }

    pub fn is_tradable(&self) -> bool {
        self.initialized && !self.is_stale()
    }

    pub fn update_count(&self) -> u64 {
        self.update_count
    }

    pub fn level_counts(&self) -> (usize, usize) {
        (self.bids.len(), self.asks.len())
    }
}

/// One local book per token. Single writer (the feed dispatcher), many
/// readers; readers may see a slightly stale snapshot, which is acceptable
/// because trades re-check slippage at execution time.
pub struct BookManager {
    books: RwLock<HashMap<String, LocalBook>>,
    max_levels: usize,
}

impl BookManager {
    pub fn new(max_levels: usize) -> Self {
        Self {
            books: RwLock::new(HashMap::new()),
            max_levels,
        }
    }

    pub fn apply(&self, event: FeedEvent) {
        let mut books = self.books.write();
        match event {
            FeedEvent::Snapshot {
                token_id,
                bids,
                asks,
                seq,
            } => {
                let book = books
                    .entry(token_id.clone())
                    .or_insert_with(|| LocalBook::new(token_id, self.max_levels));
                book.apply_snapshot(&bids, &asks, seq);
            }
            FeedEvent::Delta {
                token_id,
                bids,
                asks,
                seq,
            } => {
                let book = books
                    .entry(token_id.clone())
                    .or_insert_with(|| LocalBook::new(token_id, self.max_levels));
                book.apply_delta(&bids, &asks, seq);
            }
        }
    }

    pub fn with_book<R>(&self, token_id: &str, f: impl FnOnce(&LocalBook) -> R) -> Option<R> {
        self.books.read().get(token_id).map(f)
    }

    pub fn best_bid(&self, token_id: &str) -> Option<f64> {
        self.with_book(token_id, |b| b.best_bid()).flatten()
    }

    pub fn best_ask(&self, token_id: &str) -> Option<f64> {
        self.with_book(token_id, |b| b.best_ask()).flatten()
    }

    pub fn remove(&self, token_id: &str) {
        self.books.write().remove(token_id);
    }

    pub fn stale_tokens(&self) -> Vec<String> {
        self.books
            .read()
            .iter()
            .filter(|(_, b)| b.is_stale())
            .map(|(t, _)| t.clone())
            .collect()
    }

    pub fn count(&self) -> usize {
        self.books.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn book() -> LocalBook {
        LocalBook::new("tok", DEFAULT_MAX_LEVELS)
    }

    #[test]
    fn snapshot_sets_best_prices() {
        let mut b = book();
        b.apply_snapshot(
            &[(0.48, 100.0), (0.47, 50.0)],
            &[(0.50, 80.0), (0.51, 40.0)],
            None,
        );
        assert_eq!(b.best_bid(), Some(0.48));
        assert_eq!(b.best_ask(), Some(0.50));
        assert_eq!(b.mid(), Some(0.49));
        assert!((b.spread().unwrap() - 0.02).abs() < 1e-12);
        assert!(b.best_bid().unwrap() < b.best_ask().unwrap());
    }

    #[test]
    fn delta_size_zero_removes_level() {
        let mut b = book();
        b.apply_snapshot(&[(0.48, 100.0)], &[(0.50, 80.0)], None);
        b.apply_delta(&[(0.48, 0.0)], &[], None);
        assert_eq!(b.best_bid(), None);
        assert_eq!(b.best_ask(), Some(0.50));
        assert!(b.mid().is_none());
    }

    #[test]
    fn delta_is_idempotent() {
        let mut a = book();
        let mut b = book();
        let snap_bids = [(0.45, 10.0), (0.44, 20.0)];
        let snap_asks = [(0.55, 10.0)];
        a.apply_snapshot(&snap_bids, &snap_asks, None);
        b.apply_snapshot(&snap_bids, &snap_asks, None);

        let delta_bids = [(0.46, 30.0), (0.44, 0.0)];
        a.apply_delta(&delta_bids, &[], None);
        b.apply_delta(&delta_bids, &[], None);
        b.apply_delta(&delta_bids, &[], None); // twice

        assert_eq!(a.depth(10), b.depth(10));
        assert_eq!(b.best_bid(), Some(0.46));
    }

    #[test]
    fn ladders_trim_to_max_levels() {
        let mut b = LocalBook::new("tok", 5);
        let bids: Vec<(f64, f64)> = (0..20).map(|i| (0.10 + i as f64 * 0.01, 1.0)).collect();
        let asks: Vec<(f64, f64)> = (0..20).map(|i| (0.60 + i as f64 * 0.01, 1.0)).collect();
        b.apply_snapshot(&bids, &asks, None);
        let (bl, al) = b.level_counts();
        assert_eq!((bl, al), (5, 5));
        // Best levels survive the trim.
        assert_eq!(b.best_bid(), Some(0.29));
        assert_eq!(b.best_ask(), Some(0.60));

        for i in 0..20 {
            b.apply_delta(&[(0.30 + i as f64 * 0.01, 2.0)], &[], None);
        }
        assert!(b.level_counts().0 <= 5);
    }

    #[test]
    fn invalid_levels_are_rejected_without_corruption() {
        let mut b = book();
        b.apply_snapshot(&[(0.48, 100.0)], &[(0.50, 80.0)], None);
        b.apply_delta(&[(-0.1, 5.0), (1.5, 5.0), (0.47, -3.0)], &[(0.49, f64::NAN)], None);
        assert_eq!(b.best_bid(), Some(0.48));
        assert_eq!(b.best_ask(), Some(0.50));
        assert_eq!(b.level_counts(), (1, 1));
    }

    #[test]
    fn sequence_gap_invalidates_until_snapshot() {
        let mut b = book();
        b.apply_snapshot(&[(0.48, 100.0)], &[(0.50, 80.0)], Some(10));
        b.apply_delta(&[(0.49, 5.0)], &[], Some(11));
        assert!(b.is_tradable());

        b.apply_delta(&[(0.49, 6.0)], &[], Some(15)); // gap
        assert!(!b.is_tradable());
        assert_eq!(b.best_bid(), None);

        b.apply_snapshot(&[(0.48, 100.0)], &[(0.50, 80.0)], Some(16));
        assert!(b.is_tradable());
    }

    #[test]
    fn delta_on_fresh_book_initializes_it() {
        let mut b = book();
        b.apply_delta(&[(0.40, 10.0)], &[(0.60, 10.0)], None);
        assert!(b.initialized);
        assert_eq!(b.best_bid(), Some(0.40));
    }

    #[test]
    fn imbalance_and_volume_within() {
        let mut b = book();
        b.apply_snapshot(&[(0.49, 300.0)], &[(0.51, 100.0)], None);
        assert!((b.imbalance(5) - 0.5).abs() < 1e-12);
        // 5% of mid 0.50 = 0.025 band; both touches are within it.
        assert_eq!(b.volume_within(BookSide::Bid, 5.0), 300.0);
        assert_eq!(b.volume_within(BookSide::Ask, 5.0), 100.0);
    }

    #[test]
    fn manager_routes_events_per_token() {
        let mgr = BookManager::new(10);
        mgr.apply(FeedEvent::Snapshot {
            token_id: "a".into(),
            bids: vec![(0.40, 1.0)],
            asks: vec![(0.60, 1.0)],
            seq: None,
        });
        mgr.apply(FeedEvent::Delta {
            token_id: "b".into(),
            bids: vec![(0.30, 1.0)],
            asks: vec![],
            seq: None,
        });
        assert_eq!(mgr.count(), 2);
        assert_eq!(mgr.best_bid("a"), Some(0.40));
        assert_eq!(mgr.best_bid("b"), Some(0.30));
        assert_eq!(mgr.best_ask("b"), None);
    }
}
