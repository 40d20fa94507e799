use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

/// Failure taxonomy for everything that crosses the exchange boundary.
/// The queue retries everything except validation and circuit-open.
#[derive(Debug, Clone, Error)]
pub enum ExchangeError {
    #[error("transient: {0}")]
    Transient(String),
    #[error("rate limited")]
    RateLimited,
    #[error("validation: {0}")]
    Validation(String),
    #[error("circuit open")]
    CircuitOpen,
    #[error("insufficient balance: {0}")]
    InsufficientBalance(String),
    #[error("{0}")]
    Other(String),
}

impl ExchangeError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Validation(_) | Self::CircuitOpen)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Tif {
    Gtc,
    Fok,
}

impl Tif {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tif::Gtc => "GTC",
            Tif::Fok => "FOK",
        }
    }
}

/// Exchange-side order status. The raw wire values (`open`, `matched`,
/// `canceled`, `expired`, `live`, `rejected`) are pinned here so the rest of
/// the core never touches the string contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Open,
    Matched,
    Canceled,
    Expired,
    Live,
    Rejected,
}

impl OrderStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "matched" | "filled" => OrderStatus::Matched,
            "canceled" | "cancelled" => OrderStatus::Canceled,
            "expired" => OrderStatus::Expired,
            "live" => OrderStatus::Live,
            "rejected" => OrderStatus::Rejected,
            _ => OrderStatus::Open,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Matched | OrderStatus::Canceled | OrderStatus::Expired
        )
    }
}

#[derive(Debug, Clone)]
pub struct PlacedOrder {
    pub order_id: String,
}

impl PlacedOrder {
    /// Adapters return plain maps; the id key differs between the order
    /// placement (`orderID`) and order lookup (`id`) endpoints.
    pub fn from_raw(raw: &JsonValue) -> Option<Self> {
        let order_id = raw
            .get("orderID")
            .or_else(|| raw.get("id"))
            .and_then(|v| v.as_str())?
            .to_string();
        Some(Self { order_id })
    }
}

/// Translated view of one live exchange order. Field names `sizeMatched`
/// and `avgPrice` are part of the wire contract and stop here.
#[derive(Debug, Clone)]
pub struct OrderState {
    pub status: OrderStatus,
    pub size_matched: f64,
    pub avg_price: f64,
}

impl OrderState {
    pub fn from_raw(raw: &JsonValue) -> Self {
        let status = raw
            .get("status")
            .and_then(|v| v.as_str())
            .map(OrderStatus::parse)
            .unwrap_or(OrderStatus::Open);
        let size_matched = raw
            .get("sizeMatched")
            .and_then(json_f64)
            .unwrap_or(0.0);
        let avg_price = raw.get("avgPrice").and_then(json_f64).unwrap_or(0.0);
        Self {
            status,
            size_matched,
            avg_price,
        }
    }
}

// The API emits numbers both as JSON numbers and as strings.
fn json_f64(v: &JsonValue) -> Option<f64> {
    v.as_f64().or_else(|| v.as_str().and_then(|s| s.parse().ok()))
}

/// An order signed ahead of time so the submission hot path skips the
/// signing latency. Signing itself happens in the adapter.
#[derive(Debug, Clone)]
pub struct PresignedOrder {
    pub token_id: String,
    pub side: Side,
    pub price: f64,
    pub size: f64,
    pub payload: String,
    pub expires_at: chrono::DateTime<chrono::Utc>,
}

impl PresignedOrder {
    pub fn is_expired(&self) -> bool {
        chrono::Utc::now() >= self.expires_at
    }
}

#[derive(Debug, Clone)]
pub struct OpenOrder {
    pub order_id: String,
    pub token_id: String,
    pub side: Side,
    pub price: f64,
    pub size: f64,
    pub state: OrderState,
}

/// Private exchange surface consumed by the order queue, the fill manager
/// and the executor. The HTTP wrapper implementing this lives outside the
/// core; a shadow implementation below keeps the binary runnable without it.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    async fn create_limit_order(
        &self,
        token_id: &str,
        side: Side,
        price: f64,
        size: f64,
        tif: Tif,
    ) -> Result<PlacedOrder, ExchangeError>;

    /// BUY amount is USDC, SELL amount is shares.
    async fn create_market_order(
        &self,
        token_id: &str,
        side: Side,
        amount: f64,
    ) -> Result<PlacedOrder, ExchangeError>;

    async fn submit_presigned(&self, order: &PresignedOrder) -> Result<PlacedOrder, ExchangeError>;

    async fn cancel_order(&self, order_id: &str) -> Result<(), ExchangeError>;

    async fn cancel_all(&self) -> Result<u64, ExchangeError>;

    async fn get_open_orders(&self) -> Result<Vec<OpenOrder>, ExchangeError>;

    async fn get_order(&self, order_id: &str) -> Result<Option<OrderState>, ExchangeError>;

    /// Recent account trades, newest first.
    async fn get_trades(&self, limit: usize) -> Result<Vec<JsonValue>, ExchangeError>;

    async fn get_balance(&self) -> Result<f64, ExchangeError>;

    /// Best-effort redemption of a resolved market. The on-chain signing is
    /// the adapter's problem; the core only requests it.
    async fn redeem_all(&self, market_id: &str) -> Result<(), ExchangeError>;
}

/// One page of the exchange's market catalog.
#[derive(Debug, Clone, Default)]
pub struct CatalogPage {
    pub markets: Vec<CatalogMarket>,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogMarket {
    pub id: String,
    pub condition_id: String,
    pub question: String,
    pub token_yes_id: String,
    pub token_no_id: String,
    pub price_yes: f64,
    pub price_no: f64,
    pub volume: f64,
    pub liquidity: f64,
    pub end_date: Option<chrono::DateTime<chrono::Utc>>,
    pub active: bool,
}

/// Public market-data surface consumed by the scanner.
#[async_trait]
pub trait MarketCatalog: Send + Sync {
    async fn fetch_page(&self, cursor: Option<&str>) -> Result<CatalogPage, ExchangeError>;

    /// Full book for one token, as (price, size) ladders.
    async fn fetch_book(
        &self,
        token_id: &str,
    ) -> Result<(Vec<(f64, f64)>, Vec<(f64, f64)>), ExchangeError>;
}

/// Shadow client: accepts orders and acknowledges them with generated ids,
/// never fills, never errors. Lets the whole pipeline run end-to-end when
/// no real exchange adapter is wired in (RUN_MODE=shadow).
pub struct ShadowExchange;

#[async_trait]
impl ExchangeClient for ShadowExchange {
    async fn create_limit_order(
        &self,
        token_id: &str,
        side: Side,
        price: f64,
        size: f64,
        tif: Tif,
    ) -> Result<PlacedOrder, ExchangeError> {
        let order_id = Uuid::new_v4().to_string();
        log::info!(
            "shadow.limit_order id={} token={} side={} px={:.4} size={:.2} tif={}",
            order_id,
            token_id,
            side.as_str(),
            price,
            size,
            tif.as_str()
        );
        Ok(PlacedOrder { order_id })
    }

    async fn create_market_order(
        &self,
        token_id: &str,
        side: Side,
        amount: f64,
    ) -> Result<PlacedOrder, ExchangeError> {
        let order_id = Uuid::new_v4().to_string();
        log::info!(
            "shadow.market_order id={} token={} side={} amount={:.2}",
            order_id,
            token_id,
            side.as_str(),
            amount
        );
        Ok(PlacedOrder { order_id })
    }

    async fn submit_presigned(
        &self,
        order: &PresignedOrder,
    ) -> Result<PlacedOrder, ExchangeError> {
        if order.is_expired() {
            return Err(ExchangeError::Validation("presigned order expired".into()));
        }
        Ok(PlacedOrder {
            order_id: Uuid::new_v4().to_string(),
        })
    }

    async fn cancel_order(&self, _order_id: &str) -> Result<(), ExchangeError> {
        Ok(())
    }

    async fn cancel_all(&self) -> Result<u64, ExchangeError> {
        Ok(0)
    }

    async fn get_open_orders(&self) -> Result<Vec<OpenOrder>, ExchangeError> {
        Ok(Vec::new())
    }

    async fn get_order(&self, _order_id: &str) -> Result<Option<OrderState>, ExchangeError> {
        Ok(Some(OrderState {
            status: OrderStatus::Open,
            size_matched: 0.0,
            avg_price: 0.0,
        }))
    }

    async fn get_trades(&self, _limit: usize) -> Result<Vec<JsonValue>, ExchangeError> {
        Ok(Vec::new())
    }

    async fn get_balance(&self) -> Result<f64, ExchangeError> {
        Ok(0.0)
    }

    async fn redeem_all(&self, _market_id: &str) -> Result<(), ExchangeError> {
        Ok(())
    }
}

/// Empty catalog for shadow runs without a market-data adapter.
pub struct StaticCatalog;

#[async_trait]
impl MarketCatalog for StaticCatalog {
    async fn fetch_page(&self, _cursor: Option<&str>) -> Result<CatalogPage, ExchangeError> {
        Ok(CatalogPage::default())
    }

    async fn fetch_book(
        &self,
        _token_id: &str,
    ) -> Result<(Vec<(f64, f64)>, Vec<(f64, f64)>), ExchangeError> {
        Ok((Vec::new(), Vec::new()))
    }
}
