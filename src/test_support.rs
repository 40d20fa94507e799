//! Shared mocks for component tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::exchange::{
    ExchangeClient, ExchangeError, OpenOrder, OrderState, OrderStatus, PlacedOrder,
    PresignedOrder, Side, Tif,
};
use crate::fill_manager::{FillSink, Leg};

/// Scriptable in-memory exchange double.
#[derive(Default)]
pub struct MockExchange {
    pub limit_orders: Mutex<Vec<(String, Side, f64, f64, Tif)>>,
    pub market_orders: Mutex<Vec<(String, Side, f64)>>,
    pub cancels: Mutex<Vec<String>>,
    pub redeems: Mutex<Vec<String>>,
    pub limit_attempts: AtomicUsize,
    pub balance: Mutex<f64>,
    next_id: AtomicU64,
    // token -> remaining transient failures
    fail_counts: Mutex<HashMap<String, u32>>,
    // token -> persistent error
    fail_errors: Mutex<HashMap<String, ExchangeError>>,
    // order_id -> remaining get_order failures
    fail_gets: Mutex<HashMap<String, u32>>,
    cancel_fails: Mutex<HashMap<String, u32>>,
    order_states: Mutex<HashMap<String, OrderState>>,
}

impl MockExchange {
    pub fn fail_next(&self, token: &str, times: u32) {
        self.fail_counts.lock().insert(token.to_string(), times);
    }

    pub fn fail_with(&self, token: &str, error: ExchangeError) {
        self.fail_errors.lock().insert(token.to_string(), error);
    }

    pub fn fail_get_order(&self, order_id: &str) {
        *self.fail_gets.lock().entry(order_id.to_string()).or_insert(0) += 1;
    }

    pub fn fail_cancel(&self, order_id: &str, times: u32) {
        self.cancel_fails.lock().insert(order_id.to_string(), times);
    }

    pub fn set_order_state(&self, order_id: &str, state: OrderState) {
        self.order_states.lock().insert(order_id.to_string(), state);
    }

    fn next_order_id(&self) -> String {
        format!("mock-{}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn check_failures(&self, token: &str) -> Result<(), ExchangeError> {
        if let Some(err) = self.fail_errors.lock().get(token) {
            return Err(err.clone());
        }
        let mut counts = self.fail_counts.lock();
        if let Some(n) = counts.get_mut(token) {
            if *n > 0 {
                *n -= 1;
                return Err(ExchangeError::Transient(format!("mock failure for {token}")));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ExchangeClient for MockExchange {
    async fn create_limit_order(
        &self,
        token_id: &str,
        side: Side,
        price: f64,
        size: f64,
        tif: Tif,
    ) -> Result<PlacedOrder, ExchangeError> {
        self.limit_attempts.fetch_add(1, Ordering::SeqCst);
        self.check_failures(token_id)?;
        self.limit_orders
            .lock()
            .push((token_id.to_string(), side, price, size, tif));
        Ok(PlacedOrder {
            order_id: self.next_order_id(),
        })
    }

    async fn create_market_order(
        &self,
        token_id: &str,
        side: Side,
        amount: f64,
    ) -> Result<PlacedOrder, ExchangeError> {
        self.check_failures(token_id)?;
        self.market_orders
            .lock()
            .push((token_id.to_string(), side, amount));
        Ok(PlacedOrder {
            order_id: self.next_order_id(),
        })
    }

    async fn submit_presigned(
        &self,
        order: &PresignedOrder,
    ) -> Result<PlacedOrder, ExchangeError> {
        self.check_failures(&order.token_id)?;
        Ok(PlacedOrder {
            order_id: self.next_order_id(),
        })
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), ExchangeError> {
        {
            let mut fails = self.cancel_fails.lock();
            if let Some(n) = fails.get_mut(order_id) {
                if *n > 0 {
                    *n -= 1;
                    return Err(ExchangeError::Transient("mock cancel failure".into()));
                }
            }
        }
        self.cancels.lock().push(order_id.to_string());
        Ok(())
    }

    async fn cancel_all(&self) -> Result<u64, ExchangeError> {
        Ok(0)
    }

    async fn get_open_orders(&self) -> Result<Vec<OpenOrder>, ExchangeError> {
        Ok(Vec::new())
    }

    async fn get_trades(&self, _limit: usize) -> Result<Vec<serde_json::Value>, ExchangeError> {
        Ok(Vec::new())
    }

    async fn get_order(&self, order_id: &str) -> Result<Option<OrderState>, ExchangeError> {
        {
            let mut fails = self.fail_gets.lock();
            if let Some(n) = fails.get_mut(order_id) {
                if *n > 0 {
                    *n -= 1;
                    return Err(ExchangeError::Transient("mock get_order failure".into()));
                }
            }
        }
        Ok(self.order_states.lock().get(order_id).cloned().or(Some(OrderState {
            status: OrderStatus::Open,
            size_matched: 0.0,
            avg_price: 0.0,
        })))
    }

    async fn get_balance(&self) -> Result<f64, ExchangeError> {
        Ok(*self.balance.lock())
    }

    async fn redeem_all(&self, market_id: &str) -> Result<(), ExchangeError> {
        self.redeems.lock().push(market_id.to_string());
        Ok(())
    }
}

/// FillSink that records every callback.
#[derive(Default)]
pub struct RecordingSink {
    pub fills: Mutex<Vec<(String, Leg, f64, f64)>>,
    pub ends: Mutex<Vec<(String, Leg, f64)>>,
}

#[async_trait]
impl FillSink for RecordingSink {
    async fn on_fill(&self, market_id: &str, leg: Leg, qty: f64, price: f64) {
        self.fills
            .lock()
            .push((market_id.to_string(), leg, qty, price));
    }

    async fn on_order_end(&self, market_id: &str, leg: Leg, remaining: f64) {
        self.ends.lock().push((market_id.to_string(), leg, remaining));
    }
}
