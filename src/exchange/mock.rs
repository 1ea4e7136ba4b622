//! Scriptable in-memory exchange, used by the engine tests and by the
//! integration suite. Presents the same `ExchangeAdapter` interface as the
//! real clients so nothing above the adapter seam knows the difference.

use crate::error::AdapterError;
use crate::exchange::{AdapterFactory, ExchangeAdapter};
use crate::models::{
    BracketOrderHandle, BracketState, Exchange, ExchangeCredentials, MarketFill, OrderStatus,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct MockState {
    price: Option<f64>,
    balance: Option<f64>,
    bracket: Option<BracketState>,
    fill_price: Option<f64>,
    order_status: Option<OrderStatus>,
    cancel_fails: bool,
    failing_ops: HashSet<&'static str>,
    calls: Vec<String>,
}

/// Scripted responses; every unset query answers `NotFound`.
pub struct MockExchangeAdapter {
    exchange: Exchange,
    state: Mutex<MockState>,
}

impl MockExchangeAdapter {
    pub fn new(exchange: Exchange) -> Self {
        Self {
            exchange,
            state: Mutex::new(MockState::default()),
        }
    }

    pub fn with_price(self, price: f64) -> Self {
        self.state.lock().unwrap().price = Some(price);
        self
    }

    pub fn with_balance(self, balance: f64) -> Self {
        self.state.lock().unwrap().balance = Some(balance);
        self
    }

    pub fn with_bracket(self, bracket: BracketState) -> Self {
        self.state.lock().unwrap().bracket = Some(bracket);
        self
    }

    pub fn with_order_status(self, status: OrderStatus) -> Self {
        self.state.lock().unwrap().order_status = Some(status);
        self
    }

    /// Market sells fill at this price instead of the scripted quote
    pub fn with_fill_price(self, price: f64) -> Self {
        self.state.lock().unwrap().fill_price = Some(price);
        self
    }

    pub fn with_failing_cancel(self) -> Self {
        self.state.lock().unwrap().cancel_fails = true;
        self
    }

    /// Make one operation fail with a network-class error
    pub fn with_failing_op(self, operation: &'static str) -> Self {
        self.state.lock().unwrap().failing_ops.insert(operation);
        self
    }

    /// Names of adapter methods invoked, in order
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn sell_count(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| c.starts_with("place_market_sell"))
            .count()
    }

    fn record(&self, call: &str) -> Result<(), AdapterError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(call.to_string());
        let op = call.split(' ').next().unwrap_or(call);
        if state.failing_ops.contains(op) {
            return Err(AdapterError::Http {
                exchange: self.exchange,
                operation: "scripted_failure",
                status: 503,
                body: format!("scripted failure for {}", op),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ExchangeAdapter for MockExchangeAdapter {
    fn exchange(&self) -> Exchange {
        self.exchange
    }

    async fn get_order_status(
        &self,
        symbol: &str,
        order_id: &str,
    ) -> Result<OrderStatus, AdapterError> {
        self.record(&format!("get_order_status {} {}", symbol, order_id))?;
        self.state
            .lock()
            .unwrap()
            .order_status
            .ok_or(AdapterError::NotFound {
                exchange: self.exchange,
                operation: "get_order_status",
            })
    }

    async fn get_bracket_status(
        &self,
        symbol: &str,
        handle: &BracketOrderHandle,
    ) -> Result<BracketState, AdapterError> {
        self.record(&format!("get_bracket_status {} {}", symbol, handle.group_id))?;
        self.state
            .lock()
            .unwrap()
            .bracket
            .clone()
            .ok_or(AdapterError::NotFound {
                exchange: self.exchange,
                operation: "get_bracket_status",
            })
    }

    async fn get_balance(&self, asset: &str) -> Result<f64, AdapterError> {
        self.record(&format!("get_balance {}", asset))?;
        self.state
            .lock()
            .unwrap()
            .balance
            .ok_or(AdapterError::NotFound {
                exchange: self.exchange,
                operation: "get_balance",
            })
    }

    async fn place_market_sell(
        &self,
        symbol: &str,
        quantity: f64,
    ) -> Result<MarketFill, AdapterError> {
        self.record(&format!("place_market_sell {} {}", symbol, quantity))?;
        let state = self.state.lock().unwrap();
        let fill_price = state
            .fill_price
            .or(state.price)
            .ok_or(AdapterError::MalformedResponse {
                exchange: self.exchange,
                operation: "place_market_sell",
                message: "no scripted fill price".to_string(),
            })?;
        Ok(MarketFill {
            order_id: format!("mock-{}", state.calls.len()),
            fill_price,
            filled_quantity: quantity,
        })
    }

    async fn get_current_price(&self, symbol: &str) -> Result<f64, AdapterError> {
        self.record(&format!("get_current_price {}", symbol))?;
        self.state
            .lock()
            .unwrap()
            .price
            .ok_or(AdapterError::NotFound {
                exchange: self.exchange,
                operation: "get_current_price",
            })
    }

    async fn cancel_bracket(
        &self,
        symbol: &str,
        handle: &BracketOrderHandle,
    ) -> Result<(), AdapterError> {
        self.record(&format!("cancel_bracket {} {}", symbol, handle.group_id))?;
        let state = self.state.lock().unwrap();
        if state.cancel_fails {
            return Err(AdapterError::Http {
                exchange: self.exchange,
                operation: "cancel_bracket",
                status: 400,
                body: "scripted cancel failure".to_string(),
            });
        }
        Ok(())
    }
}

/// Hands out pre-registered mock adapters; unknown exchanges get an
/// empty mock whose every query answers `NotFound`.
#[derive(Default)]
pub struct MockAdapterFactory {
    adapters: Mutex<HashMap<Exchange, Arc<MockExchangeAdapter>>>,
}

impl MockAdapterFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(self, exchange: Exchange, adapter: Arc<MockExchangeAdapter>) -> Self {
        self.adapters.lock().unwrap().insert(exchange, adapter);
        self
    }
}

impl AdapterFactory for MockAdapterFactory {
    fn adapter_for(
        &self,
        exchange: Exchange,
        _credentials: &ExchangeCredentials,
    ) -> Arc<dyn ExchangeAdapter> {
        let registered = self.adapters.lock().unwrap().get(&exchange).cloned();
        match registered {
            Some(adapter) => adapter,
            None => Arc::new(MockExchangeAdapter::new(exchange)),
        }
    }
}
