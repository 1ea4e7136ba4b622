pub mod binance;
pub mod bybit;
pub mod mock;
pub mod okx;
pub mod signing;

pub use binance::BinanceAdapter;
pub use bybit::BybitAdapter;
pub use mock::{MockAdapterFactory, MockExchangeAdapter};
pub use okx::OkxAdapter;

use crate::error::AdapterError;
use crate::models::{
    BracketOrderHandle, BracketState, Exchange, ExchangeCredentials, MarketFill, OrderStatus,
};
use crate::ratelimit::RateLimiter;
use async_trait::async_trait;
use std::sync::Arc;

/// One origin exchange's REST surface, normalized.
///
/// Status queries are read-only and safe to repeat. `place_market_sell` is
/// NOT idempotent; the position state machine guarantees at-most-once
/// invocation per position. Every method routes through the rate limiter
/// before touching the network.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    fn exchange(&self) -> Exchange;

    async fn get_order_status(
        &self,
        symbol: &str,
        order_id: &str,
    ) -> Result<OrderStatus, AdapterError>;

    async fn get_bracket_status(
        &self,
        symbol: &str,
        handle: &BracketOrderHandle,
    ) -> Result<BracketState, AdapterError>;

    /// Free balance of one asset
    async fn get_balance(&self, asset: &str) -> Result<f64, AdapterError>;

    async fn place_market_sell(
        &self,
        symbol: &str,
        quantity: f64,
    ) -> Result<MarketFill, AdapterError>;

    async fn get_current_price(&self, symbol: &str) -> Result<f64, AdapterError>;

    async fn cancel_bracket(
        &self,
        symbol: &str,
        handle: &BracketOrderHandle,
    ) -> Result<(), AdapterError>;
}

/// Builds adapters per exchange. A seam so the engine can run over mocks.
pub trait AdapterFactory: Send + Sync {
    fn adapter_for(
        &self,
        exchange: Exchange,
        credentials: &ExchangeCredentials,
    ) -> Arc<dyn ExchangeAdapter>;
}

/// Production factory: one REST client per exchange, all sharing one
/// rate limiter instance.
pub struct LiveAdapterFactory {
    limiter: Arc<RateLimiter>,
}

impl LiveAdapterFactory {
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self { limiter }
    }
}

impl AdapterFactory for LiveAdapterFactory {
    fn adapter_for(
        &self,
        exchange: Exchange,
        credentials: &ExchangeCredentials,
    ) -> Arc<dyn ExchangeAdapter> {
        match exchange {
            Exchange::Binance => Arc::new(BinanceAdapter::new(
                credentials.clone(),
                self.limiter.clone(),
            )),
            Exchange::Bybit => Arc::new(BybitAdapter::new(
                credentials.clone(),
                self.limiter.clone(),
            )),
            Exchange::Okx => Arc::new(OkxAdapter::new(
                credentials.clone(),
                self.limiter.clone(),
            )),
        }
    }
}

/// Render a base-asset quantity without trailing zeros ("0.00200000" is
/// rejected by some symbols' lot filters)
pub(crate) fn format_quantity(quantity: f64) -> String {
    let s = format!("{:.8}", quantity);
    let s = s.trim_end_matches('0').trim_end_matches('.');
    s.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_quantity() {
        assert_eq!(format_quantity(0.002), "0.002");
        assert_eq!(format_quantity(1.0), "1");
        assert_eq!(format_quantity(0.10000001), "0.10000001");
        assert_eq!(format_quantity(12.5), "12.5");
    }
}
