use crate::error::AdapterError;
use crate::exchange::{format_quantity, signing, ExchangeAdapter};
use crate::models::{
    BracketOrderHandle, BracketState, Exchange, ExchangeCredentials, FilledLeg, MarketFill,
    OrderStatus,
};
use crate::ratelimit::{EndpointClass, Priority, RateLimiter};
use crate::retry::{with_retry, RetryConfig};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::Arc;

const BYBIT_API_BASE: &str = "https://api.bybit.com";
const RECV_WINDOW: &str = "5000";

// v5 retCode values
const RET_OK: i64 = 0;
const RET_RATE_LIMIT: i64 = 10006;
const RET_IP_RATE_LIMIT: i64 = 10018;
const RET_ORDER_NOT_FOUND: i64 = 170213;

/// Bybit v5 REST client (spot category).
///
/// Signing: HMAC-SHA256 hex over `timestamp + apiKey + recvWindow +
/// payload` where payload is the query string for GET and the raw JSON
/// body for POST; carried in the `X-BAPI-*` headers.
pub struct BybitAdapter {
    client: Client,
    base_url: String,
    credentials: ExchangeCredentials,
    limiter: Arc<RateLimiter>,
    retry: RetryConfig,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BybitResponse<T> {
    ret_code: i64,
    ret_msg: String,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct OrderList {
    #[serde(default)]
    list: Vec<OrderEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderEntry {
    order_id: String,
    order_status: String,
    #[serde(default)]
    avg_price: String,
    #[serde(default)]
    cum_exec_qty: String,
    #[serde(default)]
    stop_order_type: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TickerList {
    list: Vec<TickerEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TickerEntry {
    last_price: String,
}

#[derive(Debug, Deserialize)]
struct WalletList {
    list: Vec<WalletEntry>,
}

#[derive(Debug, Deserialize)]
struct WalletEntry {
    coin: Vec<CoinBalance>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CoinBalance {
    coin: String,
    wallet_balance: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateOrderResult {
    order_id: String,
}

/// Bybit order-status vocabulary onto the shared enum
fn normalize_status(status: &str) -> OrderStatus {
    match status {
        "Created" | "New" | "Untriggered" | "Triggered" => OrderStatus::Pending,
        "PartiallyFilled" => OrderStatus::PartiallyFilled,
        "Filled" => OrderStatus::Filled,
        "Cancelled" | "PartiallyFilledCanceled" => OrderStatus::Cancelled,
        "Rejected" => OrderStatus::Rejected,
        "Deactivated" | "Expired" => OrderStatus::Expired,
        _ => OrderStatus::NotFound,
    }
}

fn leg_of(stop_order_type: &str) -> Option<FilledLeg> {
    match stop_order_type {
        "TakeProfit" | "PartialTakeProfit" => Some(FilledLeg::TakeProfit),
        "StopLoss" | "PartialStopLoss" => Some(FilledLeg::StopLoss),
        _ => None,
    }
}

impl BybitAdapter {
    pub fn new(credentials: ExchangeCredentials, limiter: Arc<RateLimiter>) -> Self {
        Self {
            client: Client::new(),
            base_url: BYBIT_API_BASE.to_string(),
            credentials,
            limiter,
            retry: RetryConfig::default(),
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    fn parse_f64(&self, value: &str, operation: &'static str) -> Result<f64, AdapterError> {
        value
            .parse::<f64>()
            .map_err(|_| AdapterError::MalformedResponse {
                exchange: Exchange::Bybit,
                operation,
                message: format!("bad numeric field: {:?}", value),
            })
    }

    fn auth_headers(
        &self,
        payload: &str,
        timestamp: i64,
    ) -> Result<[(&'static str, String); 4], AdapterError> {
        let ts = timestamp.to_string();
        let prehash = signing::bybit_prehash(&ts, &self.credentials.api_key, RECV_WINDOW, payload);
        let signature = signing::sign_hex(&self.credentials.api_secret, &prehash).map_err(|e| {
            AdapterError::Signing {
                exchange: Exchange::Bybit,
                message: e.to_string(),
            }
        })?;
        Ok([
            ("X-BAPI-API-KEY", self.credentials.api_key.clone()),
            ("X-BAPI-TIMESTAMP", ts),
            ("X-BAPI-RECV-WINDOW", RECV_WINDOW.to_string()),
            ("X-BAPI-SIGN", signature),
        ])
    }

    async fn handle_response<T: DeserializeOwned>(
        &self,
        response: reqwest::Response,
        operation: &'static str,
        class: EndpointClass,
    ) -> Result<T, AdapterError> {
        let status = response.status();
        if status.as_u16() == 429 {
            self.limiter.record_throttle(Exchange::Bybit, class);
            return Err(AdapterError::Throttled {
                exchange: Exchange::Bybit,
                operation,
            });
        }
        let body = response
            .text()
            .await
            .map_err(|e| AdapterError::Network {
                exchange: Exchange::Bybit,
                operation,
                source: e,
            })?;
        if !status.is_success() {
            return Err(AdapterError::Http {
                exchange: Exchange::Bybit,
                operation,
                status: status.as_u16(),
                body,
            });
        }
        let parsed: BybitResponse<T> =
            serde_json::from_str(&body).map_err(|e| AdapterError::MalformedResponse {
                exchange: Exchange::Bybit,
                operation,
                message: e.to_string(),
            })?;
        match parsed.ret_code {
            RET_OK => {
                self.limiter.record_success(Exchange::Bybit, class);
                parsed.result.ok_or(AdapterError::MalformedResponse {
                    exchange: Exchange::Bybit,
                    operation,
                    message: "retCode 0 without result".to_string(),
                })
            }
            RET_RATE_LIMIT | RET_IP_RATE_LIMIT => {
                self.limiter.record_throttle(Exchange::Bybit, class);
                Err(AdapterError::Throttled {
                    exchange: Exchange::Bybit,
                    operation,
                })
            }
            RET_ORDER_NOT_FOUND => Err(AdapterError::NotFound {
                exchange: Exchange::Bybit,
                operation,
            }),
            code => Err(AdapterError::Http {
                exchange: Exchange::Bybit,
                operation,
                status: status.as_u16(),
                body: format!("retCode {}: {}", code, parsed.ret_msg),
            }),
        }
    }

    async fn public_get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &str,
        operation: &'static str,
        priority: Priority,
    ) -> Result<T, AdapterError> {
        with_retry(&self.retry, operation, || async move {
            self.limiter
                .acquire(Exchange::Bybit, EndpointClass::MarketData, priority)
                .await;
            let url = format!("{}{}?{}", self.base_url, path, query);
            let response =
                self.client
                    .get(&url)
                    .send()
                    .await
                    .map_err(|e| AdapterError::Network {
                        exchange: Exchange::Bybit,
                        operation,
                        source: e,
                    })?;
            self.handle_response(response, operation, EndpointClass::MarketData)
                .await
        })
        .await
    }

    async fn signed_get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &str,
        operation: &'static str,
        priority: Priority,
    ) -> Result<T, AdapterError> {
        with_retry(&self.retry, operation, || async move {
            self.limiter
                .acquire(Exchange::Bybit, EndpointClass::Orders, priority)
                .await;
            let headers = self.auth_headers(query, Utc::now().timestamp_millis())?;
            let url = format!("{}{}?{}", self.base_url, path, query);
            let mut request = self.client.get(&url);
            for (name, value) in &headers {
                request = request.header(*name, value);
            }
            let response = request.send().await.map_err(|e| AdapterError::Network {
                exchange: Exchange::Bybit,
                operation,
                source: e,
            })?;
            self.handle_response(response, operation, EndpointClass::Orders)
                .await
        })
        .await
    }

    async fn signed_post<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
        operation: &'static str,
        priority: Priority,
    ) -> Result<T, AdapterError> {
        with_retry(&self.retry, operation, || async move {
            self.limiter
                .acquire(Exchange::Bybit, EndpointClass::Orders, priority)
                .await;
            let payload = body.to_string();
            let headers = self.auth_headers(&payload, Utc::now().timestamp_millis())?;
            let url = format!("{}{}", self.base_url, path);
            let mut request = self
                .client
                .post(&url)
                .header("Content-Type", "application/json")
                .body(payload.clone());
            for (name, value) in &headers {
                request = request.header(*name, value);
            }
            let response = request.send().await.map_err(|e| AdapterError::Network {
                exchange: Exchange::Bybit,
                operation,
                source: e,
            })?;
            self.handle_response(response, operation, EndpointClass::Orders)
                .await
        })
        .await
    }

    /// Spot market orders leave the realtime endpoint once terminal; fall
    /// back to order history to read the fill
    async fn fetch_fill(
        &self,
        symbol: &str,
        order_id: &str,
        operation: &'static str,
    ) -> Result<MarketFill, AdapterError> {
        let realtime_query = format!("category=spot&symbol={}&orderId={}", symbol, order_id);
        let mut orders: OrderList = self
            .signed_get(
                "/v5/order/realtime",
                &realtime_query,
                operation,
                Priority::Urgent,
            )
            .await?;
        if orders.list.is_empty() {
            orders = self
                .signed_get(
                    "/v5/order/history",
                    &realtime_query,
                    operation,
                    Priority::Urgent,
                )
                .await?;
        }
        let entry = orders.list.first().ok_or(AdapterError::NotFound {
            exchange: Exchange::Bybit,
            operation,
        })?;
        let fill_price = self.parse_f64(&entry.avg_price, operation)?;
        let filled_quantity = self.parse_f64(&entry.cum_exec_qty, operation)?;
        if fill_price <= 0.0 || filled_quantity <= 0.0 {
            return Err(AdapterError::MalformedResponse {
                exchange: Exchange::Bybit,
                operation,
                message: "market sell reported no fill".to_string(),
            });
        }
        Ok(MarketFill {
            order_id: entry.order_id.clone(),
            fill_price,
            filled_quantity,
        })
    }
}

#[async_trait]
impl ExchangeAdapter for BybitAdapter {
    fn exchange(&self) -> Exchange {
        Exchange::Bybit
    }

    async fn get_order_status(
        &self,
        symbol: &str,
        order_id: &str,
    ) -> Result<OrderStatus, AdapterError> {
        let query = format!("category=spot&symbol={}&orderId={}", symbol, order_id);
        let orders: OrderList = self
            .signed_get(
                "/v5/order/realtime",
                &query,
                "get_order_status",
                Priority::Normal,
            )
            .await?;
        match orders.list.first() {
            Some(entry) => Ok(normalize_status(&entry.order_status)),
            None => Ok(OrderStatus::NotFound),
        }
    }

    async fn get_bracket_status(
        &self,
        symbol: &str,
        handle: &BracketOrderHandle,
    ) -> Result<BracketState, AdapterError> {
        let query = format!(
            "category=spot&symbol={}&orderLinkId={}&orderFilter=tpslOrder",
            symbol, handle.group_id
        );
        let orders: OrderList = self
            .signed_get(
                "/v5/order/realtime",
                &query,
                "get_bracket_status",
                Priority::Normal,
            )
            .await?;

        if orders.list.is_empty() {
            return Ok(BracketState::not_found());
        }

        // One leg filled decides the bracket; otherwise the worst leg state
        // (rejected > expired > cancelled) wins over still-pending legs
        let mut aggregate = OrderStatus::Pending;
        for entry in &orders.list {
            let status = normalize_status(&entry.order_status);
            match status {
                OrderStatus::Filled => {
                    let qty = self.parse_f64(&entry.cum_exec_qty, "get_bracket_status")?;
                    let price = self.parse_f64(&entry.avg_price, "get_bracket_status")?;
                    return Ok(BracketState {
                        status: OrderStatus::Filled,
                        filled_leg: leg_of(&entry.stop_order_type),
                        average_fill_price: if price > 0.0 { Some(price) } else { None },
                        filled_quantity: qty,
                    });
                }
                OrderStatus::PartiallyFilled => aggregate = OrderStatus::PartiallyFilled,
                OrderStatus::Rejected => aggregate = OrderStatus::Rejected,
                OrderStatus::Expired if aggregate != OrderStatus::Rejected => {
                    aggregate = OrderStatus::Expired
                }
                OrderStatus::Cancelled
                    if !matches!(aggregate, OrderStatus::Rejected | OrderStatus::Expired) =>
                {
                    aggregate = OrderStatus::Cancelled
                }
                _ => {}
            }
        }
        Ok(BracketState {
            status: aggregate,
            filled_leg: None,
            average_fill_price: None,
            filled_quantity: 0.0,
        })
    }

    async fn get_balance(&self, asset: &str) -> Result<f64, AdapterError> {
        let query = format!("accountType=UNIFIED&coin={}", asset);
        let wallets: WalletList = self
            .signed_get(
                "/v5/account/wallet-balance",
                &query,
                "get_balance",
                Priority::Normal,
            )
            .await?;
        let balance = wallets
            .list
            .first()
            .and_then(|w| w.coin.iter().find(|c| c.coin.eq_ignore_ascii_case(asset)));
        match balance {
            Some(coin) => self.parse_f64(&coin.wallet_balance, "get_balance"),
            None => Ok(0.0),
        }
    }

    async fn place_market_sell(
        &self,
        symbol: &str,
        quantity: f64,
    ) -> Result<MarketFill, AdapterError> {
        let body = serde_json::json!({
            "category": "spot",
            "symbol": symbol,
            "side": "Sell",
            "orderType": "Market",
            "qty": format_quantity(quantity),
            "marketUnit": "baseCoin",
        });
        let created: CreateOrderResult = self
            .signed_post(
                "/v5/order/create",
                &body,
                "place_market_sell",
                Priority::Urgent,
            )
            .await?;
        self.fetch_fill(symbol, &created.order_id, "place_market_sell")
            .await
    }

    async fn get_current_price(&self, symbol: &str) -> Result<f64, AdapterError> {
        let query = format!("category=spot&symbol={}", symbol);
        let tickers: TickerList = self
            .public_get(
                "/v5/market/tickers",
                &query,
                "get_current_price",
                Priority::Normal,
            )
            .await?;
        let entry = tickers.list.first().ok_or(AdapterError::NotFound {
            exchange: Exchange::Bybit,
            operation: "get_current_price",
        })?;
        self.parse_f64(&entry.last_price, "get_current_price")
    }

    async fn cancel_bracket(
        &self,
        symbol: &str,
        handle: &BracketOrderHandle,
    ) -> Result<(), AdapterError> {
        let body = serde_json::json!({
            "category": "spot",
            "symbol": symbol,
            "orderLinkId": handle.group_id,
            "orderFilter": "tpslOrder",
        });
        let _: serde_json::Value = self
            .signed_post("/v5/order/cancel", &body, "cancel_bracket", Priority::Urgent)
            .await?;
        Ok(())
    }
}
