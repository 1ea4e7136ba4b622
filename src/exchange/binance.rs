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
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::Arc;

const BINANCE_API_BASE: &str = "https://api.binance.com";
const RECV_WINDOW: &str = "5000";

/// Binance spot REST client.
///
/// Signing: HMAC-SHA256 over the full query string, hex-encoded, appended
/// as `signature`; API key in the `X-MBX-APIKEY` header.
pub struct BinanceAdapter {
    client: Client,
    base_url: String,
    credentials: ExchangeCredentials,
    limiter: Arc<RateLimiter>,
    retry: RetryConfig,
}

#[derive(Debug, Deserialize)]
struct TickerPrice {
    price: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderDetail {
    status: String,
    #[serde(rename = "type")]
    order_type: String,
    executed_qty: String,
    cummulative_quote_qty: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderListResponse {
    list_order_status: String,
    #[serde(default)]
    orders: Vec<OrderRef>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderRef {
    order_id: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewOrderResponse {
    order_id: i64,
    executed_qty: String,
    cummulative_quote_qty: String,
    #[serde(default)]
    fills: Vec<OrderFill>,
}

#[derive(Debug, Deserialize)]
struct OrderFill {
    price: String,
    qty: String,
}

#[derive(Debug, Deserialize)]
struct AccountResponse {
    balances: Vec<BalanceEntry>,
}

#[derive(Debug, Deserialize)]
struct BalanceEntry {
    asset: String,
    free: String,
}

/// Binance order-status vocabulary onto the shared enum
fn normalize_status(status: &str) -> OrderStatus {
    match status {
        "NEW" | "PENDING_NEW" | "PENDING_CANCEL" => OrderStatus::Pending,
        "PARTIALLY_FILLED" => OrderStatus::PartiallyFilled,
        "FILLED" => OrderStatus::Filled,
        "CANCELED" => OrderStatus::Cancelled,
        "REJECTED" => OrderStatus::Rejected,
        "EXPIRED" | "EXPIRED_IN_MATCH" => OrderStatus::Expired,
        _ => OrderStatus::NotFound,
    }
}

impl BinanceAdapter {
    pub fn new(credentials: ExchangeCredentials, limiter: Arc<RateLimiter>) -> Self {
        Self {
            client: Client::new(),
            base_url: BINANCE_API_BASE.to_string(),
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
                exchange: Exchange::Binance,
                operation,
                message: format!("bad numeric field: {:?}", value),
            })
    }

    async fn handle_response<T: DeserializeOwned>(
        &self,
        response: reqwest::Response,
        operation: &'static str,
        class: EndpointClass,
    ) -> Result<T, AdapterError> {
        let status = response.status();
        if status.as_u16() == 429 || status.as_u16() == 418 {
            self.limiter.record_throttle(Exchange::Binance, class);
            return Err(AdapterError::Throttled {
                exchange: Exchange::Binance,
                operation,
            });
        }
        let body = response
            .text()
            .await
            .map_err(|e| AdapterError::Network {
                exchange: Exchange::Binance,
                operation,
                source: e,
            })?;
        if !status.is_success() {
            // -2013: order does not exist, -2011: unknown cancel target
            if body.contains("\"code\":-2013") || body.contains("\"code\":-2011") {
                return Err(AdapterError::NotFound {
                    exchange: Exchange::Binance,
                    operation,
                });
            }
            return Err(AdapterError::Http {
                exchange: Exchange::Binance,
                operation,
                status: status.as_u16(),
                body,
            });
        }
        self.limiter.record_success(Exchange::Binance, class);
        serde_json::from_str(&body).map_err(|e| AdapterError::MalformedResponse {
            exchange: Exchange::Binance,
            operation,
            message: e.to_string(),
        })
    }

    async fn public_call<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &str,
        operation: &'static str,
        priority: Priority,
    ) -> Result<T, AdapterError> {
        with_retry(&self.retry, operation, || async move {
            self.limiter
                .acquire(Exchange::Binance, EndpointClass::MarketData, priority)
                .await;
            let url = format!("{}{}?{}", self.base_url, path, query);
            let response =
                self.client
                    .get(&url)
                    .send()
                    .await
                    .map_err(|e| AdapterError::Network {
                        exchange: Exchange::Binance,
                        operation,
                        source: e,
                    })?;
            self.handle_response(response, operation, EndpointClass::MarketData)
                .await
        })
        .await
    }

    async fn signed_call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
        operation: &'static str,
        priority: Priority,
    ) -> Result<T, AdapterError> {
        let method = &method;
        with_retry(&self.retry, operation, || async move {
            self.limiter
                .acquire(Exchange::Binance, EndpointClass::Orders, priority)
                .await;
            let mut query = params
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join("&");
            if !query.is_empty() {
                query.push('&');
            }
            query.push_str(&format!(
                "recvWindow={}&timestamp={}",
                RECV_WINDOW,
                Utc::now().timestamp_millis()
            ));
            let signature = signing::sign_hex(&self.credentials.api_secret, &query).map_err(
                |e| AdapterError::Signing {
                    exchange: Exchange::Binance,
                    message: e.to_string(),
                },
            )?;
            let url = format!(
                "{}{}?{}&signature={}",
                self.base_url, path, query, signature
            );
            let response = self
                .client
                .request((*method).clone(), &url)
                .header("X-MBX-APIKEY", &self.credentials.api_key)
                .send()
                .await
                .map_err(|e| AdapterError::Network {
                    exchange: Exchange::Binance,
                    operation,
                    source: e,
                })?;
            self.handle_response(response, operation, EndpointClass::Orders)
                .await
        })
        .await
    }

    fn leg_of(order_type: &str) -> FilledLeg {
        if order_type.contains("STOP_LOSS") {
            FilledLeg::StopLoss
        } else {
            FilledLeg::TakeProfit
        }
    }
}

#[async_trait]
impl ExchangeAdapter for BinanceAdapter {
    fn exchange(&self) -> Exchange {
        Exchange::Binance
    }

    async fn get_order_status(
        &self,
        symbol: &str,
        order_id: &str,
    ) -> Result<OrderStatus, AdapterError> {
        let detail: OrderDetail = self
            .signed_call(
                Method::GET,
                "/api/v3/order",
                &[
                    ("symbol", symbol.to_string()),
                    ("orderId", order_id.to_string()),
                ],
                "get_order_status",
                Priority::Normal,
            )
            .await?;
        Ok(normalize_status(&detail.status))
    }

    async fn get_bracket_status(
        &self,
        symbol: &str,
        handle: &BracketOrderHandle,
    ) -> Result<BracketState, AdapterError> {
        let list: OrderListResponse = self
            .signed_call(
                Method::GET,
                "/api/v3/orderList",
                &[("orderListId", handle.group_id.clone())],
                "get_bracket_status",
                Priority::Normal,
            )
            .await?;

        match list.list_order_status.as_str() {
            "EXECUTING" => Ok(BracketState {
                status: OrderStatus::Pending,
                filled_leg: None,
                average_fill_price: None,
                filled_quantity: 0.0,
            }),
            "REJECT" => Ok(BracketState {
                status: OrderStatus::Rejected,
                filled_leg: None,
                average_fill_price: None,
                filled_quantity: 0.0,
            }),
            // ALL_DONE covers both "a leg filled" and "both cancelled";
            // the legs disambiguate
            "ALL_DONE" => {
                let mut saw_expired = false;
                for order_ref in &list.orders {
                    let detail: OrderDetail = self
                        .signed_call(
                            Method::GET,
                            "/api/v3/order",
                            &[
                                ("symbol", symbol.to_string()),
                                ("orderId", order_ref.order_id.to_string()),
                            ],
                            "get_bracket_status",
                            Priority::Normal,
                        )
                        .await?;
                    match normalize_status(&detail.status) {
                        OrderStatus::Filled => {
                            let qty = self.parse_f64(&detail.executed_qty, "get_bracket_status")?;
                            let quote = self
                                .parse_f64(&detail.cummulative_quote_qty, "get_bracket_status")?;
                            let average_fill_price =
                                if qty > 0.0 { Some(quote / qty) } else { None };
                            return Ok(BracketState {
                                status: OrderStatus::Filled,
                                filled_leg: Some(Self::leg_of(&detail.order_type)),
                                average_fill_price,
                                filled_quantity: qty,
                            });
                        }
                        OrderStatus::Expired => saw_expired = true,
                        _ => {}
                    }
                }
                Ok(BracketState {
                    status: if saw_expired {
                        OrderStatus::Expired
                    } else {
                        OrderStatus::Cancelled
                    },
                    filled_leg: None,
                    average_fill_price: None,
                    filled_quantity: 0.0,
                })
            }
            other => Err(AdapterError::MalformedResponse {
                exchange: Exchange::Binance,
                operation: "get_bracket_status",
                message: format!("unknown listOrderStatus: {:?}", other),
            }),
        }
    }

    async fn get_balance(&self, asset: &str) -> Result<f64, AdapterError> {
        let account: AccountResponse = self
            .signed_call(
                Method::GET,
                "/api/v3/account",
                &[],
                "get_balance",
                Priority::Normal,
            )
            .await?;
        match account
            .balances
            .iter()
            .find(|b| b.asset.eq_ignore_ascii_case(asset))
        {
            Some(entry) => self.parse_f64(&entry.free, "get_balance"),
            None => Ok(0.0),
        }
    }

    async fn place_market_sell(
        &self,
        symbol: &str,
        quantity: f64,
    ) -> Result<MarketFill, AdapterError> {
        let order: NewOrderResponse = self
            .signed_call(
                Method::POST,
                "/api/v3/order",
                &[
                    ("symbol", symbol.to_string()),
                    ("side", "SELL".to_string()),
                    ("type", "MARKET".to_string()),
                    ("quantity", format_quantity(quantity)),
                    ("newOrderRespType", "FULL".to_string()),
                ],
                "place_market_sell",
                Priority::Urgent,
            )
            .await?;

        let executed = self.parse_f64(&order.executed_qty, "place_market_sell")?;
        let fill_price = if !order.fills.is_empty() {
            let mut qty_sum = 0.0;
            let mut quote_sum = 0.0;
            for fill in &order.fills {
                let q = self.parse_f64(&fill.qty, "place_market_sell")?;
                let p = self.parse_f64(&fill.price, "place_market_sell")?;
                qty_sum += q;
                quote_sum += p * q;
            }
            if qty_sum > 0.0 {
                quote_sum / qty_sum
            } else {
                0.0
            }
        } else {
            let quote = self.parse_f64(&order.cummulative_quote_qty, "place_market_sell")?;
            if executed > 0.0 {
                quote / executed
            } else {
                0.0
            }
        };

        if executed <= 0.0 || fill_price <= 0.0 {
            return Err(AdapterError::MalformedResponse {
                exchange: Exchange::Binance,
                operation: "place_market_sell",
                message: "market sell returned no fills".to_string(),
            });
        }

        Ok(MarketFill {
            order_id: order.order_id.to_string(),
            fill_price,
            filled_quantity: executed,
        })
    }

    async fn get_current_price(&self, symbol: &str) -> Result<f64, AdapterError> {
        let ticker: TickerPrice = self
            .public_call(
                "/api/v3/ticker/price",
                &format!("symbol={}", symbol),
                "get_current_price",
                Priority::Normal,
            )
            .await?;
        self.parse_f64(&ticker.price, "get_current_price")
    }

    async fn cancel_bracket(
        &self,
        symbol: &str,
        handle: &BracketOrderHandle,
    ) -> Result<(), AdapterError> {
        let _: serde_json::Value = self
            .signed_call(
                Method::DELETE,
                "/api/v3/orderList",
                &[
                    ("symbol", symbol.to_string()),
                    ("orderListId", handle.group_id.clone()),
                ],
                "cancel_bracket",
                Priority::Urgent,
            )
            .await?;
        Ok(())
    }
}
