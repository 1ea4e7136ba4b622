use crate::error::AdapterError;
use crate::exchange::{format_quantity, signing, ExchangeAdapter};
use crate::models::{
    base_asset, BracketOrderHandle, BracketState, Exchange, ExchangeCredentials, FilledLeg,
    MarketFill, OrderStatus,
};
use crate::ratelimit::{EndpointClass, Priority, RateLimiter};
use crate::retry::{with_retry, RetryConfig};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::Arc;

const OKX_API_BASE: &str = "https://www.okx.com";

// API result codes
const CODE_OK: &str = "0";
const CODE_RATE_LIMIT: &str = "50011";
const CODE_ORDER_NOT_FOUND: &str = "51603";

/// OKX v5 REST client.
///
/// Signing: `base64(HMAC-SHA256(timestamp + METHOD + requestPath + body))`
/// with an ISO-8601 millisecond timestamp; requires a passphrase on top of
/// the API key pair (`OK-ACCESS-*` headers).
pub struct OkxAdapter {
    client: Client,
    base_url: String,
    credentials: ExchangeCredentials,
    limiter: Arc<RateLimiter>,
    retry: RetryConfig,
}

#[derive(Debug, Deserialize)]
struct OkxResponse<T> {
    code: String,
    #[serde(default)]
    msg: String,
    #[serde(default = "Vec::new")]
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TickerData {
    last: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderData {
    ord_id: String,
    state: String,
    #[serde(default)]
    avg_px: String,
    #[serde(default)]
    acc_fill_sz: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AlgoOrderData {
    state: String,
    #[serde(default)]
    actual_px: String,
    #[serde(default)]
    actual_side: String,
    #[serde(default)]
    actual_sz: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BalanceData {
    details: Vec<BalanceDetail>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BalanceDetail {
    ccy: String,
    avail_bal: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaceOrderData {
    ord_id: String,
}

/// OKX order-state vocabulary onto the shared enum
fn normalize_status(state: &str) -> OrderStatus {
    match state {
        "live" => OrderStatus::Pending,
        "partially_filled" => OrderStatus::PartiallyFilled,
        "filled" => OrderStatus::Filled,
        "canceled" | "mmp_canceled" => OrderStatus::Cancelled,
        _ => OrderStatus::NotFound,
    }
}

/// OKX algo-order states. `effective` means the triggered leg executed.
fn normalize_algo_status(state: &str) -> OrderStatus {
    match state {
        "live" | "pause" | "partially_effective" => OrderStatus::Pending,
        "effective" => OrderStatus::Filled,
        "canceled" => OrderStatus::Cancelled,
        "order_failed" => OrderStatus::Rejected,
        _ => OrderStatus::NotFound,
    }
}

/// "BTCUSDT" -> "BTC-USDT"; OKX instrument ids are dash-separated
fn to_inst_id(symbol: &str) -> String {
    if symbol.contains('-') {
        return symbol.to_string();
    }
    let base = base_asset(symbol);
    if base.len() < symbol.len() {
        format!("{}-{}", base, &symbol[base.len()..])
    } else {
        symbol.to_string()
    }
}

impl OkxAdapter {
    pub fn new(credentials: ExchangeCredentials, limiter: Arc<RateLimiter>) -> Self {
        Self {
            client: Client::new(),
            base_url: OKX_API_BASE.to_string(),
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
                exchange: Exchange::Okx,
                operation,
                message: format!("bad numeric field: {:?}", value),
            })
    }

    fn auth_headers(
        &self,
        method: &Method,
        request_path: &str,
        body: &str,
    ) -> Result<[(&'static str, String); 4], AdapterError> {
        let passphrase =
            self.credentials
                .passphrase
                .as_ref()
                .ok_or_else(|| AdapterError::Signing {
                    exchange: Exchange::Okx,
                    message: "missing passphrase".to_string(),
                })?;
        let timestamp = Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string();
        let prehash = signing::okx_prehash(&timestamp, method.as_str(), request_path, body);
        let signature = signing::sign_base64(&self.credentials.api_secret, &prehash).map_err(
            |e| AdapterError::Signing {
                exchange: Exchange::Okx,
                message: e.to_string(),
            },
        )?;
        Ok([
            ("OK-ACCESS-KEY", self.credentials.api_key.clone()),
            ("OK-ACCESS-SIGN", signature),
            ("OK-ACCESS-TIMESTAMP", timestamp),
            ("OK-ACCESS-PASSPHRASE", passphrase.clone()),
        ])
    }

    async fn handle_response<T: DeserializeOwned>(
        &self,
        response: reqwest::Response,
        operation: &'static str,
        class: EndpointClass,
    ) -> Result<Vec<T>, AdapterError> {
        let status = response.status();
        if status.as_u16() == 429 {
            self.limiter.record_throttle(Exchange::Okx, class);
            return Err(AdapterError::Throttled {
                exchange: Exchange::Okx,
                operation,
            });
        }
        let body = response
            .text()
            .await
            .map_err(|e| AdapterError::Network {
                exchange: Exchange::Okx,
                operation,
                source: e,
            })?;
        if !status.is_success() {
            return Err(AdapterError::Http {
                exchange: Exchange::Okx,
                operation,
                status: status.as_u16(),
                body,
            });
        }
        let parsed: OkxResponse<T> =
            serde_json::from_str(&body).map_err(|e| AdapterError::MalformedResponse {
                exchange: Exchange::Okx,
                operation,
                message: e.to_string(),
            })?;
        match parsed.code.as_str() {
            CODE_OK => {
                self.limiter.record_success(Exchange::Okx, class);
                Ok(parsed.data)
            }
            CODE_RATE_LIMIT => {
                self.limiter.record_throttle(Exchange::Okx, class);
                Err(AdapterError::Throttled {
                    exchange: Exchange::Okx,
                    operation,
                })
            }
            CODE_ORDER_NOT_FOUND => Err(AdapterError::NotFound {
                exchange: Exchange::Okx,
                operation,
            }),
            code => Err(AdapterError::Http {
                exchange: Exchange::Okx,
                operation,
                status: status.as_u16(),
                body: format!("code {}: {}", code, parsed.msg),
            }),
        }
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path_and_query: &str,
        body: Option<&serde_json::Value>,
        operation: &'static str,
        class: EndpointClass,
        priority: Priority,
        signed: bool,
    ) -> Result<Vec<T>, AdapterError> {
        let method = &method;
        with_retry(&self.retry, operation, || async move {
            self.limiter.acquire(Exchange::Okx, class, priority).await;
            let body_str = body.map(|b| b.to_string()).unwrap_or_default();
            let url = format!("{}{}", self.base_url, path_and_query);
            let mut request = self.client.request((*method).clone(), &url);
            if signed {
                let headers = self.auth_headers(method, path_and_query, &body_str)?;
                for (name, value) in &headers {
                    request = request.header(*name, value);
                }
            }
            if body.is_some() {
                request = request
                    .header("Content-Type", "application/json")
                    .body(body_str);
            }
            let response = request.send().await.map_err(|e| AdapterError::Network {
                exchange: Exchange::Okx,
                operation,
                source: e,
            })?;
            self.handle_response(response, operation, class).await
        })
        .await
    }

    async fn fetch_order(
        &self,
        inst_id: &str,
        order_id: &str,
        operation: &'static str,
        priority: Priority,
    ) -> Result<OrderData, AdapterError> {
        let path = format!(
            "/api/v5/trade/order?instId={}&ordId={}",
            inst_id, order_id
        );
        let mut data: Vec<OrderData> = self
            .request(
                Method::GET,
                &path,
                None,
                operation,
                EndpointClass::Orders,
                priority,
                true,
            )
            .await?;
        if data.is_empty() {
            return Err(AdapterError::NotFound {
                exchange: Exchange::Okx,
                operation,
            });
        }
        Ok(data.remove(0))
    }
}

#[async_trait]
impl ExchangeAdapter for OkxAdapter {
    fn exchange(&self) -> Exchange {
        Exchange::Okx
    }

    async fn get_order_status(
        &self,
        symbol: &str,
        order_id: &str,
    ) -> Result<OrderStatus, AdapterError> {
        let order = self
            .fetch_order(
                &to_inst_id(symbol),
                order_id,
                "get_order_status",
                Priority::Normal,
            )
            .await?;
        Ok(normalize_status(&order.state))
    }

    async fn get_bracket_status(
        &self,
        _symbol: &str,
        handle: &BracketOrderHandle,
    ) -> Result<BracketState, AdapterError> {
        let path = format!("/api/v5/trade/order-algo?algoId={}", handle.group_id);
        let data: Vec<AlgoOrderData> = self
            .request(
                Method::GET,
                &path,
                None,
                "get_bracket_status",
                EndpointClass::Orders,
                Priority::Normal,
                true,
            )
            .await?;
        let Some(algo) = data.first() else {
            return Ok(BracketState::not_found());
        };

        let status = normalize_algo_status(&algo.state);
        if status != OrderStatus::Filled {
            return Ok(BracketState {
                status,
                filled_leg: None,
                average_fill_price: None,
                filled_quantity: 0.0,
            });
        }

        let filled_leg = match algo.actual_side.as_str() {
            "tp" => Some(FilledLeg::TakeProfit),
            "sl" => Some(FilledLeg::StopLoss),
            _ => None,
        };
        let average_fill_price = algo.actual_px.parse::<f64>().ok().filter(|p| *p > 0.0);
        let filled_quantity = algo.actual_sz.parse::<f64>().unwrap_or(0.0);
        Ok(BracketState {
            status: OrderStatus::Filled,
            filled_leg,
            average_fill_price,
            filled_quantity,
        })
    }

    async fn get_balance(&self, asset: &str) -> Result<f64, AdapterError> {
        let path = format!("/api/v5/account/balance?ccy={}", asset);
        let data: Vec<BalanceData> = self
            .request(
                Method::GET,
                &path,
                None,
                "get_balance",
                EndpointClass::Orders,
                Priority::Normal,
                true,
            )
            .await?;
        let detail = data
            .first()
            .and_then(|b| b.details.iter().find(|d| d.ccy.eq_ignore_ascii_case(asset)));
        match detail {
            Some(d) if !d.avail_bal.is_empty() => self.parse_f64(&d.avail_bal, "get_balance"),
            _ => Ok(0.0),
        }
    }

    async fn place_market_sell(
        &self,
        symbol: &str,
        quantity: f64,
    ) -> Result<MarketFill, AdapterError> {
        let inst_id = to_inst_id(symbol);
        let body = serde_json::json!({
            "instId": inst_id,
            "tdMode": "cash",
            "side": "sell",
            "ordType": "market",
            "sz": format_quantity(quantity),
            "tgtCcy": "base_ccy",
        });
        let mut placed: Vec<PlaceOrderData> = self
            .request(
                Method::POST,
                "/api/v5/trade/order",
                Some(&body),
                "place_market_sell",
                EndpointClass::Orders,
                Priority::Urgent,
                true,
            )
            .await?;
        if placed.is_empty() {
            return Err(AdapterError::MalformedResponse {
                exchange: Exchange::Okx,
                operation: "place_market_sell",
                message: "order accepted without ordId".to_string(),
            });
        }
        let ord_id = placed.remove(0).ord_id;

        // The actual fill only shows on the order record
        let order = self
            .fetch_order(&inst_id, &ord_id, "place_market_sell", Priority::Urgent)
            .await?;
        let fill_price = self.parse_f64(&order.avg_px, "place_market_sell")?;
        let filled_quantity = self.parse_f64(&order.acc_fill_sz, "place_market_sell")?;
        if fill_price <= 0.0 || filled_quantity <= 0.0 {
            return Err(AdapterError::MalformedResponse {
                exchange: Exchange::Okx,
                operation: "place_market_sell",
                message: "market sell reported no fill".to_string(),
            });
        }
        Ok(MarketFill {
            order_id: order.ord_id,
            fill_price,
            filled_quantity,
        })
    }

    async fn get_current_price(&self, symbol: &str) -> Result<f64, AdapterError> {
        let path = format!("/api/v5/market/ticker?instId={}", to_inst_id(symbol));
        let data: Vec<TickerData> = self
            .request(
                Method::GET,
                &path,
                None,
                "get_current_price",
                EndpointClass::MarketData,
                Priority::Normal,
                false,
            )
            .await?;
        let ticker = data.first().ok_or(AdapterError::NotFound {
            exchange: Exchange::Okx,
            operation: "get_current_price",
        })?;
        self.parse_f64(&ticker.last, "get_current_price")
    }

    async fn cancel_bracket(
        &self,
        symbol: &str,
        handle: &BracketOrderHandle,
    ) -> Result<(), AdapterError> {
        let body = serde_json::json!([{
            "algoId": handle.group_id,
            "instId": to_inst_id(symbol),
        }]);
        let _: Vec<serde_json::Value> = self
            .request(
                Method::POST,
                "/api/v5/trade/cancel-algos",
                Some(&body),
                "cancel_bracket",
                EndpointClass::Orders,
                Priority::Urgent,
                true,
            )
            .await?;
        Ok(())
    }
}
