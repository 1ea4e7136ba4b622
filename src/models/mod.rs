use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Supported origin exchanges
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Exchange {
    Binance,
    Bybit,
    Okx,
}

impl Exchange {
    pub fn as_str(&self) -> &'static str {
        match self {
            Exchange::Binance => "binance",
            Exchange::Bybit => "bybit",
            Exchange::Okx => "okx",
        }
    }
}

impl std::fmt::Display for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Exchange {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "binance" => Ok(Exchange::Binance),
            "bybit" => Ok(Exchange::Bybit),
            "okx" => Ok(Exchange::Okx),
            other => Err(format!("unknown exchange: {}", other)),
        }
    }
}

/// Trade direction
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Direction {
    Long,
    Short,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PositionStatus {
    Open,
    Closed,
}

/// Reference to an exchange-side OCO/bracket order group
/// (take-profit leg + stop-loss leg, filling one cancels the other)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BracketOrderHandle {
    /// Exchange order-group id (orderListId / orderLinkId / algoId)
    pub group_id: String,
}

/// A user's market exposure, open or closed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub user_id: Uuid,
    pub symbol: String,
    pub direction: Direction,
    pub entry_price: f64,
    /// Position size in quote currency
    pub notional: f64,
    pub leverage: f64,
    pub exchange: Exchange,
    pub opened_at: DateTime<Utc>,
    pub bracket: Option<BracketOrderHandle>,
    pub status: PositionStatus,
    pub exit_price: Option<f64>,
    pub realized_pnl: Option<f64>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Position {
    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.opened_at
    }

    /// Position size in base units at the entry price
    pub fn base_quantity(&self) -> f64 {
        if self.entry_price > 0.0 {
            self.notional / self.entry_price
        } else {
            0.0
        }
    }

    /// Base asset of the trading pair ("BTCUSDT" -> "BTC")
    pub fn base_asset(&self) -> &str {
        base_asset(&self.symbol)
    }
}

/// Strip the quote-currency suffix from a spot pair symbol
pub fn base_asset(symbol: &str) -> &str {
    const QUOTES: &[&str] = &["USDT", "USDC", "BUSD", "USD", "BTC", "ETH"];
    for quote in QUOTES {
        if symbol.len() > quote.len() {
            if let Some(base) = symbol.strip_suffix(quote) {
                return base;
            }
        }
    }
    symbol
}

/// Normalized order / bracket status shared across all exchanges
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OrderStatus {
    Pending,
    PartiallyFilled,
    Filled,
    Cancelled,
    Expired,
    Rejected,
    NotFound,
}

impl OrderStatus {
    /// A bracket in one of these states no longer protects the position
    pub fn is_unusable(&self) -> bool {
        matches!(
            self,
            OrderStatus::Cancelled
                | OrderStatus::Expired
                | OrderStatus::Rejected
                | OrderStatus::NotFound
        )
    }
}

/// Which leg of a bracket order executed
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FilledLeg {
    TakeProfit,
    StopLoss,
}

/// Normalized view of an exchange-side bracket order
#[derive(Debug, Clone, PartialEq)]
pub struct BracketState {
    pub status: OrderStatus,
    pub filled_leg: Option<FilledLeg>,
    pub average_fill_price: Option<f64>,
    pub filled_quantity: f64,
}

impl BracketState {
    pub fn not_found() -> Self {
        Self {
            status: OrderStatus::NotFound,
            filled_leg: None,
            average_fill_price: None,
            filled_quantity: 0.0,
        }
    }
}

/// Result of a market order execution
#[derive(Debug, Clone, PartialEq)]
pub struct MarketFill {
    pub order_id: String,
    pub fill_price: f64,
    pub filled_quantity: f64,
}

/// Outcome of evaluating one open position on one reconciliation tick
#[derive(Debug, Clone, PartialEq)]
pub enum ReconciliationDecision {
    NoAction,
    CloseViaBracket { leg: FilledLeg, exit_price: f64 },
    CloseStale { exit_price: f64 },
    CloseForProfit { exit_price: f64 },
    NeedsManualReview { reason: String },
}

/// Audit event cause, persisted with every non-trivial decision
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CloseCause {
    BracketFill,
    StaleForceClose,
    AdaptiveProfitTake,
    NeedsManualReview,
}

impl CloseCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseCause::BracketFill => "bracket_fill",
            CloseCause::StaleForceClose => "stale_force_close",
            CloseCause::AdaptiveProfitTake => "adaptive_profit_take",
            CloseCause::NeedsManualReview => "needs_manual_review",
        }
    }
}

/// Append-only audit record for the alert sink
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub user_id: Uuid,
    pub kind: CloseCause,
    pub position_id: Uuid,
    pub exit_price: Option<f64>,
    pub pnl: Option<f64>,
    pub metadata: serde_json::Value,
}

/// Decrypted API credentials for one user/exchange connection
#[derive(Debug, Clone)]
pub struct ExchangeCredentials {
    pub api_key: String,
    pub api_secret: String,
    /// OKX only
    pub passphrase: Option<String>,
}

/// Per-user result of one reconciliation pass
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ReconcileSummary {
    pub scanned: usize,
    pub closed: usize,
    pub profits_taken: usize,
    pub stale_closed: usize,
    pub bracket_fills: usize,
    pub needs_review: usize,
    pub errors: usize,
}

impl ReconcileSummary {
    pub fn merge(&mut self, other: &ReconcileSummary) {
        self.scanned += other.scanned;
        self.closed += other.closed;
        self.profits_taken += other.profits_taken;
        self.stale_closed += other.stale_closed;
        self.bracket_fills += other.bracket_fills;
        self.needs_review += other.needs_review;
        self.errors += other.errors;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_asset() {
        assert_eq!(base_asset("BTCUSDT"), "BTC");
        assert_eq!(base_asset("ETHUSDC"), "ETH");
        assert_eq!(base_asset("SOLUSD"), "SOL");
        // No recognized quote suffix: returned unchanged
        assert_eq!(base_asset("WEIRD"), "WEIRD");
        // Never strip to an empty base
        assert_eq!(base_asset("USDT"), "USDT");
    }

    #[test]
    fn test_exchange_round_trip() {
        for ex in [Exchange::Binance, Exchange::Bybit, Exchange::Okx] {
            assert_eq!(ex.as_str().parse::<Exchange>().unwrap(), ex);
        }
        assert!("kraken".parse::<Exchange>().is_err());
    }

    #[test]
    fn test_bracket_unusable_states() {
        assert!(OrderStatus::Cancelled.is_unusable());
        assert!(OrderStatus::Expired.is_unusable());
        assert!(OrderStatus::Rejected.is_unusable());
        assert!(OrderStatus::NotFound.is_unusable());
        assert!(!OrderStatus::Pending.is_unusable());
        assert!(!OrderStatus::PartiallyFilled.is_unusable());
        assert!(!OrderStatus::Filled.is_unusable());
    }

    #[test]
    fn test_position_base_quantity() {
        let position = Position {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            symbol: "BTCUSDT".to_string(),
            direction: Direction::Long,
            entry_price: 60000.0,
            notional: 120.0,
            leverage: 1.0,
            exchange: Exchange::Binance,
            opened_at: Utc::now(),
            bracket: None,
            status: PositionStatus::Open,
            exit_price: None,
            realized_pnl: None,
            closed_at: None,
        };

        assert_eq!(position.base_quantity(), 0.002);
        assert_eq!(position.base_asset(), "BTC");
        assert!(position.is_open());
    }

    #[test]
    fn test_summary_merge() {
        let mut a = ReconcileSummary {
            scanned: 2,
            closed: 1,
            profits_taken: 1,
            ..Default::default()
        };
        let b = ReconcileSummary {
            scanned: 3,
            needs_review: 1,
            errors: 1,
            ..Default::default()
        };
        a.merge(&b);
        assert_eq!(a.scanned, 5);
        assert_eq!(a.closed, 1);
        assert_eq!(a.needs_review, 1);
        assert_eq!(a.errors, 1);
    }
}
