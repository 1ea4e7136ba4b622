use crate::error::AdapterError;
use crate::exchange::ExchangeAdapter;
use crate::models::{
    BracketState, FilledLeg, OrderStatus, Position, ReconciliationDecision,
};
use crate::pnl::net_pnl;
use chrono::{DateTime, Duration, Utc};

/// Policy knobs for one reconciliation pass. The floor and staleness
/// window are operator policy, not derived business rules.
#[derive(Debug, Clone)]
pub struct ReconcilePolicy {
    /// Age past which an unprotected position gets force-liquidated
    pub staleness: Duration,
    /// Minimum unrealized net profit that triggers an adaptive close
    pub profit_floor_usd: f64,
    /// Round-trip fee assumption, per side, on notional
    pub fee_rate_per_side: f64,
}

impl Default for ReconcilePolicy {
    fn default() -> Self {
        Self {
            staleness: Duration::hours(4),
            profit_floor_usd: 0.01,
            fee_rate_per_side: 0.001,
        }
    }
}

/// Evaluate one open position against the exchange.
///
/// Checks run in fixed priority order and the first match wins:
/// bracket filled, then stale-with-unusable-bracket, then adaptive
/// profit-take. A position that is simultaneously stale and profitable
/// with a live bracket takes the profit path, not the stale path.
///
/// Market sells happen in here, so at most one can ever be issued per
/// evaluation; the close itself is the caller's conditional write.
pub async fn evaluate_position(
    adapter: &dyn ExchangeAdapter,
    position: &Position,
    policy: &ReconcilePolicy,
    now: DateTime<Utc>,
) -> Result<ReconciliationDecision, AdapterError> {
    if !position.is_open() {
        return Ok(ReconciliationDecision::NoAction);
    }

    let bracket_state = match &position.bracket {
        Some(handle) => match adapter.get_bracket_status(&position.symbol, handle).await {
            Ok(state) => Some(state),
            // "No such order" is a statement about the bracket, not a failure
            Err(e) if e.is_not_found() => Some(BracketState::not_found()),
            Err(e) => return Err(e),
        },
        None => None,
    };

    // 1. Bracket filled: the exchange already closed the exposure, we only
    //    record it at the actual average fill price.
    if let Some(state) = &bracket_state {
        if state.status == OrderStatus::Filled {
            let Some(exit_price) = state.average_fill_price else {
                return Ok(ReconciliationDecision::NeedsManualReview {
                    reason: "bracket filled but no fill price reported".to_string(),
                });
            };
            let leg = state
                .filled_leg
                .unwrap_or_else(|| infer_leg(position, exit_price));
            return Ok(ReconciliationDecision::CloseViaBracket { leg, exit_price });
        }
    }

    // 2. Stale with no usable bracket: force-liquidate what is actually
    //    there. A zero balance is NEVER a close at $0; it goes to manual
    //    review and the position stays open.
    let stale = position.age(now) > policy.staleness;
    let bracket_unusable = match &bracket_state {
        None => true,
        Some(state) => state.status.is_unusable(),
    };
    if stale && bracket_unusable {
        let balance = adapter.get_balance(position.base_asset()).await?;
        if balance > 0.0 {
            let quantity = balance.min(position.base_quantity());
            let fill = adapter
                .place_market_sell(&position.symbol, quantity)
                .await?;
            return Ok(ReconciliationDecision::CloseStale {
                exit_price: fill.fill_price,
            });
        }
        tracing::warn!(
            "position {}: stale with zero {} balance, flagging for review",
            position.id,
            position.base_asset()
        );
        return Ok(ReconciliationDecision::NeedsManualReview {
            reason: format!(
                "zero {} balance at force-close time",
                position.base_asset()
            ),
        });
    }

    // 3. Adaptive profit-take: any net profit above the floor is realized
    //    immediately.
    let current_price = adapter.get_current_price(&position.symbol).await?;
    let unrealized = net_pnl(
        position.direction,
        position.entry_price,
        current_price,
        position.notional,
        position.leverage,
        policy.fee_rate_per_side,
    );
    if unrealized > policy.profit_floor_usd {
        if let Some(handle) = &position.bracket {
            // Best effort: a redundant open bracket does not corrupt state
            if let Err(e) = adapter.cancel_bracket(&position.symbol, handle).await {
                tracing::warn!(
                    "position {}: bracket cancel failed before profit-take, proceeding: {}",
                    position.id,
                    e
                );
            }
        }
        let fill = adapter
            .place_market_sell(&position.symbol, position.base_quantity())
            .await?;
        return Ok(ReconciliationDecision::CloseForProfit {
            exit_price: fill.fill_price,
        });
    }

    Ok(ReconciliationDecision::NoAction)
}

/// When an exchange reports a filled bracket without saying which leg,
/// the fill price relative to entry decides it.
fn infer_leg(position: &Position, exit_price: f64) -> FilledLeg {
    let favorable = match position.direction {
        crate::models::Direction::Long => exit_price >= position.entry_price,
        crate::models::Direction::Short => exit_price <= position.entry_price,
    };
    if favorable {
        FilledLeg::TakeProfit
    } else {
        FilledLeg::StopLoss
    }
}
