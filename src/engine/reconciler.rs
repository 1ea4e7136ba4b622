use crate::engine::state_machine::{evaluate_position, ReconcilePolicy};
use crate::exchange::AdapterFactory;
use crate::models::{
    AuditEvent, CloseCause, Exchange, ExchangeCredentials, Position, ReconcileSummary,
    ReconciliationDecision,
};
use crate::pnl::net_pnl;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinSet;
use uuid::Uuid;

/// Persisted trade records. The close is a conditional update
/// (`WHERE status = open`): `Ok(false)` means another writer won the
/// race, which is benign and produces no audit record.
#[async_trait]
pub trait PositionStore: Send + Sync {
    async fn load_open_positions(&self, user_id: Uuid) -> anyhow::Result<Vec<Position>>;

    async fn close_position(
        &self,
        position_id: Uuid,
        exit_price: f64,
        pnl: f64,
        closed_at: DateTime<Utc>,
    ) -> anyhow::Result<bool>;

    async fn insert_audit(&self, event: &AuditEvent) -> anyhow::Result<()>;

    async fn update_bot_run_stats(
        &self,
        user_id: Uuid,
        delta_pnl: f64,
        is_win: bool,
    ) -> anyhow::Result<()>;

    /// Close a position together with its audit record and stats delta.
    ///
    /// Backends that can, do all three writes in one transaction. The
    /// default chains the individual calls; if a follow-up write fails
    /// after the close landed, the inconsistency is logged loudly and
    /// surfaced as an error so the pass counts it.
    async fn record_close(
        &self,
        position: &Position,
        cause: CloseCause,
        exit_price: f64,
        pnl: f64,
        metadata: serde_json::Value,
    ) -> anyhow::Result<bool> {
        let closed = self
            .close_position(position.id, exit_price, pnl, Utc::now())
            .await?;
        if !closed {
            return Ok(false);
        }
        let followup: anyhow::Result<()> = async {
            self.insert_audit(&AuditEvent {
                user_id: position.user_id,
                kind: cause,
                position_id: position.id,
                exit_price: Some(exit_price),
                pnl: Some(pnl),
                metadata,
            })
            .await?;
            self.update_bot_run_stats(position.user_id, pnl, pnl > 0.0)
                .await
        }
        .await;
        if let Err(e) = followup {
            tracing::error!(
                "position {}: closed but audit/stats write failed, needs manual backfill: {}",
                position.id,
                e
            );
            return Err(e);
        }
        Ok(true)
    }
}

/// Decrypted exchange API credentials, one connection per user/exchange
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get_connection(
        &self,
        user_id: Uuid,
        exchange: Exchange,
    ) -> anyhow::Result<Option<ExchangeCredentials>>;
}

/// Drives one reconciliation pass across all of a user's open positions.
///
/// Positions are grouped by exchange and the groups run concurrently;
/// within a group evaluation is sequential, so the per-exchange rate
/// limiter is the only serialization point.
pub struct Reconciler {
    store: Arc<dyn PositionStore>,
    credentials: Arc<dyn CredentialStore>,
    adapters: Arc<dyn AdapterFactory>,
    policy: ReconcilePolicy,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn PositionStore>,
        credentials: Arc<dyn CredentialStore>,
        adapters: Arc<dyn AdapterFactory>,
        policy: ReconcilePolicy,
    ) -> Self {
        Self {
            store,
            credentials,
            adapters,
            policy,
        }
    }

    pub async fn run_for_user(&self, user_id: Uuid) -> anyhow::Result<ReconcileSummary> {
        let positions = self.store.load_open_positions(user_id).await?;
        let mut summary = ReconcileSummary {
            scanned: positions.len(),
            ..Default::default()
        };
        if positions.is_empty() {
            tracing::info!("user {}: no open positions", user_id);
            return Ok(summary);
        }
        tracing::info!(
            "user {}: reconciling {} open positions",
            user_id,
            positions.len()
        );

        let mut by_exchange: HashMap<Exchange, Vec<Position>> = HashMap::new();
        for position in positions {
            by_exchange.entry(position.exchange).or_default().push(position);
        }

        let mut tasks = JoinSet::new();
        for (exchange, group) in by_exchange {
            let store = self.store.clone();
            let credentials = self.credentials.clone();
            let adapters = self.adapters.clone();
            let policy = self.policy.clone();
            tasks.spawn(async move {
                reconcile_exchange(exchange, group, user_id, store, credentials, adapters, policy)
                    .await
            });
        }
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(partial) => summary.merge(&partial),
                Err(e) => {
                    tracing::error!("user {}: exchange task failed: {}", user_id, e);
                    summary.errors += 1;
                }
            }
        }

        tracing::info!(
            "user {}: scanned {}, closed {} ({} profit, {} stale, {} bracket), {} for review, {} errors",
            user_id,
            summary.scanned,
            summary.closed,
            summary.profits_taken,
            summary.stale_closed,
            summary.bracket_fills,
            summary.needs_review,
            summary.errors
        );
        Ok(summary)
    }
}

async fn reconcile_exchange(
    exchange: Exchange,
    group: Vec<Position>,
    user_id: Uuid,
    store: Arc<dyn PositionStore>,
    credentials: Arc<dyn CredentialStore>,
    adapters: Arc<dyn AdapterFactory>,
    policy: ReconcilePolicy,
) -> ReconcileSummary {
    let mut summary = ReconcileSummary::default();

    let creds = match credentials.get_connection(user_id, exchange).await {
        Ok(Some(creds)) => creds,
        Ok(None) => {
            tracing::warn!(
                "user {}: no {} connection, skipping {} positions this cycle",
                user_id,
                exchange,
                group.len()
            );
            summary.errors += group.len();
            return summary;
        }
        Err(e) => {
            tracing::warn!(
                "user {}: {} connection lookup failed ({}), skipping {} positions",
                user_id,
                exchange,
                e,
                group.len()
            );
            summary.errors += group.len();
            return summary;
        }
    };
    let adapter = adapters.adapter_for(exchange, &creds);
    let now = Utc::now();

    for position in group {
        match evaluate_position(adapter.as_ref(), &position, &policy, now).await {
            Ok(decision) => {
                if let Err(e) = apply_decision(&store, &policy, &position, decision, &mut summary).await
                {
                    tracing::warn!(
                        "position {}: persisting decision failed: {}",
                        position.id,
                        e
                    );
                    summary.errors += 1;
                }
            }
            Err(e) => {
                // One bad exchange response must not halt the rest
                tracing::warn!("position {}: evaluation failed: {}", position.id, e);
                summary.errors += 1;
            }
        }
    }
    summary
}

async fn apply_decision(
    store: &Arc<dyn PositionStore>,
    policy: &ReconcilePolicy,
    position: &Position,
    decision: ReconciliationDecision,
    summary: &mut ReconcileSummary,
) -> anyhow::Result<()> {
    let (cause, exit_price, metadata) = match decision {
        ReconciliationDecision::NoAction => return Ok(()),
        ReconciliationDecision::NeedsManualReview { reason } => {
            store
                .insert_audit(&AuditEvent {
                    user_id: position.user_id,
                    kind: CloseCause::NeedsManualReview,
                    position_id: position.id,
                    exit_price: None,
                    pnl: None,
                    metadata: serde_json::json!({ "reason": reason }),
                })
                .await?;
            summary.needs_review += 1;
            return Ok(());
        }
        ReconciliationDecision::CloseViaBracket { leg, exit_price } => (
            CloseCause::BracketFill,
            exit_price,
            serde_json::json!({ "leg": leg }),
        ),
        ReconciliationDecision::CloseStale { exit_price } => (
            CloseCause::StaleForceClose,
            exit_price,
            serde_json::json!({}),
        ),
        ReconciliationDecision::CloseForProfit { exit_price } => (
            CloseCause::AdaptiveProfitTake,
            exit_price,
            serde_json::json!({}),
        ),
    };

    // Realized P&L from the actual exit price, never a pre-decision estimate
    let pnl = net_pnl(
        position.direction,
        position.entry_price,
        exit_price,
        position.notional,
        position.leverage,
        policy.fee_rate_per_side,
    );

    let closed = store
        .record_close(position, cause, exit_price, pnl, metadata)
        .await?;
    if !closed {
        // Lost the optimistic-concurrency race; the other writer owns it
        tracing::debug!(
            "position {}: already closed by a concurrent pass",
            position.id
        );
        return Ok(());
    }

    summary.closed += 1;
    match cause {
        CloseCause::BracketFill => summary.bracket_fills += 1,
        CloseCause::StaleForceClose => summary.stale_closed += 1,
        CloseCause::AdaptiveProfitTake => summary.profits_taken += 1,
        CloseCause::NeedsManualReview => {}
    }
    tracing::info!(
        "position {} closed ({}): exit {:.2}, net pnl {:.4}",
        position.id,
        cause.as_str(),
        exit_price,
        pnl
    );
    Ok(())
}
