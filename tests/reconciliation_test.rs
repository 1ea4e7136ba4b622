//! End-to-end reconciliation runs over scripted exchanges and an
//! in-memory store: decision priority, at-most-once closes, and
//! per-exchange error isolation.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reconbot::engine::{CredentialStore, PositionStore, ReconcilePolicy, Reconciler};
use reconbot::exchange::{MockAdapterFactory, MockExchangeAdapter};
use reconbot::models::{
    AuditEvent, BracketOrderHandle, BracketState, Direction, Exchange, ExchangeCredentials,
    FilledLeg, OrderStatus, Position, PositionStatus,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

struct InMemoryStore {
    positions: Mutex<HashMap<Uuid, Position>>,
    audits: Mutex<Vec<AuditEvent>>,
    stats: Mutex<Vec<(Uuid, f64, bool)>>,
    connections: Mutex<HashMap<Exchange, ExchangeCredentials>>,
}

impl InMemoryStore {
    fn new() -> Self {
        Self {
            positions: Mutex::new(HashMap::new()),
            audits: Mutex::new(Vec::new()),
            stats: Mutex::new(Vec::new()),
            connections: Mutex::new(HashMap::new()),
        }
    }

    fn with_position(self, position: Position) -> Self {
        self.positions
            .lock()
            .unwrap()
            .insert(position.id, position);
        self
    }

    fn with_connection(self, exchange: Exchange) -> Self {
        self.connections.lock().unwrap().insert(
            exchange,
            ExchangeCredentials {
                api_key: "key".to_string(),
                api_secret: "secret".to_string(),
                passphrase: None,
            },
        );
        self
    }

    fn position(&self, id: Uuid) -> Position {
        self.positions.lock().unwrap().get(&id).unwrap().clone()
    }

    fn audits(&self) -> Vec<AuditEvent> {
        self.audits.lock().unwrap().clone()
    }

    fn stats(&self) -> Vec<(Uuid, f64, bool)> {
        self.stats.lock().unwrap().clone()
    }
}

#[async_trait]
impl PositionStore for InMemoryStore {
    async fn load_open_positions(&self, user_id: Uuid) -> anyhow::Result<Vec<Position>> {
        let mut open: Vec<Position> = self
            .positions
            .lock()
            .unwrap()
            .values()
            .filter(|p| p.user_id == user_id && p.is_open())
            .cloned()
            .collect();
        open.sort_by_key(|p| p.opened_at);
        Ok(open)
    }

    async fn close_position(
        &self,
        position_id: Uuid,
        exit_price: f64,
        pnl: f64,
        closed_at: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let mut positions = self.positions.lock().unwrap();
        let position = positions
            .get_mut(&position_id)
            .ok_or_else(|| anyhow::anyhow!("unknown position"))?;
        if !position.is_open() {
            return Ok(false);
        }
        position.status = PositionStatus::Closed;
        position.exit_price = Some(exit_price);
        position.realized_pnl = Some(pnl);
        position.closed_at = Some(closed_at);
        Ok(true)
    }

    async fn insert_audit(&self, event: &AuditEvent) -> anyhow::Result<()> {
        self.audits.lock().unwrap().push(event.clone());
        Ok(())
    }

    async fn update_bot_run_stats(
        &self,
        user_id: Uuid,
        delta_pnl: f64,
        is_win: bool,
    ) -> anyhow::Result<()> {
        self.stats.lock().unwrap().push((user_id, delta_pnl, is_win));
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for InMemoryStore {
    async fn get_connection(
        &self,
        _user_id: Uuid,
        exchange: Exchange,
    ) -> anyhow::Result<Option<ExchangeCredentials>> {
        Ok(self.connections.lock().unwrap().get(&exchange).cloned())
    }
}

fn open_position(user_id: Uuid, exchange: Exchange, opened_at: DateTime<Utc>) -> Position {
    Position {
        id: Uuid::new_v4(),
        user_id,
        symbol: "BTCUSDT".to_string(),
        direction: Direction::Long,
        entry_price: 60000.0,
        notional: 100.0,
        leverage: 1.0,
        exchange,
        opened_at,
        bracket: Some(BracketOrderHandle {
            group_id: "grp-1".to_string(),
        }),
        status: PositionStatus::Open,
        exit_price: None,
        realized_pnl: None,
        closed_at: None,
    }
}

fn live_bracket() -> BracketState {
    BracketState {
        status: OrderStatus::Pending,
        filled_leg: None,
        average_fill_price: None,
        filled_quantity: 0.0,
    }
}

fn policy() -> ReconcilePolicy {
    ReconcilePolicy {
        staleness: Duration::hours(4),
        profit_floor_usd: 0.01,
        fee_rate_per_side: 0.001,
    }
}

fn reconciler(store: Arc<InMemoryStore>, factory: MockAdapterFactory) -> Reconciler {
    Reconciler::new(store.clone(), store, Arc::new(factory), policy())
}

#[tokio::test]
async fn profit_take_closes_audits_and_updates_stats() {
    let user_id = Uuid::new_v4();
    let position = open_position(user_id, Exchange::Binance, Utc::now());
    let position_id = position.id;
    let store = Arc::new(
        InMemoryStore::new()
            .with_position(position)
            .with_connection(Exchange::Binance),
    );
    // 60200 quoted, fills at 60190: net pnl from the actual fill
    let adapter = Arc::new(
        MockExchangeAdapter::new(Exchange::Binance)
            .with_bracket(live_bracket())
            .with_price(60200.0)
            .with_fill_price(60190.0),
    );
    let factory = MockAdapterFactory::new().register(Exchange::Binance, adapter.clone());

    let summary = reconciler(store.clone(), factory)
        .run_for_user(user_id)
        .await
        .unwrap();

    assert_eq!(summary.scanned, 1);
    assert_eq!(summary.closed, 1);
    assert_eq!(summary.profits_taken, 1);
    assert_eq!(summary.errors, 0);

    let closed = store.position(position_id);
    assert_eq!(closed.status, PositionStatus::Closed);
    assert_eq!(closed.exit_price, Some(60190.0));
    let pnl = closed.realized_pnl.unwrap();
    // (190/60000)*100 - 0.2 in fees
    assert!((pnl - (190.0 / 60000.0 * 100.0 - 0.2)).abs() < 1e-9);

    let audits = store.audits();
    assert_eq!(audits.len(), 1);
    assert_eq!(audits[0].position_id, position_id);
    assert_eq!(audits[0].pnl, Some(pnl));

    let stats = store.stats();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].0, user_id);
    assert!(stats[0].2, "a positive pnl counts as a win");

    // The bracket was cancelled before the market sell
    assert!(adapter.calls().iter().any(|c| c.starts_with("cancel_bracket")));
    assert_eq!(adapter.sell_count(), 1);
}

#[tokio::test]
async fn second_pass_after_close_is_a_no_op() {
    let user_id = Uuid::new_v4();
    let position = open_position(user_id, Exchange::Bybit, Utc::now());
    let store = Arc::new(
        InMemoryStore::new()
            .with_position(position)
            .with_connection(Exchange::Bybit),
    );
    let adapter = Arc::new(
        MockExchangeAdapter::new(Exchange::Bybit)
            .with_bracket(BracketState {
                status: OrderStatus::Filled,
                filled_leg: Some(FilledLeg::TakeProfit),
                average_fill_price: Some(61000.0),
                filled_quantity: 0.00166,
            }),
    );
    let factory = MockAdapterFactory::new().register(Exchange::Bybit, adapter.clone());
    let engine = reconciler(store.clone(), factory);

    let first = engine.run_for_user(user_id).await.unwrap();
    assert_eq!(first.closed, 1);
    assert_eq!(first.bracket_fills, 1);

    // Closed positions are not loaded again, so nothing is re-closed
    let second = engine.run_for_user(user_id).await.unwrap();
    assert_eq!(second.scanned, 0);
    assert_eq!(second.closed, 0);
    assert_eq!(store.audits().len(), 1);
    assert_eq!(store.stats().len(), 1);
}

#[tokio::test]
async fn zero_balance_stale_position_stays_open_for_review() {
    let user_id = Uuid::new_v4();
    let stale_open = Utc::now() - Duration::hours(8);
    let position = open_position(user_id, Exchange::Binance, stale_open);
    let position_id = position.id;
    let store = Arc::new(
        InMemoryStore::new()
            .with_position(position)
            .with_connection(Exchange::Binance),
    );
    let adapter = Arc::new(
        MockExchangeAdapter::new(Exchange::Binance)
            .with_bracket(BracketState::not_found())
            .with_balance(0.0),
    );
    let factory = MockAdapterFactory::new().register(Exchange::Binance, adapter.clone());

    let summary = reconciler(store.clone(), factory)
        .run_for_user(user_id)
        .await
        .unwrap();

    assert_eq!(summary.needs_review, 1);
    assert_eq!(summary.closed, 0);

    // Never synthesize a $0 close
    let position = store.position(position_id);
    assert_eq!(position.status, PositionStatus::Open);
    assert_eq!(position.exit_price, None);
    assert_eq!(adapter.sell_count(), 0);

    let audits = store.audits();
    assert_eq!(audits.len(), 1);
    assert_eq!(audits[0].exit_price, None);
    assert!(store.stats().is_empty());
}

#[tokio::test]
async fn missing_connection_skips_exchange_without_halting_others() {
    let user_id = Uuid::new_v4();
    let binance_pos = open_position(user_id, Exchange::Binance, Utc::now());
    let okx_a = open_position(user_id, Exchange::Okx, Utc::now());
    let okx_b = open_position(user_id, Exchange::Okx, Utc::now());
    let binance_id = binance_pos.id;
    let store = Arc::new(
        InMemoryStore::new()
            .with_position(binance_pos)
            .with_position(okx_a)
            .with_position(okx_b)
            .with_connection(Exchange::Binance),
    );
    let adapter = Arc::new(
        MockExchangeAdapter::new(Exchange::Binance)
            .with_bracket(live_bracket())
            .with_price(60200.0),
    );
    let factory = MockAdapterFactory::new().register(Exchange::Binance, adapter);

    let summary = reconciler(store.clone(), factory)
        .run_for_user(user_id)
        .await
        .unwrap();

    assert_eq!(summary.scanned, 3);
    // Both OKX positions are counted as errors and left untouched
    assert_eq!(summary.errors, 2);
    assert_eq!(summary.closed, 1);
    assert_eq!(store.position(binance_id).status, PositionStatus::Closed);
}

#[tokio::test]
async fn adapter_failure_on_one_position_does_not_stop_its_siblings() {
    let user_id = Uuid::new_v4();
    let healthy = open_position(user_id, Exchange::Binance, Utc::now());
    let healthy_id = healthy.id;
    let store = Arc::new(
        InMemoryStore::new()
            .with_position(healthy)
            .with_connection(Exchange::Binance),
    );
    // Bracket lookups fail with a 503; the price path never runs, so the
    // only open position errors out but the pass still completes.
    let adapter = Arc::new(
        MockExchangeAdapter::new(Exchange::Binance).with_failing_op("get_bracket_status"),
    );
    let factory = MockAdapterFactory::new().register(Exchange::Binance, adapter);

    let summary = reconciler(store.clone(), factory)
        .run_for_user(user_id)
        .await
        .unwrap();

    assert_eq!(summary.errors, 1);
    assert_eq!(summary.closed, 0);
    assert_eq!(store.position(healthy_id).status, PositionStatus::Open);
    assert!(store.audits().is_empty());
}

#[tokio::test]
async fn no_action_leaves_everything_untouched() {
    let user_id = Uuid::new_v4();
    // Price barely above entry: fees eat the move, below the profit floor
    let position = open_position(user_id, Exchange::Binance, Utc::now());
    let position_id = position.id;
    let store = Arc::new(
        InMemoryStore::new()
            .with_position(position)
            .with_connection(Exchange::Binance),
    );
    let adapter = Arc::new(
        MockExchangeAdapter::new(Exchange::Binance)
            .with_bracket(live_bracket())
            .with_price(60100.0),
    );
    let factory = MockAdapterFactory::new().register(Exchange::Binance, adapter.clone());

    let summary = reconciler(store.clone(), factory)
        .run_for_user(user_id)
        .await
        .unwrap();

    assert_eq!(summary.scanned, 1);
    assert_eq!(summary.closed, 0);
    assert_eq!(summary.needs_review, 0);
    assert_eq!(summary.errors, 0);
    assert_eq!(store.position(position_id).status, PositionStatus::Open);
    assert!(store.audits().is_empty());
    assert_eq!(adapter.sell_count(), 0);
}

#[tokio::test]
async fn lost_close_race_writes_no_audit() {
    // A store whose close always reports "someone else won"
    struct RacingStore(InMemoryStore);

    #[async_trait]
    impl PositionStore for RacingStore {
        async fn load_open_positions(&self, user_id: Uuid) -> anyhow::Result<Vec<Position>> {
            self.0.load_open_positions(user_id).await
        }

        async fn close_position(
            &self,
            _position_id: Uuid,
            _exit_price: f64,
            _pnl: f64,
            _closed_at: DateTime<Utc>,
        ) -> anyhow::Result<bool> {
            Ok(false)
        }

        async fn insert_audit(&self, event: &AuditEvent) -> anyhow::Result<()> {
            self.0.insert_audit(event).await
        }

        async fn update_bot_run_stats(
            &self,
            user_id: Uuid,
            delta_pnl: f64,
            is_win: bool,
        ) -> anyhow::Result<()> {
            self.0.update_bot_run_stats(user_id, delta_pnl, is_win).await
        }
    }

    #[async_trait]
    impl CredentialStore for RacingStore {
        async fn get_connection(
            &self,
            user_id: Uuid,
            exchange: Exchange,
        ) -> anyhow::Result<Option<ExchangeCredentials>> {
            self.0.get_connection(user_id, exchange).await
        }
    }

    let user_id = Uuid::new_v4();
    let position = open_position(user_id, Exchange::Binance, Utc::now());
    let store = Arc::new(RacingStore(
        InMemoryStore::new()
            .with_position(position)
            .with_connection(Exchange::Binance),
    ));
    let adapter = Arc::new(
        MockExchangeAdapter::new(Exchange::Binance)
            .with_bracket(live_bracket())
            .with_price(60200.0),
    );
    let factory = MockAdapterFactory::new().register(Exchange::Binance, adapter);

    let engine = Reconciler::new(
        store.clone(),
        store.clone(),
        Arc::new(factory),
        policy(),
    );
    let summary = engine.run_for_user(user_id).await.unwrap();

    assert_eq!(summary.closed, 0);
    assert_eq!(summary.errors, 0);
    assert!(store.0.audits().is_empty());
    assert!(store.0.stats().is_empty());
}

#[tokio::test]
async fn audit_failure_after_close_is_surfaced() {
    // The audit write fails after the close landed: the pass must report
    // an error instead of silently leaving a closed position unaudited.
    struct BrokenAuditStore(InMemoryStore);

    #[async_trait]
    impl PositionStore for BrokenAuditStore {
        async fn load_open_positions(&self, user_id: Uuid) -> anyhow::Result<Vec<Position>> {
            self.0.load_open_positions(user_id).await
        }

        async fn close_position(
            &self,
            position_id: Uuid,
            exit_price: f64,
            pnl: f64,
            closed_at: DateTime<Utc>,
        ) -> anyhow::Result<bool> {
            self.0.close_position(position_id, exit_price, pnl, closed_at).await
        }

        async fn insert_audit(&self, _event: &AuditEvent) -> anyhow::Result<()> {
            anyhow::bail!("audit table unavailable")
        }

        async fn update_bot_run_stats(
            &self,
            user_id: Uuid,
            delta_pnl: f64,
            is_win: bool,
        ) -> anyhow::Result<()> {
            self.0.update_bot_run_stats(user_id, delta_pnl, is_win).await
        }
    }

    #[async_trait]
    impl CredentialStore for BrokenAuditStore {
        async fn get_connection(
            &self,
            user_id: Uuid,
            exchange: Exchange,
        ) -> anyhow::Result<Option<ExchangeCredentials>> {
            self.0.get_connection(user_id, exchange).await
        }
    }

    let user_id = Uuid::new_v4();
    let position = open_position(user_id, Exchange::Binance, Utc::now());
    let position_id = position.id;
    let store = Arc::new(BrokenAuditStore(
        InMemoryStore::new()
            .with_position(position)
            .with_connection(Exchange::Binance),
    ));
    let adapter = Arc::new(
        MockExchangeAdapter::new(Exchange::Binance)
            .with_bracket(live_bracket())
            .with_price(60200.0),
    );
    let factory = MockAdapterFactory::new().register(Exchange::Binance, adapter);

    let engine = Reconciler::new(
        store.clone(),
        store.clone(),
        Arc::new(factory),
        policy(),
    );
    let summary = engine.run_for_user(user_id).await.unwrap();

    // The close itself went through, but it is counted as an error,
    // not a success, and no stats delta was applied.
    assert_eq!(summary.errors, 1);
    assert_eq!(summary.closed, 0);
    assert_eq!(store.0.position(position_id).status, PositionStatus::Closed);
    assert!(store.0.audits().is_empty());
    assert!(store.0.stats().is_empty());
}
