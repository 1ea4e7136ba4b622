use crate::engine::{CredentialStore, PositionStore};
use crate::models::{
    AuditEvent, BracketOrderHandle, CloseCause, Direction, Exchange, ExchangeCredentials, Position,
    PositionStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use uuid::Uuid;

/// Postgres persistence for positions, audit events and bot run stats
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect to Postgres and run pending migrations
    pub async fn new(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        tracing::info!("Connected to Postgres");

        Ok(Self { pool })
    }

    fn row_to_position(row: &sqlx::postgres::PgRow) -> anyhow::Result<Position> {
        let direction_str: String = row.get("direction");
        let direction = match direction_str.as_str() {
            "long" => Direction::Long,
            "short" => Direction::Short,
            other => anyhow::bail!("invalid direction in row: {}", other),
        };

        let exchange_str: String = row.get("exchange");
        let exchange = exchange_str
            .parse::<Exchange>()
            .map_err(|e| anyhow::anyhow!(e))?;

        let status_str: String = row.get("status");
        let status = match status_str.as_str() {
            "open" => PositionStatus::Open,
            "closed" => PositionStatus::Closed,
            other => anyhow::bail!("invalid position status in row: {}", other),
        };

        let bracket_group_id: Option<String> = row.get("bracket_group_id");

        Ok(Position {
            id: row.get("id"),
            user_id: row.get("user_id"),
            symbol: row.get("symbol"),
            direction,
            entry_price: row.get("entry_price"),
            notional: row.get("notional"),
            leverage: row.get("leverage"),
            exchange,
            opened_at: row.get("opened_at"),
            bracket: bracket_group_id.map(|group_id| BracketOrderHandle { group_id }),
            status,
            exit_price: row.get("exit_price"),
            realized_pnl: row.get("realized_pnl"),
            closed_at: row.get("closed_at"),
        })
    }
}

#[async_trait]
impl PositionStore for PostgresStore {
    async fn load_open_positions(&self, user_id: Uuid) -> anyhow::Result<Vec<Position>> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, symbol, direction, entry_price, notional, leverage,
                   exchange, opened_at, bracket_group_id, status,
                   exit_price, realized_pnl, closed_at
            FROM positions
            WHERE user_id = $1 AND status = 'open'
            ORDER BY opened_at ASC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let mut positions = Vec::with_capacity(rows.len());
        for row in &rows {
            positions.push(Self::row_to_position(row)?);
        }

        tracing::debug!("Loaded {} open positions for {}", positions.len(), user_id);
        Ok(positions)
    }

    async fn close_position(
        &self,
        position_id: Uuid,
        exit_price: f64,
        pnl: f64,
        closed_at: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        // Conditional on status so that concurrent passes close at most once
        let result = sqlx::query(
            r#"
            UPDATE positions
            SET status = 'closed',
                exit_price = $2,
                realized_pnl = $3,
                closed_at = $4,
                updated_at = NOW()
            WHERE id = $1 AND status = 'open'
            "#,
        )
        .bind(position_id)
        .bind(exit_price)
        .bind(pnl)
        .bind(closed_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn insert_audit(&self, event: &AuditEvent) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_events (id, user_id, position_id, kind, exit_price, pnl, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(event.user_id)
        .bind(event.position_id)
        .bind(event.kind.as_str())
        .bind(event.exit_price)
        .bind(event.pnl)
        .bind(event.metadata.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_bot_run_stats(
        &self,
        user_id: Uuid,
        delta_pnl: f64,
        is_win: bool,
    ) -> anyhow::Result<()> {
        let win_increment: i64 = if is_win { 1 } else { 0 };
        sqlx::query(
            r#"
            INSERT INTO bot_run_stats (user_id, total_pnl, trade_count, win_count)
            VALUES ($1, $2, 1, $3)
            ON CONFLICT (user_id) DO UPDATE SET
                total_pnl = bot_run_stats.total_pnl + EXCLUDED.total_pnl,
                trade_count = bot_run_stats.trade_count + 1,
                win_count = bot_run_stats.win_count + EXCLUDED.win_count,
                updated_at = NOW()
            "#,
        )
        .bind(user_id)
        .bind(delta_pnl)
        .bind(win_increment)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// All three writes in one transaction: a position is never left
    /// closed without its audit row and stats delta.
    async fn record_close(
        &self,
        position: &Position,
        cause: CloseCause,
        exit_price: f64,
        pnl: f64,
        metadata: serde_json::Value,
    ) -> anyhow::Result<bool> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE positions
            SET status = 'closed',
                exit_price = $2,
                realized_pnl = $3,
                closed_at = $4,
                updated_at = NOW()
            WHERE id = $1 AND status = 'open'
            "#,
        )
        .bind(position.id)
        .bind(exit_price)
        .bind(pnl)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() != 1 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO audit_events (id, user_id, position_id, kind, exit_price, pnl, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(position.user_id)
        .bind(position.id)
        .bind(cause.as_str())
        .bind(exit_price)
        .bind(pnl)
        .bind(metadata.to_string())
        .execute(&mut *tx)
        .await?;

        let win_increment: i64 = if pnl > 0.0 { 1 } else { 0 };
        sqlx::query(
            r#"
            INSERT INTO bot_run_stats (user_id, total_pnl, trade_count, win_count)
            VALUES ($1, $2, 1, $3)
            ON CONFLICT (user_id) DO UPDATE SET
                total_pnl = bot_run_stats.total_pnl + EXCLUDED.total_pnl,
                trade_count = bot_run_stats.trade_count + 1,
                win_count = bot_run_stats.win_count + EXCLUDED.win_count,
                updated_at = NOW()
            "#,
        )
        .bind(position.user_id)
        .bind(pnl)
        .bind(win_increment)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }
}

#[async_trait]
impl CredentialStore for PostgresStore {
    async fn get_connection(
        &self,
        user_id: Uuid,
        exchange: Exchange,
    ) -> anyhow::Result<Option<ExchangeCredentials>> {
        let row = sqlx::query(
            r#"
            SELECT api_key, api_secret, passphrase
            FROM exchange_connections
            WHERE user_id = $1 AND exchange = $2
            "#,
        )
        .bind(user_id)
        .bind(exchange.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| ExchangeCredentials {
            api_key: row.get("api_key"),
            api_secret: row.get("api_secret"),
            passphrase: row.get("passphrase"),
        }))
    }
}
