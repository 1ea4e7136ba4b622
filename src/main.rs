use clap::{Parser, Subcommand};
use reconbot::config::Settings;
use reconbot::db::PostgresStore;
use reconbot::engine::{CredentialStore, Reconciler};
use reconbot::exchange::{AdapterFactory, LiveAdapterFactory};
use reconbot::models::Exchange;
use reconbot::ratelimit::RateLimiter;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "reconbot", about = "Position reconciliation and profit-taking engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one reconciliation pass over a user's open positions
    Check {
        #[arg(long)]
        user_id: Uuid,
    },
    /// Query a single order's normalized status (read-only)
    OrderStatus {
        #[arg(long)]
        user_id: Uuid,
        #[arg(long)]
        exchange: Exchange,
        #[arg(long)]
        symbol: String,
        #[arg(long)]
        order_id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let cli = Cli::parse();
    let settings = Settings::load()?;
    let store = Arc::new(PostgresStore::new(&settings.database_url).await?);
    let limiter = Arc::new(RateLimiter::new(settings.limiter_settings()));
    let adapters = Arc::new(LiveAdapterFactory::new(limiter));

    match cli.command {
        Command::Check { user_id } => {
            let reconciler = Reconciler::new(
                store.clone(),
                store,
                adapters,
                settings.reconcile_policy(),
            );
            let summary = reconciler.run_for_user(user_id).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::OrderStatus {
            user_id,
            exchange,
            symbol,
            order_id,
        } => {
            let credentials = store
                .get_connection(user_id, exchange)
                .await?
                .ok_or_else(|| anyhow::anyhow!("no {} connection for user {}", exchange, user_id))?;
            let adapter = adapters.adapter_for(exchange, &credentials);
            let status = adapter.get_order_status(&symbol, &order_id).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }

    Ok(())
}

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("reconbot=info")),
        )
        .init();
}
