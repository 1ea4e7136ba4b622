use crate::engine::ReconcilePolicy;
use crate::ratelimit::LimiterSettings;
use chrono::Duration;
use config::{Config, Environment};
use serde::Deserialize;

/// Runtime settings, sourced from the environment with a `RECONBOT_`
/// prefix (e.g. `RECONBOT_DATABASE_URL`). Everything except the
/// database URL has a sane default.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub database_url: String,

    /// Hours after which an unprotected position is force-closed
    pub staleness_hours: i64,
    /// Minimum net profit (USD) worth realizing early
    pub profit_floor_usd: f64,
    /// Taker fee charged per side, as a fraction of notional
    pub fee_rate_per_side: f64,

    /// Fraction of each exchange's advertised rate limit we allow ourselves
    pub utilization_cap: f64,
    /// Consecutive throttles before a limiter bucket goes conservative
    pub conservative_threshold: u32,
    /// Consecutive successes before a conservative bucket starts recovering
    pub recovery_successes: u32,
}

impl Settings {
    pub fn load() -> anyhow::Result<Self> {
        let settings = Config::builder()
            .set_default("staleness_hours", 4)?
            .set_default("profit_floor_usd", 0.01)?
            .set_default("fee_rate_per_side", 0.001)?
            .set_default("utilization_cap", 0.90)?
            .set_default("conservative_threshold", 3)?
            .set_default("recovery_successes", 10)?
            .add_source(Environment::with_prefix("RECONBOT"))
            .build()?
            .try_deserialize()?;
        Ok(settings)
    }

    pub fn reconcile_policy(&self) -> ReconcilePolicy {
        ReconcilePolicy {
            staleness: Duration::hours(self.staleness_hours),
            profit_floor_usd: self.profit_floor_usd,
            fee_rate_per_side: self.fee_rate_per_side,
        }
    }

    pub fn limiter_settings(&self) -> LimiterSettings {
        LimiterSettings {
            utilization_cap: self.utilization_cap,
            conservative_threshold: self.conservative_threshold,
            recovery_successes: self.recovery_successes,
            ..LimiterSettings::default()
        }
    }
}
