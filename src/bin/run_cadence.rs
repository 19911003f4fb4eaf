//! Runs one cadence immediately and prints its report as JSON.
//!
//! Usage: `run_cadence <daily_morning|daily_afternoon|weekly>`

use std::sync::Arc;

use outreach_engine::bootstrap::build_engine;
use outreach_engine::config::Config;
use outreach_engine::scheduler::{Cadence, Scheduler, SystemClock};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "outreach_engine=info".into()),
        )
        .init();

    let Some(arg) = std::env::args().nth(1) else {
        anyhow::bail!("usage: run_cadence <daily_morning|daily_afternoon|weekly>");
    };
    let cadence: Cadence = arg.parse().map_err(|e: String| anyhow::anyhow!(e))?;

    let config = Config::from_env()?;
    let engine = build_engine(&config).await?;
    let scheduler = Scheduler::new(engine, Arc::new(SystemClock));

    let report = scheduler.run(cadence).await;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if !report.all_ok() {
        anyhow::bail!("cadence {} finished with failed steps", cadence);
    }
    Ok(())
}
