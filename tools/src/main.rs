//! billing-runner: headless runner for the recurring billing engine.
//!
//! Usage:
//!   billing-runner --db billing.db --job daily_billing --as-of 2026-03-01
//!   billing-runner --db billing.db --set-trigger overdue_sweep "every 2 hours"
//!   billing-runner --db billing.db            (scheduler loop until Ctrl-C)
//!
//! `--as-of` pins the clock to midnight UTC of that date and is only accepted
//! together with `--job`.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use netbill_core::{
    clock::{Clock, ManualClock, SystemClock},
    config::EngineConfig,
    engine::BillingEngine,
    lifecycle::ClientStatus,
    ports::{LoggingNetworkPool, LoggingReminders},
    scheduler::JobState,
    store::BillingStore,
};
use std::env;
use std::sync::Arc;
use std::time::Duration;

#[derive(serde::Serialize)]
struct RunSummary {
    job:              JobState,
    active:           i64,
    suspended:        i64,
    cut_service:      i64,
    invoices_on_file: i64,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let db = flag(&args, "--db").unwrap_or("billing.db");
    let data_dir = flag(&args, "--data-dir").unwrap_or("./data");
    let job = flag(&args, "--job");
    let poll_secs = parse_arg(&args, "--poll-secs", 30u64);
    let as_of = flag(&args, "--as-of")
        .map(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d"))
        .transpose()
        .context("--as-of must be YYYY-MM-DD")?;
    let set_trigger = args.iter().position(|a| a == "--set-trigger");
    check_clock_flags(as_of, job, set_trigger.is_some())?;

    println!("billing-runner");
    println!("  db:        {db}");
    println!("  data_dir:  {data_dir}");
    println!();

    let config = EngineConfig::load(data_dir)?;
    let store = BillingStore::open(db)?;
    store.migrate()?;

    let clock: Arc<dyn Clock> = match as_of {
        Some(date) => Arc::new(ManualClock::at_date(date)),
        None => Arc::new(SystemClock),
    };
    let engine = BillingEngine::build(
        store,
        config,
        clock,
        Arc::new(LoggingNetworkPool),
        Arc::new(LoggingReminders),
    )
    .await?;

    if let Some(pos) = set_trigger {
        let (name, expression) = match (args.get(pos + 1), args.get(pos + 2)) {
            (Some(n), Some(e)) => (n, e),
            _ => anyhow::bail!("--set-trigger needs a job name and an expression"),
        };
        engine.scheduler.set_trigger(name, expression).await?;
        println!("{name} now runs {expression}");
        return Ok(());
    }

    match job {
        Some(name) => {
            let state = engine.scheduler.run_now(name).await?;
            print_summary(&engine, state).await?;
        }
        None => serve(&engine, Duration::from_secs(poll_secs)).await?,
    }
    Ok(())
}

async fn serve(engine: &BillingEngine, poll: Duration) -> Result<()> {
    for state in engine.scheduler.states().await {
        println!("  {:<16} {:<16} next {}", state.name, state.trigger, state.next_due);
    }
    let handle = engine.scheduler.start(poll);
    tokio::signal::ctrl_c().await?;
    log::info!("runner: interrupt received, shutting down");
    handle.shutdown().await;
    Ok(())
}

async fn print_summary(engine: &BillingEngine, job: JobState) -> Result<()> {
    let summary = {
        let store = engine.store.lock().await;
        RunSummary {
            job,
            active:           store.count_profiles_by_status(ClientStatus::Active)?,
            suspended:        store.count_profiles_by_status(ClientStatus::Suspended)?,
            cut_service:      store.count_profiles_by_status(ClientStatus::CutService)?,
            invoices_on_file: store.count_invoices()?,
        }
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

/// A manual clock never advances, so the scheduler loop would never fire.
fn check_clock_flags(as_of: Option<NaiveDate>, job: Option<&str>, setting_trigger: bool) -> Result<()> {
    if as_of.is_some() && job.is_none() && !setting_trigger {
        anyhow::bail!("--as-of freezes the clock and needs --job; the scheduler loop runs on the system clock");
    }
    Ok(())
}

fn flag<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
    args.windows(2)
        .find(|w| w[0] == name)
        .map(|w| w[1].as_str())
}

fn parse_arg<T: std::str::FromStr>(args: &[String], flag: &str, default: T) -> T {
    args.windows(2)
        .find(|w| w[0] == flag)
        .and_then(|w| w[1].parse().ok())
        .unwrap_or(default)
}
