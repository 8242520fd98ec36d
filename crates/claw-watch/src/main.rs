//! claw-watch - scripted search alerting
//!
//! Runs every alert of an alert file on its interval: query the search
//! backend, evaluate the alert's Starlark condition, dispatch its actions.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use claw_watch::{
    ActionDispatcher, AlertDefinition, CycleOutcome, CycleRunner, ElasticsearchClient,
    InterpreterPool, Scheduler, WatchConfig, load_alerts_file,
};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "claw-watch")]
#[command(about = "Scripted search alerting")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    overrides: Overrides,

    /// Default log level, `RUST_LOG` takes precedence
    #[arg(long, global = true, env = "CLAW_WATCH_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

/// Values that replace those of the config file.
#[derive(Args, Debug, Default)]
struct Overrides {
    /// Path to the TOML config file
    #[arg(short, long, global = true, env = "CLAW_WATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Path to the YAML alert file
    #[arg(long, global = true, env = "CLAW_WATCH_ALERTS")]
    alerts: Option<PathBuf>,

    /// Search backend address
    #[arg(long, global = true, env = "CLAW_WATCH_SEARCH_ADDR")]
    search_addr: Option<String>,

    /// Chat webhook URL for slack actions
    #[arg(long, global = true, env = "CLAW_WATCH_WEBHOOK_ENDPOINT")]
    webhook_endpoint: Option<String>,

    /// Starlark file run once in every interpreter
    #[arg(long, global = true, env = "CLAW_WATCH_SCRIPT_INIT")]
    script_init: Option<PathBuf>,

    /// Number of interpreters
    #[arg(long, global = true, env = "CLAW_WATCH_SCRIPT_SLOTS")]
    script_slots: Option<usize>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every alert until interrupted
    Run,

    /// Validate the alert file and print a summary
    Check,

    /// Run one cycle of an alert now
    ForceRun {
        /// Alert name
        name: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("claw_watch={}", cli.log_level)))?;
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let config = load_config(&cli.overrides)?;

    match cli.command {
        Commands::Run => run(&config).await?,
        Commands::Check => check(&config)?,
        Commands::ForceRun { name } => force_run(&config, &name).await?,
    }

    Ok(())
}

fn load_config(overrides: &Overrides) -> anyhow::Result<WatchConfig> {
    let mut config = match &overrides.config {
        Some(path) => WatchConfig::from_file(path)?,
        None => WatchConfig::default(),
    };
    apply_overrides(&mut config, overrides);
    config.validate()?;
    Ok(config)
}

fn apply_overrides(config: &mut WatchConfig, overrides: &Overrides) {
    if let Some(alerts) = &overrides.alerts {
        config.alerts.clone_from(alerts);
    }
    if let Some(addr) = &overrides.search_addr {
        config.search_addr.clone_from(addr);
    }
    if let Some(endpoint) = &overrides.webhook_endpoint {
        config.webhook_endpoint = Some(endpoint.clone());
    }
    if let Some(init) = &overrides.script_init {
        config.interpreter.init_script = Some(init.clone());
    }
    if let Some(slots) = overrides.script_slots {
        config.interpreter.pool_size = slots;
    }
}

fn build_runner(config: &WatchConfig) -> anyhow::Result<CycleRunner> {
    let search = ElasticsearchClient::new(&config.search_addr, config.http_timeout())?;
    let pool = InterpreterPool::new(config.pool_config()?).context("starting interpreter pool")?;
    let dispatcher = ActionDispatcher::new(config.dispatcher_config())?;

    info!(
        search = %search.base_url(),
        slots = pool.size(),
        webhook = dispatcher.webhook_endpoint().is_some(),
        "runner ready"
    );

    Ok(CycleRunner::new(Arc::new(search), pool, dispatcher)
        .with_cycle_timeout(config.cycle_timeout()))
}

async fn run(config: &WatchConfig) -> anyhow::Result<()> {
    info!(alerts = %config.alerts.display(), "starting claw-watch");

    let alerts = load_alerts_file(&config.alerts)?;
    if alerts.is_empty() {
        warn!(alerts = %config.alerts.display(), "alert file defines no alerts");
    }

    let scheduler = Scheduler::new(Arc::new(build_runner(config)?));
    let tasks = scheduler.spawn_all(alerts);

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutting down");
    scheduler.shutdown();

    for task in tasks {
        task.await?;
    }

    info!("claw-watch stopped");
    Ok(())
}

fn check(config: &WatchConfig) -> anyhow::Result<()> {
    let alerts = load_alerts_file(&config.alerts)?;

    println!("{}: {} alert(s)", config.alerts.display(), alerts.len());
    for alert in &alerts {
        let actions: Vec<String> = alert.actions.iter().map(ToString::to_string).collect();
        println!(
            "  {:<24} every {:>5}s  index={}  actions=[{}]",
            alert.name,
            alert.interval_secs,
            alert.search.index,
            actions.join(", ")
        );
    }

    Ok(())
}

async fn force_run(config: &WatchConfig, name: &str) -> anyhow::Result<()> {
    let alerts = load_alerts_file(&config.alerts)?;
    let Some(alert) = find_alert(&alerts, name) else {
        bail!("no alert named {name:?} in {}", config.alerts.display());
    };

    let runner = build_runner(config)?;
    match runner.run_cycle(alert).await {
        CycleOutcome::NoMatch => println!("{name}: no match"),
        CycleOutcome::Matched(report) => {
            println!("{name}: matched");
            for outcome in report.outcomes() {
                match &outcome.result {
                    Ok(()) => println!("  action {} ({}): ok", outcome.index, outcome.kind),
                    Err(e) => println!("  action {} ({}): {e}", outcome.index, outcome.kind),
                }
            }
            report.into_result()?;
        }
        CycleOutcome::Failed(e) => return Err(e.into()),
    }

    Ok(())
}

fn find_alert<'a>(alerts: &'a [AlertDefinition], name: &str) -> Option<&'a AlertDefinition> {
    alerts.iter().find(|alert| alert.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::try_parse_from([
            "claw-watch",
            "--search-addr",
            "es:9200",
            "--script-slots",
            "3",
            "force-run",
            "error-spike",
        ])
        .unwrap();

        let config = load_config(&cli.overrides).unwrap();
        assert_eq!(config.search_addr, "es:9200");
        assert_eq!(config.interpreter.pool_size, 3);
        assert!(matches!(cli.command, Commands::ForceRun { ref name } if name == "error-spike"));
    }

    #[test]
    fn invalid_override_is_rejected() {
        let cli = Cli::try_parse_from(["claw-watch", "check", "--script-slots", "0"]).unwrap();
        assert!(load_config(&cli.overrides).is_err());
    }

    #[test]
    fn flags_override_config_file() {
        let mut config = WatchConfig::from_toml("search_addr = \"file:9200\"").unwrap();
        let overrides = Overrides {
            webhook_endpoint: Some("http://hooks.local".to_string()),
            ..Overrides::default()
        };

        apply_overrides(&mut config, &overrides);
        assert_eq!(config.search_addr, "file:9200");
        assert_eq!(config.webhook_endpoint.as_deref(), Some("http://hooks.local"));
    }
}
