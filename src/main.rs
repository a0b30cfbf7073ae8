mod cli;
mod demo;
mod ui;

use std::time::Duration;

use anyhow::{Result, bail};
use clap::Parser;
use cli::{Cli, Command};
use jobkernel::{Engine, EngineConfig};
use serde_json::json;
use ui::ProcessProgress;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = EngineConfig::load()?;
    if let Some(workers) = cli.workers {
        config.worker_threads = workers as usize;
    }
    if let Some(team) = cli.team {
        config.team = team.into();
    }
    setup_logging(&config, cli.verbose);

    match cli.command {
        Command::Demo {
            orders,
            latency_ms,
            json,
        } => run_demo(config, orders, Duration::from_millis(latency_ms), json).await,
        Command::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn setup_logging(config: &EngineConfig, verbose: bool) {
    let level = if verbose {
        log::LevelFilter::Debug
    } else {
        config.log_filter()
    };

    env_logger::Builder::new()
        .filter_level(level)
        .format_timestamp(None)
        .init();
}

async fn run_demo(config: EngineConfig, orders: u64, latency: Duration, print_json: bool) -> Result<()> {
    let engine = Engine::new(config);
    engine.start_monitor()?;
    log::info!(
        "running {orders} orders on team `{}` ({} workers)",
        engine.team().name(),
        engine.config().worker_threads
    );

    let graph = demo::graph(&engine, latency)?;
    let progress = ProcessProgress::start(&format!("Processing {orders} orders"));
    let handle = engine.invoke(&graph, demo::ENTRY, json!({ "orders": orders }).into())?;
    let report = tokio::task::spawn_blocking(move || handle.wait()).await?;

    progress.finish(&report);
    if print_json {
        progress.print_report(&report);
    }
    if let Some(failure) = report.outcome.failure() {
        bail!("process {} failed: {failure}", report.process_id);
    }
    Ok(())
}
