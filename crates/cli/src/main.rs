//! Cohort CLI entry point.
//!
//! This binary is the composition root. Responsibilities:
//!
//! 1. **Resolve configuration**: read the optional JSON file given by
//!    `--config`, then apply command-line flags on top.
//! 2. **Wire observability**: install a `tracing-subscriber` with an
//!    `EnvFilter`, plain or JSON output, and an OpenTelemetry OTLP exporter
//!    when an endpoint is configured. All spans and events emitted by the
//!    engine flow through this subscriber.
//! 3. **Run a scenario**: declare the selected demonstration pipeline with
//!    the `query` builder, run it, and print a JSON [`scenarios::RunSummary`]
//!    on stdout.
//!
//! ```bash
//! RUST_LOG=pipeline=debug cohort --scenario barrier --input 30,10,20
//! cohort --scenario gated --gate-slots 2 --gate-window-ms 50 --json-logs
//! ```

mod config;
mod scenarios;
mod telemetry;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use crate::config::{Args, CliConfig};
use crate::telemetry::Telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = CliConfig::resolve(&args)?;
    let telemetry = Telemetry::init(&config)?;

    let outcome = scenarios::run(&config).await;
    let summary = match outcome {
        Ok(summary) => summary,
        Err(e) => {
            error!(error = %e, "scenario failed");
            telemetry.shutdown();
            return Err(e.into());
        }
    };

    info!(
        scenario = ?summary.scenario,
        output = summary.output.len(),
        elapsed_ms = summary.elapsed_ms,
        "scenario finished"
    );
    telemetry.shutdown();

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
