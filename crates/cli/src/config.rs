//! Run configuration for the `cohort` binary.
//!
//! Settings are resolved in two layers: an optional JSON file (`--config`),
//! then command-line flags, which win. Every field has a default, so the
//! binary runs with no configuration at all.
//!
//! ```json
//! {
//!   "scenario": "gated",
//!   "input": [2, 4, 6, 8, 10],
//!   "gate": { "slots": 3, "window_ms": 25 },
//!   "engine": { "barrier": "counting" },
//!   "json_logs": true
//! }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};

use pipeline::{BarrierMode, EngineConfig, GateConfig, PipelineError};

// ---------------------------------------------------------------------------
// Command line
// ---------------------------------------------------------------------------

/// Run a demonstration pipeline and print its aggregate as JSON.
#[derive(Debug, Default, Parser)]
#[command(name = "cohort", version, about)]
pub struct Args {
    /// JSON configuration file. Flags override its values.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Scenario to run.
    #[arg(long, value_enum)]
    pub scenario: Option<Scenario>,

    /// Comma-separated input items, replacing the scenario's default input.
    #[arg(long, value_delimiter = ',')]
    pub input: Option<Vec<u64>>,

    /// Deadline for the scenario's first stage, in milliseconds.
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Slots per window for the scenario's first stage.
    #[arg(long)]
    pub gate_slots: Option<u32>,

    /// Gate window in milliseconds.
    #[arg(long)]
    pub gate_window_ms: Option<u64>,

    /// How cohorts compute their barrier status (`scan` or `counting`).
    #[arg(long, value_parser = parse_barrier)]
    pub barrier: Option<BarrierMode>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    pub json_logs: bool,

    /// Export spans to this OTLP/gRPC endpoint.
    #[arg(long)]
    pub otlp_endpoint: Option<String>,
}

fn parse_barrier(value: &str) -> Result<BarrierMode, String> {
    serde_json::from_value(serde_json::Value::String(value.to_string()))
        .map_err(|_| format!("unknown barrier mode `{value}` (expected `scan` or `counting`)"))
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

/// The demonstration pipelines the binary can run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Scenario {
    /// Map every item to its square.
    #[default]
    Squares,
    /// Keep the odd items.
    Odds,
    /// Expand each item into the primes below it.
    Primes,
    /// Sleep per item, wait for all, then continue.
    Barrier,
    /// Increment each item through a gated stage.
    Gated,
    /// Two nested expansions.
    Expand,
}

impl Scenario {
    /// Input used when none is configured.
    pub fn default_input(self) -> Vec<u64> {
        match self {
            Scenario::Squares => vec![1, 2, 4, 8, 16],
            Scenario::Odds => (1..=10).collect(),
            Scenario::Primes => vec![45],
            Scenario::Barrier => vec![10, 5, 2, 1],
            Scenario::Gated => vec![2, 4, 6, 8, 10],
            Scenario::Expand => vec![10],
        }
    }

    /// Gate used when none is configured.
    pub fn default_gate(self) -> Option<GateConfig> {
        match self {
            Scenario::Gated => Some(GateConfig::new(3, Duration::from_millis(25))),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Config file
// ---------------------------------------------------------------------------

/// Fully resolved settings for one invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CliConfig {
    pub scenario: Scenario,
    /// Replaces [`Scenario::default_input`] when set.
    pub input: Option<Vec<u64>>,
    /// Deadline of the first stage.
    pub timeout_ms: Option<u64>,
    /// Gate of the first stage; falls back to [`Scenario::default_gate`].
    pub gate: Option<GateConfig>,
    pub engine: EngineConfig,
    pub json_logs: bool,
    /// OTLP/gRPC collector. Span export is off when unset.
    pub otlp_endpoint: Option<String>,
}

impl CliConfig {
    /// Parses a configuration from JSON.
    pub fn from_json(text: &str) -> Result<Self, PipelineError> {
        serde_json::from_str(text).map_err(|e| PipelineError::ConfigurationError {
            message: e.to_string(),
        })
    }

    /// Reads and parses the configuration file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_json(&text).with_context(|| format!("invalid config file {}", path.display()))
    }

    /// Resolves the file (if any) and applies the flags on top.
    pub fn resolve(args: &Args) -> anyhow::Result<Self> {
        let base = match &args.config {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        let config = base.apply(args);
        config.validate()?;
        Ok(config)
    }

    /// Overrides every field the flags set.
    pub fn apply(mut self, args: &Args) -> Self {
        if let Some(scenario) = args.scenario {
            self.scenario = scenario;
        }
        if let Some(input) = &args.input {
            self.input = Some(input.clone());
        }
        if let Some(timeout_ms) = args.timeout_ms {
            self.timeout_ms = Some(timeout_ms);
        }
        if args.gate_slots.is_some() || args.gate_window_ms.is_some() {
            let base = self
                .gate()
                .unwrap_or(GateConfig::new(1, Duration::from_secs(1)));
            self.gate = Some(GateConfig {
                slots: args.gate_slots.unwrap_or(base.slots),
                window_ms: args.gate_window_ms.unwrap_or(base.window_ms),
            });
        }
        if let Some(barrier) = args.barrier {
            self.engine.barrier = barrier;
        }
        self.json_logs |= args.json_logs;
        if let Some(endpoint) = &args.otlp_endpoint {
            self.otlp_endpoint = Some(endpoint.clone());
        }
        self
    }

    /// Rejects settings the engine cannot honour.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.timeout_ms == Some(0) {
            return Err(PipelineError::ConfigurationError {
                message: "timeout_ms must be greater than zero".to_string(),
            });
        }
        if matches!(&self.otlp_endpoint, Some(endpoint) if endpoint.trim().is_empty()) {
            return Err(PipelineError::ConfigurationError {
                message: "otlp_endpoint must not be empty".to_string(),
            });
        }
        Ok(())
    }

    /// Input items: the configured ones, or the scenario's default.
    pub fn input(&self) -> Vec<u64> {
        self.input
            .clone()
            .unwrap_or_else(|| self.scenario.default_input())
    }

    /// Deadline for the scenario's first stage.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Gate for the scenario's first stage.
    pub fn gate(&self) -> Option<GateConfig> {
        self.gate.or(self.scenario.default_gate())
    }
}
