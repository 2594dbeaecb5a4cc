//! Demonstration pipelines over `u64` items.
//!
//! The configured deadline and gate are applied to the first stage of every
//! scenario, which is where each one does its per-item work.

use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info};

use pipeline::{GateConfig, PipelineError, Timestamp};
use query::{query, Query, Step};

use crate::config::{CliConfig, Scenario};

/// What the binary prints after a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub scenario: Scenario,
    pub input: Vec<u64>,
    pub output: Vec<u64>,
    pub started_at: Timestamp,
    pub finished_at: Timestamp,
    pub elapsed_ms: u64,
}

/// Builds and runs the configured scenario.
pub async fn run(config: &CliConfig) -> Result<RunSummary, PipelineError> {
    let input = config.input();
    info!(
        scenario = ?config.scenario,
        items = input.len(),
        barrier = ?config.engine.barrier,
        "running scenario"
    );

    let started_at = Timestamp::now();
    let output = build(config, input.clone()).run().await?;
    let finished_at = Timestamp::now();

    Ok(RunSummary {
        scenario: config.scenario,
        input,
        output,
        started_at,
        finished_at,
        elapsed_ms: finished_at.millis_since(started_at),
    })
}

/// Declares the scenario's stages over `input`.
pub fn build(config: &CliConfig, input: Vec<u64>) -> Query<u64> {
    let tuning = Tuning {
        timeout: config.timeout(),
        gate: config.gate(),
    };
    let items = query(input).with_config(config.engine);

    match config.scenario {
        Scenario::Squares => tuning.apply(items.select(|n| async move { n * n })).done(),
        Scenario::Odds => tuning
            .apply(items.filter(|n| {
                let odd = n % 2 == 1;
                async move { odd }
            }))
            .done(),
        Scenario::Primes => tuning
            .apply(items.select_many(|n| async move { primes_below(n) }))
            .done(),
        Scenario::Barrier => tuning
            .apply(items.select(|n| async move {
                tokio::time::sleep(Duration::from_millis(n)).await;
                n * n
            }))
            .wait()
            .for_each(|n| {
                debug!(item = *n, "released from barrier");
                async {}
            })
            .done(),
        Scenario::Gated => tuning.apply(items.select(|n| async move { n + 1 })).done(),
        Scenario::Expand => tuning
            .apply(items.select_many(|n| async move { primes_below(n) }))
            .select_many(|p| async move { [p, next_prime(p)] })
            .done(),
    }
}

struct Tuning {
    timeout: Option<Duration>,
    gate: Option<GateConfig>,
}

impl Tuning {
    fn apply<M>(&self, mut step: Step<u64, M>) -> Step<u64, M> {
        if let Some(timeout) = self.timeout {
            step = step.timeout(timeout);
        }
        if let Some(gate) = self.gate {
            step = step.gate(gate.slots, gate.window());
        }
        step
    }
}

// ---------------------------------------------------------------------------
// Prime walk
// ---------------------------------------------------------------------------

/// `true` for 1 and for every prime. The walk starts at 1.
pub fn is_prime_or_one(n: u64) -> bool {
    n == 1 || (n >= 2 && (2..).take_while(|d| d * d <= n).all(|d| n % d != 0))
}

/// Smallest member of the walk greater than `n`.
pub fn next_prime(n: u64) -> u64 {
    (n.saturating_add(1)..)
        .find(|&c| is_prime_or_one(c))
        .unwrap_or(u64::MAX)
}

/// Every member of the walk below `max`, ascending.
pub fn primes_below(max: u64) -> Vec<u64> {
    (1..max).filter(|&n| is_prime_or_one(n)).collect()
}
