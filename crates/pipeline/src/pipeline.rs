//! Pipeline entry point.
//!
//! A [`Pipeline`] pairs a frozen [`StageList`] with an [`EngineConfig`] and
//! turns an input collection into a root [`Cohort`]. The root cohort keeps
//! itself alive until its completion callback fires, so a fire-and-forget
//! run still runs to the end.

use tokio::sync::oneshot;
use tracing::{info, info_span};

use crate::cohort::Completion;
use crate::errors::PipelineError;
use crate::stage::{Item, StageList};
use crate::{Cohort, EngineConfig, RunId};

/// A declared stage sequence, ready to run over any number of collections.
#[derive(Debug, Clone)]
pub struct Pipeline {
    stages: StageList,
    config: EngineConfig,
}

impl Pipeline {
    /// Creates a pipeline with the default configuration.
    pub fn new(stages: impl Into<StageList>) -> Self {
        Self {
            stages: stages.into(),
            config: EngineConfig::default(),
        }
    }

    /// Replaces the engine configuration.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// The stage list shared by every run of this pipeline.
    pub fn stages(&self) -> &StageList {
        &self.stages
    }

    /// The engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Runs `items` through every stage and resolves with the aggregate, in
    /// input order. Items that were filtered out, failed or timed out are
    /// absent.
    pub async fn run(&self, items: Vec<Item>) -> Result<Vec<Item>, PipelineError> {
        let (tx, rx) = oneshot::channel();
        let run_id = self.start(items, move |aggregate| {
            // The receiver is gone only if the caller stopped waiting.
            let _ = tx.send(aggregate);
        });
        rx.await.map_err(|_| PipelineError::Abandoned { run_id })
    }

    /// Starts a run and calls `on_complete` exactly once with the aggregate.
    /// Must be called from within a Tokio runtime.
    pub fn start<F>(&self, items: Vec<Item>, on_complete: F) -> RunId
    where
        F: FnOnce(Vec<Item>) + Send + 'static,
    {
        self.launch(items, Some(Box::new(on_complete)))
    }

    /// Starts a run without a completion signal.
    pub fn spawn(&self, items: Vec<Item>) -> RunId {
        self.launch(items, None)
    }

    fn launch(&self, items: Vec<Item>, on_complete: Option<Completion>) -> RunId {
        let run_id = RunId::new_random();
        let span = info_span!(
            "pipeline_run",
            run_id = %run_id,
            stages = self.stages.len(),
            items = items.len()
        );
        info!(parent: &span, barrier = ?self.config.barrier, "pipeline run started");

        let cohort = Cohort::new(self.stages.clone(), items, 0, self.config.barrier, &span, 0);
        let keep_alive = cohort.clone();
        cohort.run(Some(Box::new(move |aggregate| {
            drop(keep_alive);
            if let Some(on_complete) = on_complete {
                on_complete(aggregate);
            }
        })));
        run_id
    }
}
