//! Error types for the cohort engine.
//!
//! [`StageError`] describes why one item left the pipeline early. It is never
//! returned to the caller: the section that hit it moves to
//! [`crate::State::Error`], the error is logged, and every sibling item keeps
//! going. The only observable effect is the item's absence from the aggregate.
//!
//! [`PipelineError`] covers the few run-level conditions a caller can see.

use std::any::Any;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::RunId;

/// Boxed error returned by fallible stage callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

// ---------------------------------------------------------------------------
// Per-item errors
// ---------------------------------------------------------------------------

/// Why a single stage invocation failed.
///
/// `stage` is the verb of the failing stage (`"select"`, `"filter"`, ...).
#[derive(Debug, Error)]
pub enum StageError {
    /// The user callback returned an error.
    #[error("{stage} callback failed: {source}")]
    Callback {
        /// Verb of the failing stage.
        stage: &'static str,
        /// Error returned by the callback.
        #[source]
        source: BoxError,
    },

    /// The user callback or a skip-predicate panicked.
    #[error("{stage} callback panicked: {message}")]
    Panicked {
        /// Verb of the failing stage.
        stage: &'static str,
        /// Panic payload, if it was a string.
        message: String,
    },

    /// The item reaching the stage was not of the type the stage was built for.
    #[error("{stage} expected an item of type {expected}")]
    TypeMismatch {
        /// Verb of the failing stage.
        stage: &'static str,
        /// Type name the stage downcasts to.
        expected: &'static str,
    },

    /// The section had no item to hand to the stage.
    #[error("{stage} found no item to operate on")]
    MissingItem {
        /// Verb of the failing stage.
        stage: &'static str,
    },

    /// The task running the callback was cancelled by runtime shutdown.
    #[error("{stage} callback was cancelled before completing")]
    Cancelled {
        /// Verb of the failing stage.
        stage: &'static str,
    },
}

impl StageError {
    /// Builds a [`StageError::Panicked`] from a caught panic payload.
    pub fn from_panic(stage: &'static str, payload: &(dyn Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        StageError::Panicked { stage, message }
    }

    /// Builds a [`StageError`] from a failed join of a spawned callback task.
    pub fn from_join(stage: &'static str, error: tokio::task::JoinError) -> Self {
        if error.is_panic() {
            Self::from_panic(stage, &*error.into_panic())
        } else {
            StageError::Cancelled { stage }
        }
    }
}

// ---------------------------------------------------------------------------
// Run-level errors
// ---------------------------------------------------------------------------

/// Errors visible to the caller of a pipeline run.
#[derive(Debug, Error, Serialize, Deserialize)]
pub enum PipelineError {
    /// The run was dropped before its cohort finished, e.g. because the
    /// runtime shut down while stages were still pending.
    #[error("Run {run_id} was abandoned before completion")]
    Abandoned {
        /// The run that never completed.
        run_id: RunId,
    },

    /// An aggregate item could not be converted back to the requested type.
    #[error("Aggregate item is not of the expected type {expected}")]
    OutputType {
        /// Type name the caller asked for.
        expected: String,
    },

    /// The engine or run configuration is invalid.
    #[error("Configuration error: {message}")]
    ConfigurationError {
        /// Description of the configuration problem.
        message: String,
    },
}
