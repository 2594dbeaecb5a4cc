//! Fluent, typed declaration of cohort pipelines.
//!
//! A [`Query`] collects stages against a typed input collection and hands the
//! frozen stage list to the [`pipeline`] engine when a terminal operation is
//! called. Work verbs return a [`Step`], which can still adjust the stage it
//! just pushed:
//!
//! ```no_run
//! # async fn demo() -> Result<(), pipeline::PipelineError> {
//! use std::time::Duration;
//!
//! let squares = query::query([1_u64, 2, 4, 8, 16])
//!     .select(|n| async move { n * n })
//!     .timeout(Duration::from_millis(30))
//!     .filter(|n| {
//!         let keep = *n > 1;
//!         async move { keep }
//!     })
//!     .when(|n| *n < 100)
//!     .wait()
//!     .run()
//!     .await?;
//! # let _ = squares;
//! # Ok(())
//! # }
//! ```
//!
//! | Verb | Stage | Step mode |
//! |------|-------|-----------|
//! | `select` / `try_select` | Map | [`Mapping`] |
//! | `filter` | Filter | [`Preserving`] |
//! | `for_each` | Effect | [`Preserving`] |
//! | `select_many` | FlatMap | [`Mapping`] |
//! | `wait` | Wait | none |
//!
//! `when` is only offered on [`Preserving`] steps: a bypassed map would hand
//! the next stage an item of the wrong type.

use std::any::type_name;
use std::future::Future;
use std::marker::PhantomData;
use std::time::Duration;

use tracing::debug;

use pipeline::{
    BoxError, EngineConfig, GateConfig, Item, Pipeline, PipelineError, RunId, Stage,
};

/// Starts a query over `items`.
pub fn query<T: Send + 'static>(items: impl IntoIterator<Item = T>) -> Query<T> {
    Query::new(items)
}

// ---------------------------------------------------------------------------
// Query
// ---------------------------------------------------------------------------

/// A pipeline under construction whose items are currently of type `T`.
pub struct Query<T> {
    items: Vec<Item>,
    stages: Vec<Stage>,
    config: EngineConfig,
    _items: PhantomData<fn() -> T>,
}

impl<T> std::fmt::Debug for Query<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("items", &self.items.len())
            .field("stages", &self.stages)
            .field("config", &self.config)
            .finish()
    }
}

impl<T: Send + 'static> Query<T> {
    /// Starts a query over `items`.
    pub fn new(items: impl IntoIterator<Item = T>) -> Self {
        Self::from_erased(items.into_iter().map(|item| Box::new(item) as Item).collect())
    }
}

impl<T: 'static> Query<T> {
    /// Starts a query over items that are already erased. Each stage checks
    /// the type on entry, and terminal operations check it again on output.
    pub fn from_erased(items: Vec<Item>) -> Self {
        Self {
            items,
            stages: Vec::new(),
            config: EngineConfig::default(),
            _items: PhantomData,
        }
    }

    /// Replaces the engine configuration.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Number of stages declared so far.
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Map: replaces each item with the value the callback resolves to.
    pub fn select<R, F, Fut>(self, f: F) -> Step<R, Mapping>
    where
        T: Send,
        R: Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
    {
        Step::new(self.push(Stage::select(f)))
    }

    /// Fallible map: an `Err` drops the item.
    pub fn try_select<R, E, F, Fut>(self, f: F) -> Step<R, Mapping>
    where
        T: Send,
        R: Send + 'static,
        E: Into<BoxError>,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
    {
        Step::new(self.push(Stage::try_select(f)))
    }

    /// Filter: items for which the callback resolves to `false` are dropped.
    pub fn filter<F, Fut>(self, f: F) -> Step<T, Preserving>
    where
        T: Send,
        F: Fn(&T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        Step::new(self.push(Stage::filter(f)))
    }

    /// Effect: runs the callback for each item and passes the item on.
    pub fn for_each<F, Fut>(self, f: F) -> Step<T, Preserving>
    where
        T: Send,
        F: Fn(&T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Step::new(self.push(Stage::for_each(f)))
    }

    /// Flat-map: each produced item continues through the remaining stages.
    pub fn select_many<R, I, F, Fut>(self, f: F) -> Step<R, Mapping>
    where
        T: Send,
        R: Send + 'static,
        I: IntoIterator<Item = R>,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = I> + Send + 'static,
    {
        Step::new(self.push(Stage::select_many(f)))
    }

    /// Barrier: no item passes until every surviving item has reached it.
    pub fn wait(self) -> Query<T> {
        self.push(Stage::barrier())
    }

    /// Freezes the declaration.
    pub fn into_parts(self) -> (Pipeline, Vec<Item>) {
        let pipeline = Pipeline::new(self.stages).with_config(self.config);
        (pipeline, self.items)
    }

    /// Runs the query and resolves with the surviving items in input order.
    pub async fn run(self) -> Result<Vec<T>, PipelineError> {
        let (pipeline, items) = self.into_parts();
        debug!(stages = pipeline.stages().len(), items = items.len(), "running query");
        let aggregate = pipeline.run(items).await?;
        collect(aggregate)
    }

    /// Starts the query and calls `on_complete` once with the result.
    pub fn run_with<F>(self, on_complete: F) -> RunId
    where
        F: FnOnce(Result<Vec<T>, PipelineError>) + Send + 'static,
    {
        let (pipeline, items) = self.into_parts();
        pipeline.start(items, move |aggregate| on_complete(collect(aggregate)))
    }

    /// Starts the query without waiting for or observing its result.
    pub fn spawn(self) -> RunId {
        let (pipeline, items) = self.into_parts();
        pipeline.spawn(items)
    }

    fn push<U>(mut self, stage: Stage) -> Query<U> {
        self.stages.push(stage);
        Query {
            items: self.items,
            stages: self.stages,
            config: self.config,
            _items: PhantomData,
        }
    }

    fn last_mut(&mut self) -> Option<&mut Stage> {
        self.stages.last_mut()
    }
}

fn collect<T: 'static>(aggregate: Vec<Item>) -> Result<Vec<T>, PipelineError> {
    aggregate
        .into_iter()
        .map(|item| {
            item.downcast::<T>()
                .map(|item| *item)
                .map_err(|_| PipelineError::OutputType {
                    expected: type_name::<T>().to_string(),
                })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// Step mode of a stage that may change the item type (map, flat-map).
#[derive(Debug, Clone, Copy)]
pub enum Mapping {}

/// Step mode of a stage that passes its item on unchanged (filter, effect).
#[derive(Debug, Clone, Copy)]
pub enum Preserving {}

/// A query whose last stage can still be adjusted.
pub struct Step<T, M> {
    query: Query<T>,
    _mode: PhantomData<M>,
}

impl<T, M> std::fmt::Debug for Step<T, M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Step").field("query", &self.query).finish()
    }
}

impl<T: 'static, M> Step<T, M> {
    fn new(query: Query<T>) -> Self {
        Self {
            query,
            _mode: PhantomData,
        }
    }

    /// Discards the result of any invocation of this stage that takes longer
    /// than `deadline`; the item is dropped. The callback itself keeps running.
    pub fn timeout(mut self, deadline: Duration) -> Self {
        if let Some(stage) = self.query.last_mut() {
            stage.set_deadline(deadline);
        }
        self
    }

    /// Admits at most `slots` invocations of this stage per `window`.
    pub fn gate(mut self, slots: u32, window: Duration) -> Self {
        if let Some(stage) = self.query.last_mut() {
            stage.set_gate(GateConfig::new(slots, window));
        }
        self
    }

    /// Ends adjustment of this step.
    pub fn done(self) -> Query<T> {
        self.query
    }
}

impl<T: Send + 'static> Step<T, Preserving> {
    /// Runs this stage only for items matching `predicate`; the others pass
    /// through untouched, without waiting on the gate or the deadline.
    pub fn when<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&T) -> bool + Send + Sync + 'static,
    {
        if let Some(stage) = self.query.last_mut() {
            stage.add_condition(predicate);
        }
        self
    }
}

impl<T, M> From<Step<T, M>> for Query<T> {
    fn from(step: Step<T, M>) -> Self {
        step.query
    }
}

impl<T: Send + 'static, M> Step<T, M> {
    /// See [`Query::select`].
    pub fn select<R, F, Fut>(self, f: F) -> Step<R, Mapping>
    where
        R: Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
    {
        self.query.select(f)
    }

    /// See [`Query::try_select`].
    pub fn try_select<R, E, F, Fut>(self, f: F) -> Step<R, Mapping>
    where
        R: Send + 'static,
        E: Into<BoxError>,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
    {
        self.query.try_select(f)
    }

    /// See [`Query::filter`].
    pub fn filter<F, Fut>(self, f: F) -> Step<T, Preserving>
    where
        F: Fn(&T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        self.query.filter(f)
    }

    /// See [`Query::for_each`].
    pub fn for_each<F, Fut>(self, f: F) -> Step<T, Preserving>
    where
        F: Fn(&T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.query.for_each(f)
    }

    /// See [`Query::select_many`].
    pub fn select_many<R, I, F, Fut>(self, f: F) -> Step<R, Mapping>
    where
        R: Send + 'static,
        I: IntoIterator<Item = R>,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = I> + Send + 'static,
    {
        self.query.select_many(f)
    }

    /// See [`Query::wait`].
    pub fn wait(self) -> Query<T> {
        self.query.wait()
    }

    /// See [`Query::run`].
    pub async fn run(self) -> Result<Vec<T>, PipelineError> {
        self.query.run().await
    }

    /// See [`Query::run_with`].
    pub fn run_with<F>(self, on_complete: F) -> RunId
    where
        F: FnOnce(Result<Vec<T>, PipelineError>) + Send + 'static,
    {
        self.query.run_with(on_complete)
    }

    /// See [`Query::spawn`].
    pub fn spawn(self) -> RunId {
        self.query.spawn()
    }
}

#[cfg(test)]
mod tests {
    use pipeline::{BarrierMode, StageKind};

    use super::*;

    #[test]
    fn verbs_push_stages_in_order() {
        let (pipeline, items) = query([1_u32, 2, 3])
            .select(|n| async move { n.to_string() })
            .filter(|s| {
                let keep = !s.is_empty();
                async move { keep }
            })
            .wait()
            .for_each(|_| async {})
            .select_many(|s: String| async move { s.into_bytes() })
            .done()
            .into_parts();

        let kinds: Vec<StageKind> = pipeline.stages().iter().map(Stage::kind).collect();
        assert_eq!(
            kinds,
            vec![
                StageKind::Map,
                StageKind::Filter,
                StageKind::Wait,
                StageKind::Effect,
                StageKind::FlatMap,
            ]
        );
        assert_eq!(items.len(), 3);
    }

    #[test]
    fn step_modifiers_apply_to_the_last_stage_only() {
        let (pipeline, _) = query([1_u32])
            .select(|n| async move { n })
            .filter(|_| async { true })
            .timeout(Duration::from_millis(30))
            .gate(3, Duration::from_millis(25))
            .done()
            .into_parts();

        assert_eq!(pipeline.stages()[0].deadline(), None);
        assert_eq!(pipeline.stages()[0].gate(), None);
        assert_eq!(pipeline.stages()[1].deadline(), Some(Duration::from_millis(30)));
        assert_eq!(
            pipeline.stages()[1].gate(),
            Some(GateConfig::new(3, Duration::from_millis(25)))
        );
    }

    #[test]
    fn config_reaches_the_pipeline() {
        let config = EngineConfig {
            barrier: BarrierMode::Counting,
        };
        let (pipeline, _) = query([1_u8]).with_config(config).wait().into_parts();
        assert_eq!(*pipeline.config(), config);
        assert_eq!(pipeline.stages().len(), 1);
    }

    #[test]
    fn collect_reports_the_expected_type() {
        let err = collect::<u64>(vec![Box::new("nope") as Item]).unwrap_err();
        match err {
            PipelineError::OutputType { expected } => assert_eq!(expected, "u64"),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
