//! Stages: the units of work a section runs against its item.
//!
//! Every work stage (map, filter, effect, flat-map) is stored in erased form:
//! a [`StageFn`] that takes the section's [`Item`] and returns a future
//! resolving to an [`Outcome`]. The typed constructors ([`Stage::select`],
//! [`Stage::filter`], ...) do the downcasting, so callers never handle
//! [`Item`] directly.
//!
//! ## Execution
//!
//! ```text
//! section.advance()
//!   └─ spawn ─ Stage::execute
//!        ├─ barrier stage ........ section -> Wait
//!        ├─ a predicate is false . section.advance()      (bypass, no gate, no deadline)
//!        └─ gate? ─ Gator::schedule ─ spawn ─┐
//!                                            ├─ settle: race(callback task, deadline)
//!                  (ungated) ────────────────┘     └─ section.commit / fail / time_out
//! ```
//!
//! The callback's future is polled once inline; if it suspends it moves to a
//! task of its own and is never aborted. When the deadline wins the race the
//! task is detached: its side effects still happen, its result is dropped.

use std::any::{type_name, Any};
use std::future::{poll_fn, Future};
use std::ops::Index;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::Poll;
use std::time::Duration;

use tracing::trace;

use crate::errors::{BoxError, StageError};
use crate::{GateConfig, Gator, Section, State};

/// Erased element flowing through a pipeline.
pub type Item = Box<dyn Any + Send>;

/// Future returned by an erased stage callback.
pub type StageFuture = Pin<Box<dyn Future<Output = Result<Outcome, StageError>> + Send>>;

/// Erased stage callback. The synchronous part runs on the dispatching task;
/// the returned future runs in a task of its own.
pub type StageFn = Arc<dyn Fn(Item) -> Result<StageFuture, StageError> + Send + Sync>;

/// Erased skip-predicate. `Ok(false)` bypasses the stage.
pub type Condition = Arc<dyn Fn(&Item) -> Result<bool, StageError> + Send + Sync>;

/// What a completed stage callback asks the section to do next.
pub enum Outcome {
    /// Continue with this item (replaced by a map, unchanged otherwise).
    Continue(Item),
    /// Exclude the item from the aggregate.
    Exclude,
    /// Continue the remaining stages over each of these items, in order.
    Expand(Vec<Item>),
}

impl std::fmt::Debug for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Continue(_) => f.write_str("Continue(..)"),
            Outcome::Exclude => f.write_str("Exclude"),
            Outcome::Expand(items) => write!(f, "Expand({} items)", items.len()),
        }
    }
}

// ---------------------------------------------------------------------------
// Stage kinds
// ---------------------------------------------------------------------------

/// The five stage variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    /// Replace the item with the callback's output.
    Map,
    /// Keep or exclude the item.
    Filter,
    /// Observe the item without changing it.
    Effect,
    /// Expand the item into zero or more items that continue the pipeline.
    FlatMap,
    /// Barrier: wait until every sibling has arrived or terminated.
    Wait,
}

impl StageKind {
    /// Verb used in logs and error messages.
    pub fn verb(self) -> &'static str {
        match self {
            StageKind::Map => "select",
            StageKind::Filter => "filter",
            StageKind::Effect => "for_each",
            StageKind::FlatMap => "select_many",
            StageKind::Wait => "wait",
        }
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.verb())
    }
}

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

/// One declared operation in a pipeline.
pub struct Stage {
    kind: StageKind,
    work: Option<StageFn>,
    deadline: Option<Duration>,
    gate: Option<GateConfig>,
    conditions: Vec<Condition>,
    gator: OnceLock<Arc<Gator>>,
}

impl std::fmt::Debug for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage")
            .field("kind", &self.kind)
            .field("deadline", &self.deadline)
            .field("gate", &self.gate)
            .field("conditions", &self.conditions.len())
            .finish()
    }
}

impl Stage {
    /// Creates a work stage from an erased callback.
    pub fn from_fn(kind: StageKind, work: StageFn) -> Self {
        Self {
            kind,
            work: (kind != StageKind::Wait).then_some(work),
            deadline: None,
            gate: None,
            conditions: Vec::new(),
            gator: OnceLock::new(),
        }
    }

    /// Map stage: replaces each `T` with the `R` the callback resolves to.
    pub fn select<T, R, F, Fut>(f: F) -> Self
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
    {
        let kind = StageKind::Map;
        Self::from_fn(
            kind,
            Arc::new(move |item: Item| -> Result<StageFuture, StageError> {
                let fut = f(downcast::<T>(item, kind)?);
                Ok(boxed(async move { Ok(Outcome::Continue(Box::new(fut.await) as Item)) }))
            }),
        )
    }

    /// Fallible map stage: an `Err` moves the section to [`State::Error`].
    pub fn try_select<T, R, E, F, Fut>(f: F) -> Self
    where
        T: Send + 'static,
        R: Send + 'static,
        E: Into<BoxError>,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
    {
        let kind = StageKind::Map;
        Self::from_fn(
            kind,
            Arc::new(move |item: Item| -> Result<StageFuture, StageError> {
                let fut = f(downcast::<T>(item, kind)?);
                Ok(boxed(async move {
                    match fut.await {
                        Ok(output) => Ok(Outcome::Continue(Box::new(output) as Item)),
                        Err(e) => Err(StageError::Callback {
                            stage: kind.verb(),
                            source: e.into(),
                        }),
                    }
                }))
            }),
        )
    }

    /// Filter stage: `false` excludes the item.
    pub fn filter<T, F, Fut>(f: F) -> Self
    where
        T: Send + 'static,
        F: Fn(&T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let kind = StageKind::Filter;
        Self::from_fn(
            kind,
            Arc::new(move |item: Item| -> Result<StageFuture, StageError> {
                let fut = f(downcast_ref::<T>(&item, kind)?);
                Ok(boxed(async move {
                    Ok(if fut.await {
                        Outcome::Continue(item)
                    } else {
                        Outcome::Exclude
                    })
                }))
            }),
        )
    }

    /// Effect stage: runs the callback, never changes the item.
    pub fn for_each<T, F, Fut>(f: F) -> Self
    where
        T: Send + 'static,
        F: Fn(&T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let kind = StageKind::Effect;
        Self::from_fn(
            kind,
            Arc::new(move |item: Item| -> Result<StageFuture, StageError> {
                let fut = f(downcast_ref::<T>(&item, kind)?);
                Ok(boxed(async move {
                    fut.await;
                    Ok(Outcome::Continue(item))
                }))
            }),
        )
    }

    /// Flat-map stage: the produced items continue the remaining stages in a
    /// nested cohort and are flattened into the aggregate in production order.
    /// An empty expansion excludes the item.
    pub fn select_many<T, R, I, F, Fut>(f: F) -> Self
    where
        T: Send + 'static,
        R: Send + 'static,
        I: IntoIterator<Item = R>,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = I> + Send + 'static,
    {
        let kind = StageKind::FlatMap;
        Self::from_fn(
            kind,
            Arc::new(move |item: Item| -> Result<StageFuture, StageError> {
                let fut = f(downcast::<T>(item, kind)?);
                Ok(boxed(async move {
                    let items: Vec<Item> = fut
                        .await
                        .into_iter()
                        .map(|r| Box::new(r) as Item)
                        .collect();
                    Ok(Outcome::Expand(items))
                }))
            }),
        )
    }

    /// Barrier stage.
    pub fn barrier() -> Self {
        Self {
            kind: StageKind::Wait,
            work: None,
            deadline: None,
            gate: None,
            conditions: Vec::new(),
            gator: OnceLock::new(),
        }
    }

    /// Sets the per-invocation deadline.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.set_deadline(deadline);
        self
    }

    /// Wraps dispatch in a gate.
    pub fn with_gate(mut self, gate: GateConfig) -> Self {
        self.set_gate(gate);
        self
    }

    /// Adds a skip-predicate over items of type `T`.
    pub fn with_condition<T, P>(mut self, predicate: P) -> Self
    where
        T: Send + 'static,
        P: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.add_condition(predicate);
        self
    }

    /// Sets the per-invocation deadline. Ignored for barrier stages.
    ///
    /// The callback's future is polled once before the race starts, so a
    /// callback that completes without suspending is never timed out, even
    /// with [`Duration::ZERO`].
    pub fn set_deadline(&mut self, deadline: Duration) {
        if self.kind != StageKind::Wait {
            self.deadline = Some(deadline);
        }
    }

    /// Sets the gate. Ignored for barrier stages.
    pub fn set_gate(&mut self, gate: GateConfig) {
        if self.kind != StageKind::Wait {
            self.gate = Some(gate);
        }
    }

    /// Adds a skip-predicate. When any predicate returns `false` the stage is
    /// bypassed: the item moves on unchanged without consuming a gate slot.
    /// Ignored for barrier stages.
    pub fn add_condition<T, P>(&mut self, predicate: P)
    where
        T: Send + 'static,
        P: Fn(&T) -> bool + Send + Sync + 'static,
    {
        if self.kind == StageKind::Wait {
            return;
        }
        let kind = self.kind;
        self.conditions
            .push(Arc::new(move |item: &Item| -> Result<bool, StageError> {
                Ok(predicate(downcast_ref::<T>(item, kind)?))
            }));
    }

    /// Returns the stage variant.
    pub fn kind(&self) -> StageKind {
        self.kind
    }

    /// Returns the per-invocation deadline, if any.
    pub fn deadline(&self) -> Option<Duration> {
        self.deadline
    }

    /// Returns the gate configuration, if any.
    pub fn gate(&self) -> Option<GateConfig> {
        self.gate
    }

    /// The stage's scheduler, created on first use.
    fn gator(&self) -> Option<&Arc<Gator>> {
        let gate = self.gate?;
        Some(self.gator.get_or_init(|| Gator::new(gate)))
    }

    /// `Ok(true)` if any predicate rejects the item.
    fn bypassed(&self, item: &Item) -> Result<bool, StageError> {
        for condition in &self.conditions {
            if !guarded(self.kind, || condition(item))? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Runs this stage against `section`. Called from the task spawned by
    /// [`Section::advance`].
    pub(crate) async fn execute(self: Arc<Self>, section: Arc<Section>) {
        let Some(work) = self.work.clone() else {
            section.set_state(State::Wait);
            return;
        };
        let Some(item) = section.take_item() else {
            section.fail(StageError::MissingItem {
                stage: self.kind.verb(),
            });
            return;
        };

        match self.bypassed(&item) {
            Ok(false) => {}
            Ok(true) => {
                trace!(section = section.position(), stage = %self.kind, "stage bypassed");
                section.restore(item);
                section.advance();
                return;
            }
            Err(e) => {
                section.fail(e);
                return;
            }
        }

        let gator = self.gator().cloned();
        match gator {
            None => self.settle(work, item, &section).await,
            Some(gator) => gator.schedule(move |ready| {
                tokio::spawn(async move {
                    self.settle(work, item, &section).await;
                    ready.release();
                });
            }),
        }
    }

    /// Races the callback against the deadline and applies whichever wins.
    async fn settle(&self, work: StageFn, item: Item, section: &Arc<Section>) {
        let mut fut = match guarded(self.kind, || work(item)) {
            Ok(fut) => fut,
            Err(e) => {
                section.fail(e);
                return;
            }
        };

        // A callback that resolves on its first poll beats any deadline,
        // including a zero one.
        let first = poll_fn(|cx| Poll::Ready(guarded(self.kind, || Ok(fut.as_mut().poll(cx))))).await;
        match first {
            Err(e) => {
                section.fail(e);
                return;
            }
            Ok(Poll::Ready(Ok(outcome))) => {
                section.commit(outcome);
                return;
            }
            Ok(Poll::Ready(Err(e))) => {
                section.fail(e);
                return;
            }
            Ok(Poll::Pending) => {}
        }

        let mut task = tokio::spawn(fut);
        let joined = match self.deadline {
            None => Some(task.await),
            Some(deadline) => tokio::select! {
                biased;
                joined = &mut task => Some(joined),
                () = tokio::time::sleep(deadline) => None,
            },
        };

        match joined {
            // Dropping the handle detaches the task; it runs to completion
            // and its output is discarded.
            None => section.time_out(self.kind, self.deadline.unwrap_or_default()),
            Some(Err(join_error)) => section.fail(StageError::from_join(self.kind.verb(), join_error)),
            Some(Ok(Err(e))) => section.fail(e),
            Some(Ok(Ok(outcome))) => section.commit(outcome),
        }
    }
}

// ---------------------------------------------------------------------------
// Stage list
// ---------------------------------------------------------------------------

/// Ordered, immutable list of stages, shared by every section of a cohort and
/// by every cohort nested under it.
#[derive(Debug, Clone)]
pub struct StageList(Arc<[Arc<Stage>]>);

impl StageList {
    /// Freezes `stages` into a shareable list.
    pub fn new(stages: Vec<Stage>) -> Self {
        Self(stages.into_iter().map(Arc::new).collect())
    }

    /// Number of stages.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if the list has no stages.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns a shared handle to the stage at `index`.
    pub fn get(&self, index: usize) -> Option<Arc<Stage>> {
        self.0.get(index).cloned()
    }

    /// Iterates the stages in order.
    pub fn iter(&self) -> impl Iterator<Item = &Stage> {
        self.0.iter().map(|s| s.as_ref())
    }
}

impl From<Vec<Stage>> for StageList {
    fn from(stages: Vec<Stage>) -> Self {
        Self::new(stages)
    }
}

impl Index<usize> for StageList {
    type Output = Stage;

    fn index(&self, index: usize) -> &Stage {
        &self.0[index]
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn boxed<Fut>(fut: Fut) -> StageFuture
where
    Fut: Future<Output = Result<Outcome, StageError>> + Send + 'static,
{
    Box::pin(fut)
}

fn downcast<T: 'static>(item: Item, kind: StageKind) -> Result<T, StageError> {
    item.downcast::<T>()
        .map(|boxed| *boxed)
        .map_err(|_| StageError::TypeMismatch {
            stage: kind.verb(),
            expected: type_name::<T>(),
        })
}

fn downcast_ref<T: 'static>(item: &Item, kind: StageKind) -> Result<&T, StageError> {
    item.downcast_ref::<T>()
        .ok_or_else(|| StageError::TypeMismatch {
            stage: kind.verb(),
            expected: type_name::<T>(),
        })
}

/// Runs synchronous user code, converting a panic into [`StageError::Panicked`].
fn guarded<R>(
    kind: StageKind,
    f: impl FnOnce() -> Result<R, StageError>,
) -> Result<R, StageError> {
    catch_unwind(AssertUnwindSafe(f))
        .unwrap_or_else(|payload| Err(StageError::from_panic(kind.verb(), &*payload)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_sync(stage: &Stage, item: Item) -> Result<StageFuture, StageError> {
        let work = stage.work.clone().expect("work stage");
        guarded(stage.kind, || work(item))
    }

    #[tokio::test]
    async fn select_replaces_item() {
        let stage = Stage::select(|n: u32| async move { n.to_string() });
        let outcome = run_sync(&stage, Box::new(7_u32)).unwrap().await.unwrap();
        match outcome {
            Outcome::Continue(item) => assert_eq!(*item.downcast::<String>().unwrap(), "7"),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn filter_excludes_on_false() {
        let stage = Stage::filter(|n: &u32| {
            let odd = n % 2 == 1;
            async move { odd }
        });
        let kept = run_sync(&stage, Box::new(3_u32)).unwrap().await.unwrap();
        assert!(matches!(kept, Outcome::Continue(_)));
        let dropped = run_sync(&stage, Box::new(4_u32)).unwrap().await.unwrap();
        assert!(matches!(dropped, Outcome::Exclude));
    }

    #[tokio::test]
    async fn select_many_collects_in_order() {
        let stage = Stage::select_many(|n: u32| async move { vec![n, n * n, n * n * n] });
        let outcome = run_sync(&stage, Box::new(3_u32)).unwrap().await.unwrap();
        let Outcome::Expand(items) = outcome else {
            panic!("expected expansion");
        };
        let values: Vec<u32> = items.into_iter().map(|i| *i.downcast::<u32>().unwrap()).collect();
        assert_eq!(values, vec![3, 9, 27]);
    }

    #[tokio::test]
    async fn try_select_error_becomes_callback_error() {
        let stage = Stage::try_select(|n: u32| async move {
            if n == 0 {
                Err("zero")
            } else {
                Ok(10 / n)
            }
        });
        let err = run_sync(&stage, Box::new(0_u32)).unwrap().await.unwrap_err();
        assert!(matches!(err, StageError::Callback { stage: "select", .. }));
    }

    #[test]
    fn wrong_item_type_is_a_mismatch() {
        let stage = Stage::select(|n: u32| async move { n });
        let err = run_sync(&stage, Box::new("text")).err().unwrap();
        assert!(matches!(err, StageError::TypeMismatch { stage: "select", .. }));
    }

    #[test]
    fn synchronous_panic_is_caught() {
        let stage = Stage::select(|n: u32| {
            if n > 1 {
                panic!("too big");
            }
            async move { n }
        });
        let err = run_sync(&stage, Box::new(5_u32)).err().unwrap();
        assert!(matches!(err, StageError::Panicked { message, .. } if message == "too big"));
    }

    #[test]
    fn conditions_bypass_on_false() {
        let stage = Stage::for_each(|_: &u32| async {})
            .with_condition(|n: &u32| *n > 1)
            .with_condition(|n: &u32| *n < 10);
        assert!(!stage.bypassed(&(Box::new(5_u32) as Item)).unwrap());
        assert!(stage.bypassed(&(Box::new(1_u32) as Item)).unwrap());
        assert!(stage.bypassed(&(Box::new(12_u32) as Item)).unwrap());
    }

    #[test]
    fn barrier_ignores_modifiers() {
        let stage = Stage::barrier()
            .with_deadline(Duration::from_millis(5))
            .with_gate(GateConfig::new(1, Duration::from_millis(5)));
        assert_eq!(stage.kind(), StageKind::Wait);
        assert_eq!(stage.deadline(), None);
        assert_eq!(stage.gate(), None);
    }

    #[test]
    fn gator_is_created_once_per_stage() {
        let stage = Stage::select(|n: u32| async move { n })
            .with_gate(GateConfig::new(2, Duration::from_millis(10)));
        let first = Arc::clone(stage.gator().unwrap());
        let second = Arc::clone(stage.gator().unwrap());
        assert!(Arc::ptr_eq(&first, &second));
        assert!(Stage::select(|n: u32| async move { n }).gator().is_none());
    }
}
