//! Per-item state machine.
//!
//! A [`Section`] owns one item's progress through the shared stage list. It
//! is created by its [`Cohort`], mutated only by its own stage executions and
//! by the cohort's barrier release, and reports every state change to the
//! cohort through a non-owning back-reference.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tracing::{debug, trace, warn, Instrument, Span};

use crate::errors::StageError;
use crate::stage::{Item, Outcome, StageKind, StageList};
use crate::{Cohort, State};

/// Where a section's item currently lives.
enum Slot {
    /// Taken by a running stage, or dropped after a terminal failure.
    Empty,
    /// Owned by the section.
    Value(Item),
    /// Expanded by a flat-map; the nested cohort is still resolving. This is
    /// the only strong reference keeping the nested cohort alive.
    Nested(Arc<Cohort>),
    /// Aggregate of a resolved flat-map expansion, in production order.
    Expanded(Vec<Item>),
}

struct SectionInner {
    slot: Slot,
    cursor: usize,
    state: State,
}

/// The state machine tracking one item's progress through the stage list.
pub struct Section {
    position: usize,
    stages: StageList,
    owner: Weak<Cohort>,
    span: Span,
    inner: Mutex<SectionInner>,
}

impl std::fmt::Debug for Section {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        let mut debug = f.debug_struct("Section");
        debug
            .field("position", &self.position)
            .field("cursor", &inner.cursor)
            .field("state", &inner.state);
        if let Slot::Nested(nested) = &inner.slot {
            debug.field("expanding_into", &nested.id());
        }
        debug.finish()
    }
}

impl Section {
    pub(crate) fn new(
        position: usize,
        item: Item,
        stages: StageList,
        owner: Weak<Cohort>,
        span: Span,
        start: usize,
    ) -> Self {
        Self {
            position,
            stages,
            owner,
            span,
            inner: Mutex::new(SectionInner {
                slot: Slot::Value(item),
                cursor: start,
                state: State::Running,
            }),
        }
    }

    /// Position of this section's item in its cohort's input.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Current state.
    pub fn state(&self) -> State {
        self.lock().state
    }

    /// Index of the next stage to dispatch.
    pub fn cursor(&self) -> usize {
        self.lock().cursor
    }

    /// Moves the section one stage forward.
    ///
    /// Resumes a waiting section, finishes it when the stage list is
    /// exhausted, and otherwise dispatches the next stage on a new task. A
    /// terminal section ignores the call, so a late callback racing a
    /// deadline cannot restart it.
    pub fn advance(self: &Arc<Self>) {
        let (resumed, next) = {
            let mut inner = self.lock();
            if inner.state.is_terminal() {
                return;
            }
            let resumed = inner.state == State::Wait;
            if resumed {
                inner.state = State::Running;
            }
            let next = self.stages.get(inner.cursor);
            if next.is_some() {
                inner.cursor += 1;
            }
            (resumed, next)
        };

        if resumed {
            if let Some(owner) = self.owner.upgrade() {
                owner.record(State::Wait, State::Running);
            }
        }

        match next {
            None => self.set_state(State::Finished),
            Some(stage) => {
                let section = Arc::clone(self);
                tokio::spawn(stage.execute(section).instrument(self.span.clone()));
            }
        }
    }

    /// The single mutation point for [`State`]. Transitions out of a terminal
    /// state are ignored. Every accepted transition is reported to the owning
    /// cohort after the field is updated.
    pub(crate) fn set_state(self: &Arc<Self>, state: State) {
        let previous = {
            let mut inner = self.lock();
            if inner.state.is_terminal() {
                trace!(
                    section = self.position,
                    current = %inner.state,
                    ignored = %state,
                    "transition out of terminal state ignored"
                );
                return;
            }
            if !state.contributes() && state.is_terminal() {
                inner.slot = Slot::Empty;
            }
            std::mem::replace(&mut inner.state, state)
        };

        debug!(section = self.position, from = %previous, to = %state, "section state changed");
        if let Some(owner) = self.owner.upgrade() {
            owner.on_state_change(previous, state);
        }
    }

    pub(crate) fn take_item(&self) -> Option<Item> {
        let mut inner = self.lock();
        match std::mem::replace(&mut inner.slot, Slot::Empty) {
            Slot::Value(item) => Some(item),
            other => {
                inner.slot = other;
                None
            }
        }
    }

    pub(crate) fn restore(&self, item: Item) {
        self.lock().slot = Slot::Value(item);
    }

    /// Applies a completed stage callback's outcome.
    pub(crate) fn commit(self: &Arc<Self>, outcome: Outcome) {
        match outcome {
            Outcome::Continue(item) => {
                {
                    let mut inner = self.lock();
                    if inner.state.is_terminal() {
                        return;
                    }
                    inner.slot = Slot::Value(item);
                }
                self.advance();
            }
            Outcome::Exclude => self.set_state(State::Skip),
            Outcome::Expand(items) if items.is_empty() => self.set_state(State::Skip),
            Outcome::Expand(items) => {
                if let Some(owner) = self.owner.upgrade() {
                    owner.expand(self, items);
                }
            }
        }
    }

    pub(crate) fn fail(self: &Arc<Self>, error: StageError) {
        warn!(section = self.position, error = %error, "stage failed; item dropped");
        self.set_state(State::Error);
    }

    pub(crate) fn time_out(self: &Arc<Self>, kind: StageKind, deadline: Duration) {
        debug!(
            section = self.position,
            stage = %kind,
            deadline_ms = u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX),
            "stage deadline elapsed; result will be discarded"
        );
        self.set_state(State::Timeout);
    }

    /// Hands the section's item over to a nested cohort. Must be called
    /// before the nested cohort starts, since it may finish synchronously.
    pub(crate) fn attach_expansion(&self, nested: Arc<Cohort>) {
        self.lock().slot = Slot::Nested(nested);
    }

    /// Stores a nested cohort's aggregate and finishes the section.
    pub(crate) fn complete_expansion(self: &Arc<Self>, items: Vec<Item>) {
        {
            let mut inner = self.lock();
            if inner.state.is_terminal() {
                return;
            }
            inner.slot = Slot::Expanded(items);
        }
        self.set_state(State::Finished);
    }

    /// Moves this section's contribution into `out`: its item if it
    /// finished, the flattened expansion if it was expanded, nothing for any
    /// other state.
    pub(crate) fn drain_into(&self, out: &mut Vec<Item>) {
        let slot = {
            let mut inner = self.lock();
            if !inner.state.contributes() {
                return;
            }
            std::mem::replace(&mut inner.slot, Slot::Empty)
        };
        match slot {
            Slot::Value(item) => out.push(item),
            Slot::Expanded(items) => out.extend(items),
            // A finished section never still holds its nested cohort:
            // `complete_expansion` swaps it for the aggregate first.
            Slot::Empty | Slot::Nested(_) => {}
        }
    }

    fn lock(&self) -> MutexGuard<'_, SectionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::oneshot;
    use tokio::time::sleep;

    use super::*;
    use crate::{BarrierMode, Stage};

    #[tokio::test(start_paused = true)]
    async fn expansion_is_held_until_the_nested_cohort_finishes() {
        let stages = StageList::new(vec![
            Stage::select_many(|n: u64| async move { vec![n, n + 1] }),
            Stage::select(|n: u64| async move {
                sleep(Duration::from_millis(10)).await;
                n * 10
            }),
        ]);
        let cohort = Cohort::new(
            stages,
            vec![Box::new(1_u64) as Item],
            0,
            BarrierMode::Scan,
            &Span::none(),
            0,
        );
        let (tx, rx) = oneshot::channel();
        cohort.run(Some(Box::new(move |aggregate| {
            let _ = tx.send(aggregate);
        })));

        sleep(Duration::from_millis(5)).await;
        let section = &cohort.sections()[0];
        assert_eq!(section.state(), State::Running);
        assert!(format!("{section:?}").contains("expanding_into"));

        let aggregate: Vec<u64> = rx
            .await
            .unwrap()
            .into_iter()
            .map(|item| *item.downcast::<u64>().unwrap())
            .collect();
        assert_eq!(aggregate, vec![10, 20]);
        assert_eq!(section.state(), State::Finished);
        assert!(!format!("{section:?}").contains("expanding_into"));
    }

    #[tokio::test]
    async fn terminal_state_is_absorbing() {
        let cohort = Cohort::new(
            StageList::new(vec![Stage::barrier()]),
            vec![Box::new(1_u64) as Item],
            0,
            BarrierMode::Scan,
            &Span::none(),
            0,
        );
        let section = Arc::clone(&cohort.sections()[0]);
        section.set_state(State::Timeout);
        section.set_state(State::Finished);
        section.advance();
        assert_eq!(section.state(), State::Timeout);
        assert_eq!(section.cursor(), 0);
    }
}
