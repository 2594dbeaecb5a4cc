//! Newtype identifiers.
//!
//! Runs and cohorts are identified by random UUIDs so that every span and
//! event emitted for one run (including its nested expansions) can be
//! correlated. Distinct newtypes prevent passing a [`CohortId`] where a
//! [`RunId`] is expected.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Macro for UUID-wrapped newtypes.
// Generates: struct (Copy), new_random(), from_uuid(), as_uuid(), Display.
// ---------------------------------------------------------------------------
macro_rules! uuid_id {
    (
        $(#[$attr:meta])*
        $name:ident
    ) => {
        $(#[$attr])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            /// Generates a new random identifier.
            pub fn new_random() -> Self {
                Self(Uuid::new_v4())
            }

            /// Creates an identifier from an existing UUID.
            pub fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            /// Returns the underlying [`Uuid`].
            pub fn as_uuid(self) -> Uuid {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id! {
    /// Identifies one top-level pipeline run.
    ///
    /// Generated by [`crate::Pipeline`] for every `run`, `start` or `spawn`
    /// call and attached to the run's root span.
    RunId
}

uuid_id! {
    /// Identifies one cohort: the root cohort of a run, or a nested cohort
    /// created by a flat-map expansion.
    CohortId
}
