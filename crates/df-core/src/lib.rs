//! Lifecycle orchestration for virtual desktop instances and their backups.

pub mod coordinator;
pub mod cost;
pub mod error;
pub mod lifecycle;
pub mod reconciler;
pub mod validate;

pub use coordinator::{Coordinator, Settings};
pub use error::{EntityKind, Error, Record, Result, TransitionError, ValidationError};
pub use reconciler::{Outcome, Reconciler, ReconcilerSettings};
