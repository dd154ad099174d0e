//! SQLite persistence for the workflow-coordination engine.
//!
//! One file-backed database per workspace (or an in-memory database for
//! tests), opened through [`CoordStore`]. Schema evolution uses the numbered
//! migrations embedded from `./migrations`; each is forward-only and
//! idempotent.

pub mod checkpoints;
pub mod common;
pub mod records;
pub mod store;
pub mod tasks;

pub use checkpoints::MAX_CHECKPOINTS_PER_TASK;
pub use records::InitiativeSnapshot;
pub use store::CoordStore;
