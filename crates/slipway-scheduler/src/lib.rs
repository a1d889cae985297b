//! Build scheduling for Slipway.
//!
//! Contains the build lifecycle state machine, the dispatcher that
//! materializes partitions into persisted work, the PostgreSQL work-queue
//! transport, and the stuck-attempt sweep.

pub mod dispatch;
pub mod error;
pub mod lifecycle;
pub mod queue;
pub mod sweep;

pub use dispatch::Dispatcher;
pub use error::SchedulerError;
pub use lifecycle::{BuildLifecycle, MutationOutcome, derive_state};
pub use queue::PgWorkQueue;
pub use sweep::TimeoutSweeper;
