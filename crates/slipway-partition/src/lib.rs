//! Build partitioning engine for Slipway.
//!
//! Turns one observed commit into a list of partition descriptors:
//! - [`graph`]: directed dependency graph between source modules
//! - [`impact`]: maps a change set to the minimal set of modules to test
//! - [`balance`]: splits work items across workers
//! - [`partitioner`]: orchestrates the above per configured target

pub mod balance;
pub mod error;
pub mod graph;
pub mod impact;
pub mod partitioner;

pub use balance::{TimingHistory, WorkItem, balance};
pub use error::PartitionError;
pub use graph::{GraphError, ModuleDependencyGraph};
pub use impact::{ChangeImpactAnalyzer, Impact, ModuleMap};
pub use partitioner::{BuildContext, ModuleGraphStrategy, Partitioner, PathStrategy, PartitioningStrategy};
