//! Core domain types and traits for the Slipway build orchestrator.
//!
//! This crate contains:
//! - Resource identifiers and common types
//! - Build, part and attempt records with their state enums
//! - The transient partition descriptor
//! - Traits for the external collaborators: work queue, source checkout,
//!   remote hosting server

pub mod build;
pub mod checkout;
pub mod error;
pub mod id;
pub mod queue;
pub mod remote;

pub use build::{
    AttemptResult, AttemptState, Branch, Build, BuildAttempt, BuildPart, BuildState, Partition,
};
pub use error::{Error, Result};
pub use id::ResourceId;
