//! Build, part and attempt records with their state machines.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ResourceId;
use crate::error::Error;

/// A branch under CI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Branch {
    /// Unique identifier.
    pub id: ResourceId,
    /// Branch name (e.g., "main", "feature/login").
    pub name: String,
    /// Whether this is a long-lived integration branch subject to promotion.
    pub convergence: bool,
    /// When the branch was first observed.
    pub created_at: DateTime<Utc>,
}

/// One CI run for a (branch, commit) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Build {
    /// Unique identifier.
    pub id: ResourceId,
    /// Branch this build belongs to.
    pub branch_id: ResourceId,
    /// Commit identifier being built.
    pub git_ref: String,
    /// Current aggregate state.
    pub state: BuildState,
    /// Auto-merge the branch when this build succeeds.
    pub merge_on_success: bool,
    /// Whether a promotion has already been pushed for this build.
    pub promoted: bool,
    /// Diagnostic detail attached when the build errors.
    pub error_details: Option<String>,
    /// When the build was created.
    pub created_at: DateTime<Utc>,
    /// Freshness marker, bumped on every state recomputation even when the
    /// state itself is unchanged.
    pub updated_at: DateTime<Utc>,
}

impl Build {
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Aggregate state of a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildState {
    /// Work is being split into parts.
    Partitioning,
    /// Checkout could not see the commit yet; partitioning will be retried.
    WaitingForSync,
    /// Parts exist and are queued.
    Runnable,
    /// At least one attempt is executing.
    Running,
    /// Failure is certain, but remaining parts are allowed to finish so all
    /// feedback surfaces before the verdict.
    Doomed,
    /// Every part passed.
    Succeeded,
    /// All parts terminal, at least one failed.
    Failed,
    /// A part errored with no retry left, or partitioning itself errored.
    Errored,
    /// Explicitly aborted. Sticky: no later mutation leaves this state.
    Aborted,
}

impl BuildState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BuildState::Succeeded | BuildState::Failed | BuildState::Errored | BuildState::Aborted
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BuildState::Partitioning => "partitioning",
            BuildState::WaitingForSync => "waiting_for_sync",
            BuildState::Runnable => "runnable",
            BuildState::Running => "running",
            BuildState::Doomed => "doomed",
            BuildState::Succeeded => "succeeded",
            BuildState::Failed => "failed",
            BuildState::Errored => "errored",
            BuildState::Aborted => "aborted",
        }
    }
}

impl std::str::FromStr for BuildState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "partitioning" => Ok(BuildState::Partitioning),
            "waiting_for_sync" => Ok(BuildState::WaitingForSync),
            "runnable" => Ok(BuildState::Runnable),
            "running" => Ok(BuildState::Running),
            "doomed" => Ok(BuildState::Doomed),
            "succeeded" => Ok(BuildState::Succeeded),
            "failed" => Ok(BuildState::Failed),
            "errored" => Ok(BuildState::Errored),
            "aborted" => Ok(BuildState::Aborted),
            other => Err(Error::InvalidState(format!("build state '{other}'"))),
        }
    }
}

impl std::fmt::Display for BuildState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One independently executable shard of a build's work.
///
/// Created once, atomically, during partitioning; immutable afterward.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildPart {
    /// Unique identifier.
    pub id: ResourceId,
    /// Build this part belongs to.
    pub build_id: ResourceId,
    /// Test category (matches a configured target kind).
    pub kind: String,
    /// File or module paths this part covers. Non-empty.
    pub paths: Vec<String>,
    /// Queue the part's attempts are dispatched to.
    pub queue: String,
    /// How many retries this part may receive after its initial attempt.
    pub retry_budget: u32,
    /// Opaque options bag handed through to the worker.
    pub options: serde_json::Value,
    /// When the part was created.
    pub created_at: DateTime<Utc>,
}

/// One execution of a build part.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildAttempt {
    /// Unique identifier.
    pub id: ResourceId,
    /// Part this attempt executes.
    pub build_part_id: ResourceId,
    /// Current state.
    pub state: AttemptState,
    /// Identity of the worker executing this attempt.
    pub builder: Option<String>,
    /// When the worker started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the worker finished.
    pub finished_at: Option<DateTime<Utc>>,
    /// When the attempt was created.
    pub created_at: DateTime<Utc>,
}

/// State of a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    /// Queued, not yet picked up by a worker.
    Runnable,
    /// A worker is executing it.
    Running,
    /// Finished successfully.
    Passed,
    /// Finished with test failures.
    Failed,
    /// Finished with an infrastructure error.
    Errored,
    /// Cancelled before or during execution.
    Aborted,
}

impl AttemptState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AttemptState::Passed
                | AttemptState::Failed
                | AttemptState::Errored
                | AttemptState::Aborted
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptState::Runnable => "runnable",
            AttemptState::Running => "running",
            AttemptState::Passed => "passed",
            AttemptState::Failed => "failed",
            AttemptState::Errored => "errored",
            AttemptState::Aborted => "aborted",
        }
    }
}

impl std::str::FromStr for AttemptState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "runnable" => Ok(AttemptState::Runnable),
            "running" => Ok(AttemptState::Running),
            "passed" => Ok(AttemptState::Passed),
            "failed" => Ok(AttemptState::Failed),
            "errored" => Ok(AttemptState::Errored),
            "aborted" => Ok(AttemptState::Aborted),
            other => Err(Error::InvalidState(format!("attempt state '{other}'"))),
        }
    }
}

impl std::fmt::Display for AttemptState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal outcome a worker (or the timeout sweep) reports for an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptResult {
    Passed,
    Failed,
    Errored,
    Aborted,
}

impl AttemptResult {
    /// The terminal attempt state this result maps to.
    pub fn state(&self) -> AttemptState {
        match self {
            AttemptResult::Passed => AttemptState::Passed,
            AttemptResult::Failed => AttemptState::Failed,
            AttemptResult::Errored => AttemptState::Errored,
            AttemptResult::Aborted => AttemptState::Aborted,
        }
    }

    /// Whether this result should be considered for a retry.
    pub fn is_unsuccessful(&self) -> bool {
        matches!(self, AttemptResult::Failed | AttemptResult::Errored)
    }
}

/// A planned shard of work: the partitioner's output, the dispatcher's input.
/// Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Partition {
    /// Test category.
    pub kind: String,
    /// File or module paths to cover. Non-empty.
    pub items: Vec<String>,
    /// Destination queue.
    pub queue: String,
    /// Retry budget for the resulting part.
    pub retry_budget: u32,
    /// Opaque options bag (worker chunking tags live here).
    pub options: serde_json::Value,
}
