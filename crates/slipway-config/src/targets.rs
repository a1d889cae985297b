//! Partitioning target configuration.

use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};

use crate::kdl_ext::{child_int, child_string, child_string_list, first_string_arg};
use crate::system::{SystemConfig, to_u32};
use crate::{ConfigError, ConfigResult};

/// Which partitioning strategy a target uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    /// Balance the target's configured item list.
    Paths,
    /// Dependency-aware module selection from the change set.
    ModuleGraph,
}

/// How a target's work items are grouped across workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BalancerChoice {
    Alphabetical,
    Isolated,
    RoundRobin,
    SortedRoundRobin,
    GreedySize,
    AverageSize,
    Shuffle,
    /// LPT by historical timing; falls back to greedy-by-size when no
    /// timing samples exist.
    TimeGreedy,
}

/// One partitioning target: a test category and how to shard it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Target name; doubles as the part kind.
    pub kind: String,
    /// Partitioning strategy.
    pub strategy: StrategyKind,
    /// Number of parallel workers requested.
    pub workers: u32,
    /// Grouping strategy for the work items.
    pub balancer: BalancerChoice,
    /// Optional suffix appended to the queue family.
    pub queue_suffix: Option<String>,
    /// Retry budget; `None` falls back to the system default.
    pub retry_budget: Option<u32>,
    /// Item list for the paths strategy.
    pub items: Vec<String>,
    /// Modules always included, regardless of the change set.
    pub always_build: Vec<String>,
    /// Any touched path under one of these forces a full rebuild.
    pub build_everything_paths: Vec<String>,
    /// Changed files under these are excluded from impact analysis.
    pub ignore_paths: Vec<String>,
}

impl TargetConfig {
    /// Effective retry budget given the system default.
    pub fn effective_retry_budget(&self, system: &SystemConfig) -> u32 {
        self.retry_budget.unwrap_or(system.default_retry_budget)
    }

    /// Destination queue for this target on the given family.
    pub fn queue_for(&self, family: &str) -> String {
        match &self.queue_suffix {
            Some(suffix) => format!("{family}-{suffix}"),
            None => family.to_string(),
        }
    }
}

/// Parse all target definitions from KDL text.
pub fn parse_targets(kdl: &str, system: &SystemConfig) -> ConfigResult<Vec<TargetConfig>> {
    let doc: KdlDocument = kdl.parse()?;
    parse_target_nodes(&doc, system)
}

pub(crate) fn parse_target_nodes(
    doc: &KdlDocument,
    _system: &SystemConfig,
) -> ConfigResult<Vec<TargetConfig>> {
    let mut targets = Vec::new();

    for node in doc.nodes() {
        if node.name().value() == "target" {
            targets.push(parse_target(node)?);
        }
    }

    let mut seen = std::collections::HashSet::new();
    for target in &targets {
        if !seen.insert(target.kind.as_str()) {
            return Err(ConfigError::Duplicate(format!("target '{}'", target.kind)));
        }
    }

    Ok(targets)
}

fn parse_target(node: &KdlNode) -> ConfigResult<TargetConfig> {
    let kind = first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("target name".to_string()))?;

    let strategy = match child_string(node, "strategy").as_deref() {
        Some("paths") | None => StrategyKind::Paths,
        Some("module-graph") => StrategyKind::ModuleGraph,
        Some(other) => {
            return Err(ConfigError::InvalidValue {
                field: format!("strategy for target '{kind}'"),
                message: format!("unknown strategy: {other}"),
            });
        }
    };

    let workers = match child_int(node, "workers") {
        Some(n) => to_u32("workers", n)?,
        None => 1,
    };
    if workers == 0 {
        return Err(ConfigError::InvalidValue {
            field: format!("workers for target '{kind}'"),
            message: "must be at least 1".to_string(),
        });
    }

    let balancer = parse_balancer(&kind, child_string(node, "balancer"))?;

    let retry_budget = match child_int(node, "retry-budget") {
        Some(n) => Some(to_u32("retry-budget", n)?),
        None => None,
    };

    let items = child_string_list(node, "items");
    if strategy == StrategyKind::Paths && items.is_empty() {
        return Err(ConfigError::MissingField(format!(
            "items for paths target '{kind}'"
        )));
    }

    Ok(TargetConfig {
        kind,
        strategy,
        workers,
        balancer,
        queue_suffix: child_string(node, "queue-suffix"),
        retry_budget,
        items,
        always_build: child_string_list(node, "always-build"),
        build_everything_paths: child_string_list(node, "build-everything-path"),
        ignore_paths: child_string_list(node, "ignore-path"),
    })
}

fn parse_balancer(kind: &str, value: Option<String>) -> ConfigResult<BalancerChoice> {
    match value.as_deref() {
        None | Some("round-robin") => Ok(BalancerChoice::RoundRobin),
        Some("alphabetical") => Ok(BalancerChoice::Alphabetical),
        Some("isolated") => Ok(BalancerChoice::Isolated),
        Some("sorted-round-robin") => Ok(BalancerChoice::SortedRoundRobin),
        Some("greedy-size") => Ok(BalancerChoice::GreedySize),
        Some("average-size") => Ok(BalancerChoice::AverageSize),
        Some("shuffle") => Ok(BalancerChoice::Shuffle),
        Some("time-greedy") => Ok(BalancerChoice::TimeGreedy),
        Some(other) => Err(ConfigError::InvalidValue {
            field: format!("balancer for target '{kind}'"),
            message: format!("unknown balancer: {other}"),
        }),
    }
}
