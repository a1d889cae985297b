//! System configuration parsing.

use kdl::KdlDocument;
use serde::{Deserialize, Serialize};

use crate::kdl_ext::{child_int, child_string, child_string_list, string_prop};
use crate::{ConfigError, ConfigResult};

/// System-wide configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    /// Name of the trunk (main-line) branch.
    pub trunk: String,
    /// Queue family for convergence-branch builds.
    pub ci_queue_family: String,
    /// Queue family for developer-branch builds.
    pub developer_queue_family: String,
    /// Retry budget applied to targets that don't override it.
    pub default_retry_budget: u32,
    /// Minutes after which a running attempt is considered stuck.
    pub attempt_timeout_mins: u32,
    /// Filename marking a directory as a module root.
    pub manifest_marker: String,
    /// Part kinds that must never be retried.
    pub non_retryable_kinds: Vec<String>,
    /// How many times a missing ref is re-checked during partitioning.
    pub sync_retries: u32,
    /// Delay between those checks, in seconds.
    pub sync_retry_delay_secs: u64,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            trunk: "main".to_string(),
            ci_queue_family: "ci".to_string(),
            developer_queue_family: "developer".to_string(),
            default_retry_budget: 1,
            attempt_timeout_mins: 90,
            manifest_marker: "module.kdl".to_string(),
            non_retryable_kinds: Vec::new(),
            sync_retries: 5,
            sync_retry_delay_secs: 10,
        }
    }
}

impl SystemConfig {
    pub fn is_retryable_kind(&self, kind: &str) -> bool {
        !self.non_retryable_kinds.iter().any(|k| k == kind)
    }
}

/// Parse system configuration from KDL text.
pub fn parse_system_config(kdl: &str) -> ConfigResult<SystemConfig> {
    let doc: KdlDocument = kdl.parse()?;
    parse_system_node(&doc)
}

/// Extract the `system` node from a parsed document. Absent node or absent
/// fields fall back to defaults.
pub(crate) fn parse_system_node(doc: &KdlDocument) -> ConfigResult<SystemConfig> {
    let mut config = SystemConfig::default();

    let Some(node) = doc.nodes().iter().find(|n| n.name().value() == "system") else {
        return Ok(config);
    };

    if let Some(trunk) = child_string(node, "trunk") {
        config.trunk = trunk;
    }
    if let Some(children) = node.children() {
        if let Some(queues) = children.nodes().iter().find(|n| n.name().value() == "queues") {
            if let Some(ci) = string_prop(queues, "ci") {
                config.ci_queue_family = ci;
            }
            if let Some(dev) = string_prop(queues, "developer") {
                config.developer_queue_family = dev;
            }
        }
    }
    if let Some(budget) = child_int(node, "retry-budget") {
        config.default_retry_budget = to_u32("retry-budget", budget)?;
    }
    if let Some(mins) = child_int(node, "attempt-timeout-mins") {
        config.attempt_timeout_mins = to_u32("attempt-timeout-mins", mins)?;
    }
    if let Some(marker) = child_string(node, "manifest-marker") {
        config.manifest_marker = marker;
    }
    config.non_retryable_kinds = child_string_list(node, "non-retryable");
    if let Some(retries) = child_int(node, "sync-retries") {
        config.sync_retries = to_u32("sync-retries", retries)?;
    }
    if let Some(delay) = child_int(node, "sync-retry-delay-secs") {
        config.sync_retry_delay_secs = u64::try_from(delay).map_err(|_| invalid("sync-retry-delay-secs", delay))?;
    }

    Ok(config)
}

pub(crate) fn to_u32(field: &str, value: i128) -> ConfigResult<u32> {
    u32::try_from(value).map_err(|_| invalid(field, value))
}

fn invalid(field: &str, value: i128) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        message: format!("{value} is out of range"),
    }
}
