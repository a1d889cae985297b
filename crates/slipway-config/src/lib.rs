//! KDL configuration parsing for Slipway.
//!
//! This crate handles parsing of:
//! - System configuration (slipway.kdl)
//! - Partitioning target definitions
//! - Per-module dependency manifests

pub mod error;
pub(crate) mod kdl_ext;
pub mod manifest;
pub mod system;
pub mod targets;

pub use error::{ConfigError, ConfigResult};
pub use manifest::{ModuleManifest, parse_module_manifest};
pub use system::SystemConfig;
pub use targets::{BalancerChoice, StrategyKind, TargetConfig};

use kdl::KdlDocument;

/// The full parsed configuration file.
#[derive(Debug, Clone)]
pub struct SlipwayConfig {
    pub system: SystemConfig,
    pub targets: Vec<TargetConfig>,
}

/// Parse a complete configuration from KDL text.
pub fn parse_config(kdl: &str) -> ConfigResult<SlipwayConfig> {
    let doc: KdlDocument = kdl.parse()?;

    let system = system::parse_system_node(&doc)?;
    let targets = targets::parse_target_nodes(&doc, &system)?;

    if targets.is_empty() {
        return Err(ConfigError::MissingField("at least one target".to_string()));
    }

    Ok(SlipwayConfig { system, targets })
}

/// Load and parse a configuration file from disk.
pub fn load_config(path: &std::path::Path) -> ConfigResult<SlipwayConfig> {
    let text = std::fs::read_to_string(path)?;
    parse_config(&text)
}
