//! Per-module dependency manifests.
//!
//! Every module root carries a manifest (by default `module.kdl`) declaring
//! its name and the modules it depends on:
//!
//! ```kdl
//! module "billing" {
//!     deps "core" "protocol"
//! }
//! ```

use kdl::KdlDocument;
use serde::{Deserialize, Serialize};

use crate::kdl_ext::{child_string_list, first_string_arg};
use crate::{ConfigError, ConfigResult};

/// Parsed module manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleManifest {
    /// Module name, unique within the workspace.
    pub name: String,
    /// Names of the modules this one depends on.
    pub deps: Vec<String>,
}

/// Parse a module manifest from KDL text.
pub fn parse_module_manifest(kdl: &str) -> ConfigResult<ModuleManifest> {
    let doc: KdlDocument = kdl.parse()?;

    let node = doc
        .nodes()
        .iter()
        .find(|n| n.name().value() == "module")
        .ok_or_else(|| ConfigError::MissingField("module node".to_string()))?;

    let name = first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("module name".to_string()))?;

    Ok(ModuleManifest {
        name,
        deps: child_string_list(node, "deps"),
    })
}
