//! Change impact analysis: maps a change set to the modules requiring tests.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use tracing::debug;

/// Module roots, keyed by their relative directory within the workspace.
#[derive(Debug, Default, Clone)]
pub struct ModuleMap {
    by_dir: HashMap<PathBuf, String>,
    dirs: HashMap<String, PathBuf>,
}

impl ModuleMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, dir: impl Into<PathBuf>) {
        let dir = dir.into();
        self.by_dir.insert(dir.clone(), name.to_string());
        self.dirs.insert(name.to_string(), dir);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.dirs.contains_key(name)
    }

    pub fn dir_of(&self, name: &str) -> Option<&Path> {
        self.dirs.get(name).map(PathBuf::as_path)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.dirs.keys().map(String::as_str)
    }

    /// The nearest enclosing module of a file, found by walking parent
    /// directories until one is a module root.
    pub fn module_for(&self, file: &str) -> Option<&str> {
        let mut dir = Path::new(file).parent();
        while let Some(current) = dir {
            if let Some(name) = self.by_dir.get(current) {
                return Some(name);
            }
            dir = current.parent();
        }
        // A module rooted at the workspace top maps everything else.
        self.by_dir.get(Path::new("")).map(String::as_str)
    }
}

/// Result of impact analysis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Impact {
    /// The change cannot be attributed; rebuild the full target set.
    Everything,
    /// The minimal set of modules requiring tests.
    Modules(BTreeSet<String>),
}

/// Maps a changed-file list to the modules requiring testing, using the
/// reverse transitive-dependency map.
pub struct ChangeImpactAnalyzer<'a> {
    modules: &'a ModuleMap,
    depends_on: &'a HashMap<String, BTreeSet<String>>,
    always_build: &'a [String],
    build_everything_paths: &'a [String],
    ignore_paths: &'a [String],
}

impl<'a> ChangeImpactAnalyzer<'a> {
    pub fn new(
        modules: &'a ModuleMap,
        depends_on: &'a HashMap<String, BTreeSet<String>>,
        always_build: &'a [String],
        build_everything_paths: &'a [String],
        ignore_paths: &'a [String],
    ) -> Self {
        Self {
            modules,
            depends_on,
            always_build,
            build_everything_paths,
            ignore_paths,
        }
    }

    /// Analyze a change set. `carry_forward` holds the modules whose part
    /// failed in the branch's previous build; they stay under test whether or
    /// not they changed again.
    pub fn analyze(&self, changed_files: &[String], carry_forward: &[String]) -> Impact {
        let mut selected: BTreeSet<String> = BTreeSet::new();

        for file in changed_files {
            if matches_any_prefix(file, self.ignore_paths) {
                continue;
            }
            if matches_any_prefix(file, self.build_everything_paths) {
                debug!(file = %file, "change forces a full rebuild");
                return Impact::Everything;
            }
            let Some(module) = self.modules.module_for(file) else {
                debug!(file = %file, "change maps to no module, rebuilding everything");
                return Impact::Everything;
            };
            match self.depends_on.get(module) {
                Some(dependents) => selected.extend(dependents.iter().cloned()),
                None => {
                    selected.insert(module.to_string());
                }
            }
        }

        for name in self.always_build {
            selected.insert(name.clone());
        }
        for name in carry_forward {
            // A module removed since the previous build has nothing left to
            // exercise.
            if self.modules.contains(name) {
                selected.insert(name.clone());
            }
        }

        Impact::Modules(selected)
    }
}

fn matches_any_prefix(file: &str, prefixes: &[String]) -> bool {
    let path = Path::new(file);
    prefixes.iter().any(|prefix| {
        let prefix = prefix.trim_end_matches('/');
        !prefix.is_empty() && path.starts_with(prefix)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ModuleDependencyGraph;

    fn setup() -> (ModuleMap, HashMap<String, BTreeSet<String>>) {
        let mut modules = ModuleMap::new();
        modules.insert("core", "libs/core");
        modules.insert("billing", "services/billing");
        modules.insert("web", "services/web");

        let mut graph = ModuleDependencyGraph::new();
        graph.add_edge("billing", "core");
        graph.add_edge("web", "billing");
        (modules, graph.depends_on_map())
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_change_selects_reverse_closure() {
        let (modules, depends_on) = setup();
        let analyzer = ChangeImpactAnalyzer::new(&modules, &depends_on, &[], &[], &[]);

        let impact = analyzer.analyze(&strings(&["libs/core/src/lib.rs"]), &[]);
        assert_eq!(
            impact,
            Impact::Modules(BTreeSet::from([
                "core".to_string(),
                "billing".to_string(),
                "web".to_string(),
            ]))
        );
    }

    #[test]
    fn test_leaf_change_selects_only_itself() {
        let (modules, depends_on) = setup();
        let analyzer = ChangeImpactAnalyzer::new(&modules, &depends_on, &[], &[], &[]);

        let impact = analyzer.analyze(&strings(&["services/web/src/main.rs"]), &[]);
        assert_eq!(impact, Impact::Modules(BTreeSet::from(["web".to_string()])));
    }

    #[test]
    fn test_unmapped_file_forces_everything() {
        let (modules, depends_on) = setup();
        let analyzer = ChangeImpactAnalyzer::new(&modules, &depends_on, &[], &[], &[]);

        let impact = analyzer.analyze(&strings(&["Makefile"]), &[]);
        assert_eq!(impact, Impact::Everything);
    }

    #[test]
    fn test_build_everything_path() {
        let (modules, depends_on) = setup();
        let everything = strings(&["ci/"]);
        let analyzer = ChangeImpactAnalyzer::new(&modules, &depends_on, &[], &everything, &[]);

        let impact = analyzer.analyze(&strings(&["ci/image.kdl"]), &[]);
        assert_eq!(impact, Impact::Everything);
    }

    #[test]
    fn test_ignored_paths_are_skipped() {
        let (modules, depends_on) = setup();
        let ignored = strings(&["docs/"]);
        let analyzer = ChangeImpactAnalyzer::new(&modules, &depends_on, &[], &[], &ignored);

        // Without the ignore rule this unmapped file would force a rebuild.
        let impact = analyzer.analyze(&strings(&["docs/handbook.md"]), &[]);
        assert_eq!(impact, Impact::Modules(BTreeSet::new()));
    }

    #[test]
    fn test_always_build_and_carry_forward() {
        let (modules, depends_on) = setup();
        let always = strings(&["core"]);
        let analyzer = ChangeImpactAnalyzer::new(&modules, &depends_on, &always, &[], &[]);

        let impact = analyzer.analyze(
            &[],
            &strings(&["billing", "deleted-module"]),
        );
        assert_eq!(
            impact,
            Impact::Modules(BTreeSet::from(["core".to_string(), "billing".to_string()]))
        );
    }

    #[test]
    fn test_nearest_module_wins() {
        let mut modules = ModuleMap::new();
        modules.insert("outer", "services");
        modules.insert("inner", "services/billing");

        assert_eq!(modules.module_for("services/billing/src/lib.rs"), Some("inner"));
        assert_eq!(modules.module_for("services/readme.md"), Some("outer"));
        assert_eq!(modules.module_for("unrelated.txt"), None);
    }
}
