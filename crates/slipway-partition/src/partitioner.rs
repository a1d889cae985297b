//! Partitioner orchestration: per-target strategies producing the partition
//! list for one build.

use async_trait::async_trait;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use slipway_config::{SlipwayConfig, StrategyKind, SystemConfig, TargetConfig};
use slipway_core::checkout::SourceCheckout;
use slipway_core::Partition;

use crate::balance::{TimingHistory, WorkItem, balance};
use crate::error::PartitionError;
use crate::graph::{GraphError, ModuleDependencyGraph};
use crate::impact::{ChangeImpactAnalyzer, Impact, ModuleMap};

/// Per-build input assembled by the scheduler before partitioning.
#[derive(Debug, Clone, Default)]
pub struct BuildContext {
    /// Commit being built.
    pub git_ref: String,
    /// Whether the branch is a convergence branch.
    pub convergence: bool,
    /// Ref of the branch's last green build, if any.
    pub last_green_ref: Option<String>,
    /// Module paths whose part failed in the branch's previous build.
    pub previously_failed: Vec<String>,
    /// Historical timing samples for time-greedy balancing.
    pub timings: Option<TimingHistory>,
}

/// How one target's work is turned into item groups.
#[async_trait]
pub trait PartitioningStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn plan(
        &self,
        target: &TargetConfig,
        ctx: &BuildContext,
    ) -> Result<Vec<Vec<WorkItem>>, PartitionError>;
}

/// Plain manifest-driven strategy: balances the target's configured item
/// list, sized from the checked-out workspace.
pub struct PathStrategy {
    checkout: Arc<dyn SourceCheckout>,
}

impl PathStrategy {
    pub fn new(checkout: Arc<dyn SourceCheckout>) -> Self {
        Self { checkout }
    }
}

#[async_trait]
impl PartitioningStrategy for PathStrategy {
    fn name(&self) -> &'static str {
        "paths"
    }

    async fn plan(
        &self,
        target: &TargetConfig,
        ctx: &BuildContext,
    ) -> Result<Vec<Vec<WorkItem>>, PartitionError> {
        let workspace = self.checkout.workspace_for(&ctx.git_ref).await?;
        let items: Vec<WorkItem> = target
            .items
            .iter()
            .map(|item| WorkItem::new(item.clone(), path_size(&workspace.join(item))))
            .collect();

        Ok(balance(
            items,
            target.workers as usize,
            target.balancer,
            ctx.timings.as_ref(),
            ref_seed(&ctx.git_ref),
        ))
    }
}

/// Module-graph strategy for monorepo-style builds: discovers module
/// manifests, builds the dependency graph, and narrows the set through
/// change impact analysis.
pub struct ModuleGraphStrategy {
    checkout: Arc<dyn SourceCheckout>,
    system: SystemConfig,
}

impl ModuleGraphStrategy {
    pub fn new(checkout: Arc<dyn SourceCheckout>, system: SystemConfig) -> Self {
        Self { checkout, system }
    }

    /// Baseline for the change set: last green commit on a convergence
    /// branch, the branch point elsewhere.
    async fn baseline(&self, ctx: &BuildContext) -> Result<Option<String>, PartitionError> {
        if ctx.convergence {
            return Ok(ctx.last_green_ref.clone());
        }
        Ok(self
            .checkout
            .merge_base(&ctx.git_ref, &self.system.trunk)
            .await?)
    }
}

#[async_trait]
impl PartitioningStrategy for ModuleGraphStrategy {
    fn name(&self) -> &'static str {
        "module-graph"
    }

    async fn plan(
        &self,
        target: &TargetConfig,
        ctx: &BuildContext,
    ) -> Result<Vec<Vec<WorkItem>>, PartitionError> {
        let workspace = self.checkout.workspace_for(&ctx.git_ref).await?;
        let (modules, mut graph) = discover_modules(&workspace, &self.system.manifest_marker)?;
        // A malformed graph is a hard error before any selection happens.
        graph.topological_order()?;

        let full_set = || {
            let mut names: Vec<String> = modules.names().map(String::from).collect();
            names.sort();
            names
        };
        let selected: Vec<String> = match self.baseline(ctx).await? {
            None => {
                debug!(target = %target.kind, "no usable baseline, building every module");
                full_set()
            }
            Some(baseline) => {
                let changed = self
                    .checkout
                    .changed_files_since(&ctx.git_ref, &baseline)
                    .await?;
                let carry_forward: &[String] = if ctx.convergence {
                    &[]
                } else {
                    &ctx.previously_failed
                };
                let depends_on = graph.depends_on_map();
                let analyzer = ChangeImpactAnalyzer::new(
                    &modules,
                    &depends_on,
                    &target.always_build,
                    &target.build_everything_paths,
                    &target.ignore_paths,
                );
                match analyzer.analyze(&changed, carry_forward) {
                    Impact::Everything => full_set(),
                    Impact::Modules(set) => set.into_iter().collect(),
                }
            }
        };

        let items: Vec<WorkItem> = selected
            .into_iter()
            .map(|name| {
                let size = modules
                    .dir_of(&name)
                    .map(|dir| path_size(&workspace.join(dir)))
                    .unwrap_or(0);
                WorkItem::new(name, size)
            })
            .collect();

        Ok(balance(
            items,
            target.workers as usize,
            target.balancer,
            ctx.timings.as_ref(),
            ref_seed(&ctx.git_ref),
        ))
    }
}

/// Produces the ordered partition list for one build. Deterministic for
/// identical inputs; re-partitioning an already-partitioned build is refused
/// upstream by the dispatcher.
pub struct Partitioner {
    system: SystemConfig,
    targets: Vec<TargetConfig>,
    paths: PathStrategy,
    modules: ModuleGraphStrategy,
}

impl Partitioner {
    pub fn new(config: SlipwayConfig, checkout: Arc<dyn SourceCheckout>) -> Self {
        Self {
            paths: PathStrategy::new(checkout.clone()),
            modules: ModuleGraphStrategy::new(checkout, config.system.clone()),
            system: config.system,
            targets: config.targets,
        }
    }

    pub fn system(&self) -> &SystemConfig {
        &self.system
    }

    /// One partition per balanced group, across every configured target.
    pub async fn partitions_for(
        &self,
        ctx: &BuildContext,
    ) -> Result<Vec<Partition>, PartitionError> {
        let family = if ctx.convergence {
            &self.system.ci_queue_family
        } else {
            &self.system.developer_queue_family
        };

        let mut partitions = Vec::new();
        for target in &self.targets {
            let strategy: &dyn PartitioningStrategy = match target.strategy {
                StrategyKind::Paths => &self.paths,
                StrategyKind::ModuleGraph => &self.modules,
            };
            let groups = strategy.plan(target, ctx).await?;
            info!(
                target = %target.kind,
                strategy = strategy.name(),
                groups = groups.len(),
                "planned target"
            );

            let total_workers = groups.len();
            for (worker_chunk, group) in groups.into_iter().enumerate() {
                partitions.push(Partition {
                    kind: target.kind.clone(),
                    items: group.into_iter().map(|item| item.path).collect(),
                    queue: target.queue_for(family),
                    retry_budget: target.effective_retry_budget(&self.system),
                    options: serde_json::json!({
                        "total_workers": total_workers,
                        "worker_chunk": worker_chunk,
                    }),
                });
            }
        }
        Ok(partitions)
    }
}

/// Stable per-ref seed so shuffle-balanced partitioning stays deterministic.
fn ref_seed(git_ref: &str) -> u64 {
    git_ref
        .bytes()
        .fold(0xcbf2_9ce4_8422_2325u64, |hash, byte| {
            (hash ^ byte as u64).wrapping_mul(0x0000_0100_0000_01b3)
        })
}

/// Walk the workspace for manifest marker files and build the module map and
/// dependency graph. Traversal is sorted so discovery order, and with it
/// topological tie-breaking, is stable.
pub fn discover_modules(
    root: &Path,
    marker: &str,
) -> Result<(ModuleMap, ModuleDependencyGraph), PartitionError> {
    let mut manifests = Vec::new();
    collect_manifests(root, root, marker, &mut manifests)?;

    let mut modules = ModuleMap::new();
    let mut names = HashSet::new();
    for (dir, manifest) in &manifests {
        if !names.insert(manifest.name.clone()) {
            return Err(PartitionError::Manifest {
                path: dir.join(marker).display().to_string(),
                source: slipway_config::ConfigError::Duplicate(format!(
                    "module '{}'",
                    manifest.name
                )),
            });
        }
        modules.insert(&manifest.name, dir.clone());
    }

    let mut graph = ModuleDependencyGraph::new();
    for (_, manifest) in &manifests {
        graph.add_node(&manifest.name);
        for dep in &manifest.deps {
            if !names.contains(dep) {
                return Err(GraphError::UnknownModule {
                    module: manifest.name.clone(),
                    dep: dep.clone(),
                }
                .into());
            }
            graph.add_edge(&manifest.name, dep);
        }
    }

    Ok((modules, graph))
}

fn collect_manifests(
    root: &Path,
    dir: &Path,
    marker: &str,
    out: &mut Vec<(std::path::PathBuf, slipway_config::ModuleManifest)>,
) -> Result<(), PartitionError> {
    let mut entries: Vec<_> = std::fs::read_dir(dir)?.collect::<Result<_, _>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        if path.is_dir() {
            collect_manifests(root, &path, marker, out)?;
        } else if path.file_name().is_some_and(|n| n == marker) {
            let text = std::fs::read_to_string(&path)?;
            let manifest = slipway_config::parse_module_manifest(&text).map_err(|source| {
                PartitionError::Manifest {
                    path: path.display().to_string(),
                    source,
                }
            })?;
            let rel = dir.strip_prefix(root).unwrap_or(dir).to_path_buf();
            out.push((rel, manifest));
        }
    }
    Ok(())
}

/// Recursive byte size of a path; unreadable entries count as zero.
fn path_size(path: &Path) -> u64 {
    let Ok(metadata) = std::fs::metadata(path) else {
        return 0;
    };
    if metadata.is_file() {
        return metadata.len();
    }
    let Ok(entries) = std::fs::read_dir(path) else {
        return 0;
    };
    entries
        .flatten()
        .map(|entry| path_size(&entry.path()))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use slipway_config::parse_config;
    use slipway_core::error::Error as CoreError;
    use std::path::PathBuf;

    struct FakeCheckout {
        root: PathBuf,
        changed: Vec<String>,
        merge_base: Option<String>,
    }

    #[async_trait]
    impl SourceCheckout for FakeCheckout {
        async fn changed_files_since(
            &self,
            _git_ref: &str,
            _baseline: &str,
        ) -> slipway_core::Result<Vec<String>> {
            Ok(self.changed.clone())
        }

        async fn merge_base(
            &self,
            _git_ref: &str,
            _other: &str,
        ) -> slipway_core::Result<Option<String>> {
            Ok(self.merge_base.clone())
        }

        async fn workspace_for(&self, git_ref: &str) -> slipway_core::Result<PathBuf> {
            if git_ref == "missing" {
                return Err(CoreError::RefNotFound(git_ref.to_string()));
            }
            Ok(self.root.clone())
        }
    }

    /// Three modules: b depends on a, c depends on b.
    fn write_workspace() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (module, path, deps) in [
            ("a", "libs/a", r#"module "a""#),
            ("b", "libs/b", r#"module "b" { deps "a" }"#),
            ("c", "services/c", r#"module "c" { deps "b" }"#),
        ] {
            let root = dir.path().join(path);
            std::fs::create_dir_all(&root).unwrap();
            std::fs::write(root.join("module.kdl"), deps).unwrap();
            std::fs::write(root.join("lib.rs"), format!("// {module}")).unwrap();
        }
        dir
    }

    fn partitioner(checkout: FakeCheckout, targets_kdl: &str) -> Partitioner {
        let config = parse_config(targets_kdl).unwrap();
        Partitioner::new(config, Arc::new(checkout))
    }

    fn module_graph_config() -> &'static str {
        r#"
        target "unit" {
            strategy "module-graph"
            workers 2
        }
        "#
    }

    #[tokio::test]
    async fn change_to_root_module_covers_reverse_closure() {
        let workspace = write_workspace();
        let partitioner = partitioner(
            FakeCheckout {
                root: workspace.path().to_path_buf(),
                changed: vec!["libs/a/lib.rs".to_string()],
                merge_base: Some("base".to_string()),
            },
            module_graph_config(),
        );

        let ctx = BuildContext {
            git_ref: "abc".to_string(),
            ..Default::default()
        };
        let partitions = partitioner.partitions_for(&ctx).await.unwrap();

        let mut covered: Vec<String> = partitions
            .iter()
            .flat_map(|p| p.items.iter().cloned())
            .collect();
        covered.sort();
        assert_eq!(covered, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn leaf_change_narrows_selection() {
        let workspace = write_workspace();
        let partitioner = partitioner(
            FakeCheckout {
                root: workspace.path().to_path_buf(),
                changed: vec!["services/c/lib.rs".to_string()],
                merge_base: Some("base".to_string()),
            },
            module_graph_config(),
        );

        let ctx = BuildContext {
            git_ref: "abc".to_string(),
            ..Default::default()
        };
        let partitions = partitioner.partitions_for(&ctx).await.unwrap();
        let covered: Vec<String> = partitions
            .iter()
            .flat_map(|p| p.items.iter().cloned())
            .collect();
        assert_eq!(covered, vec!["c"]);
    }

    #[tokio::test]
    async fn missing_baseline_builds_everything() {
        let workspace = write_workspace();
        let partitioner = partitioner(
            FakeCheckout {
                root: workspace.path().to_path_buf(),
                changed: vec!["services/c/lib.rs".to_string()],
                merge_base: None,
            },
            module_graph_config(),
        );

        let ctx = BuildContext {
            git_ref: "abc".to_string(),
            ..Default::default()
        };
        let partitions = partitioner.partitions_for(&ctx).await.unwrap();
        let mut covered: Vec<String> = partitions
            .iter()
            .flat_map(|p| p.items.iter().cloned())
            .collect();
        covered.sort();
        assert_eq!(covered, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn partitions_carry_worker_chunk_tags_and_queue() {
        let workspace = write_workspace();
        let partitioner = partitioner(
            FakeCheckout {
                root: workspace.path().to_path_buf(),
                changed: Vec::new(),
                merge_base: None,
            },
            r#"
            target "unit" {
                strategy "module-graph"
                workers 2
                queue-suffix "unit"
            }
            "#,
        );

        let ctx = BuildContext {
            git_ref: "abc".to_string(),
            convergence: true,
            ..Default::default()
        };
        let partitions = partitioner.partitions_for(&ctx).await.unwrap();
        assert_eq!(partitions.len(), 2);
        for (i, partition) in partitions.iter().enumerate() {
            assert_eq!(partition.queue, "ci-unit");
            assert_eq!(partition.options["total_workers"], 2);
            assert_eq!(partition.options["worker_chunk"], i);
        }
    }

    #[tokio::test]
    async fn partitioning_is_deterministic() {
        let workspace = write_workspace();
        let make = |root: PathBuf| {
            partitioner(
                FakeCheckout {
                    root,
                    changed: Vec::new(),
                    merge_base: None,
                },
                r#"
                target "unit" {
                    strategy "module-graph"
                    workers 2
                    balancer "shuffle"
                }
                "#,
            )
        };
        let ctx = BuildContext {
            git_ref: "abc".to_string(),
            ..Default::default()
        };

        let first = make(workspace.path().to_path_buf())
            .partitions_for(&ctx)
            .await
            .unwrap();
        let second = make(workspace.path().to_path_buf())
            .partitions_for(&ctx)
            .await
            .unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn carried_forward_failures_stay_selected() {
        let workspace = write_workspace();
        let partitioner = partitioner(
            FakeCheckout {
                root: workspace.path().to_path_buf(),
                changed: Vec::new(),
                merge_base: Some("base".to_string()),
            },
            module_graph_config(),
        );

        let ctx = BuildContext {
            git_ref: "abc".to_string(),
            convergence: false,
            previously_failed: vec!["b".to_string()],
            ..Default::default()
        };
        let partitions = partitioner.partitions_for(&ctx).await.unwrap();
        let covered: Vec<String> = partitions
            .iter()
            .flat_map(|p| p.items.iter().cloned())
            .collect();
        assert_eq!(covered, vec!["b"]);
    }

    #[tokio::test]
    async fn dependency_cycle_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        for (path, manifest) in [
            ("libs/a", r#"module "a" { deps "b" }"#),
            ("libs/b", r#"module "b" { deps "a" }"#),
        ] {
            let root = dir.path().join(path);
            std::fs::create_dir_all(&root).unwrap();
            std::fs::write(root.join("module.kdl"), manifest).unwrap();
        }

        let partitioner = partitioner(
            FakeCheckout {
                root: dir.path().to_path_buf(),
                changed: Vec::new(),
                merge_base: None,
            },
            module_graph_config(),
        );

        let ctx = BuildContext {
            git_ref: "abc".to_string(),
            ..Default::default()
        };
        let err = partitioner.partitions_for(&ctx).await.unwrap_err();
        assert!(matches!(
            err,
            PartitionError::Graph(GraphError::Cycle(_))
        ));
    }

    #[tokio::test]
    async fn path_strategy_balances_configured_items() {
        let workspace = write_workspace();
        let partitioner = partitioner(
            FakeCheckout {
                root: workspace.path().to_path_buf(),
                changed: Vec::new(),
                merge_base: None,
            },
            r#"
            target "lint" {
                items "libs/a" "libs/b" "services/c"
                workers 2
                balancer "alphabetical"
            }
            "#,
        );

        let ctx = BuildContext {
            git_ref: "abc".to_string(),
            ..Default::default()
        };
        let partitions = partitioner.partitions_for(&ctx).await.unwrap();
        assert_eq!(partitions.len(), 2);
        assert_eq!(partitions[0].items, vec!["libs/a", "libs/b"]);
        assert_eq!(partitions[1].items, vec!["services/c"]);
        assert_eq!(partitions[0].queue, "developer");
    }

    #[tokio::test]
    async fn missing_ref_surfaces_as_checkout_error() {
        let workspace = write_workspace();
        let partitioner = partitioner(
            FakeCheckout {
                root: workspace.path().to_path_buf(),
                changed: Vec::new(),
                merge_base: None,
            },
            module_graph_config(),
        );

        let ctx = BuildContext {
            git_ref: "missing".to_string(),
            ..Default::default()
        };
        let err = partitioner.partitions_for(&ctx).await.unwrap_err();
        assert!(err.is_ref_not_found());
    }
}
