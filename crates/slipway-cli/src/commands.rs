//! CLI command implementations.

use anyhow::Context;
use async_trait::async_trait;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

use slipway_config::{SlipwayConfig, load_config};
use slipway_core::remote::{CommitState, RemoteServer};
use slipway_core::{ResourceId, queue::WorkQueue};
use slipway_db::{BuildStore, PgStore};
use slipway_partition::Partitioner;
use slipway_scheduler::{BuildLifecycle, Dispatcher, PgWorkQueue, TimeoutSweeper};

use crate::checkout::GitCheckout;

/// Remote server that only records intent in the log; hosting-service
/// integrations plug in behind the same trait.
struct LoggingRemote;

#[async_trait]
impl RemoteServer for LoggingRemote {
    async fn update_commit_status(
        &self,
        git_ref: &str,
        state: CommitState,
        description: &str,
    ) -> slipway_core::Result<()> {
        info!(git_ref = %git_ref, ?state, description, "commit status");
        Ok(())
    }

    async fn promote(&self, git_ref: &str) -> slipway_core::Result<()> {
        info!(git_ref = %git_ref, "promote");
        Ok(())
    }

    async fn merge(&self, branch: &str, git_ref: &str) -> slipway_core::Result<()> {
        info!(branch = %branch, git_ref = %git_ref, "merge");
        Ok(())
    }
}

/// Connected command context.
pub struct App {
    store: Arc<dyn BuildStore>,
    lifecycle: Arc<BuildLifecycle>,
    partitioner: Partitioner,
}

impl App {
    pub async fn connect(cli: &crate::Cli) -> anyhow::Result<Self> {
        let database_url = cli
            .database_url
            .as_deref()
            .context("DATABASE_URL is required for this command")?;
        let config: SlipwayConfig = load_config(Path::new(&cli.config))
            .with_context(|| format!("loading {}", cli.config))?;

        let pool = slipway_db::create_pool(database_url).await?;
        slipway_db::run_migrations(&pool).await?;

        let store: Arc<dyn BuildStore> = Arc::new(PgStore::new(pool.clone()));
        let queue: Arc<dyn WorkQueue> = Arc::new(PgWorkQueue::new(pool));
        let checkout = Arc::new(GitCheckout::new(&cli.repo));
        let dispatcher = Arc::new(Dispatcher::new(store.clone(), queue));
        let lifecycle = Arc::new(BuildLifecycle::new(
            store.clone(),
            dispatcher,
            Arc::new(LoggingRemote),
            config.system.clone(),
        ));
        let partitioner = Partitioner::new(config, checkout);

        Ok(Self {
            store,
            lifecycle,
            partitioner,
        })
    }

    pub async fn observe(
        &self,
        branch_name: &str,
        git_ref: &str,
        merge_on_success: bool,
        convergence: bool,
    ) -> anyhow::Result<()> {
        let branch = match self.store.branch_by_name(branch_name).await? {
            Some(branch) => branch,
            None => self.store.create_branch(branch_name, convergence).await?,
        };

        let Some(build) = self
            .lifecycle
            .observe_commit(&branch, git_ref, merge_on_success)
            .await?
        else {
            println!("commit {git_ref} already has a build");
            return Ok(());
        };

        let parts = self
            .lifecycle
            .partition_and_dispatch(&self.partitioner, build.id)
            .await?;
        println!("build {} dispatched with {} parts", build.id, parts.len());
        Ok(())
    }

    pub async fn status(&self, id: &str) -> anyhow::Result<()> {
        let id = ResourceId::from_str(id).context("invalid build id")?;
        let build = self.store.get_build(id).await?;
        println!(
            "build {}  ref {}  state {}  merge_on_success {}  promoted {}",
            build.id, build.git_ref, build.state, build.merge_on_success, build.promoted
        );
        if let Some(details) = &build.error_details {
            println!("  error: {details}");
        }

        for part in self.store.parts_for_build(id).await? {
            println!(
                "  part {}  kind {}  queue {}  budget {}  paths {}",
                part.id,
                part.kind,
                part.queue,
                part.retry_budget,
                part.paths.join(",")
            );
            for attempt in self.store.attempts_for_part(part.id).await? {
                println!(
                    "    attempt {}  {}  builder {}",
                    attempt.id,
                    attempt.state,
                    attempt.builder.as_deref().unwrap_or("-")
                );
            }
        }
        Ok(())
    }

    pub async fn abort(&self, id: &str) -> anyhow::Result<()> {
        let id = ResourceId::from_str(id).context("invalid build id")?;
        let build = self.lifecycle.abort(id).await?;
        println!("build {} is {}", build.id, build.state);
        Ok(())
    }

    pub async fn sweep(&self) -> anyhow::Result<()> {
        let sweeper = TimeoutSweeper::new(self.store.clone(), self.lifecycle.clone());
        let swept = sweeper.sweep_once().await?;
        println!("swept {swept} stuck attempts");
        Ok(())
    }
}

pub fn validate(path: &str) -> anyhow::Result<()> {
    let config = load_config(Path::new(path)).with_context(|| format!("loading {path}"))?;
    println!(
        "ok: {} targets, trunk '{}', queues '{}'/'{}'",
        config.targets.len(),
        config.system.trunk,
        config.system.ci_queue_family,
        config.system.developer_queue_family
    );
    for target in &config.targets {
        println!(
            "  target {}  strategy {:?}  workers {}",
            target.kind, target.strategy, target.workers
        );
    }
    Ok(())
}
