//! Git-backed implementation of the source checkout trait.

use async_trait::async_trait;
use slipway_core::checkout::SourceCheckout;
use slipway_core::{Error, Result};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Checkout service working against one local repository clone.
pub struct GitCheckout {
    repo_dir: PathBuf,
}

impl GitCheckout {
    pub fn new(repo_dir: impl Into<PathBuf>) -> Self {
        Self {
            repo_dir: repo_dir.into(),
        }
    }

    async fn git(&self, args: &[&str]) -> Result<std::process::Output> {
        debug!(?args, "running git");
        Command::new("git")
            .args(args)
            .current_dir(&self.repo_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| Error::Checkout(e.to_string()))
    }

    async fn ensure_ref(&self, git_ref: &str) -> Result<()> {
        let output = self
            .git(&["cat-file", "-e", &format!("{git_ref}^{{commit}}")])
            .await?;
        if !output.status.success() {
            return Err(Error::RefNotFound(git_ref.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl SourceCheckout for GitCheckout {
    async fn changed_files_since(&self, git_ref: &str, baseline: &str) -> Result<Vec<String>> {
        self.ensure_ref(git_ref).await?;
        self.ensure_ref(baseline).await?;

        let output = self
            .git(&["diff", "--name-only", &format!("{baseline}..{git_ref}")])
            .await?;
        if !output.status.success() {
            return Err(Error::Checkout(
                String::from_utf8_lossy(&output.stderr).to_string(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::to_string)
            .filter(|line| !line.is_empty())
            .collect())
    }

    async fn merge_base(&self, git_ref: &str, other: &str) -> Result<Option<String>> {
        self.ensure_ref(git_ref).await?;

        let output = self.git(&["merge-base", git_ref, other]).await?;
        if !output.status.success() {
            return Ok(None);
        }
        let base = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(if base.is_empty() { None } else { Some(base) })
    }

    async fn workspace_for(&self, git_ref: &str) -> Result<PathBuf> {
        self.ensure_ref(git_ref).await?;

        let output = self.git(&["checkout", "--quiet", "--detach", git_ref]).await?;
        if !output.status.success() {
            return Err(Error::Checkout(
                String::from_utf8_lossy(&output.stderr).to_string(),
            ));
        }
        Ok(self.repo_dir.clone())
    }
}
