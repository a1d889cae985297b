//! Slipway operator CLI.

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod checkout;
mod commands;

#[derive(Parser)]
#[command(name = "slipway")]
#[command(about = "Slipway build orchestrator CLI", long_about = None)]
struct Cli {
    /// PostgreSQL connection string
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Path to the configuration file
    #[arg(long, env = "SLIPWAY_CONFIG", default_value = "slipway.kdl")]
    config: String,

    /// Path to the repository the checkout service works from
    #[arg(long, env = "SLIPWAY_REPO", default_value = ".")]
    repo: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Observe a commit on a branch: supersede, partition and dispatch
    Observe {
        /// Branch name
        branch: String,
        /// Commit to build
        git_ref: String,
        /// Auto-merge the branch if the build succeeds
        #[arg(long)]
        merge_on_success: bool,
        /// Register the branch as a convergence branch if it is new
        #[arg(long)]
        convergence: bool,
    },
    /// Show a build with its parts and attempts
    Status {
        /// Build ID
        id: String,
    },
    /// Abort a build
    Abort {
        /// Build ID
        id: String,
    },
    /// Error out attempts stuck past the configured timeout
    Sweep,
    /// Validate a configuration file
    Validate {
        /// Path to the configuration file
        #[arg(default_value = "slipway.kdl")]
        path: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Observe {
            branch,
            git_ref,
            merge_on_success,
            convergence,
        } => {
            let app = commands::App::connect(&cli).await?;
            app.observe(branch, git_ref, *merge_on_success, *convergence)
                .await?;
        }
        Commands::Status { id } => {
            let app = commands::App::connect(&cli).await?;
            app.status(id).await?;
        }
        Commands::Abort { id } => {
            let app = commands::App::connect(&cli).await?;
            app.abort(id).await?;
        }
        Commands::Sweep => {
            let app = commands::App::connect(&cli).await?;
            app.sweep().await?;
        }
        Commands::Validate { path } => {
            commands::validate(path)?;
        }
    }

    Ok(())
}
