//! singleton CLI: operator interface to the submission locks.

use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use task_singleton::backend::BackendRegistry;
use task_singleton::config::Config;
use task_singleton::config::secrets::redact_url;
use task_singleton::locks::Locks;
use task_singleton::model::{Kwargs, TaskDefinition};
use task_singleton::telemetry::{TelemetryConfig, init_telemetry};
use tracing::info;

#[derive(Parser)]
#[command(name = "singleton", about = "Inspect and manage task submission locks")]
struct Cli {
    /// Load configuration from a TOML file instead of the environment
    #[arg(long, global = true)]
    config: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Remove every lock under the configured key prefix
    Clear,
    /// Print the lock key a submission maps to
    Key(Target),
    /// Print the execution currently holding a submission's lock
    Owner(Target),
    /// Remove the lock for a submission
    Release(Target),
}

/// A submission, identified by task name and arguments.
#[derive(Args)]
struct Target {
    /// Task name
    task: String,
    /// Positional arguments as a JSON array
    #[arg(long)]
    args: Option<String>,
    /// Keyword arguments as a JSON object
    #[arg(long)]
    kwargs: Option<String>,
    /// Comma-separated argument names that identify the work
    #[arg(long, value_delimiter = ',')]
    unique_on: Option<Vec<String>>,
}

impl Target {
    fn definition(&self) -> TaskDefinition {
        let def = TaskDefinition::new(&self.task);
        match &self.unique_on {
            Some(names) => def.unique_on(names.iter().map(|n| n.trim().to_string())),
            None => def,
        }
    }

    fn arguments(&self) -> anyhow::Result<(Vec<Value>, Kwargs)> {
        let args: Vec<Value> = match &self.args {
            Some(json) => serde_json::from_str(json)
                .map_err(|e| anyhow::anyhow!("--args must be a JSON array: {e}"))?,
            None => Vec::new(),
        };
        let kwargs: Kwargs = match &self.kwargs {
            Some(json) => serde_json::from_str(json)
                .map_err(|e| anyhow::anyhow!("--kwargs must be a JSON object: {e}"))?,
            None => Kwargs::new(),
        };
        Ok((args, kwargs))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::from_env()?,
    };

    let _guard = init_telemetry(TelemetryConfig::from_config(&config, "singleton"))?;

    if let Some(url) = &config.backend.url {
        info!(backend = %config.backend.kind, url = %redact_url(url), "using lock backend");
    }
    let locks = Locks::from_config(&config, &BackendRegistry::with_defaults())?;

    match cli.command {
        Command::Clear => {
            locks.clear().await?;
            println!("Cleared locks under {}", locks.key_prefix());
        }
        Command::Key(target) => {
            let (args, kwargs) = target.arguments()?;
            let key = locks.lock_key(&target.definition(), &args, &kwargs)?;
            println!("{key}");
        }
        Command::Owner(target) => {
            let (args, kwargs) = target.arguments()?;
            let key = locks.lock_key(&target.definition(), &args, &kwargs)?;
            match locks.owner(&key).await? {
                Some(owner) => println!("{owner}"),
                None => println!("-"),
            }
        }
        Command::Release(target) => {
            let (args, kwargs) = target.arguments()?;
            locks.release(&target.definition(), &args, &kwargs).await?;
            println!("Released");
        }
    }

    Ok(())
}
