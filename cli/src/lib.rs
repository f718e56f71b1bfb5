pub mod catalog;
mod run_cmd;
mod status_cmd;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use clap::Subcommand;
use scriptdeck_core::LifecycleConfig;
use scriptdeck_core::LifecycleController;
use scriptdeck_core::PersistentRunIndex;
use scriptdeck_core::ScriptDefinition;
use scriptdeck_core::find_scriptdeck_home;
use tracing::warn;

const CATALOG_FILE: &str = "scripts.json";

/// Start, stop and inspect the scripts in your catalog.
#[derive(Debug, Parser)]
#[command(name = "scriptdeck", version)]
pub struct Cli {
    /// State directory (defaults to $SCRIPTDECK_HOME or ~/.scriptdeck).
    #[arg(long = "home", value_name = "DIR", global = true)]
    pub home: Option<PathBuf>,

    /// Script catalog (defaults to <home>/scripts.json).
    #[arg(long = "catalog", value_name = "PATH", global = true)]
    pub catalog: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Show every script in the catalog with its current state.
    List,
    /// Run scripts in the foreground and wait for them to finish.
    Run {
        #[arg(required = true, value_name = "ID")]
        ids: Vec<String>,
    },
    /// Run every enabled script in the foreground.
    RunAll,
    /// Stop a script left running by an earlier session.
    Stop {
        #[arg(value_name = "ID")]
        id: String,
    },
    /// Stop every script left running by an earlier session.
    StopAll,
    /// Print the persisted run index after reconciling it.
    Status,
}

/// A loaded catalog plus a controller that has already reconciled it.
pub(crate) struct Session {
    pub controller: LifecycleController,
    pub scripts: Vec<ScriptDefinition>,
}

impl Session {
    async fn open(cli: &Cli) -> Result<Self> {
        let home = match &cli.home {
            Some(home) => home.clone(),
            None => find_scriptdeck_home()?,
        };
        let config = LifecycleConfig::load(&home)
            .with_context(|| format!("Failed to load config from {}", home.display()))?;
        let catalog_path = cli
            .catalog
            .clone()
            .unwrap_or_else(|| home.join(CATALOG_FILE));
        let scripts = catalog::load_catalog(&catalog_path)?;

        let index = match config.run_index_path.as_deref() {
            Some(path) => PersistentRunIndex::open(path).unwrap_or_else(|err| {
                warn!(error = %err, "run index unreadable; starting with an empty one");
                PersistentRunIndex::in_memory()
            }),
            None => PersistentRunIndex::in_memory(),
        };

        let controller = LifecycleController::new(config, index);
        controller.reconcile_on_startup(&scripts).await;
        Ok(Self {
            controller,
            scripts,
        })
    }
}

pub async fn run_main(cli: Cli) -> Result<ExitCode> {
    let session = Session::open(&cli).await?;
    match cli.command {
        Command::List => status_cmd::list(&session),
        Command::Status => status_cmd::status(&session),
        Command::Run { ids } => {
            let selected = catalog::select(&session.scripts, &ids)?;
            let selected: Vec<ScriptDefinition> = selected.into_iter().cloned().collect();
            run_cmd::run_foreground(&session, selected).await
        }
        Command::RunAll => {
            let enabled: Vec<ScriptDefinition> = session
                .scripts
                .iter()
                .filter(|script| script.is_enabled)
                .cloned()
                .collect();
            run_cmd::run_foreground(&session, enabled).await
        }
        Command::Stop { id } => status_cmd::stop(&session, &id).await,
        Command::StopAll => status_cmd::stop_all(&session).await,
    }
}
