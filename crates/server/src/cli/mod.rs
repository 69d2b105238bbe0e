pub mod config_cmd;
pub mod models;
pub mod serve;
pub mod transfer;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use model_store::{Engine, EngineOptions};

use crate::config::AppConfig;

#[derive(Parser)]
#[command(
    name = "omm",
    version,
    about = "Manage, import and export models in a local Ollama model store"
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, clap::Args, Clone)]
pub struct GlobalArgs {
    /// Model store root (default: config, then $OLLAMA_MODELS, then ~/.ollama/models).
    #[arg(long = "models-dir", global = true)]
    pub models_dir: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP API server (default).
    Serve(ServeArgs),

    /// List, show and remove installed models.
    Models(ModelsArgs),

    /// Import a GGUF file into the store.
    Import(ImportArgs),

    /// Export an installed model as a single GGUF file.
    Export(ExportArgs),

    /// Remove unreferenced blobs and stale temporary files.
    Prune,

    /// View / edit configuration.
    Config(ConfigArgs),
}

//  Subcommand argument structs

#[derive(Debug, clap::Args, Clone, Default)]
pub struct ServeArgs {
    /// Listen address.
    #[arg(long, env = "OMM_HOST")]
    pub host: Option<String>,

    /// Listen port.
    #[arg(short, long, env = "OMM_PORT")]
    pub port: Option<u16>,

    /// Skip the start-up prune even if the config enables it.
    #[arg(long)]
    pub no_prune: bool,
}

#[derive(Debug, clap::Args)]
pub struct ModelsArgs {
    #[command(subcommand)]
    pub action: ModelsAction,
}

#[derive(Debug, Subcommand)]
pub enum ModelsAction {
    /// List installed models.
    List,
    /// Show an installed model's manifest and config.
    Show {
        /// Model name, e.g. `llama3:8b`.
        name: String,
    },
    /// Summarise a GGUF file on disk without importing it.
    Inspect {
        /// Path to the GGUF file.
        path: PathBuf,
    },
    /// Remove an installed model.
    Rm {
        /// Model name.
        name: String,
    },
}

#[derive(Debug, clap::Args)]
pub struct ImportArgs {
    /// GGUF file to import.
    pub file: PathBuf,

    /// Model name (default: derived from the file name).
    #[arg(long)]
    pub name: Option<String>,

    /// Replace an existing model with the same name.
    #[arg(long)]
    pub force: bool,
}

#[derive(Debug, clap::Args)]
pub struct ExportArgs {
    /// Installed model name.
    pub model: String,

    /// Destination `.gguf` path.
    pub path: PathBuf,
}

#[derive(Debug, clap::Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Display the current configuration.
    Show,
    /// Set a configuration value.
    Set { key: String, value: String },
}

/// Open the store the way every command does: CLI override, then config.
pub fn open_engine(global: &GlobalArgs, cfg: &AppConfig, prune: bool) -> anyhow::Result<Engine> {
    let root = cfg.resolve_models_dir(global.models_dir.clone());
    let engine = Engine::open(root, EngineOptions { prune_on_open: prune })?;
    Ok(engine)
}

/// Open the store for a one-shot command; no start-up prune.
pub fn open_store(global: &GlobalArgs) -> anyhow::Result<Engine> {
    let cfg = AppConfig::load_or_default()?;
    open_engine(global, &cfg, false)
}
