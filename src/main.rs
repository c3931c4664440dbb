use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use skein_core::catalog::MemoryCatalog;
use skein_core::config::EngineConfig;
use skein_core::event::EventBus;
use skein_core::secrets::EnvSecrets;
use skein_core::traits::{ActivationStore, ResourceCatalog};
use skein_engine::{Engine, InvokeReply, InvokeRequest};
use skein_store::{MemoryStore, SqliteStore};

#[derive(Parser)]
#[command(name = "skein", version, about = "Declarative agent/skill orchestration engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "skein.toml")]
    config: PathBuf,

    /// Directory of agent/skill definition files (TOML)
    #[arg(short, long, default_value = "definitions")]
    definitions: PathBuf,

    /// SQLite activation store path (in-memory store when omitted)
    #[arg(long)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile an agent's plan and print it
    Plan {
        /// Agent definition name
        agent: String,
        /// Entry point name (first input when omitted)
        #[arg(long)]
        entry: Option<String>,
        #[arg(long, default_value = "shared")]
        project: String,
    },
    /// Invoke an agent and print the terminal response
    Run {
        /// Agent definition name
        agent: String,
        /// JSON payload
        #[arg(long, default_value = "{}")]
        payload: String,
        #[arg(long)]
        entry: Option<String>,
        #[arg(long, default_value = "shared")]
        project: String,
        /// Enqueue asynchronously and print only the activation id
        #[arg(long)]
        detach: bool,
    },
    /// Show effective configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = if cli.config.exists() {
        EngineConfig::load(&cli.config)?
    } else {
        EngineConfig::default()
    };

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Plan {
            agent,
            entry,
            project,
        } => {
            let catalog = load_catalog(&cli.definitions)?;
            let definition = catalog
                .agent(&project, &agent)
                .await?
                .ok_or_else(|| anyhow::anyhow!("agent '{}' not found", agent))?;
            let entry = entry
                .or_else(|| definition.inputs.first().map(|s| s.name.clone()))
                .ok_or_else(|| anyhow::anyhow!("agent '{}' has no inputs", agent))?;

            let plan = skein_plan::compile(&catalog, &definition, &entry).await?;
            println!("{}", serde_json::to_string_pretty(&plan)?);
            Ok(())
        }
        Commands::Run {
            agent,
            payload,
            entry,
            project,
            detach,
        } => {
            let catalog = Arc::new(load_catalog(&cli.definitions)?);
            let store: Arc<dyn ActivationStore> = match cli.db {
                Some(ref path) => Arc::new(SqliteStore::open(path)?),
                None => Arc::new(MemoryStore::new()),
            };
            let engine = Engine::new(
                config,
                catalog,
                store,
                Arc::new(EnvSecrets::new()),
                Arc::new(EventBus::default()),
            );

            let request = InvokeRequest {
                project_id: project,
                name: agent,
                entry_point: entry,
                payload: serde_json::from_str(&payload)?,
                synchronous: !detach,
                ..Default::default()
            };

            match engine.invoke_agent(request).await? {
                InvokeReply::Completed {
                    request_id,
                    status,
                    response,
                } => {
                    info!(request_id = %request_id, status = %status, "Run finished");
                    println!("{}", serde_json::to_string_pretty(&response)?);
                }
                InvokeReply::Accepted { request_id } => {
                    println!("{}", request_id);
                }
            }
            Ok(())
        }
    }
}

fn load_catalog(dir: &PathBuf) -> anyhow::Result<MemoryCatalog> {
    let catalog = MemoryCatalog::new();
    if dir.exists() {
        let count = catalog.load_dir(dir)?;
        info!(count, dir = %dir.display(), "Definitions loaded");
    }
    Ok(catalog)
}
