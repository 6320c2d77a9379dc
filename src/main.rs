//! Thin CLI wiring for the agent execution platform core. The HTTP
//! router, SSE endpoints, and API-key issuance that front this core in a
//! full deployment are out of scope; this binary only runs the Platform
//! Bridge standalone and offers a few operator commands.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ling_core::bridge::{BridgeComponents, BridgeServer};
use ling_core::chat_history::ChatHistoryStore;
use ling_core::config::Config;
use ling_core::doc_store::ProfileDocumentStore;
use ling_core::docker::{BollardRuntime, DockerRuntime};
use ling_core::image_cache::ImageCache;
use ling_core::kit::KitStore;
use ling_core::llm::GatewayClient;
use ling_core::module::ModuleRegistry;
use ling_core::provides::ProvidesGraph;
use ling_core::warm_pool::WarmContainerPool;
use ling_core::workspace_store::WorkspaceStore;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "ling-core", version)]
#[command(about = "Multi-tenant agent execution platform core", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the Platform Bridge and background sweepers in the foreground.
    Serve,
    /// Check storage paths, the encryption key, and Docker connectivity.
    Doctor,
    /// Manage kits in the Kit Store.
    Kit {
        #[command(subcommand)]
        action: KitAction,
    },
}

#[derive(Subcommand, Debug)]
enum KitAction {
    /// Upload a kit archive (.zip) from a local path.
    Upload {
        archive_path: PathBuf,
        #[arg(long, default_value_t = false)]
        overwrite: bool,
    },
    /// List versions of a kit.
    List { owner: String, kit_id: String },
    /// Delete one version of a kit.
    Delete {
        owner: String,
        kit_id: String,
        version: String,
    },
    /// Download and ingest a kit from the configured registry.
    Fetch {
        owner: String,
        kit_id: String,
        version: String,
        #[arg(long, default_value_t = false)]
        overwrite: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let (config, config_path) = Config::load_with_path().unwrap_or_else(|e| {
        eprintln!("Warning: failed to load config, using defaults: {e}");
        (Config::default(), None)
    });

    let cli = Cli::parse();

    match cli.cmd {
        Command::Doctor => run_doctor(&config, config_path.as_deref()).await,
        Command::Kit { action } => run_kit(&config, action).await,
        Command::Serve => run_serve(config, config_path).await,
    }
}

fn kit_store(config: &Config) -> KitStore {
    KitStore::new(config.storage.kits_dir.clone())
}

async fn run_kit(config: &Config, action: KitAction) -> Result<()> {
    let store = kit_store(config);
    match action {
        KitAction::Upload { archive_path, overwrite } => {
            let bytes = std::fs::read(&archive_path)
                .with_context(|| format!("reading {archive_path:?}"))?;
            let kit = store.upload(&bytes, overwrite)?;
            println!("uploaded {}/{}@{}", kit.owner, kit.kit_id, kit.semver);
        }
        KitAction::List { owner, kit_id } => {
            for version in store.list_versions(&owner, &kit_id)? {
                println!("{version}");
            }
        }
        KitAction::Delete { owner, kit_id, version } => {
            store.delete(&owner, &kit_id, &version)?;
            println!("deleted {owner}/{kit_id}@{version}");
        }
        KitAction::Fetch { owner, kit_id, version, overwrite } => {
            let registry_url = config
                .registry_url
                .as_deref()
                .context("REGISTRY_URL is not configured")?;
            let kit = store
                .fetch_from_registry(registry_url, &owner, &kit_id, &version, overwrite)
                .await?;
            println!("fetched {}/{}@{}", kit.owner, kit.kit_id, kit.semver);
        }
    }
    Ok(())
}

async fn run_doctor(config: &Config, config_path: Option<&std::path::Path>) -> Result<()> {
    println!("ling-core doctor");
    println!("  config file: {}", config_path.map(|p| p.display().to_string()).unwrap_or_else(|| "(defaults)".into()));
    println!("  storage home: {}", ling_core::paths::core_home().display());

    for (label, dir) in [
        ("kits", &config.storage.kits_dir),
        ("workspace seeds", &config.storage.workspace_seeds_dir),
        ("workspaces", &config.storage.workspaces_dir),
        ("venvs", &config.storage.venvs_dir),
        ("db", &config.storage.db_dir),
    ] {
        match std::fs::create_dir_all(dir) {
            Ok(()) => println!("  {label} dir ok: {}", dir.display()),
            Err(e) => println!("  {label} dir FAILED ({}): {e}", dir.display()),
        }
    }

    match config.require_encryption_key() {
        Ok(_) => println!("  ENV_ENCRYPTION_KEY: present and valid"),
        Err(e) => println!("  ENV_ENCRYPTION_KEY: FAILED ({e})"),
    }

    match BollardRuntime::connect() {
        Ok(docker) => match docker.image_exists("scratch").await {
            Ok(_) => println!("  docker: reachable"),
            Err(e) => println!("  docker: connected but unresponsive ({e})"),
        },
        Err(e) => println!("  docker: FAILED ({e})"),
    }

    Ok(())
}

/// Wires every component together and serves the Platform Bridge plus
/// the Warm Container Pool's idle sweeper until interrupted.
async fn run_serve(config: Config, config_path: Option<PathBuf>) -> Result<()> {
    let log_dir = ling_core::logging::setup_tracing_with_settings(ling_core::logging::LoggingSettings {
        level: config.logging.level.as_deref(),
        directory: config.logging.directory.as_deref(),
        retention_days: config.logging.retention_days,
    })
    .map_err(|e| anyhow::anyhow!("failed to initialize logging: {e}"))?;

    tracing::info!(?config_path, log_dir = %log_dir.display(), "starting ling-core");

    let encryption_key = config.require_encryption_key()?;
    let db = ling_core::db::open(&config.storage.db_dir)?;

    let docker: Arc<dyn DockerRuntime> = Arc::new(BollardRuntime::connect()?);
    let kit_store = Arc::new(kit_store(&config));
    let workspace_store = Arc::new(WorkspaceStore::new(config.storage.workspaces_dir.clone()));
    let modules = Arc::new(ModuleRegistry::new(
        Arc::clone(&db),
        Arc::clone(&kit_store),
        Arc::clone(&workspace_store),
        encryption_key,
        config.storage.workspace_seeds_dir.clone(),
    )?);
    let provides = Arc::new(ProvidesGraph::new(Arc::clone(&db))?);
    let chat_history = Arc::new(ChatHistoryStore::new(Arc::clone(&db))?);
    let doc_store = Arc::new(ProfileDocumentStore::new(Arc::clone(&db))?);
    let image_cache = Arc::new(ImageCache::new(Arc::clone(&docker)));
    let warm_pool = Arc::new(WarmContainerPool::new(
        Arc::clone(&docker),
        Duration::from_secs(config.warm_pool.idle_timeout_secs),
    ));
    let gateway = Arc::new(GatewayClient::new(
        config.base_url.clone().unwrap_or_else(|| "http://127.0.0.1:11434/v1".to_string()),
        std::env::var("LLM_API_KEY").ok(),
        std::env::var("LLM_DEFAULT_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
    ));

    warm_pool.spawn_sweeper(Duration::from_secs(config.warm_pool.sweep_interval_secs));

    // The Agent Runner is invoked per profile call by the router that sits
    // in front of this core (out of scope here, §1); `serve` only stands
    // up the Bridge those runs call back into.

    let components = Arc::new(BridgeComponents {
        modules,
        provides,
        workspace_store,
        chat_history,
        doc_store,
        warm_pool,
        image_cache,
        gateway,
    });

    let server = BridgeServer::new(components, config.bridge.clone());
    server.serve().await?;
    Ok(())
}
