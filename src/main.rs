use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use coord_kernel::cancel::CooperativeCancellationToken;
use coord_kernel::config::{ConfigLoader, CoordinationConfig, StoreBackend};
use coord_kernel::coordinator::{CoordinationManager, CreateMode};
use coord_kernel::path::Path as EntryPath;
use coord_kernel::store::{EntryStore, FileEntryStore, FileSessionStore, MemEntryStore, MemSessionStore, SessionStore};

/// Demo harness for the coordination kernel: starts one session over a
/// chosen store backend and runs a single operation against it.
#[derive(Parser, Debug)]
#[command(name = "coord-kernel", version, about = "Hierarchical lease-based coordination kernel", long_about = None)]
struct Cli {
    /// Optional config file path (JSON). Falls back to the user/project
    /// config precedence (see `ConfigLoader`) when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Transport-level address identifying this process's session.
    #[arg(long, default_value = "local-cli")]
    address: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a new entry (fails if it already exists).
    Create {
        path: String,
        #[arg(long, default_value = "")]
        value: String,
        #[arg(long)]
        ephemeral: bool,
    },
    /// Fetch an entry's current record.
    Get { path: String },
    /// Overwrite an entry's value.
    SetValue {
        path: String,
        value: String,
        #[arg(long, default_value_t = 0)]
        expected_version: u64,
    },
    /// Delete an entry.
    Delete {
        path: String,
        #[arg(long, default_value_t = 0)]
        expected_version: u64,
        #[arg(long)]
        recursive: bool,
    },
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let project_root = std::env::current_dir().context("failed to read current directory")?;
    let user_cfg_path = cli.config.or_else(ConfigLoader::default_user_config_path);
    let loader = ConfigLoader::new(user_cfg_path);
    let config = loader
        .load_for_project(&project_root)
        .context("failed to load coordination config")?;

    let (entry_store, session_store): (Arc<dyn EntryStore>, Arc<dyn SessionStore>) = match config.store_backend {
        StoreBackend::Memory => (Arc::new(MemEntryStore::new()), Arc::new(MemSessionStore::new())),
        StoreBackend::File => {
            std::fs::create_dir_all(&config.store_dir)
                .with_context(|| format!("failed to create store directory {}", config.store_dir.display()))?;
            (
                Arc::new(FileEntryStore::new(config.store_dir.join("entries.json"))),
                Arc::new(FileSessionStore::new(config.store_dir.join("sessions.json"))),
            )
        }
    };

    let manager = CoordinationManager::start(
        CoordinationConfig::into_settings(config),
        entry_store,
        session_store,
        cli.address.into_bytes(),
    )
    .await
    .map_err(|e| anyhow::anyhow!("failed to start coordination manager: {e}"))?;

    let cancel = CooperativeCancellationToken::new();

    match cli.command {
        Command::Create { path, value, ephemeral } => {
            let path = EntryPath::parse(&path).context("malformed path")?;
            let mode = if ephemeral { CreateMode::Ephemeral } else { CreateMode::Default };
            let entry = manager
                .create(&path, value.into_bytes(), mode, &cancel)
                .await
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            println!("created {} at version {}", entry.path, entry.version);
        }
        Command::Get { path } => {
            let path = EntryPath::parse(&path).context("malformed path")?;
            match manager.get(&path, &cancel).await.map_err(|e| anyhow::anyhow!("{e}"))? {
                Some(entry) => println!(
                    "{} version={} value={:?} children={:?}",
                    entry.path,
                    entry.version,
                    String::from_utf8_lossy(&entry.value),
                    entry.children
                ),
                None => println!("{path} not found"),
            }
        }
        Command::SetValue { path, value, expected_version } => {
            let path = EntryPath::parse(&path).context("malformed path")?;
            let new_version = manager
                .set_value(&path, value.into_bytes(), expected_version, &cancel)
                .await
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            println!("{path} now at version {new_version}");
        }
        Command::Delete { path, expected_version, recursive } => {
            let path = EntryPath::parse(&path).context("malformed path")?;
            let deleted_version = manager
                .delete(&path, expected_version, recursive, &cancel)
                .await
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            if deleted_version == 0 {
                println!("{path} was already absent");
            } else {
                println!("deleted {path} (was at version {deleted_version})");
            }
        }
    }

    Ok(())
}
