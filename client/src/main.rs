//! tally-sync - interactive settings sync client.
//!
//! Runs one settings instance against a remote authority and reads commands
//! from stdin. Useful for exercising the sync protocol by hand: start two
//! copies on the same storage directory and watch them converge.

use std::sync::Arc;

use serde_json::Value;
use tally_client::{
    DurableStorage, FileStorage, HttpAuthority, MemoryStorage, SettingsHandle, SyncBuilder,
    SyncConfig,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const HELP: &str = "\
commands:
  get <field>           print a field
  set <field> <value>   change a field (JSON, or a bare string)
  show                  print the whole document
  online | offline      report reachability
  sync                  reconcile now
  reset                 reset every field to its default
  status                print sync status
  quit                  back up pending changes and exit";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tally_client=info,tally_sync=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = SyncConfig::from_env()?;
    let remote = HttpAuthority::new(config.require_remote_url()?);

    let storage: Arc<dyn DurableStorage> = match &config.storage_dir {
        Some(dir) => {
            tracing::info!(dir = %dir.display(), "Using file storage");
            let storage = FileStorage::open_shared(dir)?;
            // Other processes on the same directory are seen by polling
            storage.watch(config.storage_poll);
            storage
        }
        None => {
            tracing::info!("Using in-memory storage, nothing survives exit");
            MemoryStorage::new_shared()
        }
    };

    tracing::info!(remote = %remote.base_url(), "Starting settings sync");

    let settings = SyncBuilder::new(remote, storage).config(config).spawn();

    println!("{}", HELP);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if !run_command(&settings, line.trim()).await {
            break;
        }
    }

    settings.shutdown().await?;
    Ok(())
}

/// Run one REPL command. Returns false when the session should end.
async fn run_command(settings: &SettingsHandle, line: &str) -> bool {
    let mut parts = line.splitn(3, char::is_whitespace);
    let command = parts.next().unwrap_or_default();
    let field = parts.next();
    let raw = parts.next().map(str::trim);

    let result = match (command, field, raw) {
        ("", _, _) => Ok(()),
        ("get", Some(field), None) => {
            match settings.get_field(field) {
                Some(value) => println!("{} = {}", field, value),
                None => println!("{} is not set", field),
            }
            Ok(())
        }
        ("set", Some(field), Some(raw)) => {
            // Bare words are strings so `set theme dark` works
            let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
            settings
                .record_change(field, value)
                .await
                .map(|timestamp| println!("{} stamped at {}", field, timestamp))
        }
        ("show", None, None) => {
            for (field, value) in settings.snapshot().values() {
                println!("{} = {}", field, value);
            }
            Ok(())
        }
        ("online", None, None) => settings.set_reachable(true),
        ("offline", None, None) => settings.set_reachable(false),
        ("sync", None, None) => settings.request_sync(),
        ("reset", None, None) => settings.reset_to_defaults().await,
        ("status", None, None) => {
            match serde_json::to_string_pretty(&settings.status()) {
                Ok(status) => println!("{}", status),
                Err(e) => println!("error: {}", e),
            }
            Ok(())
        }
        ("quit" | "exit", None, None) => return false,
        _ => {
            println!("{}", HELP);
            Ok(())
        }
    };

    if let Err(e) = result {
        println!("error: {}", e);
    }
    true
}
