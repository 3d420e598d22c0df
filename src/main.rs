//! # Harvest CLI (`harvest`)
//!
//! Thin command-line front end over the connector registry.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `harvest init` | Create the SQLite database and schema |
//! | `harvest types` | List registered connector types and their config fields |
//! | `harvest list` | List configured connector instances |
//! | `harvest create <type>` | Validate and persist a new connector instance |
//! | `harvest delete <id>` | Delete a connector instance |
//! | `harvest sync <id\|all>` | Run an incremental harvesting pass |
//!
//! Logs go to stderr (filter with `RUST_LOG`); command output goes to stdout.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use doc_harvester::config;
use doc_harvester::ingest::{self, SyncOutcome};
use doc_harvester::migrate;
use doc_harvester::registry::ConnectorRegistry;

/// Harvest: pull documents from configured content sources into the index.
#[derive(Parser)]
#[command(
    name = "harvest",
    about = "Discover connectors, manage instances, and incrementally sync documents",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/harvest.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// List connector types and the configuration fields they expect.
    Types,

    /// List configured connector instances.
    List,

    /// Create a connector instance.
    ///
    /// The configuration is validated, including a live connectivity
    /// check, before anything is stored.
    Create {
        /// Connector type name (see `harvest types`).
        type_name: String,

        /// Configuration value as `key=value`. Repeatable.
        #[arg(long = "set", value_parser = parse_key_val)]
        settings: Vec<(String, String)>,

        /// Full configuration as a JSON object. `--set` values are merged on top.
        #[arg(long)]
        config_json: Option<String>,
    },

    /// Delete a connector instance.
    Delete {
        /// Connector instance id.
        id: i64,
    },

    /// Run one incremental harvesting pass.
    Sync {
        /// Connector instance id, or `all`.
        target: String,
    },
}

/// Parse a `key=value` pair for `--set` arguments.
fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("invalid KEY=VALUE: no '=' found in '{}'", s))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

fn build_config_payload(
    config_json: Option<String>,
    settings: Vec<(String, String)>,
) -> anyhow::Result<Value> {
    let mut map = match config_json {
        Some(raw) => match serde_json::from_str::<Value>(&raw).context("--config-json is not valid JSON")? {
            Value::Object(map) => map,
            _ => bail!("--config-json must be a JSON object"),
        },
        None => Map::new(),
    };
    for (key, value) in settings {
        map.insert(key, Value::String(value));
    }
    Ok(Value::Object(map))
}

fn print_outcome(outcome: &SyncOutcome, type_name: &str) {
    let r = &outcome.report;
    println!("sync {} ({})", outcome.instance_id, type_name);
    println!("  containers: {}", r.containers);
    println!("  listed: {}", r.listed);
    println!("  candidates: {}", r.candidates);
    println!("  fed: {}", r.fed);
    if !r.is_clean() {
        println!("  failed workers: {}", r.failures.len());
    }
    match outcome.advanced_to {
        Some(ts) => println!("  watermark: {}", ts.to_rfc3339()),
        None => println!("  watermark: unchanged"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Types => {
            let registry = ConnectorRegistry::from_config(&cfg).await?;
            println!("{:<16} {:<20} FIELDS", "TYPE", "DISPLAY NAME");
            for t in registry.types().await? {
                let fields: Vec<String> = t
                    .config_fields
                    .iter()
                    .map(|f| {
                        if f.required {
                            format!("{}*", f.name)
                        } else {
                            f.name.clone()
                        }
                    })
                    .collect();
                println!("{:<16} {:<20} {}", t.name, t.display_name, fields.join(", "));
            }
            registry.pool().close().await;
        }
        Commands::List => {
            let registry = ConnectorRegistry::from_config(&cfg).await?;
            println!("{:<6} {:<16} {:<26} LAST SYNC", "ID", "TYPE", "CREATED");
            for instance in registry.list().await? {
                let last = instance
                    .last_synced_at()
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "never".to_string());
                println!(
                    "{:<6} {:<16} {:<26} {}",
                    instance.id(),
                    instance.type_name(),
                    instance.created_at().to_rfc3339(),
                    last
                );
            }
            for broken in registry.list_unloadable().await? {
                println!(
                    "{:<6} {:<16} {:<26} unloadable: {}",
                    broken.id, broken.type_name, "-", broken.reason
                );
            }
            registry.pool().close().await;
        }
        Commands::Create {
            type_name,
            settings,
            config_json,
        } => {
            let payload = build_config_payload(config_json, settings)?;
            let registry = ConnectorRegistry::from_config(&cfg).await?;
            let instance = registry.create(&type_name, payload).await?;
            println!(
                "created connector {} ({})",
                instance.id(),
                instance.type_name()
            );
            registry.pool().close().await;
        }
        Commands::Delete { id } => {
            let registry = ConnectorRegistry::from_config(&cfg).await?;
            registry.delete(id).await?;
            println!("deleted connector {}", id);
            registry.pool().close().await;
        }
        Commands::Sync { target } => {
            let registry = ConnectorRegistry::from_config(&cfg).await?;
            sync(&registry, &target).await?;
            registry.pool().close().await;
        }
    }

    Ok(())
}

async fn sync(registry: &ConnectorRegistry, target: &str) -> anyhow::Result<()> {
    if target == "all" {
        let results = ingest::sync_all(registry).await?;
        let total = results.len();
        let mut failed = 0;
        for (id, result) in results {
            match result {
                Ok(outcome) => {
                    let type_name = registry.get(id).await?.type_name().to_string();
                    print_outcome(&outcome, &type_name);
                }
                Err(e) => {
                    failed += 1;
                    println!("sync {} failed: {}", id, e);
                }
            }
        }
        if failed > 0 {
            bail!("{} of {} syncs failed", failed, total);
        }
    } else {
        let id: i64 = target
            .parse()
            .with_context(|| format!("expected an instance id or 'all', got '{}'", target))?;
        let outcome = ingest::sync_instance(registry, id).await?;
        let instance = registry.get(id).await?;
        print_outcome(&outcome, instance.type_name());
    }
    println!("ok");
    Ok(())
}
