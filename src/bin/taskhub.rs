use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde_json::{Value, json};
use taskhub::config::{HubConfig, RedisConfig, load_config_from_yaml, load_template_from_yaml};
use taskhub::error::HubResult;
use taskhub::protocol::{Envelope, Inbound};
use taskhub::runtime::context::InMemoryTemplateStore;
use taskhub::runtime::outbound::Outbound;
use taskhub::runtime::redis_storage::RedisKvStore;
use taskhub::runtime::storage::{InMemoryKvStore, KvStore};
use taskhub::runtime::{Hub, Outcome};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdout};
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the hub, reading node messages as JSON lines on stdin
    Serve {
        /// Path to the hub configuration YAML file
        #[arg(long, short)]
        config: Option<PathBuf>,

        /// Redis connection URL (overrides the config file)
        #[arg(long)]
        redis: Option<String>,

        /// Directory containing template YAML files to preload
        #[arg(long)]
        templates: Option<PathBuf>,

        /// Seconds between stale node sweeps
        #[arg(long, default_value_t = 30)]
        reap_interval: u64,
    },

    /// Validate a hub configuration file
    Check {
        #[arg(long, short)]
        config: PathBuf,
    },
}

/// Writes every outbound envelope as one JSON line on stdout.
struct StdoutOutbound {
    out: Mutex<Stdout>,
}

impl StdoutOutbound {
    fn new() -> Self {
        Self {
            out: Mutex::new(tokio::io::stdout()),
        }
    }

    async fn write_line(&self, value: &Value) -> Result<()> {
        let line = serde_json::to_string(value)?;
        let mut out = self.out.lock().await;
        out.write_all(line.as_bytes()).await?;
        out.write_all(b"\n").await?;
        out.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl Outbound for StdoutOutbound {
    async fn send(&self, node_id: &str, envelope: Envelope) -> Result<()> {
        self.write_line(&json!({ "to": node_id, "envelope": envelope })).await
    }
}

fn reply(node_id: &str, result: &HubResult<Outcome>) -> Value {
    match result {
        Ok(outcome) => json!({ "to": node_id, "status": "ok", "result": outcome }),
        Err(e) => json!({
            "to": node_id,
            "status": e.status(),
            "error": e.to_string(),
            "retryable": e.is_retryable(),
        }),
    }
}

fn load_config(path: Option<&Path>) -> Result<HubConfig> {
    match path {
        Some(path) => load_config_from_yaml(&path.display().to_string()),
        None => Ok(HubConfig::default()),
    }
}

fn preload_templates(dir: &Path, store: &InMemoryTemplateStore) {
    info!("Loading templates from: {:?}", dir);
    let Ok(entries) = fs::read_dir(dir) else {
        warn!("Cannot read template directory {}", dir.display());
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if let Some(ext) = path.extension().and_then(|s| s.to_str()) {
            if ext == "yaml" || ext == "yml" {
                match load_template_from_yaml(&path.display().to_string()) {
                    Ok(template) => {
                        info!("Loaded template: {}", template.id);
                        store.insert(template);
                    }
                    Err(e) => error!("Failed to load {}: {:#}", path.display(), e),
                }
            }
        }
    }
}

async fn serve(
    config: HubConfig,
    redis: Option<String>,
    templates: Option<PathBuf>,
    reap_interval: u64,
) -> Result<()> {
    let redis = redis
        .map(|url| RedisConfig {
            url,
            ..RedisConfig::default()
        })
        .or_else(|| config.redis.clone());
    let kv: Arc<dyn KvStore> = match &redis {
        Some(redis) => {
            info!("Using Redis storage: {}", redis.url);
            Arc::new(RedisKvStore::open(&redis.url, redis.prefix.clone())?)
        }
        None => {
            info!("Using in-memory storage");
            Arc::new(InMemoryKvStore::new())
        }
    };

    let template_store = Arc::new(InMemoryTemplateStore::from_templates(config.templates.clone()));
    if let Some(dir) = &templates {
        preload_templates(dir, &template_store);
    }

    let outbound = Arc::new(StdoutOutbound::new());
    let hub = Arc::new(
        Hub::builder(config)
            .store(kv)
            .outbound(outbound.clone())
            .templates(template_store)
            .build()
            .await?,
    );

    let reaper = {
        let hub = hub.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(reap_interval.max(1)));
            loop {
                ticker.tick().await;
                match hub.reap_stale_nodes().await {
                    Ok(reaped) if !reaped.is_empty() => info!(count = reaped.len(), "Reaped stale nodes"),
                    Ok(_) => {}
                    Err(e) => error!("Stale node sweep failed: {}", e),
                }
            }
        })
    };

    info!(hub_id = %hub.hub_id(), "Hub serving on stdin/stdout");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let value: Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                warn!("Unparseable line: {}", e);
                continue;
            }
        };
        let node_id = value
            .get("nodeId")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        // transport-level disconnect notice
        if value.get("disconnect").and_then(Value::as_bool) == Some(true) {
            match hub.unregister(&node_id).await {
                Ok(released) => info!(node_id = %node_id, released = released.len(), "Disconnected"),
                Err(e) => error!(node_id = %node_id, "Unregister failed: {}", e),
            }
            continue;
        }

        let result = match Inbound::from_value(value) {
            Ok(inbound) => hub.handle(inbound).await,
            Err(e) => Err(e),
        };
        outbound.write_line(&reply(&node_id, &result)).await?;
    }

    reaper.abort();
    info!("Input closed, hub stopping.");
    Ok(())
}

fn check(path: &Path) -> Result<()> {
    let config = load_config_from_yaml(&path.display().to_string())?;
    let warnings = config.validate()?;
    let autostarts = config
        .templates
        .iter()
        .filter(|t| t.auto_start.is_some())
        .count();

    println!(
        "hub {}: {} templates, {} autostart",
        config.hub_id,
        config.templates.len(),
        autostarts
    );
    for warning in &warnings {
        println!("warning: {}", warning);
    }
    if config.templates.is_empty() {
        bail!("No templates defined in {}", path.display());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            redis,
            templates,
            reap_interval,
        } => {
            let config = load_config(config.as_deref())?;
            serve(config, redis, templates, reap_interval).await?;
        }
        Commands::Check { config } => check(&config)?,
    }

    Ok(())
}
