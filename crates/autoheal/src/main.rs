//! autoheal CLI
//!
//! Runs the orchestrator (alert intake, dispatch, audit), the node agent
//! (execution lock + action registry), and a few operator tools.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use autoheal::audit::{AuditRecord, AuditSink, AuditStatus, JsonlAuditSink, MemoryAuditSink};
use autoheal::config::AutohealConfig;
use autoheal::dispatch::{DispatchCoordinator, HttpTransport};
use autoheal::executor::{CommandRunner, LockFile, NodeExecutor, ScriptedRunner, SystemRunner};
use autoheal::prometheus::{PrometheusClient, PrometheusConfig};
use autoheal::selector::ActionSelector;
use autoheal::server;
use autoheal::types::{ActionKind, AttemptStatus, ExecuteRequest};
use notify::Notifier;

/// Auto-heal orchestrator: turns node health alerts into bounded, audited remediations
#[derive(Parser)]
#[command(name = "autoheal")]
#[command(about = "Auto-heal orchestrator: turns node health alerts into bounded, audited remediations")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the JSON config file (defaults apply when omitted)
    #[arg(long, env = "AUTOHEAL_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, default_value = "text", global = true)]
    log_format: LogFormat,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Clone, Copy, Default, clap::ValueEnum)]
enum LogFormat {
    Json,
    #[default]
    Text,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the orchestrator HTTP server
    Serve {
        /// Listen address (overrides server.listen)
        #[arg(long, env = "AUTOHEAL_LISTEN")]
        listen: Option<String>,

        /// Prometheus URL for CPU telemetry (overrides telemetry.prometheus_url)
        #[arg(long, env = "PROMETHEUS_URL")]
        prometheus_url: Option<String>,

        /// Slack incoming webhook
        #[arg(long, env = "SLACK_WEBHOOK_URL")]
        slack_webhook_url: Option<String>,

        /// Generic JSON webhook for remediation outcomes
        #[arg(long, env = "NOTIFY_WEBHOOK_URL")]
        notify_webhook_url: Option<String>,

        /// Disable outcome notifications
        #[arg(long, env = "NOTIFY_DISABLED")]
        notify_disabled: bool,
    },

    /// Run the node agent HTTP server
    Agent {
        /// Id of this node as it appears in alerts
        #[arg(long, env = "AUTOHEAL_NODE_ID")]
        node_id: Option<String>,

        /// Listen address (overrides server.agent_listen)
        #[arg(long, env = "AUTOHEAL_AGENT_LISTEN")]
        listen: Option<String>,
    },

    /// Normalize an alert payload and print the decision
    Normalize {
        /// File holding the raw payload (`-` for stdin)
        file: PathBuf,
    },

    /// Run one action on this node through the executor
    Execute {
        /// Action name (reboot, restart_service, clear_cache, cleanup_disk, diagnostics, noop)
        action: String,

        /// Service to restart (restart_service only)
        #[arg(long)]
        service: Option<String>,

        /// Node id recorded in the audit trail
        #[arg(long, env = "AUTOHEAL_NODE_ID", default_value = "localhost")]
        node_id: String,

        /// Record commands instead of running them
        #[arg(long)]
        dry_run: bool,
    },

    /// Print audit records
    Audit {
        /// Only records for this node
        #[arg(long)]
        node: Option<String>,

        /// Print raw JSON lines
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format, cli.verbose);

    let config = AutohealConfig::load_or_default(cli.config.as_deref())
        .context("Failed to load configuration")?;

    match cli.command {
        Commands::Serve {
            listen,
            prometheus_url,
            slack_webhook_url,
            notify_webhook_url,
            notify_disabled,
        } => {
            let notifier = if notify_disabled {
                info!("Notifications disabled");
                Notifier::disabled()
            } else {
                Notifier::from_urls(slack_webhook_url, notify_webhook_url)
            };
            run_orchestrator(&config, listen, prometheus_url, notifier).await
        }
        Commands::Agent { node_id, listen } => run_agent(&config, node_id, listen).await,
        Commands::Normalize { file } => run_normalize(&config, &file),
        Commands::Execute {
            action,
            service,
            node_id,
            dry_run,
        } => run_execute(&config, &action, service.as_deref(), &node_id, dry_run).await,
        Commands::Audit { node, json } => run_audit(&config, node.as_deref(), json).await,
    }
}

fn init_tracing(format: LogFormat, verbose: bool) {
    let default_filter = if verbose {
        "autoheal=debug,notify=debug,tower_http=debug"
    } else {
        "autoheal=info,notify=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

async fn run_orchestrator(
    config: &AutohealConfig,
    listen: Option<String>,
    prometheus_url: Option<String>,
    notifier: Notifier,
) -> Result<()> {
    let audit = Arc::new(
        JsonlAuditSink::open(&config.audit.path)
            .await
            .context("Failed to open audit trail")?,
    );
    if config.nodes.is_empty() {
        warn!("Node inventory is empty; every dispatch will fail with NodeNotFound");
    }
    let transport = HttpTransport::new(config.inventory(), config.transport_timeout())
        .context("Failed to build node transport")?;

    let mut coordinator = DispatchCoordinator::new(
        ActionSelector::new(config.selector_settings()),
        Arc::new(transport),
        audit,
    )
    .with_backoff(config.remediation.backoff)
    .with_auto_healing(config.remediation.auto_healing_enabled)
    .with_notifier(Arc::new(notifier));

    let prometheus = match prometheus_url {
        Some(url) => Some(PrometheusConfig {
            base_url: url,
            node_label: config.telemetry.node_label.clone(),
            ..PrometheusConfig::default()
        }),
        None => config.prometheus(),
    };
    if let Some(prometheus) = prometheus {
        info!(url = %prometheus.base_url, "CPU telemetry refinement enabled");
        coordinator = coordinator.with_telemetry(Arc::new(PrometheusClient::new(prometheus)));
    }
    if !config.remediation.auto_healing_enabled {
        warn!("Auto-healing disabled: decisions are recorded, nothing is executed");
    }

    let recovered = coordinator
        .recover()
        .await
        .context("Failed to recover audit trail")?;
    if !recovered.is_empty() {
        warn!(records = recovered.len(), "Resolved remediations left unfinished by a previous run");
    }

    let addr = listen.unwrap_or_else(|| config.server.listen.clone());
    server::serve(server::orchestrator_router(Arc::new(coordinator)), &addr, "orchestrator").await
}

async fn run_agent(config: &AutohealConfig, node_id: Option<String>, listen: Option<String>) -> Result<()> {
    let node_id = match node_id.or_else(|| std::env::var("HOSTNAME").ok()) {
        Some(id) if !id.trim().is_empty() => id,
        _ => bail!("No node id: pass --node-id or set AUTOHEAL_NODE_ID"),
    };

    let lock = config.lock_file();
    ensure_parent(lock.path())?;
    let audit = Arc::new(
        JsonlAuditSink::open(&config.audit.path)
            .await
            .context("Failed to open audit trail")?,
    );
    let executor = NodeExecutor::new(
        node_id.clone(),
        lock,
        Arc::new(SystemRunner),
        config.executor_settings(),
        audit,
    );

    info!(node_id = %node_id, "Node agent starting");
    let addr = listen.unwrap_or_else(|| config.server.agent_listen.clone());
    server::serve(server::agent_router(Arc::new(executor)), &addr, "agent").await
}

fn run_normalize(config: &AutohealConfig, file: &Path) -> Result<()> {
    let body = if file == Path::new("-") {
        std::io::read_to_string(std::io::stdin()).context("Failed to read stdin")?
    } else {
        std::fs::read_to_string(file).with_context(|| format!("Failed to read {}", file.display()))?
    };

    let alert = match autoheal::normalize_body(&body) {
        Ok(alert) => alert,
        Err(e) => {
            eprintln!("{} {e}", "✗".red());
            bail!("alert could not be normalized");
        }
    };
    let action = ActionSelector::new(config.selector_settings()).select(&alert);

    eprintln!(
        "{} {} -> {}",
        "✓".green(),
        alert.summary(),
        action.kind.to_string().bold()
    );
    let output = serde_json::json!({ "alert": alert, "decision": action });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn run_execute(
    config: &AutohealConfig,
    action: &str,
    service: Option<&str>,
    node_id: &str,
    dry_run: bool,
) -> Result<()> {
    let Some(kind) = ActionKind::from_hint(action, service) else {
        bail!("Unknown action '{action}' (restart_service needs --service)");
    };

    let (lock, runner, audit): (LockFile, Arc<dyn CommandRunner>, Arc<dyn AuditSink>) = if dry_run {
        let path = std::env::temp_dir().join(format!("autoheal-dry-run-{}.lock", Uuid::new_v4()));
        (
            LockFile::new(path, std::time::Duration::from_secs(config.lock.ttl_secs)),
            Arc::new(ScriptedRunner::new()),
            Arc::new(MemoryAuditSink::new()),
        )
    } else {
        let lock = config.lock_file();
        ensure_parent(lock.path())?;
        let audit = JsonlAuditSink::open(&config.audit.path)
            .await
            .context("Failed to open audit trail")?;
        (lock, Arc::new(SystemRunner), Arc::new(audit))
    };

    let executor = NodeExecutor::new(node_id, lock, runner, config.executor_settings(), audit);
    let request = ExecuteRequest {
        attempt_id: Uuid::new_v4(),
        node_id: node_id.to_string(),
        action: kind.clone(),
        attempt_number: 1,
    };
    let result = executor.execute(&request).await;

    let marker = match result.status {
        AttemptStatus::Succeeded => "✓".green(),
        AttemptStatus::Skipped(_) => "-".yellow(),
        _ => "✗".red(),
    };
    eprintln!("{marker} {kind} {}: {}", result.status, result.detail);
    if dry_run {
        eprintln!("{}", "dry run: no commands were executed".dimmed());
    }
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

async fn run_audit(config: &AutohealConfig, node: Option<&str>, json: bool) -> Result<()> {
    let sink = JsonlAuditSink::open(&config.audit.path)
        .await
        .context("Failed to open audit trail")?;
    let records = match node {
        Some(node) => sink.records_for(node).await,
        None => sink.records().await,
    }
    .context("Failed to read audit trail")?;

    for record in &records {
        if json {
            println!("{}", serde_json::to_string(record)?);
        } else {
            println!("{}", format_record(record));
        }
    }
    if !json {
        eprintln!("{} records", records.len());
    }
    Ok(())
}

fn format_record(record: &AuditRecord) -> String {
    let status = format!("{:?}", record.status);
    let status = match record.status {
        AuditStatus::Succeeded => status.green(),
        AuditStatus::Failed | AuditStatus::TimedOut | AuditStatus::Fatal => status.red(),
        AuditStatus::Skipped | AuditStatus::Dropped | AuditStatus::StaleLockReclaimed => status.yellow(),
        _ => status.normal(),
    };
    let action = record
        .action_kind
        .as_ref()
        .map_or_else(|| "-".to_string(), ToString::to_string);
    format!(
        "{} {:<12} {:<28} #{:<2} {:<20} {}",
        record.timestamp.format("%Y-%m-%d %H:%M:%S"),
        record.node_id,
        action,
        record.attempt_number,
        status,
        record.detail
    )
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }
    Ok(())
}
