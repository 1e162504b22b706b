mod config;
mod protocol;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::BufReader;
use tracing::info;
use tracing_subscriber::EnvFilter;

use toolgate_audit::JsonlAuditSink;
use toolgate_engine::ToolEngine;
use toolgate_notify::{NotificationSink, NullNotifier, WebhookNotifier};
use toolgate_policy::PolicyStore;

use config::ServerConfig;

/// Policy-gated tool execution bridge speaking line-delimited JSON on
/// stdin/stdout.
#[derive(Debug, Parser)]
#[command(name = "toolgate-server", version, about)]
pub struct Cli {
    /// Path to the YAML policy file (env: TOOLGATE_POLICY)
    #[arg(long)]
    pub policy: Option<PathBuf>,

    /// Where the JSONL audit trail is written (env: TOOLGATE_AUDIT_LOG)
    #[arg(long)]
    pub audit_log: Option<PathBuf>,

    /// Webhook endpoint for outcome notifications (env: TOOLGATE_WEBHOOK_URL)
    #[arg(long)]
    pub webhook_url: Option<String>,

    /// Caller identity recorded in the audit trail (env: TOOLGATE_CALLER)
    #[arg(long)]
    pub caller: Option<String>,

    /// Validate the policy file and exit without serving
    #[arg(long)]
    pub check: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Diagnostics go to stderr; stdout belongs to the wire protocol.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let config = ServerConfig::resolve(Cli::parse())?;

    let store = Arc::new(PolicyStore::load(&config.policy_path).with_context(|| {
        format!("failed to load policy from {}", config.policy_path.display())
    })?);

    if config.check_only {
        println!("policy OK: {} tools defined", store.snapshot().tool_count());
        return Ok(());
    }

    let audit = Arc::new(JsonlAuditSink::open(&config.audit_log).with_context(|| {
        format!("failed to open audit log at {}", config.audit_log.display())
    })?);

    let notifier: Arc<dyn NotificationSink> = match &config.webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(url.clone())?),
        None => Arc::new(NullNotifier),
    };

    let engine =
        ToolEngine::new(Arc::clone(&store), audit, notifier).with_caller(config.caller.clone());

    info!(
        policy = %config.policy_path.display(),
        audit_log = %config.audit_log.display(),
        webhook = config.webhook_url.is_some(),
        caller = %config.caller,
        tools = store.snapshot().tool_count(),
        "toolgate server ready"
    );

    let stdin = BufReader::new(tokio::io::stdin());
    protocol::serve(&engine, &store, stdin, tokio::io::stdout()).await?;
    Ok(())
}
