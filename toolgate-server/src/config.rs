use std::path::PathBuf;

use anyhow::{bail, Result};

use crate::Cli;

/// Fully resolved server settings. Command-line flags win over
/// environment variables; the policy path is the only setting with
/// neither a default nor a fallback.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub policy_path: PathBuf,
    pub audit_log: PathBuf,
    pub webhook_url: Option<String>,
    pub caller: String,
    pub check_only: bool,
}

impl ServerConfig {
    pub fn resolve(cli: Cli) -> Result<Self> {
        let policy_path = match cli.policy.or_else(|| env_path("TOOLGATE_POLICY")) {
            Some(path) => path,
            None => bail!("no policy file given; pass --policy or set TOOLGATE_POLICY"),
        };
        let audit_log = cli
            .audit_log
            .or_else(|| env_path("TOOLGATE_AUDIT_LOG"))
            .unwrap_or_else(|| PathBuf::from("logs/audit.jsonl"));
        let webhook_url = cli
            .webhook_url
            .or_else(|| non_empty_env("TOOLGATE_WEBHOOK_URL"));
        let caller = cli
            .caller
            .or_else(|| non_empty_env("TOOLGATE_CALLER"))
            .unwrap_or_else(|| "local".to_string());

        Ok(Self {
            policy_path,
            audit_log,
            webhook_url,
            caller,
            check_only: cli.check,
        })
    }
}

fn env_path(key: &str) -> Option<PathBuf> {
    non_empty_env(key).map(PathBuf::from)
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.is_empty())
}
