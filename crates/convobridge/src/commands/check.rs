//! `convobridge check-config`: validate a config file and print a summary.

use std::path::Path;

use anyhow::{Result, bail};
use serde::Serialize;

use convobridge::config::Config;

// ============================================================================
// Summary Types
// ============================================================================

#[derive(Debug, Serialize)]
struct TenantSummary {
    id: String,
    display_name: String,
    console: String,
    inbox: String,
    subscriptions: usize,
}

#[derive(Debug, Serialize)]
struct Summary {
    config_file: Option<String>,
    listen: String,
    api_token: bool,
    sidecar_url: String,
    poll_interval_seconds: u64,
    notify_interval_seconds: u64,
    pairing_expiry_seconds: u64,
    max_pairing_attempts: u32,
    idempotency_ttl_seconds: u64,
    tenants: Vec<TenantSummary>,
    warnings: Vec<String>,
}

impl Summary {
    fn new(config: &Config, config_file: Option<String>) -> Self {
        let mut warnings = Vec::new();
        if config_file.is_none() {
            warnings.push("config file not found, using defaults".to_string());
        }
        if config.tenants.is_empty() {
            warnings.push("no tenants configured".to_string());
        }
        if config.server.api_token.is_none() {
            warnings.push("no server.api_token, API restricted to loopback clients".to_string());
        }

        let tenants = config
            .tenants
            .iter()
            .map(|t| TenantSummary {
                id: t.id.clone(),
                display_name: t.display_name.clone().unwrap_or_else(|| t.id.clone()),
                console: format!("{} (account {})", t.console.base_url, t.console.account_id),
                inbox: t.console.inbox_name.clone(),
                subscriptions: t.subscriptions.len(),
            })
            .collect();

        Self {
            config_file,
            listen: format!("{}:{}", config.server.host, config.server.port),
            api_token: config.server.api_token.is_some(),
            sidecar_url: config.transport.sidecar_url.clone(),
            poll_interval_seconds: config.reliability.poll_interval_seconds,
            notify_interval_seconds: config.reliability.notify_interval_seconds,
            pairing_expiry_seconds: config.reliability.pairing_expiry_seconds,
            max_pairing_attempts: config.reliability.max_pairing_attempts,
            idempotency_ttl_seconds: config.cache.idempotency.ttl_seconds,
            tenants,
            warnings,
        }
    }

    fn print_text(&self) {
        match &self.config_file {
            Some(path) => println!("Config: {path}"),
            None => println!("Config: (defaults)"),
        }
        println!("Listen: {}", self.listen);
        println!("Sidecar: {}", self.sidecar_url);
        println!(
            "Reliability: poll {}s, notify {}s, pairing expiry {}s, {} attempts",
            self.poll_interval_seconds,
            self.notify_interval_seconds,
            self.pairing_expiry_seconds,
            self.max_pairing_attempts
        );
        println!("Idempotency TTL: {}s", self.idempotency_ttl_seconds);
        println!("Tenants: {}", self.tenants.len());
        for tenant in &self.tenants {
            println!(
                "  - {} ({}): {}, inbox '{}', {} subscriptions",
                tenant.id, tenant.display_name, tenant.console, tenant.inbox, tenant.subscriptions
            );
        }
        for warning in &self.warnings {
            println!("warning: {warning}");
        }
    }
}

pub async fn run(config_path: &str, format: &str) -> Result<()> {
    if format != "text" && format != "json" {
        bail!("unknown format '{format}' (expected text or json)");
    }

    let config = Config::load(config_path).await?;
    let config_file = Path::new(config_path)
        .exists()
        .then(|| config_path.to_string());
    let summary = Summary::new(&config, config_file);

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        summary.print_text();
    }
    Ok(())
}
