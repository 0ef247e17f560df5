//! Configuration management for devrack.
//!
//! Services come either from a `devrack.toml` file (settings plus `[[service]]`
//! tables) or from a legacy `commands.json` array of
//! `{script_name, directory, port}` records. Both are turned into
//! `ServiceSpec`s with the command template rendered per port.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;

use crate::process::{ServiceRecord, ServiceSpec};

/// Default command line; `{PORT}` is replaced with each service's port.
pub const DEFAULT_COMMAND_TEMPLATE: &str = "npx wrangler@latest dev --local --port {PORT}";
const PORT_PLACEHOLDER: &str = "{PORT}";

/// Top-level configuration structure corresponding to `devrack.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Command line template shared by services without their own `command`.
    pub command_template: Option<String>,
    /// Scheme and host used to reach services, e.g. `http://127.0.0.1`.
    pub base_url: Option<String>,
    /// Timeout for a single health check, in milliseconds.
    pub probe_timeout_ms: Option<u64>,
    /// How many shutdown notification requests to send per service.
    pub notify_attempts: Option<u32>,
    /// Delay between shutdown notification attempts, in milliseconds.
    pub notify_delay_ms: Option<u64>,
    /// Timeout for a single shutdown notification request, in milliseconds.
    pub notify_timeout_ms: Option<u64>,
    /// Whether shutdown notifications go out before or after terminating.
    pub notify_order: Option<NotifyOrder>,
    /// Maximum number of lines to keep in memory per service.
    pub max_lines: Option<usize>,
    /// Run commands through the platform shell (default: true).
    pub shell: Option<bool>,
    /// Remove ANSI escape sequences from service output.
    pub strip_ansi: Option<bool>,
    /// Services to supervise, in display order.
    #[serde(rename = "service", default)]
    pub services: Vec<ServiceConfig>,
}

/// Configuration for a single service.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Display name of the service.
    pub name: String,
    /// Working directory. Empty means the current directory.
    #[serde(default)]
    pub directory: String,
    /// Port the service listens on.
    pub port: Option<u16>,
    /// Command override; may contain `{PORT}`.
    pub command: Option<String>,
    /// Environment variables to set for the service.
    pub env: Option<HashMap<String, String>>,
}

/// One entry of a legacy `commands.json` file.
#[derive(Debug, Clone, Deserialize)]
struct LegacyRecord {
    script_name: String,
    #[serde(default)]
    directory: String,
    port: Option<u16>,
}

impl From<LegacyRecord> for ServiceConfig {
    fn from(record: LegacyRecord) -> Self {
        Self {
            name: record.script_name,
            directory: record.directory,
            port: record.port,
            command: None,
            env: None,
        }
    }
}

/// Order of the two halves of closing the rack.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NotifyOrder {
    /// Terminate every service, then send the notification requests.
    #[default]
    AfterStop,
    /// Send the notification requests while services are still up, then terminate.
    BeforeStop,
}

/// Loads and parses the configuration from a file path.
///
/// Files ending in `.json` are read as a legacy record array.
pub fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let is_json = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if is_json {
        return parse_legacy(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()));
    }
    let config: Config = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    Ok(config)
}

fn parse_legacy(raw: &str) -> Result<Config> {
    let records: Vec<LegacyRecord> = serde_json::from_str(raw)?;
    Ok(Config {
        services: records.into_iter().map(ServiceConfig::from).collect(),
        ..Config::default()
    })
}

/// Substitutes every `{PORT}` in `template`. A missing port leaves it empty.
pub fn render_command(template: &str, port: Option<u16>) -> String {
    let port = port.map(|port| port.to_string()).unwrap_or_default();
    template.replace(PORT_PLACEHOLDER, &port)
}

/// Builds launch specs for every configured service.
///
/// `template_override` (from the command line) wins over the file's template;
/// a service's own `command` wins over both.
pub fn build_specs(config: &Config, template_override: Option<&str>) -> Result<Vec<ServiceSpec>> {
    let template = template_override
        .or(config.command_template.as_deref())
        .unwrap_or(DEFAULT_COMMAND_TEMPLATE);
    let shell = config.shell.unwrap_or(true);
    let mut specs = Vec::with_capacity(config.services.len());
    for service in &config.services {
        let name = service.name.trim();
        if name.is_empty() {
            bail!("service with empty name");
        }
        let source = service.command.as_deref().unwrap_or(template);
        let command = render_command(source, service.port);
        if command.trim().is_empty() {
            return Err(anyhow!("empty command for {}", name));
        }
        specs.push(ServiceSpec {
            record: ServiceRecord {
                name: name.to_string(),
                command,
                directory: service.directory.clone(),
                port: service.port,
            },
            shell,
            env: service.env.clone().unwrap_or_default(),
        });
    }
    ensure_unique_names(&specs)?;
    Ok(specs)
}

fn ensure_unique_names(specs: &[ServiceSpec]) -> Result<()> {
    let mut seen = HashSet::new();
    for spec in specs {
        if !seen.insert(spec.name()) {
            bail!("duplicate service name: {}", spec.name());
        }
    }
    Ok(())
}
