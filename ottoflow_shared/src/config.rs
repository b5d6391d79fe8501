//! Configuration shared by the orchestrator binary, the simulator and tests.

use crate::backoff::BackoffPolicy;
use crate::model::{OttoejectId, OttoejectRecord, PrintJob, PrinterRecord, RackId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub moonraker: MoonrakerConfig,
    #[serde(default)]
    pub printers: Vec<PrinterRecord>,
    #[serde(default)]
    pub ottoejects: Vec<OttoejectRecord>,
    #[serde(default)]
    pub racks: Vec<RackSeed>,
    /// Jobs queued at startup.
    #[serde(default)]
    pub jobs: Vec<PrintJob>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind: default_bind() }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Retries per workflow across dispatch and eject.
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff: BackoffPolicy,
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    #[serde(default = "default_macro_timeout_ms")]
    pub macro_timeout_ms: u64,
    #[serde(default = "default_ejector_idle_poll_ms")]
    pub ejector_idle_poll_ms: u64,
    #[serde(default = "default_ejector_idle_timeout_ms")]
    pub ejector_idle_timeout_ms: u64,
    #[serde(default = "default_ejector_lock_timeout_ms")]
    pub ejector_lock_timeout_ms: u64,
    #[serde(default = "default_bed_settle_ms")]
    pub bed_settle_ms: u64,
    #[serde(default = "default_max_stream_reconnects")]
    pub max_stream_reconnects: u32,
    /// Terminal telemetry is trusted without a prior active state once this has elapsed.
    #[serde(default = "default_completion_grace_ms")]
    pub completion_grace_ms: u64,
    #[serde(default = "default_max_print_duration_ms")]
    pub max_print_duration_ms: u64,
    #[serde(default = "default_stale_workflow_after_ms")]
    pub stale_workflow_after_ms: u64,
    #[serde(default = "default_history_len")]
    pub history_len: usize,
    #[serde(default = "default_start_enabled")]
    pub start_enabled: bool,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            retry_budget: default_retry_budget(),
            retry_backoff: default_retry_backoff(),
            command_timeout_ms: default_command_timeout_ms(),
            macro_timeout_ms: default_macro_timeout_ms(),
            ejector_idle_poll_ms: default_ejector_idle_poll_ms(),
            ejector_idle_timeout_ms: default_ejector_idle_timeout_ms(),
            ejector_lock_timeout_ms: default_ejector_lock_timeout_ms(),
            bed_settle_ms: default_bed_settle_ms(),
            max_stream_reconnects: default_max_stream_reconnects(),
            completion_grace_ms: default_completion_grace_ms(),
            max_print_duration_ms: default_max_print_duration_ms(),
            stale_workflow_after_ms: default_stale_workflow_after_ms(),
            history_len: default_history_len(),
            start_enabled: default_start_enabled(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

impl OrchestratorConfig {
    pub fn tick_interval(&self) -> Duration { Duration::from_millis(self.tick_interval_ms.max(1)) }
    pub fn command_timeout(&self) -> Duration { Duration::from_millis(self.command_timeout_ms) }
    pub fn macro_timeout(&self) -> Duration { Duration::from_millis(self.macro_timeout_ms) }
    pub fn ejector_idle_poll(&self) -> Duration { Duration::from_millis(self.ejector_idle_poll_ms) }
    pub fn ejector_idle_timeout(&self) -> Duration { Duration::from_millis(self.ejector_idle_timeout_ms) }
    pub fn ejector_lock_timeout(&self) -> Duration { Duration::from_millis(self.ejector_lock_timeout_ms) }
    pub fn bed_settle(&self) -> Duration { Duration::from_millis(self.bed_settle_ms) }
    pub fn completion_grace(&self) -> Duration { Duration::from_millis(self.completion_grace_ms) }
    pub fn max_print_duration(&self) -> Duration { Duration::from_millis(self.max_print_duration_ms) }
    pub fn stale_workflow_after(&self) -> Duration { Duration::from_millis(self.stale_workflow_after_ms) }
    pub fn shutdown_grace(&self) -> Duration { Duration::from_millis(self.shutdown_grace_ms) }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_auth_timeout_ms")]
    pub auth_timeout_ms: u64,
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,
    #[serde(default)]
    pub backoff: BackoffPolicy,
    /// Per-subscriber queue depth for status fan-out.
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
    /// Cached status younger than this is served without polling the device.
    #[serde(default = "default_status_max_age_ms")]
    pub status_max_age_ms: u64,
    /// Poll period for adapters without a native status stream.
    #[serde(default = "default_status_poll_ms")]
    pub status_poll_ms: u64,
    /// File transfers get their own ceiling instead of the command timeout.
    #[serde(default = "default_upload_timeout_ms")]
    pub upload_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            auth_timeout_ms: default_auth_timeout_ms(),
            reconnect_attempts: default_reconnect_attempts(),
            backoff: BackoffPolicy::default(),
            subscriber_buffer: default_subscriber_buffer(),
            status_max_age_ms: default_status_max_age_ms(),
            status_poll_ms: default_status_poll_ms(),
            upload_timeout_ms: default_upload_timeout_ms(),
        }
    }
}

impl ConnectionConfig {
    pub fn auth_timeout(&self) -> Duration { Duration::from_millis(self.auth_timeout_ms) }
    pub fn status_max_age(&self) -> Duration { Duration::from_millis(self.status_max_age_ms) }
    pub fn status_poll(&self) -> Duration { Duration::from_millis(self.status_poll_ms.max(1)) }
    pub fn upload_timeout(&self) -> Duration { Duration::from_millis(self.upload_timeout_ms) }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { ttl_secs: default_cache_ttl_secs() }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration { Duration::from_secs(self.ttl_secs) }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MoonrakerConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// `/printer/gcode/script` answers only once the script has run, and
    /// uploads carry whole G-code files; both use this instead.
    #[serde(default = "default_script_timeout_ms")]
    pub script_timeout_ms: u64,
}

impl Default for MoonrakerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            script_timeout_ms: default_script_timeout_ms(),
        }
    }
}

impl MoonrakerConfig {
    pub fn poll_interval(&self) -> Duration { Duration::from_millis(self.poll_interval_ms.max(1)) }
    pub fn request_timeout(&self) -> Duration { Duration::from_millis(self.request_timeout_ms) }
    pub fn script_timeout(&self) -> Duration { Duration::from_millis(self.script_timeout_ms) }
}

/// A rack with `shelves` numbered slots, 1 at the bottom.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RackSeed {
    pub id: RackId,
    pub name: String,
    #[serde(default)]
    pub ottoeject_id: Option<OttoejectId>,
    pub shelves: u32,
    #[serde(default)]
    pub shelf_clearance_mm: Option<f64>,
}

fn default_bind() -> String { "0.0.0.0:3000".to_string() }
fn default_tick_interval_ms() -> u64 { 5_000 }
fn default_retry_budget() -> u32 { 3 }
fn default_retry_backoff() -> BackoffPolicy {
    BackoffPolicy { initial_ms: 2_000, max_ms: 30_000, multiplier: 2.0, jitter: 0.1 }
}
fn default_command_timeout_ms() -> u64 { 30_000 }
fn default_macro_timeout_ms() -> u64 { 120_000 }
fn default_ejector_idle_poll_ms() -> u64 { 3_000 }
fn default_ejector_idle_timeout_ms() -> u64 { 180_000 }
fn default_ejector_lock_timeout_ms() -> u64 { 300_000 }
fn default_bed_settle_ms() -> u64 { 5_000 }
fn default_max_stream_reconnects() -> u32 { 3 }
fn default_completion_grace_ms() -> u64 { 120_000 }
fn default_max_print_duration_ms() -> u64 { 72 * 3_600_000 }
fn default_stale_workflow_after_ms() -> u64 { 600_000 }
fn default_history_len() -> usize { 50 }
fn default_start_enabled() -> bool { true }
fn default_shutdown_grace_ms() -> u64 { 10_000 }
fn default_auth_timeout_ms() -> u64 { 15_000 }
fn default_reconnect_attempts() -> u32 { 5 }
fn default_subscriber_buffer() -> usize { 32 }
fn default_status_max_age_ms() -> u64 { 10_000 }
fn default_status_poll_ms() -> u64 { 5_000 }
fn default_upload_timeout_ms() -> u64 { 300_000 }
fn default_cache_ttl_secs() -> u64 { 30 }
fn default_poll_interval_ms() -> u64 { 5_000 }
fn default_request_timeout_ms() -> u64 { 10_000 }
fn default_script_timeout_ms() -> u64 { 300_000 }

impl Config {
    pub fn parse(content: &str) -> Result<Config, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Cross-reference checks serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut printer_ids = HashSet::new();
        for printer in &self.printers {
            if !printer_ids.insert(printer.id) {
                return Err(ConfigError::Invalid(format!("duplicate printer id {}", printer.id)));
            }
        }
        let mut ottoeject_ids = HashSet::new();
        for ottoeject in &self.ottoejects {
            if !ottoeject_ids.insert(ottoeject.id) {
                return Err(ConfigError::Invalid(format!("duplicate ottoeject id {}", ottoeject.id)));
            }
        }
        let mut rack_ids = HashSet::new();
        for rack in &self.racks {
            if !rack_ids.insert(rack.id) {
                return Err(ConfigError::Invalid(format!("duplicate rack id {}", rack.id)));
            }
            if let Some(ottoeject_id) = rack.ottoeject_id {
                if !ottoeject_ids.contains(&ottoeject_id) {
                    return Err(ConfigError::Invalid(format!(
                        "rack {} references unknown ottoeject {}",
                        rack.id, ottoeject_id
                    )));
                }
            }
        }
        let mut job_ids = HashSet::new();
        for job in &self.jobs {
            if !job_ids.insert(job.id) {
                return Err(ConfigError::Invalid(format!("duplicate job id {}", job.id)));
            }
            if !printer_ids.contains(&job.printer_id) {
                return Err(ConfigError::Invalid(format!(
                    "job {} targets unknown printer {}",
                    job.id, job.printer_id
                )));
            }
            if let Some(rack_id) = job.rack_id {
                if !rack_ids.contains(&rack_id) {
                    return Err(ConfigError::Invalid(format!(
                        "job {} targets unknown rack {}",
                        job.id, rack_id
                    )));
                }
            }
        }
        Ok(())
    }
}

pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| {
        tracing::error!("Failed to read config file {}: {}", path.display(), e);
        e
    })?;
    Config::parse(&content).map_err(|e| {
        tracing::error!("Failed to load config file {}: {}", path.display(), e);
        e
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_load_valid_config() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("ottoflow.toml");
        let mut file = File::create(&file_path).unwrap();
        writeln!(
            file,
            r#"
[server]
bind = "127.0.0.1:8080"

[orchestrator]
tick_interval_ms = 1000
retry_budget = 5

[[printers]]
id = 1
name = "kobra-1"
brand = "anycubic"
model = "kobra s1"
address = "192.168.1.40"

[[ottoejects]]
id = 1
name = "eject-1"
address = "192.168.1.50"

[[racks]]
id = 1
name = "rack-a"
ottoeject_id = 1
shelves = 6
shelf_clearance_mm = 80.0
"#
        )
        .unwrap();
        let config = load_config(&file_path).unwrap();
        assert_eq!(config.server.bind, "127.0.0.1:8080");
        assert_eq!(config.orchestrator.tick_interval_ms, 1000);
        assert_eq!(config.orchestrator.retry_budget, 5);
        assert_eq!(config.orchestrator.completion_grace_ms, 120_000);
        assert_eq!(config.printers[0].brand, "anycubic");
        assert_eq!(config.racks[0].shelves, 6);
        assert_eq!(config.cache.ttl_secs, 30);
    }

    #[test]
    fn test_load_missing_file() {
        let result = load_config("/nonexistent/path/ottoflow.toml");
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }

    #[test]
    fn test_load_malformed_config() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("bad.toml");
        let mut file = File::create(&file_path).unwrap();
        writeln!(file, "[orchestrator\ntick_interval_ms = ").unwrap();
        let result = load_config(&file_path);
        assert!(matches!(result, Err(ConfigError::Toml(_))));
    }

    #[test]
    fn test_rack_with_unknown_ottoeject_rejected() {
        let result = Config::parse(
            r#"
[[racks]]
id = 1
name = "rack-a"
ottoeject_id = 9
shelves = 3
"#,
        );
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.orchestrator.tick_interval(), Duration::from_secs(5));
        assert!(config.orchestrator.start_enabled);
        assert_eq!(config.connection.subscriber_buffer, 32);
    }

    #[test]
    fn test_long_calls_outlast_the_request_timeout() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.moonraker.request_timeout(), Duration::from_secs(10));
        assert_eq!(config.moonraker.script_timeout(), Duration::from_secs(300));
        assert!(config.moonraker.script_timeout() > config.orchestrator.macro_timeout());
        assert!(config.connection.upload_timeout() > config.orchestrator.command_timeout());
    }
}
