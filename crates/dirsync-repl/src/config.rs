//! Replication service configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::ReplError;

/// How a freshly joined node performs its first replication cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FirstCycleMode {
    /// Regular pull replication; the first pass must succeed
    Normal,
    /// Hot-copy the partner database before steady state
    CopyDb,
    /// No special first cycle
    None,
}

/// Identity of the local server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerIdentity {
    /// Host name
    pub fqdn: String,
    /// Replica invocation id; generated when absent
    pub invocation_id: Option<String>,
    /// Numeric server id
    pub server_id: u32,
    /// Site name
    pub site: String,
}

impl Default for ServerIdentity {
    fn default() -> Self {
        Self {
            fqdn: String::from("localhost"),
            invocation_id: None,
            server_id: 1,
            site: String::from("Default-First-Site"),
        }
    }
}

/// Machine account used to bind to partners.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Machine account DN or UPN
    pub account: String,
    /// Current password
    pub password: String,
    /// Previous password, tried when the current one is rejected
    pub old_password: Option<String>,
}

/// Full replication service configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplConfig {
    /// Local server identity
    pub server: ServerIdentity,
    /// Machine account used for partner binds
    pub credentials: Credentials,
    /// System domain DN; absent until promotion
    pub system_domain_dn: Option<String>,
    /// Seconds between replication cycles
    pub repl_interval_secs: u64,
    /// Entries requested per fetch
    pub page_size: usize,
    /// Pause between agreements (ms)
    pub agreement_pause_ms: u64,
    /// Bootstrap behaviour for a new node
    pub first_cycle_mode: FirstCycleMode,
    /// One-shot restore: exit after the first completed cycle
    pub restore_mode: bool,
    /// Raft election timeout (ms)
    pub election_timeout_ms: u64,
    /// Raft ping interval (ms)
    pub ping_interval_ms: u64,
    /// Minimum seconds between replays from USN 0
    pub hole_fill_retry_secs: u64,
    /// Seconds a rejected password is left alone
    pub password_retry_secs: u64,
    /// Deadline for a single partner connect or fetch
    pub rpc_timeout_secs: u64,
}

impl Default for ReplConfig {
    fn default() -> Self {
        Self {
            server: ServerIdentity::default(),
            credentials: Credentials::default(),
            system_domain_dn: None,
            repl_interval_secs: 30,
            page_size: 1000,
            agreement_pause_ms: 100,
            first_cycle_mode: FirstCycleMode::Normal,
            restore_mode: false,
            election_timeout_ms: 4000,
            ping_interval_ms: 1000,
            hole_fill_retry_secs: 3600,
            password_retry_secs: 600,
            rpc_timeout_secs: 60,
        }
    }
}

impl ReplConfig {
    /// Loads a TOML or JSON file, chosen by extension.
    pub fn from_file(path: &Path) -> Result<Self, ReplError> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: ReplConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| ReplError::Config(e.to_string()))?,
            "json" => {
                serde_json::from_str(&contents).map_err(|e| ReplError::Config(e.to_string()))?
            }
            _ => {
                return Err(ReplError::Config(format!(
                    "unsupported config file extension: {}",
                    ext
                )))
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the driver cannot work with.
    pub fn validate(&self) -> Result<(), ReplError> {
        if self.page_size == 0 {
            return Err(ReplError::Config("page_size must be positive".into()));
        }
        if self.server.fqdn.is_empty() {
            return Err(ReplError::Config("server.fqdn must be set".into()));
        }
        if self.rpc_timeout_secs == 0 {
            return Err(ReplError::Config("rpc_timeout_secs must be positive".into()));
        }
        if self.ping_interval_ms == 0 || self.election_timeout_ms <= self.ping_interval_ms {
            return Err(ReplError::Config(
                "election_timeout_ms must exceed a positive ping_interval_ms".into(),
            ));
        }
        Ok(())
    }

    /// Sleep between replication cycles.
    pub fn repl_interval(&self) -> Duration {
        Duration::from_secs(self.repl_interval_secs)
    }

    /// Pause between agreements within a cycle.
    pub fn agreement_pause(&self) -> Duration {
        Duration::from_millis(self.agreement_pause_ms)
    }

    /// Minimum spacing of replays from USN 0.
    pub fn hole_fill_retry(&self) -> Duration {
        Duration::from_secs(self.hole_fill_retry_secs)
    }

    /// How long a rejected password is not retried.
    pub fn password_retry(&self) -> Duration {
        Duration::from_secs(self.password_retry_secs)
    }

    /// Deadline for one partner call.
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs)
    }
}
