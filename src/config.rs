// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025-2026 JR Morton

//! TOML configuration.
//!
//! Every key is optional; missing keys fall back to the protocol defaults
//! (30 s per step, 5 min session ceiling, 3 delivery attempts, 30 day
//! retention). The config is read once at start-up and never mutated.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::core::incident::EmergencyContact;

/// Paths searched by [`SosConfig::load_default`], first match wins.
pub const DEFAULT_CONFIG_PATHS: &[&str] = &["/etc/sosguard/config.toml", "./sosguard.toml"];

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SosConfig {
    /// Session ceiling: the whole activation must reach execution within this window.
    #[serde(default = "default_auto_cancel_timeout_ms")]
    pub auto_cancel_timeout_ms: u64,
    /// Per-step countdown.
    #[serde(default = "default_confirmation_timeout_ms")]
    pub confirmation_timeout_ms: u64,
    #[serde(default = "default_location_timeout_ms")]
    pub location_timeout_ms: u64,
    /// Total delivery attempts, including the first.
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
    /// Linear backoff unit: attempt `n` waits `n * retry_backoff_ms` before the next one.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_true")]
    pub enable_compact_geocode: bool,
    #[serde(default = "default_true")]
    pub enable_offline_queue: bool,
    #[serde(default = "default_contacts")]
    pub emergency_contacts: Vec<EmergencyContact>,
    #[serde(default = "default_log_retention_days")]
    pub log_retention_days: u32,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub transmission: TransmissionConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
}

/// Where the ledger and outbound queue live on disk.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_dir")]
    pub dir: PathBuf,
}

/// Delivery endpoint for confirmed incidents.
#[derive(Debug, Clone, Deserialize)]
pub struct TransmissionConfig {
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub backup_endpoint: String,
    /// When set, payloads carry an `X-SOS-Signature` HMAC-SHA256 header.
    #[serde(default)]
    pub signing_secret: String,
    #[serde(default = "default_transmission_timeout_secs")]
    pub timeout_secs: u64,
}

/// Outbound webhook for protocol notifications.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookConfig {
    /// Defaults to `true` when `url` is non-empty.
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub backup_url: String,
}

fn default_auto_cancel_timeout_ms() -> u64 { 300_000 }
fn default_confirmation_timeout_ms() -> u64 { 30_000 }
fn default_location_timeout_ms() -> u64 { 10_000 }
fn default_max_retry_attempts() -> u32 { 3 }
fn default_retry_backoff_ms() -> u64 { 500 }
fn default_log_retention_days() -> u32 { 30 }
fn default_transmission_timeout_secs() -> u64 { 10 }
fn default_true() -> bool { true }
fn default_storage_dir() -> PathBuf { PathBuf::from("/var/lib/sosguard") }

/// National emergency line, roadside assistance, then medical.
pub fn default_contacts() -> Vec<EmergencyContact> {
    vec![
        EmergencyContact::new("911", "National Emergency", "911", 1),
        EmergencyContact::new("078", "Roadside Assistance (Green Angels)", "078", 2),
        EmergencyContact::new("065", "Medical Emergency (Red Cross)", "065", 3),
    ]
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: default_storage_dir(),
        }
    }
}

impl Default for TransmissionConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            backup_endpoint: String::new(),
            signing_secret: String::new(),
            timeout_secs: default_transmission_timeout_secs(),
        }
    }
}

impl Default for SosConfig {
    fn default() -> Self {
        Self {
            auto_cancel_timeout_ms: default_auto_cancel_timeout_ms(),
            confirmation_timeout_ms: default_confirmation_timeout_ms(),
            location_timeout_ms: default_location_timeout_ms(),
            max_retry_attempts: default_max_retry_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            enable_compact_geocode: true,
            enable_offline_queue: true,
            emergency_contacts: default_contacts(),
            log_retention_days: default_log_retention_days(),
            storage: StorageConfig::default(),
            transmission: TransmissionConfig::default(),
            webhook: WebhookConfig::default(),
        }
    }
}

impl SosConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: SosConfig = toml::from_str(content).context("Failed to parse config")?;
        Ok(config.normalized())
    }

    /// Load from an explicit path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        Self::from_toml_str(&content).with_context(|| format!("Invalid config: {}", path.display()))
    }

    /// Load the first config found in [`DEFAULT_CONFIG_PATHS`], or defaults if none exist.
    pub fn load_default() -> Result<Self> {
        for path in DEFAULT_CONFIG_PATHS {
            let path = Path::new(path);
            if path.exists() {
                tracing::info!("config: loading {}", path.display());
                return Self::load(path);
            }
        }
        tracing::debug!("config: no config file found, using defaults");
        Ok(Self::default())
    }

    /// An empty contact list or zero attempts would make the protocol unusable.
    fn normalized(mut self) -> Self {
        if self.emergency_contacts.is_empty() {
            tracing::warn!("config: emergency_contacts is empty, using defaults");
            self.emergency_contacts = default_contacts();
        }
        if self.max_retry_attempts == 0 {
            tracing::warn!("config: max_retry_attempts must be at least 1");
            self.max_retry_attempts = 1;
        }
        self.emergency_contacts.sort_by_key(|c| c.priority);
        self
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.confirmation_timeout_ms)
    }

    pub fn session_ceiling(&self) -> Duration {
        Duration::from_millis(self.auto_cancel_timeout_ms)
    }

    pub fn location_timeout(&self) -> Duration {
        Duration::from_millis(self.location_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

impl WebhookConfig {
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(!self.url.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = SosConfig::from_toml_str("").unwrap();
        assert_eq!(config.step_timeout(), Duration::from_secs(30));
        assert_eq!(config.session_ceiling(), Duration::from_secs(300));
        assert_eq!(config.location_timeout(), Duration::from_secs(10));
        assert_eq!(config.max_retry_attempts, 3);
        assert_eq!(config.log_retention_days, 30);
        assert!(config.enable_compact_geocode);
        assert!(config.enable_offline_queue);
        assert_eq!(config.storage.dir, PathBuf::from("/var/lib/sosguard"));
        assert_eq!(config.transmission.timeout_secs, 10);
        assert!(!config.webhook.is_enabled());

        let ids: Vec<&str> = config.emergency_contacts.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["911", "078", "065"]);
    }

    #[test]
    fn test_overrides_and_sections() {
        let toml = r#"
confirmation_timeout_ms = 5000
max_retry_attempts = 5
enable_offline_queue = false

[[emergency_contacts]]
id = "family"
name = "Family"
phone = "+52 55 1234 5678"
priority = 2

[[emergency_contacts]]
id = "911"
name = "National Emergency"
phone = "911"
priority = 1

[storage]
dir = "/tmp/sos"

[transmission]
endpoint = "https://dispatch.example/incidents"
signing_secret = "s3cret"

[webhook]
url = "https://hooks.example/sos"
"#;
        let config = SosConfig::from_toml_str(toml).unwrap();
        assert_eq!(config.step_timeout(), Duration::from_secs(5));
        assert_eq!(config.max_retry_attempts, 5);
        assert!(!config.enable_offline_queue);
        // Sorted by priority.
        assert_eq!(config.emergency_contacts[0].id, "911");
        assert_eq!(config.emergency_contacts[1].id, "family");
        assert_eq!(config.storage.dir, PathBuf::from("/tmp/sos"));
        assert_eq!(config.transmission.endpoint, "https://dispatch.example/incidents");
        assert_eq!(config.transmission.timeout_secs, 10);
        assert!(config.webhook.is_enabled());
    }

    #[test]
    fn test_unusable_values_are_normalized() {
        let config = SosConfig::from_toml_str("max_retry_attempts = 0\nemergency_contacts = []").unwrap();
        assert_eq!(config.max_retry_attempts, 1);
        assert_eq!(config.emergency_contacts.len(), 3);
    }

    #[test]
    fn test_invalid_toml_is_an_error() {
        assert!(SosConfig::from_toml_str("confirmation_timeout_ms = \"soon\"").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sosguard.toml");
        std::fs::write(&path, "log_retention_days = 7\n").unwrap();
        let config = SosConfig::load(&path).unwrap();
        assert_eq!(config.log_retention_days, 7);

        assert!(SosConfig::load(&dir.path().join("missing.toml")).is_err());
    }

    #[test]
    fn test_webhook_explicitly_disabled() {
        let config = SosConfig::from_toml_str("[webhook]\nurl = \"https://x\"\nenabled = false\n").unwrap();
        assert!(!config.webhook.is_enabled());
    }
}
