// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The configuration surface consumed from an external loader (§6).
//!
//! Parsing the config *file* (locating it, reading TOML off disk, CLI
//! flag wiring) is explicitly out of scope for this crate; what lives
//! here is the typed shape the bridge supervisor is built from, plus
//! schema validation so an external `--validate` wrapper has something
//! to call. Unknown top-level keys are captured rather than rejected,
//! so callers can warn on them without failing deserialization.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level configuration for the bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Vendor cloud accounts to bridge.
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
    /// Local broker connection.
    pub mosquitto: MosquittoConfig,
    /// Bridge-wide timing knobs.
    #[serde(default)]
    pub bridge: BridgeConfig,
    /// Persistent cache knobs.
    #[serde(default)]
    pub cache: CacheConfig,
    /// Daemon-level knobs.
    #[serde(default)]
    pub daemon: DaemonConfig,
    /// Any top-level key this version doesn't recognize. Retained so
    /// [`Config::unknown_keys`] can warn about them rather than silently
    /// dropping caller intent.
    #[serde(flatten)]
    pub unknown: HashMap<String, serde_json::Value>,
}

/// One vendor cloud account to bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    /// Vendor account email, also the cache namespace key.
    pub email: String,
    /// Vendor account password.
    pub password: String,
    /// Whether this account's bridge session should be started.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Local MQTT broker connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MosquittoConfig {
    /// Broker hostname or address.
    pub host: String,
    /// Broker port.
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    /// MQTT client id to connect as.
    pub client_id: String,
    /// Optional broker username.
    #[serde(default)]
    pub username: Option<String>,
    /// Optional broker password.
    #[serde(default)]
    pub password: Option<String>,
}

/// Bridge-wide timing knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Seconds between retained status/snapshot republishes.
    pub status_publish_interval: u64,
    /// Lower bound the backoff schedule should honor (informational;
    /// the fixed schedule in [`crate::cloud::reconnect`] already starts
    /// at 5s).
    pub reconnect_delay_min: u64,
    /// Upper bound the backoff schedule should honor (informational;
    /// the fixed schedule already caps at 60s).
    pub reconnect_delay_max: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            status_publish_interval: 60,
            reconnect_delay_min: 5,
            reconnect_delay_max: 60,
        }
    }
}

/// Persistent cache knobs (§4.3, §4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Directory the token/device caches are rooted at.
    pub directory: PathBuf,
    /// Seconds subtracted from a token's `expires_at` when evaluating
    /// usability.
    pub token_ttl_safety_margin: u64,
    /// Seconds before a cached device list is considered stale.
    pub device_list_ttl: u64,
    /// Hard ceiling on any cached token expiry.
    pub max_token_ttl: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("/var/lib/fossibot"),
            token_ttl_safety_margin: 300,
            device_list_ttl: 86_400,
            max_token_ttl: 86_400,
        }
    }
}

/// Daemon-level knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// `debug` / `info` / `warning` / `error`.
    pub log_level: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_mqtt_port() -> u16 {
    1883
}

/// A config validation failure, one per offending field.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct ConfigError(pub String);

impl Config {
    /// Parses a TOML document into a [`Config`].
    ///
    /// Locating the config file on disk, CLI flag wiring, and reload on
    /// `SIGHUP` are left to the binary wrapper; this only covers the
    /// typed deserialization step.
    ///
    /// # Errors
    ///
    /// Returns [`toml::de::Error`] if `text` is not valid TOML or doesn't
    /// match this shape.
    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Validates the schema-level invariants this crate cares about:
    /// at least the fields an external `--validate` wrapper needs
    /// before starting the bridge for real.
    ///
    /// This does not reach the network or filesystem; it only checks
    /// shape (non-empty required strings, at least one enabled
    /// account once any accounts are configured at all).
    ///
    /// # Errors
    ///
    /// Returns one [`ConfigError`] per violated invariant.
    pub fn validate(&self) -> Result<(), Vec<ConfigError>> {
        let mut errors = Vec::new();

        if self.mosquitto.host.trim().is_empty() {
            errors.push(ConfigError("mosquitto.host must not be empty".into()));
        }
        if self.mosquitto.client_id.trim().is_empty() {
            errors.push(ConfigError("mosquitto.client_id must not be empty".into()));
        }
        for (i, account) in self.accounts.iter().enumerate() {
            if account.email.trim().is_empty() {
                errors.push(ConfigError(format!("accounts[{i}].email must not be empty")));
            }
            if account.password.is_empty() {
                errors.push(ConfigError(format!("accounts[{i}].password must not be empty")));
            }
        }
        if !self.accounts.is_empty() && self.accounts.iter().all(|a| !a.enabled) {
            errors.push(ConfigError(
                "at least one account must be enabled".into(),
            ));
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    /// Names of top-level keys this version doesn't recognize, for a
    /// caller to log at warning level.
    #[must_use]
    pub fn unknown_keys(&self) -> Vec<&str> {
        self.unknown.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_json() -> serde_json::Value {
        serde_json::json!({
            "mosquitto": { "host": "localhost", "client_id": "bridge" },
            "accounts": [{ "email": "a@example.com", "password": "secret" }],
        })
    }

    #[test]
    fn defaults_fill_in_missing_sections() {
        let config: Config = serde_json::from_value(minimal_json()).unwrap();
        assert_eq!(config.bridge.status_publish_interval, 60);
        assert_eq!(config.cache.max_token_ttl, 86_400);
        assert_eq!(config.daemon.log_level, "info");
        assert!(config.accounts[0].enabled);
    }

    #[test]
    fn unknown_keys_are_captured_not_rejected() {
        let mut json = minimal_json();
        json["totally_unknown_key"] = serde_json::json!(true);
        let config: Config = serde_json::from_value(json).unwrap();
        assert_eq!(config.unknown_keys(), vec!["totally_unknown_key"]);
    }

    #[test]
    fn validate_rejects_empty_host() {
        let mut config: Config = serde_json::from_value(minimal_json()).unwrap();
        config.mosquitto.host.clear();
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.0.contains("mosquitto.host")));
    }

    #[test]
    fn validate_rejects_all_accounts_disabled() {
        let mut config: Config = serde_json::from_value(minimal_json()).unwrap();
        config.accounts[0].enabled = false;
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.0.contains("enabled")));
    }

    #[test]
    fn validate_accepts_minimal_config() {
        let config: Config = serde_json::from_value(minimal_json()).unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn from_toml_str_parses_a_full_document() {
        let toml = r#"
            [mosquitto]
            host = "localhost"
            client_id = "bridge"

            [[accounts]]
            email = "a@example.com"
            password = "secret"
        "#;
        let config = Config::from_toml_str(toml).unwrap();
        assert_eq!(config.mosquitto.host, "localhost");
        assert_eq!(config.accounts.len(), 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn from_toml_str_rejects_malformed_toml() {
        assert!(Config::from_toml_str("not = [valid").is_err());
    }
}
