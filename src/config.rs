//! Configuration file handling for mailbridge.

use crate::error::Error;
use crate::message::AddressPolicy;
use crate::smtp_client::RelaySettings;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Mailbridge configuration, read from the `[params]` section of an INI file.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "Config::default_http_listen")]
    pub http_listen: String,
    pub pre_shared_secret: String,
    #[serde(default = "Config::default_smtp_host")]
    pub smtp_host: String,
    #[serde(default = "Config::default_smtp_port")]
    pub smtp_port: u16,
    pub smtp_username: Option<String>,
    pub smtp_password: Option<String>,
    #[serde(default)]
    pub smtp_starttls: bool,
    pub forwarder_address: String,
    pub fallback_recipient: String,
    #[serde(default = "Config::default_max_message_size")]
    pub max_message_size: usize,
    #[serde(default = "Config::default_failure_threshold")]
    pub failure_threshold: usize,
    #[serde(default)]
    pub enable_queue_poll: bool,
    pub queue_url: Option<String>,
    pub dead_letter_queue_url: Option<String>,
    pub aws_region: Option<String>,
    #[serde(default = "Config::default_max_receive_count")]
    pub max_receive_count: u32,
    #[serde(default = "Config::default_poll_wait_seconds")]
    pub poll_wait_seconds: i32,
    #[serde(default = "Config::default_error_backoff_seconds")]
    pub error_backoff_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
struct ConfigWrapper {
    // The whole actual config is under `params` section.
    pub params: Config,
}

impl Config {
    /// Load configuration from a file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let content = std::fs::read_to_string(path)?;
        Self::from_ini(&content)
    }

    /// Parse configuration from INI text and validate cross-field requirements.
    pub fn from_ini(content: &str) -> Result<Self, Error> {
        let wrapped_config: ConfigWrapper = serini::from_str(content)?;
        let config = wrapped_config.params;

        if config.pre_shared_secret.is_empty() {
            return Err(Error::MissingSetting("pre_shared_secret"));
        }
        if config.enable_queue_poll && config.queue_url.is_none() {
            return Err(Error::MissingSetting("queue_url"));
        }

        Ok(config)
    }

    /// Addresses the normalizer substitutes into every envelope.
    pub fn address_policy(&self) -> AddressPolicy {
        AddressPolicy {
            forwarder_address: self.forwarder_address.clone(),
            fallback_recipient: self.fallback_recipient.clone(),
        }
    }

    /// Connection settings for the SMTP relay.
    ///
    /// Credentials are only used when both user name and password are set.
    pub fn relay_settings(&self) -> RelaySettings {
        let credentials = match (&self.smtp_username, &self.smtp_password) {
            (Some(username), Some(password)) => Some((username.clone(), password.clone())),
            _ => None,
        };
        RelaySettings {
            host: self.smtp_host.clone(),
            port: self.smtp_port,
            credentials,
            starttls: self.smtp_starttls,
        }
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_secs(self.error_backoff_seconds)
    }

    // Following are needed since serde does not support default literals.

    fn default_http_listen() -> String {
        "0.0.0.0:8080".to_string()
    }
    fn default_smtp_host() -> String {
        "localhost".to_string()
    }
    const fn default_smtp_port() -> u16 {
        25
    }
    const fn default_max_message_size() -> usize {
        31457280
    }
    const fn default_failure_threshold() -> usize {
        5
    }
    const fn default_max_receive_count() -> u32 {
        5
    }
    const fn default_poll_wait_seconds() -> i32 {
        20
    }
    const fn default_error_backoff_seconds() -> u64 {
        5
    }
}
