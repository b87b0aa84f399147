//! Command line configuration.
//!
//! Loaded from the first of:
//! - `parley.toml` in the working directory
//! - `~/.config/parley/parley.toml`
//!
//! then overridden by `PARLEY_*` environment variables.

use anyhow::{Context, Result};
use parley_core::{BrokerEndpoint, ClientConfig, Conversation, Credentials};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Binary configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Broker URL, e.g. `tcp://broker.local:1883`.
    #[serde(default = "default_broker")]
    pub broker: String,

    /// Who we log in as.
    #[serde(default)]
    pub credentials: CredentialsConfig,

    /// Connection tuning.
    #[serde(default)]
    pub client: ClientConfig,

    /// Conversations joined on startup.
    #[serde(default)]
    pub conversations: Vec<ConversationConfig>,

    /// Agent queues to watch.
    #[serde(default)]
    pub queues: Vec<String>,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Login configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CredentialsConfig {
    /// User uid, the first part of the client id.
    #[serde(default)]
    pub user_uid: String,

    /// Device uid. A random one is used when empty.
    #[serde(default)]
    pub device_uid: String,

    /// Display name attached to outbound messages.
    #[serde(default)]
    pub nickname: String,

    /// Broker user name.
    #[serde(default)]
    pub username: Option<String>,

    /// Broker password or access token.
    #[serde(default)]
    pub password: Option<String>,
}

/// Topic family of a configured conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    Group,
    Workgroup,
    Agent,
    /// `target` is the literal topic.
    Topic,
}

/// A conversation to join.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationConfig {
    /// Conversation uid.
    pub uid: String,

    /// Topic family.
    #[serde(default = "default_conversation_kind")]
    pub kind: ConversationKind,

    /// Group, workgroup or agent uid, or the topic for `kind = "topic"`.
    /// Defaults to the conversation uid.
    #[serde(default)]
    pub target: Option<String>,

    /// Display title.
    #[serde(default)]
    pub title: String,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable the Prometheus exporter.
    #[serde(default)]
    pub enabled: bool,

    /// Exporter port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_broker() -> String {
    format!("tcp://127.0.0.1:{}", parley_core::config::DEFAULT_PORT)
}

fn default_conversation_kind() -> ConversationKind {
    ConversationKind::Group
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            broker: default_broker(),
            credentials: CredentialsConfig::default(),
            client: ClientConfig::default(),
            conversations: Vec::new(),
            queues: Vec::new(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

impl ConversationConfig {
    /// Build the conversation this entry describes.
    #[must_use]
    pub fn conversation(&self) -> Conversation {
        let target = self.target.as_deref().unwrap_or(&self.uid);
        let conversation = match self.kind {
            ConversationKind::Group => Conversation::new(
                self.uid.clone(),
                parley_core::registry::topics::group(target),
            ),
            ConversationKind::Workgroup => Conversation::workgroup(self.uid.clone(), target),
            ConversationKind::Agent => Conversation::agent(self.uid.clone(), target),
            ConversationKind::Topic => Conversation::new(self.uid.clone(), target),
        };
        if self.title.is_empty() {
            conversation
        } else {
            conversation.with_title(self.title.clone())
        }
    }
}

impl Config {
    /// Load configuration from file or defaults, then apply the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let config_paths = ["parley.toml", "~/.config/parley/parley.toml"];

        let mut config = Self::default();
        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                config = Self::from_file(expanded.as_ref())?;
                break;
            }
        }

        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Override broker and login settings from `PARLEY_*` variables.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(broker) = var("PARLEY_BROKER") {
            self.broker = broker;
        }
        if let Some(user) = var("PARLEY_USER") {
            self.credentials.user_uid = user;
        }
        if let Some(device) = var("PARLEY_DEVICE") {
            self.credentials.device_uid = device;
        }
        if let Some(username) = var("PARLEY_USERNAME") {
            self.credentials.username = Some(username);
        }
        if let Some(password) = var("PARLEY_PASSWORD") {
            self.credentials.password = Some(password);
        }
    }

    /// Resolve the broker URL and login into connect credentials.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker URL is invalid or no user is set.
    pub fn connect_credentials(&self) -> Result<Credentials> {
        anyhow::ensure!(
            !self.credentials.user_uid.is_empty(),
            "No user configured (set credentials.user_uid or PARLEY_USER)"
        );

        let endpoint = BrokerEndpoint::parse(&self.broker)
            .with_context(|| format!("Invalid broker URL: {}", self.broker))?;
        let client_id =
            Credentials::client_id_for(&self.credentials.user_uid, &self.credentials.device_uid);

        let mut credentials = Credentials::new(endpoint, client_id);
        credentials.username = self.credentials.username.clone();
        credentials.password = self.credentials.password.clone();
        Ok(credentials)
    }
}
