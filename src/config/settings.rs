use serde::Deserialize;

use crate::transport::message::RESERVED_ACTIONS;

/// Top-level configuration settings for the application.
///
/// Includes settings for the broker server, the CLI client and logging.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub client: ClientSettings,
    pub log_level: String,
}

/// Configuration settings for the broker server.
///
/// `id` names the persisted snapshot; `proxy_to` lists upstream brokers that
/// locally unroutable requests are forwarded to.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub sync_interval_ms: u64,
    pub sweep_interval_ms: u64,
    pub task_interval_ms: u64,
    pub secure_key: Option<String>,
    pub storage_path: String,
    pub notify_expired: bool,
    pub proxy_to: Vec<ClientSettings>,
}

/// Configuration settings for a client connection.
///
/// Used both by application clients and by the broker's own proxy links.
#[derive(Debug, Deserialize, Clone)]
pub struct ClientSettings {
    pub host: String,
    pub port: u16,
    pub id: String,
    pub secure_key: Option<String>,
    pub reconnect: bool,
    pub reconnect_interval_ms: u64,
    pub task_interval_ms: u64,
    pub default_request_timeout_ms: Option<u64>,
}

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("{field}: port {port} is outside 1025..=65535")]
    InvalidPort { field: &'static str, port: u16 },
    #[error("{field} must be greater than zero")]
    ZeroInterval { field: &'static str },
    #[error("{field} must not be empty")]
    Empty { field: &'static str },
    #[error("client id '{0}' collides with a reserved action name")]
    ReservedId(String),
    #[error("proxy_to[{index}]: {source}")]
    Proxy {
        index: usize,
        #[source]
        source: Box<SettingsError>,
    },
}

fn check_port(field: &'static str, port: u16) -> Result<(), SettingsError> {
    if port < 1025 {
        return Err(SettingsError::InvalidPort { field, port });
    }
    Ok(())
}

fn check_interval(field: &'static str, value: u64) -> Result<(), SettingsError> {
    if value == 0 {
        return Err(SettingsError::ZeroInterval { field });
    }
    Ok(())
}

fn check_non_empty(field: &'static str, value: &str) -> Result<(), SettingsError> {
    if value.trim().is_empty() {
        return Err(SettingsError::Empty { field });
    }
    Ok(())
}

fn check_key(field: &'static str, key: Option<&str>) -> Result<(), SettingsError> {
    match key {
        Some(key) => check_non_empty(field, key),
        None => Ok(()),
    }
}

impl ServerSettings {
    /// Rejects unusable server options before anything is bound or spawned.
    pub fn validate(&self) -> Result<(), SettingsError> {
        check_non_empty("server.id", &self.id)?;
        check_non_empty("server.host", &self.host)?;
        check_port("server.port", self.port)?;
        check_interval("server.sync_interval_ms", self.sync_interval_ms)?;
        check_interval("server.sweep_interval_ms", self.sweep_interval_ms)?;
        check_interval("server.task_interval_ms", self.task_interval_ms)?;
        check_key("server.secure_key", self.secure_key.as_deref())?;
        for (index, proxy) in self.proxy_to.iter().enumerate() {
            proxy.validate().map_err(|e| SettingsError::Proxy {
                index,
                source: Box::new(e),
            })?;
        }
        Ok(())
    }
}

impl ClientSettings {
    pub fn validate(&self) -> Result<(), SettingsError> {
        check_non_empty("client.host", &self.host)?;
        check_port("client.port", self.port)?;
        check_non_empty("client.id", &self.id)?;
        if RESERVED_ACTIONS.contains(&self.id.as_str()) {
            return Err(SettingsError::ReservedId(self.id.clone()));
        }
        check_interval("client.reconnect_interval_ms", self.reconnect_interval_ms)?;
        check_interval("client.task_interval_ms", self.task_interval_ms)?;
        if let Some(timeout) = self.default_request_timeout_ms {
            check_interval("client.default_request_timeout_ms", timeout)?;
        }
        check_key("client.secure_key", self.secure_key.as_deref())?;
        Ok(())
    }

    /// Address in the form the WebSocket connector expects.
    pub fn url(&self) -> String {
        format!("ws://{}:{}", self.host, self.port)
    }
}

/// Partial configuration settings loaded from files or environment.
///
/// Allows partial specification of settings. Missing values can be filled using defaults.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub client: Option<PartialClientSettings>,
    pub log_level: Option<String>,
}

/// Partial server settings.
#[derive(Debug, Deserialize, Default)]
pub struct PartialServerSettings {
    pub id: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub sync_interval_ms: Option<u64>,
    pub sweep_interval_ms: Option<u64>,
    pub task_interval_ms: Option<u64>,
    pub secure_key: Option<String>,
    pub storage_path: Option<String>,
    pub notify_expired: Option<bool>,
    pub proxy_to: Option<Vec<PartialClientSettings>>,
}

/// Partial client settings.
///
/// Also used for `proxy_to` entries, which are merged over client defaults.
#[derive(Debug, Deserialize, Default, Clone)]
pub struct PartialClientSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub id: Option<String>,
    pub secure_key: Option<String>,
    pub reconnect: Option<bool>,
    pub reconnect_interval_ms: Option<u64>,
    pub task_interval_ms: Option<u64>,
    pub default_request_timeout_ms: Option<u64>,
}

impl PartialClientSettings {
    pub fn merge(self, default: ClientSettings) -> ClientSettings {
        ClientSettings {
            host: self.host.unwrap_or(default.host),
            port: self.port.unwrap_or(default.port),
            id: self.id.unwrap_or(default.id),
            secure_key: self.secure_key.or(default.secure_key),
            reconnect: self.reconnect.unwrap_or(default.reconnect),
            reconnect_interval_ms: self
                .reconnect_interval_ms
                .unwrap_or(default.reconnect_interval_ms),
            task_interval_ms: self.task_interval_ms.unwrap_or(default.task_interval_ms),
            default_request_timeout_ms: self
                .default_request_timeout_ms
                .or(default.default_request_timeout_ms),
        }
    }
}

impl PartialServerSettings {
    pub fn merge(self, default: ServerSettings) -> ServerSettings {
        ServerSettings {
            id: self.id.unwrap_or(default.id),
            host: self.host.unwrap_or(default.host),
            port: self.port.unwrap_or(default.port),
            sync_interval_ms: self.sync_interval_ms.unwrap_or(default.sync_interval_ms),
            sweep_interval_ms: self.sweep_interval_ms.unwrap_or(default.sweep_interval_ms),
            task_interval_ms: self.task_interval_ms.unwrap_or(default.task_interval_ms),
            secure_key: self.secure_key.or(default.secure_key),
            storage_path: self.storage_path.unwrap_or(default.storage_path),
            notify_expired: self.notify_expired.unwrap_or(default.notify_expired),
            proxy_to: match self.proxy_to {
                Some(proxies) => proxies
                    .into_iter()
                    .map(|p| p.merge(ClientSettings::default()))
                    .collect(),
                None => default.proxy_to,
            },
        }
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            id: "broker".to_string(),
            host: "127.0.0.1".to_string(),
            port: 8080,
            sync_interval_ms: 1000,
            sweep_interval_ms: 1000,
            task_interval_ms: 10,
            secure_key: None,
            storage_path: "relayq_db".to_string(),
            notify_expired: false,
            proxy_to: Vec::new(),
        }
    }
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            id: "client".to_string(),
            secure_key: None,
            reconnect: true,
            reconnect_interval_ms: 1000,
            task_interval_ms: 10,
            default_request_timeout_ms: None,
        }
    }
}

/// Provides default values for `Settings`.
///
/// Ensures the application has sensible defaults if no configuration is provided.
impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            client: ClientSettings::default(),
            log_level: "info".to_string(),
        }
    }
}
