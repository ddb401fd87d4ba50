use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level proxy configuration, loaded from a JSON file given on the
/// command line. Unknown keys anywhere in the document are rejected.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HeraldConfig {
    #[serde(default)]
    pub listen: ListenConfig,

    /// Upstream connection string, handed to the LISTEN driver.
    #[serde(default = "default_connect")]
    pub connect: String,

    /// Key/value pairs replayed to every client as `ParameterStatus`
    /// frames after authentication.
    #[serde(default)]
    pub startup_parameters: BTreeMap<String, String>,

    /// Virtual databases clients may connect to. At least one required.
    #[serde(default)]
    pub databases: Vec<VirtualDatabase>,

    /// Present ⇒ the Prometheus exporter is enabled on the given socket.
    #[serde(default)]
    pub prometheus: Option<PrometheusConfig>,
}

/// A listen socket. A host beginning with `/` is a Unix-domain socket
/// path; `*` means all interfaces.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListenConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_keepalive")]
    pub keepalive: bool,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            keepalive: default_keepalive(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PrometheusConfig {
    pub listen: ListenConfig,
}

/// A virtual database: a name clients can connect to, and how they must
/// authenticate. The proxy never connects upstream on their behalf.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VirtualDatabase {
    pub name: String,
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    pub method: AuthMethod,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    /// Accept any credentials.
    Trust,
    /// MD5 salted challenge/response (PG auth type 5).
    Md5,
}

fn default_port() -> u16 {
    6433
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_keepalive() -> bool {
    true
}

fn default_connect() -> String {
    "host=localhost port=5432 sslmode=disable".to_string()
}

impl HeraldConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: HeraldConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.databases.is_empty() {
            return Err(ConfigError::NoDatabases);
        }
        for (i, db) in self.databases.iter().enumerate() {
            if self.databases[..i].iter().any(|d| d.name == db.name) {
                return Err(ConfigError::DuplicateDatabase(db.name.clone()));
            }
        }
        Ok(())
    }

    pub fn find_database(&self, name: &str) -> Option<&VirtualDatabase> {
        self.databases.iter().find(|db| db.name == name)
    }
}

impl ListenConfig {
    /// `host:port` form for TCP listeners; Unix-socket hosts are returned
    /// as-is.
    pub fn address(&self) -> String {
        if self.host.starts_with('/') {
            self.host.clone()
        } else if self.host == "*" {
            format!("0.0.0.0:{}", self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}
