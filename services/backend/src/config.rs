use std::net::SocketAddr;
use std::path::PathBuf;

use common_config::{env_string, service_port, ServiceConfig, TracesConfig, APP_VERSION_ENV};
use serde::Deserialize;

use crate::star::StarFailurePolicy;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub bind_address: String,
    pub port: u16,
    pub app_version: String,
    pub traces: TracesConfig,
    pub store: StoreConfig,
    pub star_failure_policy: StarFailurePolicy,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Root directory of the file-backed store; in-memory when unset.
    pub path: Option<PathBuf>,
    pub collection: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8081,
            app_version: "1.0.3".to_string(),
            traces: TracesConfig::default(),
            store: StoreConfig::default(),
            star_failure_policy: StarFailurePolicy::Degrade,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            collection: "stars".to_string(),
        }
    }
}

impl BackendConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.bind_address, self.port).parse()
    }
}

impl ServiceConfig for BackendConfig {
    const PREFIX: &'static str = "BACKEND_";

    fn apply_environment_overrides(&mut self, prefix: &str) {
        if let Some(address) = env_string(&format!("{prefix}BIND_ADDRESS")) {
            self.bind_address = address;
        }
        self.port = service_port(&format!("{prefix}PORT"), self.port);
        if let Some(version) = env_string(APP_VERSION_ENV) {
            self.app_version = version;
        }
        if let Some(path) = env_string(&format!("{prefix}STORE_PATH")) {
            self.store.path = Some(PathBuf::from(path));
        }
        if let Some(collection) = env_string(&format!("{prefix}STORE_COLLECTION")) {
            self.store.collection = collection;
        }
        if let Some(value) = env_string(&format!("{prefix}STAR_FAILURE_POLICY")) {
            match value.parse() {
                Ok(policy) => self.star_failure_policy = policy,
                Err(error) => {
                    tracing::warn!(%value, %error, "invalid star failure policy, keeping default")
                }
            }
        }
        self.traces.apply_environment_overrides();
    }
}
