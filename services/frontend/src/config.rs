use std::net::SocketAddr;

use common_config::{env_string, service_port, ServiceConfig, TracesConfig, APP_VERSION_ENV};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FrontendConfig {
    pub bind_address: String,
    pub port: u16,
    pub app_version: String,
    pub traces: TracesConfig,
}

impl Default for FrontendConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8080,
            app_version: "1.0.3".to_string(),
            traces: TracesConfig::default(),
        }
    }
}

impl FrontendConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.bind_address, self.port).parse()
    }
}

impl ServiceConfig for FrontendConfig {
    const PREFIX: &'static str = "FRONTEND_";

    fn apply_environment_overrides(&mut self, prefix: &str) {
        if let Some(address) = env_string(&format!("{prefix}BIND_ADDRESS")) {
            self.bind_address = address;
        }
        self.port = service_port(&format!("{prefix}PORT"), self.port);
        if let Some(version) = env_string(APP_VERSION_ENV) {
            self.app_version = version;
        }
        self.traces.apply_environment_overrides();
    }
}
