//! Shared configuration helpers for the star services.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;

/// Variable naming the trace agent host, shared by both services.
pub const TRACES_AGENT_HOST_ENV: &str = "JAEGER_AGENT_HOST";
pub const TRACES_AGENT_PORT_ENV: &str = "JAEGER_AGENT_PORT";
pub const TRACES_ENABLED_ENV: &str = "TRACES_ENABLED";
pub const TRACES_EXPORTER_ENV: &str = "TRACES_EXPORTER";
pub const APP_VERSION_ENV: &str = "APP_VERSION";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Configuration of a service that can be loaded with [`load`].
pub trait ServiceConfig: DeserializeOwned + Default {
    /// Prefix of every environment variable read for this service, e.g. `BACKEND_`.
    const PREFIX: &'static str;

    /// Apply overrides beyond the ones [`load`] already handles.
    fn apply_environment_overrides(&mut self, prefix: &str);
}

/// Load a service configuration.
///
/// Starts from `T::default()`, replaces it with the TOML file named by
/// `<PREFIX>CONFIG` when that variable is set, then lets the service apply its
/// environment overrides.
pub fn load<T: ServiceConfig>() -> Result<T, ConfigError> {
    let mut config = match env_string(&format!("{}CONFIG", T::PREFIX)) {
        Some(path) => from_file::<T>(Path::new(&path))?,
        None => T::default(),
    };
    config.apply_environment_overrides(T::PREFIX);
    Ok(config)
}

/// Parse a TOML configuration file. Missing keys fall back to the type's serde defaults.
pub fn from_file<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Resolve the port for a service from an environment variable.
///
/// Falls back to the provided default when the variable is missing or cannot be
/// parsed into a `u16`.
pub fn service_port(var: &str, default: u16) -> u16 {
    match env::var(var) {
        Ok(value) => value
            .parse::<u16>()
            .inspect_err(|error| {
                tracing::warn!(%var, %value, %error, "invalid port override, using default");
            })
            .unwrap_or(default),
        Err(_) => default,
    }
}

/// Read a non-empty environment variable.
pub fn env_string(var: &str) -> Option<String> {
    env::var(var).ok().filter(|value| !value.trim().is_empty())
}

/// Read a boolean flag (`1`, `true`, `yes`, `on` and their negations).
pub fn env_flag(var: &str) -> Option<bool> {
    let value = env_string(var)?;
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            tracing::warn!(%var, %value, "invalid boolean override, ignoring");
            None
        }
    }
}

/// Where finished spans go.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceExporterKind {
    /// OTLP over HTTP to the trace agent.
    #[default]
    Otlp,
    /// One JSON document per span on stdout.
    Stdout,
}

impl std::str::FromStr for TraceExporterKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "otlp" => Ok(Self::Otlp),
            "stdout" => Ok(Self::Stdout),
            other => Err(format!("unknown trace exporter {other:?}")),
        }
    }
}

/// Settings for the span exporter.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TracesConfig {
    pub agent_host: String,
    pub agent_port: u16,
    pub enabled: bool,
    pub exporter: TraceExporterKind,
}

impl Default for TracesConfig {
    fn default() -> Self {
        Self {
            agent_host: "localhost".to_string(),
            agent_port: 4318,
            enabled: true,
            exporter: TraceExporterKind::Otlp,
        }
    }
}

impl TracesConfig {
    pub fn apply_environment_overrides(&mut self) {
        if let Some(host) = env_string(TRACES_AGENT_HOST_ENV) {
            self.agent_host = host;
        }
        self.agent_port = service_port(TRACES_AGENT_PORT_ENV, self.agent_port);
        if let Some(enabled) = env_flag(TRACES_ENABLED_ENV) {
            self.enabled = enabled;
        }
        if let Some(value) = env_string(TRACES_EXPORTER_ENV) {
            match value.parse() {
                Ok(exporter) => self.exporter = exporter,
                Err(error) => tracing::warn!(%value, %error, "invalid trace exporter, ignoring"),
            }
        }
    }

    /// OTLP/HTTP traces endpoint on the agent host.
    pub fn otlp_endpoint(&self) -> String {
        format!("http://{}:{}/v1/traces", self.agent_host, self.agent_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;

    #[derive(Debug, Default, Deserialize)]
    #[serde(default)]
    struct SampleConfig {
        port: u16,
        traces: TracesConfig,
    }

    impl ServiceConfig for SampleConfig {
        const PREFIX: &'static str = "COMMON_CONFIG_SAMPLE_";

        fn apply_environment_overrides(&mut self, prefix: &str) {
            self.port = service_port(&format!("{prefix}PORT"), self.port);
        }
    }

    #[test]
    fn service_port_falls_back_on_garbage() {
        env::set_var("COMMON_CONFIG_TEST_BAD_PORT", "not-a-port");
        assert_eq!(service_port("COMMON_CONFIG_TEST_BAD_PORT", 8080), 8080);
        assert_eq!(service_port("COMMON_CONFIG_TEST_UNSET_PORT", 9000), 9000);
    }

    #[test]
    fn env_flag_parses_common_spellings() {
        env::set_var("COMMON_CONFIG_TEST_FLAG_ON", "Yes");
        env::set_var("COMMON_CONFIG_TEST_FLAG_OFF", "0");
        env::set_var("COMMON_CONFIG_TEST_FLAG_BAD", "maybe");
        assert_eq!(env_flag("COMMON_CONFIG_TEST_FLAG_ON"), Some(true));
        assert_eq!(env_flag("COMMON_CONFIG_TEST_FLAG_OFF"), Some(false));
        assert_eq!(env_flag("COMMON_CONFIG_TEST_FLAG_BAD"), None);
    }

    #[test]
    fn load_reads_file_then_environment() {
        let mut file = tempfile::NamedTempFile::new().expect("create config file");
        writeln!(
            file,
            "port = 7000\n[traces]\nagent_host = \"agent.local\"\nexporter = \"stdout\""
        )
        .expect("write");

        env::set_var("COMMON_CONFIG_SAMPLE_CONFIG", file.path());
        env::set_var("COMMON_CONFIG_SAMPLE_PORT", "7100");
        let config = load::<SampleConfig>().expect("load config");

        assert_eq!(config.port, 7100);
        assert_eq!(config.traces.agent_host, "agent.local");
        assert_eq!(config.traces.exporter, TraceExporterKind::Stdout);
        assert_eq!(
            config.traces.otlp_endpoint(),
            "http://agent.local:4318/v1/traces"
        );
        assert!(config.traces.enabled);
    }

    #[test]
    fn unreadable_file_is_reported() {
        let err = from_file::<SampleConfig>(Path::new("/nonexistent/common-config.toml"))
            .expect_err("missing file");
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
