//! Service configuration loading.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use smol_str::SmolStr;

use crate::error::RuntimeError;
use crate::front::codec::MAX_TRACE_BACKLOG;
use crate::loader::LoaderKind;

/// File looked up in the working directory when no `--config` is given.
pub const CONFIG_FILE_NAME: &str = "service.toml";

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_INTERFACE: &str = "localhost";
pub const DEFAULT_START_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_TRACE_IDLE_SUSPEND_MS: u64 = 3_000;
pub const DEFAULT_TRACE_BUFFER_LIMIT: usize = 1 << 20;

/// Wire bindings the service listens with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Binding {
    #[default]
    Binary,
    Json,
    Both,
}

impl Binding {
    #[must_use]
    pub fn binary(self) -> bool {
        matches!(self, Self::Binary | Self::Both)
    }

    #[must_use]
    pub fn json(self) -> bool {
        matches!(self, Self::Json | Self::Both)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityConfig {
    /// Create an identity on first start when none is stored.
    pub generate: bool,
    /// Overrides `<working_dir>/psk.secret`.
    pub secret_file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    pub name: Option<SmolStr>,
    pub interface: SmolStr,
    pub port: u16,
    pub json_port: u16,
    pub binding: Binding,
    pub autostart: bool,
    /// `None` waits for the program's start routine forever.
    pub start_timeout: Option<Duration>,
    pub trace_idle_suspend: Duration,
    pub trace_buffer_limit: usize,
    pub loader: LoaderKind,
    pub identity: IdentityConfig,
    pub require_psk: bool,
    pub log_level: SmolStr,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: None,
            interface: SmolStr::new(DEFAULT_INTERFACE),
            port: DEFAULT_PORT,
            json_port: DEFAULT_PORT + 1,
            binding: Binding::default(),
            autostart: false,
            start_timeout: Some(Duration::from_millis(DEFAULT_START_TIMEOUT_MS)),
            trace_idle_suspend: Duration::from_millis(DEFAULT_TRACE_IDLE_SUSPEND_MS),
            trace_buffer_limit: DEFAULT_TRACE_BUFFER_LIMIT,
            loader: LoaderKind::default(),
            identity: IdentityConfig {
                generate: true,
                secret_file: None,
            },
            require_psk: false,
            log_level: SmolStr::new("info"),
        }
    }
}

impl ServiceConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RuntimeError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|err| {
            RuntimeError::InvalidConfig(format!("{}: {err}", path.display()).into())
        })?;
        Self::from_toml_str(&text)
    }

    /// Load `--config` if given, else `<working_dir>/service.toml` if present,
    /// else defaults.
    pub fn discover(explicit: Option<&Path>, working_dir: &Path) -> Result<Self, RuntimeError> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        let candidate = working_dir.join(CONFIG_FILE_NAME);
        if candidate.is_file() {
            return Self::load(candidate);
        }
        Ok(Self::default())
    }

    pub fn from_toml_str(text: &str) -> Result<Self, RuntimeError> {
        let raw: ServiceToml = toml::from_str(text)
            .map_err(|err| RuntimeError::InvalidConfig(format!("service.toml: {err}").into()))?;
        raw.into_config()
    }

    /// Whether the configured interface is the loopback or unspecified.
    #[must_use]
    pub fn is_local_only(&self) -> bool {
        matches!(self.interface.as_str(), "" | "localhost" | "127.0.0.1" | "::1")
    }

    pub fn secret_path(&self, working_dir: &Path) -> PathBuf {
        self.identity
            .secret_file
            .clone()
            .unwrap_or_else(|| working_dir.join(crate::identity::SECRET_FILE_NAME))
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ServiceToml {
    service: Option<ServiceSection>,
    runtime: Option<RuntimeSection>,
    identity: Option<IdentitySection>,
    auth: Option<AuthSection>,
    log: Option<LogSection>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ServiceSection {
    name: Option<String>,
    interface: Option<String>,
    port: Option<u16>,
    json_port: Option<u16>,
    binding: Option<Binding>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuntimeSection {
    autostart: Option<bool>,
    start_timeout_ms: Option<u64>,
    trace_idle_suspend_ms: Option<u64>,
    trace_buffer_limit: Option<usize>,
    loader: Option<LoaderKind>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct IdentitySection {
    generate: Option<bool>,
    secret_file: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct AuthSection {
    require_psk: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct LogSection {
    level: Option<String>,
}

impl ServiceToml {
    fn into_config(self) -> Result<ServiceConfig, RuntimeError> {
        let defaults = ServiceConfig::default();
        let service = self.service.unwrap_or_default();
        let runtime = self.runtime.unwrap_or_default();
        let identity = self.identity.unwrap_or_default();
        let auth = self.auth.unwrap_or_default();
        let log = self.log.unwrap_or_default();

        let name = match service.name {
            Some(name) if name.trim().is_empty() => {
                return Err(RuntimeError::InvalidConfig(
                    "service.name must not be empty".into(),
                ))
            }
            other => other.map(SmolStr::new),
        };
        let port = service.port.unwrap_or(defaults.port);
        let json_port = service.json_port.unwrap_or_else(|| port.saturating_add(1));
        let binding = service.binding.unwrap_or_default();
        if binding == Binding::Both && port == json_port && port != 0 {
            return Err(RuntimeError::InvalidConfig(
                "service.json_port must differ from service.port".into(),
            ));
        }
        let trace_buffer_limit = runtime
            .trace_buffer_limit
            .unwrap_or(defaults.trace_buffer_limit);
        if trace_buffer_limit == 0 || trace_buffer_limit > MAX_TRACE_BACKLOG {
            return Err(RuntimeError::InvalidConfig(
                format!("runtime.trace_buffer_limit must be in 1..={MAX_TRACE_BACKLOG}").into(),
            ));
        }
        let start_timeout = match runtime.start_timeout_ms {
            Some(0) => None,
            Some(ms) => Some(Duration::from_millis(ms)),
            None => defaults.start_timeout,
        };
        let log_level = log.level.map_or(defaults.log_level, SmolStr::new);
        if !matches!(
            log_level.as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        ) {
            return Err(RuntimeError::InvalidConfig(
                format!("log.level '{log_level}' is not a tracing level").into(),
            ));
        }

        Ok(ServiceConfig {
            name,
            interface: service
                .interface
                .map_or(defaults.interface, SmolStr::new),
            port,
            json_port,
            binding,
            autostart: runtime.autostart.unwrap_or(defaults.autostart),
            start_timeout,
            trace_idle_suspend: runtime
                .trace_idle_suspend_ms
                .map_or(defaults.trace_idle_suspend, Duration::from_millis),
            trace_buffer_limit,
            loader: runtime.loader.unwrap_or(defaults.loader),
            identity: IdentityConfig {
                generate: identity.generate.unwrap_or(defaults.identity.generate),
                secret_file: identity.secret_file,
            },
            require_psk: auth.require_psk.unwrap_or(defaults.require_psk),
            log_level,
        })
    }
}
