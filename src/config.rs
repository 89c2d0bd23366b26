//! Configuration System
//!
//! Layered configuration for RPC servers and clients: built-in defaults, the
//! global config file, project config files and `SCENEFLOW__` environment
//! variables, in increasing order of precedence. Loaded once at process startup
//! and passed explicitly to whatever needs it.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use config::{Config, File};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{RpcError, SceneError};
use crate::io::{context_key, IoConf, Record, Service};
use crate::logging::LoggingConfig;

mod merge;
mod sources;

pub use sources::global_file::global_config_path;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SceneflowConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub client: ClientConfig,

    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Default tenant per service name
    #[serde(default)]
    pub tenants: HashMap<String, String>,

    /// Call context per `service/tenant`
    #[serde(default)]
    pub contexts: HashMap<String, Record>,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where the RPC server listens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// 0 lets the OS pick a port
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

/// Batching and HTTP settings of the RPC client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Maximum jobs per HTTP request
    #[serde(default = "default_batch_size_limit")]
    pub batch_size_limit: usize,

    /// Extra time to wait for more jobs before cutting a batch. The
    /// multi-threaded runtime never waits less than
    /// [`crate::batch::MULTI_THREAD_MIN_WINDOW`].
    #[serde(default)]
    pub batch_window_ms: u64,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_batch_size_limit() -> usize {
    100
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_request_timeout_secs() -> u64 {
    120
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            batch_size_limit: default_batch_size_limit(),
            batch_window_ms: 0,
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl ClientConfig {
    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Network location of one service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub host: String,
    pub port: u16,
}

/// Static service discovery.
///
/// A service with an explicit route goes there. Otherwise the service name is
/// used as the host name together with the port the caller asked for; a caller
/// that asked for port 0 cannot be routed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default)]
    pub routes: HashMap<String, Route>,
}

impl DiscoveryConfig {
    pub fn with_route(mut self, service_name: &str, host: &str, port: u16) -> Self {
        self.routes.insert(
            service_name.to_string(),
            Route {
                host: host.to_string(),
                port,
            },
        );
        self
    }

    pub fn resolve(&self, service_name: &str, service_port: u16) -> Result<Route, RpcError> {
        if let Some(route) = self.routes.get(service_name) {
            return Ok(route.clone());
        }
        if service_port == 0 {
            return Err(RpcError::UnknownRoute(service_name.to_string()));
        }
        Ok(Route {
            host: service_name.to_string(),
            port: service_port,
        })
    }
}

/// Configuration validation errors
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    Client(String),
    Route(String, String),
    Tenant(String, String),
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::Client(msg) => write!(f, "Client: {}", msg),
            ValidationError::Route(name, msg) => write!(f, "Route '{}': {}", name, msg),
            ValidationError::Tenant(name, msg) => write!(f, "Tenant of '{}': {}", name, msg),
        }
    }
}

impl std::error::Error for ValidationError {}

impl SceneflowConfig {
    /// Validate the entire configuration, reporting every problem found
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if self.client.batch_size_limit == 0 {
            errors.push(ValidationError::Client(
                "batch_size_limit must be greater than 0".to_string(),
            ));
        }

        for (name, route) in &self.discovery.routes {
            if route.host.trim().is_empty() {
                errors.push(ValidationError::Route(
                    name.clone(),
                    "host cannot be empty".to_string(),
                ));
            }
            if route.port == 0 {
                errors.push(ValidationError::Route(
                    name.clone(),
                    "port cannot be 0".to_string(),
                ));
            }
        }

        for (service, tenant) in &self.tenants {
            if tenant.trim().is_empty() {
                errors.push(ValidationError::Tenant(
                    service.clone(),
                    "tenant name cannot be empty".to_string(),
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// I/O configuration for scenes calling through `service`
    pub fn io_conf(&self, service: Arc<dyn Service>) -> IoConf {
        let mut conf = IoConf::new(service);
        conf.tenants = self.tenants.clone();
        conf.contexts = self.contexts.clone();
        conf
    }

    /// Call context of `service_name` for `tenant_name`, if configured
    pub fn context(&self, service_name: &str, tenant_name: &str) -> Option<&Record> {
        self.contexts.get(&context_key(service_name, tenant_name))
    }
}

/// Builds a [`SceneflowConfig`] from its sources.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration for the project rooted at `project_root`.
    ///
    /// Precedence, lowest first: defaults, global file, `config/config.toml`,
    /// `config/{SCENEFLOW_ENV}.toml`, `SCENEFLOW__*` environment variables.
    pub fn load(project_root: &Path) -> Result<SceneflowConfig, SceneError> {
        let builder = merge::builder_with_defaults()?;
        let builder = sources::global_file::add_to_builder(builder)?;
        let builder = sources::project_file::add_to_builder(builder, project_root)?;
        let builder = sources::env::add_to_builder(builder);

        let config: SceneflowConfig = builder.build()?.try_deserialize()?;
        debug!(
            project_root = %project_root.display(),
            routes = config.discovery.routes.len(),
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Load one explicit file over the defaults, ignoring every other source.
    pub fn load_from_file(path: &Path) -> Result<SceneflowConfig, SceneError> {
        let config = merge::builder_with_defaults()?
            .add_source(File::from(path).required(true))
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    /// Defaults only.
    pub fn defaults() -> Result<SceneflowConfig, SceneError> {
        let config: Config = merge::builder_with_defaults()?.build()?;
        Ok(config.try_deserialize()?)
    }
}
