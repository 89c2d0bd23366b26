//! Shared test utilities for integration tests
//!
//! Isolated XDG directories for config tests, and in-process RPC servers and
//! database-backed scene configurations for everything else.

use std::sync::{Arc, Mutex};

use sceneflow::config::{ClientConfig, DiscoveryConfig};
use sceneflow::io::{InMemDatabase, NotImplementedService, ServiceDispatcher};
use sceneflow::{AtomRegistry, HttpRpcClient, HttpRpcServer, IoConf, OperationRegistry};
use tempfile::TempDir;
use tokio::net::TcpListener;

/// Global mutex to serialize environment variable access across all tests
static ENV_MUTEX: Mutex<()> = Mutex::new(());

/// Environment variable state to restore after test
struct EnvState {
    xdg_config_home: Option<String>,
    sceneflow_env: Option<String>,
}

impl EnvState {
    fn capture() -> Self {
        Self {
            xdg_config_home: std::env::var("XDG_CONFIG_HOME").ok(),
            sceneflow_env: std::env::var("SCENEFLOW_ENV").ok(),
        }
    }

    fn restore(self) {
        restore_var("XDG_CONFIG_HOME", self.xdg_config_home);
        restore_var("SCENEFLOW_ENV", self.sceneflow_env);
    }
}

fn restore_var(name: &str, value: Option<String>) {
    match value {
        Some(value) => std::env::set_var(name, value),
        None => std::env::remove_var(name),
    }
}

/// Run `f` with XDG_CONFIG_HOME pointing into `test_dir` and extra env vars set
///
/// Uses a global mutex so parallel tests never observe each other's
/// environment, and restores the original environment afterwards.
pub fn with_config_env<F, R>(test_dir: &TempDir, vars: &[(&str, &str)], f: F) -> R
where
    F: FnOnce() -> R,
{
    let _guard = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
    let env_state = EnvState::capture();

    std::env::set_var("XDG_CONFIG_HOME", test_dir.path().join("xdg"));
    for (name, value) in vars {
        std::env::set_var(name, value);
    }

    let result = f();

    for (name, _) in vars {
        std::env::remove_var(name);
    }
    env_state.restore();

    result
}

/// Scene configuration backed by a fresh in-memory database under the `db` service
pub fn in_mem_conf(tables: Arc<AtomRegistry>) -> (IoConf, Arc<InMemDatabase>) {
    let database = Arc::new(InMemDatabase::new());
    let dispatcher = ServiceDispatcher::new(
        database.clone(),
        tables,
        Arc::new(NotImplementedService),
    );
    let conf = IoConf::new(Arc::new(dispatcher)).with_tenant("db", "default");
    (conf, database)
}

/// Serve `operations` on an ephemeral local port and return the port
pub async fn spawn_server(io_conf: IoConf, operations: OperationRegistry) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = HttpRpcServer::new(io_conf, Arc::new(operations));
    tokio::spawn(server.serve(listener));
    port
}

/// Client routing service `remote` to the local server on `port`
pub fn client_for(port: u16, atoms: Arc<AtomRegistry>) -> Arc<HttpRpcClient> {
    let discovery = DiscoveryConfig::default().with_route("remote", "127.0.0.1", port);
    Arc::new(HttpRpcClient::new(ClientConfig::default(), discovery, atoms).unwrap())
}
