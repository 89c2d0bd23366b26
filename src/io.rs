//! I/O interfaces consumed by scenes.
//!
//! Scenes never talk to storage or remote services directly. Everything goes
//! through the [`Service`] held in the scene's [`IoConf`]; a [`Database`] is
//! usually reached through [`ServiceDispatcher`] under the `db` service name.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::atom::Table;
use crate::error::SceneError;
use crate::scene::Scene;

pub mod dispatcher;
pub mod in_mem;

pub use dispatcher::{ServiceDispatcher, DATABASE_SERVICE};
pub use in_mem::InMemDatabase;

/// One row, as a JSON object.
pub type Record = serde_json::Map<String, Value>;

/// Relational store used through a scene.
///
/// Every mutating call reports the table changed through
/// [`Scene::on_atom_changed`]; every query reports the table read through
/// [`Scene::on_atom_read`] before returning.
#[async_trait]
pub trait Database: Send + Sync {
    /// Insert a row and return it, including its assigned id.
    async fn insert(&self, scene: &Scene, table: &Table, props: Record)
        -> Result<Record, SceneError>;

    /// Rows whose fields equal every entry of `criteria`.
    async fn query(
        &self,
        scene: &Scene,
        table: &Table,
        criteria: Record,
    ) -> Result<Vec<Record>, SceneError>;

    async fn update(&self, scene: &Scene, table: &Table, props: Record) -> Result<(), SceneError>;

    async fn delete(&self, scene: &Scene, table: &Table, props: Record) -> Result<(), SceneError>;

    /// Run raw SQL. Implementations do not parse it, so callers report their own reads.
    async fn execute_sql(
        &self,
        scene: &Scene,
        sql: &str,
        vars: Record,
    ) -> Result<Vec<Record>, SceneError>;

    async fn begin_transaction(&self, scene: &Scene) -> Result<(), SceneError>;

    async fn commit(&self, scene: &Scene) -> Result<(), SceneError>;

    async fn rollback(&self, scene: &Scene) -> Result<(), SceneError>;

    async fn on_scene_finished(&self, scene: &Scene) -> Result<(), SceneError>;
}

/// A remote method call made on behalf of a scene.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceRequest {
    pub service_name: String,
    /// TCP port of the service; 0 means "use discovery"
    pub service_port: u16,
    pub tenant_name: String,
    /// Token and other per-tenant call context
    pub context: Record,
    pub method_name: String,
    pub args: Vec<Value>,
}

/// Remote method dispatcher.
#[async_trait]
pub trait Service: Send + Sync {
    /// Call a remote method. A remote failure is returned as an error carrying
    /// the remote message.
    async fn call_method(&self, scene: &Scene, request: ServiceRequest)
        -> Result<Value, SceneError>;

    async fn on_scene_finished(&self, scene: &Scene) -> Result<(), SceneError>;
}

/// Dispatcher used when none is configured.
pub struct NotImplementedService;

#[async_trait]
impl Service for NotImplementedService {
    async fn call_method(
        &self,
        _scene: &Scene,
        request: ServiceRequest,
    ) -> Result<Value, SceneError> {
        Err(SceneError::Other(anyhow::anyhow!(
            "not implemented: {}.{}",
            request.service_name,
            request.method_name
        )))
    }

    async fn on_scene_finished(&self, _scene: &Scene) -> Result<(), SceneError> {
        Ok(())
    }
}

/// I/O configuration of a scene, fixed for the scene's lifetime.
///
/// Cheap to clone and safe to share between concurrently executing scenes.
#[derive(Clone)]
pub struct IoConf {
    pub service: Arc<dyn Service>,
    /// Default tenant per service name
    pub tenants: HashMap<String, String>,
    /// Call context keyed by `service/tenant`
    pub contexts: HashMap<String, Record>,
}

impl IoConf {
    pub fn new(service: Arc<dyn Service>) -> Self {
        Self {
            service,
            tenants: HashMap::new(),
            contexts: HashMap::new(),
        }
    }

    pub fn with_tenant(mut self, service_name: &str, tenant_name: &str) -> Self {
        self.tenants
            .insert(service_name.to_string(), tenant_name.to_string());
        self
    }

    pub fn with_context(mut self, service_name: &str, tenant_name: &str, context: Record) -> Self {
        self.contexts
            .insert(context_key(service_name, tenant_name), context);
        self
    }

    pub fn context_for(&self, service_name: &str, tenant_name: &str) -> Option<&Record> {
        self.contexts.get(&context_key(service_name, tenant_name))
    }
}

impl Default for IoConf {
    fn default() -> Self {
        Self::new(Arc::new(NotImplementedService))
    }
}

pub(crate) fn context_key(service_name: &str, tenant_name: &str) -> String {
    format!("{}/{}", service_name, tenant_name)
}
