//! Typed stubs for calling remote services through a scene.

use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use super::Scene;
use crate::atom::Table;
use crate::error::{RpcError, SceneError};
use crate::io::{Record, ServiceRequest, DATABASE_SERVICE};

/// Calls methods of one service on behalf of a scene.
pub struct ServiceStub<'a> {
    scene: &'a Scene,
    service_name: String,
    service_port: u16,
    tenant_name: Option<String>,
    context: Option<Record>,
}

impl<'a> ServiceStub<'a> {
    pub(crate) fn new(scene: &'a Scene, service_name: &str, service_port: u16) -> Self {
        Self {
            scene,
            service_name: service_name.to_string(),
            service_port,
            tenant_name: None,
            context: None,
        }
    }

    /// Call a tenant other than the configured default.
    pub fn with_tenant(mut self, tenant_name: impl Into<String>) -> Self {
        self.tenant_name = Some(tenant_name.into());
        self
    }

    /// Send this context instead of the configured one.
    pub fn with_context(mut self, context: Record) -> Self {
        self.context = Some(context);
        self
    }

    /// Build the request for `method_name` without sending it.
    pub fn request(&self, method_name: &str, args: Vec<Value>) -> Result<ServiceRequest, SceneError> {
        let conf = self.scene.conf();
        let tenant_name = self
            .tenant_name
            .clone()
            .or_else(|| conf.tenants.get(&self.service_name).cloned())
            .ok_or(RpcError::UnknownTenant)?;
        let context = self
            .context
            .clone()
            .or_else(|| conf.context_for(&self.service_name, &tenant_name).cloned())
            .unwrap_or_default();
        Ok(ServiceRequest {
            service_name: self.service_name.clone(),
            service_port: self.service_port,
            tenant_name,
            context,
            method_name: method_name.to_string(),
            args,
        })
    }

    pub async fn call(&self, method_name: &str, args: Vec<Value>) -> Result<Value, SceneError> {
        let request = self.request(method_name, args)?;
        self.scene
            .conf()
            .service
            .call_method(self.scene, request)
            .await
    }

    /// Call and decode the result into `T`.
    pub async fn call_as<T: DeserializeOwned>(
        &self,
        method_name: &str,
        args: Vec<Value>,
    ) -> Result<T, SceneError> {
        let value = self.call(method_name, args).await?;
        Ok(serde_json::from_value(value)?)
    }
}

/// Database calls routed through the `db` service.
pub struct DatabaseStub<'a> {
    service: ServiceStub<'a>,
}

impl<'a> DatabaseStub<'a> {
    pub(crate) fn new(scene: &'a Scene) -> Self {
        Self {
            service: ServiceStub::new(scene, DATABASE_SERVICE, 0),
        }
    }

    pub async fn insert(&self, table: &Table, props: Record) -> Result<Record, SceneError> {
        self.service
            .call_as("insert", vec![json!(table.name()), Value::Object(props)])
            .await
    }

    pub async fn query(&self, table: &Table, criteria: Record) -> Result<Vec<Record>, SceneError> {
        self.service
            .call_as("query", vec![json!(table.name()), Value::Object(criteria)])
            .await
    }

    pub async fn update(&self, table: &Table, props: Record) -> Result<(), SceneError> {
        self.service
            .call("update", vec![json!(table.name()), Value::Object(props)])
            .await?;
        Ok(())
    }

    pub async fn delete(&self, table: &Table, props: Record) -> Result<(), SceneError> {
        self.service
            .call("delete", vec![json!(table.name()), Value::Object(props)])
            .await?;
        Ok(())
    }

    pub async fn execute_sql(&self, sql: &str, vars: Record) -> Result<Vec<Record>, SceneError> {
        self.service
            .call_as("executeSql", vec![json!(sql), Value::Object(vars)])
            .await
    }

    pub async fn begin_transaction(&self) -> Result<(), SceneError> {
        self.service.call("beginTransaction", Vec::new()).await?;
        Ok(())
    }

    pub async fn commit(&self) -> Result<(), SceneError> {
        self.service.call("commit", Vec::new()).await?;
        Ok(())
    }

    pub async fn rollback(&self) -> Result<(), SceneError> {
        self.service.call("rollback", Vec::new()).await?;
        Ok(())
    }
}
