//! Routes `db` calls to a [`Database`] and everything else to a remote service.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::{Database, Record, Service, ServiceRequest};
use crate::atom::{AtomRegistry, Table};
use crate::error::{SceneError, StoreError};
use crate::scene::Scene;

/// Service name under which the database is reached.
pub const DATABASE_SERVICE: &str = "db";

pub struct ServiceDispatcher {
    database: Arc<dyn Database>,
    tables: Arc<AtomRegistry>,
    default_service: Arc<dyn Service>,
}

impl ServiceDispatcher {
    pub fn new(
        database: Arc<dyn Database>,
        tables: Arc<AtomRegistry>,
        default_service: Arc<dyn Service>,
    ) -> Self {
        Self {
            database,
            tables,
            default_service,
        }
    }

    async fn call_database(
        &self,
        scene: &Scene,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, SceneError> {
        let db = &self.database;
        match method {
            "insert" => {
                let (table, props) = self.table_and_record(method, args)?;
                Ok(Value::Object(db.insert(scene, &table, props).await?))
            }
            "query" => {
                let (table, criteria) = self.table_and_record(method, args)?;
                let rows = db.query(scene, &table, criteria).await?;
                Ok(Value::Array(rows.into_iter().map(Value::Object).collect()))
            }
            "update" => {
                let (table, props) = self.table_and_record(method, args)?;
                db.update(scene, &table, props).await?;
                Ok(Value::Null)
            }
            "delete" => {
                let (table, props) = self.table_and_record(method, args)?;
                db.delete(scene, &table, props).await?;
                Ok(Value::Null)
            }
            "executeSql" => {
                let mut args = args.into_iter();
                let sql = match args.next() {
                    Some(Value::String(sql)) => sql,
                    _ => return Err(invalid(method, "first argument must be the sql string")),
                };
                let vars = record_arg(method, args.next())?;
                let rows = db.execute_sql(scene, &sql, vars).await?;
                Ok(Value::Array(rows.into_iter().map(Value::Object).collect()))
            }
            "beginTransaction" => {
                db.begin_transaction(scene).await?;
                Ok(Value::Null)
            }
            "commit" => {
                db.commit(scene).await?;
                Ok(Value::Null)
            }
            "rollback" => {
                db.rollback(scene).await?;
                Ok(Value::Null)
            }
            other => Err(StoreError::Unsupported(other.to_string()).into()),
        }
    }

    fn table_and_record(
        &self,
        method: &str,
        args: Vec<Value>,
    ) -> Result<(Table, Record), SceneError> {
        let mut args = args.into_iter();
        let table = match args.next() {
            Some(Value::String(name)) => self.tables.table(&name)?,
            _ => return Err(invalid(method, "first argument must be the table name")),
        };
        Ok((table, record_arg(method, args.next())?))
    }
}

fn record_arg(method: &str, arg: Option<Value>) -> Result<Record, SceneError> {
    match arg {
        None | Some(Value::Null) => Ok(Record::new()),
        Some(Value::Object(record)) => Ok(record),
        Some(_) => Err(invalid(method, "record argument must be an object")),
    }
}

fn invalid(method: &str, reason: &str) -> SceneError {
    StoreError::InvalidArguments {
        method: method.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

#[async_trait]
impl Service for ServiceDispatcher {
    async fn call_method(
        &self,
        scene: &Scene,
        request: ServiceRequest,
    ) -> Result<Value, SceneError> {
        if request.service_name == DATABASE_SERVICE {
            return self
                .call_database(scene, &request.method_name, request.args)
                .await;
        }
        self.default_service.call_method(scene, request).await
    }

    async fn on_scene_finished(&self, scene: &Scene) -> Result<(), SceneError> {
        let (database, service) = futures::future::join(
            self.database.on_scene_finished(scene),
            self.default_service.on_scene_finished(scene),
        )
        .await;
        database?;
        service
    }
}
