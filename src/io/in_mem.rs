//! In-memory [`Database`], for tests and local development.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use super::{Database, Record};
use crate::atom::Table;
use crate::error::{SceneError, StoreError};
use crate::scene::Scene;

const FIRST_ID: u64 = 1000;

/// Tables held in process memory. Transactions are accepted and ignored.
pub struct InMemDatabase {
    tables: Mutex<HashMap<String, BTreeMap<String, Record>>>,
    next_id: AtomicU64,
}

impl InMemDatabase {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(FIRST_ID),
        }
    }

    fn next_id(&self) -> String {
        format!("~{}", self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn len(&self, table: &Table) -> usize {
        self.tables
            .lock()
            .get(table.name())
            .map(BTreeMap::len)
            .unwrap_or(0)
    }

    pub fn is_empty(&self, table: &Table) -> bool {
        self.len(table) == 0
    }
}

impl Default for InMemDatabase {
    fn default() -> Self {
        Self::new()
    }
}

fn id_key(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn required_id(table: &Table, props: &Record) -> Result<String, StoreError> {
    match props.get("id") {
        Some(id) if !id.is_null() => Ok(id_key(id)),
        _ => Err(StoreError::MissingId(table.name().to_string())),
    }
}

fn is_match(record: &Record, criteria: &Record) -> bool {
    criteria
        .iter()
        .all(|(field, expected)| record.get(field).unwrap_or(&Value::Null) == expected)
}

#[async_trait]
impl Database for InMemDatabase {
    async fn insert(
        &self,
        scene: &Scene,
        table: &Table,
        props: Record,
    ) -> Result<Record, SceneError> {
        let mut record = props;
        let id = match record.get("id") {
            Some(id) if !id.is_null() => id.clone(),
            _ => Value::String(self.next_id()),
        };
        record.insert("id".to_string(), id.clone());
        self.tables
            .lock()
            .entry(table.name().to_string())
            .or_default()
            .insert(id_key(&id), record.clone());
        scene.on_atom_changed(table.atom())?;
        Ok(record)
    }

    async fn query(
        &self,
        scene: &Scene,
        table: &Table,
        criteria: Record,
    ) -> Result<Vec<Record>, SceneError> {
        scene.on_atom_read(table.atom())?;
        let tables = self.tables.lock();
        Ok(tables
            .get(table.name())
            .map(|rows| {
                rows.values()
                    .filter(|record| is_match(record, &criteria))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn update(&self, scene: &Scene, table: &Table, props: Record) -> Result<(), SceneError> {
        let id = required_id(table, &props)?;
        self.tables
            .lock()
            .entry(table.name().to_string())
            .or_default()
            .insert(id, props);
        scene.on_atom_changed(table.atom())
    }

    async fn delete(&self, scene: &Scene, table: &Table, props: Record) -> Result<(), SceneError> {
        let id = required_id(table, &props)?;
        if let Some(rows) = self.tables.lock().get_mut(table.name()) {
            rows.remove(&id);
        }
        scene.on_atom_changed(table.atom())
    }

    async fn execute_sql(
        &self,
        _scene: &Scene,
        _sql: &str,
        _vars: Record,
    ) -> Result<Vec<Record>, SceneError> {
        Err(StoreError::Unsupported("executeSql".to_string()).into())
    }

    async fn begin_transaction(&self, _scene: &Scene) -> Result<(), SceneError> {
        Ok(())
    }

    async fn commit(&self, _scene: &Scene) -> Result<(), SceneError> {
        Ok(())
    }

    async fn rollback(&self, _scene: &Scene) -> Result<(), SceneError> {
        Ok(())
    }

    async fn on_scene_finished(&self, _scene: &Scene) -> Result<(), SceneError> {
        Ok(())
    }
}
