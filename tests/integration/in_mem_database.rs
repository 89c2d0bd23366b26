//! Integration tests for the in-memory database behind the service dispatcher

use std::sync::Arc;

use parking_lot::Mutex;
use sceneflow::{new_trace, Atom, AtomReader, AtomRegistry, ChangePolicy, Record, Scene, SceneError, StoreError};
use serde_json::json;

use super::test_utils::in_mem_conf;

fn props(value: serde_json::Value) -> Record {
    value.as_object().cloned().unwrap_or_default()
}

#[tokio::test]
async fn test_insert_query_delete() {
    let tables = Arc::new(AtomRegistry::new());
    let products = tables.register("Product");
    let (conf, database) = in_mem_conf(tables);

    let trace = Arc::new(new_trace("test"));
    let scene = Scene::new(trace.clone(), conf.clone());
    let table = products.clone();
    let inserted = scene
        .execute(None, |scene| async move {
            scene
                .use_database()?
                .insert(&table, props(json!({"name": "apple"})))
                .await
        })
        .await
        .unwrap();
    assert_eq!(inserted["id"], json!("~1000"));
    assert_eq!(database.len(&products), 1);

    let scene = Scene::new(trace.clone(), conf.clone());
    let table = products.clone();
    let found = scene
        .execute(None, |scene| async move {
            scene
                .use_database()?
                .query(&table, props(json!({"name": "apple"})))
                .await
        })
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0]["name"], json!("apple"));

    let scene = Scene::new(trace.clone(), conf.clone());
    let table = products.clone();
    let found = scene
        .execute(None, |scene| async move {
            let db = scene.use_database()?;
            db.delete(&table, inserted).await?;
            db.query(&table, props(json!({"name": "apple"}))).await
        })
        .await
        .unwrap();
    assert!(found.is_empty());
    assert!(database.is_empty(&products));
}

#[tokio::test]
async fn test_update_replaces_record() {
    let tables = Arc::new(AtomRegistry::new());
    let products = tables.register("Product");
    let (conf, _database) = in_mem_conf(tables);

    let scene = Scene::new(new_trace("test"), conf);
    let found = scene
        .execute(None, |scene| async move {
            let db = scene.use_database()?;
            let mut record = db.insert(&products, props(json!({"name": "apple"}))).await?;
            record.insert("name".to_string(), json!("pear"));
            db.update(&products, record).await?;
            db.query(&products, Record::new()).await
        })
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0]["name"], json!("pear"));
}

#[tokio::test]
async fn test_writes_report_changes_and_queries_report_reads() {
    let tables = Arc::new(AtomRegistry::new());
    let products = tables.register("Product");
    let (conf, _database) = in_mem_conf(tables);

    let changes = Arc::new(Mutex::new(Vec::new()));
    let recorded = changes.clone();
    let scene = Scene::with_policy(
        new_trace("test"),
        conf,
        ChangePolicy::new(move |_, atom| {
            recorded.lock().push(atom.clone());
            Ok(())
        }),
    );
    let reads = Arc::new(Reads::default());
    let table = products.clone();
    scene
        .execute(Some(reads.clone() as Arc<dyn AtomReader>), |scene| async move {
            let db = scene.use_database()?;
            db.insert(&table, props(json!({"name": "apple"}))).await?;
            db.query(&table, Record::new()).await?;
            Ok(())
        })
        .await
        .unwrap();

    assert_eq!(*changes.lock(), vec![products.atom().clone()]);
    assert_eq!(*reads.0.lock(), vec![products.atom().clone()]);
}

#[derive(Default)]
struct Reads(Mutex<Vec<Atom>>);

impl AtomReader for Reads {
    fn on_atom_read(&self, atom: &Atom) {
        self.0.lock().push(atom.clone());
    }
}

#[tokio::test]
async fn test_store_errors() {
    let tables = Arc::new(AtomRegistry::new());
    let products = tables.register("Product");
    let (conf, _database) = in_mem_conf(tables);

    let scene = Scene::new(new_trace("test"), conf);
    scene
        .execute(None, |scene| async move {
            let db = scene.use_database()?;
            let err = db.update(&products, props(json!({"name": "x"}))).await.unwrap_err();
            assert!(matches!(err, SceneError::Store(StoreError::MissingId(_))));
            let err = db.execute_sql("select 1", Record::new()).await.unwrap_err();
            assert!(matches!(err, SceneError::Store(StoreError::Unsupported(_))));

            let unknown = scene.use_service("db", 0)?;
            let err = unknown
                .call("query", vec![json!("Nope"), json!({})])
                .await
                .unwrap_err();
            assert!(matches!(err, SceneError::Store(StoreError::UnknownTable(_))));
            Ok(())
        })
        .await
        .unwrap();
}
