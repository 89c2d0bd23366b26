//! Read tracking around nested async work

use std::sync::Arc;

use parking_lot::Mutex;
use sceneflow::{new_trace, Atom, AtomReader, AtomRegistry, Record, Scene, Table};

use super::test_utils::in_mem_conf;

#[derive(Default)]
struct Reads(Mutex<Vec<Atom>>);

impl Reads {
    fn names(&self) -> Vec<String> {
        self.0
            .lock()
            .iter()
            .filter_map(|atom| atom.name().map(str::to_string))
            .collect()
    }
}

impl AtomReader for Reads {
    fn on_atom_read(&self, atom: &Atom) {
        self.0.lock().push(atom.clone());
    }
}

async fn load_products(scene: &Scene, table: &Table) -> Result<usize, sceneflow::SceneError> {
    tokio::task::yield_now().await;
    Ok(scene.use_database()?.query(table, Record::new()).await?.len())
}

#[tokio::test]
async fn test_tracked_scope_sees_nested_read_once() {
    let tables = Arc::new(AtomRegistry::new());
    let products = tables.register("Product");
    let (conf, _database) = in_mem_conf(tables);

    let reads = Arc::new(Reads::default());
    let tracker = reads.clone();
    let scene = Scene::new(new_trace("test"), conf);
    scene
        .execute(None, |scene| async move {
            scene
                .track_atom_read(tracker.clone(), load_products(&scene, &products))
                .await?;
            assert_eq!(tracker.names(), vec!["Product".to_string()]);

            // The scope has exited, so this read goes unnoticed.
            load_products(&scene, &products).await?;
            Ok(())
        })
        .await
        .unwrap();

    assert_eq!(reads.names(), vec!["Product".to_string()]);
}

#[tokio::test]
async fn test_overlapping_scopes_both_see_reads() {
    let tables = Arc::new(AtomRegistry::new());
    let products = tables.register("Product");
    let orders = tables.register("Order");
    let (conf, _database) = in_mem_conf(tables);

    let outer = Arc::new(Reads::default());
    let inner = Arc::new(Reads::default());
    let scene = Scene::new(new_trace("test"), conf);
    let (outer_reader, inner_reader) = (outer.clone(), inner.clone());
    scene
        .execute(None, |scene| async move {
            let nested = async {
                load_products(&scene, &products).await?;
                scene
                    .track_atom_read(inner_reader.clone(), load_products(&scene, &orders))
                    .await
            };
            scene.track_atom_read(outer_reader.clone(), nested).await?;
            Ok(())
        })
        .await
        .unwrap();

    assert_eq!(outer.names(), vec!["Product".to_string(), "Order".to_string()]);
    assert_eq!(inner.names(), vec!["Order".to_string()]);
}

#[tokio::test]
async fn test_reader_removed_when_scope_fails() {
    let tables = Arc::new(AtomRegistry::new());
    let products = tables.register("Product");
    let (conf, _database) = in_mem_conf(tables);

    let reads = Arc::new(Reads::default());
    let tracker = reads.clone();
    let scene = Scene::new(new_trace("test"), conf);
    scene
        .execute(None, |scene| async move {
            let failing = async {
                load_products(&scene, &products).await?;
                Err::<(), _>(sceneflow::SceneError::Remote("wtf".to_string()))
            };
            let err = scene.track_atom_read(tracker.clone(), failing).await.unwrap_err();
            assert_eq!(err.to_string(), "wtf");
            load_products(&scene, &products).await?;
            Ok(())
        })
        .await
        .unwrap();

    assert_eq!(reads.names().len(), 1);
}
