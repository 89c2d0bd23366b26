//! Trace identity crossing the RPC boundary

use std::sync::Arc;

use sceneflow::trace::headers::{extract_trace, trace_headers};
use sceneflow::{new_trace, AtomRegistry, IoConf, OperationRegistry, Scene, SceneError};
use serde_json::{json, Value};

use super::test_utils::{client_for, spawn_server};

fn whoami() -> OperationRegistry {
    let operations = OperationRegistry::new();
    operations.register_fn("whoami", |scene: Arc<Scene>, _args: Vec<Value>| async move {
        let trace = scene.trace();
        Ok::<_, SceneError>(json!({
            "trace_id": trace.trace_id,
            "span_id": trace.span_id,
            "parent_span_id": trace.parent_span_id,
            "trace_op": trace.trace_op,
            "tenant": trace.baggage.get("tenant"),
        }))
    });
    operations
}

#[tokio::test]
async fn test_remote_scene_joins_caller_trace() {
    let port = spawn_server(IoConf::default(), whoami()).await;
    let conf = IoConf::new(client_for(port, Arc::new(AtomRegistry::new())))
        .with_tenant("remote", "default");

    let trace = new_trace("checkout").with_baggage("Tenant", "acme");
    let (trace_id, span_id) = (trace.trace_id.clone(), trace.span_id.clone());
    let scene = Scene::new(trace, conf);
    let remote = scene
        .execute(None, |scene| async move {
            scene.use_service("remote", 0)?.call("whoami", vec![]).await
        })
        .await
        .unwrap();

    assert_eq!(remote["trace_id"], json!(trace_id));
    assert_eq!(remote["trace_op"], json!("checkout"));
    // Header names are case-insensitive, so the key arrives lowercased.
    assert_eq!(remote["tenant"], json!("acme"));
    // One remote hop: the server span is a direct child of the caller span.
    assert_eq!(remote["parent_span_id"], json!(span_id));
    assert!(remote["span_id"].is_string());
    assert_ne!(remote["span_id"], json!(span_id));
}

#[tokio::test]
async fn test_request_without_trace_headers_starts_new_trace() {
    let port = spawn_server(IoConf::default(), whoami()).await;

    let text = reqwest::Client::new()
        .post(format!("http://127.0.0.1:{}/whoami", port))
        .body("[[]]")
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    let line: Value = serde_json::from_str(text.trim()).unwrap();
    let remote = &line["data"];

    assert!(!remote["trace_id"].as_str().unwrap().is_empty());
    assert_eq!(remote["parent_span_id"], Value::Null);
    assert_eq!(remote["trace_op"], json!("handle /whoami"));
}

#[test]
fn test_headers_round_trip_child_span() {
    let parent = new_trace("checkout").with_baggage("region", "eu");
    let child = parent.child();

    let restored = extract_trace(&trace_headers(&child)).unwrap();
    assert_eq!(restored.trace_id, parent.trace_id);
    assert_eq!(restored.span_id, child.span_id);
    assert_eq!(restored.parent_span_id, Some(parent.span_id.clone()));
    assert_eq!(restored.trace_op, "checkout");
    assert_eq!(restored.baggage.get("region").map(String::as_str), Some("eu"));
}
