//! Batched RPC server behaviour over real HTTP and through the router

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use futures::FutureExt;
use proptest::prelude::*;
use sceneflow::io::NotImplementedService;
use sceneflow::rpc::JobResult;
use sceneflow::{
    AtomRegistry, HttpRpcServer, IoConf, Operation, OperationRegistry, Record, SceneError,
};
use serde_json::{json, Value};
use tower::ServiceExt;

use super::test_utils::{in_mem_conf, spawn_server};

fn job_index(args: &[Value]) -> Value {
    args.first().cloned().unwrap_or(Value::Null)
}

/// Operations shared by the tests below. Clients pass the job index as the first argument.
fn operations() -> OperationRegistry {
    let operations = OperationRegistry::new();
    operations.register_fn("echoIndex", |_scene, args: Vec<Value>| async move {
        Ok::<_, SceneError>(job_index(&args))
    });
    operations.register_fn("failOdd", |_scene, args: Vec<Value>| async move {
        match job_index(&args).as_u64() {
            Some(i) if i % 2 == 1 => Err(SceneError::Remote("wtf".to_string())),
            _ => Ok(json!("ok")),
        }
    });
    operations
}

async fn post_lines(port: u16, operation: &str, body: Value) -> Vec<JobResult> {
    let response = reqwest::Client::new()
        .post(format!("http://127.0.0.1:{}/{}", port, operation))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let text = response.text().await.unwrap();
    let mut lines: Vec<JobResult> = text
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| JobResult::from_line(line).unwrap())
        .collect();
    lines.sort_by_key(JobResult::index);
    lines
}

fn success(index: usize, data: Value) -> JobResult {
    JobResult::Success {
        index,
        data,
        read: vec![],
        changed: vec![],
    }
}

#[tokio::test]
async fn test_every_job_gets_its_own_line() {
    let port = spawn_server(IoConf::default(), operations()).await;

    let lines = post_lines(port, "echoIndex", json!([[0], [1]])).await;
    assert_eq!(lines, vec![success(0, json!(0)), success(1, json!(1))]);
}

#[tokio::test]
async fn test_failing_job_does_not_fail_its_neighbours() {
    let port = spawn_server(IoConf::default(), operations()).await;

    let lines = post_lines(port, "failOdd", json!([[0], [1]])).await;
    assert_eq!(
        lines,
        vec![success(0, json!("ok")), JobResult::failure(1, "wtf")]
    );
}

#[tokio::test]
async fn test_empty_batch_yields_empty_body() {
    let port = spawn_server(IoConf::default(), operations()).await;

    assert!(post_lines(port, "echoIndex", json!([])).await.is_empty());
}

#[tokio::test]
async fn test_lines_report_tables_read_and_changed() {
    let tables = Arc::new(AtomRegistry::new());
    tables.register("Product");
    let (conf, _database) = in_mem_conf(tables.clone());

    let operations = OperationRegistry::new();
    let registered = tables.clone();
    operations.register_fn("addProduct", move |scene, args: Vec<Value>| {
        let tables = registered.clone();
        async move {
            let products = tables.table("Product")?;
            let db = scene.use_database()?;
            let props: Record = args
                .first()
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            db.insert(&products, props).await?;
            let rows = db.query(&products, Record::new()).await?;
            Ok::<_, SceneError>(json!(rows.len()))
        }
    });
    let port = spawn_server(conf, operations).await;

    let lines = post_lines(port, "addProduct", json!([[{"name": "apple"}]])).await;
    assert_eq!(
        lines,
        vec![JobResult::Success {
            index: 0,
            data: json!(1),
            read: vec!["Product".to_string()],
            changed: vec!["Product".to_string()],
        }]
    );
}

#[tokio::test]
async fn test_failed_lazy_load_fails_every_job() {
    let operations = OperationRegistry::new();
    operations.register_lazy("broken", || {
        async { Err::<Arc<dyn Operation>, _>(anyhow::anyhow!("module missing")) }.boxed()
    });
    let port = spawn_server(IoConf::default(), operations).await;

    let lines = post_lines(port, "broken", json!([[], [], []])).await;
    let expected: Vec<JobResult> = (0..3)
        .map(|index| JobResult::failure(index, "failed to load operation broken: module missing"))
        .collect();
    assert_eq!(lines, expected);
}

#[tokio::test]
async fn test_malformed_body_is_rejected() {
    let server = HttpRpcServer::new(IoConf::default(), Arc::new(operations()));
    let response = server
        .router()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/echoIndex")
                .body(Body::from("{\"not\":\"a batch\"}"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

/// Any batch size yields exactly one line per job, covering every index once.
#[test]
fn test_one_line_per_job_property() {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let server = HttpRpcServer::new(
        IoConf::new(Arc::new(NotImplementedService)),
        Arc::new(operations()),
    );
    let mut runner = proptest::test_runner::TestRunner::new(ProptestConfig::with_cases(32));

    runner
        .run(&(0usize..40, any::<bool>()), |(jobs, failing)| {
            let operation = if failing { "failOdd" } else { "echoIndex" };
            let body: Vec<Vec<Value>> = (0..jobs).map(|i| vec![json!(i)]).collect();
            let router = server.router();
            let text = runtime.block_on(async move {
                let response = router
                    .oneshot(
                        Request::builder()
                            .method("POST")
                            .uri(format!("/{}", operation))
                            .body(Body::from(serde_json::to_vec(&body).unwrap()))
                            .unwrap(),
                    )
                    .await
                    .unwrap();
                let bytes = to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
                String::from_utf8(bytes.to_vec()).unwrap()
            });

            let mut indices: Vec<usize> = text
                .lines()
                .map(|line| JobResult::from_line(line).unwrap().index())
                .collect();
            prop_assert!(text.is_empty() || text.ends_with('\n'));
            indices.sort_unstable();
            prop_assert_eq!(indices, (0..jobs).collect::<Vec<_>>());
            Ok(())
        })
        .unwrap();
}
