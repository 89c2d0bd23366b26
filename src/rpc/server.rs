//! HTTP server half of the batched RPC protocol.
//!
//! Every request runs on its own task that writes result lines into a channel;
//! the response body streams that channel, so the body is always terminated
//! once the task ends, even if it failed before writing anything.

use std::convert::Infallible;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use bytes::Bytes;
use futures::future::join_all;
use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};

use super::{decode_jobs, Job, JobBatch, JobResult, Operation, OperationRegistry, TouchedNames};
use crate::atom::AtomReader;
use crate::error::SceneError;
use crate::io::IoConf;
use crate::scene::{ChangePolicy, Scene};
use crate::trace::{trace_from_headers_or_new, TraceContext};

/// Serves registered operations at `POST /{operation}`.
#[derive(Clone)]
pub struct HttpRpcServer {
    io_conf: IoConf,
    operations: Arc<OperationRegistry>,
}

impl HttpRpcServer {
    /// `io_conf` is given to every scene the server creates.
    pub fn new(io_conf: IoConf, operations: Arc<OperationRegistry>) -> Self {
        Self {
            io_conf,
            operations,
        }
    }

    pub fn operations(&self) -> &Arc<OperationRegistry> {
        &self.operations
    }

    /// Build the axum router (separated for testing).
    pub fn router(&self) -> Router {
        Router::new()
            .route("/:operation", post(handle_batch))
            .with_state(self.clone())
    }

    /// Serve on an already bound listener until the listener fails.
    pub async fn serve(self, listener: TcpListener) -> Result<(), SceneError> {
        let addr = listener.local_addr().map_err(anyhow::Error::from)?;
        info!(
            address = %addr,
            operations = ?self.operations.names(),
            "RPC server listening"
        );
        axum::serve(listener, self.router())
            .await
            .map_err(anyhow::Error::from)?;
        Ok(())
    }

    /// Bind `bind_address:port` and serve. Port 0 lets the OS choose.
    pub async fn bind_and_serve(self, bind_address: &str, port: u16) -> Result<(), SceneError> {
        let listener = TcpListener::bind((bind_address, port))
            .await
            .map_err(anyhow::Error::from)?;
        self.serve(listener).await
    }

    async fn run(
        self,
        operation_name: String,
        trace: Arc<TraceContext>,
        args: Vec<Vec<serde_json::Value>>,
        writer: LineWriter,
    ) {
        let operation = match self.operations.resolve(&operation_name).await {
            Ok(operation) => operation,
            Err(e) => {
                error!(operation = %operation_name, error = %e, "Failed to resolve operation");
                let error = e.to_string();
                for index in 0..args.len() {
                    writer.write(JobResult::failure(index, &error));
                }
                return;
            }
        };

        let jobs: Vec<Job> = args
            .into_iter()
            .enumerate()
            .map(|(index, args)| Job { index, args })
            .collect();
        let batches = match std::panic::catch_unwind(AssertUnwindSafe(|| operation.group(jobs))) {
            Ok(batches) => batches,
            Err(_) => {
                error!(operation = %operation_name, "RPC operation panicked while grouping jobs");
                for index in writer.unwritten() {
                    writer.write(JobResult::failure(index, "operation panicked"));
                }
                return;
            }
        };
        debug!(
            operation = %operation_name,
            jobs = writer.len(),
            batches = batches.len(),
            "Executing RPC batches"
        );
        let runs = batches.into_iter().map(|batch| {
            let indices = batch.indices();
            let run = execute_batch(
                self.io_conf.clone(),
                Arc::clone(&operation),
                Arc::clone(&trace),
                batch,
                &writer,
            );
            let writer = &writer;
            let operation_name = &operation_name;
            async move {
                if AssertUnwindSafe(run).catch_unwind().await.is_err() {
                    error!(operation = %operation_name, "RPC operation panicked");
                    for index in indices {
                        writer.write(JobResult::failure(index, "operation panicked"));
                    }
                }
            }
        });
        join_all(runs).await;

        // A custom grouping may drop jobs; their callers still get an answer.
        for index in writer.unwritten() {
            writer.write(JobResult::failure(
                index,
                format!("job {} was not executed by {}", index, operation_name),
            ));
        }
    }
}

async fn execute_batch(
    io_conf: IoConf,
    operation: Arc<dyn Operation>,
    trace: Arc<TraceContext>,
    batch: JobBatch,
    writer: &LineWriter,
) {
    let read = TouchedNames::default();
    let changed = TouchedNames::default();
    let recorder = changed.clone();
    let scene = Scene::with_policy(
        trace,
        io_conf,
        ChangePolicy::new(move |_, atom| {
            recorder.record(atom);
            Ok(())
        }),
    );
    let reader: Arc<dyn AtomReader> = Arc::new(read.clone());
    let indices = batch.indices();
    let outcome = scene
        .execute(Some(reader), |scene| async move {
            Ok(operation.invoke_batch(scene, batch).await)
        })
        .await;

    match outcome {
        Ok(results) => {
            for (index, result) in results {
                match result {
                    Ok(data) => writer.write(JobResult::Success {
                        index,
                        data,
                        read: read.snapshot(),
                        changed: changed.snapshot(),
                    }),
                    Err(e) => {
                        error!(index, error = %e, "RPC job failed");
                        writer.write(JobResult::failure(index, e));
                    }
                }
            }
        }
        Err(e) => {
            error!(error = %e, "RPC batch failed");
            for index in indices {
                writer.write(JobResult::failure(index, &e));
            }
        }
    }
}

/// Writes each job index at most once.
struct LineWriter {
    tx: mpsc::UnboundedSender<Bytes>,
    written: Mutex<Vec<bool>>,
}

impl LineWriter {
    fn new(tx: mpsc::UnboundedSender<Bytes>, jobs: usize) -> Self {
        Self {
            tx,
            written: Mutex::new(vec![false; jobs]),
        }
    }

    fn len(&self) -> usize {
        self.written.lock().len()
    }

    fn write(&self, result: JobResult) {
        let index = result.index();
        {
            let mut written = self.written.lock();
            match written.get_mut(index) {
                Some(done) if !*done => *done = true,
                Some(_) => {
                    warn!(index, "Dropping duplicate RPC result");
                    return;
                }
                None => {
                    warn!(index, "Dropping RPC result for unknown job");
                    return;
                }
            }
        }
        match result.to_line() {
            Ok(line) => {
                // The client hung up; the remaining lines have nowhere to go.
                let _ = self.tx.send(Bytes::from(line));
            }
            Err(e) => {
                error!(index, error = %e, "Failed to encode RPC result");
                if let Ok(line) = JobResult::failure(index, &e).to_line() {
                    let _ = self.tx.send(Bytes::from(line));
                }
            }
        }
    }

    fn unwritten(&self) -> Vec<usize> {
        self.written
            .lock()
            .iter()
            .enumerate()
            .filter(|(_, done)| !**done)
            .map(|(index, _)| index)
            .collect()
    }
}

async fn handle_batch(
    State(server): State<HttpRpcServer>,
    Path(operation): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let args = match decode_jobs(&body) {
        Ok(args) => args,
        Err(e) => {
            warn!(operation = %operation, error = %e, "Rejecting malformed RPC batch");
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
    };
    let trace = Arc::new(trace_from_headers_or_new(
        &headers,
        &format!("handle /{}", operation),
    ));
    debug!(
        operation = %operation,
        trace_id = %trace.trace_id,
        jobs = args.len(),
        "Received RPC batch"
    );

    let (tx, rx) = mpsc::unbounded_channel();
    let writer = LineWriter::new(tx, args.len());
    tokio::spawn(server.run(operation, trace, args, writer));

    let body = UnboundedReceiverStream::new(rx).map(Ok::<_, Infallible>);
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8"),
            (header::X_CONTENT_TYPE_OPTIONS, "nosniff"),
        ],
        Body::from_stream(body),
    )
        .into_response()
}
