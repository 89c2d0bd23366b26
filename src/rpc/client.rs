//! HTTP client half of the batched RPC protocol.
//!
//! Calls to the same endpoint made in the same scheduling turn share one HTTP
//! request. Each caller waits on its own channel, settled by the response line
//! carrying its job index. Callers whose line never arrives are failed once the
//! response ends, so nobody waits forever.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, CONTENT_TYPE};
use reqwest::Client;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::{encode_jobs, JobResult};
use crate::atom::AtomRegistry;
use crate::batch::JobBatcher;
use crate::config::{ClientConfig, DiscoveryConfig};
use crate::error::{RpcError, SceneError};
use crate::io::{Service, ServiceRequest};
use crate::scene::Scene;
use crate::trace::{trace_headers, TraceContext};

type Reply = oneshot::Sender<Result<JobResult, RpcError>>;

/// One caller waiting for its job.
struct PendingCall {
    args: Vec<Value>,
    /// The remote hop: a child of the calling scene's trace
    trace: TraceContext,
    reply: Reply,
}

/// A [`Service`] calling remote operations over batched HTTP RPC.
///
/// `read` and `changed` names reported by the remote job are replayed into the
/// calling scene through the atom registry, so local readers and change
/// policies see remote table access as if it were local.
///
/// Calls coalesced into one request travel under the trace headers of the
/// first call in the batch, so on the server every job of that request runs
/// in the first caller's trace, even when other callers belong to other traces.
pub struct HttpRpcClient {
    http: Client,
    options: ClientConfig,
    discovery: DiscoveryConfig,
    atoms: Arc<AtomRegistry>,
    batchers: Mutex<HashMap<String, JobBatcher<PendingCall>>>,
}

impl HttpRpcClient {
    pub fn new(
        options: ClientConfig,
        discovery: DiscoveryConfig,
        atoms: Arc<AtomRegistry>,
    ) -> Result<Self, SceneError> {
        let http = Client::builder()
            .no_proxy()
            .connect_timeout(options.connect_timeout())
            .timeout(options.request_timeout())
            .build()
            .map_err(|e| RpcError::Transport(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            http,
            options,
            discovery,
            atoms,
            batchers: Mutex::new(HashMap::new()),
        })
    }

    fn endpoint(&self, request: &ServiceRequest) -> Result<String, RpcError> {
        let route = self
            .discovery
            .resolve(&request.service_name, request.service_port)?;
        Ok(format!(
            "http://{}:{}/{}",
            route.host, route.port, request.method_name
        ))
    }

    fn batcher_for(&self, endpoint: &str) -> JobBatcher<PendingCall> {
        let mut batchers = self.batchers.lock();
        if let Some(batcher) = batchers.get(endpoint) {
            return batcher.clone();
        }
        let http = self.http.clone();
        let url = endpoint.to_string();
        let batcher = JobBatcher::new(
            self.options.batch_size_limit,
            self.options.batch_window(),
            move |calls: Vec<PendingCall>| send_batch(http.clone(), url.clone(), calls).boxed(),
        );
        batchers.insert(endpoint.to_string(), batcher.clone());
        batcher
    }

    async fn call(&self, scene: &Scene, request: ServiceRequest) -> Result<JobResult, SceneError> {
        let endpoint = self.endpoint(&request)?;
        let (reply, answer) = oneshot::channel();
        self.batcher_for(&endpoint).enqueue(PendingCall {
            args: request.args,
            trace: scene.trace().child(),
            reply,
        });
        let result = answer
            .await
            .map_err(|_| RpcError::Transport(format!("{} was dropped without an answer", endpoint)))??;
        Ok(result)
    }
}

#[async_trait]
impl Service for HttpRpcClient {
    async fn call_method(
        &self,
        scene: &Scene,
        request: ServiceRequest,
    ) -> Result<Value, SceneError> {
        match self.call(scene, request).await? {
            JobResult::Failure { error, .. } => Err(SceneError::Remote(error)),
            JobResult::Success {
                data,
                read,
                changed,
                ..
            } => {
                for name in &read {
                    scene.on_atom_read(&self.atoms.atom(name))?;
                }
                for name in &changed {
                    scene.on_atom_changed(&self.atoms.atom(name))?;
                }
                Ok(data)
            }
        }
    }

    async fn on_scene_finished(&self, _scene: &Scene) -> Result<(), SceneError> {
        Ok(())
    }
}

/// Send one HTTP request for `calls` and settle every caller.
async fn send_batch(http: Client, url: String, calls: Vec<PendingCall>) -> Result<(), SceneError> {
    // Each pending call already holds the child span of its caller; the
    // request carries the first one.
    let headers = calls
        .first()
        .map(|call| trace_headers(&call.trace))
        .unwrap_or_default();
    let mut args = Vec::with_capacity(calls.len());
    let mut pending = HashMap::with_capacity(calls.len());
    for (index, call) in calls.into_iter().enumerate() {
        args.push(call.args);
        pending.insert(index, call.reply);
    }
    debug!(url = %url, jobs = args.len(), "Sending RPC batch");

    let outcome = match encode_jobs(&args) {
        Ok(body) => stream_results(&http, &url, headers, body, &mut pending).await,
        Err(e) => Err(RpcError::Decode(e.to_string())),
    };

    match outcome {
        Ok(()) => {
            for (index, reply) in pending {
                warn!(url = %url, index, "RPC response has no line for job");
                let _ = reply.send(Err(RpcError::MissingResult(index)));
            }
            Ok(())
        }
        Err(e) => {
            for (_, reply) in pending {
                let _ = reply.send(Err(e.clone()));
            }
            Err(e.into())
        }
    }
}

async fn stream_results(
    http: &Client,
    url: &str,
    headers: HeaderMap,
    body: Vec<u8>,
    pending: &mut HashMap<usize, Reply>,
) -> Result<(), RpcError> {
    let response = http
        .post(url)
        .headers(headers)
        .header(CONTENT_TYPE, "application/json")
        .body(body)
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(RpcError::Status {
            status: status.as_u16(),
            body,
        });
    }

    let mut stream = response.bytes_stream();
    let mut buffer: Vec<u8> = Vec::new();
    while let Some(chunk) = stream.next().await {
        buffer.extend_from_slice(&chunk?);
        while let Some(newline) = buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=newline).collect();
            settle_line(url, &line, pending);
        }
    }
    // The last line may lack its newline.
    settle_line(url, &buffer, pending);
    Ok(())
}

fn settle_line(url: &str, line: &[u8], pending: &mut HashMap<usize, Reply>) {
    let line = String::from_utf8_lossy(line);
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    let result = match JobResult::from_line(line) {
        Ok(result) => result,
        Err(e) => {
            warn!(url = %url, error = %e, "Skipping malformed RPC response line");
            return;
        }
    };
    match pending.remove(&result.index()) {
        Some(reply) => {
            let _ = reply.send(Ok(result));
        }
        None => warn!(url = %url, index = result.index(), "RPC response line for unknown job"),
    }
}
