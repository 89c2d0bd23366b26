//! Operations served over batched RPC, looked up by name.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{join_all, BoxFuture};
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, info};

use super::{Job, JobBatch};
use crate::error::{RpcError, SceneError};
use crate::scene::Scene;

/// A named remote operation.
///
/// Each call receives the scene it runs in, already executing, plus the
/// positional arguments sent by the client.
#[async_trait]
pub trait Operation: Send + Sync {
    async fn invoke(&self, scene: Arc<Scene>, args: Vec<Value>) -> Result<Value, SceneError>;

    /// Split the jobs of one request into batches, each run in its own scene.
    ///
    /// The default runs every job alone. Operations that can serve several jobs
    /// with one underlying call (a multi-get) group them here and override
    /// [`Operation::invoke_batch`].
    fn group(&self, jobs: Vec<Job>) -> Vec<JobBatch> {
        jobs.into_iter().map(JobBatch::single).collect()
    }

    /// Run every job of `batch`, returning one result per job index.
    async fn invoke_batch(
        &self,
        scene: Arc<Scene>,
        batch: JobBatch,
    ) -> Vec<(usize, Result<Value, SceneError>)> {
        let calls = batch.jobs.into_iter().map(|job| {
            let scene = Arc::clone(&scene);
            async move { (job.index, self.invoke(scene, job.args).await) }
        });
        join_all(calls).await
    }
}

/// An [`Operation`] backed by an async closure.
pub struct FnOperation<F, Fut> {
    f: F,
    _fut: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnOperation<F, Fut>
where
    F: Fn(Arc<Scene>, Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, SceneError>> + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            _fut: PhantomData,
        }
    }
}

#[async_trait]
impl<F, Fut> Operation for FnOperation<F, Fut>
where
    F: Fn(Arc<Scene>, Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, SceneError>> + Send + 'static,
{
    async fn invoke(&self, scene: Arc<Scene>, args: Vec<Value>) -> Result<Value, SceneError> {
        (self.f)(scene, args).await
    }
}

/// Loads an operation on first use.
pub type OperationLoader =
    Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<Arc<dyn Operation>>> + Send + Sync>;

#[derive(Clone)]
enum Entry {
    Ready(Arc<dyn Operation>),
    Lazy(OperationLoader),
}

/// Maps operation names to implementations. Populated at startup.
#[derive(Default)]
pub struct OperationRegistry {
    entries: RwLock<HashMap<String, Entry>>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, operation: Arc<dyn Operation>) {
        debug!(operation = name, "Registered operation");
        self.entries
            .write()
            .insert(name.to_string(), Entry::Ready(operation));
    }

    /// Register an async closure as an operation.
    pub fn register_fn<F, Fut>(&self, name: &str, f: F)
    where
        F: Fn(Arc<Scene>, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, SceneError>> + Send + 'static,
    {
        self.register(name, Arc::new(FnOperation::new(f)));
    }

    /// Register an operation whose implementation is loaded on first request.
    ///
    /// A failed load fails every job of the request that triggered it and is
    /// retried by the next request. A successful load is kept.
    pub fn register_lazy<F>(&self, name: &str, loader: F)
    where
        F: Fn() -> BoxFuture<'static, anyhow::Result<Arc<dyn Operation>>> + Send + Sync + 'static,
    {
        debug!(operation = name, "Registered lazy operation");
        self.entries
            .write()
            .insert(name.to_string(), Entry::Lazy(Arc::new(loader)));
    }

    pub async fn resolve(&self, name: &str) -> Result<Arc<dyn Operation>, RpcError> {
        let entry = self.entries.read().get(name).cloned();
        let loader = match entry {
            Some(Entry::Ready(operation)) => return Ok(operation),
            Some(Entry::Lazy(loader)) => loader,
            None => return Err(RpcError::OperationNotFound(name.to_string())),
        };
        let operation = loader().await.map_err(|e| RpcError::OperationLoad {
            name: name.to_string(),
            reason: e.to_string(),
        })?;
        info!(operation = name, "Loaded operation");
        self.entries
            .write()
            .insert(name.to_string(), Entry::Ready(Arc::clone(&operation)));
        Ok(operation)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.read().contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.read().keys().cloned().collect();
        names.sort();
        names
    }
}
