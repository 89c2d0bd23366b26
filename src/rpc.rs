//! Batched RPC over HTTP.
//!
//! One POST to `/{operation}` carries N independent argument tuples as a JSON
//! array of arrays; the position of a tuple is its job index. The response body
//! is newline-delimited JSON with one object per job, streamed as jobs finish:
//!
//! ```text
//! {"index":1,"data":"hello","read":["Product"],"changed":[]}
//! {"index":0,"error":"wtf"}
//! ```
//!
//! `read` and `changed` list the named atoms the job touched, deduplicated, in
//! first-touch order. Trace identity travels in B3 and `baggage-*` headers (see
//! [`crate::trace::headers`]).

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::atom::{Atom, AtomReader};
use crate::error::{RpcError, SceneError};

pub mod client;
pub mod registry;
pub mod server;

pub use client::HttpRpcClient;
pub use registry::{FnOperation, Operation, OperationRegistry};
pub use server::HttpRpcServer;

/// One call inside a batch request.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    /// Position of the argument tuple in the request
    pub index: usize,
    pub args: Vec<Value>,
}

/// Jobs executed together inside one scene.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct JobBatch {
    pub jobs: Vec<Job>,
}

impl JobBatch {
    pub fn single(job: Job) -> Self {
        Self { jobs: vec![job] }
    }

    pub fn indices(&self) -> Vec<usize> {
        self.jobs.iter().map(|job| job.index).collect()
    }
}

/// One line of a batch response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JobResult {
    Failure {
        index: usize,
        #[serde(deserialize_with = "error_text")]
        error: String,
    },
    Success {
        index: usize,
        #[serde(default)]
        data: Value,
        #[serde(default)]
        read: Vec<String>,
        #[serde(default)]
        changed: Vec<String>,
    },
}

impl JobResult {
    pub fn failure(index: usize, error: impl ToString) -> Self {
        JobResult::Failure {
            index,
            error: error.to_string(),
        }
    }

    pub fn index(&self) -> usize {
        match self {
            JobResult::Failure { index, .. } | JobResult::Success { index, .. } => *index,
        }
    }

    /// Serialize as one NDJSON line, trailing newline included.
    pub fn to_line(&self) -> Result<String, SceneError> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    pub fn from_line(line: &str) -> Result<Self, RpcError> {
        serde_json::from_str(line).map_err(|e| RpcError::Decode(format!("{}: {}", e, line)))
    }
}

/// Accept any JSON as an error, so a line with an `error` key is never read as a success.
fn error_text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(message) => message,
        other => other.to_string(),
    })
}

/// Encode a batch request body.
pub fn encode_jobs(jobs: &[Vec<Value>]) -> Result<Vec<u8>, SceneError> {
    Ok(serde_json::to_vec(jobs)?)
}

/// Decode a batch request body. An empty body is an empty batch.
pub fn decode_jobs(body: &[u8]) -> Result<Vec<Vec<Value>>, RpcError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    match serde_json::from_slice::<Option<Vec<Vec<Value>>>>(body) {
        Ok(jobs) => Ok(jobs.unwrap_or_default()),
        Err(e) => Err(RpcError::Decode(e.to_string())),
    }
}

/// Names of the named atoms touched by a batch, in first-touch order.
#[derive(Debug, Clone, Default)]
pub(crate) struct TouchedNames(Arc<Mutex<Vec<String>>>);

impl TouchedNames {
    pub(crate) fn record(&self, atom: &Atom) {
        let Some(name) = atom.name() else {
            return;
        };
        let mut names = self.0.lock();
        if !names.iter().any(|n| n == name) {
            names.push(name.to_string());
        }
    }

    pub(crate) fn snapshot(&self) -> Vec<String> {
        self.0.lock().clone()
    }
}

impl AtomReader for TouchedNames {
    fn on_atom_read(&self, atom: &Atom) {
        self.record(atom);
    }
}
