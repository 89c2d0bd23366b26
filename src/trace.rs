//! Distributed trace identity.
//!
//! A trace spans every process that handles one logical request. Each hop is a span,
//! and a span may run one or more scenes. Only the four identifiers and the baggage
//! ever cross a process boundary; everything else on [`TraceContext`] is rebuilt
//! locally in each process.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::error::SceneError;
use crate::scene::Scene;

pub mod headers;

pub use headers::{extract_trace, inject_trace, trace_from_headers_or_new, trace_headers};

/// Observes task failures of scenes running under a trace.
pub type ErrorHook = Arc<dyn Fn(&SceneError) + Send + Sync>;

/// Observes every scene that starts executing under a trace.
pub type ExecutionStartedHook = Arc<dyn Fn(&Arc<Scene>) + Send + Sync>;

/// Identity and baggage of one hop of a distributed request.
#[derive(Clone, Default)]
pub struct TraceContext {
    /// Stable across all hops of one logical request
    pub trace_id: String,
    /// Unique per hop
    pub span_id: String,
    /// Set when this hop was spawned by a remote call
    pub parent_span_id: Option<String>,
    /// Human readable label of the request
    pub trace_op: String,
    /// Propagated over RPC headers
    pub baggage: BTreeMap<String, String>,
    /// Process-local properties, never propagated
    pub props: HashMap<String, Value>,
    pub on_error: Option<ErrorHook>,
    pub on_execution_started: Option<ExecutionStartedHook>,
}

/// Start a brand new top-level trace.
pub fn new_trace(trace_op: impl Into<String>) -> TraceContext {
    TraceContext {
        trace_id: new_id(),
        span_id: new_id(),
        parent_span_id: None,
        trace_op: trace_op.into(),
        baggage: BTreeMap::new(),
        props: HashMap::new(),
        on_error: None,
        on_execution_started: None,
    }
}

pub(crate) fn new_id() -> String {
    Uuid::new_v4().to_string()
}

impl TraceContext {
    /// Derive the context of a remote hop spawned from this one.
    ///
    /// The child keeps the trace id, op and baggage, points its parent at this span
    /// and gets a fresh span id. Local-only fields are not inherited.
    pub fn child(&self) -> TraceContext {
        TraceContext {
            trace_id: self.trace_id.clone(),
            span_id: new_id(),
            parent_span_id: Some(self.span_id.clone()),
            trace_op: self.trace_op.clone(),
            baggage: self.baggage.clone(),
            props: HashMap::new(),
            on_error: None,
            on_execution_started: None,
        }
    }

    pub fn with_baggage(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.baggage.insert(key.into(), value.into());
        self
    }

    pub fn with_prop(mut self, key: impl Into<String>, value: Value) -> Self {
        self.props.insert(key.into(), value);
        self
    }

    pub fn with_on_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&SceneError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(hook));
        self
    }

    pub fn with_on_execution_started<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Arc<Scene>) + Send + Sync + 'static,
    {
        self.on_execution_started = Some(Arc::new(hook));
        self
    }
}

impl fmt::Debug for TraceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TraceContext")
            .field("trace_id", &self.trace_id)
            .field("span_id", &self.span_id)
            .field("parent_span_id", &self.parent_span_id)
            .field("trace_op", &self.trace_op)
            .field("baggage", &self.baggage)
            .field("props", &self.props)
            .field("on_error", &self.on_error.is_some())
            .field("on_execution_started", &self.on_execution_started.is_some())
            .finish()
    }
}

/// Report an anomaly that should not interrupt the caller.
///
/// When a trace is given the event is attached to it, otherwise it stands alone.
pub fn report_event(message: &str, detail: Value, trace: Option<&TraceContext>) {
    match trace {
        Some(trace) => warn!(
            trace_id = %trace.trace_id,
            span_id = %trace.span_id,
            trace_op = %trace.trace_op,
            detail = %detail,
            "{}",
            message
        ),
        None => warn!(detail = %detail, "{}", message),
    }
}
