//! B3 trace headers and `baggage-*` headers.

use std::collections::{BTreeMap, HashMap};

use http::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::warn;

use super::{new_id, new_trace, TraceContext};

pub const TRACE_ID_HEADER: &str = "x-b3-traceid";
pub const SPAN_ID_HEADER: &str = "x-b3-spanid";
pub const PARENT_SPAN_ID_HEADER: &str = "x-b3-parentspanid";
pub const BAGGAGE_PREFIX: &str = "baggage-";

/// Baggage entry carrying the trace op across hops.
pub const OP_BAGGAGE_KEY: &str = "op";

/// Write the propagated part of `trace` into `headers`.
///
/// Header names are case-insensitive, so baggage keys arrive lowercased on the
/// other side. Entries that cannot be encoded as header values are skipped.
pub fn inject_trace(trace: &TraceContext, headers: &mut HeaderMap) {
    insert(headers, TRACE_ID_HEADER, &trace.trace_id);
    insert(headers, SPAN_ID_HEADER, &trace.span_id);
    if let Some(parent) = &trace.parent_span_id {
        insert(headers, PARENT_SPAN_ID_HEADER, parent);
    }
    for (key, value) in &trace.baggage {
        insert(headers, &format!("{}{}", BAGGAGE_PREFIX, key), value);
    }
    if !trace.trace_op.is_empty() && !trace.baggage.contains_key(OP_BAGGAGE_KEY) {
        insert(
            headers,
            &format!("{}{}", BAGGAGE_PREFIX, OP_BAGGAGE_KEY),
            &trace.trace_op,
        );
    }
}

/// Headers for an outgoing request made on behalf of `trace`.
pub fn trace_headers(trace: &TraceContext) -> HeaderMap {
    let mut headers = HeaderMap::new();
    inject_trace(trace, &mut headers);
    headers
}

/// Rebuild a trace from incoming headers.
///
/// Returns `None` when no trace id is present.
pub fn extract_trace(headers: &HeaderMap) -> Option<TraceContext> {
    let trace_id = header_str(headers, TRACE_ID_HEADER).filter(|id| !id.is_empty())?;
    let mut baggage = BTreeMap::new();
    for (name, value) in headers {
        if let Some(key) = name.as_str().strip_prefix(BAGGAGE_PREFIX) {
            if let Ok(value) = value.to_str() {
                baggage.insert(key.to_string(), value.to_string());
            }
        }
    }
    let trace_op = baggage.get(OP_BAGGAGE_KEY).cloned().unwrap_or_default();
    Some(TraceContext {
        trace_id: trace_id.to_string(),
        span_id: header_str(headers, SPAN_ID_HEADER)
            .map(str::to_string)
            .unwrap_or_else(new_id),
        parent_span_id: header_str(headers, PARENT_SPAN_ID_HEADER).map(str::to_string),
        trace_op,
        baggage,
        props: HashMap::new(),
        on_error: None,
        on_execution_started: None,
    })
}

/// Rebuild a trace from headers, or start a fresh one labelled `fallback_op`.
pub fn trace_from_headers_or_new(headers: &HeaderMap, fallback_op: &str) -> TraceContext {
    match extract_trace(headers) {
        Some(mut trace) => {
            if trace.trace_op.is_empty() {
                trace.trace_op = fallback_op.to_string();
            }
            trace
        }
        None => new_trace(fallback_op),
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn insert(headers: &mut HeaderMap, name: &str, value: &str) {
    let name = match HeaderName::from_bytes(name.as_bytes()) {
        Ok(name) => name,
        Err(e) => {
            warn!(header = %name, error = %e, "Skipping trace header with invalid name");
            return;
        }
    };
    match HeaderValue::from_str(value) {
        Ok(value) => {
            headers.insert(name, value);
        }
        Err(e) => {
            warn!(header = %name, error = %e, "Skipping trace header with invalid value");
        }
    }
}
