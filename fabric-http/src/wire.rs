//! HTTP wire mapping for routine calls.
//!
//! | Operation | Request                                              |
//! |-----------|------------------------------------------------------|
//! | invoke    | `POST {base}/{service}/{method}`                     |
//! | continue  | `POST {base}/{service}/{method}/{intentId}[?etag=…]` |
//! | poll      | `GET  {base}/{service}/{method}/{intentId}`          |
//!
//! Responses use the status codes in [`WireStatus`]. Routing and identity
//! travel in `x-fabric-*` headers; bodies are JSON.

use fabric_core::intent::{ContinueRoutineIntent, ExecuteRoutineIntent};
use fabric_core::types::{CallerDescriptor, ETag, ExceptionInfo, FlowContext, IntentId, MethodId, ServiceId};
use fabric_core::{FabricError, Result, TaskResult};
use std::fmt;
use std::str::FromStr;
use url::Url;

// ─── Headers ──────────────────────────────────────────────────

pub const HEADER_ENVELOPE: &str = "x-fabric-envelope";
pub const HEADER_INTENT_ID: &str = "x-fabric-intent-id";
pub const HEADER_CALLER_SERVICE: &str = "x-fabric-caller-service";
pub const HEADER_CALLER_METHOD: &str = "x-fabric-caller-method";
pub const HEADER_CALLER_INTENT_ID: &str = "x-fabric-caller-intent-id";
/// `true` on every attempt after the first.
pub const HEADER_RETRY: &str = "x-fabric-retry";
/// Ask the host to run the call and reply with its result.
pub const HEADER_SYNC: &str = "x-fabric-sync";
/// JSON object of flow-context entries.
pub const HEADER_FLOW_CONTEXT: &str = "x-fabric-flow-context";
/// Continuation position on the awaiting routine.
pub const HEADER_TASK_ID: &str = "x-fabric-task-id";
pub const HEADER_DELAY_MS: &str = "x-fabric-delay-ms";
/// Backend key of a scheduled routine.
pub const HEADER_ROUTINE_ID: &str = "x-fabric-routine-id";
pub const HEADER_ETAG: &str = "etag";

pub const ETAG_QUERY: &str = "etag";

// ─── Envelope type ────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnvelopeType {
    Invoke,
    Continue,
    Poll,
    Result,
}

impl EnvelopeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Invoke => "invoke",
            Self::Continue => "continue",
            Self::Poll => "poll",
            Self::Result => "result",
        }
    }
}

impl fmt::Display for EnvelopeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnvelopeType {
    type Err = FabricError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "invoke" => Ok(Self::Invoke),
            "continue" => Ok(Self::Continue),
            "poll" => Ok(Self::Poll),
            "result" => Ok(Self::Result),
            other => Err(FabricError::configuration(format!(
                "unknown envelope type '{other}'"
            ))),
        }
    }
}

// ─── Status codes ─────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WireStatus {
    Succeeded,
    Scheduled,
    Deduplicated,
    StillRunning,
    Faulted,
    Canceled,
}

impl WireStatus {
    pub fn code(&self) -> u16 {
        match self {
            Self::Succeeded => 200,
            Self::Scheduled => 202,
            Self::Deduplicated => 208,
            Self::StillRunning => 304,
            Self::Faulted => 400,
            Self::Canceled => 499,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            200 => Some(Self::Succeeded),
            202 => Some(Self::Scheduled),
            208 => Some(Self::Deduplicated),
            304 => Some(Self::StillRunning),
            400 => Some(Self::Faulted),
            499 => Some(Self::Canceled),
            _ => None,
        }
    }

    pub fn for_result(result: &TaskResult) -> Self {
        match result {
            TaskResult::Succeeded(_) => Self::Succeeded,
            TaskResult::Faulted(_) => Self::Faulted,
            TaskResult::Canceled => Self::Canceled,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Faulted | Self::Canceled)
    }
}

/// Body of a terminal response: the value, the fault, or nothing.
pub fn encode_result(result: &TaskResult) -> Result<(WireStatus, Vec<u8>)> {
    let body = match result {
        TaskResult::Succeeded(value) => serde_json::to_vec(value)?,
        TaskResult::Faulted(fault) => serde_json::to_vec(fault)?,
        TaskResult::Canceled => Vec::new(),
    };
    Ok((WireStatus::for_result(result), body))
}

/// Inverse of [`encode_result`]. Non-terminal statuses yield `None`.
pub fn decode_result(status: WireStatus, body: &[u8]) -> Result<Option<TaskResult>> {
    let result = match status {
        WireStatus::Succeeded if body.is_empty() => TaskResult::success(serde_json::Value::Null),
        WireStatus::Succeeded => TaskResult::Succeeded(serde_json::from_slice(body)?),
        WireStatus::Faulted => TaskResult::Faulted(serde_json::from_slice::<ExceptionInfo>(body)?),
        WireStatus::Canceled => TaskResult::Canceled,
        WireStatus::Scheduled | WireStatus::Deduplicated | WireStatus::StillRunning => {
            return Ok(None)
        }
    };
    Ok(Some(result))
}

// ─── Paths ────────────────────────────────────────────────────

fn with_segments(base: &Url, segments: &[&str]) -> Result<Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| FabricError::configuration(format!("'{base}' cannot be a base URL")))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// `{base}/{service}/{method}`
pub fn invoke_url(base: &Url, service: &ServiceId, method: &MethodId) -> Result<Url> {
    with_segments(base, &[&service.name, &method.name])
}

/// `{base}/{service}/{method}/{intentId}`, with `?etag=` when given.
pub fn routine_url(
    base: &Url,
    service: &ServiceId,
    method: &MethodId,
    intent_id: &IntentId,
    etag: Option<&ETag>,
) -> Result<Url> {
    let id = intent_id.to_string();
    let mut url = with_segments(base, &[&service.name, &method.name, &id])?;
    if let Some(etag) = etag {
        url.query_pairs_mut().append_pair(ETAG_QUERY, etag.as_str());
    }
    Ok(url)
}

// ─── Request headers ──────────────────────────────────────────

/// Header set for one request, in wire order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestHeaders(Vec<(&'static str, String)>);

impl RequestHeaders {
    pub fn new(envelope: EnvelopeType, intent_id: &IntentId) -> Self {
        Self(vec![
            (HEADER_ENVELOPE, envelope.to_string()),
            (HEADER_INTENT_ID, intent_id.to_string()),
        ])
    }

    pub fn caller(mut self, caller: Option<&CallerDescriptor>) -> Self {
        if let Some(caller) = caller {
            self.0.push((HEADER_CALLER_SERVICE, caller.service.name.clone()));
            self.0.push((HEADER_CALLER_METHOD, caller.method.name.clone()));
            self.0.push((HEADER_CALLER_INTENT_ID, caller.intent_id.to_string()));
        }
        self
    }

    pub fn flow_context(mut self, flow: &FlowContext) -> Result<Self> {
        if !flow.is_empty() {
            self.0.push((HEADER_FLOW_CONTEXT, serde_json::to_string(flow)?));
        }
        Ok(self)
    }

    pub fn retry(mut self, retry: bool) -> Self {
        if retry {
            self.0.push((HEADER_RETRY, "true".to_string()));
        }
        self
    }

    pub fn with(mut self, name: &'static str, value: impl ToString) -> Self {
        self.0.push((name, value.to_string()));
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &str)> {
        self.0.iter().map(|(n, v)| (*n, v.as_str()))
    }
}

pub fn invoke_headers(intent: &ExecuteRoutineIntent, synchronous: bool) -> Result<RequestHeaders> {
    let headers = RequestHeaders::new(EnvelopeType::Invoke, &intent.id)
        .caller(intent.caller.as_ref())
        .flow_context(&intent.flow_context)?;
    Ok(match synchronous {
        true => headers.with(HEADER_SYNC, "true"),
        false => headers,
    })
}

pub fn continue_headers(intent: &ContinueRoutineIntent) -> RequestHeaders {
    let headers = RequestHeaders::new(EnvelopeType::Continue, &intent.id)
        .caller(intent.caller.as_ref())
        .with(HEADER_TASK_ID, intent.continuation.task_id);
    match intent.delay_ms {
        Some(ms) => headers.with(HEADER_DELAY_MS, ms),
        None => headers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base() -> Url {
        Url::parse("http://fabric.local/routines/").unwrap()
    }

    #[test]
    fn status_codes_round_trip() {
        for status in [
            WireStatus::Succeeded,
            WireStatus::Scheduled,
            WireStatus::Deduplicated,
            WireStatus::StillRunning,
            WireStatus::Faulted,
            WireStatus::Canceled,
        ] {
            assert_eq!(WireStatus::from_code(status.code()), Some(status));
        }
        assert_eq!(WireStatus::from_code(500), None);
        assert!(!WireStatus::StillRunning.is_terminal());
    }

    #[test]
    fn paths_follow_service_method_intent() {
        let id = IntentId::generate();
        let invoke = invoke_url(&base(), &ServiceId::new("billing"), &MethodId::new("Debit")).unwrap();
        assert_eq!(invoke.as_str(), "http://fabric.local/routines/billing/Debit");

        let etag = ETag::new("0000000000000003-ab12");
        let resume = routine_url(
            &base(),
            &ServiceId::new("billing"),
            &MethodId::new("Debit"),
            &id,
            Some(&etag),
        )
        .unwrap();
        assert_eq!(
            resume.as_str(),
            format!("http://fabric.local/routines/billing/Debit/{id}?etag=0000000000000003-ab12")
        );
    }

    #[test]
    fn path_segments_are_escaped() {
        let url = invoke_url(&base(), &ServiceId::new("a b"), &MethodId::new("x/y")).unwrap();
        assert_eq!(url.path(), "/routines/a%20b/x%2Fy");
    }

    #[test]
    fn results_map_to_statuses_and_back() {
        let fault = TaskResult::fault("InsufficientFunds", "balance 3 < 10");
        let (status, body) = encode_result(&fault).unwrap();
        assert_eq!(status.code(), 400);
        assert_eq!(decode_result(status, &body).unwrap(), Some(fault));

        let (status, body) = encode_result(&TaskResult::Canceled).unwrap();
        assert_eq!(status.code(), 499);
        assert!(body.is_empty());

        let done = TaskResult::success(json!({"debited": 10}));
        let (status, body) = encode_result(&done).unwrap();
        assert_eq!(decode_result(status, &body).unwrap(), Some(done));
        assert_eq!(decode_result(WireStatus::StillRunning, b"").unwrap(), None);
    }

    #[test]
    fn envelope_names_parse() {
        assert_eq!("poll".parse::<EnvelopeType>().unwrap(), EnvelopeType::Poll);
        assert!("status".parse::<EnvelopeType>().is_err());
    }

    #[test]
    fn invoke_headers_carry_caller_and_flow() {
        let caller = CallerDescriptor {
            service: ServiceId::new("shop"),
            method: MethodId::new("Checkout"),
            intent_id: IntentId::generate(),
        };
        let mut flow = FlowContext::new();
        flow.insert("order".into(), "42".into());
        let intent = ExecuteRoutineIntent {
            id: IntentId::generate(),
            service: ServiceId::new("billing"),
            method: MethodId::new("Debit"),
            parameters: json!({}),
            caller: Some(caller.clone()),
            continuation: None,
            flow_context: flow,
        };
        let headers = invoke_headers(&intent, true).unwrap().retry(true);
        assert_eq!(headers.get(HEADER_ENVELOPE), Some("invoke"));
        assert_eq!(headers.get(HEADER_INTENT_ID), Some(intent.id.to_string().as_str()));
        assert_eq!(headers.get(HEADER_CALLER_SERVICE), Some("shop"));
        assert_eq!(
            headers.get(HEADER_CALLER_INTENT_ID),
            Some(caller.intent_id.to_string().as_str())
        );
        assert_eq!(headers.get(HEADER_FLOW_CONTEXT), Some(r#"{"order":"42"}"#));
        assert_eq!(headers.get(HEADER_SYNC), Some("true"));
        assert_eq!(headers.get(HEADER_RETRY), Some("true"));
    }
}
