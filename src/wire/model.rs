//! Wire-level JSON shapes and the in-flight request bookkeeping for the HA
//! WebSocket protocol (spec §4.1, §6).

use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;

use crate::errors::WireError;

/// A request awaiting a matching `result` frame, keyed by its assigned `id`.
pub(super) struct InFlightOp {
    pub tx: Option<oneshot::Sender<ResponseMsg>>,
    pub ts: Instant,
}

impl InFlightOp {
    pub fn new(tx: oneshot::Sender<ResponseMsg>) -> Self {
        Self { tx: Some(tx), ts: Instant::now() }
    }
}

#[derive(Debug)]
pub struct ResponseMsg {
    pub id: u32,
    pub success: bool,
    pub result: Option<Value>,
    pub error: Option<CommandErrorPayload>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CommandErrorPayload {
    pub code: String,
    pub message: String,
}

impl ResponseMsg {
    pub fn into_result(self) -> Result<Value, WireError> {
        if self.success {
            Ok(self.result.unwrap_or(Value::Null))
        } else if let Some(err) = self.error {
            Err(WireError::CommandErr { code: err.code, message: err.message })
        } else {
            Err(WireError::CommandErr { code: "-1".to_string(), message: "unknown failure".to_string() })
        }
    }
}

#[derive(Debug, Serialize)]
pub(super) struct AuthMsg<'a> {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    pub access_token: &'a str,
}

#[derive(Debug, Serialize)]
pub struct CallServiceCommand {
    pub domain: String,
    pub service: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<TargetEntity>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub return_response: bool,
}

#[derive(Debug, Serialize)]
pub struct TargetEntity {
    pub entity_id: String,
}

/// Parses a raw text frame into a mutable JSON object, enforcing the
/// top-level `{..}` shape every HA frame is expected to carry.
pub(super) fn json_object_from_text_msg(client_id: &str, text: &[u8]) -> Result<serde_json::Map<String, Value>, WireError> {
    let value: Value = serde_json::from_slice(text).map_err(|e| {
        WireError::Parse(format!("[{client_id}] invalid JSON: {e}"))
    })?;
    match value {
        Value::Object(map) => Ok(map),
        other => Err(WireError::Parse(format!("[{client_id}] expected a JSON object, got {other}"))),
    }
}

/// HA entity event payload, used for `state_changed` dispatch.
#[derive(Debug, Deserialize)]
pub struct StateChangedEvent {
    pub entity_id: String,
    pub new_state: Option<RawEntityState>,
    #[allow(dead_code)]
    pub old_state: Option<RawEntityState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEntityState {
    pub entity_id: String,
    pub state: String,
    pub last_changed: String,
    pub last_updated: String,
    #[serde(default)]
    pub attributes: serde_json::Map<String, Value>,
}

/// Looks like an RFC 3339 / ISO-8601 date (`YYYY-MM-DD...`); used to decide
/// whether a string value should be parsed into a timestamp (spec §4.1).
pub fn looks_like_timestamp(s: &str) -> bool {
    let bytes = s.as_bytes();
    bytes.len() >= 10
        && bytes[0..4].iter().all(u8::is_ascii_digit)
        && bytes[4] == b'-'
        && bytes[5..7].iter().all(u8::is_ascii_digit)
        && bytes[7] == b'-'
        && bytes[8..10].iter().all(u8::is_ascii_digit)
}
