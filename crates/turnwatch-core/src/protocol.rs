use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::notification::ThreadInfo;

/// `thread/read` replies can carry full item histories, so the ceiling is generous.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;
pub const CLIENT_NAME: &str = "turnwatch";
pub const CLIENT_TITLE: &str = "Turnwatch";

pub mod method {
    pub const INITIALIZE: &str = "initialize";
    pub const INITIALIZED: &str = "initialized";
    pub const TURN_ACTIVE: &str = "turn/active";
    pub const THREAD_READ: &str = "thread/read";
    pub const THREAD_LOADED_LIST: &str = "thread/loaded/list";

    pub const TURN_STARTED: &str = "turn/started";
    pub const TURN_COMPLETED: &str = "turn/completed";
    pub const TURN_PROGRESS_TRACE: &str = "turn/progressTrace";
    pub const TURN_PLAN_UPDATED: &str = "turn/plan/updated";
    pub const THREAD_STARTED: &str = "thread/started";
    pub const THREAD_SNAPSHOT: &str = "thread/snapshot";
    pub const THREAD_SNAPSHOT_SUMMARY: &str = "thread/snapshotSummary";
    pub const THREAD_TOKEN_USAGE_UPDATED: &str = "thread/tokenUsage/updated";
    pub const ITEM_STARTED: &str = "item/started";
    pub const ITEM_COMPLETED: &str = "item/completed";
    pub const ERROR: &str = "error";
    pub const ACCOUNT_RATE_LIMITS_UPDATED: &str = "account/rateLimits/updated";
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Integer(i64),
    String(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
    #[error("frame is neither request, response nor notification")]
    Unclassified,
    #[error("invalid params for {method}: {message}")]
    InvalidParams { method: String, message: String },
}

/// A decoded inbound JSON-RPC message.
#[derive(Debug, Clone, PartialEq)]
pub enum IncomingMessage {
    Response {
        id: RequestId,
        result: Value,
    },
    ErrorResponse {
        id: RequestId,
        code: i64,
        message: String,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
    Request {
        id: RequestId,
        method: String,
        params: Option<Value>,
    },
}

#[derive(Serialize)]
struct OutgoingRequest<'a, T: Serialize> {
    id: &'a RequestId,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<&'a T>,
}

#[derive(Serialize)]
struct OutgoingNotification<'a, T: Serialize> {
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<&'a T>,
}

pub fn encode_request<T: Serialize>(
    id: &RequestId,
    method: &str,
    params: Option<&T>,
    max_frame_bytes: usize,
) -> Result<String, FrameError> {
    encode_frame(&OutgoingRequest { id, method, params }, max_frame_bytes)
}

pub fn encode_notification<T: Serialize>(
    method: &str,
    params: Option<&T>,
    max_frame_bytes: usize,
) -> Result<String, FrameError> {
    encode_frame(&OutgoingNotification { method, params }, max_frame_bytes)
}

fn encode_frame<T: Serialize>(value: &T, max_frame_bytes: usize) -> Result<String, FrameError> {
    let encoded = serde_json::to_string(value).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    Ok(encoded)
}

pub fn decode_message(text: &str, max_frame_bytes: usize) -> Result<IncomingMessage, FrameError> {
    let raw = text.trim();
    if raw.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: raw.len(),
            max: max_frame_bytes,
        });
    }
    let value: Value =
        serde_json::from_str(raw).map_err(|err| FrameError::Decode(err.to_string()))?;
    let Value::Object(mut object) = value else {
        return Err(FrameError::Unclassified);
    };

    let id = match object.remove("id") {
        Some(Value::Null) | None => None,
        Some(id_value) => Some(
            serde_json::from_value::<RequestId>(id_value)
                .map_err(|err| FrameError::Decode(format!("bad id: {err}")))?,
        ),
    };
    let method = object
        .get("method")
        .and_then(Value::as_str)
        .map(str::to_string);
    let params = object.remove("params").filter(|params| !params.is_null());

    match (id, method) {
        (Some(id), Some(method)) => Ok(IncomingMessage::Request { id, method, params }),
        (None, Some(method)) => Ok(IncomingMessage::Notification { method, params }),
        (Some(id), None) => {
            if let Some(error) = object.remove("error") {
                let code = error.get("code").and_then(Value::as_i64).unwrap_or(-1);
                let message = error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("Unknown error")
                    .to_string();
                return Ok(IncomingMessage::ErrorResponse { id, code, message });
            }
            let result = object.remove("result").unwrap_or(Value::Null);
            Ok(IncomingMessage::Response { id, result })
        }
        (None, None) => Err(FrameError::Unclassified),
    }
}

/// Decodes params into `T`, treating an absent params object as `{}`.
pub fn decode_params<T: DeserializeOwned>(
    method: &str,
    params: Option<Value>,
) -> Result<T, FrameError> {
    let params = params.unwrap_or_else(|| Value::Object(serde_json::Map::new()));
    serde_json::from_value(params).map_err(|err| FrameError::InvalidParams {
        method: method.to_string(),
        message: err.to_string(),
    })
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub name: String,
    #[serde(default)]
    pub title: Option<String>,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InitializeCapabilities {
    #[serde(default)]
    pub experimental_api: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub client_info: ClientInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<InitializeCapabilities>,
}

impl InitializeParams {
    pub fn turnwatch() -> Self {
        Self {
            client_info: ClientInfo {
                name: CLIENT_NAME.to_string(),
                title: Some(CLIENT_TITLE.to_string()),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            capabilities: Some(InitializeCapabilities {
                experimental_api: true,
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ThreadReadParams {
    pub thread_id: String,
    #[serde(default)]
    pub include_turns: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ThreadLoadedListParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ActiveTurnRef {
    #[serde(default, alias = "thread_id")]
    pub thread_id: String,
    #[serde(alias = "turn_id")]
    pub turn_id: String,
}

/// `turn/active` replies arrive either as a bare list or wrapped in an object.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum ActiveTurnsResponse {
    List(Vec<ActiveTurnRef>),
    Wrapped {
        #[serde(default, alias = "active_turns", alias = "turns", alias = "data")]
        #[serde(rename = "activeTurns")]
        active_turns: Vec<ActiveTurnRef>,
    },
}

impl ActiveTurnsResponse {
    pub fn into_refs(self) -> Vec<ActiveTurnRef> {
        match self {
            ActiveTurnsResponse::List(refs) => refs,
            ActiveTurnsResponse::Wrapped { active_turns } => active_turns,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ThreadReadResponse {
    pub thread: ThreadInfo,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ThreadLoadedListResponse {
    #[serde(default, alias = "threadIds", alias = "thread_ids")]
    pub data: Vec<String>,
    #[serde(default, alias = "next_cursor")]
    pub next_cursor: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classifies_requests_responses_and_notifications() {
        let response = decode_message(r#"{"id":3,"result":{"ok":true}}"#, DEFAULT_MAX_FRAME_BYTES)
            .expect("response");
        assert_eq!(
            response,
            IncomingMessage::Response {
                id: RequestId::Integer(3),
                result: json!({"ok": true}),
            }
        );

        let error = decode_message(
            r#"{"id":"a","error":{"code":-32600,"message":"Already initialized"}}"#,
            DEFAULT_MAX_FRAME_BYTES,
        )
        .expect("error");
        assert_eq!(
            error,
            IncomingMessage::ErrorResponse {
                id: RequestId::String("a".to_string()),
                code: -32600,
                message: "Already initialized".to_string(),
            }
        );

        let notification = decode_message(
            r#"{"method":"turn/started","params":{"threadId":"t"}}"#,
            DEFAULT_MAX_FRAME_BYTES,
        )
        .expect("notification");
        assert!(matches!(
            notification,
            IncomingMessage::Notification { ref method, .. } if method == "turn/started"
        ));

        let request = decode_message(
            r#"{"id":9,"method":"item/tool/requestUserInput","params":null}"#,
            DEFAULT_MAX_FRAME_BYTES,
        )
        .expect("request");
        assert_eq!(
            request,
            IncomingMessage::Request {
                id: RequestId::Integer(9),
                method: "item/tool/requestUserInput".to_string(),
                params: None,
            }
        );
    }

    #[test]
    fn rejects_malformed_and_unclassified_frames() {
        assert!(matches!(
            decode_message("{\"id\":", DEFAULT_MAX_FRAME_BYTES),
            Err(FrameError::Decode(_))
        ));
        assert!(matches!(
            decode_message("[1,2,3]", DEFAULT_MAX_FRAME_BYTES),
            Err(FrameError::Unclassified)
        ));
        assert!(matches!(
            decode_message("{\"hello\":1}", DEFAULT_MAX_FRAME_BYTES),
            Err(FrameError::Unclassified)
        ));
        let oversized = format!("{{\"method\":\"x\",\"params\":\"{}\"}}", "y".repeat(256));
        assert!(matches!(
            decode_message(&oversized, 64),
            Err(FrameError::OversizedFrame { .. })
        ));
    }

    #[test]
    fn request_encoding_omits_missing_params() {
        let id = RequestId::Integer(1);
        let frame = encode_request::<Value>(&id, method::TURN_ACTIVE, None, DEFAULT_MAX_FRAME_BYTES)
            .expect("encode");
        assert_eq!(frame, r#"{"id":1,"method":"turn/active"}"#);

        let params = InitializeParams::turnwatch();
        let frame = encode_request(&id, method::INITIALIZE, Some(&params), DEFAULT_MAX_FRAME_BYTES)
            .expect("encode init");
        let value: Value = serde_json::from_str(&frame).expect("json");
        assert_eq!(value["params"]["clientInfo"]["name"], "turnwatch");
        assert_eq!(value["params"]["capabilities"]["experimentalApi"], true);
    }

    #[test]
    fn active_turns_accepts_list_or_wrapped_with_either_casing() {
        let list: ActiveTurnsResponse =
            serde_json::from_value(json!([{"threadId": "th", "turnId": "tu"}])).expect("list");
        assert_eq!(list.into_refs().len(), 1);

        let wrapped: ActiveTurnsResponse = serde_json::from_value(
            json!({"activeTurns": [{"thread_id": "th", "turn_id": "tu"}, {"threadId": "th", "turnId": "tv"}]}),
        )
        .expect("wrapped");
        let refs = wrapped.into_refs();
        assert_eq!(refs[0].turn_id, "tu");
        assert_eq!(refs[1].turn_id, "tv");

        let empty: ActiveTurnsResponse = serde_json::from_value(json!({})).expect("empty");
        assert!(empty.into_refs().is_empty());
    }
}
