//! Message envelopes riding inside frames.
//!
//! The worker protocol speaks two envelope conventions side by side on the
//! same stream:
//!
//! - the action convention: `{"action": "...", "requestId": N, ...}` with
//!   payload fields flattened into the top-level object, and responses
//!   echoing `requestId` alongside flattened result fields;
//! - the JSON-RPC convention: `{"jsonrpc": "2.0", "id": N, "method": "...",
//!   "params": {...}}` with results nested under `result`.
//!
//! A message carries exactly one of the two ID fields, never both, and a
//! response always mirrors the convention of the request it answers.
//! [`Inbound::classify`] sorts traffic structurally, without consulting any
//! correlation state, so the caller can route commands, responses, events,
//! and the one-shot readiness handshake independently.

use serde_json::{Map, Value, json};

/// Which ID-tagging convention a message uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdTag {
    /// `action` + `requestId`, payload fields flattened.
    Action,
    /// `jsonrpc` + `id` + `method`, payload nested under `params`.
    JsonRpc,
}

/// Message ready to leave for the peer. `id` is `None` for fire-and-forget
/// sends, which never receive a response.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub tag: IdTag,
    pub id: Option<u64>,
    pub action: String,
    pub params: Value,
}

impl Outbound {
    /// Build an action-convention command.
    pub fn action(id: Option<u64>, action: impl Into<String>, params: Value) -> Self {
        Outbound {
            tag: IdTag::Action,
            id,
            action: action.into(),
            params,
        }
    }

    /// Build a JSON-RPC-convention command.
    pub fn jsonrpc(id: u64, method: impl Into<String>, params: Value) -> Self {
        Outbound {
            tag: IdTag::JsonRpc,
            id: Some(id),
            action: method.into(),
            params,
        }
    }

    /// Render the wire object for this envelope.
    ///
    /// Under the action convention, object params are flattened into the
    /// top level; `action` and `requestId` are reserved and overwrite any
    /// colliding payload field. A non-object, non-null payload lands under
    /// a `params` key instead of being flattened.
    pub fn to_value(&self) -> Value {
        match self.tag {
            IdTag::Action => {
                let mut map = match &self.params {
                    Value::Object(fields) => fields.clone(),
                    Value::Null => Map::new(),
                    other => {
                        let mut map = Map::new();
                        map.insert("params".to_string(), other.clone());
                        map
                    }
                };
                map.insert("action".to_string(), Value::String(self.action.clone()));
                if let Some(id) = self.id {
                    map.insert("requestId".to_string(), json!(id));
                }
                Value::Object(map)
            }
            IdTag::JsonRpc => {
                let mut map = Map::new();
                map.insert("jsonrpc".to_string(), json!("2.0"));
                if let Some(id) = self.id {
                    map.insert("id".to_string(), json!(id));
                }
                map.insert("method".to_string(), Value::String(self.action.clone()));
                if !self.params.is_null() {
                    map.insert("params".to_string(), self.params.clone());
                }
                Value::Object(map)
            }
        }
    }
}

/// Error payload attached to a failed response: either bare text or a
/// `{message, name}` object. The optional `name` carries the worker's error
/// classification (`"TimeoutError"`, `"NetworkError"`, ...).
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorShape {
    Text(String),
    Detailed { message: String, name: Option<String> },
}

impl ErrorShape {
    pub fn message(&self) -> &str {
        match self {
            ErrorShape::Text(text) => text,
            ErrorShape::Detailed { message, .. } => message,
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            ErrorShape::Text(_) => None,
            ErrorShape::Detailed { name, .. } => name.as_deref(),
        }
    }

    /// Interpret whatever the peer put under `error`. Shapes we do not
    /// recognize degrade to their JSON text rather than being dropped.
    pub fn from_value(value: Value) -> ErrorShape {
        match value {
            Value::String(text) => ErrorShape::Text(text),
            Value::Object(mut map) => {
                let message = match map.remove("message") {
                    Some(Value::String(text)) => text,
                    Some(other) => other.to_string(),
                    None => Value::Object(map.clone()).to_string(),
                };
                let name = match map.remove("name") {
                    Some(Value::String(name)) => Some(name),
                    _ => None,
                };
                ErrorShape::Detailed { message, name }
            }
            other => ErrorShape::Text(other.to_string()),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            ErrorShape::Text(text) => Value::String(text.clone()),
            ErrorShape::Detailed { message, name } => {
                let mut map = Map::new();
                map.insert("message".to_string(), Value::String(message.clone()));
                if let Some(name) = name {
                    map.insert("name".to_string(), Value::String(name.clone()));
                }
                Value::Object(map)
            }
        }
    }
}

/// Reply to an earlier command, already stripped of its envelope fields.
///
/// For action-convention responses `body` is the object of flattened result
/// fields; for JSON-RPC responses it is the `result` value (or null).
#[derive(Debug, Clone)]
pub struct Response {
    pub tag: IdTag,
    pub id: u64,
    pub error: Option<ErrorShape>,
    pub body: Value,
}

/// Unsolicited notification addressed to one remote object.
#[derive(Debug, Clone)]
pub struct EventFrame {
    pub object_id: String,
    pub event: String,
    pub params: Value,
}

/// Command addressed to the receiving side. `id` is `None` for
/// fire-and-forget commands, which must not be answered.
#[derive(Debug, Clone)]
pub struct CommandFrame {
    pub tag: IdTag,
    pub id: Option<u64>,
    pub action: String,
    pub params: Map<String, Value>,
}

impl CommandFrame {
    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    pub fn str_param(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }

    pub fn u64_param(&self, key: &str) -> Option<u64> {
        self.params.get(key).and_then(Value::as_u64)
    }

    pub fn bool_param(&self, key: &str) -> Option<bool> {
        self.params.get(key).and_then(Value::as_bool)
    }
}

/// One classified inbound message.
#[derive(Debug, Clone)]
pub enum Inbound {
    Command(CommandFrame),
    Response(Response),
    Event(EventFrame),
    /// Worker start-of-stream handshake, `{"type": "ready", ...}`.
    Ready { message: String },
    /// Anything that fits no known shape. Kept whole for logging.
    Unknown(Value),
}

impl Inbound {
    /// Sort one decoded message into its protocol role.
    ///
    /// Classification is purely structural: a `action`/`method` field makes
    /// a command, otherwise a `requestId`/`id` field makes a response (in
    /// that order, so flattened result fields can never shadow the
    /// envelope), then `objectId` + `event` makes an event. Whether a
    /// response ID actually matches a pending request is the correlator's
    /// business, not ours.
    pub fn classify(value: Value) -> Inbound {
        let mut map = match value {
            Value::Object(map) => map,
            other => return Inbound::Unknown(other),
        };

        let action_name = map.get("action").and_then(Value::as_str).map(str::to_string);
        if let Some(action) = action_name {
            map.remove("action");
            let id = map.remove("requestId").as_ref().and_then(Value::as_u64);
            return Inbound::Command(CommandFrame {
                tag: IdTag::Action,
                id,
                action,
                params: map,
            });
        }

        let method_name = map.get("method").and_then(Value::as_str).map(str::to_string);
        if let Some(action) = method_name {
            map.remove("method");
            let id = map.get("id").and_then(Value::as_u64);
            let params = match map.remove("params") {
                Some(Value::Object(fields)) => fields,
                Some(Value::Null) | None => Map::new(),
                Some(other) => {
                    let mut fields = Map::new();
                    fields.insert("params".to_string(), other);
                    fields
                }
            };
            return Inbound::Command(CommandFrame {
                tag: IdTag::JsonRpc,
                id,
                action,
                params,
            });
        }

        if let Some(id) = map.get("requestId").and_then(Value::as_u64) {
            map.remove("requestId");
            let error = map.remove("error").map(ErrorShape::from_value);
            return Inbound::Response(Response {
                tag: IdTag::Action,
                id,
                error,
                body: Value::Object(map),
            });
        }

        if let Some(id) = map.get("id").and_then(Value::as_u64) {
            map.remove("id");
            map.remove("jsonrpc");
            let error = map.remove("error").map(ErrorShape::from_value);
            let body = map.remove("result").unwrap_or(Value::Null);
            return Inbound::Response(Response {
                tag: IdTag::JsonRpc,
                id,
                error,
                body,
            });
        }

        if map.contains_key("objectId") && map.contains_key("event") {
            let object_id = map
                .remove("objectId")
                .and_then(|v| v.as_str().map(str::to_string));
            let event = map
                .remove("event")
                .and_then(|v| v.as_str().map(str::to_string));
            if let (Some(object_id), Some(event)) = (object_id, event) {
                let params = map.remove("params").unwrap_or(Value::Null);
                return Inbound::Event(EventFrame {
                    object_id,
                    event,
                    params,
                });
            }
            return Inbound::Unknown(Value::Object(map));
        }

        if map.get("type").and_then(Value::as_str) == Some("ready") {
            let message = map
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            return Inbound::Ready { message };
        }

        Inbound::Unknown(Value::Object(map))
    }
}

/// Render a success response mirroring the request's convention.
///
/// `body` must be a JSON object (or null) under the action convention; its
/// fields are flattened next to `requestId`.
pub fn success_response(tag: IdTag, id: u64, body: Value) -> Value {
    match tag {
        IdTag::Action => {
            let mut map = match body {
                Value::Object(fields) => fields,
                Value::Null => Map::new(),
                other => {
                    let mut map = Map::new();
                    map.insert("value".to_string(), other);
                    map
                }
            };
            map.insert("requestId".to_string(), json!(id));
            Value::Object(map)
        }
        IdTag::JsonRpc => json!({ "jsonrpc": "2.0", "id": id, "result": body }),
    }
}

/// Render an error response mirroring the request's convention.
pub fn error_response(tag: IdTag, id: u64, error: &ErrorShape) -> Value {
    match tag {
        IdTag::Action => json!({ "requestId": id, "error": error.to_value() }),
        IdTag::JsonRpc => json!({ "jsonrpc": "2.0", "id": id, "error": error.to_value() }),
    }
}

/// Render an event frame addressed to `object_id`.
pub fn event_frame(object_id: &str, event: &str, params: Value) -> Value {
    json!({ "objectId": object_id, "event": event, "params": params })
}

/// The start-of-stream readiness handshake.
pub fn ready_frame() -> Value {
    json!({ "type": "ready", "message": "READY" })
}
