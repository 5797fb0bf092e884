//! Normalization of worker-pushed events.
//!
//! The worker tags every unsolicited frame with the id of the remote object
//! it concerns plus a bare event name, and the payload arrives as loose
//! JSON. This module maps the well-known payloads onto typed shapes before
//! delivery so subscribers are not picking fields out of JSON at every call
//! site. Events this client version does not recognize pass through as
//! [`RemoteEvent::Other`] rather than being dropped.

use serde_json::Value;

/// One event delivered to a remote object's subscribers.
#[derive(Debug, Clone)]
pub enum RemoteEvent {
    /// Console output observed on a page.
    Console {
        /// Console method ("log", "warn", "error", ...).
        kind: String,
        text: String,
        args: Vec<Value>,
        /// Source location as "url:line", when the worker knows it.
        location: Option<String>,
    },
    /// A dialog opened on a page and now waits for a `dialog.accept` or
    /// `dialog.dismiss` command against `dialog_id`.
    Dialog {
        dialog_id: String,
        /// Dialog flavor ("alert", "confirm", "prompt", "beforeunload").
        kind: String,
        message: String,
    },
    /// A network request matched an interception rule. The worker has
    /// suspended it under `correlation_id` and waits for a continuation.
    Route {
        correlation_id: u64,
        route_id: String,
        /// Request description: url, method, headers.
        request: Value,
    },
    /// The remote object closed on the worker side.
    Closed,
    /// Unrecognized event, payload preserved for the subscriber to inspect.
    Other { name: String, params: Value },
}

impl RemoteEvent {
    /// Map a raw event name and payload onto a typed event.
    ///
    /// Required fields missing from a well-known payload demote the event
    /// to [`RemoteEvent::Other`]; delivering something is always preferred
    /// over guessing.
    pub fn normalize(name: &str, params: Value) -> RemoteEvent {
        match name {
            "console" => RemoteEvent::Console {
                kind: str_field(&params, "type").unwrap_or("log").to_string(),
                text: str_field(&params, "text").unwrap_or_default().to_string(),
                args: params
                    .get("args")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default(),
                location: str_field(&params, "location").map(str::to_string),
            },
            "dialog" => {
                let Some(dialog_id) = str_field(&params, "dialogId") else {
                    return other(name, params);
                };
                RemoteEvent::Dialog {
                    dialog_id: dialog_id.to_string(),
                    kind: str_field(&params, "type").unwrap_or("alert").to_string(),
                    message: str_field(&params, "message").unwrap_or_default().to_string(),
                }
            }
            "route" => {
                let correlation_id = params.get("requestId").and_then(Value::as_u64);
                let route_id = str_field(&params, "routeId");
                let (Some(correlation_id), Some(route_id)) = (correlation_id, route_id) else {
                    return other(name, params);
                };
                RemoteEvent::Route {
                    correlation_id,
                    route_id: route_id.to_string(),
                    request: params.get("request").cloned().unwrap_or(Value::Null),
                }
            }
            "close" => RemoteEvent::Closed,
            _ => other(name, params),
        }
    }

    /// Event name for logging.
    pub fn name(&self) -> &str {
        match self {
            RemoteEvent::Console { .. } => "console",
            RemoteEvent::Dialog { .. } => "dialog",
            RemoteEvent::Route { .. } => "route",
            RemoteEvent::Closed => "close",
            RemoteEvent::Other { name, .. } => name,
        }
    }
}

fn str_field<'a>(params: &'a Value, key: &str) -> Option<&'a str> {
    params.get(key).and_then(Value::as_str)
}

fn other(name: &str, params: Value) -> RemoteEvent {
    RemoteEvent::Other {
        name: name.to_string(),
        params,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn console_event_normalizes_fields() {
        let event = RemoteEvent::normalize(
            "console",
            json!({
                "type": "warn",
                "text": "deprecated API",
                "args": [1, "two"],
                "location": "https://example.com/app.js:14"
            }),
        );
        let RemoteEvent::Console {
            kind,
            text,
            args,
            location,
        } = event
        else {
            panic!("expected console event");
        };
        assert_eq!(kind, "warn");
        assert_eq!(text, "deprecated API");
        assert_eq!(args.len(), 2);
        assert_eq!(location.as_deref(), Some("https://example.com/app.js:14"));
    }

    #[test]
    fn console_event_tolerates_sparse_payload() {
        let RemoteEvent::Console {
            kind,
            text,
            args,
            location,
        } = RemoteEvent::normalize("console", json!({ "text": "hi" }))
        else {
            panic!("expected console event");
        };
        assert_eq!(kind, "log");
        assert_eq!(text, "hi");
        assert!(args.is_empty());
        assert!(location.is_none());
    }

    #[test]
    fn dialog_without_id_degrades_to_other() {
        let event = RemoteEvent::normalize("dialog", json!({ "type": "confirm" }));
        assert!(matches!(event, RemoteEvent::Other { .. }));
    }

    #[test]
    fn route_event_carries_correlation_id() {
        let RemoteEvent::Route {
            correlation_id,
            route_id,
            request,
        } = RemoteEvent::normalize(
            "route",
            json!({
                "requestId": 77,
                "routeId": "route_3",
                "request": { "url": "https://example.com/api", "method": "GET" }
            }),
        )
        else {
            panic!("expected route event");
        };
        assert_eq!(correlation_id, 77);
        assert_eq!(route_id, "route_3");
        assert_eq!(request["method"], "GET");
    }

    #[test]
    fn unknown_events_pass_through_with_payload() {
        let RemoteEvent::Other { name, params } =
            RemoteEvent::normalize("download", json!({ "path": "/tmp/file" }))
        else {
            panic!("expected passthrough");
        };
        assert_eq!(name, "download");
        assert_eq!(params["path"], "/tmp/file");
    }
}
