//! Testing infrastructure for the worker.
//!
//! Provides a scriptable in-memory [`Engine`] so dispatch and serving can
//! be exercised without a real automation backend. The mock records every
//! engine call for later assertion and can raise page notices (routes,
//! dialogs, console output, closures) on demand.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::engine::{
    Engine, EngineBrowser, EngineContext, EngineDialog, EngineError, EnginePage, EngineResponse,
    EngineResult, EngineRoute, EngineServer, NoticeSink, PageNotice,
};

/// Engine call recorded by [`MockEngine`] for test assertions.
#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    Launch,
    Connect { endpoint: String },
    NewContext,
    NewPage { page_id: String },
    Navigate { url: String },
    Evaluate { expression: String },
    SetInterception { enabled: bool },
    SetThrottle,
    RouteFulfill { status: u64 },
    RouteContinue,
    RouteAbort { reason: Option<String> },
    DialogAccept { prompt_text: Option<String> },
    DialogDismiss,
    CloseBrowser,
    CloseContext,
    ClosePage { page_id: String },
    StartServer,
    StopServer,
}

#[derive(Default)]
struct MockState {
    calls: Mutex<Vec<MockCall>>,
    sinks: Mutex<HashMap<String, NoticeSink>>,
    eval_results: Mutex<HashMap<String, Value>>,
    fail_next_navigate: Mutex<Option<String>>,
}

impl MockState {
    fn record(&self, call: MockCall) {
        self.calls.lock().unwrap().push(call);
    }
}

/// Scriptable in-memory engine.
///
/// Configure behavior with `set_*`/`fail_*` methods, raise notices with
/// `fire_*`, then assert on [`calls()`](Self::calls). Clones share state,
/// so a test can keep one handle while the worker owns another.
///
/// # Example
///
/// ```
/// use drover_worker::testing::{MockCall, MockEngine};
///
/// let engine = MockEngine::new();
/// // hand engine.clone() to the dispatcher, then later:
/// assert!(!engine.calls().contains(&MockCall::Launch));
/// ```
#[derive(Clone, Default)]
pub struct MockEngine {
    state: Arc<MockState>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every engine call recorded so far, in order.
    pub fn calls(&self) -> Vec<MockCall> {
        self.state.calls.lock().unwrap().clone()
    }

    /// Make the next `navigate` fail with a network error carrying
    /// `message`.
    pub fn fail_next_navigate(&self, message: &str) {
        *self.state.fail_next_navigate.lock().unwrap() = Some(message.to_string());
    }

    /// Fix the value `evaluate` returns for `expression`. Unconfigured
    /// expressions evaluate to null.
    pub fn set_eval_result(&self, expression: &str, value: Value) {
        self.state
            .eval_results
            .lock()
            .unwrap()
            .insert(expression.to_string(), value);
    }

    /// Raise an intercepted request on a live page. Returns `false` when
    /// no page with this id was opened through the mock.
    pub fn fire_route(&self, page_id: &str, request: Value) -> bool {
        let sinks = self.state.sinks.lock().unwrap();
        let Some(sink) = sinks.get(page_id) else {
            return false;
        };
        sink.post(PageNotice::Route {
            request,
            route: Box::new(MockRoute {
                state: Arc::clone(&self.state),
            }),
        })
    }

    /// Raise a modal dialog on a live page.
    pub fn fire_dialog(&self, page_id: &str, kind: &str, message: &str) -> bool {
        let sinks = self.state.sinks.lock().unwrap();
        let Some(sink) = sinks.get(page_id) else {
            return false;
        };
        sink.post(PageNotice::Dialog {
            kind: kind.to_string(),
            message: message.to_string(),
            dialog: Box::new(MockDialog {
                state: Arc::clone(&self.state),
            }),
        })
    }

    /// Raise console output on a live page.
    pub fn fire_console(&self, page_id: &str, kind: &str, text: &str) -> bool {
        let sinks = self.state.sinks.lock().unwrap();
        let Some(sink) = sinks.get(page_id) else {
            return false;
        };
        sink.post(PageNotice::Console {
            kind: kind.to_string(),
            text: text.to_string(),
            args: Vec::new(),
            location: None,
        })
    }

    /// Close a page from the engine side.
    pub fn fire_close(&self, page_id: &str) -> bool {
        let sinks = self.state.sinks.lock().unwrap();
        let Some(sink) = sinks.get(page_id) else {
            return false;
        };
        sink.post(PageNotice::Closed)
    }
}

#[async_trait]
impl Engine for MockEngine {
    async fn launch(&self, _options: Value) -> EngineResult<Box<dyn EngineBrowser>> {
        self.state.record(MockCall::Launch);
        Ok(Box::new(MockBrowser {
            state: Arc::clone(&self.state),
        }))
    }

    async fn connect(&self, endpoint: &str, _options: Value) -> EngineResult<Box<dyn EngineBrowser>> {
        self.state.record(MockCall::Connect {
            endpoint: endpoint.to_string(),
        });
        Ok(Box::new(MockBrowser {
            state: Arc::clone(&self.state),
        }))
    }

    async fn start_server(&self, _options: Value) -> EngineResult<Box<dyn EngineServer>> {
        self.state.record(MockCall::StartServer);
        Ok(Box::new(MockServer {
            state: Arc::clone(&self.state),
        }))
    }
}

struct MockBrowser {
    state: Arc<MockState>,
}

#[async_trait]
impl EngineBrowser for MockBrowser {
    fn version(&self) -> String {
        "mock-129.0".to_string()
    }

    async fn new_context(&self, _options: Value) -> EngineResult<Box<dyn EngineContext>> {
        self.state.record(MockCall::NewContext);
        Ok(Box::new(MockContext {
            state: Arc::clone(&self.state),
        }))
    }

    async fn close(&self) -> EngineResult<()> {
        self.state.record(MockCall::CloseBrowser);
        Ok(())
    }
}

struct MockContext {
    state: Arc<MockState>,
}

#[async_trait]
impl EngineContext for MockContext {
    async fn new_page(&self, notices: NoticeSink) -> EngineResult<Box<dyn EnginePage>> {
        let page_id = notices.page_id().to_string();
        self.state.record(MockCall::NewPage {
            page_id: page_id.clone(),
        });
        self.state
            .sinks
            .lock()
            .unwrap()
            .insert(page_id.clone(), notices);
        Ok(Box::new(MockPage {
            state: Arc::clone(&self.state),
            page_id,
        }))
    }

    async fn set_throttle(&self, _options: Value) -> EngineResult<()> {
        self.state.record(MockCall::SetThrottle);
        Ok(())
    }

    async fn close(&self) -> EngineResult<()> {
        self.state.record(MockCall::CloseContext);
        Ok(())
    }
}

struct MockPage {
    state: Arc<MockState>,
    page_id: String,
}

#[async_trait]
impl EnginePage for MockPage {
    async fn navigate(&self, url: &str, _options: Value) -> EngineResult<EngineResponse> {
        if let Some(message) = self.state.fail_next_navigate.lock().unwrap().take() {
            return Err(EngineError::Network(message));
        }
        self.state.record(MockCall::Navigate {
            url: url.to_string(),
        });
        Ok(EngineResponse {
            url: url.to_string(),
            status: 200,
            headers: json!({ "content-type": "text/html" }),
            body: b"<html>mock</html>".to_vec(),
        })
    }

    async fn evaluate(&self, expression: &str) -> EngineResult<Value> {
        self.state.record(MockCall::Evaluate {
            expression: expression.to_string(),
        });
        let configured = self.state.eval_results.lock().unwrap().get(expression).cloned();
        Ok(configured.unwrap_or(Value::Null))
    }

    async fn set_interception(&self, enabled: bool, _patterns: Value) -> EngineResult<()> {
        self.state.record(MockCall::SetInterception { enabled });
        Ok(())
    }

    async fn close(&self) -> EngineResult<()> {
        self.state.record(MockCall::ClosePage {
            page_id: self.page_id.clone(),
        });
        Ok(())
    }
}

struct MockRoute {
    state: Arc<MockState>,
}

#[async_trait]
impl EngineRoute for MockRoute {
    async fn fulfill(self: Box<Self>, response: Value) -> EngineResult<()> {
        let status = response.get("status").and_then(Value::as_u64).unwrap_or(0);
        self.state.record(MockCall::RouteFulfill { status });
        Ok(())
    }

    async fn pass_through(self: Box<Self>, _overrides: Value) -> EngineResult<()> {
        self.state.record(MockCall::RouteContinue);
        Ok(())
    }

    async fn abort(self: Box<Self>, reason: Option<String>) -> EngineResult<()> {
        self.state.record(MockCall::RouteAbort { reason });
        Ok(())
    }
}

struct MockDialog {
    state: Arc<MockState>,
}

#[async_trait]
impl EngineDialog for MockDialog {
    async fn accept(self: Box<Self>, prompt_text: Option<String>) -> EngineResult<()> {
        self.state.record(MockCall::DialogAccept { prompt_text });
        Ok(())
    }

    async fn dismiss(self: Box<Self>) -> EngineResult<()> {
        self.state.record(MockCall::DialogDismiss);
        Ok(())
    }
}

struct MockServer {
    state: Arc<MockState>,
}

#[async_trait]
impl EngineServer for MockServer {
    fn url(&self) -> String {
        "http://127.0.0.1:4780".to_string()
    }

    async fn stop(self: Box<Self>) -> EngineResult<()> {
        self.state.record(MockCall::StopServer);
        Ok(())
    }
}
