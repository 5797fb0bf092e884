//! Command routing on the worker side.
//!
//! One dispatcher owns the resource table and the callback coordinator.
//! Every inbound command resolves its generated id to a live handle, calls
//! the engine, and answers in the convention the command arrived under.
//! `callback.continue` never reaches the routing table; it resumes a
//! parked suspension directly and is itself never answered.
//!
//! Page notices flow in through [`run_notices`](Dispatcher::run_notices):
//! console output and closures become events, dialogs get registered under
//! fresh ids, and intercepted requests are parked on the coordinator until
//! the client's verdict (or the ceiling) decides them.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value, json};
use thiserror::Error;
use tokio::sync::{mpsc, watch};

use drover_protocol::{
    CommandFrame, ErrorShape, ResourceKind, error_response, event_frame, success_response,
};

use crate::coordinator::{CallbackCoordinator, ContinuationOutcome};
use crate::engine::{Engine, EngineError, EngineRoute, NoticeSink, PageNotice};
use crate::resources::{Resource, ResourceTable};

/// Why a command could not be satisfied, shaped for the wire.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("unknown resource: {0}")]
    UnknownResource(String),
    #[error("unknown action: {0}")]
    UnknownAction(String),
    #[error("missing or invalid parameter: {0}")]
    BadParam(&'static str),
    #[error("{message}")]
    Engine { name: &'static str, message: String },
}

impl DispatchError {
    /// Classification carried in the response's error `name` field.
    pub fn name(&self) -> &'static str {
        match self {
            DispatchError::UnknownResource(_) => "UnknownResourceError",
            DispatchError::UnknownAction(_) => "UnknownActionError",
            DispatchError::BadParam(_) => "InvalidParamsError",
            DispatchError::Engine { name, .. } => name,
        }
    }

    fn to_shape(&self) -> ErrorShape {
        ErrorShape::Detailed {
            message: self.to_string(),
            name: Some(self.name().to_string()),
        }
    }
}

impl From<EngineError> for DispatchError {
    fn from(error: EngineError) -> Self {
        DispatchError::Engine {
            name: error.name(),
            message: error.to_string(),
        }
    }
}

pub struct Dispatcher {
    engine: Arc<dyn Engine>,
    resources: Arc<ResourceTable>,
    coordinator: Arc<CallbackCoordinator>,
    out_tx: mpsc::UnboundedSender<Value>,
    shutdown_tx: watch::Sender<bool>,
    notice_tx: mpsc::UnboundedSender<(String, PageNotice)>,
}

impl Dispatcher {
    /// Build a dispatcher. The returned receiver carries page notices;
    /// hand it to [`run_notices`](Self::run_notices).
    pub fn new(
        engine: Arc<dyn Engine>,
        out_tx: mpsc::UnboundedSender<Value>,
        shutdown_tx: watch::Sender<bool>,
        continuation_ceiling: Duration,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<(String, PageNotice)>) {
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let dispatcher = Arc::new(Self {
            engine,
            resources: Arc::new(ResourceTable::new()),
            coordinator: CallbackCoordinator::with_ceiling(continuation_ceiling),
            out_tx,
            shutdown_tx,
            notice_tx,
        });
        (dispatcher, notice_rx)
    }

    pub fn resources(&self) -> &ResourceTable {
        &self.resources
    }

    pub fn coordinator(&self) -> &Arc<CallbackCoordinator> {
        &self.coordinator
    }

    /// Route one command to its handler and emit the response.
    ///
    /// Commands without an id are fire-and-forget: failures are logged,
    /// never answered.
    pub async fn dispatch(self: &Arc<Self>, command: CommandFrame) {
        if command.action == "callback.continue" {
            self.handle_continue(&command);
            return;
        }

        let tag = command.tag;
        let id = command.id;
        let action = command.action.clone();
        let result = self.execute(command).await;
        let succeeded = result.is_ok();

        match id {
            Some(id) => {
                let frame = match result {
                    Ok(body) => success_response(tag, id, body),
                    Err(error) => {
                        tracing::debug!(%action, %error, "command failed");
                        error_response(tag, id, &error.to_shape())
                    }
                };
                self.send_frame(frame);
            }
            None => {
                if let Err(error) = result {
                    tracing::debug!(%action, %error, "fire-and-forget command failed");
                }
            }
        }

        // The reply is queued by now and outbound frames drain in order,
        // so the client still sees it before the stream stops.
        if action == "exit" && succeeded {
            let _ = self.shutdown_tx.send(true);
        }
    }

    /// Resume the suspension a `callback.continue` addresses through the
    /// correlation id in its envelope.
    fn handle_continue(&self, command: &CommandFrame) {
        let Some(id) = command.id else {
            tracing::warn!("callback.continue without a correlation id");
            return;
        };
        let result = command.param("callbackResult").cloned().unwrap_or(Value::Null);
        if !self.coordinator.continue_after_callback(id, result) {
            tracing::debug!(id, "continuation not completed: no suspension under this id");
        }
    }

    async fn execute(self: &Arc<Self>, command: CommandFrame) -> Result<Value, DispatchError> {
        let action = command.action;
        let params = command.params;
        match action.split_once('.') {
            None => match action.as_str() {
                "launch" => self.launch(params).await,
                "connect" => self.connect(params).await,
                "exit" => self.exit().await,
                _ => Err(DispatchError::UnknownAction(action)),
            },
            Some(("browser", method)) => self.browser_command(method, params).await,
            Some(("context", method)) => self.context_command(method, params).await,
            Some(("page", method)) => self.page_command(method, params).await,
            Some(("route", method)) => self.route_command(method, params).await,
            Some(("dialog", method)) => self.dialog_command(method, params).await,
            Some(("response", method)) => self.response_command(method, params).await,
            Some(("server", method)) => self.server_command(method, params).await,
            Some(_) => Err(DispatchError::UnknownAction(action)),
        }
    }

    async fn launch(&self, params: Map<String, Value>) -> Result<Value, DispatchError> {
        let browser = self.engine.launch(Value::Object(params)).await?;
        let id = self.resources.allocate_id(ResourceKind::Browser);
        self.resources
            .insert(id.clone(), Resource::Browser(Arc::from(browser)));
        tracing::debug!(browser = %id, "launched");
        Ok(json!({ "browserId": id }))
    }

    async fn connect(&self, params: Map<String, Value>) -> Result<Value, DispatchError> {
        let endpoint = str_param(&params, "endpoint")?.to_string();
        let browser = self.engine.connect(&endpoint, Value::Object(params)).await?;
        let id = self.resources.allocate_id(ResourceKind::Browser);
        self.resources
            .insert(id.clone(), Resource::Browser(Arc::from(browser)));
        tracing::debug!(browser = %id, %endpoint, "connected");
        Ok(json!({ "browserId": id }))
    }

    async fn exit(&self) -> Result<Value, DispatchError> {
        self.shutdown_cleanup().await;
        Ok(json!({}))
    }

    /// Close everything the table still holds, best-effort. Runs for the
    /// exit command and again when the command stream ends; a second pass
    /// finds an empty table.
    pub(crate) async fn shutdown_cleanup(&self) {
        for id in self.resources.browser_ids() {
            if let Some(browser) = self.resources.browser(&id) {
                if let Err(error) = browser.close().await {
                    tracing::warn!(browser = %id, %error, "browser close failed during shutdown");
                }
            }
            self.remove_with_suspensions(&id);
        }
        for id in self.resources.server_ids() {
            if let Some(server) = self.resources.take_server(&id) {
                if let Err(error) = server.stop().await {
                    tracing::warn!(server = %id, %error, "server stop failed during shutdown");
                }
            }
        }
        self.coordinator.cancel_all();
    }

    async fn browser_command(
        &self,
        method: &str,
        params: Map<String, Value>,
    ) -> Result<Value, DispatchError> {
        let browser_id = str_param(&params, "browserId")?.to_string();
        let browser = self
            .resources
            .browser(&browser_id)
            .ok_or_else(|| DispatchError::UnknownResource(browser_id.clone()))?;
        match method {
            "newContext" => {
                let context = browser.new_context(Value::Object(params)).await?;
                let id = self.resources.allocate_id(ResourceKind::Context);
                self.resources.insert(
                    id.clone(),
                    Resource::Context {
                        handle: Arc::from(context),
                        browser_id,
                    },
                );
                Ok(json!({ "contextId": id }))
            }
            "version" => Ok(json!({ "version": browser.version() })),
            "close" => {
                // Engine teardown first; the sweep must run whether or not
                // it succeeded.
                let closed = browser.close().await;
                self.remove_with_suspensions(&browser_id);
                closed?;
                Ok(json!({}))
            }
            _ => Err(DispatchError::UnknownAction(format!("browser.{method}"))),
        }
    }

    async fn context_command(
        &self,
        method: &str,
        params: Map<String, Value>,
    ) -> Result<Value, DispatchError> {
        let context_id = str_param(&params, "contextId")?.to_string();
        let context = self
            .resources
            .context(&context_id)
            .ok_or_else(|| DispatchError::UnknownResource(context_id.clone()))?;
        match method {
            "newPage" => {
                // The id is minted up front so the page's notices carry it
                // from the first frame on.
                let page_id = self.resources.allocate_id(ResourceKind::Page);
                let sink = NoticeSink::new(page_id.clone(), self.notice_tx.clone());
                let page = context.new_page(sink).await?;
                self.resources.insert(
                    page_id.clone(),
                    Resource::Page {
                        handle: Arc::from(page),
                        context_id,
                    },
                );
                Ok(json!({ "pageId": page_id }))
            }
            "setThrottle" => {
                context.set_throttle(Value::Object(params)).await?;
                Ok(json!({}))
            }
            "close" => {
                let closed = context.close().await;
                self.remove_with_suspensions(&context_id);
                closed?;
                Ok(json!({}))
            }
            _ => Err(DispatchError::UnknownAction(format!("context.{method}"))),
        }
    }

    async fn page_command(
        &self,
        method: &str,
        params: Map<String, Value>,
    ) -> Result<Value, DispatchError> {
        let page_id = str_param(&params, "pageId")?.to_string();
        let page = self
            .resources
            .page(&page_id)
            .ok_or_else(|| DispatchError::UnknownResource(page_id.clone()))?;
        match method {
            "navigate" => {
                let url = str_param(&params, "url")?.to_string();
                let response = page.navigate(&url, Value::Object(params)).await?;
                let id = self.resources.allocate_id(ResourceKind::Response);
                let summary = json!({
                    "responseId": id.clone(),
                    "url": response.url.clone(),
                    "status": response.status,
                    "headers": response.headers.clone(),
                });
                self.resources
                    .insert(id, Resource::Response { response, page_id });
                Ok(summary)
            }
            "evaluate" => {
                let expression = str_param(&params, "expression")?;
                let value = page.evaluate(expression).await?;
                Ok(json!({ "value": value }))
            }
            "setInterception" => {
                let enabled = bool_param(&params, "enabled")?;
                let patterns = params.get("patterns").cloned().unwrap_or(Value::Null);
                page.set_interception(enabled, patterns).await?;
                Ok(json!({}))
            }
            "close" => {
                let closed = page.close().await;
                self.remove_with_suspensions(&page_id);
                closed?;
                Ok(json!({}))
            }
            _ => Err(DispatchError::UnknownAction(format!("page.{method}"))),
        }
    }

    async fn route_command(
        &self,
        method: &str,
        params: Map<String, Value>,
    ) -> Result<Value, DispatchError> {
        enum Verb {
            Fulfill,
            PassThrough,
            Abort,
        }
        let verb = match method {
            "fulfill" => Verb::Fulfill,
            "continue" => Verb::PassThrough,
            "abort" => Verb::Abort,
            _ => return Err(DispatchError::UnknownAction(format!("route.{method}"))),
        };
        let route_id = str_param(&params, "routeId")?.to_string();
        // The entry comes out before the engine call: a route is spent the
        // moment a command addresses it, success or not.
        let Some(route) = self.resources.take_route(&route_id) else {
            return Err(DispatchError::UnknownResource(route_id));
        };
        // A direct command outranks whatever suspension is still parked on
        // this route.
        self.coordinator.cancel_owned_by(&route_id);
        match verb {
            Verb::Fulfill => route.fulfill(Value::Object(params)).await?,
            Verb::PassThrough => route.pass_through(Value::Object(params)).await?,
            Verb::Abort => {
                let reason = params
                    .get("reason")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                route.abort(reason).await?;
            }
        }
        Ok(json!({}))
    }

    async fn dialog_command(
        &self,
        method: &str,
        params: Map<String, Value>,
    ) -> Result<Value, DispatchError> {
        enum Verb {
            Accept,
            Dismiss,
        }
        let verb = match method {
            "accept" => Verb::Accept,
            "dismiss" => Verb::Dismiss,
            _ => return Err(DispatchError::UnknownAction(format!("dialog.{method}"))),
        };
        let dialog_id = str_param(&params, "dialogId")?.to_string();
        let Some(dialog) = self.resources.take_dialog(&dialog_id) else {
            return Err(DispatchError::UnknownResource(dialog_id));
        };
        match verb {
            Verb::Accept => {
                let prompt_text = params
                    .get("promptText")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                dialog.accept(prompt_text).await?;
            }
            Verb::Dismiss => dialog.dismiss().await?,
        }
        Ok(json!({}))
    }

    async fn response_command(
        &self,
        method: &str,
        params: Map<String, Value>,
    ) -> Result<Value, DispatchError> {
        match method {
            "body" => {
                use base64::{Engine as _, engine::general_purpose};
                let response_id = str_param(&params, "responseId")?;
                let Some(response) = self.resources.response(response_id) else {
                    return Err(DispatchError::UnknownResource(response_id.to_string()));
                };
                let body = general_purpose::STANDARD.encode(&response.body);
                Ok(json!({ "body": body }))
            }
            _ => Err(DispatchError::UnknownAction(format!("response.{method}"))),
        }
    }

    async fn server_command(
        &self,
        method: &str,
        params: Map<String, Value>,
    ) -> Result<Value, DispatchError> {
        match method {
            "start" => {
                let server = self.engine.start_server(Value::Object(params)).await?;
                let id = self.resources.allocate_id(ResourceKind::Server);
                let url = server.url();
                self.resources.insert(id.clone(), Resource::Server(server));
                Ok(json!({ "serverId": id, "url": url }))
            }
            "stop" => {
                let server_id = str_param(&params, "serverId")?.to_string();
                let Some(server) = self.resources.take_server(&server_id) else {
                    return Err(DispatchError::UnknownResource(server_id));
                };
                server.stop().await?;
                Ok(json!({}))
            }
            _ => Err(DispatchError::UnknownAction(format!("server.{method}"))),
        }
    }

    /// Drain the notice stream. Runs as its own task for the life of the
    /// serve loop.
    pub async fn run_notices(
        self: Arc<Self>,
        mut notices: mpsc::UnboundedReceiver<(String, PageNotice)>,
    ) {
        while let Some((page_id, notice)) = notices.recv().await {
            self.handle_notice(page_id, notice);
        }
    }

    fn handle_notice(self: &Arc<Self>, page_id: String, notice: PageNotice) {
        tracing::debug!(page = %page_id, kind = notice.name(), "page notice");
        match notice {
            PageNotice::Console {
                kind,
                text,
                args,
                location,
            } => {
                self.send_frame(event_frame(
                    &page_id,
                    "console",
                    json!({ "type": kind, "text": text, "args": args, "location": location }),
                ));
            }
            PageNotice::Closed => {
                // The engine closed the page on its own; sweep as if the
                // client had asked.
                self.remove_with_suspensions(&page_id);
                self.send_frame(event_frame(&page_id, "close", json!({})));
            }
            PageNotice::Dialog {
                kind,
                message,
                dialog,
            } => {
                let dialog_id = self.resources.insert_dialog(dialog, page_id.clone());
                self.send_frame(event_frame(
                    &page_id,
                    "dialog",
                    json!({ "dialogId": dialog_id, "type": kind, "message": message }),
                ));
            }
            PageNotice::Route { request, route } => self.suspend_route(page_id, request, route),
        }
    }

    /// Park an intercepted request and ask the client for a verdict.
    ///
    /// The route handle goes into the table so direct `route.*` commands
    /// can claim it; whichever side takes it first acts on it.
    fn suspend_route(self: &Arc<Self>, page_id: String, request: Value, route: Box<dyn EngineRoute>) {
        let route_id = self.resources.allocate_id(ResourceKind::Route);
        self.resources.insert(
            route_id.clone(),
            Resource::Route {
                handle: route,
                page_id: page_id.clone(),
            },
        );
        let (correlation_id, suspension) = self.coordinator.suspend(route_id.clone());
        self.send_frame(event_frame(
            &page_id,
            "route",
            json!({ "requestId": correlation_id, "routeId": route_id, "request": request }),
        ));

        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            match suspension.wait().await {
                ContinuationOutcome::Resolved(verdict) => {
                    let Some(route) = dispatcher.resources.take_route(&route_id) else {
                        tracing::debug!(route = %route_id, "route already claimed by a direct command");
                        return;
                    };
                    if let Err(error) = apply_route_verdict(route, verdict).await {
                        tracing::warn!(route = %route_id, %error, "route verdict failed");
                    }
                }
                ContinuationOutcome::TimedOut => {
                    let Some(route) = dispatcher.resources.take_route(&route_id) else {
                        return;
                    };
                    tracing::warn!(
                        route = %route_id,
                        "no continuation before the ceiling; continuing request unmodified"
                    );
                    if let Err(error) = route.pass_through(Value::Null).await {
                        tracing::warn!(route = %route_id, %error, "default continue failed");
                    }
                }
                ContinuationOutcome::Cancelled => {
                    tracing::debug!(route = %route_id, "route suspension cancelled");
                }
            }
        });
    }

    /// Sweep `id` and its descendants out of the table, cancelling any
    /// suspension parked on a removed entry.
    fn remove_with_suspensions(&self, id: &str) {
        for removed in self.resources.remove_cascade(id) {
            self.coordinator.cancel_owned_by(&removed);
        }
    }

    pub(crate) fn send_frame(&self, frame: Value) {
        if self.out_tx.send(frame).is_err() {
            tracing::debug!("frame writer gone; dropping frame");
        }
    }
}

/// Apply the client's `callbackResult` verdict to a claimed route. Unknown
/// or absent actions continue the request unmodified.
async fn apply_route_verdict(route: Box<dyn EngineRoute>, verdict: Value) -> Result<(), EngineError> {
    let action = verdict
        .get("action")
        .and_then(Value::as_str)
        .unwrap_or("continue")
        .to_string();
    match action.as_str() {
        "fulfill" => route.fulfill(verdict).await,
        "abort" => {
            let reason = verdict
                .get("reason")
                .and_then(Value::as_str)
                .map(str::to_string);
            route.abort(reason).await
        }
        _ => route.pass_through(verdict).await,
    }
}

fn str_param<'a>(
    params: &'a Map<String, Value>,
    key: &'static str,
) -> Result<&'a str, DispatchError> {
    params
        .get(key)
        .and_then(Value::as_str)
        .ok_or(DispatchError::BadParam(key))
}

fn bool_param(params: &Map<String, Value>, key: &'static str) -> Result<bool, DispatchError> {
    params
        .get(key)
        .and_then(Value::as_bool)
        .ok_or(DispatchError::BadParam(key))
}
