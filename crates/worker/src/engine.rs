//! The seam between protocol plumbing and the automation engine.
//!
//! The worker never touches a browser directly. It drives an [`Engine`],
//! which hands back trait objects for browsers, contexts, pages and the
//! rest. Handlers in [`crate::dispatch`] own the mapping between generated
//! resource ids and these handles; the engine side stays id-free.
//!
//! Pages are the one place traffic flows the other way: an engine delivers
//! paused requests, dialogs and console output through the [`NoticeSink`]
//! given to [`EngineContext::new_page`].

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

/// Failure reported by the engine, tagged with the classification that
/// travels in wire error `name` fields.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{0}")]
    Failed(String),
    #[error("{0}")]
    Timeout(String),
    #[error("{0}")]
    Network(String),
}

impl EngineError {
    pub fn name(&self) -> &'static str {
        match self {
            EngineError::Failed(_) => "Error",
            EngineError::Timeout(_) => "TimeoutError",
            EngineError::Network(_) => "NetworkError",
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Completed navigation, kept around so the client can fetch the body
/// later through its generated response id.
#[derive(Debug, Clone)]
pub struct EngineResponse {
    pub url: String,
    pub status: u16,
    pub headers: Value,
    pub body: Vec<u8>,
}

/// Something a live page wants the client to hear about.
///
/// Route and dialog notices carry the handle needed to act on them; the
/// dispatch layer registers those under fresh resource ids before telling
/// the client.
pub enum PageNotice {
    /// A request was paused by interception and awaits a verdict.
    Route {
        request: Value,
        route: Box<dyn EngineRoute>,
    },
    /// The page raised a modal dialog.
    Dialog {
        kind: String,
        message: String,
        dialog: Box<dyn EngineDialog>,
    },
    /// Console output.
    Console {
        kind: String,
        text: String,
        args: Vec<Value>,
        /// Source location as "url:line", when the engine knows it.
        location: Option<String>,
    },
    /// The page closed from the engine side.
    Closed,
}

impl PageNotice {
    pub fn name(&self) -> &'static str {
        match self {
            PageNotice::Route { .. } => "route",
            PageNotice::Dialog { .. } => "dialog",
            PageNotice::Console { .. } => "console",
            PageNotice::Closed => "close",
        }
    }
}

/// Hands page-scoped notices to the dispatch layer.
///
/// The dispatcher allocates the page id before asking the engine for the
/// page, so every notice arrives already labelled with the id the client
/// knows.
#[derive(Clone)]
pub struct NoticeSink {
    page_id: String,
    tx: mpsc::UnboundedSender<(String, PageNotice)>,
}

impl NoticeSink {
    pub fn new(
        page_id: impl Into<String>,
        tx: mpsc::UnboundedSender<(String, PageNotice)>,
    ) -> Self {
        Self {
            page_id: page_id.into(),
            tx,
        }
    }

    pub fn page_id(&self) -> &str {
        &self.page_id
    }

    /// Post one notice. Returns `false` once the dispatcher is gone; an
    /// engine may treat that as "stop reporting".
    pub fn post(&self, notice: PageNotice) -> bool {
        self.tx.send((self.page_id.clone(), notice)).is_ok()
    }
}

/// Entry point into the automation engine.
#[async_trait]
pub trait Engine: Send + Sync + 'static {
    /// Starts a fresh browser.
    async fn launch(&self, options: Value) -> EngineResult<Box<dyn EngineBrowser>>;

    /// Attaches to a browser already running at `endpoint`.
    async fn connect(&self, endpoint: &str, options: Value) -> EngineResult<Box<dyn EngineBrowser>>;

    /// Starts an auxiliary local server (fixture content, proxies).
    async fn start_server(&self, options: Value) -> EngineResult<Box<dyn EngineServer>>;
}

/// A running browser.
#[async_trait]
pub trait EngineBrowser: Send + Sync {
    /// Engine-reported browser version string.
    fn version(&self) -> String;

    /// Opens an isolated browsing context.
    async fn new_context(&self, options: Value) -> EngineResult<Box<dyn EngineContext>>;

    /// Shuts the browser down along with everything inside it.
    async fn close(&self) -> EngineResult<()>;
}

/// An isolated browsing context within a browser.
#[async_trait]
pub trait EngineContext: Send + Sync {
    /// Opens a page. Notices the page raises flow through `notices`.
    async fn new_page(&self, notices: NoticeSink) -> EngineResult<Box<dyn EnginePage>>;

    /// Applies network throttling to every page in the context.
    async fn set_throttle(&self, options: Value) -> EngineResult<()>;

    async fn close(&self) -> EngineResult<()>;
}

/// A single page.
#[async_trait]
pub trait EnginePage: Send + Sync {
    /// Navigates and resolves with the main document response.
    async fn navigate(&self, url: &str, options: Value) -> EngineResult<EngineResponse>;

    /// Evaluates an expression in the page and returns its JSON value.
    async fn evaluate(&self, expression: &str) -> EngineResult<Value>;

    /// Turns request interception on or off for the given URL patterns.
    async fn set_interception(&self, enabled: bool, patterns: Value) -> EngineResult<()>;

    async fn close(&self) -> EngineResult<()>;
}

/// A paused, intercepted request. Consuming methods enforce that each
/// route is acted on at most once.
#[async_trait]
pub trait EngineRoute: Send + Sync {
    /// Answers the request with a synthetic response.
    async fn fulfill(self: Box<Self>, response: Value) -> EngineResult<()>;

    /// Lets the request through, optionally rewritten by `overrides`.
    async fn pass_through(self: Box<Self>, overrides: Value) -> EngineResult<()>;

    /// Fails the request.
    async fn abort(self: Box<Self>, reason: Option<String>) -> EngineResult<()>;
}

/// An open modal dialog. Accepting or dismissing consumes it.
#[async_trait]
pub trait EngineDialog: Send + Sync {
    async fn accept(self: Box<Self>, prompt_text: Option<String>) -> EngineResult<()>;

    async fn dismiss(self: Box<Self>) -> EngineResult<()>;
}

/// An auxiliary server started through [`Engine::start_server`].
#[async_trait]
pub trait EngineServer: Send + Sync {
    /// Address the server listens on.
    fn url(&self) -> String;

    /// Stops the server; the handle is dead afterwards.
    async fn stop(self: Box<Self>) -> EngineResult<()>;
}
