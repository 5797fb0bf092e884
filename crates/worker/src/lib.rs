//! Drover Worker - the engine-side half of the worker protocol.
//!
//! A worker process embeds this crate, plugs in an [`Engine`]
//! implementation for its automation backend, and calls [`serve_stdio`].
//! Everything else is protocol plumbing:
//!
//! - [`serve`] - framed command loop over stdio (or any byte pair)
//! - [`dispatch`] - action routing, response shaping, event emission
//! - [`resources`] - generated ids to live engine handles, with
//!   cascade removal along ownership lines
//! - [`coordinator`] - suspensions awaiting a `callback.continue` verdict
//! - [`engine`] - the traits an automation backend implements
//! - [`testing`] - a scriptable mock engine for exercising the plumbing
//!
//! ```text
//! client runtime ◄─ stdio ─► serve loop ─► dispatcher ─► engine
//!                                              │
//!                                ┌─────────────┴─────────────┐
//!                                │ resource table            │
//!                                │ callback coordinator      │
//!                                └───────────────────────────┘
//! ```

pub mod coordinator;
pub mod dispatch;
pub mod engine;
pub mod resources;
pub mod serve;
pub mod testing;

// Re-export key types at crate root
pub use coordinator::{
    CallbackCoordinator, ContinuationOutcome, DEFAULT_CONTINUATION_CEILING, Suspension,
};
pub use dispatch::{DispatchError, Dispatcher};
pub use engine::{
    Engine, EngineBrowser, EngineContext, EngineDialog, EngineError, EnginePage, EngineResponse,
    EngineResult, EngineRoute, EngineServer, NoticeSink, PageNotice,
};
pub use resources::{Resource, ResourceTable};
pub use serve::{ServeOptions, serve, serve_stdio};
