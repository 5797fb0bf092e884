//! Drover Runtime - Worker lifecycle, connection, and registry
//!
//! This crate provides the client-side runtime infrastructure for driving a
//! drover worker process:
//!
//! - **Supervisor**: Locating, version-checking, and launching the worker
//! - **Transport**: Length-prefixed framing over the worker's stdio pipes
//! - **Connection**: Request/response correlation and event dispatch
//! - **Registry**: Remote-object ownership, cascaded disposal, and event
//!   subscription
//! - **Session**: The assembled lifecycle, from launch to shutdown
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐
//! │   embedder   │  Automation logic (browsers, pages, routes)
//! └──────┬───────┘
//!        │
//! ┌──────▼───────┐
//! │   runtime    │  This crate
//! │  ┌─────────┐ │
//! │  │ Session │ │  Launch, readiness, shutdown, crash watch
//! │  └─────────┘ │
//! │  ┌─────────┐ │
//! │  │ Conn    │ │  ID allocation and response correlation
//! │  └─────────┘ │
//! │  ┌─────────┐ │
//! │  │ Transport│ │ Content-Length framing over pipes
//! │  └─────────┘ │
//! │  ┌─────────┐ │
//! │  │ Superv. │ │  Process management
//! │  └─────────┘ │
//! └──────┬───────┘
//!        │ stdio
//! ┌──────▼───────┐
//! │ drover-worker│  Engine host process
//! └──────────────┘
//! ```

pub mod connection;
pub mod error;
pub mod events;
pub mod registry;
pub mod session;
pub mod supervisor;
pub mod transport;

// Re-export key types at crate root
pub use connection::{Connection, DEFAULT_SEND_TIMEOUT};
pub use error::{Error, Result};
pub use events::RemoteEvent;
pub use registry::{RemoteHandle, RemoteRegistry};
pub use session::{DEFAULT_READY_TIMEOUT, Session, launch_session};
pub use supervisor::{
    MIN_WORKER_VERSION, WORKER_EXE_ENV, WorkerConfig, WorkerProcess, check_worker_version,
    resolve_worker_executable,
};
pub use transport::{PipeTransport, StreamEvent, Transport, TransportParts, TransportReceiver};
