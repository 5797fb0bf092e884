//! Wire types for the drover worker protocol (internal).
//!
//! Everything that crosses the byte stream between a drover client and its
//! worker process lives here:
//!
//! - [`framing`] - the `Content-Length` frame codec wrapping each JSON message
//! - [`envelope`] - the two envelope conventions riding inside frames, and
//!   the structural classifier for inbound traffic
//! - [`ids`] - the generated resource-id scheme shared by both sides
//!
//! This crate is pure data: no I/O, no async, no process handling. Both the
//! client runtime and the worker depend on it so the two halves can never
//! drift apart on the byte format.

pub mod envelope;
pub mod framing;
pub mod ids;

pub use envelope::{
    CommandFrame, ErrorShape, EventFrame, IdTag, Inbound, Outbound, Response, error_response,
    event_frame, ready_frame, success_response,
};
pub use framing::{FramingError, MAX_FRAME_BYTES, decode_frame, encode_frame};
pub use ids::ResourceKind;
