//! # matchflow-stream
//!
//! Streaming pipeline monitor for the remote match simulation backend.
//!
//! Consumes a one-shot server-sent-event stream and projects it into a
//! consistent, incrementally updated [`matchflow_core::Session`]:
//!
//! - Shared SSE frame decoder (blank-line framing, `event:`/`data:` lines,
//!   partial frames retained across chunk boundaries)
//! - Event dispatcher: a pure `(state, frame)` reducer over the normalized
//!   event vocabulary, tolerant of both protocol generations
//! - Progress estimator: static milestones + inline payload overrides,
//!   monotonically clamped
//! - Transport reader over `reqwest` streaming bodies, cooperatively
//!   cancellable
//! - [`SessionController`]: the public `start` / `cancel` / observe surface

#![deny(unsafe_code)]

pub mod controller;
pub mod dispatch;
pub mod progress;
pub mod sse;
pub mod transport;

pub use controller::SessionController;
pub use sse::{frame_stream, FrameDecoder, FrameParseError, FrameStreamError};
pub use transport::{
    FrameStream, MonitorConfig, MonitorError, MonitorResult, SimulationRequest, StreamTransport,
};
