//! # matchflow-core
//!
//! Foundation types for the matchflow streaming pipeline monitor.
//!
//! This crate provides the shared vocabulary the monitor crates depend on:
//!
//! - **Branded IDs**: `SessionId` as a newtype for type safety
//! - **Session state**: the `Session` record plus `Scenario`,
//!   `ConvergencePoint`, `PhaseTimelineEntry`, `MatchMoment`, `MatchResult`
//! - **Frames**: the parsed `(event type, payload)` unit from the wire
//! - **Event vocabulary**: `EventKind` and `Dialect` with the
//!   stage-vs-outer-type normalization shared by both protocol generations
//! - **Logging**: `tracing` subscriber initialization

#![deny(unsafe_code)]

pub mod events;
pub mod ids;
pub mod logging;
pub mod session;

pub use events::{classify, phase_title, Dialect, EventKind, LEGACY_ITERATION_PHASE};
pub use ids::SessionId;
pub use session::{
    ConvergencePoint, Frame, MatchMoment, MatchResult, PhaseStatus, PhaseTimelineEntry, Scenario,
    ScenarioStatus, Session, SessionStatus, WinProbabilities,
};
