//! Pipeline event vocabulary and dialect classification.
//!
//! The backend layers two event taxonomies on top of each other: the outer
//! SSE event type (often just `info` / `success` / `error` / `message`) and
//! a more specific `stage` field embedded in the JSON payload (e.g.
//! `phase2_complete`). [`classify`] normalizes both into one
//! `(Dialect, EventKind)` pair, resolved exactly once per frame.
//!
//! Two protocol generations coexist in the wild. The current pipeline uses
//! `phase1`–`phase3`; an older deployment emits `phase4`–`phase7` and
//! `iteration_*` stages. Both must be tolerated in a single stream without
//! one corrupting state populated by the other, so every phase-bearing
//! event carries its dialect.

use serde_json::Value;

/// Which protocol generation an event name belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    /// The current three-phase pipeline (`phase1`–`phase3`).
    Current,
    /// The older pipeline (`phase4`–`phase7`, `iteration_*`).
    Legacy,
}

/// Normalized event kind, after stage-vs-outer-type resolution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    /// Keep-alive; carries no semantic state change.
    Heartbeat,
    /// Pipeline accepted the request and began work.
    Started,
    /// Backend is fetching team data.
    LoadingTeams,
    /// Team data available.
    TeamsLoaded,
    /// A named phase began. The number is dialect-scoped.
    PhaseStarted(u8),
    /// A named phase finished.
    PhaseComplete(u8),
    /// Incremental scenario-generation progress (inline fraction).
    GenerationProgress,
    /// One convergence confidence measurement.
    ConvergenceCheck,
    /// Convergence threshold crossed.
    ConvergenceReached,
    /// Fine-grained simulated-match telemetry.
    MatchEvent,
    /// Terminal success; payload carries the result.
    Completed,
    /// Terminal failure; payload carries the message.
    Error,
    /// Unrecognized name; logged and otherwise ignored.
    Unknown,
}

/// Legacy iteration events are modeled as a phase of their own.
pub const LEGACY_ITERATION_PHASE: u8 = 8;

/// Resolve the effective event for a frame.
///
/// Prefers the payload's `stage` field over the outer SSE event type: the
/// outer type is frequently a coarse severity (`info` / `success` / `error`)
/// while `stage` names the actual pipeline step.
#[must_use]
pub fn classify(outer_type: &str, payload: &Value) -> (Dialect, EventKind) {
    let name = payload
        .get("stage")
        .and_then(Value::as_str)
        .unwrap_or(outer_type);
    classify_name(name)
}

/// Map one event name to its dialect and kind.
#[must_use]
pub fn classify_name(name: &str) -> (Dialect, EventKind) {
    use EventKind::{
        Completed, ConvergenceCheck, ConvergenceReached, Error, GenerationProgress, Heartbeat,
        LoadingTeams, MatchEvent, PhaseComplete, PhaseStarted, Started, TeamsLoaded, Unknown,
    };

    let (dialect, kind) = match name {
        "heartbeat" | "ping" => (Dialect::Current, Heartbeat),
        "started" => (Dialect::Current, Started),
        "loading_teams" => (Dialect::Current, LoadingTeams),
        "teams_loaded" => (Dialect::Current, TeamsLoaded),
        "phase1_started" => (Dialect::Current, PhaseStarted(1)),
        "phase1_complete" => (Dialect::Current, PhaseComplete(1)),
        "phase2_started" => (Dialect::Current, PhaseStarted(2)),
        "phase2_complete" => (Dialect::Current, PhaseComplete(2)),
        "phase3_started" => (Dialect::Current, PhaseStarted(3)),
        "phase3_complete" => (Dialect::Current, PhaseComplete(3)),
        "generation_progress" => (Dialect::Current, GenerationProgress),
        "convergence_check" => (Dialect::Current, ConvergenceCheck),
        "convergence_reached" => (Dialect::Current, ConvergenceReached),
        "match_event" => (Dialect::Current, MatchEvent),
        // Outer types conflate success/error severities with real stages.
        "completed" | "success" => (Dialect::Current, Completed),
        "error" => (Dialect::Current, Error),
        "phase4_started" => (Dialect::Legacy, PhaseStarted(4)),
        "phase4_complete" => (Dialect::Legacy, PhaseComplete(4)),
        "phase5_started" => (Dialect::Legacy, PhaseStarted(5)),
        "phase5_complete" => (Dialect::Legacy, PhaseComplete(5)),
        "phase6_started" => (Dialect::Legacy, PhaseStarted(6)),
        "phase6_complete" => (Dialect::Legacy, PhaseComplete(6)),
        "phase7_started" => (Dialect::Legacy, PhaseStarted(7)),
        "phase7_complete" => (Dialect::Legacy, PhaseComplete(7)),
        "iteration_started" => (Dialect::Legacy, PhaseStarted(LEGACY_ITERATION_PHASE)),
        "iteration_complete" => (Dialect::Legacy, PhaseComplete(LEGACY_ITERATION_PHASE)),
        _ => (Dialect::Current, Unknown),
    };
    (dialect, kind)
}

/// Human-readable title for a phase, per dialect.
#[must_use]
pub fn phase_title(dialect: Dialect, phase: u8) -> &'static str {
    match (dialect, phase) {
        (Dialect::Current, 1) => "Analyzing team data",
        (Dialect::Current, 2) => "Generating scenarios",
        (Dialect::Current, 3) => "Monte Carlo validation",
        (Dialect::Legacy, 4) => "Statistical modeling",
        (Dialect::Legacy, 5) => "Scenario refinement",
        (Dialect::Legacy, 6) => "Consensus simulation",
        (Dialect::Legacy, 7) => "Final validation",
        (Dialect::Legacy, LEGACY_ITERATION_PHASE) => "Consensus iteration",
        _ => "Pipeline phase",
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
