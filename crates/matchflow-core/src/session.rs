//! Session state for one simulation run.
//!
//! [`Session`] is the authoritative record the event dispatcher mutates as
//! frames arrive. The original system spread these fields across independent
//! reactive variables; here they live in a single struct transformed by a
//! reducer, so observers always see a mutually consistent view.
//!
//! Once `status` reaches [`SessionStatus::Completed`] or
//! [`SessionStatus::Error`] the record is frozen — the dispatcher refuses
//! further mutation.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::events::Dialect;
use crate::ids::SessionId;

/// Coarse lifecycle of a session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// No run in flight.
    #[default]
    Idle,
    /// Request issued, no bytes received yet.
    Connecting,
    /// Frames are arriving.
    Streaming,
    /// Terminal success.
    Completed,
    /// Terminal failure.
    Error,
}

/// One parsed unit from the wire. Immutable once constructed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Outer SSE event type (`"message"` when the frame had no `event:` line).
    #[serde(rename = "eventType")]
    pub event_type: String,
    /// Decoded JSON payload.
    pub payload: Value,
    /// When the frame was parsed.
    #[serde(rename = "receivedAt")]
    pub received_at: DateTime<Utc>,
}

impl Frame {
    /// Construct a frame stamped with the current time.
    #[must_use]
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            received_at: Utc::now(),
        }
    }
}

/// Lifecycle of a scenario. Transitions are forward-only.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioStatus {
    /// Surfaced by the generation phase.
    #[default]
    Generated,
    /// Undergoing Monte Carlo validation.
    Validating,
    /// Confidence stabilized.
    Converged,
    /// Included in the terminal result.
    Final,
}

impl ScenarioStatus {
    /// Ordering rank used to enforce forward-only transitions.
    #[must_use]
    pub fn rank(self) -> u8 {
        match self {
            Self::Generated => 0,
            Self::Validating => 1,
            Self::Converged => 2,
            Self::Final => 3,
        }
    }
}

/// A hypothesized match-outcome narrative surfaced by the backend.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    /// Backend-assigned identifier.
    pub id: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Probability in 0–1.
    #[serde(default)]
    pub probability: f64,
    /// Lifecycle status.
    #[serde(default)]
    pub status: ScenarioStatus,
    /// Validation runs attributed to this scenario so far.
    #[serde(default, rename = "validationRuns")]
    pub validation_runs: u64,
}

/// One confidence measurement at a given iteration. Append-only.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConvergencePoint {
    /// Iteration counter from the backend.
    pub iteration: u64,
    /// Confidence in 0–1.
    pub confidence: f64,
}

/// Status of a phase timeline entry. Flips active→completed only.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    /// Phase is running.
    Active,
    /// Phase finished.
    Completed,
}

/// One entry in the phase timeline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PhaseTimelineEntry {
    /// Which protocol generation named this phase.
    pub dialect: Dialect,
    /// Dialect-scoped phase number.
    pub phase: u8,
    /// Human-readable title.
    pub title: String,
    /// Active or completed.
    pub status: PhaseStatus,
    /// When the phase started.
    pub timestamp: DateTime<Utc>,
}

/// Fine-grained simulated-match telemetry, kept apart from phase state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MatchMoment {
    /// Simulated match minute, when reported.
    #[serde(default)]
    pub minute: Option<u32>,
    /// Event kind as reported (`"goal"`, `"card"`, …).
    #[serde(default)]
    pub kind: Option<String>,
    /// Free-text description.
    #[serde(default)]
    pub description: String,
    /// When the moment was received.
    pub timestamp: DateTime<Utc>,
}

/// Consensus outcome probabilities from the terminal payload.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WinProbabilities {
    /// Home side wins.
    #[serde(default)]
    pub home_win: f64,
    /// Draw.
    #[serde(default)]
    pub draw: f64,
    /// Away side wins.
    #[serde(default)]
    pub away_win: f64,
}

/// Terminal result carried by a `completed` frame.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    /// Consensus probabilities.
    #[serde(default)]
    pub probabilities: WinProbabilities,
    /// Final scenario set.
    #[serde(default)]
    pub scenarios: Vec<Scenario>,
    /// Opaque validation summary, retained verbatim.
    #[serde(default)]
    pub validation: Value,
    /// Backend-reported wall time in seconds.
    #[serde(default)]
    pub execution_time: f64,
}

/// The authoritative state of one simulation run.
///
/// Mutated only by the event dispatcher; constructed fresh on every
/// `start()`. At most one live session exists per controller.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Session identifier.
    pub id: SessionId,
    /// Requested home side.
    pub home_team: String,
    /// Requested away side.
    pub away_team: String,
    /// Coarse lifecycle status.
    pub status: SessionStatus,
    /// When `start()` was called. `None` until first started.
    pub started_at: Option<DateTime<Utc>>,
    /// Current phase number; 0 = not started.
    pub current_phase: u8,
    /// Monotone progress in 0–100.
    pub progress_percent: f64,
    /// Discovered scenarios, in backend-declared order.
    pub scenarios: Vec<Scenario>,
    /// Append-only convergence history.
    pub convergence_history: Vec<ConvergencePoint>,
    /// Phase timeline, one entry per (dialect, phase).
    pub phase_timeline: Vec<PhaseTimelineEntry>,
    /// Simulated-match telemetry.
    pub match_timeline: Vec<MatchMoment>,
    /// Running sum of simulation runs across phases.
    pub total_simulations: u64,
    /// Latest reported confidence.
    pub confidence: Option<f64>,
    /// Reported convergence threshold.
    pub convergence_threshold: Option<f64>,
    /// Whether the backend declared convergence.
    pub converged: bool,
    /// Terminal result. Set exactly once, on success.
    pub result: Option<MatchResult>,
    /// Terminal error message. Set exactly once, on failure.
    pub error: Option<String>,
    /// All non-heartbeat frames, in arrival order.
    pub event_log: Vec<Frame>,
    /// Last heartbeat arrival, for caller-side staleness checks.
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    /// Frames dropped due to payload decode failures.
    pub parse_errors: u64,
}

impl Session {
    /// Fresh session for one matchup, in `Idle` status.
    #[must_use]
    pub fn new(home_team: impl Into<String>, away_team: impl Into<String>) -> Self {
        Self {
            id: SessionId::new(),
            home_team: home_team.into(),
            away_team: away_team.into(),
            status: SessionStatus::Idle,
            started_at: None,
            current_phase: 0,
            progress_percent: 0.0,
            scenarios: Vec::new(),
            convergence_history: Vec::new(),
            phase_timeline: Vec::new(),
            match_timeline: Vec::new(),
            total_simulations: 0,
            confidence: None,
            convergence_threshold: None,
            converged: false,
            result: None,
            error: None,
            event_log: Vec::new(),
            last_heartbeat_at: None,
            parse_errors: 0,
        }
    }

    /// Whether a reader is (or should be) attached.
    #[must_use]
    pub fn is_live(&self) -> bool {
        matches!(
            self.status,
            SessionStatus::Connecting | SessionStatus::Streaming
        )
    }

    /// Whether the session reached a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            SessionStatus::Completed | SessionStatus::Error
        )
    }

    /// Time since `start()`, if the session has been started.
    #[must_use]
    pub fn elapsed(&self) -> Option<Duration> {
        self.started_at.map(|t| Utc::now() - t)
    }

    /// Time since the last heartbeat, if one arrived.
    ///
    /// Callers can build their own staleness timeout on top of this; the
    /// monitor itself imposes none.
    #[must_use]
    pub fn heartbeat_age(&self) -> Option<Duration> {
        self.last_heartbeat_at.map(|t| Utc::now() - t)
    }

    /// Look up a scenario by backend id.
    #[must_use]
    pub fn scenario_mut(&mut self, id: &str) -> Option<&mut Scenario> {
        self.scenarios.iter_mut().find(|s| s.id == id)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
