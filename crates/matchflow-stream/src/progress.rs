//! Progress estimation policy.
//!
//! Progress is sourced from three signals, in precedence order:
//!
//! 1. An explicit `progress` fraction in the payload (0–1, scaled to 0–100)
//! 2. For `generation_progress` only: linear interpolation of the inline
//!    fraction within the 50–85 window the generation phase occupies
//! 3. A static per-event milestone table
//!
//! Whatever the source, the result is clamped so progress never moves
//! backward within a session. The interpolation window and milestone values
//! mirror the backend's observed timing; they are not generalized to event
//! kinds the table does not name — unknown kinds contribute no progress.

use serde_json::Value;

use matchflow_core::{Dialect, EventKind, LEGACY_ITERATION_PHASE};

/// Interpolation window for `generation_progress`.
const GENERATION_WINDOW: (f64, f64) = (50.0, 85.0);

/// Static milestone for a known event kind, in pipeline order.
#[must_use]
pub fn milestone(dialect: Dialect, kind: EventKind) -> Option<f64> {
    match (dialect, kind) {
        (_, EventKind::Started) => Some(5.0),
        (_, EventKind::LoadingTeams) => Some(8.0),
        (_, EventKind::TeamsLoaded) => Some(12.0),
        (Dialect::Current, EventKind::PhaseStarted(1)) => Some(15.0),
        (Dialect::Current, EventKind::PhaseComplete(1)) => Some(30.0),
        (Dialect::Current, EventKind::PhaseStarted(2)) => Some(GENERATION_WINDOW.0),
        (Dialect::Current, EventKind::PhaseComplete(2)) => Some(GENERATION_WINDOW.1),
        (Dialect::Current, EventKind::PhaseStarted(3)) => Some(88.0),
        (Dialect::Current, EventKind::PhaseComplete(3)) => Some(97.0),
        (_, EventKind::ConvergenceReached) => Some(95.0),
        (_, EventKind::Completed) => Some(100.0),
        (Dialect::Legacy, EventKind::PhaseStarted(LEGACY_ITERATION_PHASE)) => Some(55.0),
        (Dialect::Legacy, EventKind::PhaseComplete(LEGACY_ITERATION_PHASE)) => Some(65.0),
        (Dialect::Legacy, EventKind::PhaseStarted(p)) if (4..=7).contains(&p) => {
            Some(f64::from(p) * 10.0 + 10.0)
        }
        (Dialect::Legacy, EventKind::PhaseComplete(p)) if (4..=7).contains(&p) => {
            Some(f64::from(p) * 10.0 + 20.0)
        }
        _ => None,
    }
}

/// Compute the session's next progress value for one event.
///
/// `current` is the session's progress before the event; the return value is
/// never less than it. Heartbeats, match telemetry, and unknown kinds never
/// move progress.
#[must_use]
pub fn estimate(dialect: Dialect, kind: EventKind, payload: &Value, current: f64) -> f64 {
    let candidate = match kind {
        EventKind::Heartbeat | EventKind::MatchEvent | EventKind::Unknown => None,
        EventKind::Completed => Some(100.0),
        EventKind::GenerationProgress => {
            let fraction = payload_fraction(payload).unwrap_or(0.0);
            let (lo, hi) = GENERATION_WINDOW;
            Some(lo + fraction * (hi - lo))
        }
        _ => payload_fraction(payload)
            .map(|f| f * 100.0)
            .or_else(|| milestone(dialect, kind)),
    };

    match candidate {
        Some(value) => value.clamp(current, 100.0),
        None => current,
    }
}

/// Explicit progress fraction from the payload, clamped to 0–1.
fn payload_fraction(payload: &Value) -> Option<f64> {
    payload
        .get("progress")
        .and_then(Value::as_f64)
        .map(|f| f.clamp(0.0, 1.0))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
