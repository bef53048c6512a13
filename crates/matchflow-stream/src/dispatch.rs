//! Event dispatcher.
//!
//! [`apply_frame`] is a pure synchronous reducer: given the session record
//! and one parsed frame, it applies the per-event-kind rules and the
//! progress policy. Frames are delivered in arrival order by the read loop,
//! so no locking is needed beyond the loop's own serialization.
//!
//! Once a session is terminal the reducer refuses all further mutation,
//! which makes duplicate terminal frames (and anything a stale reader might
//! still deliver) no-ops.

use serde_json::Value;
use tracing::{debug, warn};

use matchflow_core::{
    classify, phase_title, Dialect, EventKind, Frame, MatchMoment, MatchResult, PhaseStatus,
    PhaseTimelineEntry, Scenario, ScenarioStatus, Session, SessionStatus,
};

use crate::progress;

/// Apply one frame to the session.
///
/// Heartbeats update the keep-alive timestamp only; they are never logged
/// and never touch progress. Everything else lands in `event_log` before
/// its kind-specific rule runs.
pub fn apply_frame(session: &mut Session, frame: &Frame) {
    if session.is_terminal() {
        debug!(event_type = %frame.event_type, "ignoring frame after terminal state");
        return;
    }

    let (dialect, kind) = classify(&frame.event_type, &frame.payload);

    if kind == EventKind::Heartbeat {
        session.last_heartbeat_at = Some(frame.received_at);
        return;
    }

    session.event_log.push(frame.clone());

    match kind {
        EventKind::Started => {
            session.status = SessionStatus::Streaming;
        }
        EventKind::LoadingTeams | EventKind::TeamsLoaded | EventKind::GenerationProgress => {
            // Progress-only events
        }
        EventKind::PhaseStarted(phase) => {
            session.current_phase = phase;
            start_phase(session, dialect, phase, frame);
        }
        EventKind::PhaseComplete(phase) => {
            complete_phase(session, dialect, phase, frame);
            if let Some(list) = frame.payload.get("scenarios").and_then(Value::as_array) {
                session.scenarios = merge_scenarios(&session.scenarios, parse_scenarios(list));
            }
            if let Some(runs) = frame.payload.get("total_runs").and_then(Value::as_u64) {
                session.total_simulations += runs;
            }
        }
        EventKind::ConvergenceCheck => {
            record_convergence(session, &frame.payload, ScenarioStatus::Validating);
        }
        EventKind::ConvergenceReached => {
            record_convergence(session, &frame.payload, ScenarioStatus::Converged);
            session.converged = true;
        }
        EventKind::MatchEvent => {
            session.match_timeline.push(MatchMoment {
                minute: frame
                    .payload
                    .get("minute")
                    .and_then(Value::as_u64)
                    .and_then(|m| u32::try_from(m).ok()),
                kind: frame
                    .payload
                    .get("kind")
                    .and_then(Value::as_str)
                    .map(String::from),
                description: frame
                    .payload
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                timestamp: frame.received_at,
            });
        }
        EventKind::Completed => {
            complete_session(session, frame);
        }
        EventKind::Error => {
            session.error = Some(error_message(&frame.payload));
            session.status = SessionStatus::Error;
        }
        // Heartbeats returned early
        EventKind::Heartbeat => {}
        EventKind::Unknown => {
            debug!(event_type = %frame.event_type, "unrecognized pipeline event");
        }
    }

    session.progress_percent =
        progress::estimate(dialect, kind, &frame.payload, session.progress_percent);
}

/// Append an `Active` timeline entry for a phase, once per (dialect, phase).
fn start_phase(session: &mut Session, dialect: Dialect, phase: u8, frame: &Frame) {
    let exists = session
        .phase_timeline
        .iter()
        .any(|e| e.dialect == dialect && e.phase == phase);
    if exists {
        return;
    }
    session.phase_timeline.push(PhaseTimelineEntry {
        dialect,
        phase,
        title: frame
            .payload
            .get("title")
            .and_then(Value::as_str)
            .unwrap_or(phase_title(dialect, phase))
            .to_string(),
        status: PhaseStatus::Active,
        timestamp: frame.received_at,
    });
}

/// Flip the matching timeline entry to `Completed` (never the reverse),
/// inserting one if the start event was missed.
fn complete_phase(session: &mut Session, dialect: Dialect, phase: u8, frame: &Frame) {
    if let Some(entry) = session
        .phase_timeline
        .iter_mut()
        .find(|e| e.dialect == dialect && e.phase == phase)
    {
        entry.status = PhaseStatus::Completed;
    } else {
        session.phase_timeline.push(PhaseTimelineEntry {
            dialect,
            phase,
            title: phase_title(dialect, phase).to_string(),
            status: PhaseStatus::Completed,
            timestamp: frame.received_at,
        });
    }
}

/// Append a convergence point and update the confidence bookkeeping.
fn record_convergence(session: &mut Session, payload: &Value, scenario_status: ScenarioStatus) {
    let iteration = payload
        .get("iteration")
        .and_then(Value::as_u64)
        .unwrap_or(session.convergence_history.len() as u64 + 1);
    if let Some(confidence) = payload.get("confidence").and_then(Value::as_f64) {
        session
            .convergence_history
            .push(matchflow_core::ConvergencePoint {
                iteration,
                confidence,
            });
        session.confidence = Some(confidence);
    }
    if let Some(threshold) = payload.get("threshold").and_then(Value::as_f64) {
        session.convergence_threshold = Some(threshold);
    }
    if let Some(converged) = payload.get("converged").and_then(Value::as_bool) {
        session.converged = converged;
    }
    if let Some(id) = payload.get("scenario_id").and_then(Value::as_str) {
        let runs = payload.get("runs").and_then(Value::as_u64).unwrap_or(0);
        if let Some(scenario) = session.scenario_mut(id) {
            upgrade_status(scenario, scenario_status);
            scenario.validation_runs += runs;
        }
    }
}

/// Terminal success: set the result exactly once and freeze the session.
fn complete_session(session: &mut Session, frame: &Frame) {
    let result: MatchResult = match serde_json::from_value(frame.payload.clone()) {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "completed payload did not fully decode; keeping defaults");
            MatchResult::default()
        }
    };
    if !result.scenarios.is_empty() {
        session.scenarios = merge_scenarios(&session.scenarios, result.scenarios.clone());
    }
    for scenario in &mut session.scenarios {
        upgrade_status(scenario, ScenarioStatus::Final);
    }
    for entry in &mut session.phase_timeline {
        entry.status = PhaseStatus::Completed;
    }
    session.result = Some(result);
    session.status = SessionStatus::Completed;
}

/// Forward-only scenario status transition.
fn upgrade_status(scenario: &mut Scenario, status: ScenarioStatus) {
    if status.rank() > scenario.status.rank() {
        scenario.status = status;
    }
}

/// Error message from an `error` payload: `error`, then `message`, then a
/// generic fallback.
fn error_message(payload: &Value) -> String {
    payload
        .get("error")
        .or_else(|| payload.get("message"))
        .and_then(Value::as_str)
        .unwrap_or("simulation failed")
        .to_string()
}

/// Adopt an incoming scenario list, keeping per-scenario history.
///
/// Order and membership come from the incoming list. Scenarios already
/// known keep their accumulated validation runs, and status transitions
/// stay forward-only.
fn merge_scenarios(existing: &[Scenario], incoming: Vec<Scenario>) -> Vec<Scenario> {
    incoming
        .into_iter()
        .map(|mut scenario| {
            if let Some(prev) = existing.iter().find(|s| s.id == scenario.id) {
                if prev.status.rank() > scenario.status.rank() {
                    scenario.status = prev.status;
                }
                scenario.validation_runs = scenario.validation_runs.max(prev.validation_runs);
            }
            scenario
        })
        .collect()
}

/// Parse a backend scenario list, preserving declared order.
fn parse_scenarios(list: &[Value]) -> Vec<Scenario> {
    list.iter()
        .enumerate()
        .map(|(idx, v)| Scenario {
            id: v
                .get("id")
                .and_then(Value::as_str)
                .map_or_else(|| format!("scenario-{}", idx + 1), String::from),
            name: v
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            probability: v.get("probability").and_then(Value::as_f64).unwrap_or(0.0),
            status: ScenarioStatus::Generated,
            validation_runs: 0,
        })
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn session() -> Session {
        let mut s = Session::new("Arsenal", "Chelsea");
        s.status = SessionStatus::Streaming;
        s
    }

    fn frame(event_type: &str, payload: Value) -> Frame {
        Frame::new(event_type, payload)
    }

    fn apply(session: &mut Session, event_type: &str, payload: Value) {
        apply_frame(session, &frame(event_type, payload));
    }

    // ── heartbeat transparency ──────────────────────────────────────────

    #[test]
    fn heartbeat_updates_keepalive_only() {
        let mut s = session();
        apply(&mut s, "started", json!({}));
        let progress = s.progress_percent;
        let log_len = s.event_log.len();

        for _ in 0..5 {
            apply(&mut s, "heartbeat", json!({}));
        }
        assert!(s.last_heartbeat_at.is_some());
        assert_eq!(s.progress_percent, progress);
        assert_eq!(s.event_log.len(), log_len);
        assert!(s.scenarios.is_empty());
    }

    // ── phase lifecycle ─────────────────────────────────────────────────

    #[test]
    fn phase_started_sets_current_phase_and_timeline() {
        let mut s = session();
        apply(&mut s, "phase2_started", json!({}));
        assert_eq!(s.current_phase, 2);
        assert_eq!(s.phase_timeline.len(), 1);
        assert_eq!(s.phase_timeline[0].status, PhaseStatus::Active);
        assert_eq!(s.phase_timeline[0].title, "Generating scenarios");
    }

    #[test]
    fn phase_complete_flips_timeline_entry() {
        let mut s = session();
        apply(&mut s, "phase2_started", json!({}));
        apply(&mut s, "phase2_complete", json!({}));
        assert_eq!(s.phase_timeline.len(), 1);
        assert_eq!(s.phase_timeline[0].status, PhaseStatus::Completed);
    }

    #[test]
    fn phase_complete_without_start_inserts_completed_entry() {
        let mut s = session();
        apply(&mut s, "phase1_complete", json!({}));
        assert_eq!(s.phase_timeline.len(), 1);
        assert_eq!(s.phase_timeline[0].status, PhaseStatus::Completed);
    }

    #[test]
    fn duplicate_phase_started_does_not_duplicate_timeline() {
        let mut s = session();
        apply(&mut s, "phase1_started", json!({}));
        apply(&mut s, "phase1_started", json!({}));
        assert_eq!(s.phase_timeline.len(), 1);
    }

    #[test]
    fn payload_title_overrides_builtin() {
        let mut s = session();
        apply(&mut s, "phase1_started", json!({"title": "Crunching the numbers"}));
        assert_eq!(s.phase_timeline[0].title, "Crunching the numbers");
    }

    // ── stage-vs-outer normalization ────────────────────────────────────

    #[test]
    fn inner_stage_field_drives_dispatch() {
        let mut s = session();
        apply(&mut s, "info", json!({"stage": "phase3_started"}));
        assert_eq!(s.current_phase, 3);
    }

    // ── scenarios ───────────────────────────────────────────────────────

    #[test]
    fn phase_complete_populates_scenarios_in_order() {
        let mut s = session();
        apply(
            &mut s,
            "phase2_complete",
            json!({"scenarios": [
                {"id": "s1", "name": "Early goal", "probability": 0.4},
                {"id": "s2", "name": "Defensive stalemate", "probability": 0.35},
                {"id": "s3", "name": "Late comeback", "probability": 0.25},
            ]}),
        );
        assert_eq!(s.scenarios.len(), 3);
        assert_eq!(
            s.scenarios.iter().map(|sc| sc.id.as_str()).collect::<Vec<_>>(),
            ["s1", "s2", "s3"]
        );
        assert!(s.scenarios.iter().all(|sc| sc.status == ScenarioStatus::Generated));
    }

    #[test]
    fn scenario_list_replacement_preserves_new_order() {
        let mut s = session();
        apply(&mut s, "phase2_complete", json!({"scenarios": [{"id": "a"}, {"id": "b"}]}));
        apply(&mut s, "phase3_complete", json!({"scenarios": [{"id": "b"}, {"id": "c"}]}));
        assert_eq!(
            s.scenarios.iter().map(|sc| sc.id.as_str()).collect::<Vec<_>>(),
            ["b", "c"]
        );
    }

    #[test]
    fn scenario_without_id_gets_positional_one() {
        let mut s = session();
        apply(&mut s, "phase2_complete", json!({"scenarios": [{"name": "Unnamed"}]}));
        assert_eq!(s.scenarios[0].id, "scenario-1");
    }

    #[test]
    fn scenario_replacement_keeps_forward_status() {
        let mut s = session();
        apply(&mut s, "phase2_complete", json!({"scenarios": [{"id": "s1"}, {"id": "s2"}]}));
        apply(
            &mut s,
            "convergence_reached",
            json!({"confidence": 0.96, "scenario_id": "s1", "runs": 800}),
        );
        // A later list for the same scenarios must not demote s1
        apply(
            &mut s,
            "phase3_complete",
            json!({"scenarios": [
                {"id": "s1", "probability": 0.7},
                {"id": "s2", "probability": 0.3},
            ]}),
        );
        assert_eq!(s.scenarios[0].status, ScenarioStatus::Converged);
        assert_eq!(s.scenarios[0].validation_runs, 800);
        assert_eq!(s.scenarios[0].probability, 0.7);
        assert_eq!(s.scenarios[1].status, ScenarioStatus::Generated);
    }

    #[test]
    fn completed_scenario_list_retains_validation_runs() {
        let mut s = session();
        apply(&mut s, "phase2_complete", json!({"scenarios": [{"id": "s1"}]}));
        apply(
            &mut s,
            "convergence_check",
            json!({"confidence": 0.8, "scenario_id": "s1", "runs": 500}),
        );
        apply(&mut s, "completed", json!({"scenarios": [{"id": "s1", "probability": 0.9}]}));
        assert_eq!(s.scenarios[0].status, ScenarioStatus::Final);
        assert_eq!(s.scenarios[0].validation_runs, 500);
    }

    #[test]
    fn total_runs_accumulate_across_phases() {
        let mut s = session();
        apply(&mut s, "phase2_complete", json!({"total_runs": 2000}));
        apply(&mut s, "phase3_complete", json!({"total_runs": 10000}));
        assert_eq!(s.total_simulations, 12000);
    }

    // ── convergence ─────────────────────────────────────────────────────

    #[test]
    fn convergence_check_appends_history() {
        let mut s = session();
        apply(&mut s, "convergence_check", json!({"iteration": 1, "confidence": 0.72, "threshold": 0.95}));
        apply(&mut s, "convergence_check", json!({"iteration": 2, "confidence": 0.81}));
        assert_eq!(s.convergence_history.len(), 2);
        assert_eq!(s.convergence_history[1].iteration, 2);
        assert_eq!(s.confidence, Some(0.81));
        assert_eq!(s.convergence_threshold, Some(0.95));
        assert!(!s.converged);
    }

    #[test]
    fn convergence_reached_marks_converged() {
        let mut s = session();
        apply(&mut s, "convergence_reached", json!({"iteration": 7, "confidence": 0.96}));
        assert!(s.converged);
        assert_eq!(s.confidence, Some(0.96));
    }

    #[test]
    fn convergence_check_upgrades_named_scenario() {
        let mut s = session();
        apply(&mut s, "phase2_complete", json!({"scenarios": [{"id": "s1"}]}));
        apply(
            &mut s,
            "convergence_check",
            json!({"confidence": 0.5, "scenario_id": "s1", "runs": 500}),
        );
        assert_eq!(s.scenarios[0].status, ScenarioStatus::Validating);
        assert_eq!(s.scenarios[0].validation_runs, 500);

        apply(&mut s, "convergence_reached", json!({"confidence": 0.97, "scenario_id": "s1"}));
        assert_eq!(s.scenarios[0].status, ScenarioStatus::Converged);
    }

    #[test]
    fn scenario_status_never_regresses() {
        let mut s = session();
        apply(&mut s, "phase2_complete", json!({"scenarios": [{"id": "s1"}]}));
        apply(&mut s, "convergence_reached", json!({"confidence": 0.96, "scenario_id": "s1"}));
        // A late validating-status check must not demote the scenario
        apply(&mut s, "convergence_check", json!({"confidence": 0.9, "scenario_id": "s1"}));
        assert_eq!(s.scenarios[0].status, ScenarioStatus::Converged);
    }

    // ── match telemetry ─────────────────────────────────────────────────

    #[test]
    fn match_event_lands_in_its_own_timeline() {
        let mut s = session();
        apply(&mut s, "phase3_started", json!({}));
        let phase = s.current_phase;
        let progress = s.progress_percent;

        apply(
            &mut s,
            "match_event",
            json!({"minute": 23, "kind": "goal", "description": "Header from the corner"}),
        );
        assert_eq!(s.match_timeline.len(), 1);
        assert_eq!(s.match_timeline[0].minute, Some(23));
        assert_eq!(s.match_timeline[0].kind.as_deref(), Some("goal"));
        assert_eq!(s.current_phase, phase);
        assert_eq!(s.progress_percent, progress);
        assert_eq!(s.phase_timeline.len(), 1);
    }

    // ── terminal transitions ────────────────────────────────────────────

    #[test]
    fn completed_sets_result_and_freezes() {
        let mut s = session();
        apply(&mut s, "phase1_started", json!({}));
        apply(
            &mut s,
            "completed",
            json!({
                "probabilities": {"home_win": 0.5, "draw": 0.25, "away_win": 0.25},
                "execution_time": 12.0
            }),
        );
        assert_eq!(s.status, SessionStatus::Completed);
        assert_eq!(s.progress_percent, 100.0);
        let result = s.result.as_ref().unwrap();
        assert_eq!(result.probabilities.home_win, 0.5);
        assert!(s.phase_timeline.iter().all(|e| e.status == PhaseStatus::Completed));
    }

    #[test]
    fn duplicate_completed_is_a_noop() {
        let mut s = session();
        apply(&mut s, "completed", json!({"probabilities": {"home_win": 0.6}}));
        let first = s.clone();
        apply(&mut s, "completed", json!({"probabilities": {"home_win": 0.1}}));
        assert_eq!(s, first);
    }

    #[test]
    fn error_after_completed_is_ignored() {
        let mut s = session();
        apply(&mut s, "completed", json!({}));
        apply(&mut s, "error", json!({"error": "too late"}));
        assert_eq!(s.status, SessionStatus::Completed);
        assert!(s.error.is_none());
    }

    #[test]
    fn error_frame_is_terminal() {
        let mut s = session();
        apply(&mut s, "error", json!({"error": "model unavailable"}));
        assert_eq!(s.status, SessionStatus::Error);
        assert_eq!(s.error.as_deref(), Some("model unavailable"));
        assert!(s.result.is_none());
    }

    #[test]
    fn error_message_falls_back_to_message_field() {
        let mut s = session();
        apply(&mut s, "error", json!({"message": "backend restarting"}));
        assert_eq!(s.error.as_deref(), Some("backend restarting"));
    }

    #[test]
    fn completed_finalizes_scenarios() {
        let mut s = session();
        apply(&mut s, "phase2_complete", json!({"scenarios": [{"id": "s1"}, {"id": "s2"}]}));
        apply(&mut s, "completed", json!({}));
        assert!(s.scenarios.iter().all(|sc| sc.status == ScenarioStatus::Final));
    }

    #[test]
    fn completed_with_scenarios_replaces_list() {
        let mut s = session();
        apply(&mut s, "phase2_complete", json!({"scenarios": [{"id": "old"}]}));
        apply(
            &mut s,
            "completed",
            json!({"scenarios": [{"id": "s1", "probability": 0.7}, {"id": "s2", "probability": 0.3}]}),
        );
        assert_eq!(s.scenarios.len(), 2);
        assert_eq!(s.scenarios[0].id, "s1");
        assert_eq!(s.scenarios[0].status, ScenarioStatus::Final);
    }

    // ── dual-protocol tolerance ─────────────────────────────────────────

    #[test]
    fn legacy_and_current_events_coexist() {
        let mut s = session();
        apply(&mut s, "phase1_started", json!({}));
        apply(&mut s, "phase1_complete", json!({"scenarios": [{"id": "s1"}]}));
        apply(&mut s, "phase6_started", json!({}));
        apply(&mut s, "iteration_started", json!({}));
        apply(&mut s, "phase2_started", json!({}));

        // Legacy events advanced the phase without touching current-dialect state
        assert_eq!(s.current_phase, 2);
        assert_eq!(s.scenarios.len(), 1);
        let dialects: Vec<Dialect> = s.phase_timeline.iter().map(|e| e.dialect).collect();
        assert!(dialects.contains(&Dialect::Legacy));
        assert!(dialects.contains(&Dialect::Current));
        // No cross-dialect entry collisions
        assert_eq!(s.phase_timeline.len(), 4);
    }

    #[test]
    fn unknown_events_are_logged_not_fatal() {
        let mut s = session();
        apply(&mut s, "phase42_reversed", json!({}));
        assert_eq!(s.event_log.len(), 1);
        assert_eq!(s.status, SessionStatus::Streaming);
    }

    // ── the reference stream ────────────────────────────────────────────

    #[test]
    fn reference_stream_end_to_end() {
        let mut s = Session::new("Arsenal", "Chelsea");
        s.status = SessionStatus::Connecting;

        apply(&mut s, "started", json!({}));
        assert_eq!(s.status, SessionStatus::Streaming);

        apply(&mut s, "phase2_started", json!({}));
        apply(
            &mut s,
            "phase2_complete",
            json!({"scenarios": [{"id": "A", "name": "A"}, {"id": "B", "name": "B"}]}),
        );
        apply(&mut s, "phase3_started", json!({}));
        apply(&mut s, "phase3_complete", json!({"total_runs": 12000}));
        apply(
            &mut s,
            "completed",
            json!({"probabilities": {"home_win": 0.5, "draw": 0.25, "away_win": 0.25}}),
        );

        assert_eq!(s.status, SessionStatus::Completed);
        assert_eq!(
            s.scenarios.iter().map(|sc| sc.id.as_str()).collect::<Vec<_>>(),
            ["A", "B"]
        );
        assert_eq!(s.total_simulations, 12000);
        assert_eq!(s.result.as_ref().unwrap().probabilities.home_win, 0.5);
        assert_eq!(s.progress_percent, 100.0);
    }

    // ── progress monotonicity across a whole stream ─────────────────────

    #[test]
    fn progress_is_monotone_over_mixed_stream() {
        let mut s = session();
        let mut last = 0.0;
        for (ty, payload) in [
            ("started", json!({})),
            ("loading_teams", json!({})),
            ("teams_loaded", json!({})),
            ("phase1_started", json!({})),
            ("heartbeat", json!({})),
            ("phase1_complete", json!({})),
            ("phase2_started", json!({})),
            ("generation_progress", json!({"progress": 0.3})),
            ("generation_progress", json!({"progress": 0.9})),
            ("phase2_complete", json!({})),
            ("phase3_started", json!({})),
            ("convergence_check", json!({"confidence": 0.8})),
            ("match_event", json!({"minute": 10})),
            ("convergence_reached", json!({"confidence": 0.96})),
            ("phase3_complete", json!({})),
            ("completed", json!({})),
        ] {
            apply(&mut s, ty, payload);
            assert!(
                s.progress_percent >= last,
                "{ty}: {} < {last}",
                s.progress_percent
            );
            last = s.progress_percent;
        }
        assert_eq!(last, 100.0);
    }
}
