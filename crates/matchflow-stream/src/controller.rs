//! Session controller — the public monitoring surface.
//!
//! One controller owns at most one live read loop. `start()` tears down any
//! prior reader before opening a new one, so two writers can never race on
//! the same session record. The read loop is the only mutator; observers
//! get consistent snapshots via [`SessionController::snapshot`] or the
//! watch channel.
//!
//! Cancellation is cooperative: the loop checks its token before every
//! frame (`biased` select), so a cancelled reader stops mutating even if
//! the transport still has chunks queued.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use matchflow_core::{Session, SessionStatus};

use crate::dispatch::apply_frame;
use crate::sse::FrameStreamError;
use crate::transport::{MonitorConfig, MonitorError, SimulationRequest, StreamTransport};

/// Public-facing monitor API for one simulation session at a time.
pub struct SessionController {
    /// Transport shared across runs.
    transport: Arc<StreamTransport>,
    /// The authoritative session record.
    state: Arc<RwLock<Session>>,
    /// Push-style snapshots for observers.
    watch_tx: watch::Sender<Session>,
    /// Cancellation token of the live read loop, if any.
    cancel: Option<CancellationToken>,
    /// Handle of the spawned read loop, kept for teardown.
    task: Option<JoinHandle<()>>,
}

impl SessionController {
    /// Create a controller for the given backend.
    #[must_use]
    pub fn new(config: MonitorConfig) -> Self {
        Self::with_transport(StreamTransport::new(config))
    }

    /// Create a controller around an existing transport.
    #[must_use]
    pub fn with_transport(transport: StreamTransport) -> Self {
        let initial = Session::new("", "");
        let (watch_tx, _) = watch::channel(initial.clone());
        Self {
            transport: Arc::new(transport),
            state: Arc::new(RwLock::new(initial)),
            watch_tx,
            cancel: None,
            task: None,
        }
    }

    /// Start monitoring a new simulation run.
    ///
    /// Any live session is torn down first; its reader stops before the
    /// fresh session record is installed. Must be called within a Tokio
    /// runtime.
    pub fn start(&mut self, home_team: &str, away_team: &str) {
        self.teardown_reader();

        let mut session = Session::new(home_team, away_team);
        session.status = SessionStatus::Connecting;
        session.started_at = Some(Utc::now());

        info!(session_id = %session.id, home = home_team, away = away_team, "starting session");
        self.publish(session);

        let token = CancellationToken::new();
        self.cancel = Some(token.clone());

        let transport = Arc::clone(&self.transport);
        let state = Arc::clone(&self.state);
        let watch_tx = self.watch_tx.clone();
        let request = SimulationRequest {
            home_team: home_team.to_string(),
            away_team: away_team.to_string(),
        };

        self.task = Some(tokio::spawn(async move {
            read_loop(&transport, &request, &state, &watch_tx, &token).await;
        }));
    }

    /// Cancel the live session, if any.
    ///
    /// Not an error: the session returns to `Idle` and keeps its last-known
    /// scenarios and convergence history for inspection. No further
    /// mutation happens after this call.
    pub fn cancel(&mut self) {
        self.teardown_reader();
        let mut guard = self.state.write();
        if guard.is_live() {
            debug!(session_id = %guard.id, "session cancelled");
            guard.status = SessionStatus::Idle;
            let snapshot = guard.clone();
            drop(guard);
            let _ = self.watch_tx.send_replace(snapshot);
        }
    }

    /// Time since the current session was started.
    ///
    /// `None` until `start()` has been called at least once.
    #[must_use]
    pub fn elapsed(&self) -> Option<chrono::Duration> {
        self.state.read().elapsed()
    }

    /// Consistent copy of the current session state.
    #[must_use]
    pub fn snapshot(&self) -> Session {
        self.state.read().clone()
    }

    /// Subscribe to session snapshots, one per applied frame.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<Session> {
        self.watch_tx.subscribe()
    }

    /// Cancel the live reader without touching session status.
    fn teardown_reader(&mut self) {
        if let Some(token) = self.cancel.take() {
            token.cancel();
        }
        if let Some(task) = self.task.take() {
            // Cooperative: the loop exits on its next iteration
            drop(task);
        }
    }

    /// Install a fresh session record and notify observers.
    ///
    /// `send_replace` so the stored watch value tracks the session even
    /// while no receiver is subscribed.
    fn publish(&self, session: Session) {
        *self.state.write() = session.clone();
        let _ = self.watch_tx.send_replace(session);
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.teardown_reader();
    }
}

/// The single read loop of a session: open the transport, pull frames,
/// reduce them into the session record, and surface terminal conditions.
async fn read_loop(
    transport: &StreamTransport,
    request: &SimulationRequest,
    state: &Arc<RwLock<Session>>,
    watch_tx: &watch::Sender<Session>,
    token: &CancellationToken,
) {
    let open = tokio::select! {
        biased;
        () = token.cancelled() => return,
        result = transport.open(request) => result,
    };

    let mut frames = match open {
        Ok(stream) => stream,
        Err(e) => {
            warn!(error = %e, category = e.category(), "transport open failed");
            terminal_error(state, watch_tx, token, &e.to_string());
            return;
        }
    };

    loop {
        // biased: prefer cancellation when both a frame and cancel are ready
        let item = tokio::select! {
            biased;
            () = token.cancelled() => return,
            item = frames.next() => item,
        };

        match item {
            Some(Ok(frame)) => {
                let snapshot = {
                    let mut guard = state.write();
                    // A frame pulled before cancellation must not touch the
                    // record a restart may have installed in the meantime
                    if token.is_cancelled() {
                        return;
                    }
                    // First bytes arrived: connecting → streaming
                    if guard.status == SessionStatus::Connecting {
                        guard.status = SessionStatus::Streaming;
                    }
                    apply_frame(&mut guard, &frame);
                    guard.clone()
                };
                let terminal = snapshot.is_terminal();
                let _ = watch_tx.send_replace(snapshot);
                if terminal {
                    // Dropping the frame stream closes the transport
                    return;
                }
            }
            Some(Err(FrameStreamError::Parse(parse_error))) => {
                let snapshot = {
                    let mut guard = state.write();
                    if token.is_cancelled() {
                        return;
                    }
                    guard.parse_errors += 1;
                    guard.clone()
                };
                debug!(error = %parse_error, "recovered from frame parse error");
                let _ = watch_tx.send_replace(snapshot);
            }
            Some(Err(read_error @ FrameStreamError::Read(_))) => {
                warn!(error = %read_error, "event stream read failed");
                terminal_error(state, watch_tx, token, &read_error.to_string());
                return;
            }
            None => {
                if !state.read().is_terminal() {
                    warn!("event stream ended without a terminal frame");
                    terminal_error(
                        state,
                        watch_tx,
                        token,
                        &MonitorError::UnexpectedClose.to_string(),
                    );
                }
                return;
            }
        }
    }
}

/// Flip the session into its terminal error state, once.
///
/// No-op if the session is already terminal or the reader was cancelled
/// (the token check runs under the write lock, so a restart that cancelled
/// this reader can never see its error).
fn terminal_error(
    state: &Arc<RwLock<Session>>,
    watch_tx: &watch::Sender<Session>,
    token: &CancellationToken,
    message: &str,
) {
    let snapshot = {
        let mut guard = state.write();
        if token.is_cancelled() || guard.is_terminal() {
            return;
        }
        guard.error = Some(message.to_string());
        guard.status = SessionStatus::Error;
        guard.clone()
    };
    let _ = watch_tx.send_replace(snapshot);
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
