//! Progress event reporting
//!
//! Translates phase transitions into an ordered, append-only event
//! stream per session, consumed by the hub's progress UI. Events are
//! retained so a late subscriber always sees at least the current
//! phase; removing a session drops its stream, so no stale event can be
//! delivered afterwards.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, RwLock};
use tracing::info;

use crate::session::{Phase, StopReason};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// One progress event as the hub sees it
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub phase: Phase,
    pub message: String,
    /// Coarse 0-100 progress for the UI bar
    pub progress_pct: u8,
    /// Set on Stopping/Stopped events
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
    /// Set on Failed events; stable reason string from the error taxonomy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn phase(phase: Phase, message: impl Into<String>) -> Self {
        Self {
            phase,
            message: message.into(),
            progress_pct: phase_progress(phase),
            stop_reason: None,
            failure_reason: None,
            timestamp: Utc::now(),
        }
    }

    pub fn stopping(phase: Phase, reason: StopReason, message: impl Into<String>) -> Self {
        Self {
            stop_reason: Some(reason),
            ..Self::phase(phase, message)
        }
    }

    pub fn failed(reason: &str, message: impl Into<String>) -> Self {
        Self {
            failure_reason: Some(reason.to_string()),
            ..Self::phase(Phase::Failed, message)
        }
    }
}

const fn phase_progress(phase: Phase) -> u8 {
    match phase {
        Phase::Idle => 0,
        Phase::Pending => 10,
        Phase::Starting | Phase::Stopping => 50,
        Phase::Running | Phase::Stopped | Phase::Failed => 100,
    }
}

struct SessionChannel {
    history: Vec<ProgressEvent>,
    tx: broadcast::Sender<ProgressEvent>,
}

/// Per-session event fan-out with history replay
pub struct EventReporter {
    channels: RwLock<HashMap<String, SessionChannel>>,
}

impl EventReporter {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Create the stream for a session if it does not exist yet
    pub async fn ensure(&self, username: &str) {
        let mut channels = self.channels.write().await;
        channels.entry(username.to_string()).or_insert_with(|| {
            let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
            SessionChannel {
                history: Vec::new(),
                tx,
            }
        });
    }

    /// Append an event; never drops it even with no subscriber attached
    pub async fn emit(&self, username: &str, event: ProgressEvent) {
        info!(
            user = %username,
            phase = %event.phase,
            progress = event.progress_pct,
            message = %event.message,
            "Session progress"
        );
        let mut channels = self.channels.write().await;
        let channel = channels.entry(username.to_string()).or_insert_with(|| {
            let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
            SessionChannel {
                history: Vec::new(),
                tx,
            }
        });
        channel.history.push(event.clone());
        // Send only fails with no receivers; history covers replay
        let _ = channel.tx.send(event);
    }

    /// Subscribe to a session's events, replaying retained history first
    pub async fn subscribe(&self, username: &str) -> Option<EventStream> {
        let channels = self.channels.read().await;
        channels.get(username).map(|channel| EventStream {
            replay: channel.history.clone().into(),
            rx: channel.tx.subscribe(),
        })
    }

    /// Drop a session's stream; subscribers see end-of-stream
    pub async fn remove(&self, username: &str) {
        self.channels.write().await.remove(username);
    }

    /// Start a fresh stream, dropping any history from a prior attempt
    pub async fn reset(&self, username: &str) {
        let mut channels = self.channels.write().await;
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        channels.insert(
            username.to_string(),
            SessionChannel {
                history: Vec::new(),
                tx,
            },
        );
    }
}

impl Default for EventReporter {
    fn default() -> Self {
        Self::new()
    }
}

/// Ordered event stream for one session: history, then live events
#[derive(Debug)]
pub struct EventStream {
    replay: VecDeque<ProgressEvent>,
    rx: broadcast::Receiver<ProgressEvent>,
}

impl EventStream {
    /// Next event, or `None` once the session is removed
    pub async fn next(&mut self) -> Option<ProgressEvent> {
        if let Some(event) = self.replay.pop_front() {
            return Some(event);
        }
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Closed) => return None,
                // A slow consumer skips ahead rather than wedging
                Err(broadcast::error::RecvError::Lagged(_)) => {}
            }
        }
    }

    /// Drain until the stream yields a terminal phase or ends
    pub async fn wait_terminal(&mut self) -> Option<ProgressEvent> {
        while let Some(event) = self.next().await {
            if event.phase.is_terminal() || event.phase == Phase::Running {
                return Some(event);
            }
        }
        None
    }
}
