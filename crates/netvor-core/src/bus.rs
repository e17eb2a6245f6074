//! Status bus
//!
//! Carries two streams from the session to whoever is watching it:
//!
//! - **status**: a single latest [`SessionStatus`], replaced on every update
//! - **logs**: ordered log lines, with the most recent ones replayed to new
//!   subscribers
//!
//! Publishing never blocks. A subscriber that falls behind on logs loses
//! lines instead of holding up the session.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, watch};

/// Lines kept in the history ring
pub const LOG_HISTORY: usize = 2000;

/// Lines replayed to a new log subscriber
pub const LOG_REPLAY: usize = 100;

/// Live log channel capacity per subscriber
const LOG_CHANNEL_CAPACITY: usize = 256;

/// Snapshot of the session as seen by front ends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionStatus {
    pub connected: bool,
    /// Unix millis when the session came up, 0 when disconnected
    pub start_time_ms: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

impl SessionStatus {
    /// The idle value
    pub const DISCONNECTED: SessionStatus = SessionStatus {
        connected: false,
        start_time_ms: 0,
        rx_bytes: 0,
        tx_bytes: 0,
    };

    /// Freshly connected, no traffic yet
    pub fn connected_at(start_time_ms: u64) -> Self {
        Self {
            connected: true,
            start_time_ms,
            rx_bytes: 0,
            tx_bytes: 0,
        }
    }

    /// Same session, new byte counts
    pub fn with_traffic(self, rx_bytes: u64, tx_bytes: u64) -> Self {
        Self {
            rx_bytes,
            tx_bytes,
            ..self
        }
    }
}

struct Inner {
    status: watch::Sender<SessionStatus>,
    logs: broadcast::Sender<String>,
    history: Mutex<VecDeque<String>>,
}

/// Cloneable handle to the status and log channels
#[derive(Clone)]
pub struct StatusBus {
    inner: Arc<Inner>,
}

impl StatusBus {
    pub fn new() -> Self {
        let (status, _) = watch::channel(SessionStatus::DISCONNECTED);
        let (logs, _) = broadcast::channel(LOG_CHANNEL_CAPACITY);

        Self {
            inner: Arc::new(Inner {
                status,
                logs,
                history: Mutex::new(VecDeque::with_capacity(LOG_HISTORY)),
            }),
        }
    }

    /// Replace the current status
    pub fn publish_status(&self, status: SessionStatus) {
        self.inner.status.send_replace(status);
    }

    /// Current status
    pub fn status(&self) -> SessionStatus {
        *self.inner.status.borrow()
    }

    /// Watch status changes; the receiver starts at the current value
    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.inner.status.subscribe()
    }

    /// Append a log line
    pub fn emit_log(&self, line: impl Into<String>) {
        let line = line.into();
        let mut history = self.history();

        if history.len() == LOG_HISTORY {
            history.pop_front();
        }
        history.push_back(line.clone());

        // Sent under the history lock so replay and live lines never overlap.
        // No receivers is not an error.
        let _ = self.inner.logs.send(line);
    }

    /// Subscribe to logs, starting with the last [`LOG_REPLAY`] lines
    pub fn subscribe_logs(&self) -> LogSubscription {
        let history = self.history();
        let replay = history
            .iter()
            .skip(history.len().saturating_sub(LOG_REPLAY))
            .cloned()
            .collect();
        let receiver = self.inner.logs.subscribe();

        LogSubscription { replay, receiver }
    }

    /// Last `limit` retained lines, oldest first
    pub fn recent_logs(&self, limit: usize) -> Vec<String> {
        let history = self.history();
        history
            .iter()
            .skip(history.len().saturating_sub(limit))
            .cloned()
            .collect()
    }

    fn history(&self) -> MutexGuard<'_, VecDeque<String>> {
        self.inner
            .history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for StatusBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Log stream for one subscriber
pub struct LogSubscription {
    replay: VecDeque<String>,
    receiver: broadcast::Receiver<String>,
}

impl LogSubscription {
    /// Next line: replayed history first, then live lines.
    ///
    /// Returns `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<String> {
        if let Some(line) = self.replay.pop_front() {
            return Some(line);
        }

        loop {
            match self.receiver.recv().await {
                Ok(line) => return Some(line),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Lines still waiting in the replay buffer
    pub fn pending_replay(&self) -> usize {
        self.replay.len()
    }
}
