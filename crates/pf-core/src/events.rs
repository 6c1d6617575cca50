//! Transcode lifecycle events.
//!
//! Every state change a session goes through is published on an [`EventBus`].
//! Live listeners subscribe to the broadcast channel; anything that attaches
//! later can read back a bounded history.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::ids::SessionId;

const DEFAULT_CHANNEL_CAPACITY: usize = 256;
const DEFAULT_HISTORY: usize = 100;

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventCategory {
    /// Progress a player follows for its own session.
    Session,
    /// Operator concerns: evictions and killed processes.
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    TranscodeQueued { session_id: SessionId, media_id: String },
    TranscodeStarted { session_id: SessionId, provider: String },
    TranscodeProgress { session_id: SessionId, percent: f64, speed: Option<f64> },
    TranscodeCompleted { session_id: SessionId },
    TranscodeFailed { session_id: SessionId, error: String },
    TranscodeCancelled { session_id: SessionId },
    ContentPublished { session_id: SessionId, content_hash: String },
    SessionEvicted { session_id: SessionId, reason: String },
    ProcessKilled { pid: i32, session_id: SessionId },
}

impl EventPayload {
    /// The session this event concerns.
    pub fn session_id(&self) -> SessionId {
        match self {
            Self::TranscodeQueued { session_id, .. }
            | Self::TranscodeStarted { session_id, .. }
            | Self::TranscodeProgress { session_id, .. }
            | Self::TranscodeCompleted { session_id }
            | Self::TranscodeFailed { session_id, .. }
            | Self::TranscodeCancelled { session_id }
            | Self::ContentPublished { session_id, .. }
            | Self::SessionEvicted { session_id, .. }
            | Self::ProcessKilled { session_id, .. } => *session_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub category: EventCategory,
    pub payload: EventPayload,
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

pub struct EventBus {
    tx: broadcast::Sender<Event>,
    history: RwLock<VecDeque<Event>>,
    history_limit: usize,
}

impl EventBus {
    /// `capacity` sizes the broadcast channel; slow subscribers that fall
    /// further behind than that see `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        Self::with_history(capacity, DEFAULT_HISTORY)
    }

    pub fn with_history(capacity: usize, history_limit: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            history: RwLock::new(VecDeque::with_capacity(history_limit)),
            history_limit,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn broadcast(&self, category: EventCategory, payload: EventPayload) {
        let event = Event {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            category,
            payload,
        };

        if self.history_limit > 0 {
            let mut history = self.history.write();
            while history.len() >= self.history_limit {
                history.pop_front();
            }
            history.push_back(event.clone());
        }

        // Err only means nobody is listening.
        let _ = self.tx.send(event);
    }

    /// Up to `n` retained events, newest first.
    pub fn recent_events(&self, n: usize) -> Vec<Event> {
        self.history.read().iter().rev().take(n).cloned().collect()
    }

    /// Retained events for one session, oldest first.
    pub fn session_events(&self, session_id: SessionId) -> Vec<Event> {
        self.history
            .read()
            .iter()
            .filter(|e| e.payload.session_id() == session_id)
            .cloned()
            .collect()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}
