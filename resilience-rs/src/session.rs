//! In-flight call tracking for progress reporting.
//!
//! Sessions are never used for correctness decisions. A [`SessionGuard`]
//! removes its session when dropped, whatever way the call ends.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::monitoring;

/// A call currently being executed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveRetrySession {
    pub call_id: Uuid,
    pub operation_id: String,
    pub started_at: DateTime<Utc>,
    pub current_attempt: u32,
}

/// Tracks in-flight calls, keyed by call id
#[derive(Debug, Default)]
pub struct SessionTracker {
    sessions: Arc<Mutex<HashMap<Uuid, ActiveRetrySession>>>,
}

impl SessionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a call; the session lives as long as the returned guard
    pub fn start(&self, call_id: Uuid, operation_id: &str) -> SessionGuard {
        let session = ActiveRetrySession {
            call_id,
            operation_id: operation_id.to_string(),
            started_at: Utc::now(),
            current_attempt: 0,
        };

        let count = {
            let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
            sessions.insert(call_id, session);
            sessions.len()
        };
        monitoring::record_active_sessions(count);

        SessionGuard {
            call_id,
            sessions: Arc::clone(&self.sessions),
        }
    }

    /// Number of calls in flight
    pub fn active_count(&self) -> usize {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Copies of the in-flight sessions
    pub fn active(&self) -> Vec<ActiveRetrySession> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}

/// Keeps a session registered until dropped
#[derive(Debug)]
pub struct SessionGuard {
    call_id: Uuid,
    sessions: Arc<Mutex<HashMap<Uuid, ActiveRetrySession>>>,
}

impl SessionGuard {
    /// Updates the attempt counter shown in progress reports
    pub fn set_attempt(&self, attempt: u32) {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(session) = sessions.get_mut(&self.call_id) {
            session.current_attempt = attempt;
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let count = {
            let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
            sessions.remove(&self.call_id);
            sessions.len()
        };
        monitoring::record_active_sessions(count);
    }
}
