//! Per-conversation turn serialization and agent status
//!
//! Turns on the same conversation run one at a time; turns on different
//! conversations run concurrently. The gate hands out one async mutex per
//! conversation id and forgets it once no turn holds it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::metrics::TURNS_IN_FLIGHT;

/// Hands out exclusive access to one conversation at a time
#[derive(Default)]
pub struct SessionGate {
    locks: Mutex<HashMap<String, Weak<AsyncMutex<()>>>>,
}

impl SessionGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `conversation_id`
    pub async fn acquire(&self, conversation_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            // Drop entries no turn is holding any more
            locks.retain(|_, weak| weak.strong_count() > 0);
            match locks.get(conversation_id).and_then(Weak::upgrade) {
                Some(lock) => lock,
                None => {
                    let lock = Arc::new(AsyncMutex::new(()));
                    locks.insert(conversation_id.to_string(), Arc::downgrade(&lock));
                    lock
                }
            }
        };
        lock.lock_owned().await
    }

    /// Conversations currently locked or awaited
    pub fn active(&self) -> usize {
        let locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.values().filter(|w| w.strong_count() > 0).count()
    }
}

/// Coarse state for the panel indicator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Ready,
    Processing,
    /// The last model call failed after its retry
    Unavailable,
}

impl AgentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentStatus::Ready => "ready",
            AgentStatus::Processing => "processing",
            AgentStatus::Unavailable => "unavailable",
        }
    }
}

/// Lock-free status bookkeeping shared by every turn
#[derive(Default)]
pub struct StatusTracker {
    in_flight: AtomicUsize,
    unavailable: AtomicBool,
}

impl StatusTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a turn as running until the guard drops
    pub fn begin_turn(self: &Arc<Self>) -> TurnGuard {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        TURNS_IN_FLIGHT.inc();
        TurnGuard {
            tracker: Arc::clone(self),
        }
    }

    pub fn mark_unavailable(&self) {
        self.unavailable.store(true, Ordering::SeqCst);
    }

    pub fn mark_available(&self) {
        self.unavailable.store(false, Ordering::SeqCst);
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Processing wins over unavailable: a running turn may still recover
    pub fn status(&self) -> AgentStatus {
        if self.in_flight() > 0 {
            AgentStatus::Processing
        } else if self.unavailable.load(Ordering::SeqCst) {
            AgentStatus::Unavailable
        } else {
            AgentStatus::Ready
        }
    }
}

pub struct TurnGuard {
    tracker: Arc<StatusTracker>,
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        self.tracker.in_flight.fetch_sub(1, Ordering::SeqCst);
        TURNS_IN_FLIGHT.dec();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_status_transitions() {
        let tracker = Arc::new(StatusTracker::new());
        assert_eq!(tracker.status(), AgentStatus::Ready);

        let guard = tracker.begin_turn();
        assert_eq!(tracker.status(), AgentStatus::Processing);
        tracker.mark_unavailable();
        assert_eq!(tracker.status(), AgentStatus::Processing);
        drop(guard);

        assert_eq!(tracker.status(), AgentStatus::Unavailable);
        tracker.mark_available();
        assert_eq!(tracker.status(), AgentStatus::Ready);
        assert_eq!(serde_json::to_value(AgentStatus::Processing).unwrap(), "processing");
    }

    #[tokio::test]
    async fn test_same_conversation_serialized() {
        let gate = Arc::new(SessionGate::new());
        let first = gate.acquire("c1").await;

        let g = gate.clone();
        let waiter = tokio::spawn(async move {
            let _second = g.acquire("c1").await;
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(first);
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_different_conversations_concurrent() {
        let gate = SessionGate::new();
        let _a = gate.acquire("a").await;
        let b = tokio::time::timeout(Duration::from_millis(100), gate.acquire("b")).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_released_locks_are_forgotten() {
        let gate = SessionGate::new();
        drop(gate.acquire("a").await);
        drop(gate.acquire("b").await);
        assert_eq!(gate.active(), 0);
    }
}
