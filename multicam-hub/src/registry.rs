//! Live set of panel sessions with isolated, non-blocking fan-out.
//!
//! Every session owns a bounded outbound queue drained by its writer task.
//! Pushes never wait: a full queue means the consumer is too slow, a closed
//! queue means it is gone, and either way the session is evicted instead of
//! holding up everyone else.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

/// Opaque session handle.
pub type SessionId = Uuid;

/// A pre-encoded text frame, shared by every recipient.
pub type Outbound = Arc<str>;

/// Statistics for monitoring fan-out health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Messages queued to a session
    pub messages_sent: u64,
    /// Deliveries that failed and evicted their session
    pub messages_dropped: u64,
    pub active_sessions: usize,
}

/// Outcome of one broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub evicted: Vec<SessionId>,
}

struct AtomicRegistryStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// Registry of connected sessions.
pub struct ConnectionRegistry {
    sessions: RwLock<HashMap<SessionId, mpsc::Sender<Outbound>>>,
    /// Outbound messages buffered per session
    capacity: usize,
    stats: AtomicRegistryStats,
}

impl ConnectionRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            stats: AtomicRegistryStats {
                messages_sent: AtomicU64::new(0),
                messages_dropped: AtomicU64::new(0),
            },
        }
    }

    /// Register a session and return the receiving end of its queue.
    ///
    /// Re-adding an id replaces the previous queue, which closes it.
    pub async fn add(&self, session: SessionId) -> mpsc::Receiver<Outbound> {
        let (tx, rx) = mpsc::channel(self.capacity);
        if self.sessions.write().await.insert(session, tx).is_some() {
            log::warn!("Session {session} registered twice; previous queue closed");
        }
        rx
    }

    pub async fn remove(&self, session: &SessionId) -> bool {
        self.sessions.write().await.remove(session).is_some()
    }

    /// Queue `message` for every session except `exclude`.
    pub async fn broadcast(&self, message: Outbound, exclude: Option<SessionId>) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        {
            let sessions = self.sessions.read().await;
            for (id, tx) in sessions.iter() {
                if Some(*id) == exclude {
                    continue;
                }
                match tx.try_send(message.clone()) {
                    Ok(()) => report.delivered += 1,
                    Err(e) => {
                        log_failure(id, &e);
                        report.evicted.push(*id);
                    }
                }
            }
        }

        self.stats
            .messages_sent
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        if !report.evicted.is_empty() {
            self.evict(&report.evicted).await;
        }
        report
    }

    /// Queue `message` for one session. Returns whether it was queued.
    pub async fn send_to(&self, session: &SessionId, message: Outbound) -> bool {
        let result = match self.sessions.read().await.get(session) {
            Some(tx) => tx.try_send(message),
            None => return false,
        };
        match result {
            Ok(()) => {
                self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                log_failure(session, &e);
                self.evict(std::slice::from_ref(session)).await;
                false
            }
        }
    }

    async fn evict(&self, ids: &[SessionId]) {
        let mut sessions = self.sessions.write().await;
        for id in ids {
            sessions.remove(id);
        }
        self.stats
            .messages_dropped
            .fetch_add(ids.len() as u64, Ordering::Relaxed);
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn contains(&self, session: &SessionId) -> bool {
        self.sessions.read().await.contains_key(session)
    }

    pub async fn stats(&self) -> RegistryStats {
        RegistryStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            active_sessions: self.sessions.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

fn log_failure(session: &SessionId, error: &TrySendError<Outbound>) {
    match error {
        TrySendError::Full(_) => log::warn!("Evicting session {session}: outbound queue full"),
        TrySendError::Closed(_) => log::debug!("Evicting session {session}: writer gone"),
    }
}
