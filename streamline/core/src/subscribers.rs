//! Subscriber Registry - Engine Event Fan-out
//!
//! UI layers subscribe to the engine and receive an [`EngineEvent`] after
//! every mutation. Delivery uses `try_send` so a mutation never waits on a
//! slow subscriber.
//!
//! # Architecture
//!
//! ```text
//!                    SubscriberRegistry
//!                   ┌─────────────────────────────────────────────┐
//!                   │ HashMap<SubscriberId, Sender<EngineEvent>>  │
//!                   │   - wrapped in Arc<RwLock<>>                │
//!                   └──────────────────────┬──────────────────────┘
//!                                          │
//!               ┌──────────────────────────┼──────────────────────┐
//!        ┌──────▼──────┐           ┌───────▼──────┐       ┌───────▼──────┐
//!        │  Chat view  │           │ Stage panel  │       │   Logger     │
//!        │   sub-1     │           │    sub-2     │       │   sub-3      │
//!        └─────────────┘           └──────────────┘       └──────────────┘
//! ```
//!
//! A subscriber whose buffer is full misses that event and stays registered;
//! a subscriber whose receiver was dropped is removed on the next broadcast.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::chunk::ErrorInfo;
use crate::message::MessageId;
use crate::session::{SessionId, SessionSnapshot};

/// Unique identifier for a subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriberId(u64);

impl SubscriberId {
    /// Create a new unique subscriber ID
    #[must_use]
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::SeqCst))
    }

    /// Get the raw numeric value
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Notification sent to subscribers
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    /// Session state after a mutation
    Snapshot(SessionSnapshot),
    /// A stream ended with an error
    StreamError {
        /// Session the stream belonged to
        session_id: SessionId,
        /// Message the error terminated
        message_id: MessageId,
        /// The error
        error: ErrorInfo,
    },
    /// A session was cleared
    Cleared {
        /// Session that was cleared
        session_id: SessionId,
    },
}

impl EngineEvent {
    /// Session this event concerns
    #[must_use]
    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::Snapshot(snapshot) => &snapshot.session_id,
            Self::StreamError { session_id, .. } | Self::Cleared { session_id } => session_id,
        }
    }
}

/// Result of a broadcast operation
#[derive(Debug, Clone, Default)]
pub struct BroadcastResult {
    /// Number of subscribers that received the event
    pub successful: usize,
    /// Number of subscribers that missed the event
    pub failed: usize,
    /// IDs of subscribers that missed the event
    pub failed_ids: Vec<SubscriberId>,
}

impl BroadcastResult {
    /// Check if all subscribers received the event
    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }
}

/// Registry of engine subscribers
#[derive(Clone, Default)]
pub struct SubscriberRegistry {
    inner: Arc<RwLock<HashMap<SubscriberId, mpsc::Sender<EngineEvent>>>>,
}

impl SubscriberRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber with a bounded buffer
    #[must_use]
    pub fn subscribe(&self, capacity: usize) -> (SubscriberId, mpsc::Receiver<EngineEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let id = SubscriberId::new();
        self.inner.write().insert(id, tx);
        tracing::debug!(subscriber_id = %id, "Subscriber registered");
        (id, rx)
    }

    /// Remove a subscriber
    ///
    /// Returns true if it was registered.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let removed = self.inner.write().remove(&id).is_some();
        if removed {
            tracing::debug!(subscriber_id = %id, "Subscriber unregistered");
        }
        removed
    }

    /// Number of registered subscribers
    #[must_use]
    pub fn count(&self) -> usize {
        self.inner.read().len()
    }

    /// Whether nobody is subscribed
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Deliver an event to every subscriber without waiting
    pub fn broadcast(&self, event: &EngineEvent) -> BroadcastResult {
        let mut result = BroadcastResult::default();
        let mut closed = Vec::new();

        {
            let inner = self.inner.read();
            for (id, tx) in inner.iter() {
                match tx.try_send(event.clone()) {
                    Ok(()) => result.successful += 1,
                    Err(TrySendError::Full(_)) => {
                        tracing::warn!(subscriber_id = %id, "Subscriber buffer full, event dropped");
                        result.failed += 1;
                        result.failed_ids.push(*id);
                    }
                    Err(TrySendError::Closed(_)) => {
                        result.failed += 1;
                        result.failed_ids.push(*id);
                        closed.push(*id);
                    }
                }
            }
        }

        if !closed.is_empty() {
            let mut inner = self.inner.write();
            for id in closed {
                inner.remove(&id);
                tracing::debug!(subscriber_id = %id, "Pruned closed subscriber");
            }
        }

        result
    }
}

impl fmt::Debug for SubscriberRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriberRegistry")
            .field("subscribers", &self.count())
            .finish()
    }
}
