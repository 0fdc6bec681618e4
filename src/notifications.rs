//! Change notifications for WebSocket subscribers.
//!
//! Services publish a [`ChangeEvent`] after every successful mutation. The
//! same event (type, entity and user) published again within the dedup
//! window is dropped, so bursts of writes to one entity produce one
//! notification. Subscribers receive every event and filter by user.

use crate::config::NotificationConfig;
use crate::db::now_ms;
use crate::types::string_enum;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::debug;

string_enum! {
    EventType {
        Created => "created",
        Updated => "updated",
        Deleted => "deleted",
        Completed => "completed",
    }
}

string_enum! {
    EntityType {
        Project => "project",
        Branch => "branch",
        Task => "task",
        Subtask => "subtask",
        Context => "context",
        Delegation => "delegation",
    }
}

/// A single change, as sent to WebSocket clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub event_type: EventType,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch_id: Option<String>,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub data: Value,
    pub timestamp: i64,
}

impl ChangeEvent {
    pub fn new(event_type: EventType, entity_type: EntityType, entity_id: &str, user_id: &str) -> Self {
        Self {
            event_type,
            entity_type,
            entity_id: entity_id.to_string(),
            user_id: user_id.to_string(),
            project_id: None,
            branch_id: None,
            data: Value::Null,
            timestamp: now_ms(),
        }
    }

    pub fn project(mut self, project_id: &str) -> Self {
        self.project_id = Some(project_id.to_string());
        self
    }

    pub fn branch(mut self, branch_id: &str) -> Self {
        self.branch_id = Some(branch_id.to_string());
        self
    }

    pub fn data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DedupKey {
    event_type: EventType,
    entity_type: EntityType,
    entity_id: String,
    user_id: String,
}

impl From<&ChangeEvent> for DedupKey {
    fn from(event: &ChangeEvent) -> Self {
        Self {
            event_type: event.event_type,
            entity_type: event.entity_type,
            entity_id: event.entity_id.clone(),
            user_id: event.user_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NotificationStats {
    pub published: u64,
    pub suppressed: u64,
    pub subscribers: usize,
    pub tracked_keys: usize,
    pub dedup_window_ms: u64,
}

/// Fan-out of change events with deduplication.
pub struct NotificationService {
    sender: broadcast::Sender<ChangeEvent>,
    window: Duration,
    recent: Mutex<HashMap<DedupKey, Instant>>,
    published: AtomicU64,
    suppressed: AtomicU64,
}

impl NotificationService {
    pub fn new(config: &NotificationConfig) -> Self {
        let (sender, _) = broadcast::channel(config.channel_capacity.max(1));
        Self {
            sender,
            window: Duration::from_millis(config.dedup_window_ms),
            recent: Mutex::new(HashMap::new()),
            published: AtomicU64::new(0),
            suppressed: AtomicU64::new(0),
        }
    }

    /// Publish an event. Returns `false` when it was suppressed as a repeat.
    ///
    /// Having no subscribers is not an error.
    pub fn publish(&self, event: ChangeEvent) -> bool {
        let key = DedupKey::from(&event);
        let now = Instant::now();
        {
            let mut recent = self.recent.lock().unwrap_or_else(PoisonError::into_inner);
            let window = self.window;
            recent.retain(|_, seen| now.duration_since(*seen) < window);
            if recent.contains_key(&key) {
                self.suppressed.fetch_add(1, Ordering::Relaxed);
                debug!(
                    event_type = %event.event_type,
                    entity_type = %event.entity_type,
                    entity_id = %event.entity_id,
                    "Suppressed duplicate notification"
                );
                return false;
            }
            recent.insert(key, now);
        }

        self.published.fetch_add(1, Ordering::Relaxed);
        let delivered = self.sender.send(event).unwrap_or(0);
        debug!(delivered, "Published change notification");
        true
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.sender.subscribe()
    }

    pub fn stats(&self) -> NotificationStats {
        let tracked_keys = self.recent.lock().unwrap_or_else(PoisonError::into_inner).len();
        NotificationStats {
            published: self.published.load(Ordering::Relaxed),
            suppressed: self.suppressed.load(Ordering::Relaxed),
            subscribers: self.sender.receiver_count(),
            tracked_keys,
            dedup_window_ms: self.window.as_millis() as u64,
        }
    }
}

impl Default for NotificationService {
    fn default() -> Self {
        Self::new(&NotificationConfig::default())
    }
}
