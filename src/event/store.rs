use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

use super::{EventData, EventError, Filter, Kind, LogEntry};

/// Message recorded on a running event whose holder stopped refreshing its lock.
pub fn expired_message(expire: Duration) -> String {
    format!("event expired, no update for {:?}", expire)
}

/// Persistence for event records.
///
/// `insert` is the only place locks are taken: it must atomically verify
/// that no running event holds any of the new event's lock targets.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Store a new event. Returns the holders whose expired locks were
    /// released on the way, already finalized.
    async fn insert(
        &self,
        evt: EventData,
        lock_expire: Duration,
    ) -> Result<Vec<EventData>, EventError>;

    async fn get(&self, id: Uuid) -> Result<Option<EventData>, EventError>;

    async fn list(&self, filter: &Filter) -> Result<Vec<EventData>, EventError>;

    /// Append log entries and refresh the lock update time.
    async fn append_log(&self, id: Uuid, entries: Vec<LogEntry>) -> Result<(), EventError>;

    async fn touch(&self, id: Uuid) -> Result<(), EventError>;

    async fn request_cancel(
        &self,
        id: Uuid,
        owner: &str,
        reason: &str,
    ) -> Result<EventData, EventError>;

    async fn ack_cancel(&self, id: Uuid) -> Result<bool, EventError>;

    /// Finalize a running event. Returns the record only when this call
    /// performed the transition.
    async fn finish(
        &self,
        id: Uuid,
        error: Option<String>,
        end_data: Option<Value>,
    ) -> Result<Option<EventData>, EventError>;

    async fn set_other_data(&self, id: Uuid, data: Value) -> Result<(), EventError>;

    async fn remove(&self, id: Uuid) -> Result<(), EventError>;

    async fn kinds(&self) -> Result<Vec<Kind>, EventError>;

    async fn health_check(&self) -> Result<(), EventError> {
        Ok(())
    }
}

/// Process-local event store.
#[derive(Default)]
pub struct MemoryEventStore {
    events: RwLock<Vec<EventData>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn update<T>(
        &self,
        id: Uuid,
        f: impl FnOnce(&mut EventData) -> Result<T, EventError>,
    ) -> Result<T, EventError> {
        let mut events = self.events.write();
        let evt = events
            .iter_mut()
            .find(|e| e.unique_id == id)
            .ok_or(EventError::NotFound)?;
        f(evt)
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn insert(
        &self,
        evt: EventData,
        lock_expire: Duration,
    ) -> Result<Vec<EventData>, EventError> {
        let now = Utc::now();
        let mut events = self.events.write();
        let mut expired = Vec::new();
        for target in evt.lock_targets() {
            for (idx, holder) in events.iter().enumerate() {
                if !holder.holds_lock(target) {
                    continue;
                }
                if !holder.lock_expired(now, lock_expire) {
                    return Err(EventError::Locked(holder.to_string()));
                }
                expired.push(idx);
            }
        }
        let mut released = Vec::new();
        for idx in expired {
            let holder = &mut events[idx];
            if holder.finalize(Some(expired_message(lock_expire)), None) {
                tracing::warn!("releasing expired lock held by event {}", holder.unique_id);
                released.push(holder.clone());
            }
        }
        events.push(evt);
        Ok(released)
    }

    async fn get(&self, id: Uuid) -> Result<Option<EventData>, EventError> {
        Ok(self
            .events
            .read()
            .iter()
            .find(|e| e.unique_id == id)
            .cloned())
    }

    async fn list(&self, filter: &Filter) -> Result<Vec<EventData>, EventError> {
        let matched = self
            .events
            .read()
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        Ok(filter.paginate(matched))
    }

    async fn append_log(&self, id: Uuid, entries: Vec<LogEntry>) -> Result<(), EventError> {
        self.update(id, |evt| {
            evt.structured_log.extend(entries);
            evt.log = evt.render_log();
            if evt.running {
                evt.lock_update_time = Utc::now();
            }
            Ok(())
        })
    }

    async fn touch(&self, id: Uuid) -> Result<(), EventError> {
        self.update(id, |evt| {
            if evt.running {
                evt.lock_update_time = Utc::now();
            }
            Ok(())
        })
    }

    async fn request_cancel(
        &self,
        id: Uuid,
        owner: &str,
        reason: &str,
    ) -> Result<EventData, EventError> {
        self.update(id, |evt| {
            evt.request_cancel(owner, reason)?;
            Ok(evt.clone())
        })
    }

    async fn ack_cancel(&self, id: Uuid) -> Result<bool, EventError> {
        self.update(id, |evt| Ok(evt.ack_cancel()))
    }

    async fn finish(
        &self,
        id: Uuid,
        error: Option<String>,
        end_data: Option<Value>,
    ) -> Result<Option<EventData>, EventError> {
        self.update(id, |evt| {
            Ok(evt.finalize(error, end_data).then(|| evt.clone()))
        })
    }

    async fn set_other_data(&self, id: Uuid, data: Value) -> Result<(), EventError> {
        self.update(id, |evt| {
            evt.other_custom_data = Some(data);
            Ok(())
        })
    }

    async fn remove(&self, id: Uuid) -> Result<(), EventError> {
        let mut events = self.events.write();
        let before = events.len();
        events.retain(|e| e.unique_id != id);
        if events.len() == before {
            return Err(EventError::NotFound);
        }
        Ok(())
    }

    async fn kinds(&self) -> Result<Vec<Kind>, EventError> {
        let mut kinds: Vec<Kind> = Vec::new();
        for evt in self.events.read().iter() {
            if !kinds.contains(&evt.kind) {
                kinds.push(evt.kind.clone());
            }
        }
        kinds.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(kinds)
    }
}
