use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use uuid::Uuid;

const DEFAULT_CAPACITY: usize = 1000;

/// One orchestrator action (a workflow call or a post-deploy step).
#[derive(Debug, Clone, Serialize)]
pub struct ActionLog {
    pub id: Uuid,
    pub action_type: String,
    pub status: String,
    pub vm_id: Option<i64>,
    pub error_message: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

/// Bounded in-memory action log. Oldest entries are evicted first.
pub struct ActionJournal {
    entries: Mutex<VecDeque<ActionLog>>,
    capacity: usize,
}

impl Default for ActionJournal {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl ActionJournal {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_CAPACITY))),
            capacity: capacity.max(1),
        }
    }

    pub fn log_event(
        &self,
        action_type: &str,
        status: &str,
        vm_id: Option<i64>,
        error_message: Option<&str>,
    ) -> Uuid {
        self.log_event_with_metadata(action_type, status, vm_id, error_message, None)
    }

    /// Log event with metadata (context info)
    pub fn log_event_with_metadata(
        &self,
        action_type: &str,
        status: &str,
        vm_id: Option<i64>,
        error_message: Option<&str>,
        metadata: Option<serde_json::Value>,
    ) -> Uuid {
        let log_id = Uuid::new_v4();
        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(ActionLog {
            id: log_id,
            action_type: action_type.to_string(),
            status: status.to_string(),
            vm_id,
            error_message: error_message.map(str::to_string),
            metadata,
            created_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
        });
        drop(entries);

        tracing::info!(%log_id, action_type, status, vm_id, "action logged");
        log_id
    }

    /// Log event completion with duration
    pub fn log_event_complete(
        &self,
        log_id: Uuid,
        status: &str,
        duration_ms: i64,
        error_message: Option<&str>,
    ) {
        self.log_event_complete_with_metadata(log_id, status, duration_ms, error_message, None)
    }

    pub fn log_event_complete_with_metadata(
        &self,
        log_id: Uuid,
        status: &str,
        duration_ms: i64,
        error_message: Option<&str>,
        metadata: Option<serde_json::Value>,
    ) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.iter_mut().rev().find(|e| e.id == log_id) {
            entry.status = status.to_string();
            entry.duration_ms = Some(duration_ms);
            entry.completed_at = Some(Utc::now());
            if error_message.is_some() {
                entry.error_message = error_message.map(str::to_string);
            }
            if metadata.is_some() {
                entry.metadata = metadata;
            }
        }
        drop(entries);

        match error_message {
            Some(err) => tracing::warn!(%log_id, status, duration_ms, error = err, "action completed"),
            None => tracing::info!(%log_id, status, duration_ms, "action completed"),
        }
    }

    /// Quick log for one-off events (like state transitions)
    pub fn log_quick(&self, action_type: &str, vm_id: Option<i64>, details: Option<&str>) {
        let _ = self.log_event(action_type, "success", vm_id, details);
    }

    /// Most recent entries first.
    pub fn recent(&self, limit: usize) -> Vec<ActionLog> {
        self.entries.lock().iter().rev().take(limit).cloned().collect()
    }

    pub fn get(&self, log_id: Uuid) -> Option<ActionLog> {
        self.entries.lock().iter().find(|e| e.id == log_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_updates_entry() {
        let journal = ActionJournal::default();
        let id = journal.log_event("CREATE_VM", "in_progress", None, None);
        journal.log_event_complete(id, "failed", 12, Some("boom"));
        let entry = journal.get(id).unwrap();
        assert_eq!(entry.status, "failed");
        assert_eq!(entry.duration_ms, Some(12));
        assert_eq!(entry.error_message.as_deref(), Some("boom"));
        assert!(entry.completed_at.is_some());
    }

    #[test]
    fn oldest_entries_are_evicted() {
        let journal = ActionJournal::with_capacity(2);
        journal.log_quick("A", Some(1), None);
        journal.log_quick("B", Some(2), None);
        journal.log_quick("C", Some(3), None);
        let recent = journal.recent(10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].action_type, "C");
        assert_eq!(recent[1].action_type, "B");
    }
}
