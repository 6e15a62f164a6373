//! Message records as persisted by the storage collaborator.
//!
//! The engines never persist anything themselves; callers store these after
//! each streamed batch.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use sotto_engines::Role;

/// A single persisted chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: String,
    pub role: Role,
    pub content: String,
    /// Unix timestamp in milliseconds.
    pub timestamp: i64,
}

impl StoredMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            timestamp: now_ms(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_messages_have_distinct_ids() {
        let a = StoredMessage::user("hi");
        let b = StoredMessage::user("hi");
        assert_ne!(a.id, b.id);
        assert!(!a.id.is_empty());
        assert!(a.timestamp > 0);
    }

    #[test]
    fn role_constructors() {
        assert_eq!(StoredMessage::user("x").role, Role::User);
        assert_eq!(StoredMessage::assistant("x").role, Role::Assistant);
    }
}
