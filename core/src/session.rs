//! Session and message persistence, described by interface.
//!
//! Sessions are conversation threads owned by exactly one user; messages
//! are append-only rows with a per-session strictly increasing
//! `sequence_number`. SQL backends implement [`SessionStore`] behind the
//! same trait as the bundled in-memory store.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::auth::ensure_user_access;
use crate::error::DataAgentErr;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub user_id: String,
    pub assistant_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    /// Opaque executor state blob.
    pub state: serde_json::Value,
    pub metadata: serde_json::Value,
    pub archived: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StoredMessage {
    pub message_id: String,
    pub session_id: String,
    pub role: MessageRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<serde_json::Value>,
    pub metadata: serde_json::Value,
    /// Strictly increasing per session; `(session_id, sequence_number)`
    /// is unique.
    pub sequence_number: u64,
    pub created_at: DateTime<Utc>,
}

/// Payload for [`SessionStore::append_message`].
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub role: MessageRole,
    pub content: String,
    pub tool_calls: Option<serde_json::Value>,
    pub metadata: serde_json::Value,
}

impl NewMessage {
    pub fn text(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: None,
            metadata: serde_json::Value::Null,
        }
    }
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Create the session if it does not exist; sessions come into being
    /// when the first message arrives. An existing session owned by a
    /// different user is an authorization denial (admins are exempt and
    /// never take ownership).
    async fn ensure_session(
        &self,
        session_id: &str,
        user_id: &str,
        assistant_id: Option<&str>,
        is_admin: bool,
    ) -> Result<SessionRecord>;

    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>>;

    /// Lookup on behalf of a requester: existing sessions owned by
    /// someone else are denied (admins exempt, with the denial written
    /// to the audit trail).
    async fn get_session_authorized(
        &self,
        session_id: &str,
        requester: &str,
        is_admin: bool,
    ) -> Result<Option<SessionRecord>> {
        let session = self.get_session(session_id).await?;
        if let Some(record) = &session {
            ensure_user_access(requester, &record.user_id, is_admin)?;
        }
        Ok(session)
    }

    async fn list_sessions(
        &self,
        user_id: Option<&str>,
        include_archived: bool,
    ) -> Result<Vec<SessionRecord>>;

    async fn touch_session(&self, session_id: &str) -> Result<()>;

    async fn archive_session(&self, session_id: &str) -> Result<bool>;

    /// Removes the session and cascades to its messages.
    async fn delete_session(&self, session_id: &str) -> Result<bool>;

    /// Assigns the next sequence number atomically.
    async fn append_message(&self, session_id: &str, message: NewMessage) -> Result<StoredMessage>;

    async fn list_messages(
        &self,
        session_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<StoredMessage>>;

    /// Remove sessions idle longer than `ttl`. Returns how many were
    /// removed.
    async fn cleanup_expired(&self, ttl: Duration) -> Result<usize>;
}

#[derive(Default)]
struct SessionEntry {
    record: SessionRecord,
    messages: Vec<StoredMessage>,
    next_sequence: u64,
}

impl Default for SessionRecord {
    fn default() -> Self {
        Self {
            session_id: String::new(),
            user_id: String::new(),
            assistant_id: None,
            created_at: Utc::now(),
            last_active_at: Utc::now(),
            state: serde_json::Value::Null,
            metadata: serde_json::Value::Null,
            archived: false,
        }
    }
}

/// The bundled in-memory store.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<String, SessionEntry>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn ensure_session(
        &self,
        session_id: &str,
        user_id: &str,
        assistant_id: Option<&str>,
        is_admin: bool,
    ) -> Result<SessionRecord> {
        let mut sessions = self.sessions.lock().await;
        if let Some(entry) = sessions.get(session_id) {
            ensure_user_access(user_id, &entry.record.user_id, is_admin)?;
            return Ok(entry.record.clone());
        }
        let record = SessionRecord {
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
            assistant_id: assistant_id.map(str::to_string),
            ..Default::default()
        };
        sessions.insert(
            session_id.to_string(),
            SessionEntry {
                record: record.clone(),
                messages: Vec::new(),
                next_sequence: 1,
            },
        );
        Ok(record)
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        let sessions = self.sessions.lock().await;
        Ok(sessions.get(session_id).map(|e| e.record.clone()))
    }

    async fn list_sessions(
        &self,
        user_id: Option<&str>,
        include_archived: bool,
    ) -> Result<Vec<SessionRecord>> {
        let sessions = self.sessions.lock().await;
        let mut records: Vec<SessionRecord> = sessions
            .values()
            .map(|e| e.record.clone())
            .filter(|r| user_id.is_none_or(|u| r.user_id == u))
            .filter(|r| include_archived || !r.archived)
            .collect();
        records.sort_by(|a, b| b.last_active_at.cmp(&a.last_active_at));
        Ok(records)
    }

    async fn touch_session(&self, session_id: &str) -> Result<()> {
        let mut sessions = self.sessions.lock().await;
        let entry = sessions
            .get_mut(session_id)
            .ok_or_else(|| DataAgentErr::SessionNotFound(session_id.to_string()))?;
        entry.record.last_active_at = Utc::now();
        Ok(())
    }

    async fn archive_session(&self, session_id: &str) -> Result<bool> {
        let mut sessions = self.sessions.lock().await;
        match sessions.get_mut(session_id) {
            Some(entry) => {
                entry.record.archived = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_session(&self, session_id: &str) -> Result<bool> {
        Ok(self.sessions.lock().await.remove(session_id).is_some())
    }

    async fn append_message(&self, session_id: &str, message: NewMessage) -> Result<StoredMessage> {
        let mut sessions = self.sessions.lock().await;
        let entry = sessions
            .get_mut(session_id)
            .ok_or_else(|| DataAgentErr::SessionNotFound(session_id.to_string()))?;
        let stored = StoredMessage {
            message_id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            role: message.role,
            content: message.content,
            tool_calls: message.tool_calls,
            metadata: message.metadata,
            sequence_number: entry.next_sequence,
            created_at: Utc::now(),
        };
        entry.next_sequence += 1;
        entry.record.last_active_at = stored.created_at;
        entry.messages.push(stored.clone());
        Ok(stored)
    }

    async fn list_messages(
        &self,
        session_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<StoredMessage>> {
        let sessions = self.sessions.lock().await;
        let entry = sessions
            .get(session_id)
            .ok_or_else(|| DataAgentErr::SessionNotFound(session_id.to_string()))?;
        Ok(entry
            .messages
            .iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn cleanup_expired(&self, ttl: Duration) -> Result<usize> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(0));
        let mut sessions = self.sessions.lock().await;
        let expired: Vec<String> = sessions
            .iter()
            .filter(|(_, e)| e.record.last_active_at < cutoff)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            sessions.remove(id);
        }
        Ok(expired.len())
    }
}

/// On-disk fallback store: a JSON index of session records plus one
/// JSON-lines file of messages per session, so histories can be
/// appended to and inspected with standard tooling.
pub struct FileSessionStore {
    root: std::path::PathBuf,
    /// Serializes index rewrites and sequence assignment.
    lock: Mutex<()>,
}

impl FileSessionStore {
    pub fn new(root: impl Into<std::path::PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock: Mutex::new(()),
        }
    }

    fn index_path(&self) -> std::path::PathBuf {
        self.root.join("sessions.json")
    }

    fn messages_path(&self, session_id: &str) -> std::path::PathBuf {
        self.root
            .join("messages")
            .join(format!("{}.jsonl", crate::workspace::sanitize_user_id(session_id)))
    }

    fn read_index(&self) -> Result<HashMap<String, SessionRecord>> {
        let path = self.index_path();
        if !path.exists() {
            return Ok(HashMap::new());
        }
        Ok(serde_json::from_str(&std::fs::read_to_string(path)?)?)
    }

    fn write_index(&self, index: &HashMap<String, SessionRecord>) -> Result<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::write(self.index_path(), serde_json::to_string_pretty(index)?)?;
        Ok(())
    }

    fn read_messages(&self, session_id: &str) -> Result<Vec<StoredMessage>> {
        let path = self.messages_path(session_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut messages = Vec::new();
        for line in std::fs::read_to_string(path)?.lines() {
            if line.trim().is_empty() {
                continue;
            }
            messages.push(serde_json::from_str(line)?);
        }
        Ok(messages)
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn ensure_session(
        &self,
        session_id: &str,
        user_id: &str,
        assistant_id: Option<&str>,
        is_admin: bool,
    ) -> Result<SessionRecord> {
        let _guard = self.lock.lock().await;
        let mut index = self.read_index()?;
        if let Some(record) = index.get(session_id) {
            ensure_user_access(user_id, &record.user_id, is_admin)?;
            return Ok(record.clone());
        }
        let record = SessionRecord {
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
            assistant_id: assistant_id.map(str::to_string),
            ..Default::default()
        };
        index.insert(session_id.to_string(), record.clone());
        self.write_index(&index)?;
        Ok(record)
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        let _guard = self.lock.lock().await;
        Ok(self.read_index()?.get(session_id).cloned())
    }

    async fn list_sessions(
        &self,
        user_id: Option<&str>,
        include_archived: bool,
    ) -> Result<Vec<SessionRecord>> {
        let _guard = self.lock.lock().await;
        let mut records: Vec<SessionRecord> = self
            .read_index()?
            .into_values()
            .filter(|r| user_id.is_none_or(|u| r.user_id == u))
            .filter(|r| include_archived || !r.archived)
            .collect();
        records.sort_by(|a, b| b.last_active_at.cmp(&a.last_active_at));
        Ok(records)
    }

    async fn touch_session(&self, session_id: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut index = self.read_index()?;
        let record = index
            .get_mut(session_id)
            .ok_or_else(|| DataAgentErr::SessionNotFound(session_id.to_string()))?;
        record.last_active_at = Utc::now();
        self.write_index(&index)
    }

    async fn archive_session(&self, session_id: &str) -> Result<bool> {
        let _guard = self.lock.lock().await;
        let mut index = self.read_index()?;
        let Some(record) = index.get_mut(session_id) else {
            return Ok(false);
        };
        record.archived = true;
        self.write_index(&index)?;
        Ok(true)
    }

    async fn delete_session(&self, session_id: &str) -> Result<bool> {
        let _guard = self.lock.lock().await;
        let mut index = self.read_index()?;
        let removed = index.remove(session_id).is_some();
        if removed {
            self.write_index(&index)?;
            let messages = self.messages_path(session_id);
            if messages.exists() {
                std::fs::remove_file(messages)?;
            }
        }
        Ok(removed)
    }

    async fn append_message(&self, session_id: &str, message: NewMessage) -> Result<StoredMessage> {
        let _guard = self.lock.lock().await;
        let mut index = self.read_index()?;
        let record = index
            .get_mut(session_id)
            .ok_or_else(|| DataAgentErr::SessionNotFound(session_id.to_string()))?;

        let sequence_number = self.read_messages(session_id)?.len() as u64 + 1;
        let stored = StoredMessage {
            message_id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            role: message.role,
            content: message.content,
            tool_calls: message.tool_calls,
            metadata: message.metadata,
            sequence_number,
            created_at: Utc::now(),
        };

        let path = self.messages_path(session_id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut line = serde_json::to_string(&stored)?;
        line.push('\n');
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)?;
        file.write_all(line.as_bytes())?;

        record.last_active_at = stored.created_at;
        self.write_index(&index)?;
        Ok(stored)
    }

    async fn list_messages(
        &self,
        session_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<StoredMessage>> {
        let _guard = self.lock.lock().await;
        if !self.read_index()?.contains_key(session_id) {
            return Err(DataAgentErr::SessionNotFound(session_id.to_string()));
        }
        Ok(self
            .read_messages(session_id)?
            .into_iter()
            .skip(offset)
            .take(limit)
            .collect())
    }

    async fn cleanup_expired(&self, ttl: Duration) -> Result<usize> {
        let _guard = self.lock.lock().await;
        let cutoff = Utc::now()
            - chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(0));
        let mut index = self.read_index()?;
        let expired: Vec<String> = index
            .iter()
            .filter(|(_, r)| r.last_active_at < cutoff)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            index.remove(id);
            let messages = self.messages_path(id);
            if messages.exists() {
                std::fs::remove_file(messages)?;
            }
        }
        if !expired.is_empty() {
            self.write_index(&index)?;
        }
        Ok(expired.len())
    }
}
