//! Transcript persistence - ordered message storage
//!
//! Insertion order is the canonical transcript order. Durability is to the
//! point of process crash: writes go through a temp file + rename, but no
//! per-message fsync is required.

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::RwLock;

use super::message::ChatMessage;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to open transcript store: {0}")]
    Open(String),

    #[error("message not found: {0}")]
    NotFound(String),

    #[error("failed to persist transcript: {0}")]
    Write(String),
}

/// Ordered message storage consumed by the agent loop and the UI
pub trait TranscriptStore: Send + Sync {
    fn append_message(&self, message: ChatMessage) -> Result<(), StoreError>;

    fn update_message(&self, id: &str, new_content: &str) -> Result<(), StoreError>;

    /// All messages in insertion order
    fn list_messages(&self) -> Result<Vec<ChatMessage>, StoreError>;

    /// Remove every message marked ephemeral; returns how many were removed
    fn delete_ephemeral(&self) -> Result<usize, StoreError>;

    fn close(&self) -> Result<(), StoreError>;
}

/// In-memory store for tests and throwaway sessions
#[derive(Default)]
pub struct MemoryTranscriptStore {
    messages: RwLock<Vec<ChatMessage>>,
}

impl MemoryTranscriptStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TranscriptStore for MemoryTranscriptStore {
    fn append_message(&self, message: ChatMessage) -> Result<(), StoreError> {
        self.messages
            .write()
            .map_err(|e| StoreError::Write(e.to_string()))?
            .push(message);
        Ok(())
    }

    fn update_message(&self, id: &str, new_content: &str) -> Result<(), StoreError> {
        let mut messages = self
            .messages
            .write()
            .map_err(|e| StoreError::Write(e.to_string()))?;
        let message = messages
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        message.content = new_content.to_string();
        Ok(())
    }

    fn list_messages(&self) -> Result<Vec<ChatMessage>, StoreError> {
        Ok(self
            .messages
            .read()
            .map_err(|e| StoreError::Write(e.to_string()))?
            .clone())
    }

    fn delete_ephemeral(&self) -> Result<usize, StoreError> {
        let mut messages = self
            .messages
            .write()
            .map_err(|e| StoreError::Write(e.to_string()))?;
        let before = messages.len();
        messages.retain(|m| !m.ephemeral);
        Ok(before - messages.len())
    }

    fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Disk-backed store: the whole transcript as one JSON document with an
/// in-memory working copy. Suits chat-sized transcripts; the file is only
/// re-read at open.
pub struct DiskTranscriptStore {
    path: PathBuf,
    messages: RwLock<Vec<ChatMessage>>,
}

impl DiskTranscriptStore {
    pub fn open(path: PathBuf) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Open(format!("create {}: {e}", parent.display())))?;
            }
        }

        let messages = if path.exists() {
            let content = fs::read_to_string(&path)
                .map_err(|e| StoreError::Open(format!("read {}: {e}", path.display())))?;
            if content.trim().is_empty() {
                Vec::new()
            } else {
                serde_json::from_str(&content)
                    .map_err(|e| StoreError::Open(format!("parse {}: {e}", path.display())))?
            }
        } else {
            Vec::new()
        };

        Ok(Self {
            path,
            messages: RwLock::new(messages),
        })
    }

    /// Atomic write: temp file in the same directory, then rename.
    fn flush(&self, messages: &[ChatMessage]) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(messages)
            .map_err(|e| StoreError::Write(e.to_string()))?;

        let tmp = self.path.with_extension("tmp");
        {
            let mut file =
                fs::File::create(&tmp).map_err(|e| StoreError::Write(e.to_string()))?;
            file.write_all(json.as_bytes())
                .map_err(|e| StoreError::Write(e.to_string()))?;
        }
        fs::rename(&tmp, &self.path).map_err(|e| StoreError::Write(e.to_string()))
    }
}

impl TranscriptStore for DiskTranscriptStore {
    fn append_message(&self, message: ChatMessage) -> Result<(), StoreError> {
        let mut messages = self
            .messages
            .write()
            .map_err(|e| StoreError::Write(e.to_string()))?;
        messages.push(message);
        self.flush(&messages)
    }

    fn update_message(&self, id: &str, new_content: &str) -> Result<(), StoreError> {
        let mut messages = self
            .messages
            .write()
            .map_err(|e| StoreError::Write(e.to_string()))?;
        let message = messages
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        message.content = new_content.to_string();
        self.flush(&messages)
    }

    fn list_messages(&self) -> Result<Vec<ChatMessage>, StoreError> {
        Ok(self
            .messages
            .read()
            .map_err(|e| StoreError::Write(e.to_string()))?
            .clone())
    }

    fn delete_ephemeral(&self) -> Result<usize, StoreError> {
        let mut messages = self
            .messages
            .write()
            .map_err(|e| StoreError::Write(e.to_string()))?;
        let before = messages.len();
        messages.retain(|m| !m.ephemeral);
        let removed = before - messages.len();
        if removed > 0 {
            self.flush(&messages)?;
        }
        Ok(removed)
    }

    fn close(&self) -> Result<(), StoreError> {
        let messages = self
            .messages
            .read()
            .map_err(|e| StoreError::Write(e.to_string()))?;
        self.flush(&messages)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use crate::agent::message::Role;

    use super::*;

    #[test]
    fn memory_store_preserves_insertion_order() {
        let store = MemoryTranscriptStore::new();
        store.append_message(ChatMessage::user("one")).unwrap();
        store.append_message(ChatMessage::assistant("two")).unwrap();
        store.append_message(ChatMessage::user("three")).unwrap();

        let messages = store.list_messages().unwrap();
        let contents: Vec<_> = messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["one", "two", "three"]);
    }

    #[test]
    fn update_rewrites_content_in_place() {
        let store = MemoryTranscriptStore::new();
        let msg = ChatMessage::assistant("hel");
        let id = msg.id.clone();
        store.append_message(msg).unwrap();

        store.update_message(&id, "hello").unwrap();
        assert_eq!(store.list_messages().unwrap()[0].content, "hello");
    }

    #[test]
    fn update_unknown_id_errors() {
        let store = MemoryTranscriptStore::new();
        let err = store.update_message("M-missing", "x").unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn delete_ephemeral_removes_only_marked() {
        let store = MemoryTranscriptStore::new();
        store.append_message(ChatMessage::user("keep")).unwrap();
        store
            .append_message(ChatMessage::system("demo notice").ephemeral())
            .unwrap();

        assert_eq!(store.delete_ephemeral().unwrap(), 1);
        let messages = store.list_messages().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "keep");
    }

    #[test]
    fn disk_store_round_trips_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("chat.db");

        {
            let store = DiskTranscriptStore::open(path.clone()).unwrap();
            store.append_message(ChatMessage::user("hi")).unwrap();
            store.append_message(ChatMessage::assistant("hello")).unwrap();
            store.close().unwrap();
        }

        let reopened = DiskTranscriptStore::open(path).unwrap();
        let messages = reopened.list_messages().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[1].content, "hello");
    }

    #[test]
    fn disk_store_tool_result_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("chat.db");

        let store = DiskTranscriptStore::open(path.clone()).unwrap();
        store
            .append_message(ChatMessage::tool_result("tu_1", "sunny"))
            .unwrap();
        drop(store);

        let reopened = DiskTranscriptStore::open(path).unwrap();
        let messages = reopened.list_messages().unwrap();
        assert_eq!(messages[0].content, "sunny");
        assert_eq!(messages[0].tool_call_id.as_deref(), Some("tu_1"));
    }

    #[test]
    fn disk_store_deletes_ephemeral_on_request() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("chat.db");

        let store = DiskTranscriptStore::open(path.clone()).unwrap();
        store
            .append_message(ChatMessage::system("notice").ephemeral())
            .unwrap();
        store.append_message(ChatMessage::user("real")).unwrap();
        drop(store);

        let reopened = DiskTranscriptStore::open(path).unwrap();
        assert_eq!(reopened.delete_ephemeral().unwrap(), 1);
        assert_eq!(reopened.list_messages().unwrap().len(), 1);
    }

    #[test]
    fn disk_store_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let store = DiskTranscriptStore::open(dir.path().join("chat.db")).unwrap();
        store.append_message(ChatMessage::user("a")).unwrap();
        store.append_message(ChatMessage::user("b")).unwrap();

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
