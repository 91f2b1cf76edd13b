//! Narrow repository interface over the external document store.
//!
//! The gateway does not own persistence; chats live in a key-value document
//! store operated elsewhere. The core consumes it through [`ChatRepository`]
//! with exactly the surface the authorization guard and the thin chat handlers
//! need, nothing more. [`MemoryChatRepository`] backs tests and single-node
//! development deployments.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// A stored chat document, as the guard and handlers see it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRecord {
    pub chat_id: String,
    pub owner_uid: String,
    pub title: String,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait ChatRepository: Send + Sync {
    async fn chat_by_id(&self, chat_id: &str) -> anyhow::Result<Option<ChatRecord>>;
    async fn chats_by_owner(&self, owner_uid: &str) -> anyhow::Result<Vec<ChatRecord>>;
    async fn upsert_chat(&self, chat: ChatRecord) -> anyhow::Result<ChatRecord>;
}

/// In-process store used by tests and dev deployments.
#[derive(Default)]
pub struct MemoryChatRepository {
    chats: DashMap<String, ChatRecord>,
}

impl MemoryChatRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChatRepository for MemoryChatRepository {
    async fn chat_by_id(&self, chat_id: &str) -> anyhow::Result<Option<ChatRecord>> {
        Ok(self.chats.get(chat_id).map(|c| c.clone()))
    }

    async fn chats_by_owner(&self, owner_uid: &str) -> anyhow::Result<Vec<ChatRecord>> {
        let mut chats: Vec<ChatRecord> = self
            .chats
            .iter()
            .filter(|c| c.owner_uid == owner_uid)
            .map(|c| c.clone())
            .collect();
        chats.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(chats)
    }

    async fn upsert_chat(&self, chat: ChatRecord) -> anyhow::Result<ChatRecord> {
        self.chats.insert(chat.chat_id.clone(), chat.clone());
        Ok(chat)
    }
}
