//! Per-user conversation history with a sliding TTL.
//!
//! Workers are stateless: every job loads the user's history, runs, and writes the
//! grown history back. Trimming keeps the tail of the conversation but always starts
//! it at a user message, so an assistant tool call is never separated from its results.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::{add, SharedClock};
use crate::config::ConversationConfig;
use crate::error::{AgentError, Result};
use crate::items::{Message, Role};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationState {
    pub user_id: String,
    pub messages: Vec<Message>,
    pub updated_at: DateTime<Utc>,
}

impl ConversationState {
    pub fn empty(user_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.into(),
            messages: Vec::new(),
            updated_at: now,
        }
    }

    /// Keep at most `max` trailing messages, cut at a user-message boundary.
    pub fn trim(&mut self, max: usize) {
        if self.messages.len() <= max {
            return;
        }
        let cut = self.messages.len() - max;
        let start = self.messages[cut..]
            .iter()
            .position(|m| m.role == Role::User)
            .map(|i| cut + i)
            .unwrap_or(self.messages.len());
        self.messages.drain(..start);
    }

    pub fn is_expired(&self, ttl: std::time::Duration, now: DateTime<Utc>) -> bool {
        add(self.updated_at, ttl) <= now
    }
}

/// Storage for conversation history keyed by user.
#[async_trait]
pub trait ConversationStore: Send + Sync + 'static {
    /// The user's history, or an empty one if none exists or it expired.
    async fn load(&self, user_id: &str) -> Result<ConversationState>;

    /// Trim, stamp and persist. Refreshes the TTL.
    async fn save(&self, state: ConversationState) -> Result<ConversationState>;

    async fn clear(&self, user_id: &str) -> Result<()>;

    async fn purge_expired(&self) -> Result<usize>;

    /// Load, extend with `messages`, save.
    async fn append(&self, user_id: &str, messages: Vec<Message>) -> Result<ConversationState> {
        let mut state = self.load(user_id).await?;
        state.messages.extend(messages);
        self.save(state).await
    }
}

pub struct InMemoryConversationStore {
    inner: Mutex<HashMap<String, ConversationState>>,
    config: ConversationConfig,
    clock: SharedClock,
}

impl InMemoryConversationStore {
    pub fn new(config: ConversationConfig, clock: SharedClock) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            config,
            clock,
        }
    }

    fn map(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, ConversationState>>> {
        self.inner
            .lock()
            .map_err(|_| AgentError::Storage("conversation store lock poisoned".into()))
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn load(&self, user_id: &str) -> Result<ConversationState> {
        let now = self.clock.now();
        let mut map = self.map()?;
        match map.get(user_id) {
            Some(state) if !state.is_expired(self.config.ttl, now) => Ok(state.clone()),
            Some(_) => {
                map.remove(user_id);
                Ok(ConversationState::empty(user_id, now))
            }
            None => Ok(ConversationState::empty(user_id, now)),
        }
    }

    async fn save(&self, mut state: ConversationState) -> Result<ConversationState> {
        state.trim(self.config.max_messages);
        state.updated_at = self.clock.now();
        self.map()?.insert(state.user_id.clone(), state.clone());
        Ok(state)
    }

    async fn clear(&self, user_id: &str) -> Result<()> {
        self.map()?.remove(user_id);
        Ok(())
    }

    async fn purge_expired(&self) -> Result<usize> {
        let now = self.clock.now();
        let ttl = self.config.ttl;
        let mut map = self.map()?;
        let before = map.len();
        map.retain(|_, s| !s.is_expired(ttl, now));
        Ok(before - map.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::items::{ToolCall, ToolResult};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn exchange(n: usize) -> Vec<Message> {
        let call = ToolCall::new("calculator", json!({"expression": "1+1"}));
        vec![
            Message::user(format!("q{n}")),
            Message::assistant_with_tool_calls("", vec![call.clone()]),
            Message::tool_result(&ToolResult::ok(&call.id, "2")),
            Message::assistant(format!("a{n}")),
        ]
    }

    #[test]
    fn trim_starts_at_a_user_message() {
        let mut state = ConversationState::empty("u", Utc::now());
        state.messages = [exchange(1), exchange(2), exchange(3)].concat();
        state.trim(6);
        // the last four fit, the partial exchange before them is dropped
        assert_eq!(state.messages.len(), 4);
        assert_eq!(state.messages[0], Message::user("q3"));

        state.trim(4);
        assert_eq!(state.messages.len(), 4);
        state.trim(3);
        assert!(state.messages.is_empty());
    }

    #[tokio::test]
    async fn history_accumulates_and_expires() {
        let clock = ManualClock::default();
        let store = InMemoryConversationStore::new(ConversationConfig::default(), Arc::new(clock.clone()));

        store.append("alice", exchange(1)).await.unwrap();
        let state = store.append("alice", vec![Message::user("again")]).await.unwrap();
        assert_eq!(state.messages.len(), 5);
        assert!(store.load("bob").await.unwrap().messages.is_empty());

        clock.advance(Duration::from_secs(3599));
        assert_eq!(store.load("alice").await.unwrap().messages.len(), 5);
        clock.advance(Duration::from_secs(1));
        assert!(store.load("alice").await.unwrap().messages.is_empty());
    }

    #[tokio::test]
    async fn save_refreshes_ttl_and_purge_removes_stale() {
        let clock = ManualClock::default();
        let store = InMemoryConversationStore::new(ConversationConfig::default(), Arc::new(clock.clone()));
        store.append("a", exchange(1)).await.unwrap();
        store.append("b", exchange(1)).await.unwrap();
        clock.advance(Duration::from_secs(1800));
        store.append("b", vec![Message::user("still here")]).await.unwrap();
        clock.advance(Duration::from_secs(1800));
        assert_eq!(store.purge_expired().await.unwrap(), 1);
        assert_eq!(store.load("b").await.unwrap().messages.len(), 5);
        store.clear("b").await.unwrap();
        assert!(store.load("b").await.unwrap().messages.is_empty());
    }
}
