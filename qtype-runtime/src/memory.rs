//! ABOUTME: Shared chat-history store with token-budgeted eviction
//! ABOUTME: Keyed by (session_id, memory_id); per-session mutation is serialized

use parking_lot::Mutex;
use dashmap::DashMap;
use qtype_core::types::chat::{ChatContent, ChatMessage, MessageRole};
use qtype_semantics::MemoryIr;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;

/// One appended chat turn.
#[derive(Debug, Clone)]
pub struct MemoryRecord {
    pub role: MessageRole,
    pub blocks: Vec<ChatContent>,
    pub tokens: usize,
}

#[derive(Debug, Default)]
struct SessionMemory {
    records: VecDeque<MemoryRecord>,
    total_tokens: usize,
}

impl SessionMemory {
    fn append(&mut self, record: MemoryRecord, memory: &MemoryIr) {
        self.total_tokens += record.tokens;
        self.records.push_back(record);

        // Evict oldest whole records in flush-size multiples until the
        // budget is satisfied.
        while self.total_tokens > memory.token_limit && !self.records.is_empty() {
            let mut freed = 0;
            while freed < memory.token_flush_size {
                match self.records.pop_front() {
                    Some(evicted) => freed += evicted.tokens,
                    None => break,
                }
            }
            self.total_tokens = self.total_tokens.saturating_sub(freed);
        }
    }
}

/// Thread-safe memory store shared by every executor in a run.
///
/// The outer map is lock-free; each session record list sits behind its own
/// mutex, serializing per-session mutation while distinct sessions proceed
/// in parallel. Reads copy the assembled context out; internal storage is
/// never handed to callers.
#[derive(Debug, Default)]
pub struct MemoryStore {
    sessions: DashMap<(String, String), Arc<Mutex<SessionMemory>>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn session(&self, session_id: &str, memory_id: &str) -> Arc<Mutex<SessionMemory>> {
        self.sessions
            .entry((session_id.to_string(), memory_id.to_string()))
            .or_default()
            .clone()
    }

    /// Append one message to a session's history.
    pub fn append(&self, session_id: &str, memory: &MemoryIr, message: &ChatMessage) {
        let record = MemoryRecord {
            role: message.role,
            blocks: message.blocks.clone(),
            tokens: message.estimate_tokens(),
        };
        let session = self.session(session_id, &memory.id);
        let mut guard = session.lock();
        guard.append(record, memory);
        debug!(
            session = session_id,
            memory = %memory.id,
            tokens = guard.total_tokens,
            "memory appended"
        );
    }

    /// Assemble the chat-history context for a new inference.
    ///
    /// The newest records that fit the history budget
    /// (`chat_history_token_ratio × token_limit`) are returned in
    /// chronological order.
    #[must_use]
    pub fn context(&self, session_id: &str, memory: &MemoryIr) -> Vec<ChatMessage> {
        let Some(session) = self
            .sessions
            .get(&(session_id.to_string(), memory.id.clone()))
            .map(|entry| entry.clone())
        else {
            return Vec::new();
        };
        let guard = session.lock();

        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let budget = ((memory.token_limit as f64) * memory.chat_history_token_ratio) as usize;
        let mut taken = Vec::new();
        let mut used = 0;
        for record in guard.records.iter().rev() {
            if used + record.tokens > budget {
                break;
            }
            used += record.tokens;
            taken.push(ChatMessage::new(record.role, record.blocks.clone()));
        }
        taken.reverse();
        taken
    }

    /// Total stored tokens for a session, for tests and introspection.
    #[must_use]
    pub fn total_tokens(&self, session_id: &str, memory_id: &str) -> usize {
        self.sessions
            .get(&(session_id.to_string(), memory_id.to_string()))
            .map_or(0, |session| session.lock().total_tokens)
    }

    /// Whether the session has any history.
    #[must_use]
    pub fn is_empty(&self, session_id: &str, memory_id: &str) -> bool {
        self.total_tokens(session_id, memory_id) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn memory(limit: usize, ratio: f64, flush: usize) -> MemoryIr {
        MemoryIr {
            id: "mem".to_string(),
            token_limit: limit,
            chat_history_token_ratio: ratio,
            token_flush_size: flush,
        }
    }

    fn message_of_tokens(tokens: usize) -> ChatMessage {
        // estimate_tokens is len/4 per block.
        ChatMessage::user("x".repeat(tokens * 4))
    }

    #[test]
    fn context_returns_chronological_history() {
        let store = MemoryStore::new();
        let mem = memory(1000, 0.7, 100);
        store.append("s1", &mem, &ChatMessage::user("My name is Alice."));
        store.append("s1", &mem, &ChatMessage::assistant("Nice to meet you, Alice."));

        let context = store.context("s1", &mem);
        assert_eq!(context.len(), 2);
        assert_eq!(context[0].role, MessageRole::User);
        assert_eq!(context[1].role, MessageRole::Assistant);
    }

    #[test]
    fn sessions_are_isolated() {
        let store = MemoryStore::new();
        let mem = memory(1000, 0.7, 100);
        store.append("s1", &mem, &ChatMessage::user("one"));
        assert!(store.context("s2", &mem).is_empty());
    }

    #[test]
    fn eviction_keeps_total_within_limit() {
        let store = MemoryStore::new();
        let mem = memory(100, 0.7, 30);
        for _ in 0..20 {
            store.append("s1", &mem, &message_of_tokens(25));
        }
        assert!(store.total_tokens("s1", "mem") <= 100);
    }

    #[test]
    fn eviction_drops_whole_oldest_records() {
        let store = MemoryStore::new();
        let mem = memory(60, 1.0, 20);
        store.append("s1", &mem, &ChatMessage::user("A".repeat(100))); // 25 tokens
        store.append("s1", &mem, &ChatMessage::user("B".repeat(100)));
        store.append("s1", &mem, &ChatMessage::user("C".repeat(100))); // exceeds: evict >= 20

        let context = store.context("s1", &mem);
        assert!(context.iter().all(|m| !m.text().contains('A')));
        assert!(context.iter().any(|m| m.text().contains('C')));
    }

    proptest! {
        /// After any write sequence, stored tokens never exceed the limit.
        #[test]
        fn eviction_bound_holds(token_counts in proptest::collection::vec(1usize..200, 1..40)) {
            let store = MemoryStore::new();
            let mem = memory(500, 0.7, 100);
            for tokens in token_counts {
                store.append("s1", &mem, &message_of_tokens(tokens));
            }
            prop_assert!(store.total_tokens("s1", "mem") <= 500);
        }
    }
}
