//! Presence registry: who is actively viewing/editing which composition.
//!
//! Concurrency-safe mapping from topic key to the set of active
//! `(user, session)` pairs. The outer map only locks to create or drop a
//! topic; each topic's entry set sits behind its own lock, so unrelated
//! compositions never serialize against each other. A topic with zero
//! remaining entries is removed eagerly — the registry never leaks empty
//! sets.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// One active subscription of one session.
///
/// Equality and ordering are `(user_id, session_id)`; the email tags along
/// for notices and snapshots. Joining twice with the same session is
/// idempotent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub session_id: String,
    pub user_id: String,
    pub email: String,
}

impl PresenceEntry {
    pub fn new(
        session_id: impl Into<String>,
        user_id: impl Into<String>,
        email: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            user_id: user_id.into(),
            email: email.into(),
        }
    }

    fn probe(user_id: &str, session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
            email: String::new(),
        }
    }
}

impl PartialEq for PresenceEntry {
    fn eq(&self, other: &Self) -> bool {
        self.user_id == other.user_id && self.session_id == other.session_id
    }
}

impl Eq for PresenceEntry {}

impl Ord for PresenceEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.user_id
            .cmp(&other.user_id)
            .then_with(|| self.session_id.cmp(&other.session_id))
    }
}

impl PartialOrd for PresenceEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Result of removing a session from one topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub topic: String,
    /// True when the removed entry was the user's last session on the topic.
    pub last_of_user: bool,
}

struct TopicState {
    entries: RwLock<BTreeSet<PresenceEntry>>,
}

impl TopicState {
    fn new() -> Self {
        Self {
            entries: RwLock::new(BTreeSet::new()),
        }
    }
}

/// Registry of presence entries per topic key.
///
/// Constructed once at server start and passed by handle into the
/// subscription lifecycle manager and broadcast router; never ambient.
#[derive(Default)]
pub struct PresenceRegistry {
    topics: RwLock<HashMap<String, Arc<TopicState>>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
        }
    }

    async fn get_or_create(&self, topic: &str) -> Arc<TopicState> {
        {
            let topics = self.topics.read().await;
            if let Some(state) = topics.get(topic) {
                return state.clone();
            }
        }
        let mut topics = self.topics.write().await;
        topics
            .entry(topic.to_string())
            .or_insert_with(|| Arc::new(TopicState::new()))
            .clone()
    }

    async fn remove_topic_if_empty(&self, topic: &str) {
        let mut topics = self.topics.write().await;
        if let Some(state) = topics.get(topic) {
            if state.entries.read().await.is_empty() {
                topics.remove(topic);
            }
        }
    }

    /// Register a session on a topic and return the full post-join snapshot
    /// (sorted by user then session), so the joining client learns who else
    /// is present without a second round trip.
    pub async fn join(&self, topic: &str, entry: PresenceEntry) -> Vec<PresenceEntry> {
        loop {
            let state = self.get_or_create(topic).await;
            let snapshot = {
                let mut entries = state.entries.write().await;
                entries.insert(entry.clone());
                entries.iter().cloned().collect::<Vec<_>>()
            };
            // The topic may have been dropped by a concurrent leave between
            // lookup and insert; verify it is still registered.
            if self
                .topics
                .read()
                .await
                .get(topic)
                .is_some_and(|s| Arc::ptr_eq(s, &state))
            {
                return snapshot;
            }
        }
    }

    /// Remove one session from the first topic holding it.
    pub async fn leave_by_session(&self, user_id: &str, session_id: &str) -> Option<Departure> {
        let candidates: Vec<(String, Arc<TopicState>)> = {
            let topics = self.topics.read().await;
            topics.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };
        let probe = PresenceEntry::probe(user_id, session_id);
        for (topic, state) in candidates {
            let (removed, last_of_user, empty) = {
                let mut entries = state.entries.write().await;
                let removed = entries.remove(&probe);
                let last = removed && !entries.iter().any(|e| e.user_id == user_id);
                (removed, last, entries.is_empty())
            };
            if removed {
                if empty {
                    self.remove_topic_if_empty(&topic).await;
                }
                return Some(Departure {
                    topic,
                    last_of_user,
                });
            }
        }
        None
    }

    /// Remove one session from every topic holding it. Used on disconnect:
    /// a disconnected session is gone from everywhere at once, but other
    /// sessions of the same user stay present.
    pub async fn leave_session_everywhere(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Vec<Departure> {
        let candidates: Vec<(String, Arc<TopicState>)> = {
            let topics = self.topics.read().await;
            topics.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };
        let probe = PresenceEntry::probe(user_id, session_id);
        let mut departures = Vec::new();
        for (topic, state) in candidates {
            let (removed, last_of_user, empty) = {
                let mut entries = state.entries.write().await;
                let removed = entries.remove(&probe);
                let last = removed && !entries.iter().any(|e| e.user_id == user_id);
                (removed, last, entries.is_empty())
            };
            if removed {
                if empty {
                    self.remove_topic_if_empty(&topic).await;
                }
                departures.push(Departure {
                    topic,
                    last_of_user,
                });
            }
        }
        departures
    }

    /// Remove every session of a user from every topic. Returns the keys of
    /// the topics that held the user.
    pub async fn leave_everywhere(&self, user_id: &str) -> Vec<String> {
        let candidates: Vec<(String, Arc<TopicState>)> = {
            let topics = self.topics.read().await;
            topics.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };
        let mut removed_topics = Vec::new();
        for (topic, state) in candidates {
            let (removed, empty) = {
                let mut entries = state.entries.write().await;
                let before = entries.len();
                entries.retain(|e| e.user_id != user_id);
                (entries.len() < before, entries.is_empty())
            };
            if removed {
                if empty {
                    self.remove_topic_if_empty(&topic).await;
                }
                removed_topics.push(topic);
            }
        }
        removed_topics
    }

    pub async fn snapshot(&self, topic: &str) -> Vec<PresenceEntry> {
        let state = {
            let topics = self.topics.read().await;
            topics.get(topic).cloned()
        };
        match state {
            Some(state) => state.entries.read().await.iter().cloned().collect(),
            None => Vec::new(),
        }
    }

    pub async fn topics(&self) -> Vec<String> {
        self.topics.read().await.keys().cloned().collect()
    }

    pub async fn topic_count(&self) -> usize {
        self.topics.read().await.len()
    }
}
