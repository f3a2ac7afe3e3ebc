//! Partition counts per topic
//!
//! A successful lookup is kept for `max_age`. A failed lookup parks the topic
//! for a backoff window so that publishers fall back immediately instead of
//! dialing an unreachable broker on every record.

use std::collections::HashMap;
use tokio::sync::RwLock;
use tokio::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
enum TopicEntry {
    Partitions { count: u32, expires_at: Instant },
    Unavailable { retry_at: Instant },
}

impl TopicEntry {
    fn is_live(&self, now: Instant) -> bool {
        match *self {
            TopicEntry::Partitions { expires_at, .. } => now < expires_at,
            TopicEntry::Unavailable { retry_at } => now < retry_at,
        }
    }
}

/// Result of consulting the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lookup {
    /// Partition count known and fresh
    Known(u32),
    /// A recent lookup failed; do not ask the broker yet
    Unavailable,
    /// Nothing usable cached
    Miss,
}

pub(crate) struct MetadataCache {
    topics: RwLock<HashMap<String, TopicEntry>>,
    max_age: Duration,
    failure_backoff: Duration,
}

impl MetadataCache {
    pub(crate) fn new(max_age: Duration, failure_backoff: Duration) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            max_age,
            failure_backoff,
        }
    }

    pub(crate) async fn lookup(&self, topic: &str) -> Lookup {
        let now = Instant::now();
        match self.topics.read().await.get(topic) {
            Some(entry) if entry.is_live(now) => match *entry {
                TopicEntry::Partitions { count, .. } => Lookup::Known(count),
                TopicEntry::Unavailable { .. } => Lookup::Unavailable,
            },
            _ => Lookup::Miss,
        }
    }

    pub(crate) async fn put(&self, topic: &str, count: u32) {
        let entry = TopicEntry::Partitions {
            count,
            expires_at: Instant::now() + self.max_age,
        };
        self.topics.write().await.insert(topic.to_string(), entry);
    }

    /// Park `topic` after a failed lookup.
    ///
    /// A still-fresh partition count is left in place.
    pub(crate) async fn mark_unavailable(&self, topic: &str) {
        let now = Instant::now();
        let mut topics = self.topics.write().await;
        if let Some(TopicEntry::Partitions { expires_at, .. }) = topics.get(topic) {
            if now < *expires_at {
                return;
            }
        }
        topics.insert(
            topic.to_string(),
            TopicEntry::Unavailable {
                retry_at: now + self.failure_backoff,
            },
        );
    }

    pub(crate) async fn invalidate(&self, topic: &str) {
        self.topics.write().await.remove(topic);
    }

    /// Drop expired counts and elapsed backoff windows
    pub(crate) async fn cleanup(&self) {
        let now = Instant::now();
        self.topics.write().await.retain(|_, entry| entry.is_live(now));
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        self.topics.read().await.len()
    }
}
