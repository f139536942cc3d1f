use std::collections::HashMap;

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use shared::{domain::SessionId, protocol::OutgoingMessage};
use tracing::{debug, warn};

struct CachedEntry {
    bytes: Vec<u8>,
    /// Per-session run count at which this entry was last referenced.
    sessions: HashMap<SessionId, u64>,
}

/// Deduplicates large outgoing deltas. A session that re-emits a
/// byte-identical delta receives a short hash reference instead; the
/// browser either already holds the bytes or fetches them once through the
/// side-channel lookup.
pub struct MessageCache {
    min_cached_size: usize,
    expiry_runs: u64,
    entries: DashMap<String, CachedEntry>,
}

impl MessageCache {
    pub fn new(min_cached_size: usize, expiry_runs: u64) -> Self {
        Self {
            min_cached_size,
            expiry_runs,
            entries: DashMap::new(),
        }
    }

    /// Runs one outgoing message through the cache, returning either the
    /// original message or a small reference. Only deltas above the size
    /// floor qualify; session and control messages pass through untouched.
    pub fn add(
        &self,
        message: OutgoingMessage,
        session: SessionId,
        run_count: u64,
    ) -> OutgoingMessage {
        let OutgoingMessage::Delta(delta) = &message else {
            return message;
        };
        let bytes = match serde_json::to_vec(&message) {
            Ok(bytes) => bytes,
            Err(error) => {
                warn!(%session, %error, "failed to serialize delta; skipping message cache");
                return message;
            }
        };
        if bytes.len() < self.min_cached_size {
            return message;
        }

        let hash = hex::encode(Sha256::digest(&bytes));
        let path = delta.path.clone();
        let mut entry = self.entries.entry(hash.clone()).or_insert_with(|| CachedEntry {
            bytes,
            sessions: HashMap::new(),
        });
        let seen_before = entry.sessions.insert(session, run_count).is_some();
        drop(entry);

        if seen_before {
            debug!(%session, %hash, "replaced repeated delta with cache reference");
            OutgoingMessage::CachedRef { hash, path }
        } else {
            message
        }
    }

    /// Serialized bytes of the original message, for the side-channel
    /// lookup keyed by hash.
    pub fn get_by_hash(&self, hash: &str) -> Option<Vec<u8>> {
        self.entries.get(hash).map(|entry| entry.bytes.clone())
    }

    pub fn remove_refs_for_session(&self, session: SessionId) {
        self.entries.retain(|_, entry| {
            entry.sessions.remove(&session);
            !entry.sessions.is_empty()
        });
    }

    /// Drops this session's references whose age in runs exceeds the
    /// expiry threshold, and any entry left with no referencing session.
    pub fn remove_expired_entries(&self, session: SessionId, current_run: u64) {
        self.entries.retain(|_, entry| {
            if let Some(last_referenced) = entry.sessions.get(&session) {
                if current_run.saturating_sub(*last_referenced) > self.expiry_runs {
                    entry.sessions.remove(&session);
                }
            }
            !entry.sessions.is_empty()
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
