use std::sync::Arc;

use anyhow::Result;
use cache::{ComputeCacheConfig, ComputeCacheTable, DiskTier, MessageCache, PersistentTier};
use dashmap::DashMap;
use shared::domain::SessionId;
use tracing::info;

use crate::{config::Settings, session::Session};

/// Process-scoped state: the settings, the two process-wide caches, and
/// the session registry. Constructed explicitly via [`init`](Self::init)
/// so tests can build isolated instances; never a module-level singleton.
pub struct EngineContext {
    pub settings: Settings,
    pub compute_cache: Arc<ComputeCacheTable>,
    pub message_cache: Arc<MessageCache>,
    sessions: DashMap<SessionId, Arc<Session>>,
}

impl EngineContext {
    pub fn init(settings: Settings) -> Result<Arc<Self>> {
        let persistent: Option<Arc<dyn PersistentTier>> = match &settings.compute_cache_dir {
            Some(dir) => {
                info!(dir, "compute cache persisting to disk");
                Some(Arc::new(DiskTier::new(dir.clone())?))
            }
            None => None,
        };
        let compute_cache = Arc::new(ComputeCacheTable::new(
            ComputeCacheConfig {
                max_entries: settings.compute_max_entries,
                ttl: settings.compute_ttl(),
            },
            persistent,
        ));
        let message_cache = Arc::new(MessageCache::new(
            settings.min_cached_message_size,
            settings.cache_expiry_runs,
        ));
        Ok(Arc::new(Self {
            settings,
            compute_cache,
            message_cache,
            sessions: DashMap::new(),
        }))
    }

    pub(crate) fn register(&self, session: Arc<Session>) {
        self.sessions.insert(session.id, session);
    }

    pub(crate) fn deregister(&self, session_id: SessionId) {
        self.sessions.remove(&session_id);
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Stops every session's worker. Called once at process exit.
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.sessions.clear();
        for session in sessions {
            let handle = Arc::clone(&session);
            let _ = tokio::task::spawn_blocking(move || handle.controller.shutdown()).await;
            self.message_cache.remove_refs_for_session(session.id);
        }
        info!("engine context shut down");
    }
}
