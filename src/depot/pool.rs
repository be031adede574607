//! The depot session pool.
//!
//! Idle sessions are keyed by case-folded `(port, user, client)` in a
//! multimap. Allocation scans the bucket, discarding faulted, disconnected
//! or idle-expired candidates, and connects a fresh session when none
//! survive. Sessions are single-threaded by contract: a session checked
//! out of the pool has exactly one user until it is freed. Freeing under a
//! different key than allocation is legal and rekeys the session.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use super::config::DepotConfig;
use super::session::{DepotSession, TransportFactory};
use crate::settings::{keys, Settings};

pub struct SessionPool {
    factory: TransportFactory,
    settings: Arc<Settings>,
    free: Mutex<HashMap<String, Vec<DepotSession>>>,
}

impl SessionPool {
    pub fn new(factory: TransportFactory, settings: Arc<Settings>) -> Self {
        Self { factory, settings, free: Mutex::new(HashMap::new()) }
    }

    /// Idle age beyond which a pooled session is dropped.
    fn idle_timeout(&self) -> Duration {
        let ms = self.settings.get_i32(keys::DEPOT_CLIENT_CACHE_IDLE_TIMEOUT_MS).max(0);
        Duration::from_millis(ms as u64)
    }

    /// Checks out a session for `config`, reusing an idle one when
    /// possible, connecting a fresh one otherwise. Returns `None` when a
    /// fresh connection fails. `context` labels the caller in log lines.
    pub async fn allocate(&self, config: &DepotConfig, context: &str) -> Option<DepotSession> {
        let key = config.pool_key();
        let idle_timeout = self.idle_timeout();

        loop {
            let candidate = {
                let mut free = self.free.lock().await;
                match free.get_mut(&key) {
                    Some(bucket) if !bucket.is_empty() => Some(bucket.remove(0)),
                    _ => None,
                }
            };
            let Some(mut session) = candidate else { break };

            if session.is_faulted() {
                tracing::info!(key, "existing session in error state, discarding");
                continue;
            }
            if !session.is_connected() {
                tracing::info!(key, "existing session disconnected, discarding");
                continue;
            }
            if session.idle_time() >= idle_timeout {
                tracing::info!(key, "existing session keepalive expired, discarding");
                continue;
            }

            session.set_context(Some(context.to_string()));
            return Some(session);
        }

        tracing::info!(key, "creating new session");
        let mut session = DepotSession::new(self.factory.clone(), self.settings.clone());
        match session.connect(config).await {
            Ok(true) => {
                tracing::info!(key, "successfully created new session");
                session.set_context(Some(context.to_string()));
                Some(session)
            }
            Ok(false) | Err(_) => {
                tracing::error!(key, "failed to create new session");
                None
            }
        }
    }

    /// Returns a session to the pool under `config`'s key.
    pub async fn free(&self, config: &DepotConfig, mut session: DepotSession) {
        session.set_context(None);
        let mut free = self.free.lock().await;
        free.entry(config.pool_key()).or_default().push(session);
    }

    /// Drops every pooled session.
    pub async fn clear(&self) {
        self.free.lock().await.clear();
    }

    /// Drops pooled sessions idle for at least `timeout`.
    pub async fn garbage_collect(&self, timeout: Duration) {
        let mut free = self.free.lock().await;
        for bucket in free.values_mut() {
            bucket.retain(|session| session.idle_time() < timeout);
        }
        free.retain(|_, bucket| !bucket.is_empty());
    }

    /// Number of idle sessions currently pooled.
    pub async fn free_count(&self) -> usize {
        self.free.lock().await.values().map(Vec::len).sum()
    }
}

impl std::fmt::Debug for SessionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionPool").finish_non_exhaustive()
    }
}
