//! Explicit application context passed down through the core.

use std::sync::Arc;

use crate::depot::pool::SessionPool;
use crate::fs::FileStore;
use crate::settings::Settings;

/// Identity of the user whose file access triggered an operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UserContext {
    pub session_id: u32,
    pub process_id: u32,
    pub thread_id: u32,
}

/// Shared state threaded through the resolver, service and sync engine.
/// Built once at startup and passed explicitly; no globals.
#[derive(Clone)]
pub struct AppContext {
    pub settings: Arc<Settings>,
    pub store: Arc<dyn FileStore>,
    pub pool: Arc<SessionPool>,
}

impl AppContext {
    pub fn new(settings: Arc<Settings>, store: Arc<dyn FileStore>, pool: Arc<SessionPool>) -> Self {
        Self { settings, store, pool }
    }
}

impl std::fmt::Debug for AppContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppContext").finish_non_exhaustive()
    }
}
