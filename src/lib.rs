pub mod api;
pub mod db;
pub mod error;

use std::sync::Arc;

use db::{ConnectionSupervisor, SchemaLifecycle};

pub const DEFAULT_BODY_LIMIT: usize = 256 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub lifecycle: Arc<SchemaLifecycle>,
    pub body_limit: usize,
    pub started_at: std::time::Instant,
}

impl AppState {
    pub fn new(lifecycle: SchemaLifecycle) -> Self {
        Self {
            lifecycle: Arc::new(lifecycle),
            body_limit: DEFAULT_BODY_LIMIT,
            started_at: std::time::Instant::now(),
        }
    }

    pub fn with_body_limit(mut self, bytes: usize) -> Self {
        self.body_limit = bytes;
        self
    }

    pub fn supervisor(&self) -> &ConnectionSupervisor {
        self.lifecycle.supervisor()
    }
}
