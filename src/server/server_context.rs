use std::sync::Arc;

use crate::cache::Coordinator;

/// State shared by every connection handler.
pub struct ServerContext {
    pub coordinator: Arc<Coordinator>,
    pub default_upstream: String,
    pub tls: bool,
}

impl ServerContext {
    pub fn new(coordinator: Arc<Coordinator>, default_upstream: &str, tls: bool) -> Self {
        Self {
            coordinator,
            default_upstream: default_upstream.to_string(),
            tls,
        }
    }

    pub fn scheme(&self) -> &'static str {
        if self.tls {
            "https"
        } else {
            "http"
        }
    }
}
