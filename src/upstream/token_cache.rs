use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

/// Authorization header values keyed by `endpoint/repository`, each kept
/// until its TTL elapses. Expired entries are swept every 1000 accesses.
#[derive(Debug, Default)]
pub struct TokenCache {
    store: RwLock<HashMap<String, (String, Instant)>>,
    counter: AtomicUsize,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn store(&self, key: &str, value: &str, expires_in: u64) {
        let count = self.counter.fetch_add(1, Ordering::Relaxed);

        let mut store = self.store.write().await;

        if count % 1000 == 0 {
            let now = Instant::now();
            store.retain(|_, &mut (_, expiry)| expiry > now);
        }

        store.insert(
            key.to_string(),
            (
                value.to_string(),
                Instant::now() + Duration::from_secs(expires_in),
            ),
        );
    }

    pub async fn retrieve(&self, key: &str) -> Option<String> {
        let count = self.counter.fetch_add(1, Ordering::Relaxed);

        if count % 1000 == 0 {
            let mut store = self.store.write().await;
            let now = Instant::now();
            store.retain(|_, &mut (_, expiry)| expiry > now);
            return store.get(key).map(|(value, _)| value.clone());
        }

        let store = self.store.read().await;
        store
            .get(key)
            .filter(|(_, expiry)| *expiry > Instant::now())
            .map(|(value, _)| value.clone())
    }
}
