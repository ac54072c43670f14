use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use crate::client::{SessionError, TerminalClient};
use crate::config::TtydConfig;

/// Bounds the number of live terminal sessions.
///
/// Each pooled client sits behind its own async mutex, so at most one caller
/// drives a session at a time; the pool is the unit of safe cross-session
/// concurrency. When the budget is exhausted, the least-recently-used idle
/// entry is shut down to make room.
pub struct ClientPool {
    max_connections: usize,
    entries: AsyncMutex<HashMap<String, PoolEntry>>,
}

struct PoolEntry {
    client: Arc<AsyncMutex<TerminalClient>>,
    last_used: Instant,
}

impl ClientPool {
    pub fn new(max_connections: usize) -> Self {
        Self {
            max_connections: max_connections.max(1),
            entries: AsyncMutex::new(HashMap::new()),
        }
    }

    /// Borrow the client registered under `id`, creating and initializing
    /// one if absent. Lock the returned mutex for the duration of use.
    pub async fn acquire(
        &self,
        id: &str,
        config: TtydConfig,
    ) -> Result<Arc<AsyncMutex<TerminalClient>>, SessionError> {
        let mut entries = self.entries.lock().await;

        if let Some(entry) = entries.get_mut(id) {
            entry.last_used = Instant::now();
            return Ok(Arc::clone(&entry.client));
        }

        if entries.len() >= self.max_connections {
            evict_least_recently_used(&mut entries).await?;
        }

        let client = TerminalClient::new(config);
        client.initialize().await?;
        let client = Arc::new(AsyncMutex::new(client));
        entries.insert(
            id.to_string(),
            PoolEntry {
                client: Arc::clone(&client),
                last_used: Instant::now(),
            },
        );
        info!(target: "pool", id, live = entries.len(), "session added to pool");
        Ok(client)
    }

    /// Shut down and drop the session registered under `id`.
    pub async fn release(&self, id: &str) {
        let entry = self.entries.lock().await.remove(id);
        match entry {
            Some(entry) => {
                entry.client.lock().await.shutdown().await;
                info!(target: "pool", id, "session released");
            }
            None => warn!(target: "pool", id, "release of unknown session"),
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }
}

/// Only entries nobody is currently borrowing are eviction candidates.
async fn evict_least_recently_used(
    entries: &mut HashMap<String, PoolEntry>,
) -> Result<(), SessionError> {
    let victim = entries
        .iter()
        .filter(|(_, entry)| entry.client.try_lock().is_ok())
        .min_by_key(|(_, entry)| entry.last_used)
        .map(|(id, _)| id.clone());

    let Some(id) = victim else {
        warn!(target: "pool", "every pooled session is borrowed; cannot evict");
        return Err(SessionError::PoolExhausted);
    };

    if let Some(entry) = entries.remove(&id) {
        entry.client.lock().await.shutdown().await;
        info!(target: "pool", id = %id, "evicted least-recently-used session");
    }
    Ok(())
}
