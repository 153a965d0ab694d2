use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::Mutex;
use tracing::info;

use crate::bail;
use crate::error::{ErrorKind, LoaderResult};
use crate::staging::client::{StagedLocation, StagedObject, StagingClient};

#[derive(Debug, Default)]
struct Inner {
    objects: BTreeMap<String, Bytes>,
    failing_puts: usize,
    puts: usize,
}

/// In-memory staging storage for tests and local development.
///
/// Objects live in a map shared by every clone. Failures can be injected to exercise the
/// retry paths of callers.
#[derive(Debug, Clone, Default)]
pub struct MemoryStagingClient {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStagingClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` writes fail with a transient error.
    pub async fn fail_next_puts(&self, count: usize) {
        self.inner.lock().await.failing_puts = count;
    }

    pub async fn get(&self, key: &str) -> Option<Bytes> {
        self.inner.lock().await.objects.get(key).cloned()
    }

    /// Keys of every stored object, sorted.
    pub async fn keys(&self) -> Vec<String> {
        self.inner.lock().await.objects.keys().cloned().collect()
    }

    /// Number of write attempts, failed ones included.
    pub async fn put_attempts(&self) -> usize {
        self.inner.lock().await.puts
    }
}

impl StagingClient for MemoryStagingClient {
    async fn put(&self, key: &str, body: Bytes) -> LoaderResult<StagedObject> {
        let mut inner = self.inner.lock().await;
        inner.puts += 1;

        if inner.failing_puts > 0 {
            inner.failing_puts -= 1;
            bail!(
                ErrorKind::StagingWriteError,
                "Injected staging failure",
                key
            );
        }

        info!(key, size = body.len(), "storing staged object in memory");
        let size = body.len();
        inner.objects.insert(key.to_string(), body);

        Ok(StagedObject {
            key: key.to_string(),
            location: StagedLocation::Memory,
            size,
        })
    }

    async fn delete(&self, key: &str) -> LoaderResult<()> {
        self.inner.lock().await.objects.remove(key);
        Ok(())
    }
}
