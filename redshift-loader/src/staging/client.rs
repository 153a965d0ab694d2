use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};
use redshift_config::shared::StagingConfig;
use secrecy::ExposeSecret;
use tracing::debug;

use crate::error::{ErrorKind, LoaderResult};
use crate::loader_error;

/// Where a staged object can be read from by the warehouse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StagedLocation {
    /// `s3://bucket/key`, loaded with `COPY ... FROM`.
    S3 { uri: String },
    /// A file on the local disk, streamed with `COPY ... FROM STDIN`.
    Local { path: PathBuf },
    /// Held by a [`super::MemoryStagingClient`].
    Memory,
}

/// An object written to staging storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedObject {
    /// Key relative to the staging client, without its prefix.
    pub key: String,
    pub location: StagedLocation,
    pub size: usize,
}

/// Durable storage for staged batches and dead letters.
///
/// Implementations do not retry; transient failures are surfaced as
/// [`ErrorKind::StagingWriteError`] and retried by the caller.
pub trait StagingClient: Clone + Send + Sync + 'static {
    /// Writes `body` under `key`, replacing any existing object.
    fn put(
        &self,
        key: &str,
        body: Bytes,
    ) -> impl Future<Output = LoaderResult<StagedObject>> + Send;

    /// Deletes the object under `key`. Deleting a missing object succeeds.
    fn delete(&self, key: &str) -> impl Future<Output = LoaderResult<()>> + Send;
}

#[derive(Debug, Clone)]
enum StoreKind {
    S3 { bucket: String },
    Local { root: PathBuf },
}

/// [`StagingClient`] writing to S3 or to a local directory through `object_store`.
#[derive(Debug, Clone)]
pub struct ObjectStoreStagingClient {
    store: Arc<dyn ObjectStore>,
    kind: StoreKind,
    key_prefix: String,
}

impl ObjectStoreStagingClient {
    /// Builds the client described by the staging configuration.
    ///
    /// Local staging creates its directory if needed. S3 credentials fall back to the
    /// environment when none are configured.
    pub fn from_config(config: &StagingConfig) -> LoaderResult<Self> {
        match config {
            StagingConfig::S3 {
                bucket,
                key_prefix,
                region,
                endpoint,
                access_key_id,
                secret_access_key,
                ..
            } => {
                let mut builder = AmazonS3Builder::from_env()
                    .with_bucket_name(bucket)
                    .with_region(region);
                if let Some(endpoint) = endpoint {
                    builder = builder.with_endpoint(endpoint);
                }
                if let Some(access_key_id) = access_key_id {
                    builder = builder.with_access_key_id(access_key_id);
                }
                if let Some(secret_access_key) = secret_access_key {
                    builder = builder.with_secret_access_key(secret_access_key.expose_secret());
                }

                let store = builder.build().map_err(|err| {
                    loader_error!(
                        ErrorKind::ConfigError,
                        "Failed to build the S3 staging client",
                        err.to_string(),
                        source: err
                    )
                })?;

                Ok(Self {
                    store: Arc::new(store),
                    kind: StoreKind::S3 {
                        bucket: bucket.clone(),
                    },
                    key_prefix: key_prefix.clone(),
                })
            }
            StagingConfig::Local { path } => {
                std::fs::create_dir_all(path)?;
                let root = path.canonicalize()?;
                let store = LocalFileSystem::new_with_prefix(&root).map_err(|err| {
                    loader_error!(
                        ErrorKind::ConfigError,
                        "Failed to open the local staging directory",
                        root.display(),
                        source: err
                    )
                })?;

                Ok(Self {
                    store: Arc::new(store),
                    kind: StoreKind::Local { root },
                    key_prefix: String::new(),
                })
            }
        }
    }

    fn path(&self, key: &str) -> Path {
        Path::from(format!("{}{key}", self.key_prefix))
    }

    fn location(&self, path: &Path) -> StagedLocation {
        match &self.kind {
            StoreKind::S3 { bucket } => StagedLocation::S3 {
                uri: format!("s3://{bucket}/{path}"),
            },
            StoreKind::Local { root } => StagedLocation::Local {
                path: root.join(path.to_string()),
            },
        }
    }
}

impl StagingClient for ObjectStoreStagingClient {
    async fn put(&self, key: &str, body: Bytes) -> LoaderResult<StagedObject> {
        let path = self.path(key);
        let size = body.len();

        self.store.put(&path, PutPayload::from_bytes(body)).await?;
        debug!(%path, size, "staged object written");

        Ok(StagedObject {
            key: key.to_string(),
            location: self.location(&path),
            size,
        })
    }

    async fn delete(&self, key: &str) -> LoaderResult<()> {
        let path = self.path(key);

        match self.store.delete(&path).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_staging_writes_and_deletes_files() {
        let dir = tempfile::tempdir().unwrap();
        let client = ObjectStoreStagingClient::from_config(&StagingConfig::Local {
            path: dir.path().join("staging"),
        })
        .unwrap();

        let object = client
            .put("users/0000000001-1.csv", Bytes::from_static(b"1,a\n"))
            .await
            .unwrap();

        let StagedLocation::Local { path } = &object.location else {
            panic!("expected a local location");
        };
        assert_eq!(std::fs::read(path).unwrap(), b"1,a\n");

        client.delete(&object.key).await.unwrap();
        assert!(!path.exists());
        client.delete(&object.key).await.unwrap();
    }
}
