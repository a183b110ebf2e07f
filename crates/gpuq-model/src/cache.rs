use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use gpuq_domain::ModelId;
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::error::ModelError;

/// Read deadline for one model fetch. Models are large; the stream gets five
/// minutes end to end.
const FETCH_DEADLINE: Duration = Duration::from_secs(300);

/// Chunks in flight between the network reader and the disk writer.
const WRITE_RING_CAPACITY: usize = 16;

#[derive(Debug, Clone)]
pub struct ModelCacheConfig {
    pub cache_dir: PathBuf,
    pub auto_fetch: bool,
    pub file_service_url: String,
    pub file_service_key: String,
}

/// Content-addressed staging of model artifacts on local disk.
///
/// Registry invariant: a mapped path exists on disk. The mapping is only
/// written after an atomic rename of the fully-downloaded temp file, and a
/// mapping whose path has gone missing is dropped and refetched. Concurrent
/// `ensure` calls for the same model collapse onto one fetch via a
/// per-identifier mutex created on demand.
pub struct ModelCache {
    config: ModelCacheConfig,
    client: reqwest::Client,
    registry: Mutex<HashMap<ModelId, PathBuf>>,
    fetch_locks: Mutex<HashMap<ModelId, Arc<Mutex<()>>>>,
}

impl ModelCache {
    pub fn new(config: ModelCacheConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
            registry: Mutex::new(HashMap::new()),
            fetch_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Create the cache directory if needed and register everything already
    /// in it. Called once at startup; returns the number of cached models.
    pub async fn scan(&self) -> Result<usize, ModelError> {
        tokio::fs::create_dir_all(&self.config.cache_dir).await?;

        let mut found = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.config.cache_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            // Partials from an interrupted fetch are garbage, not models.
            if name.starts_with('.') {
                continue;
            }
            debug!(model_id = %name, "found cached model");
            found.push((ModelId::new(name), entry.path()));
        }

        let mut registry = self.registry.lock().await;
        registry.extend(found);
        Ok(registry.len())
    }

    /// Local path for the model, fetching from the file service if needed.
    pub async fn ensure(&self, model_id: &ModelId) -> Result<PathBuf, ModelError> {
        if let Some(path) = self.lookup(model_id).await {
            return Ok(path);
        }

        if !self.config.auto_fetch {
            warn!(model_id = %model_id, "model not in cache and auto-fetch disabled");
            return Err(ModelError::NotCached(model_id.clone()));
        }

        self.fetch(model_id).await
    }

    pub async fn cached(&self) -> HashMap<ModelId, PathBuf> {
        self.registry.lock().await.clone()
    }

    /// Administrative eviction: drop the mapping and delete the artifact.
    pub async fn evict(&self, model_id: &ModelId) -> Result<bool, ModelError> {
        let path = self.registry.lock().await.remove(model_id);
        match path {
            Some(path) => {
                if tokio::fs::try_exists(&path).await? {
                    tokio::fs::remove_file(&path).await?;
                }
                info!(model_id = %model_id, "evicted cached model");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Mapping check that repairs a stale entry (mapped path gone from disk).
    async fn lookup(&self, model_id: &ModelId) -> Option<PathBuf> {
        let path = self.registry.lock().await.get(model_id).cloned()?;
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            debug!(model_id = %model_id, path = %path.display(), "model found in cache");
            Some(path)
        } else {
            warn!(
                model_id = %model_id,
                path = %path.display(),
                "cached model no longer exists on disk, will refetch"
            );
            self.registry.lock().await.remove(model_id);
            None
        }
    }

    async fn fetch(&self, model_id: &ModelId) -> Result<PathBuf, ModelError> {
        let lock = {
            let mut locks = self.fetch_locks.lock().await;
            locks
                .entry(model_id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = lock.lock().await;

        // Another caller may have finished the fetch while we queued.
        if let Some(path) = self.lookup(model_id).await {
            return Ok(path);
        }

        info!(model_id = %model_id, "fetching model from file service");

        let url = format!(
            "{}/internal/models/{}",
            self.config.file_service_url.trim_end_matches('/'),
            model_id
        );
        let resp = self
            .client
            .get(&url)
            .header("X-Internal-Key", &self.config.file_service_key)
            .timeout(FETCH_DEADLINE)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            warn!(model_id = %model_id, status, "file service refused model fetch");
            return Err(ModelError::FetchFailed { model: model_id.clone(), status });
        }

        let final_path = self.config.cache_dir.join(model_id.as_str());
        let tmp_path = self
            .config
            .cache_dir
            .join(format!(".{}.partial-{}", model_id, uuid::Uuid::new_v4()));

        let result = self.download_to(resp, &tmp_path).await;
        let (bytes, digest) = match result {
            Ok(ok) => ok,
            Err(e) => {
                let _ = tokio::fs::remove_file(&tmp_path).await;
                return Err(e);
            }
        };

        // The rename is what makes a crash leave either a complete model or
        // nothing, never a half-written path behind a live mapping.
        tokio::fs::rename(&tmp_path, &final_path).await?;
        self.registry
            .lock()
            .await
            .insert(model_id.clone(), final_path.clone());

        info!(
            model_id = %model_id,
            path = %final_path.display(),
            bytes,
            sha256 = %digest,
            "model staged"
        );
        Ok(final_path)
    }

    /// Bridge the async byte stream onto a blocking disk writer: a bounded
    /// ring of chunks where the reader blocks on empty and the writer blocks
    /// on full; the producer closes the channel as the end sentinel. The
    /// writer side accumulates a rolling SHA-256 and a byte count.
    async fn download_to(
        &self,
        resp: reqwest::Response,
        tmp_path: &PathBuf,
    ) -> Result<(u64, String), ModelError> {
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(WRITE_RING_CAPACITY);

        let path = tmp_path.clone();
        let writer = tokio::task::spawn_blocking(move || -> Result<(u64, String), std::io::Error> {
            let mut file = std::fs::File::create(&path)?;
            let mut hasher = Sha256::new();
            let mut bytes: u64 = 0;

            while let Some(chunk) = rx.blocking_recv() {
                file.write_all(&chunk)?;
                hasher.update(&chunk);
                bytes += chunk.len() as u64;
            }

            file.sync_all()?;
            Ok((bytes, format!("{:x}", hasher.finalize())))
        });

        let mut stream = resp.bytes_stream();
        let mut stream_err: Option<ModelError> = None;
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(chunk) => {
                    if tx.send(chunk.to_vec()).await.is_err() {
                        // Writer bailed; its error is picked up below.
                        break;
                    }
                }
                Err(e) => {
                    stream_err = Some(ModelError::Http(e));
                    break;
                }
            }
        }
        drop(tx);

        let written = writer
            .await
            .map_err(|e| ModelError::Internal(format!("writer task panicked: {}", e)))?;

        match (stream_err, written) {
            (Some(e), _) => Err(e),
            (None, Err(io)) => Err(ModelError::Io(io)),
            (None, Ok(ok)) => Ok(ok),
        }
    }
}
