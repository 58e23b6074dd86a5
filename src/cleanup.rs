//! Bounded worker pool for best-effort storage cleanup.
//!
//! A fixed number of workers drain one bounded queue. Submitting to a full
//! queue fails immediately rather than spawning more work, so a burst of
//! profile edits cannot fan out into unbounded outbound requests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};

/// Per-request timeout for storage calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

const PUBLIC_OBJECT_PREFIX: &str = "/storage/v1/object/public/";

#[derive(Debug, thiserror::Error)]
pub enum CleanupError {
    #[error("cleanup queue is full")]
    QueueFull,
    #[error("cleanup pool is shut down")]
    Closed,
    #[error("storage is not configured")]
    NotConfigured,
    #[error("storage request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("storage returned status {0}")]
    Status(u16),
}

/// Storage API that uploaded objects live in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageTarget {
    pub base_url: String,
    pub service_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupJob {
    DeleteStoredObject { bucket: String, path: String },
}

impl CleanupJob {
    /// Parse `{base}/storage/v1/object/public/{bucket}/{path}`.
    /// Returns None for URLs outside the storage API or without a path.
    pub fn from_public_url(base_url: &str, url: &str) -> Option<Self> {
        let prefix = format!("{}{}", base_url.trim_end_matches('/'), PUBLIC_OBJECT_PREFIX);
        let key = url.strip_prefix(&prefix)?;
        let (bucket, path) = key.split_once('/')?;
        if bucket.is_empty() || path.is_empty() {
            return None;
        }
        Some(CleanupJob::DeleteStoredObject {
            bucket: bucket.to_string(),
            path: path.to_string(),
        })
    }
}

#[derive(Default)]
struct Counters {
    completed: AtomicU64,
    failures: AtomicU64,
}

#[derive(Clone)]
pub struct CleanupPool {
    tx: mpsc::Sender<CleanupJob>,
    // Keeps the queue open even when no worker holds it.
    _rx: Arc<Mutex<mpsc::Receiver<CleanupJob>>>,
    counters: Arc<Counters>,
}

impl CleanupPool {
    /// Spawn `workers` tasks sharing a queue of depth `queue`.
    pub fn spawn(
        workers: usize,
        queue: usize,
        target: Option<StorageTarget>,
    ) -> Result<Self, CleanupError> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        let (tx, rx) = mpsc::channel(queue.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let counters = Arc::new(Counters::default());
        let target = target.map(Arc::new);

        for worker in 0..workers {
            let rx = rx.clone();
            let counters = counters.clone();
            let client = client.clone();
            let target = target.clone();
            tokio::spawn(async move {
                loop {
                    // Hold the receiver lock only while waiting for the next job.
                    let job = { rx.lock().await.recv().await };
                    let Some(job) = job else { break };

                    match run_job(&client, target.as_deref(), &job).await {
                        Ok(()) => {
                            counters.completed.fetch_add(1, Ordering::Relaxed);
                            tracing::debug!(worker, job = ?job, "Cleanup job done");
                        }
                        Err(e) => {
                            counters.failures.fetch_add(1, Ordering::Relaxed);
                            tracing::warn!(worker, job = ?job, error = %e, "Cleanup job failed");
                        }
                    }
                }
            });
        }

        Ok(Self {
            tx,
            _rx: rx,
            counters,
        })
    }

    pub fn submit(&self, job: CleanupJob) -> Result<(), CleanupError> {
        self.tx.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => CleanupError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => CleanupError::Closed,
        })
    }

    pub fn completed(&self) -> u64 {
        self.counters.completed.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.counters.failures.load(Ordering::Relaxed)
    }
}

async fn run_job(
    client: &reqwest::Client,
    target: Option<&StorageTarget>,
    job: &CleanupJob,
) -> Result<(), CleanupError> {
    let target = target.ok_or(CleanupError::NotConfigured)?;
    match job {
        CleanupJob::DeleteStoredObject { bucket, path } => {
            let url = format!(
                "{}/storage/v1/object/{}/{}",
                target.base_url.trim_end_matches('/'),
                bucket,
                path
            );
            let resp = client
                .delete(&url)
                .bearer_auth(&target.service_key)
                .header("apikey", &target.service_key)
                .send()
                .await?;
            if !resp.status().is_success() {
                return Err(CleanupError::Status(resp.status().as_u16()));
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::Path, http::HeaderMap, http::StatusCode, routing::delete, Router};
    use std::sync::Mutex as StdMutex;

    type Seen = Arc<StdMutex<Vec<(String, String, String)>>>;

    async fn fake_storage(status: StatusCode) -> (String, Seen) {
        let seen: Seen = Arc::default();
        let record = seen.clone();
        let app = Router::new().route(
            "/storage/v1/object/{*key}",
            delete(move |Path(key): Path<String>, headers: HeaderMap| {
                let record = record.clone();
                async move {
                    let header = |name: &str| {
                        headers
                            .get(name)
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or_default()
                            .to_string()
                    };
                    record
                        .lock()
                        .unwrap()
                        .push((key, header("authorization"), header("apikey")));
                    status
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}", addr), seen)
    }

    async fn wait_for(pool: &CleanupPool, total: u64) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while pool.completed() + pool.failures() < total {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("jobs finished in time");
    }

    #[test]
    fn test_parse_public_url() {
        let job = CleanupJob::from_public_url(
            "https://proj.example.co/",
            "https://proj.example.co/storage/v1/object/public/avatars/u/1/me.png",
        );
        assert_eq!(
            job,
            Some(CleanupJob::DeleteStoredObject {
                bucket: "avatars".into(),
                path: "u/1/me.png".into(),
            })
        );
    }

    #[test]
    fn test_parse_rejects_foreign_urls() {
        let base = "https://proj.example.co";
        assert!(CleanupJob::from_public_url(base, "https://cdn.other/x.png").is_none());
        assert!(CleanupJob::from_public_url(
            base,
            "https://proj.example.co/storage/v1/object/public/avatars"
        )
        .is_none());
        assert!(CleanupJob::from_public_url(
            base,
            "https://proj.example.co/storage/v1/object/public//x.png"
        )
        .is_none());
    }

    #[tokio::test]
    async fn test_job_deletes_with_service_key() {
        let (base, seen) = fake_storage(StatusCode::OK).await;
        let pool = CleanupPool::spawn(
            2,
            4,
            Some(StorageTarget {
                base_url: base,
                service_key: "svc".into(),
            }),
        )
        .unwrap();

        pool.submit(CleanupJob::DeleteStoredObject {
            bucket: "avatars".into(),
            path: "u/1/old.png".into(),
        })
        .unwrap();
        wait_for(&pool, 1).await;

        assert_eq!(pool.completed(), 1);
        assert_eq!(pool.failures(), 0);
        let seen = seen.lock().unwrap();
        assert_eq!(
            seen.as_slice(),
            &[(
                "avatars/u/1/old.png".to_string(),
                "Bearer svc".to_string(),
                "svc".to_string()
            )]
        );
    }

    #[tokio::test]
    async fn test_error_status_is_counted_as_failure() {
        let (base, _seen) = fake_storage(StatusCode::FORBIDDEN).await;
        let pool = CleanupPool::spawn(
            1,
            4,
            Some(StorageTarget {
                base_url: base,
                service_key: "svc".into(),
            }),
        )
        .unwrap();
        pool.submit(CleanupJob::DeleteStoredObject {
            bucket: "b".into(),
            path: "p".into(),
        })
        .unwrap();
        wait_for(&pool, 1).await;
        assert_eq!(pool.failures(), 1);
    }

    #[tokio::test]
    async fn test_unconfigured_pool_fails_jobs() {
        let pool = CleanupPool::spawn(1, 4, None).unwrap();
        pool.submit(CleanupJob::DeleteStoredObject {
            bucket: "b".into(),
            path: "p".into(),
        })
        .unwrap();
        wait_for(&pool, 1).await;
        assert_eq!(pool.failures(), 1);
        assert_eq!(pool.completed(), 0);
    }

    #[tokio::test]
    async fn test_full_queue_rejects_submit() {
        // No workers: nothing drains the queue.
        let pool = CleanupPool::spawn(0, 2, None).unwrap();
        let job = CleanupJob::DeleteStoredObject {
            bucket: "b".into(),
            path: "p".into(),
        };
        pool.submit(job.clone()).unwrap();
        pool.submit(job.clone()).unwrap();
        assert!(matches!(pool.submit(job), Err(CleanupError::QueueFull)));
    }
}
