//! The semantic-index seam.
//!
//! The index itself is an external collaborator that is not safe under
//! concurrent writes, so all writes funnel through one serial
//! [`IndexWriteQueue`] task with a retry policy and a circuit breaker.
//! Reads bypass the queue; while the breaker is open the index is
//! considered stale and reads return empty, which every caller must
//! tolerate.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::breaker::CircuitBreaker;
use crate::retry::RetryPolicy;

/// Errors from the index collaborator.
#[derive(Debug, Clone, Error)]
pub enum IndexError {
    /// The payload itself is unacceptable; retrying cannot help.
    #[error("index validation error: {0}")]
    Validation(String),
    /// The collaborator is unreachable or overloaded; a retry may work.
    #[error("index unavailable: {0}")]
    Unavailable(String),
}

impl IndexError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// One retrieval hit.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub key: String,
    pub score: f32,
    pub text: String,
    pub metadata: Value,
}

/// Capability for semantic storage and retrieval.
#[async_trait]
pub trait SemanticIndex: Send + Sync {
    async fn upsert(&self, key: &str, text: &str, metadata: Value) -> Result<(), IndexError>;
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>, IndexError>;
    async fn remove(&self, key: &str) -> Result<(), IndexError>;
}

/// Result shape for best-effort side-channel writes. The caller decides
/// whether a degraded write matters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BestEffort<T> {
    Completed(T),
    Degraded { reason: String },
}

impl<T> BestEffort<T> {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    /// Promote to a hard result.
    pub fn into_result(self) -> anyhow::Result<T> {
        match self {
            Self::Completed(value) => Ok(value),
            Self::Degraded { reason } => Err(anyhow::anyhow!("best-effort write degraded: {reason}")),
        }
    }
}

enum WriteOp {
    Upsert {
        key: String,
        text: String,
        metadata: Value,
    },
    Remove {
        key: String,
    },
}

struct WriteJob {
    op: WriteOp,
    ack: oneshot::Sender<Result<(), String>>,
}

/// The process-wide serial write path to the semantic index.
#[derive(Clone)]
pub struct IndexWriteQueue {
    index: Arc<dyn SemanticIndex>,
    tx: mpsc::Sender<WriteJob>,
    stale: Arc<AtomicBool>,
}

impl IndexWriteQueue {
    /// Start the writer task. `policy` governs per-operation retries; the
    /// breaker opens after three consecutive exhausted operations and
    /// holds for sixty seconds.
    pub fn start(index: Arc<dyn SemanticIndex>, policy: RetryPolicy) -> Self {
        let (tx, mut rx) = mpsc::channel::<WriteJob>(256);
        let stale = Arc::new(AtomicBool::new(false));

        let worker_index = Arc::clone(&index);
        let worker_stale = Arc::clone(&stale);
        tokio::spawn(async move {
            let mut breaker = CircuitBreaker::new(3, Duration::from_secs(60));
            while let Some(job) = rx.recv().await {
                let result = if !breaker.allow_request() {
                    Err("circuit open; index is stale".to_string())
                } else {
                    let outcome = policy
                        .run(IndexError::is_retryable, || async {
                            match &job.op {
                                WriteOp::Upsert { key, text, metadata } => {
                                    worker_index.upsert(key, text, metadata.clone()).await
                                }
                                WriteOp::Remove { key } => worker_index.remove(key).await,
                            }
                        })
                        .await;
                    match outcome {
                        Ok(()) => {
                            breaker.record_success();
                            worker_stale.store(false, Ordering::Relaxed);
                            Ok(())
                        }
                        Err(err) => {
                            breaker.record_failure();
                            if breaker.is_open() {
                                worker_stale.store(true, Ordering::Relaxed);
                                tracing::warn!(error = %err, "index breaker opened; marking stale");
                            }
                            Err(err.to_string())
                        }
                    }
                };
                let _ = job.ack.send(result);
            }
        });

        Self { index, tx, stale }
    }

    /// Whether the breaker has marked the index stale.
    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::Relaxed)
    }

    async fn submit(&self, op: WriteOp) -> BestEffort<()> {
        let (ack, done) = oneshot::channel();
        if self.tx.send(WriteJob { op, ack }).await.is_err() {
            return BestEffort::Degraded {
                reason: "index write queue is gone".to_string(),
            };
        }
        match done.await {
            Ok(Ok(())) => BestEffort::Completed(()),
            Ok(Err(reason)) => BestEffort::Degraded { reason },
            Err(_) => BestEffort::Degraded {
                reason: "index writer dropped the job".to_string(),
            },
        }
    }

    /// Best-effort upsert: degraded results carry the reason, callers
    /// choose whether to care.
    pub async fn upsert(&self, key: &str, text: &str, metadata: Value) -> BestEffort<()> {
        self.submit(WriteOp::Upsert {
            key: key.to_owned(),
            text: text.to_owned(),
            metadata,
        })
        .await
    }

    /// Upsert that propagates failure to the caller.
    pub async fn upsert_strict(&self, key: &str, text: &str, metadata: Value) -> anyhow::Result<()> {
        self.upsert(key, text, metadata).await.into_result()
    }

    /// Best-effort removal.
    pub async fn remove(&self, key: &str) -> BestEffort<()> {
        self.submit(WriteOp::Remove {
            key: key.to_owned(),
        })
        .await
    }

    /// Read path: goes straight to the index (reads are concurrent-safe).
    /// A stale index answers empty rather than failing the caller.
    pub async fn search(&self, query: &str, limit: usize) -> Vec<SearchHit> {
        if self.is_stale() {
            tracing::debug!("index stale; semantic search answering empty");
            return Vec::new();
        }
        match self.index.search(query, limit).await {
            Ok(hits) => hits,
            Err(err) => {
                tracing::warn!(error = %err, "semantic search failed; answering empty");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicU32;

    /// Fake index that fails the first `failures` upserts.
    struct FlakyIndex {
        failures: AtomicU32,
        stored: Mutex<Vec<String>>,
        validation: bool,
    }

    impl FlakyIndex {
        fn new(failures: u32) -> Self {
            Self {
                failures: AtomicU32::new(failures),
                stored: Mutex::new(Vec::new()),
                validation: false,
            }
        }

        fn validation_failures(failures: u32) -> Self {
            Self {
                validation: true,
                ..Self::new(failures)
            }
        }
    }

    #[async_trait]
    impl SemanticIndex for FlakyIndex {
        async fn upsert(&self, key: &str, _text: &str, _metadata: Value) -> Result<(), IndexError> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return if self.validation {
                    Err(IndexError::Validation("bad payload".into()))
                } else {
                    Err(IndexError::Unavailable("down".into()))
                };
            }
            self.stored.lock().unwrap().push(key.to_owned());
            Ok(())
        }

        async fn search(&self, _query: &str, _limit: usize) -> Result<Vec<SearchHit>, IndexError> {
            Ok(self
                .stored
                .lock()
                .unwrap()
                .iter()
                .map(|key| SearchHit {
                    key: key.clone(),
                    score: 1.0,
                    text: String::new(),
                    metadata: Value::Null,
                })
                .collect())
        }

        async fn remove(&self, _key: &str) -> Result<(), IndexError> {
            Ok(())
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter: 0.0,
        }
    }

    #[tokio::test]
    async fn transient_failures_are_retried_away() {
        let index = Arc::new(FlakyIndex::new(2));
        let queue = IndexWriteQueue::start(index.clone(), fast_policy());

        let result = queue.upsert("k1", "text", Value::Null).await;
        assert!(result.is_completed());
        assert_eq!(index.stored.lock().unwrap().len(), 1);
        assert!(!queue.is_stale());
    }

    #[tokio::test]
    async fn validation_errors_abort_without_retry() {
        let index = Arc::new(FlakyIndex::validation_failures(1));
        let queue = IndexWriteQueue::start(index.clone(), fast_policy());

        let result = queue.upsert("k1", "text", Value::Null).await;
        assert!(!result.is_completed());
        // The single budgeted failure was consumed without retries.
        assert_eq!(index.failures.load(Ordering::SeqCst), 0);
        assert!(index.stored.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn breaker_marks_the_index_stale() {
        // Enough failures that three whole operations exhaust their retries.
        let index = Arc::new(FlakyIndex::new(100));
        let queue = IndexWriteQueue::start(index, fast_policy());

        for _ in 0..3 {
            let result = queue.upsert("k", "text", Value::Null).await;
            assert!(!result.is_completed());
        }
        assert!(queue.is_stale());

        // Stale reads answer empty instead of erroring.
        assert!(queue.search("anything", 5).await.is_empty());
    }

    #[tokio::test]
    async fn strict_submission_propagates() {
        let index = Arc::new(FlakyIndex::validation_failures(1));
        let queue = IndexWriteQueue::start(index, fast_policy());
        assert!(queue.upsert_strict("k", "t", Value::Null).await.is_err());
    }
}
