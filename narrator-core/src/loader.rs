use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use hf_hub::api::tokio::Api;
use tokio::sync::OnceCell;
use tracing::{error, warn};

use crate::loader_factory::ModelVariant;
use crate::{CaptionModel, DeviceMap};

/// Loads one concrete captioning model family from the hub.
pub trait Loader {
    type Model: CaptionModel;

    fn load(
        variant: ModelVariant,
        api: Api,
        device_map: DeviceMap,
    ) -> impl Future<Output = Result<Self::Model>>
    where
        Self: Sized;
}

/// Shared handle to the captioning model.
///
/// `Unavailable` is the terminal sentinel: acquisition failed for the
/// lifetime of the process and every caption request must short-circuit.
/// Once `Ready`, the model is shared read-only and never reloaded.
#[derive(Clone)]
pub enum ModelHandle {
    Ready(Arc<dyn CaptionModel>),
    Unavailable,
}

impl ModelHandle {
    pub fn is_ready(&self) -> bool {
        matches!(self, ModelHandle::Ready(_))
    }
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelHandle::Ready(_) => f.write_str("ModelHandle::Ready"),
            ModelHandle::Unavailable => f.write_str("ModelHandle::Unavailable"),
        }
    }
}

/// Fixed-interval retry for model acquisition.
///
/// Transient and permanent failures are deliberately not told apart; both
/// burn the same attempt budget before the sentinel is handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Runs `attempt` up to `max_attempts` times, sleeping `delay` between
    /// failures. Each failure emits one warning with the attempt count and
    /// the underlying error. Acquisition errors never escape: exhausting
    /// the budget yields the `Unavailable` sentinel.
    pub async fn acquire<F, Fut>(&self, mut attempt: F) -> ModelHandle
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Arc<dyn CaptionModel>>>,
    {
        for n in 1..=self.max_attempts {
            match attempt().await {
                Ok(model) => return ModelHandle::Ready(model),
                Err(e) => {
                    warn!(
                        attempt = n,
                        max_attempts = self.max_attempts,
                        "model acquisition failed: {e:#}"
                    );
                    if n < self.max_attempts {
                        tokio::time::sleep(self.delay).await;
                    }
                }
            }
        }
        error!(
            "model acquisition failed after {} attempts; captioning is disabled until restart",
            self.max_attempts
        );
        ModelHandle::Unavailable
    }
}

/// One-time acquisition guard.
///
/// Under concurrent first access the retried load runs at most once and
/// every caller observes the same handle, ready or sentinel. Callers never
/// re-trigger loading; a permanent failure sticks until restart.
#[derive(Default)]
pub struct ModelCell {
    cell: OnceCell<ModelHandle>,
}

impl ModelCell {
    pub fn new() -> Self {
        Self {
            cell: OnceCell::new(),
        }
    }

    /// A cell already holding a handle; useful where acquisition happened
    /// elsewhere (and in tests).
    pub fn preloaded(handle: ModelHandle) -> Self {
        Self {
            cell: OnceCell::new_with(Some(handle)),
        }
    }

    pub fn get(&self) -> Option<&ModelHandle> {
        self.cell.get()
    }

    pub async fn get_or_acquire<F, Fut>(&self, policy: RetryPolicy, attempt: F) -> &ModelHandle
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Arc<dyn CaptionModel>>>,
    {
        self.cell
            .get_or_init(|| async move { policy.acquire(attempt).await })
            .await
    }
}
