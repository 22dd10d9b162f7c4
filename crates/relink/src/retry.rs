use async_trait::async_trait;
use relink_core::error::ApiError;
use relink_core::model::{Block, BlockBody, Document};
use relink_core::service::ContentAccess;
use std::future::Future;
use std::time::Duration;

/// Single retry/backoff policy shared by every call site of a collaborator,
/// instead of ad hoc retry loops scattered per call.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    /// Run `op`, retrying transient failures with exponential backoff.
    /// Permanent failures return immediately.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, ApiError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Err(ApiError::Transient(msg)) if attempt + 1 < self.max_attempts => {
                    let delay = self.base_delay * 2u32.saturating_pow(attempt);
                    tracing::warn!(%msg, attempt, delay_ms = delay.as_millis() as u64, "transient failure; backing off");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

/// Content-access wrapper applying one [`RetryPolicy`] uniformly, so the
/// engine above it sees transient failures only after the budget is spent.
pub struct Retrying<C> {
    inner: C,
    policy: RetryPolicy,
}

impl<C> Retrying<C> {
    pub fn new(inner: C, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl<C: ContentAccess> ContentAccess for Retrying<C> {
    async fn get_content_tree(&self, document_id: &str) -> Result<Document, ApiError> {
        self.policy
            .run(|| self.inner.get_content_tree(document_id))
            .await
    }

    async fn update_container(&self, container_id: &str, body: BlockBody) -> Result<(), ApiError> {
        self.policy
            .run(|| self.inner.update_container(container_id, body.clone()))
            .await
    }

    async fn append_siblings(
        &self,
        parent_id: &str,
        containers: Vec<Block>,
    ) -> Result<(), ApiError> {
        self.policy
            .run(|| self.inner.append_siblings(parent_id, containers.clone()))
            .await
    }

    async fn target_exists(&self, document_id: &str) -> Result<bool, ApiError> {
        self.policy
            .run(|| self.inner.target_exists(document_id))
            .await
    }
}
