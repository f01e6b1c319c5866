//! The GPU task contract.

use std::future::Future;

use async_trait::async_trait;
use tokio::sync::watch;
use vgate_models::{JobId, JobPayload};

/// The opaque unit of GPU work.
///
/// Returns the artifact reference on success and an error detail on failure.
/// `cancel` flips to `true` when the job is cancelled or times out; a
/// well-behaved capability stops promptly and returns an error.
#[async_trait]
pub trait WorkerCapability: Send + Sync {
    async fn execute(
        &self,
        job_id: &JobId,
        payload: &JobPayload,
        cancel: watch::Receiver<bool>,
    ) -> Result<String, String>;

    fn name(&self) -> &str {
        "capability"
    }
}

/// Capability backed by a closure.
pub struct FnCapability<F> {
    name: String,
    f: F,
}

impl<F> FnCapability<F> {
    pub fn new<Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(JobId, JobPayload, watch::Receiver<bool>) -> Fut + Send + Sync,
        Fut: Future<Output = Result<String, String>> + Send,
    {
        Self { name: name.into(), f }
    }
}

#[async_trait]
impl<F, Fut> WorkerCapability for FnCapability<F>
where
    F: Fn(JobId, JobPayload, watch::Receiver<bool>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<String, String>> + Send,
{
    async fn execute(
        &self,
        job_id: &JobId,
        payload: &JobPayload,
        cancel: watch::Receiver<bool>,
    ) -> Result<String, String> {
        (self.f)(job_id.clone(), payload.clone(), cancel).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}
