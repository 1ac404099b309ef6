use crate::{errors::ControllerError, resource_key::ResourceKey, work_queue::Operation};
use async_trait::async_trait;

/// Resource kind specific reconciliation logic plugged into the reconcile engine.
///
/// Handlers are level-triggered: `current` is the latest cached state at dispatch
/// time (`None` if the object does no longer exist), intermediate states might have
/// been skipped. Both methods must be safe to re-run, a failed item is retried.
#[async_trait]
pub(crate) trait SyncHandler<K>: Send + Sync
where
    K: Send + Sync + 'static,
{
    /// One-time adoption of a newly observed object, runs before [`SyncHandler::sync`]
    /// for `Add` notifications.
    async fn adopt(&self, _key: &ResourceKey, _current: &K) -> Result<(), ControllerError> {
        Ok(())
    }

    async fn sync(
        &self,
        key: &ResourceKey,
        operation: Operation,
        current: Option<&K>,
        prior: Option<&K>,
    ) -> Result<(), ControllerError>;
}
