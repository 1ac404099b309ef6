use crate::{
    errors::ControllerError, resource_key::ResourceKey, sync_handler::SyncHandler,
    work_queue::Operation,
};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;

pub(crate) fn pod_phase(pod: &Pod) -> &str {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or("Unknown")
}

/// Logs the lifecycle of the pods.
pub(crate) struct PodHandler;

#[async_trait]
impl SyncHandler<Pod> for PodHandler {
    async fn sync(
        &self,
        key: &ResourceKey,
        operation: Operation,
        current: Option<&Pod>,
        prior: Option<&Pod>,
    ) -> Result<(), ControllerError> {
        match current {
            Some(pod) => match prior.map(pod_phase) {
                Some(previous) if previous != pod_phase(pod) => info!(
                    "pod {} ({}) phase changed from {} to {}",
                    key,
                    operation,
                    previous,
                    pod_phase(pod)
                ),
                _ => info!("pod {} ({}) phase: {}", key, operation, pod_phase(pod)),
            },
            None => info!("pod {} is removed", key),
        }
        Ok(())
    }
}
