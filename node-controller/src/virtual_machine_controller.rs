use crate::{
    MANAGER, errors::ControllerError, resource_key::ResourceKey, sync_handler::SyncHandler,
    work_queue::Operation,
};
use async_trait::async_trait;
use kube::{
    Api, Client,
    api::{Patch, PatchParams},
};
use node_controller_apis::{PHASE_RUNNING, VirtualMachine};
use std::sync::Arc;

/// Writes the status of [`VirtualMachine`] objects.
#[async_trait]
pub(crate) trait StatusWriter: Send + Sync {
    async fn set_phase(&self, key: &ResourceKey, phase: &str) -> Result<(), ControllerError>;
}

/// [`StatusWriter`] merge-patching the status subresource.
pub(crate) struct KubeStatusWriter {
    client: Client,
}

impl KubeStatusWriter {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl StatusWriter for KubeStatusWriter {
    async fn set_phase(&self, key: &ResourceKey, phase: &str) -> Result<(), ControllerError> {
        let namespace = key.namespace.as_deref().ok_or_else(|| {
            ControllerError::MalformedKey(format!("virtual machine {} without namespace", key))
        })?;
        let api: Api<VirtualMachine> = Api::namespaced(self.client.clone(), namespace);
        let mut pp = PatchParams::default();
        pp.field_manager = Some(MANAGER.to_string());
        let patch = serde_json::json!({
            "status": {
                "phase": phase,
            }
        });
        api.patch_status(key.name.as_str(), &pp, &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

pub(crate) struct VirtualMachineHandler {
    status: Arc<dyn StatusWriter>,
}

impl VirtualMachineHandler {
    pub fn new(status: Arc<dyn StatusWriter>) -> Self {
        Self { status }
    }
}

#[async_trait]
impl SyncHandler<VirtualMachine> for VirtualMachineHandler {
    async fn adopt(
        &self,
        key: &ResourceKey,
        current: &VirtualMachine,
    ) -> Result<(), ControllerError> {
        if current.phase().is_none() {
            self.status.set_phase(key, PHASE_RUNNING).await?;
            info!("virtual machine {} adopted, phase set to {}", key, PHASE_RUNNING);
        }
        Ok(())
    }

    async fn sync(
        &self,
        key: &ResourceKey,
        operation: Operation,
        current: Option<&VirtualMachine>,
        _prior: Option<&VirtualMachine>,
    ) -> Result<(), ControllerError> {
        match current {
            Some(vm) => info!(
                "virtual machine {} ({}) phase: {}, ready: {}",
                key,
                operation,
                vm.phase().unwrap_or("<unset>"),
                vm.condition("Ready")
                    .map_or("Unknown", |c| c.status.as_str())
            ),
            None => info!("virtual machine {} is removed", key),
        }
        Ok(())
    }
}
