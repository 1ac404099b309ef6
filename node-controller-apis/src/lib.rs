use std::collections::BTreeMap;

use kube::CustomResource;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const API_GROUP: &'static str = "nodecontroller.k8s.io";

/// The lifecycle phase assigned to newly observed [`VirtualMachine`] objects.
pub const PHASE_RUNNING: &'static str = "Running";

/// A virtual machine managed by the node controller.
///
/// The shape follows the core `Node` resource: the spec describes how the machine
/// is scheduled, the status is populated by the controller and the machine agents.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Default)]
#[kube(
    group = "nodecontroller.k8s.io",
    version = "v1alpha1",
    kind = "VirtualMachine",
    derive = "PartialEq",
    status = "VirtualMachineStatus",
    namespaced,
    printcolumn = r#"{
        "name":"Phase",
        "type": "string",
        "jsonPath": ".status.phase",
        "description": "The lifecycle phase of the virtual machine."
    }"#
)]
pub struct VirtualMachineSpec {
    /// The pod IP range assigned to the virtual machine.
    #[serde(rename = "podCIDR", skip_serializing_if = "Option::is_none")]
    pub pod_cidr: Option<String>,
    /// ID of the machine assigned by the cloud provider in the format `<ProviderName>://<ProviderSpecificID>`.
    #[serde(rename = "providerID", skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    /// Controls schedulability of new pods, by default the machine is schedulable.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub unschedulable: bool,
    /// The machine's taints.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub taints: Vec<Taint>,
}

/// A taint attached to a virtual machine.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, JsonSchema)]
pub struct Taint {
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// One of `NoSchedule`, `PreferNoSchedule` or `NoExecute`.
    pub effect: String,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, JsonSchema)]
pub struct VirtualMachineCondition {
    #[serde(rename = "type")]
    pub type_: String,
    /// status of the condition, one of True, False, Unknown.
    pub status: String,
    #[serde(rename = "lastHeartbeatTime", skip_serializing_if = "Option::is_none")]
    pub last_heartbeat_time: Option<String>,
    #[serde(rename = "lastTransitionTime", skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, JsonSchema)]
pub struct VirtualMachineAddress {
    #[serde(rename = "type")]
    pub type_: String,
    pub address: String,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Default, JsonSchema)]
pub struct VirtualMachineStatus {
    /// Total resources of the machine, keyed by resource name (`cpu`, `memory`, ...).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capacity: Option<BTreeMap<String, String>>,
    /// Resources available for scheduling.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allocatable: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<VirtualMachineCondition>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub addresses: Option<Vec<VirtualMachineAddress>>,
}

impl VirtualMachine {
    /// The current phase, `None` if not yet assigned (missing or empty).
    pub fn phase(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .filter(|p| !p.is_empty())
    }

    pub fn condition(&self, type_: &str) -> Option<&VirtualMachineCondition> {
        self.status
            .as_ref()
            .and_then(|s| s.conditions.as_ref())
            .and_then(|c| c.iter().find(|c| c.type_ == type_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;

    fn vm(phase: Option<&str>) -> VirtualMachine {
        VirtualMachine {
            metadata: ObjectMeta {
                name: Some("foo".to_string()),
                namespace: Some("ns".to_string()),
                ..Default::default()
            },
            spec: Default::default(),
            status: phase.map(|p| VirtualMachineStatus {
                phase: Some(p.to_string()),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn spec_serialization() {
        let spec = VirtualMachineSpec {
            pod_cidr: Some("10.0.0.0/24".to_string()),
            ..Default::default()
        };
        assert_eq!(
            r#"{"podCIDR":"10.0.0.0/24"}"#,
            serde_json::to_string(&spec).unwrap()
        );
        let spec = VirtualMachineSpec {
            unschedulable: true,
            ..Default::default()
        };
        assert_eq!(
            r#"{"unschedulable":true}"#,
            serde_json::to_string(&spec).unwrap()
        );
    }

    #[test]
    fn phase() {
        assert_eq!(None, vm(None).phase());
        assert_eq!(None, vm(Some("")).phase());
        assert_eq!(Some(PHASE_RUNNING), vm(Some(PHASE_RUNNING)).phase());
    }

    #[test]
    fn condition() {
        let mut obj = vm(Some(PHASE_RUNNING));
        if let Some(status) = obj.status.as_mut() {
            status.conditions = Some(vec![VirtualMachineCondition {
                type_: "Ready".to_string(),
                status: "True".to_string(),
                last_heartbeat_time: None,
                last_transition_time: None,
                reason: None,
                message: None,
            }]);
        }
        assert_eq!(
            Some("True"),
            obj.condition("Ready").map(|c| c.status.as_str())
        );
        assert!(obj.condition("DiskPressure").is_none());
    }
}
