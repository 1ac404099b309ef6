use crate::{
    alerts::AlertStore, errors::ControllerError, resource_key::ResourceKey,
    sync_handler::SyncHandler, work_queue::Operation,
};
use async_trait::async_trait;
use k8s_openapi::{
    api::core::v1::{Node, NodeCondition, Pod},
    apimachinery::pkg::api::resource::Quantity,
};
use std::{collections::HashSet, sync::Arc};

pub(crate) const NODE_LOST_DESCRIPTION: &'static str =
    "worker node lost contact with the cluster";

const NODE_READY: &'static str = "Ready";

fn conditions(node: &Node) -> &[NodeCondition] {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_deref())
        .unwrap_or_default()
}

/// Status of the node's `Ready` condition, `Unknown` if it is not reported.
pub(crate) fn ready_status(node: &Node) -> &str {
    conditions(node)
        .iter()
        .find(|c| c.type_ == NODE_READY)
        .map(|c| c.status.as_str())
        .unwrap_or("Unknown")
}

fn is_schedulable(node: &Node) -> bool {
    !node
        .spec
        .as_ref()
        .and_then(|s| s.unschedulable)
        .unwrap_or(false)
}

/// A condition whose status changed between two snapshots of a node.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct ConditionTransition<'a> {
    pub type_: &'a str,
    /// `None` if the condition was not reported before.
    pub from: Option<&'a str>,
    pub to: &'a str,
}

pub(crate) fn condition_transitions<'a>(
    prior: &'a Node,
    current: &'a Node,
) -> Vec<ConditionTransition<'a>> {
    conditions(current)
        .iter()
        .filter_map(|c| {
            let from = conditions(prior)
                .iter()
                .find(|p| p.type_ == c.type_)
                .map(|p| p.status.as_str());
            if from == Some(c.status.as_str()) {
                None
            } else {
                Some(ConditionTransition {
                    type_: &c.type_,
                    from,
                    to: &c.status,
                })
            }
        })
        .collect()
}

/// Watches the worker nodes and raises an alert for every node which is gone.
pub(crate) struct NodeHandler {
    alerts: Arc<dyn AlertStore>,
}

impl NodeHandler {
    pub fn new(alerts: Arc<dyn AlertStore>) -> Self {
        Self { alerts }
    }
}

#[async_trait]
impl SyncHandler<Node> for NodeHandler {
    async fn sync(
        &self,
        key: &ResourceKey,
        operation: Operation,
        current: Option<&Node>,
        prior: Option<&Node>,
    ) -> Result<(), ControllerError> {
        match current {
            Some(node) => {
                info!("node {} ({}) ready: {}", key, operation, ready_status(node));
                if let (Operation::Update, Some(prior)) = (operation, prior) {
                    for t in condition_transitions(prior, node) {
                        info!(
                            "node {} condition {} changed from {} to {}",
                            key,
                            t.type_,
                            t.from.unwrap_or("<none>"),
                            t.to
                        );
                    }
                }
            }
            None => {
                if self.alerts.record(&key.name, NODE_LOST_DESCRIPTION).await? {
                    warn!("node {} is gone, alert recorded", key);
                } else {
                    debug!("node {} is gone, alert already pending", key);
                }
            }
        }
        Ok(())
    }
}

/// Parse a Kubernetes quantity (e.g. `250m`, `4`, `16Gi`, `1e3`) into base units.
pub(crate) fn parse_quantity(quantity: &Quantity) -> Option<f64> {
    let s = quantity.0.trim();
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '+' || c == '-'))
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(split);
    let number: f64 = number.parse().ok()?;
    let multiplier = match suffix {
        "" => 1.0,
        "n" => 1e-9,
        "u" => 1e-6,
        "m" => 1e-3,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "E" => 1e18,
        "Ki" => 1024f64,
        "Mi" => 1024f64.powi(2),
        "Gi" => 1024f64.powi(3),
        "Ti" => 1024f64.powi(4),
        "Pi" => 1024f64.powi(5),
        "Ei" => 1024f64.powi(6),
        exp if exp.starts_with(['e', 'E']) => 10f64.powi(exp[1..].parse().ok()?),
        _ => return None,
    };
    Some(number * multiplier)
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub(crate) struct ResourceSummary {
    pub total: u64,
    pub used: u64,
}

/// Capacity overview over the cached nodes.
///
/// CPU is counted in cores and memory in GiB, both over nodes which are ready
/// and schedulable. `used` sums the resource requests of the active pods
/// scheduled on those nodes.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct NodeSummary {
    pub total: usize,
    pub ready: usize,
    pub schedulable: usize,
    pub cpu: ResourceSummary,
    pub memory: ResourceSummary,
}

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

#[derive(Default)]
struct Usage {
    millicores: f64,
    bytes: f64,
}

impl Usage {
    fn add(&mut self, resources: Option<&std::collections::BTreeMap<String, Quantity>>) {
        if let Some(resources) = resources {
            self.millicores += resources
                .get("cpu")
                .and_then(parse_quantity)
                .map(|v| (v * 1000.0).round())
                .unwrap_or(0.0);
            self.bytes += resources
                .get("memory")
                .and_then(parse_quantity)
                .unwrap_or(0.0);
        }
    }
}

impl NodeSummary {
    pub fn new<'a>(
        nodes: impl IntoIterator<Item = &'a Node>,
        pods: impl IntoIterator<Item = &'a Pod>,
    ) -> Self {
        let mut summary = NodeSummary::default();
        let mut available: HashSet<&str> = HashSet::new();
        let mut allocatable = Usage::default();
        for node in nodes {
            summary.total += 1;
            let ready = ready_status(node) == "True";
            let schedulable = is_schedulable(node);
            if ready {
                summary.ready += 1;
            }
            if schedulable {
                summary.schedulable += 1;
            }
            if ready && schedulable {
                if let Some(name) = node.metadata.name.as_deref() {
                    available.insert(name);
                }
                allocatable.add(node.status.as_ref().and_then(|s| s.allocatable.as_ref()));
            }
        }
        let mut requested = Usage::default();
        for pod in pods {
            let finished = matches!(
                pod.status.as_ref().and_then(|s| s.phase.as_deref()),
                Some("Failed") | Some("Succeeded")
            );
            let on_available_node = pod
                .spec
                .as_ref()
                .and_then(|s| s.node_name.as_deref())
                .map(|n| available.contains(n))
                .unwrap_or(false);
            if finished || pod.metadata.deletion_timestamp.is_some() || !on_available_node {
                continue;
            }
            for container in pod.spec.iter().flat_map(|s| s.containers.iter()) {
                requested.add(container.resources.as_ref().and_then(|r| r.requests.as_ref()));
            }
        }
        summary.cpu = ResourceSummary {
            total: (allocatable.millicores / 1000.0) as u64,
            used: (requested.millicores / 1000.0) as u64,
        };
        summary.memory = ResourceSummary {
            total: (allocatable.bytes / GIB) as u64,
            used: (requested.bytes / GIB) as u64,
        };
        summary
    }
}

impl std::fmt::Display for NodeSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "nodes: {} total, {} ready, {} schedulable; cpu: {}/{} cores; memory: {}/{} GiB",
            self.total,
            self.ready,
            self.schedulable,
            self.cpu.used,
            self.cpu.total,
            self.memory.used,
            self.memory.total
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::{AlertStatus, InMemoryAlertStore};
    use k8s_openapi::api::core::v1::{
        Container, NodeSpec, NodeStatus, PodSpec, PodStatus, ResourceRequirements,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    fn quantities(cpu: &str, memory: &str) -> BTreeMap<String, Quantity> {
        BTreeMap::from([
            ("cpu".to_string(), Quantity(cpu.to_string())),
            ("memory".to_string(), Quantity(memory.to_string())),
        ])
    }

    fn condition(type_: &str, status: &str) -> NodeCondition {
        NodeCondition {
            type_: type_.to_string(),
            status: status.to_string(),
            ..Default::default()
        }
    }

    fn node(name: &str, ready: &str, unschedulable: bool) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: Some(NodeSpec {
                unschedulable: Some(unschedulable),
                ..Default::default()
            }),
            status: Some(NodeStatus {
                allocatable: Some(quantities("4", "16Gi")),
                conditions: Some(vec![
                    condition("MemoryPressure", "False"),
                    condition(NODE_READY, ready),
                ]),
                ..Default::default()
            }),
        }
    }

    fn pod(node: &str, phase: &str, cpu: &str, memory: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(format!("pod-{}", cpu)),
                namespace: Some("ns".to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some(node.to_string()),
                containers: vec![Container {
                    name: "main".to_string(),
                    resources: Some(ResourceRequirements {
                        requests: Some(quantities(cpu, memory)),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn quantities_are_parsed() {
        let parse = |v: &str| parse_quantity(&Quantity(v.to_string()));
        assert_eq!(Some(0.25), parse("250m"));
        assert_eq!(Some(4.0), parse("4"));
        assert_eq!(Some(1.5), parse("1.5"));
        assert_eq!(Some(16.0 * 1024.0 * 1024.0 * 1024.0), parse("16Gi"));
        assert_eq!(Some(128.0 * 1024.0), parse("128Ki"));
        assert_eq!(Some(2e6), parse("2M"));
        assert_eq!(Some(1000.0), parse("1e3"));
        assert_eq!(None, parse("12XY"));
        assert_eq!(None, parse(""));
    }

    #[test]
    fn ready_condition() {
        assert_eq!("True", ready_status(&node("a", "True", false)));
        assert_eq!("False", ready_status(&node("a", "False", false)));
        assert_eq!("Unknown", ready_status(&Node::default()));
    }

    #[test]
    fn transitions_between_snapshots() {
        let prior = node("a", "True", false);
        let mut current = node("a", "False", false);
        current
            .status
            .as_mut()
            .unwrap()
            .conditions
            .as_mut()
            .unwrap()
            .push(condition("DiskPressure", "True"));
        let transitions = condition_transitions(&prior, &current);
        assert_eq!(
            vec![
                ConditionTransition {
                    type_: NODE_READY,
                    from: Some("True"),
                    to: "False",
                },
                ConditionTransition {
                    type_: "DiskPressure",
                    from: None,
                    to: "True",
                },
            ],
            transitions
        );
        assert!(condition_transitions(&prior, &prior).is_empty());
    }

    #[test]
    fn summary_over_ready_and_schedulable_nodes() {
        let nodes = vec![
            node("a", "True", false),
            node("b", "True", true),
            node("c", "False", false),
        ];
        let mut deleted = pod("a", "Running", "3", "8Gi");
        deleted.metadata.deletion_timestamp = Some(Time(Default::default()));
        let pods = vec![
            pod("a", "Running", "1500m", "2Gi"),
            pod("a", "Pending", "500m", "1Gi"),
            pod("a", "Succeeded", "1", "1Gi"),
            pod("b", "Running", "1", "1Gi"),
            deleted,
        ];
        let summary = NodeSummary::new(&nodes, &pods);
        assert_eq!(3, summary.total);
        assert_eq!(2, summary.ready);
        assert_eq!(2, summary.schedulable);
        assert_eq!(ResourceSummary { total: 4, used: 2 }, summary.cpu);
        assert_eq!(ResourceSummary { total: 16, used: 3 }, summary.memory);
    }

    #[tokio::test]
    async fn lost_node_is_alerted_once() {
        let alerts = Arc::new(InMemoryAlertStore::default());
        let handler = NodeHandler::new(alerts.clone());
        let key = ResourceKey::new(None, "worker-1");
        let last_known = node("worker-1", "True", false);

        handler
            .sync(&key, Operation::Delete, None, Some(&last_known))
            .await
            .unwrap();
        handler
            .sync(&key, Operation::Delete, None, Some(&last_known))
            .await
            .unwrap();

        let pending = alerts.pending().await.unwrap();
        assert_eq!(1, pending.len());
        assert_eq!("worker-1", pending[0].host_name);
        assert_eq!(NODE_LOST_DESCRIPTION, pending[0].description);
        assert_eq!(AlertStatus::Pending, pending[0].status);
    }

    #[tokio::test]
    async fn existing_node_is_not_alerted() {
        let alerts = Arc::new(InMemoryAlertStore::default());
        let handler = NodeHandler::new(alerts.clone());
        let key = ResourceKey::new(None, "worker-1");
        let prior = node("worker-1", "True", false);
        let current = node("worker-1", "False", false);
        handler
            .sync(&key, Operation::Update, Some(&current), Some(&prior))
            .await
            .unwrap();
        handler
            .sync(&key, Operation::Add, Some(&current), None)
            .await
            .unwrap();
        assert!(alerts.pending().await.unwrap().is_empty());
    }
}
