#[macro_use]
extern crate log;

use alerts::{AlertStore, InMemoryAlertStore, deliver_pending};
use configuration::{Configuration, env_var, metrics_addr};
use controller::Controller;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::{Client, Resource};
use node_controller::{NodeHandler, NodeSummary};
use node_controller_apis::VirtualMachine;
use observability::{ErrorSink, LogErrorSink};
use opentelemetry::global;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use pod_controller::PodHandler;
use prometheus_exporter::start_prometheus_metrics_server;
use resource_cache::ResourceCache;
use std::{sync::Arc, time::Duration};
use store_client::KubeStoreClient;
use tokio::{sync::watch, task::JoinSet};
use utils::stopped;
use virtual_machine_controller::{KubeStatusWriter, VirtualMachineHandler};

mod alerts;
mod change_notifier;
mod configuration;
mod controller;
mod errors;
mod node_controller;
mod observability;
mod pod_controller;
mod prometheus_exporter;
mod rate_limiter;
mod reconcile_engine;
mod resource_cache;
mod resource_key;
mod store_client;
mod sync_handler;
mod utils;
mod virtual_machine_controller;
mod work_queue;

/// The K8s field manager name.
const MANAGER: &'static str = "node-controller";

/// Interval of the node summary and alert delivery.
const REPORT_INTERVAL: Duration = Duration::from_secs(60);

fn spawn_controller<K>(
    controllers: &mut JoinSet<()>,
    controller: Controller<K>,
    stop: watch::Receiver<bool>,
) where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    controllers.spawn(async move {
        if let Err(e) = controller.run(stop).await {
            error!("{}", e);
        }
    });
}

fn error_sink(controller: &str) -> Arc<dyn ErrorSink> {
    Arc::new(LogErrorSink::new(controller))
}

/// Logs the node summary and delivers pending alerts until `stop` fires.
async fn report(
    nodes: ResourceCache<Node>,
    pods: ResourceCache<Pod>,
    alerts: Arc<dyn AlertStore>,
    mut stop: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(REPORT_INTERVAL);
    loop {
        tokio::select! {
            _ = interval.tick() => (),
            _ = stopped(&mut stop) => break,
        }
        if nodes.has_synced() && pods.has_synced() {
            let nodes = nodes.list();
            let pods = pods.list();
            let summary = NodeSummary::new(
                nodes.iter().map(|v| v.as_ref()),
                pods.iter().map(|v| v.as_ref()),
            );
            info!("{}", summary);
        }
        if let Err(e) = deliver_pending(alerts.as_ref()).await {
            warn!("failed to deliver alerts: {}", e);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    // Ignore the error if a provider is already installed.
    rustls::crypto::ring::default_provider()
        .install_default()
        .ok();
    let metrics_addr = metrics_addr(env_var)?;
    let registry = prometheus::Registry::new();
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .build()?;
    let meter_provider = SdkMeterProvider::builder().with_reader(exporter).build();
    global::set_meter_provider(meter_provider.clone());
    let metrics_server = start_prometheus_metrics_server(metrics_addr, registry);

    let client = Client::try_default().await?;
    let configuration = Configuration::new(client)?;
    let settings = configuration.controller;
    let alerts: Arc<dyn AlertStore> = Arc::new(InMemoryAlertStore::default());

    let nodes = Controller::new(
        "node",
        Box::new(KubeStoreClient::new(configuration.cluster_api::<Node>())),
        Arc::new(NodeHandler::new(alerts.clone())),
        settings,
        error_sink("node"),
    );
    let pods = Controller::new(
        "pod",
        Box::new(KubeStoreClient::new(configuration.namespaced_api::<Pod>())),
        Arc::new(PodHandler),
        settings,
        error_sink("pod"),
    );
    let status_writer = Arc::new(KubeStatusWriter::new(configuration.client.clone()));
    let virtual_machines = Controller::new(
        "virtual-machine",
        Box::new(KubeStoreClient::new(
            configuration.namespaced_api::<VirtualMachine>(),
        )),
        Arc::new(VirtualMachineHandler::new(status_writer)),
        settings,
        error_sink("virtual-machine"),
    );

    let (stop_sender, stop) = watch::channel(false);
    let reporter = tokio::spawn(report(
        nodes.cache(),
        pods.cache(),
        alerts,
        stop.clone(),
    ));
    info!("start controllers ...");
    let mut controllers = JoinSet::new();
    spawn_controller(&mut controllers, nodes, stop.clone());
    spawn_controller(&mut controllers, pods, stop.clone());
    spawn_controller(&mut controllers, virtual_machines, stop);

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("received shutdown signal");
        }
        result = metrics_server => {
            if let Err(e) = result {
                error!("metrics server failed: {}", e);
            }
        }
    };
    stop_sender.send_replace(true);
    while let Some(result) = controllers.join_next().await {
        if let Err(e) = result {
            error!("controller task failed: {}", e);
        }
    }
    reporter.await?;
    if let Err(e) = meter_provider.shutdown() {
        warn!("failed to shut down meter provider: {}", e);
    }
    info!("all controllers stopped");
    Ok(())
}
