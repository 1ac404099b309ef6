use crate::{
    change_notifier::ChangeNotifier,
    configuration::ControllerSettings,
    errors::ControllerError,
    observability::ErrorSink,
    reconcile_engine::ReconcileEngine,
    resource_cache::ResourceCache,
    store_client::ResourceStoreClient,
    sync_handler::SyncHandler,
    work_queue::WorkQueue,
};
use kube::Resource;
use std::sync::Arc;
use tokio::sync::watch;

/// A reconciliation controller for one resource kind.
///
/// Wires the store client, cache, change notifier, work queue and worker pool.
pub(crate) struct Controller<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    name: String,
    client: Box<dyn ResourceStoreClient<K>>,
    notifier: ChangeNotifier<K>,
    engine: Arc<ReconcileEngine<K>>,
}

impl<K> Controller<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    pub fn new(
        name: &str,
        client: Box<dyn ResourceStoreClient<K>>,
        handler: Arc<dyn SyncHandler<K>>,
        settings: ControllerSettings,
        sink: Arc<dyn ErrorSink>,
    ) -> Self {
        let queue = WorkQueue::new(settings.backoff);
        let notifier = ChangeNotifier::new(name, queue.clone(), sink.clone());
        let engine = ReconcileEngine::new(
            name,
            notifier.cache(),
            queue,
            handler,
            sink,
            settings.engine,
        );
        Self {
            name: name.to_string(),
            client,
            notifier,
            engine: Arc::new(engine),
        }
    }

    pub fn cache(&self) -> ResourceCache<K> {
        self.notifier.cache()
    }

    /// Runs until `stop` fires. Fails if the cache does not sync in time.
    pub async fn run(self, stop: watch::Receiver<bool>) -> Result<(), ControllerError> {
        info!("start {} controller", self.name);
        let stream = self.client.watch();
        let notifier = tokio::spawn(self.notifier.run(stream, stop.clone()));
        let result = self.engine.run(stop).await;
        // Also stops the notifier if the engine failed to start.
        notifier.abort();
        let _ = notifier.await;
        result
    }
}
