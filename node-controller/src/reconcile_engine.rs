use crate::{
    errors::{ControllerError, ErrorClass},
    observability::ErrorSink,
    rate_limiter::Requeue,
    resource_cache::ResourceCache,
    sync_handler::SyncHandler,
    utils::{metric_name, panic_message, stopped},
    work_queue::{Operation, WorkItem, WorkQueue},
};
use futures::FutureExt;
use kube::Resource;
use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, Histogram, Meter},
};
use std::{panic::AssertUnwindSafe, sync::Arc, time::Instant};
use tokio::{sync::watch, task::JoinHandle, time::Duration};

const RECONCILE_ENGINE: &'static str = "reconcile_engine";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct EngineSettings {
    /// Number of parallel workers.
    pub workers: usize,
    /// Maximum time to wait for the initial listing.
    pub cache_sync_timeout: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            workers: 2,
            cache_sync_timeout: Duration::from_secs(60),
        }
    }
}

/// Worker pool driving the [`SyncHandler`] of one resource kind.
pub(crate) struct ReconcileEngine<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    name: String,
    cache: ResourceCache<K>,
    queue: WorkQueue<K>,
    handler: Arc<dyn SyncHandler<K>>,
    sink: Arc<dyn ErrorSink>,
    settings: EngineSettings,
    reconcile_count: Counter<u64>,
    reconcile_duration: Histogram<u64>,
    reconcile_errors: Counter<u64>,
    requeue_count: Counter<u64>,
    drop_count: Counter<u64>,
}

impl<K> ReconcileEngine<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    pub fn new(
        name: &str,
        cache: ResourceCache<K>,
        queue: WorkQueue<K>,
        handler: Arc<dyn SyncHandler<K>>,
        sink: Arc<dyn ErrorSink>,
        settings: EngineSettings,
    ) -> Self {
        let meter: Meter = global::meter(RECONCILE_ENGINE);
        let reconcile_count = meter
            .u64_counter(metric_name("reconcile_count"))
            .with_description("Count of reconcile invocations")
            .build();
        let reconcile_duration = meter
            .u64_histogram(metric_name("reconcile_duration_ms"))
            .with_description("Reconcile duration in milliseconds")
            .with_unit("ms")
            .build();
        let reconcile_errors = meter
            .u64_counter(metric_name("reconcile_errors"))
            .with_description("Count of failed reconcile invocations")
            .build();
        let requeue_count = meter
            .u64_counter(metric_name("requeue_count"))
            .with_description("Count of work items re-enqueued after a failure")
            .build();
        let drop_count = meter
            .u64_counter(metric_name("drop_count"))
            .with_description("Count of work items dropped after exhausting their retries")
            .build();
        Self {
            name: name.to_string(),
            cache,
            queue,
            handler,
            sink,
            settings,
            reconcile_count,
            reconcile_duration,
            reconcile_errors,
            requeue_count,
            drop_count,
        }
    }

    /// Waits for the cache to sync, then processes work items until `stop` fires.
    ///
    /// Fails if the cache does not sync in time or `stop` fires first.
    pub async fn run(
        self: Arc<Self>,
        mut stop: watch::Receiver<bool>,
    ) -> Result<(), ControllerError> {
        let timeout = self.settings.cache_sync_timeout;
        tokio::select! {
            synced = self.cache.wait_for_sync(&self.name, timeout) => synced?,
            _ = stopped(&mut stop) => {
                return Err(ControllerError::Stopped(self.name.clone()));
            }
        }
        let workers = self.settings.workers.max(1);
        info!(
            "{} controller cache synced, starting {} workers",
            self.name, workers
        );
        let handles: Vec<JoinHandle<()>> = (0..workers)
            .map(|id| {
                let me = self.clone();
                tokio::spawn(async move { me.worker(id).await })
            })
            .collect();
        // A dropped sender counts as stop signal as well.
        stopped(&mut stop).await;
        info!("stopping {} controller", self.name);
        self.queue.shut_down().await;
        for handle in handles {
            if let Err(e) = handle.await {
                error!("{} controller worker failed: {}", self.name, e);
            }
        }
        info!("{} controller stopped", self.name);
        Ok(())
    }

    async fn worker(&self, id: usize) {
        debug!("{} controller worker {} started", self.name, id);
        while let Some(item) = self.queue.get().await {
            trace!(
                "{} controller worker {} picked {}, {} keys waiting",
                self.name,
                id,
                item.key,
                self.queue.len().await
            );
            self.process(item).await;
        }
        debug!("{} controller worker {} stopped", self.name, id);
    }

    async fn reconcile(&self, item: &WorkItem<K>) -> Result<(), ControllerError> {
        // Always act on the latest state, never on the notification payload.
        let current = self.cache.get(&item.key);
        if item.operation == Operation::Add {
            if let Some(current) = &current {
                self.handler.adopt(&item.key, current).await?;
            }
        }
        self.handler
            .sync(
                &item.key,
                item.operation,
                current.as_deref(),
                item.prior.as_deref(),
            )
            .await
    }

    /// Runs the handler for one work item and applies the retry policy.
    pub(crate) async fn process(&self, item: WorkItem<K>) {
        let start = Instant::now();
        let result = match AssertUnwindSafe(self.reconcile(&item)).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => {
                let e = ControllerError::Panic(panic_message(payload.as_ref()));
                self.sink.report_error(
                    &format!(
                        "{} controller recovered from panic on {}",
                        self.name, item.key
                    ),
                    &e,
                );
                Err(e)
            }
        };
        let labels = &[
            KeyValue::new("controller", self.name.clone()),
            KeyValue::new("operation", item.operation.to_string()),
        ];
        self.reconcile_count.add(1, labels);
        self.reconcile_duration
            .record(start.elapsed().as_millis() as u64, labels);

        let e = match result {
            Ok(()) => {
                debug!(
                    "{} controller reconciled {} ({})",
                    self.name, item.key, item.operation
                );
                self.queue.forget(&item.key).await;
                self.queue.done(&item.key).await;
                return;
            }
            Err(e) => e,
        };
        match e.class() {
            ErrorClass::NotFound => {
                debug!(
                    "{} controller: {} does no longer exist: {}",
                    self.name, item.key, e
                );
                self.queue.forget(&item.key).await;
                self.queue.done(&item.key).await;
            }
            ErrorClass::Malformed => {
                self.reconcile_errors.add(1, labels);
                self.sink.report_error(
                    &format!("{} controller dropped {}", self.name, item.key),
                    &e,
                );
                self.queue.forget(&item.key).await;
                self.queue.done(&item.key).await;
            }
            ErrorClass::Transient => {
                self.reconcile_errors.add(1, labels);
                self.queue.done(&item.key).await;
                let key = item.key.clone();
                match self.queue.add_rate_limited(item).await {
                    Requeue::After(delay) => {
                        warn!(
                            "{} controller failed to reconcile {} (retry {}), retrying in {:?}: {}",
                            self.name,
                            key,
                            self.queue.num_requeues(&key).await,
                            delay,
                            e
                        );
                        self.requeue_count.add(1, labels);
                    }
                    Requeue::Dropped { attempts } => {
                        self.drop_count.add(1, labels);
                        self.sink.report_error(
                            &format!(
                                "{} controller dropped {} after {} attempts",
                                self.name, key, attempts
                            ),
                            &e,
                        );
                    }
                }
            }
        }
    }
}
