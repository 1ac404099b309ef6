use crate::{
    errors::ControllerError,
    observability::ErrorSink,
    resource_cache::{CacheWriter, Change, ResourceCache},
    resource_key::ResourceKey,
    store_client::StoreStream,
    utils::stopped,
    work_queue::{Operation, WorkItem, WorkQueue},
};
use futures::StreamExt;
use kube::Resource;
use kube_runtime::watcher::Event;
use std::sync::Arc;
use tokio::sync::watch;

/// Translate a cache change into a work item, `None` for no-op updates.
pub(crate) fn work_item<K: Resource>(key: ResourceKey, change: Change<K>) -> Option<WorkItem<K>> {
    match change {
        Change::Added(_) => Some(WorkItem::new(key, Operation::Add, None)),
        Change::Updated { old, new } => {
            // Re-deliveries of an unchanged object (e.g. on relist) carry the same version.
            if old.meta().resource_version == new.meta().resource_version {
                None
            } else {
                Some(WorkItem::new(key, Operation::Update, Some(old)))
            }
        }
        Change::Deleted(last_known) => {
            Some(WorkItem::new(key, Operation::Delete, Some(last_known)))
        }
    }
}

/// Applies the store notifications to the cache and enqueues the resulting work items.
pub(crate) struct ChangeNotifier<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    controller: String,
    writer: CacheWriter<K>,
    queue: WorkQueue<K>,
    sink: Arc<dyn ErrorSink>,
}

impl<K> ChangeNotifier<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    pub fn new(controller: &str, queue: WorkQueue<K>, sink: Arc<dyn ErrorSink>) -> Self {
        Self {
            controller: controller.to_string(),
            writer: Default::default(),
            queue,
            sink,
        }
    }

    pub fn cache(&self) -> ResourceCache<K> {
        self.writer.as_reader()
    }

    /// `false` if the object has no usable identity, which is reported.
    fn has_key(&self, obj: &K) -> bool {
        match ResourceKey::from_object(obj) {
            Ok(_) => true,
            Err(e) => {
                // The object identity is unrecoverable, so there is nothing to retry.
                self.sink.report_error(
                    &format!("{} controller dropped notification", self.controller),
                    &e,
                );
                false
            }
        }
    }

    pub async fn handle(&mut self, event: Event<K>) {
        let keyed = match &event {
            Event::Init | Event::InitDone => true,
            Event::InitApply(obj) | Event::Apply(obj) | Event::Delete(obj) => self.has_key(obj),
        };
        if !keyed {
            return;
        }
        let listing_done = matches!(event, Event::InitDone);
        let changes = self.writer.apply(event);
        let mut enqueued = 0usize;
        for (key, change) in changes {
            if let Some(item) = work_item(key, change) {
                self.queue.add(item).await;
                enqueued += 1;
            }
        }
        if listing_done {
            debug!(
                "{} controller listing complete, enqueued {} items",
                self.controller, enqueued
            );
            // Only now all objects of the initial listing are queued.
            self.writer.mark_synced();
        }
    }

    /// Consume the store notifications until the stream ends or `stop` fires.
    pub async fn run(mut self, mut stream: StoreStream<K>, mut stop: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                event = stream.next() => match event {
                    Some(Ok(event)) => self.handle(event).await,
                    Some(Err(e)) => {
                        // The watcher recovers on its own with backoff.
                        self.sink.report_error(
                            &format!("{} controller watch failed", self.controller),
                            &ControllerError::from(e),
                        );
                    }
                    None => {
                        warn!("{} controller watch stream ended", self.controller);
                        break;
                    }
                },
                _ = stopped(&mut stop) => {
                    debug!("{} controller stops watching", self.controller);
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        observability::testing::RecordingErrorSink, rate_limiter::BackoffSettings,
        store_client::{ResourceStoreClient, testing::ChannelStoreClient},
    };
    use k8s_openapi::api::core::v1::Pod;
    use kube::api::ObjectMeta;
    use kube_runtime::watcher;

    fn pod(name: Option<&str>, version: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: name.map(|v| v.to_string()),
                namespace: Some("ns".to_string()),
                resource_version: Some(version.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn notifier() -> (ChangeNotifier<Pod>, WorkQueue<Pod>, Arc<RecordingErrorSink>) {
        let queue = WorkQueue::new(BackoffSettings::default());
        let sink = Arc::new(RecordingErrorSink::default());
        let notifier = ChangeNotifier::new("pod", queue.clone(), sink.clone());
        (notifier, queue, sink)
    }

    #[test]
    fn work_items() {
        let key = ResourceKey::new(Some("ns"), "foo");
        let v1 = Arc::new(pod(Some("foo"), "1"));
        let v2 = Arc::new(pod(Some("foo"), "2"));

        let item = work_item(key.clone(), Change::Added(v1.clone())).unwrap();
        assert_eq!(Operation::Add, item.operation);
        assert!(item.prior.is_none());

        let item = work_item(
            key.clone(),
            Change::Updated {
                old: v1.clone(),
                new: v2.clone(),
            },
        )
        .unwrap();
        assert_eq!(Operation::Update, item.operation);
        assert!(Arc::ptr_eq(&v1, item.prior.as_ref().unwrap()));

        let item = work_item(key.clone(), Change::Deleted(v2.clone())).unwrap();
        assert_eq!(Operation::Delete, item.operation);
        assert!(item.prior.is_some());
    }

    #[test]
    fn unchanged_resource_version_is_suppressed() {
        let key = ResourceKey::new(Some("ns"), "foo");
        let change = Change::Updated {
            old: Arc::new(pod(Some("foo"), "7")),
            new: Arc::new(pod(Some("foo"), "7")),
        };
        assert!(work_item(key, change).is_none());
    }

    #[tokio::test]
    async fn listing_marks_cache_synced_after_enqueue() {
        let (mut notifier, queue, _) = notifier();
        let cache = notifier.cache();
        notifier.handle(Event::Init).await;
        notifier.handle(Event::InitApply(pod(Some("a"), "1"))).await;
        notifier.handle(Event::InitApply(pod(Some("b"), "1"))).await;
        assert!(!cache.has_synced());
        assert_eq!(0, queue.len().await);
        notifier.handle(Event::InitDone).await;
        assert!(cache.has_synced());
        assert_eq!(2, queue.len().await);
    }

    #[tokio::test]
    async fn malformed_objects_are_reported_and_dropped() {
        let (mut notifier, queue, sink) = notifier();
        let cache = notifier.cache();
        notifier.handle(Event::Apply(pod(None, "1"))).await;
        assert_eq!(0, queue.len().await);
        assert!(cache.list().is_empty());
        let reports = sink.reports();
        assert_eq!(1, reports.len());
        assert!(reports[0].contains("malformed resource key"), "{:?}", reports);
    }

    #[tokio::test]
    async fn updates_with_same_version_do_not_enqueue() {
        let (mut notifier, queue, _) = notifier();
        notifier.handle(Event::Apply(pod(Some("a"), "1"))).await;
        let item = queue.get().await.unwrap();
        queue.done(&item.key).await;

        notifier.handle(Event::Apply(pod(Some("a"), "1"))).await;
        assert_eq!(0, queue.len().await);
        notifier.handle(Event::Apply(pod(Some("a"), "2"))).await;
        assert_eq!(1, queue.len().await);
    }

    #[tokio::test]
    async fn watch_errors_are_reported() {
        let (notifier, queue, sink) = notifier();
        let (_stop_sender, stop) = watch::channel(false);
        let stream = futures::stream::iter(vec![
            Err(watcher::Error::NoResourceVersion),
            Ok(Event::Apply(pod(Some("a"), "1"))),
        ])
        .boxed();
        // Keeps running after the error, ends with the stream.
        tokio::spawn(notifier.run(stream, stop)).await.unwrap();

        let reports = sink.reports();
        assert_eq!(1, reports.len(), "{:?}", reports);
        assert!(reports[0].starts_with("pod controller watch failed"), "{:?}", reports);
        assert_eq!(1, queue.len().await);
    }

    #[tokio::test]
    async fn run_until_stopped() {
        let (notifier, queue, _) = notifier();
        let cache = notifier.cache();
        let (client, sender) = ChannelStoreClient::new();
        let (stop_sender, stop) = watch::channel(false);
        let task = tokio::spawn(notifier.run(client.watch(), stop));

        sender.unbounded_send(Event::Init).unwrap();
        sender
            .unbounded_send(Event::InitApply(pod(Some("a"), "1")))
            .unwrap();
        sender.unbounded_send(Event::InitDone).unwrap();
        cache
            .wait_for_sync("pod", std::time::Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(1, queue.len().await);

        stop_sender.send_replace(true);
        task.await.unwrap();
    }
}
