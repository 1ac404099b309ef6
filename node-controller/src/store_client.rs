use futures::{StreamExt, stream::BoxStream};
use kube::{Api, Resource};
use kube_runtime::{
    WatchStreamExt,
    watcher::{self, Event, watcher},
};
use serde::de::DeserializeOwned;
use std::fmt::Debug;

pub(crate) type StoreStream<K> = BoxStream<'static, Result<Event<K>, watcher::Error>>;

/// Source of the initial listing and the change notifications of one resource kind.
///
/// The listing is delivered as `Init`, `InitApply(obj)`... `InitDone`, followed by
/// `Apply(obj)` and `Delete(obj)` notifications. A relist repeats the `Init` sequence.
pub(crate) trait ResourceStoreClient<K>: Send + Sync {
    fn watch(&self) -> StoreStream<K>;
}

/// [`ResourceStoreClient`] backed by the Kubernetes API.
pub(crate) struct KubeStoreClient<K> {
    api: Api<K>,
    config: watcher::Config,
}

impl<K> KubeStoreClient<K> {
    pub fn new(api: Api<K>) -> Self {
        Self {
            api,
            config: watcher::Config::default(),
        }
    }
}

impl<K> ResourceStoreClient<K> for KubeStoreClient<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    fn watch(&self) -> StoreStream<K> {
        // The watcher re-establishes broken watches itself, backing off on errors.
        watcher(self.api.clone(), self.config.clone())
            .default_backoff()
            .boxed()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use futures::channel::mpsc::{UnboundedReceiver, UnboundedSender, unbounded};
    use std::sync::Mutex;

    /// Store client fed by the test through a channel.
    pub(crate) struct ChannelStoreClient<K> {
        receiver: Mutex<Option<UnboundedReceiver<Event<K>>>>,
    }

    impl<K> ChannelStoreClient<K> {
        pub fn new() -> (Self, UnboundedSender<Event<K>>) {
            let (sender, receiver) = unbounded();
            (
                Self {
                    receiver: Mutex::new(Some(receiver)),
                },
                sender,
            )
        }
    }

    impl<K: Send + 'static> ResourceStoreClient<K> for ChannelStoreClient<K> {
        fn watch(&self) -> StoreStream<K> {
            let receiver = self.receiver.lock().unwrap().take();
            match receiver {
                Some(receiver) => receiver.map(Ok).boxed(),
                None => futures::stream::empty().boxed(),
            }
        }
    }
}
