use crate::{errors::ControllerError, resource_key::ResourceKey};
use kube::Resource;
use kube_runtime::{
    reflector::{ObjectRef, Store, store::Writer},
    watcher::Event,
};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{sync::watch, time::timeout};

/// Typed change produced by applying a store event to the cache.
#[derive(Debug)]
pub(crate) enum Change<K> {
    Added(Arc<K>),
    Updated { old: Arc<K>, new: Arc<K> },
    /// Carries the last known state of the removed object.
    Deleted(Arc<K>),
}

fn key_of<K>(obj: &K) -> ResourceKey
where
    K: Resource<DynamicType = ()>,
{
    ResourceKey::from(&ObjectRef::from_obj(obj))
}

/// Read-only handle to the local mirror of a resource kind.
pub(crate) struct ResourceCache<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    store: Store<K>,
    synced: watch::Receiver<bool>,
}

impl<K> Clone for ResourceCache<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            synced: self.synced.clone(),
        }
    }
}

impl<K> ResourceCache<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    /// Latest known state of `key`, `None` if the object does no longer exist.
    pub fn get(&self, key: &ResourceKey) -> Option<Arc<K>> {
        self.store.get(&key.object_ref())
    }

    pub fn list(&self) -> Vec<Arc<K>> {
        self.store.state()
    }

    pub fn has_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Blocks until the initial listing has been applied and enqueued.
    pub async fn wait_for_sync(
        &self,
        controller: &str,
        deadline: Duration,
    ) -> Result<(), ControllerError> {
        let stopped = || ControllerError::Stopped(controller.to_string());
        let synced = async {
            // The writer is gone if either wait fails, so the cache will never sync.
            self.store.wait_until_ready().await.map_err(|_| stopped())?;
            let mut synced = self.synced.clone();
            let ready = synced.wait_for(|v| *v).await.is_ok();
            if ready { Ok(()) } else { Err(stopped()) }
        };
        match timeout(deadline, synced).await {
            Ok(result) => result,
            Err(_) => Err(ControllerError::CacheSyncTimeout {
                controller: controller.to_string(),
                timeout: deadline,
            }),
        }
    }
}

/// The single writer of a [`ResourceCache`].
///
/// Wraps the reflector [`Writer`] and derives the typed [`Change`] of every
/// applied event from the store state before and after the event.
pub(crate) struct CacheWriter<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    writer: Writer<K>,
    store: Store<K>,
    synced: watch::Sender<bool>,
}

impl<K> Default for CacheWriter<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    fn default() -> Self {
        let writer: Writer<K> = Default::default();
        let store = writer.as_reader();
        let (synced, _) = watch::channel(false);
        Self {
            writer,
            store,
            synced,
        }
    }
}

impl<K> CacheWriter<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    pub fn as_reader(&self) -> ResourceCache<K> {
        ResourceCache {
            store: self.store.clone(),
            synced: self.synced.subscribe(),
        }
    }

    /// Marks the cache synced, to be called once the initial listing is enqueued.
    pub fn mark_synced(&self) {
        self.synced.send_replace(true);
    }

    /// Apply a store event. Every object must carry a name.
    pub fn apply(&mut self, event: Event<K>) -> Vec<(ResourceKey, Change<K>)> {
        match &event {
            Event::Init | Event::InitApply(_) => {
                // Buffered by the writer until the listing is done.
                self.writer.apply_watcher_event(&event);
                vec![]
            }
            Event::InitDone => {
                let mut previous: HashMap<ResourceKey, Arc<K>> = self
                    .store
                    .state()
                    .into_iter()
                    .map(|obj| (key_of(obj.as_ref()), obj))
                    .collect();
                self.writer.apply_watcher_event(&event);
                let mut changes: Vec<(ResourceKey, Change<K>)> = self
                    .store
                    .state()
                    .into_iter()
                    .map(|new| {
                        let key = key_of(new.as_ref());
                        let change = match previous.remove(&key) {
                            Some(old) => Change::Updated { old, new },
                            None => Change::Added(new),
                        };
                        (key, change)
                    })
                    .collect();
                // Everything not part of the relist is gone.
                changes.extend(
                    previous
                        .into_iter()
                        .map(|(key, old)| (key, Change::Deleted(old))),
                );
                changes
            }
            Event::Apply(obj) => {
                let obj_ref = ObjectRef::from_obj(obj);
                let old = self.store.get(&obj_ref);
                self.writer.apply_watcher_event(&event);
                let new = self
                    .store
                    .get(&obj_ref)
                    .unwrap_or_else(|| Arc::new(obj.clone()));
                let change = match old {
                    Some(old) => Change::Updated { old, new },
                    None => Change::Added(new),
                };
                vec![(ResourceKey::from(&obj_ref), change)]
            }
            Event::Delete(tombstone) => {
                let obj_ref = ObjectRef::from_obj(tombstone);
                let last_known = self
                    .store
                    .get(&obj_ref)
                    .unwrap_or_else(|| Arc::new(tombstone.clone()));
                self.writer.apply_watcher_event(&event);
                vec![(ResourceKey::from(&obj_ref), Change::Deleted(last_known))]
            }
        }
    }
}
