// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Local mirror of the Logging objects plus the loop that keeps it current.
//!
//! The informer never hands objects to the queue, only keys. Workers read the
//! latest object back from [`LoggingCache`] when they get to the key.

use crate::backoff::{pause, BackoffConfig, BackoffState};
use crate::error::WatchError;
use crate::model::{Logging, ObjectKey};
use crate::queue::WorkQueue;
use crate::source::{DesiredStateSource, SourceEvent};
use futures::StreamExt;
use kube::ResourceExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct CacheInner {
    objects: RwLock<HashMap<ObjectKey, Arc<Logging>>>,
    synced: watch::Sender<bool>,
}

/// Read-mostly store of the last observed Logging objects.
#[derive(Clone)]
pub struct LoggingCache {
    inner: Arc<CacheInner>,
}

impl Default for LoggingCache {
    fn default() -> Self {
        Self::new()
    }
}

impl LoggingCache {
    pub fn new() -> Self {
        let (synced, _) = watch::channel(false);
        Self {
            inner: Arc::new(CacheInner {
                objects: RwLock::new(HashMap::new()),
                synced,
            }),
        }
    }

    pub async fn get(&self, key: &ObjectKey) -> Option<Arc<Logging>> {
        self.inner.objects.read().await.get(key).cloned()
    }

    pub async fn keys(&self) -> Vec<ObjectKey> {
        let mut keys: Vec<ObjectKey> = self.inner.objects.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub async fn len(&self) -> usize {
        self.inner.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Inserts or replaces an object, returning its key.
    pub async fn apply(&self, logging: Logging) -> ObjectKey {
        let key = ObjectKey::for_object(&logging);
        self.inner
            .objects
            .write()
            .await
            .insert(key.clone(), Arc::new(logging));
        key
    }

    pub async fn remove(&self, key: &ObjectKey) -> Option<Arc<Logging>> {
        self.inner.objects.write().await.remove(key)
    }

    /// Replaces the whole content with a fresh listing and marks the cache synced.
    ///
    /// Returns the keys of every listed object followed by the keys that disappeared.
    pub async fn replace(&self, items: Vec<Logging>) -> Vec<ObjectKey> {
        let mut listed: HashMap<ObjectKey, Arc<Logging>> = items
            .into_iter()
            .map(|logging| (ObjectKey::for_object(&logging), Arc::new(logging)))
            .collect();

        let mut objects = self.inner.objects.write().await;
        let mut vanished: Vec<ObjectKey> = objects
            .keys()
            .filter(|key| !listed.contains_key(*key))
            .cloned()
            .collect();
        vanished.sort();

        std::mem::swap(&mut *objects, &mut listed);
        let mut keys: Vec<ObjectKey> = objects.keys().cloned().collect();
        drop(objects);

        keys.sort();
        keys.extend(vanished);
        self.inner.synced.send_replace(true);
        keys
    }

    pub fn has_synced(&self) -> bool {
        *self.inner.synced.borrow()
    }

    /// Resolves once the first listing has been stored.
    pub async fn wait_synced(&self) {
        let mut synced = self.inner.synced.subscribe();
        // the sender lives in `self`, so the channel cannot close here
        let _ = synced.wait_for(|synced| *synced).await;
    }
}

/// Keeps a [`LoggingCache`] in line with a [`DesiredStateSource`] and enqueues changed keys.
pub struct Informer {
    source: Arc<dyn DesiredStateSource>,
    cache: LoggingCache,
    queue: WorkQueue,
    resync_period: Duration,
    backoff: BackoffConfig,
}

impl Informer {
    pub fn new(
        source: Arc<dyn DesiredStateSource>,
        cache: LoggingCache,
        queue: WorkQueue,
        resync_period: Duration,
        backoff: BackoffConfig,
    ) -> Self {
        Self {
            source,
            cache,
            queue,
            resync_period,
            backoff,
        }
    }

    /// Lists, then watches, relisting after every stream failure until `cancel` fires.
    ///
    /// Returns `Err(WatchError::ResourceNotRegistered)` when the API server does
    /// not know the Logging type so the caller can provision it and call `run` again.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), WatchError> {
        let mut backoff = BackoffState::new(self.backoff);
        let mut resync = interval_at(Instant::now() + self.resync_period, self.resync_period);

        loop {
            let listing = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                listing = self.source.list() => listing,
            };
            let listing = match listing {
                Ok(listing) => listing,
                Err(WatchError::ResourceNotRegistered) => {
                    return Err(WatchError::ResourceNotRegistered)
                }
                Err(e) => {
                    let delay = backoff.register_error();
                    warn!("listing Logging objects failed, retrying in {delay:?}: {e}");
                    if !pause(&cancel, delay).await {
                        return Ok(());
                    }
                    continue;
                }
            };

            let keys = self.cache.replace(listing.items).await;
            debug!(
                "listed {} Logging objects at resource version {}",
                self.cache.len().await,
                listing.resource_version
            );
            for key in keys {
                self.queue.add(key);
            }

            let mut version = listing.resource_version;
            let mut stream = match self.source.watch(&version).await {
                Ok(stream) => stream,
                Err(e) => {
                    let delay = backoff.register_error();
                    warn!("starting watch failed, relisting in {delay:?}: {e}");
                    if !pause(&cancel, delay).await {
                        return Ok(());
                    }
                    continue;
                }
            };
            backoff.register_success();

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = resync.tick() => {
                        let keys = self.cache.keys().await;
                        debug!("resync of {} keys", keys.len());
                        for key in keys {
                            self.queue.add(key);
                        }
                    }
                    event = stream.next() => match event {
                        Some(Ok(SourceEvent::Applied(logging))) => {
                            if let Some(rv) = logging.resource_version() {
                                version = rv;
                            }
                            let key = self.cache.apply(logging).await;
                            self.queue.add(key);
                        }
                        Some(Ok(SourceEvent::Deleted(logging))) => {
                            if let Some(rv) = logging.resource_version() {
                                version = rv;
                            }
                            let key = ObjectKey::for_object(&logging);
                            self.cache.remove(&key).await;
                            self.queue.add(key);
                        }
                        Some(Ok(SourceEvent::Bookmark { resource_version })) => {
                            version = resource_version;
                        }
                        Some(Err(WatchError::Expired)) => {
                            info!("resource version {version} expired, relisting");
                            break;
                        }
                        Some(Err(e)) => {
                            warn!("watch failed at resource version {version}: {e}");
                            break;
                        }
                        None => {
                            debug!("watch ended at resource version {version}");
                            break;
                        }
                    }
                }
            }

            let delay = backoff.register_error();
            if !pause(&cancel, delay).await {
                return Ok(());
            }
        }
    }
}
