// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::error::ReconcileError;
use crate::model::ObjectKey;
use crate::queue::WorkQueue;
use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Failures at or beyond this count are reported as persistent.
pub const PERSISTENT_FAILURE_THRESHOLD: usize = 5;

/// One pass bringing the world in line with the desired state of a key.
#[async_trait]
pub trait Reconcile: Send + Sync {
    async fn reconcile(&self, key: &ObjectKey) -> Result<(), ReconcileError>;
}

/// Drains a [`WorkQueue`] into a [`Reconcile`] implementation until the queue shuts down.
pub struct Worker {
    queue: WorkQueue,
    reconciler: Arc<dyn Reconcile>,
}

impl Worker {
    pub fn new(queue: WorkQueue, reconciler: Arc<dyn Reconcile>) -> Self {
        Self { queue, reconciler }
    }

    pub async fn run(self) {
        info!("{} worker started", self.queue.name());
        while let Some(key) = self.queue.get().await {
            self.process(&key).await;
            self.queue.done(&key);
        }
        info!("{} worker stopped", self.queue.name());
    }

    async fn process(&self, key: &ObjectKey) {
        let result = AssertUnwindSafe(self.reconciler.reconcile(key))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(ReconcileError::Panicked(panic_message(panic.as_ref()))));

        match result {
            Ok(()) => {
                debug!("{}: reconciled {}", self.queue.name(), key);
                self.queue.forget(key);
            }
            Err(e) => {
                let failures = self.queue.num_requeues(key);
                if failures >= PERSISTENT_FAILURE_THRESHOLD {
                    error!(
                        "{}: reconcile of {} keeps failing ({} retries): {}",
                        self.queue.name(),
                        key,
                        failures,
                        e
                    );
                } else {
                    warn!("{}: reconcile of {} failed: {}", self.queue.name(), key, e);
                }
                let delay = self.queue.add_rate_limited(key.clone());
                debug!("{}: retrying {} in {:?}", self.queue.name(), key, delay);
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
