// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wiring of the informer, the secret watcher, both queues and their workers.
//!
//! Startup order matters: the forwarder is only started once a configuration
//! built from a synced cache is on disk, and the workers only begin after the
//! forwarder is up so that every reload targets a running process.

use crate::backoff::{pause, BackoffConfig, BackoffState};
use crate::config::ControllerConfig;
use crate::error::{ControllerError, WatchError};
use crate::file_watcher::SecretWatcher;
use crate::informer::{Informer, LoggingCache};
use crate::model::ObjectKey;
use crate::provider::LogProvider;
use crate::queue::WorkQueue;
use crate::reconciler::{ApplyMode, LoggingReconciler};
use crate::source::DesiredStateSource;
use crate::worker::Worker;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Status of the logging controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerStatus {
    /// Waiting for the cache, the first configuration or the forwarder.
    Starting,
    /// Both workers are processing changes.
    Running,
    /// Cancellation received, tasks are being joined.
    Stopping,
    Stopped,
}

/// Read-only view of a controller's status.
#[derive(Debug, Clone)]
pub struct ControllerHandle {
    status: watch::Receiver<ControllerStatus>,
}

impl ControllerHandle {
    pub fn status(&self) -> ControllerStatus {
        *self.status.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.status() == ControllerStatus::Running
    }

    pub fn status_receiver(&self) -> watch::Receiver<ControllerStatus> {
        self.status.clone()
    }

    /// Resolves once the controller reaches `status`. Returns false if the controller went away first.
    pub async fn wait_for(&self, status: ControllerStatus) -> bool {
        let mut receiver = self.status.clone();
        let reached = receiver.wait_for(|current| *current == status).await.is_ok();
        reached
    }
}

/// Everything that must be torn down when the controller exits, whatever the exit path.
#[derive(Default)]
struct Tasks {
    informer_cancel: CancellationToken,
    queues: Vec<WorkQueue>,
    watcher: Option<SecretWatcher>,
    handles: Vec<JoinHandle<()>>,
    forwarder_started: bool,
}

impl Tasks {
    async fn shut_down(&mut self) {
        self.informer_cancel.cancel();
        for queue in &self.queues {
            queue.shut_down();
        }
        if let Some(watcher) = self.watcher.take() {
            debug!("stopped watching {}", watcher.path().display());
        }
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                error!("controller task failed: {e}");
            }
        }
    }
}

pub struct LoggingController {
    config: ControllerConfig,
    source: Arc<dyn DesiredStateSource>,
    provider: Arc<dyn LogProvider>,
    status: watch::Sender<ControllerStatus>,
}

impl LoggingController {
    pub fn new(
        config: ControllerConfig,
        source: Arc<dyn DesiredStateSource>,
        provider: Arc<dyn LogProvider>,
    ) -> Self {
        let (status, _) = watch::channel(ControllerStatus::Starting);
        Self {
            config,
            source,
            provider,
            status,
        }
    }

    pub fn handle(&self) -> ControllerHandle {
        ControllerHandle {
            status: self.status.subscribe(),
        }
    }

    /// Runs until `cancel` fires or a fatal error occurs.
    ///
    /// Fatal errors are a secret watcher that cannot be set up and a forwarder
    /// that fails to start `start_attempts` times in a row.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), ControllerError> {
        info!(
            "starting logging controller for {} with provider {}",
            self.config.watched_key(),
            self.provider.name()
        );

        let mut tasks = Tasks::default();
        let result = self.start_and_serve(&cancel, &mut tasks).await;

        self.status.send_replace(ControllerStatus::Stopping);
        info!("shutting down logging controller");
        tasks.shut_down().await;
        if tasks.forwarder_started {
            if let Err(e) = self.provider.stop().await {
                warn!("failed to stop forwarder ({}): {e}", e.reason());
            }
        }
        self.status.send_replace(ControllerStatus::Stopped);
        info!("logging controller stopped");
        result
    }

    async fn start_and_serve(
        &self,
        cancel: &CancellationToken,
        tasks: &mut Tasks,
    ) -> Result<(), ControllerError> {
        let key = self.config.watched_key();
        let backoff = BackoffConfig::new(self.config.retry_base, self.config.retry_max);
        let cache = LoggingCache::new();
        let api_queue = WorkQueue::new("api", backoff);
        let file_queue = WorkQueue::new("file", backoff);
        tasks.queues = vec![api_queue.clone(), file_queue.clone()];

        let informer = Informer::new(
            self.source.clone(),
            cache.clone(),
            api_queue.clone(),
            self.config.resync_period,
            backoff,
        );
        tasks.handles.push(tokio::spawn(run_informer(
            informer,
            self.source.clone(),
            tasks.informer_cancel.clone(),
            backoff,
        )));

        tasks.watcher = Some(
            SecretWatcher::start(&self.config.secret_path, file_queue.clone(), key.clone())
                .map_err(ControllerError::FileWatch)?,
        );

        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = cache.wait_synced() => info!("Logging cache synced"),
        }

        let reconciler = Arc::new(LoggingReconciler::new(
            cache,
            self.provider.clone(),
            self.config.secret_path.clone(),
        ));
        if !self.initial_sync(&reconciler, &key, cancel, backoff).await {
            return Ok(());
        }

        let mut retry = BackoffState::new(backoff);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.provider.start().await {
                Ok(()) => {
                    tasks.forwarder_started = true;
                    break;
                }
                Err(e) if attempt >= self.config.start_attempts => {
                    error!("forwarder failed to start after {attempt} attempts: {e}");
                    return Err(ControllerError::Forwarder {
                        attempts: attempt,
                        source: e,
                    });
                }
                Err(e) => {
                    let delay = retry.register_error();
                    warn!(
                        "forwarder start attempt {attempt} failed ({}), retrying in {delay:?}: {e}",
                        e.reason()
                    );
                    if !pause(cancel, delay).await {
                        return Ok(());
                    }
                }
            }
        }

        for queue in [api_queue, file_queue] {
            let worker = Worker::new(queue, reconciler.clone());
            tasks.handles.push(tokio::spawn(worker.run()));
        }

        self.status.send_replace(ControllerStatus::Running);
        info!("logging controller running");
        cancel.cancelled().await;
        Ok(())
    }

    /// Writes the first configuration without reloading. Returns false if cancelled first.
    async fn initial_sync(
        &self,
        reconciler: &LoggingReconciler,
        key: &ObjectKey,
        cancel: &CancellationToken,
        backoff: BackoffConfig,
    ) -> bool {
        let mut retry = BackoffState::new(backoff);
        loop {
            match reconciler.sync(key, ApplyMode::Prepare).await {
                Ok(outcome) => {
                    info!("initial configuration for {key}: {outcome:?}");
                    return true;
                }
                Err(e) => {
                    let delay = retry.register_error();
                    warn!("initial sync of {key} failed, retrying in {delay:?}: {e}");
                    if !pause(cancel, delay).await {
                        return false;
                    }
                }
            }
        }
    }
}

/// Runs the informer, registering the resource type whenever the API server does not know it.
async fn run_informer(
    informer: Informer,
    source: Arc<dyn DesiredStateSource>,
    cancel: CancellationToken,
    backoff: BackoffConfig,
) {
    let mut retry = BackoffState::new(backoff);
    loop {
        match informer.run(cancel.clone()).await {
            Ok(()) => return,
            Err(WatchError::ResourceNotRegistered) => {
                info!("Logging resource type not registered, provisioning it");
                let provisioned = tokio::select! {
                    _ = cancel.cancelled() => return,
                    provisioned = source.provision() => provisioned,
                };
                match provisioned {
                    Ok(()) => retry.register_success(),
                    Err(e) => {
                        let delay = retry.register_error();
                        warn!("provisioning failed, retrying in {delay:?}: {e}");
                        if !pause(&cancel, delay).await {
                            return;
                        }
                    }
                }
            }
            Err(e) => {
                let delay = retry.register_error();
                warn!("informer stopped, restarting in {delay:?}: {e}");
                if !pause(&cancel, delay).await {
                    return;
                }
            }
        }
    }
}
