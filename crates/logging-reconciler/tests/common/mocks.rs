// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Mock implementations of the controller's seams for testing

use futures::channel::mpsc;
use futures::StreamExt;
use logging_reconciler::error::{ProcessLifecycleError, WatchError};
use logging_reconciler::source::{EventStream, Listing};
use logging_reconciler::{
    DesiredStateSource, Logging, ProcessState, ReloadOutcome, SourceEvent, Supervisor,
};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

#[allow(dead_code)]
pub type EventSender = mpsc::UnboundedSender<Result<SourceEvent, WatchError>>;

/// Desired state source serving scripted listings and watch streams.
///
/// Once the script is exhausted, `list` and `watch` never resolve.
#[allow(dead_code)]
#[derive(Default)]
pub struct ScriptedSource {
    lists: Mutex<VecDeque<Result<Listing, WatchError>>>,
    watches: Mutex<VecDeque<EventStream>>,
    provisions: AtomicUsize,
    hang_provision: AtomicBool,
}

#[allow(dead_code)]
impl ScriptedSource {
    pub fn push_list(&self, items: Vec<Logging>, resource_version: &str) {
        self.lists.lock().unwrap().push_back(Ok(Listing {
            items,
            resource_version: resource_version.to_string(),
        }));
    }

    pub fn push_list_error(&self, error: WatchError) {
        self.lists.lock().unwrap().push_back(Err(error));
    }

    pub fn push_watch(&self) -> EventSender {
        let (tx, rx) = mpsc::unbounded();
        self.watches.lock().unwrap().push_back(rx.boxed());
        tx
    }

    /// Makes `provision` never complete, like a resource type that is never established.
    pub fn hang_provision(&self) {
        self.hang_provision.store(true, Ordering::SeqCst);
    }

    pub fn provisions(&self) -> usize {
        self.provisions.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl DesiredStateSource for ScriptedSource {
    async fn list(&self) -> Result<Listing, WatchError> {
        let next = self.lists.lock().unwrap().pop_front();
        match next {
            Some(result) => result,
            None => futures::future::pending().await,
        }
    }

    async fn get(&self, _name: &str) -> Result<Option<Logging>, WatchError> {
        Ok(None)
    }

    async fn watch(&self, _resource_version: &str) -> Result<EventStream, WatchError> {
        let next = self.watches.lock().unwrap().pop_front();
        Ok(next.unwrap_or_else(|| futures::stream::pending().boxed()))
    }

    async fn provision(&self) -> Result<(), WatchError> {
        self.provisions.fetch_add(1, Ordering::SeqCst);
        if self.hang_provision.load(Ordering::SeqCst) {
            futures::future::pending::<()>().await;
        }
        Ok(())
    }
}

/// Supervisor that records lifecycle calls and the active configuration seen at each reload.
#[allow(dead_code)]
pub struct RecordingSupervisor {
    active: PathBuf,
    failing_starts: AtomicUsize,
    failing_reloads: AtomicUsize,
    starts: AtomicUsize,
    reload_attempts: AtomicUsize,
    stops: AtomicUsize,
    reloads: Mutex<Vec<String>>,
    state: Mutex<ProcessState>,
}

#[allow(dead_code)]
impl RecordingSupervisor {
    pub fn new(active: PathBuf) -> Self {
        Self {
            active,
            failing_starts: AtomicUsize::new(0),
            failing_reloads: AtomicUsize::new(0),
            starts: AtomicUsize::new(0),
            reload_attempts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            reloads: Mutex::new(Vec::new()),
            state: Mutex::new(ProcessState::NotStarted),
        }
    }

    /// The first `count` calls to `start` fail.
    pub fn failing_starts(self, count: usize) -> Self {
        self.failing_starts.store(count, Ordering::SeqCst);
        self
    }

    /// The first `count` reloads of a running forwarder fail with `NoSuchProcess`.
    pub fn failing_reloads(self, count: usize) -> Self {
        self.failing_reloads.store(count, Ordering::SeqCst);
        self
    }

    pub fn reload_attempts(&self) -> usize {
        self.reload_attempts.load(Ordering::SeqCst)
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn reloads(&self) -> Vec<String> {
        self.reloads.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Supervisor for RecordingSupervisor {
    async fn start(&self) -> Result<(), ProcessLifecycleError> {
        let attempt = self.starts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.failing_starts.load(Ordering::SeqCst) {
            *self.state.lock().unwrap() = ProcessState::Failed;
            return Err(ProcessLifecycleError::StartFailed {
                status: failed_status(),
            });
        }
        *self.state.lock().unwrap() = ProcessState::Running;
        Ok(())
    }

    async fn reload(&self) -> Result<ReloadOutcome, ProcessLifecycleError> {
        if *self.state.lock().unwrap() != ProcessState::Running {
            return Ok(ReloadOutcome::NotStarted);
        }
        let attempt = self.reload_attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.failing_reloads.load(Ordering::SeqCst) {
            return Err(ProcessLifecycleError::NoSuchProcess(4242));
        }
        let content = std::fs::read_to_string(&self.active).unwrap();
        self.reloads.lock().unwrap().push(content);
        Ok(ReloadOutcome::Signalled { pid: 4242 })
    }

    async fn stop(&self) -> Result<(), ProcessLifecycleError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        *self.state.lock().unwrap() = ProcessState::Stopped;
        Ok(())
    }

    fn state(&self) -> ProcessState {
        *self.state.lock().unwrap()
    }
}

fn failed_status() -> ExitStatus {
    use std::os::unix::process::ExitStatusExt;
    ExitStatus::from_raw(1 << 8)
}
