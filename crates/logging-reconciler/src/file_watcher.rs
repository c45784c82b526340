// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! OS notifications for the mounted secret file.
//!
//! Secret volumes are updated by swapping a `..data` symlink in the mount
//! directory, so the parent directory is watched and events are matched either
//! against the secret's own file name or against that symlink.

use crate::error::WatchError;
use crate::model::ObjectKey;
use crate::queue::WorkQueue;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const PROJECTED_DATA_LINK: &str = "..data";

/// Enqueues a fixed key whenever the secret file changes. Watching stops on drop.
pub struct SecretWatcher {
    path: PathBuf,
    _watcher: RecommendedWatcher,
}

impl SecretWatcher {
    pub fn start(path: &Path, queue: WorkQueue, key: ObjectKey) -> Result<Self, WatchError> {
        let file_name = path
            .file_name()
            .map(OsString::from)
            .ok_or_else(|| WatchError::Stream(format!("{} does not name a file", path.display())))?;
        let directory = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) if is_relevant(&event, &file_name) => {
                debug!("secret changed ({:?}), enqueueing {}", event.kind, key);
                queue.add(key.clone());
            }
            Ok(_) => {}
            Err(e) => warn!("secret watch error: {e}"),
        })?;
        watcher.watch(&directory, RecursiveMode::NonRecursive)?;

        info!("watching secret {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            _watcher: watcher,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn is_relevant(event: &Event, file_name: &OsString) -> bool {
    if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
        return false;
    }
    event.paths.iter().any(|path| {
        path.file_name()
            .is_some_and(|name| name == file_name.as_os_str() || name == PROJECTED_DATA_LINK)
    })
}
