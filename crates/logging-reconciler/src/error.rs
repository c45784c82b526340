// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;
use std::process::ExitStatus;

/// Errors raised while mirroring the Logging resource or watching the secret mount.
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("Logging resource type is not registered with the API server")]
    ResourceNotRegistered,

    #[error("watch resource version expired")]
    Expired,

    #[error("API request failed: {0}")]
    Api(String),

    #[error("watch stream failed: {0}")]
    Stream(String),

    #[error("file watch failed: {0}")]
    Notify(#[from] notify::Error),
}

/// Errors decoding the raw secret bytes.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("failed to read secret file: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed secret document: {0}")]
    Json(#[from] serde_json::Error),

    #[error("duplicate secret for environment '{environment}' and type '{target_type}'")]
    DuplicateSecret {
        environment: String,
        target_type: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigRenderError {
    #[error("{target} is missing required field '{field}'")]
    MissingField { target: String, field: &'static str },

    #[error("{target} field '{field}' contains control characters")]
    ControlCharacters { target: String, field: &'static str },

    #[error("unsupported output type '{output_type}' for environment '{environment}'")]
    UnsupportedOutput {
        environment: String,
        output_type: String,
    },

    #[error("template rendering failed: {0}")]
    Template(#[from] askama::Error),
}

/// Filesystem failures while installing a rendered configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigWriteError {
    #[error("refusing to install an empty configuration")]
    EmptyConfig,

    #[error("staged configuration {0} is missing or empty")]
    EmptyTemp(PathBuf),

    #[error("{step} failed for {path}: {source}")]
    Io {
        step: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ConfigWriteError {
    pub(crate) fn io(step: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ConfigWriteError::Io {
            step,
            path: path.into(),
            source,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessLifecycleError {
    #[error("forwarder exited during startup with {status}")]
    StartFailed { status: ExitStatus },

    #[error("failed to spawn forwarder: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("forwarder is already running")]
    AlreadyRunning,

    #[error("PID file {0} does not exist")]
    MissingPid(PathBuf),

    #[error("PID file {path} holds an invalid pid '{content}'")]
    InvalidPid { path: PathBuf, content: String },

    #[error("no process with pid {0}")]
    NoSuchProcess(i32),

    #[error("failed to signal pid {pid}: {source}")]
    Signal {
        pid: i32,
        #[source]
        source: nix::Error,
    },

    #[error("failed to read PID file {path}: {source}")]
    PidFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ProcessLifecycleError {
    /// Short machine-friendly reason used in log fields.
    pub fn reason(&self) -> &'static str {
        match self {
            ProcessLifecycleError::StartFailed { .. } | ProcessLifecycleError::Spawn(_) => {
                "start-failed"
            }
            ProcessLifecycleError::AlreadyRunning => "already-running",
            ProcessLifecycleError::MissingPid(_) => "missing-pid",
            ProcessLifecycleError::InvalidPid { .. } => "invalid-pid",
            ProcessLifecycleError::NoSuchProcess(_) => "no-such-process",
            ProcessLifecycleError::Signal { .. } => "signal-failed",
            ProcessLifecycleError::PidFile { .. } => "pid-file-unreadable",
        }
    }
}

/// Everything that can fail inside one reconcile pass. Caught at the worker boundary.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("resource cache has not completed its initial list")]
    CacheNotSynced,

    #[error(transparent)]
    Watch(#[from] WatchError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Render(#[from] ConfigRenderError),

    #[error(transparent)]
    Write(#[from] ConfigWriteError),

    #[error(transparent)]
    Process(#[from] ProcessLifecycleError),

    #[error("reconcile panicked: {0}")]
    Panicked(String),
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("provider '{0}' already registered")]
    AlreadyRegistered(String),

    #[error("unknown provider '{0}'")]
    UnknownProvider(String),
}

/// Errors that can occur while loading controller configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Fatal controller failures. Anything here ends the process.
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("failed to start secret watcher: {0}")]
    FileWatch(#[source] WatchError),

    #[error("forwarder failed to start after {attempts} attempts: {source}")]
    Forwarder {
        attempts: u32,
        #[source]
        source: ProcessLifecycleError,
    },
}
