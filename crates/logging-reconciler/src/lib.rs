// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Reconciles a `Logging` custom resource and a mounted credentials file into
//! a running log forwarder's configuration.
//!
//! Two independent change feeds (the resource watch and the secret file
//! watch) enqueue object keys. Workers turn a key into a rendered
//! configuration, install it atomically and signal the forwarder to reload.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod backoff;
pub mod config;
pub mod controller;
pub mod error;
pub mod file_watcher;
pub mod informer;
pub mod model;
pub mod process;
pub mod provider;
pub mod queue;
pub mod reconciler;
pub mod secret;
pub mod source;
pub mod synthesize;
pub mod worker;
pub mod writer;

pub use config::ControllerConfig;
pub use controller::{ControllerHandle, ControllerStatus, LoggingController};
pub use error::{
    ConfigError, ConfigRenderError, ConfigWriteError, ControllerError, DecodeError,
    ProcessLifecycleError, ReconcileError, RegistryError, WatchError,
};
pub use informer::{Informer, LoggingCache};
pub use model::{Logging, LoggingSpec, ObjectKey, Source, Target};
pub use process::{ForwarderCommand, ForwarderProcess, ProcessState, ReloadOutcome, Supervisor};
pub use provider::{FluentdProvider, LogProvider, ProviderRegistry};
pub use reconciler::{ApplyMode, LoggingReconciler};
pub use secret::SecretBundle;
pub use source::{DesiredStateSource, KubeLoggingSource, SourceEvent};
pub use synthesize::{synthesize, RenderedConfig};
pub use writer::{ApplyOutcome, ConfigWriter};
