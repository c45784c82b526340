// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::config::ControllerConfig;
use crate::error::{ProcessLifecycleError, ReconcileError, RegistryError};
use crate::process::{
    ForwarderCommand, ForwarderProcess, ReloadOutcome, Supervisor, LOG_FILE, PID_FILE,
};
use crate::synthesize::RenderedConfig;
use crate::writer::{ApplyOutcome, ConfigWriter};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub const FLUENTD: &str = "fluentd";

/// A log forwarder the controller can configure and run.
#[async_trait]
pub trait LogProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Installs `rendered` without touching the forwarder process.
    async fn prepare(&self, rendered: &RenderedConfig) -> Result<ApplyOutcome, ReconcileError>;

    /// Installs `rendered` and, if the file changed, makes the forwarder reload it.
    async fn apply(&self, rendered: &RenderedConfig) -> Result<ApplyOutcome, ReconcileError>;

    /// Whether a configuration is already installed for the forwarder to start with.
    async fn has_config(&self) -> bool;

    async fn start(&self) -> Result<(), ProcessLifecycleError>;

    async fn stop(&self) -> Result<(), ProcessLifecycleError>;
}

pub struct FluentdProvider {
    writer: ConfigWriter,
    supervisor: Arc<dyn Supervisor>,
    /// Serializes applies. Holds true while an installed configuration has not been reloaded.
    reload_pending: Mutex<bool>,
}

impl FluentdProvider {
    pub fn new(writer: ConfigWriter, supervisor: Arc<dyn Supervisor>) -> Self {
        Self {
            writer,
            supervisor,
            reload_pending: Mutex::new(false),
        }
    }

    /// Provider writing into `config.config_dir` and running `config.forwarder_bin`.
    pub fn from_config(config: &ControllerConfig) -> Self {
        let writer = ConfigWriter::new(&config.config_dir);
        let pid_file = config.config_dir.join(PID_FILE);
        let command = ForwarderCommand::fluentd(
            &config.forwarder_bin,
            writer.active_path(),
            &config.plugins_dir,
            &pid_file,
            &config.config_dir.join(LOG_FILE),
        );
        let process = ForwarderProcess::new(command, pid_file, config.start_timeout);
        Self::new(writer, Arc::new(process))
    }

    pub fn writer(&self) -> &ConfigWriter {
        &self.writer
    }
}

#[async_trait]
impl LogProvider for FluentdProvider {
    fn name(&self) -> &str {
        FLUENTD
    }

    async fn prepare(&self, rendered: &RenderedConfig) -> Result<ApplyOutcome, ReconcileError> {
        let _guard = self.reload_pending.lock().await;
        Ok(self.writer.apply(rendered).await?)
    }

    async fn apply(&self, rendered: &RenderedConfig) -> Result<ApplyOutcome, ReconcileError> {
        let mut reload_pending = self.reload_pending.lock().await;
        let outcome = match self.writer.apply(rendered).await {
            Ok(outcome) => outcome,
            Err(e) => {
                // the rename may have landed before a later step failed
                *reload_pending = true;
                return Err(e.into());
            }
        };
        match outcome {
            ApplyOutcome::Installed => *reload_pending = true,
            ApplyOutcome::Unchanged if *reload_pending => {
                info!("configuration unchanged but the last reload did not complete, retrying it")
            }
            ApplyOutcome::Unchanged => {
                debug!("configuration unchanged, not reloading");
                return Ok(outcome);
            }
        }

        match self.supervisor.reload().await? {
            ReloadOutcome::Signalled { pid } => info!("forwarder {pid} reloading configuration"),
            ReloadOutcome::NotStarted => {
                warn!("forwarder has not started yet, configuration will be read at startup")
            }
        }
        *reload_pending = false;
        Ok(outcome)
    }

    async fn has_config(&self) -> bool {
        tokio::fs::try_exists(self.writer.active_path())
            .await
            .unwrap_or(false)
    }

    async fn start(&self) -> Result<(), ProcessLifecycleError> {
        self.supervisor.start().await
    }

    async fn stop(&self) -> Result<(), ProcessLifecycleError> {
        self.supervisor.stop().await
    }
}

/// Providers available to the controller, keyed by name.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, Arc<dyn LogProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn LogProvider>) -> Result<(), RegistryError> {
        let name = provider.name().to_string();
        if self.providers.contains_key(&name) {
            return Err(RegistryError::AlreadyRegistered(name));
        }
        self.providers.insert(name, provider);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn LogProvider>, RegistryError> {
        self.providers
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownProvider(name.to_string()))
    }

    pub fn names(&self) -> Vec<&str> {
        self.providers.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessState;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    /// Records the active file contents seen at each successful reload.
    struct RecordingSupervisor {
        active: PathBuf,
        failing_reloads: AtomicUsize,
        reloads: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl Supervisor for RecordingSupervisor {
        async fn start(&self) -> Result<(), ProcessLifecycleError> {
            Ok(())
        }

        async fn reload(&self) -> Result<ReloadOutcome, ProcessLifecycleError> {
            let remaining = self.failing_reloads.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failing_reloads.store(remaining - 1, Ordering::SeqCst);
                return Err(ProcessLifecycleError::NoSuchProcess(4242));
            }
            let content = std::fs::read_to_string(&self.active).unwrap();
            self.reloads.lock().unwrap().push(content);
            Ok(ReloadOutcome::Signalled { pid: 1 })
        }

        async fn stop(&self) -> Result<(), ProcessLifecycleError> {
            Ok(())
        }

        fn state(&self) -> ProcessState {
            ProcessState::Running
        }
    }

    fn provider(dir: &std::path::Path) -> (FluentdProvider, Arc<RecordingSupervisor>) {
        let writer = ConfigWriter::new(dir);
        let supervisor = Arc::new(RecordingSupervisor {
            active: writer.active_path().to_path_buf(),
            failing_reloads: AtomicUsize::new(0),
            reloads: StdMutex::new(Vec::new()),
        });
        (FluentdProvider::new(writer, supervisor.clone()), supervisor)
    }

    #[tokio::test]
    async fn test_reload_sees_installed_config() {
        let dir = tempfile::tempdir().unwrap();
        let (provider, supervisor) = provider(dir.path());

        provider.apply(&RenderedConfig::from("one")).await.unwrap();
        provider.apply(&RenderedConfig::from("two")).await.unwrap();
        assert_eq!(*supervisor.reloads.lock().unwrap(), vec!["one", "two"]);
    }

    #[tokio::test]
    async fn test_unchanged_apply_does_not_reload() {
        let dir = tempfile::tempdir().unwrap();
        let (provider, supervisor) = provider(dir.path());

        let first = provider.apply(&RenderedConfig::from("one")).await.unwrap();
        let second = provider.apply(&RenderedConfig::from("one")).await.unwrap();
        assert_eq!(first, ApplyOutcome::Installed);
        assert_eq!(second, ApplyOutcome::Unchanged);
        assert_eq!(supervisor.reloads.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_reload_is_retried_on_unchanged_apply() {
        let dir = tempfile::tempdir().unwrap();
        let (provider, supervisor) = provider(dir.path());
        supervisor.failing_reloads.store(1, Ordering::SeqCst);

        let err = provider.apply(&RenderedConfig::from("one")).await.unwrap_err();
        assert!(matches!(
            err,
            ReconcileError::Process(ProcessLifecycleError::NoSuchProcess(4242))
        ));
        assert!(supervisor.reloads.lock().unwrap().is_empty());

        let outcome = provider.apply(&RenderedConfig::from("one")).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Unchanged);
        assert_eq!(*supervisor.reloads.lock().unwrap(), vec!["one"]);

        provider.apply(&RenderedConfig::from("one")).await.unwrap();
        assert_eq!(supervisor.reloads.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_prepare_writes_without_reload() {
        let dir = tempfile::tempdir().unwrap();
        let (provider, supervisor) = provider(dir.path());

        let outcome = provider.prepare(&RenderedConfig::from("one")).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Installed);
        assert!(supervisor.reloads.lock().unwrap().is_empty());
        assert_eq!(
            std::fs::read_to_string(provider.writer().active_path()).unwrap(),
            "one"
        );
    }

    #[tokio::test]
    async fn test_has_config() {
        let dir = tempfile::tempdir().unwrap();
        let (provider, _) = provider(dir.path());
        assert!(!provider.has_config().await);
        provider.prepare(&RenderedConfig::from("one")).await.unwrap();
        assert!(provider.has_config().await);
    }

    #[tokio::test]
    async fn test_failed_write_skips_reload() {
        let dir = tempfile::tempdir().unwrap();
        let (provider, supervisor) = provider(dir.path());

        let err = provider.apply(&RenderedConfig::from("")).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Write(_)));
        assert!(supervisor.reloads.lock().unwrap().is_empty());
    }

    #[test]
    fn test_registry() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = ProviderRegistry::new();
        registry
            .register(Arc::new(provider(dir.path()).0))
            .unwrap();
        assert!(matches!(
            registry.register(Arc::new(provider(dir.path()).0)),
            Err(RegistryError::AlreadyRegistered(name)) if name == FLUENTD
        ));
        assert_eq!(registry.names(), vec![FLUENTD]);
        assert_eq!(registry.get(FLUENTD).unwrap().name(), FLUENTD);
        assert!(matches!(
            registry.get("logstash"),
            Err(RegistryError::UnknownProvider(_))
        ));
    }
}
