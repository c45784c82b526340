// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::error::ReconcileError;
use crate::informer::LoggingCache;
use crate::model::{LoggingSpec, ObjectKey};
use crate::provider::LogProvider;
use crate::secret::SecretBundle;
use crate::synthesize::synthesize;
use crate::worker::Reconcile;
use crate::writer::ApplyOutcome;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// How a rendered configuration reaches the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyMode {
    /// Write only. Used before the forwarder is started.
    Prepare,
    /// Write, then reload the forwarder if the file changed.
    Apply,
}

/// Renders the cached Logging object together with the current secret and hands it to the provider.
pub struct LoggingReconciler {
    cache: LoggingCache,
    provider: Arc<dyn LogProvider>,
    secret_path: PathBuf,
}

impl LoggingReconciler {
    pub fn new(cache: LoggingCache, provider: Arc<dyn LogProvider>, secret_path: PathBuf) -> Self {
        Self {
            cache,
            provider,
            secret_path,
        }
    }

    /// Returns `None` when the cache holds no object for `key`; the last
    /// installed configuration is then left as it is. In `Prepare` mode with
    /// nothing installed yet, a configuration without sources or outputs is
    /// installed instead so the forwarder can start.
    pub async fn sync(
        &self,
        key: &ObjectKey,
        mode: ApplyMode,
    ) -> Result<Option<ApplyOutcome>, ReconcileError> {
        if !self.cache.has_synced() {
            return Err(ReconcileError::CacheNotSynced);
        }
        let Some(logging) = self.cache.get(key).await else {
            if mode == ApplyMode::Prepare && !self.provider.has_config().await {
                info!("{key} not found and nothing installed, installing an empty configuration");
                let rendered = synthesize(&LoggingSpec::default(), &SecretBundle::default())?;
                return Ok(Some(self.provider.prepare(&rendered).await?));
            }
            info!("{key} not found, keeping the last applied configuration");
            return Ok(None);
        };

        let secrets = SecretBundle::load(&self.secret_path).await?;
        let rendered = synthesize(&logging.spec, &secrets)?;
        let outcome = match mode {
            ApplyMode::Prepare => self.provider.prepare(&rendered).await?,
            ApplyMode::Apply => self.provider.apply(&rendered).await?,
        };

        info!(
            "{key}: {:?} {} configuration ({} targets, {} secrets, secretVersion {})",
            outcome,
            self.provider.name(),
            logging.spec.targets.len(),
            secrets.len(),
            logging.spec.secret_version.as_deref().unwrap_or("-")
        );
        Ok(Some(outcome))
    }
}

#[async_trait]
impl Reconcile for LoggingReconciler {
    async fn reconcile(&self, key: &ObjectKey) -> Result<(), ReconcileError> {
        self.sync(key, ApplyMode::Apply).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{DecodeError, ProcessLifecycleError};
    use crate::model::{Logging, Target};
    use crate::synthesize::RenderedConfig;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingProvider {
        calls: Mutex<Vec<(ApplyMode, String)>>,
    }

    impl RecordingProvider {
        fn record(&self, mode: ApplyMode, rendered: &RenderedConfig) -> ApplyOutcome {
            let text = String::from_utf8(rendered.as_bytes().to_vec()).unwrap();
            self.calls.lock().unwrap().push((mode, text));
            ApplyOutcome::Installed
        }
    }

    #[async_trait]
    impl LogProvider for RecordingProvider {
        fn name(&self) -> &str {
            "recording"
        }

        async fn prepare(&self, rendered: &RenderedConfig) -> Result<ApplyOutcome, ReconcileError> {
            Ok(self.record(ApplyMode::Prepare, rendered))
        }

        async fn apply(&self, rendered: &RenderedConfig) -> Result<ApplyOutcome, ReconcileError> {
            Ok(self.record(ApplyMode::Apply, rendered))
        }

        async fn start(&self) -> Result<(), ProcessLifecycleError> {
            Ok(())
        }

        async fn has_config(&self) -> bool {
            !self.calls.lock().unwrap().is_empty()
        }

        async fn stop(&self) -> Result<(), ProcessLifecycleError> {
            Ok(())
        }
    }

    fn key() -> ObjectKey {
        ObjectKey::new("cattle-system", "rancherlogging")
    }

    fn logging() -> Logging {
        let mut logging = Logging::new(
            "rancherlogging",
            LoggingSpec {
                targets: vec![Target {
                    environment: "prod".to_string(),
                    output_type: "es".to_string(),
                    output_host: Some("es.local".to_string()),
                    output_port: Some(9200),
                    ..Default::default()
                }],
                ..Default::default()
            },
        );
        logging.metadata.namespace = Some("cattle-system".to_string());
        logging
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        secret_path: PathBuf,
        cache: LoggingCache,
        provider: Arc<RecordingProvider>,
        reconciler: LoggingReconciler,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let secret_path = dir.path().join("loggingsecret");
        let cache = LoggingCache::new();
        let provider = Arc::new(RecordingProvider::default());
        let reconciler = LoggingReconciler::new(cache.clone(), provider.clone(), secret_path.clone());
        Fixture {
            _dir: dir,
            secret_path,
            cache,
            provider,
            reconciler,
        }
    }

    #[tokio::test]
    async fn test_not_synced() {
        let fixture = fixture();
        let err = fixture.reconciler.reconcile(&key()).await.unwrap_err();
        assert!(matches!(err, ReconcileError::CacheNotSynced));
    }

    #[tokio::test]
    async fn test_missing_object_keeps_last_config() {
        let fixture = fixture();
        fixture.cache.replace(Vec::new()).await;
        assert_eq!(
            fixture.reconciler.sync(&key(), ApplyMode::Apply).await.unwrap(),
            None
        );
        assert!(fixture.provider.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_object_prepares_empty_config_once() {
        let fixture = fixture();
        fixture.cache.replace(Vec::new()).await;

        let outcome = fixture.reconciler.sync(&key(), ApplyMode::Prepare).await.unwrap();
        assert_eq!(outcome, Some(ApplyOutcome::Installed));
        {
            let calls = fixture.provider.calls.lock().unwrap();
            assert_eq!(calls.len(), 1);
            assert_eq!(calls[0].0, ApplyMode::Prepare);
            assert!(calls[0].1.contains("<system>"));
            assert!(!calls[0].1.contains("<source>"));
            assert!(!calls[0].1.contains("<match"));
        }

        let outcome = fixture.reconciler.sync(&key(), ApplyMode::Prepare).await.unwrap();
        assert_eq!(outcome, None);
        assert_eq!(fixture.provider.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_renders_with_secret() {
        let fixture = fixture();
        fixture.cache.replace(vec![logging()]).await;
        tokio::fs::write(
            &fixture.secret_path,
            r#"{"secrets": [{"type": "es", "environment": "prod", "data": {"user": "u", "password": "p"}}]}"#,
        )
        .await
        .unwrap();

        fixture.reconciler.reconcile(&key()).await.unwrap();
        fixture.reconciler.sync(&key(), ApplyMode::Prepare).await.unwrap();

        let calls = fixture.provider.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, ApplyMode::Apply);
        assert_eq!(calls[1].0, ApplyMode::Prepare);
        assert!(calls[0].1.contains("host es.local"));
        assert!(calls[0].1.contains("password \"p\""));
    }

    #[tokio::test]
    async fn test_missing_secret_file_renders_without_credentials() {
        let fixture = fixture();
        fixture.cache.replace(vec![logging()]).await;

        fixture.reconciler.reconcile(&key()).await.unwrap();
        let calls = fixture.provider.calls.lock().unwrap();
        assert!(!calls[0].1.contains("password"));
    }

    #[tokio::test]
    async fn test_bad_secret_fails_before_provider() {
        let fixture = fixture();
        fixture.cache.replace(vec![logging()]).await;
        tokio::fs::write(&fixture.secret_path, "{").await.unwrap();

        let err = fixture.reconciler.reconcile(&key()).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Decode(DecodeError::Json(_))));
        assert!(fixture.provider.calls.lock().unwrap().is_empty());
    }
}
