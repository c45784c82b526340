// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use anyhow::{Context, Result};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use logging_reconciler::{
    ControllerConfig, FluentdProvider, KubeLoggingSource, LoggingController, ProviderRegistry,
};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
pub async fn main() -> Result<()> {
    let config = ControllerConfig::from_env();
    let log_level = config
        .as_ref()
        .map(|config| config.log_level.clone())
        .unwrap_or_else(|_| "info".to_string());
    init_logging(&log_level)?;
    let config = config.context("failed to load controller configuration")?;

    let client = kube_client(&config).await?;
    let version = client
        .apiserver_version()
        .await
        .context("Kubernetes API server is not reachable")?;
    info!("connected to Kubernetes API server {}", version.git_version);

    let mut registry = ProviderRegistry::new();
    registry.register(Arc::new(FluentdProvider::from_config(&config)))?;
    let provider = registry.get(&config.provider)?;
    debug!("available providers: {}", registry.names().join(", "));

    let source = Arc::new(KubeLoggingSource::new(client, &config.namespace));
    let controller = LoggingController::new(config, source, provider);
    let handle = controller.handle();

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    if let Err(e) = controller.run(cancel).await {
        error!("logging controller failed: {e}");
        return Err(e.into());
    }
    info!("exiting with controller status {:?}", handle.status());
    Ok(())
}

fn init_logging(log_level: &str) -> Result<()> {
    let env_filter = format!("h2=off,hyper=off,rustls=off,tower=off,kube_client=warn,{log_level}");

    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).context("could not parse log level in configuration")?,
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;

    debug!("Logging subsystem enabled");
    Ok(())
}

/// Client from `LOGGING_KUBECONFIG` when set, otherwise in-cluster or `KUBECONFIG` inference.
async fn kube_client(config: &ControllerConfig) -> Result<Client> {
    let kube_config = match &config.kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)
                .with_context(|| format!("failed to read kubeconfig {}", path.display()))?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .context("invalid kubeconfig")?
        }
        None => Config::infer()
            .await
            .context("failed to infer Kubernetes configuration")?,
    };
    Client::try_from(kube_config).context("failed to build Kubernetes client")
}

async fn cancel_on_signal(cancel: CancellationToken) {
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            error!("failed to install SIGTERM handler: {e}");
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
            return;
        }
    };

    tokio::select! {
        _ = terminate.recv() => info!("received SIGTERM"),
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => info!("received interrupt"),
            Err(e) => error!("failed to listen for interrupt: {e}"),
        },
    }
    cancel.cancel();
}
