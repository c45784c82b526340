// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Helper functions for integration tests

use logging_reconciler::{ControllerConfig, Logging, LoggingSpec, Target};
use std::path::Path;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};

pub const NAMESPACE: &str = "cattle-system";
pub const NAME: &str = "rancherlogging";

/// Controller configuration rooted in `dir`, with short retry delays.
#[allow(dead_code)]
pub fn test_config(dir: &Path) -> ControllerConfig {
    ControllerConfig {
        namespace: NAMESPACE.to_string(),
        name: NAME.to_string(),
        secret_path: dir.join("secret").join("loggingsecret"),
        config_dir: dir.join("etc"),
        start_attempts: 2,
        retry_base: Duration::from_millis(10),
        retry_max: Duration::from_millis(100),
        ..Default::default()
    }
}

/// The watched Logging object with a single elasticsearch target for `prod`.
#[allow(dead_code)]
pub fn es_logging(resource_version: &str) -> Logging {
    let spec = LoggingSpec {
        targets: vec![Target {
            environment: "prod".to_string(),
            output_type: "es".to_string(),
            output_host: Some("es.local".to_string()),
            output_port: Some(9200),
            ..Default::default()
        }],
        ..Default::default()
    };
    let mut logging = Logging::new(NAME, spec);
    logging.metadata.namespace = Some(NAMESPACE.to_string());
    logging.metadata.resource_version = Some(resource_version.to_string());
    logging
}

/// Secret document holding elasticsearch credentials for `prod`.
#[allow(dead_code)]
pub fn es_secret(user: &str, password: &str) -> String {
    format!(
        r#"[{{"type": "es", "environment": "prod", "data": {{"user": "{user}", "password": "{password}"}}}}]"#
    )
}

/// Writes `content` to `path`, creating parent directories.
#[allow(dead_code)]
pub fn write_file(path: &Path, content: &str) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("Failed to create parent directory");
    }
    std::fs::write(path, content).expect("Failed to write file");
}

/// Polls `condition` every 10ms until it holds, panicking after five seconds.
#[allow(dead_code)]
pub async fn eventually<F>(what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        if Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        sleep(Duration::from_millis(10)).await;
    }
}

/// Awaits `future`, panicking if it takes longer than five seconds.
#[allow(dead_code)]
pub async fn within<F: std::future::Future>(what: &str, future: F) -> F::Output {
    timeout(Duration::from_secs(5), future)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
}
