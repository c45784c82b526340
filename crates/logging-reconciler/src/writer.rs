// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Installs rendered configurations on disk.
//!
//! The new content is written to a temp file next to the active file, synced,
//! checked, and then renamed over the active file in a single step. A crash at
//! any point leaves either the old or the new configuration in place, never a
//! partial one. The previous configuration is kept as `<active>.bak` on a best
//! effort basis.

use crate::error::ConfigWriteError;
use crate::synthesize::RenderedConfig;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub const CONFIG_FILE: &str = "fluentd.conf";
pub const TEMP_FILE: &str = "tmp.conf";

/// What [`ConfigWriter::apply`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The active file now holds the new content.
    Installed,
    /// The active file already held identical bytes; nothing was touched.
    Unchanged,
}

#[derive(Debug)]
pub struct ConfigWriter {
    active: PathBuf,
    temp: PathBuf,
    backup: PathBuf,
    lock: Mutex<()>,
}

impl ConfigWriter {
    /// Writer for `<config_dir>/fluentd.conf`, staging through `<config_dir>/tmp.conf`.
    pub fn new(config_dir: &Path) -> Self {
        Self::with_paths(config_dir.join(CONFIG_FILE), config_dir.join(TEMP_FILE))
    }

    /// `temp` must live on the same filesystem as `active` for the install rename to be atomic.
    pub fn with_paths(active: PathBuf, temp: PathBuf) -> Self {
        let mut backup = active.clone().into_os_string();
        backup.push(".bak");
        Self {
            backup: PathBuf::from(backup),
            active,
            temp,
            lock: Mutex::new(()),
        }
    }

    pub fn active_path(&self) -> &Path {
        &self.active
    }

    pub fn backup_path(&self) -> &Path {
        &self.backup
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp
    }

    pub async fn apply(&self, rendered: &RenderedConfig) -> Result<ApplyOutcome, ConfigWriteError> {
        let _guard = self.lock.lock().await;

        if rendered.is_empty() {
            return Err(ConfigWriteError::EmptyConfig);
        }
        if self.is_current(rendered).await? {
            debug!("{} is up to date", self.active.display());
            return Ok(ApplyOutcome::Unchanged);
        }

        let staged = self.stage(rendered).await?;
        staged.verify().await?;
        staged.backup().await;
        staged.install().await?;

        info!(
            "installed {} ({} bytes)",
            self.active.display(),
            rendered.len()
        );
        Ok(ApplyOutcome::Installed)
    }

    /// Writes `rendered` to the temp file and syncs it. The active file is untouched.
    ///
    /// [`ConfigWriter::apply`] runs the remaining steps; callers driving the
    /// steps by hand must not race with it.
    pub async fn stage(&self, rendered: &RenderedConfig) -> Result<StagedConfig<'_>, ConfigWriteError> {
        let mut file = File::create(&self.temp)
            .await
            .map_err(|e| ConfigWriteError::io("stage", &self.temp, e))?;
        file.write_all(rendered.as_bytes())
            .await
            .map_err(|e| ConfigWriteError::io("stage", &self.temp, e))?;
        file.sync_all()
            .await
            .map_err(|e| ConfigWriteError::io("stage", &self.temp, e))?;
        Ok(StagedConfig { writer: self })
    }

    async fn is_current(&self, rendered: &RenderedConfig) -> Result<bool, ConfigWriteError> {
        match fs::read(&self.active).await {
            Ok(current) => Ok(current == rendered.as_bytes()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(ConfigWriteError::io("compare", &self.active, e)),
        }
    }
}

/// A configuration written to the temp file but not yet installed.
#[derive(Debug)]
pub struct StagedConfig<'a> {
    writer: &'a ConfigWriter,
}

impl StagedConfig<'_> {
    /// Checks that the staged file exists and is non-empty.
    pub async fn verify(&self) -> Result<(), ConfigWriteError> {
        let temp = &self.writer.temp;
        match fs::metadata(temp).await {
            Ok(metadata) if metadata.len() > 0 => Ok(()),
            Ok(_) => Err(ConfigWriteError::EmptyTemp(temp.clone())),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(ConfigWriteError::EmptyTemp(temp.clone()))
            }
            Err(e) => Err(ConfigWriteError::io("verify", temp, e)),
        }
    }

    /// Copies the active file to the backup path. Failures are logged and ignored.
    pub async fn backup(&self) {
        let active = &self.writer.active;
        let backup = &self.writer.backup;
        let mut partial = backup.clone().into_os_string();
        partial.push(".tmp");
        let partial = PathBuf::from(partial);

        match fs::copy(active, &partial).await {
            Ok(_) => {
                if let Err(e) = fs::rename(&partial, backup).await {
                    warn!("failed to move backup into {}: {e}", backup.display());
                    let _ = fs::remove_file(&partial).await;
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("no active configuration to back up");
            }
            Err(e) => warn!("failed to back up {}: {e}", active.display()),
        }
    }

    /// Renames the staged file over the active file and syncs both the file and its directory.
    pub async fn install(self) -> Result<(), ConfigWriteError> {
        let ConfigWriter { active, temp, .. } = self.writer;

        fs::rename(temp, active)
            .await
            .map_err(|e| ConfigWriteError::io("install", active, e))?;

        File::open(active)
            .await
            .map_err(|e| ConfigWriteError::io("sync", active, e))?
            .sync_all()
            .await
            .map_err(|e| ConfigWriteError::io("sync", active, e))?;

        if let Some(dir) = active.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            File::open(dir)
                .await
                .map_err(|e| ConfigWriteError::io("sync", dir, e))?
                .sync_all()
                .await
                .map_err(|e| ConfigWriteError::io("sync", dir, e))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn writer(dir: &Path) -> ConfigWriter {
        ConfigWriter::new(dir)
    }

    async fn read(path: &Path) -> String {
        fs::read_to_string(path).await.unwrap()
    }

    #[tokio::test]
    async fn test_first_apply_installs_without_backup() {
        let dir = tempfile::tempdir().unwrap();
        let writer = writer(dir.path());

        let outcome = writer.apply(&RenderedConfig::from("one")).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Installed);
        assert_eq!(read(writer.active_path()).await, "one");
        assert!(!writer.backup_path().exists());
        assert!(!writer.temp_path().exists());
    }

    #[tokio::test]
    async fn test_second_apply_keeps_previous_as_backup() {
        let dir = tempfile::tempdir().unwrap();
        let writer = writer(dir.path());

        writer.apply(&RenderedConfig::from("one")).await.unwrap();
        let outcome = writer.apply(&RenderedConfig::from("two")).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Installed);
        assert_eq!(read(writer.active_path()).await, "two");
        assert_eq!(read(writer.backup_path()).await, "one");
    }

    #[tokio::test]
    async fn test_identical_apply_is_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let writer = writer(dir.path());

        writer.apply(&RenderedConfig::from("one")).await.unwrap();
        writer.apply(&RenderedConfig::from("two")).await.unwrap();
        let outcome = writer.apply(&RenderedConfig::from("two")).await.unwrap();

        assert_eq!(outcome, ApplyOutcome::Unchanged);
        assert_eq!(read(writer.active_path()).await, "two");
        assert_eq!(read(writer.backup_path()).await, "one");
        assert!(!writer.temp_path().exists());
    }

    #[tokio::test]
    async fn test_empty_config_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let writer = writer(dir.path());

        let err = writer.apply(&RenderedConfig::from("")).await.unwrap_err();
        assert!(matches!(err, ConfigWriteError::EmptyConfig));
        assert!(!writer.active_path().exists());
    }

    #[tokio::test]
    async fn test_crash_after_backup_leaves_active_intact() {
        let dir = tempfile::tempdir().unwrap();
        let writer = writer(dir.path());
        writer.apply(&RenderedConfig::from("old")).await.unwrap();

        let staged = writer.stage(&RenderedConfig::from("new")).await.unwrap();
        staged.verify().await.unwrap();
        staged.backup().await;
        drop(staged);

        assert_eq!(read(writer.active_path()).await, "old");
        assert_eq!(read(writer.backup_path()).await, "old");
        assert_eq!(read(writer.temp_path()).await, "new");

        // the next apply recovers by staging again
        let outcome = writer.apply(&RenderedConfig::from("new")).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Installed);
        assert_eq!(read(writer.active_path()).await, "new");
    }

    #[tokio::test]
    async fn test_verify_rejects_missing_temp() {
        let dir = tempfile::tempdir().unwrap();
        let writer = writer(dir.path());

        let staged = writer.stage(&RenderedConfig::from("new")).await.unwrap();
        fs::remove_file(writer.temp_path()).await.unwrap();
        let err = staged.verify().await.unwrap_err();
        assert!(matches!(err, ConfigWriteError::EmptyTemp(_)));
    }

    #[tokio::test]
    async fn test_stage_into_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let writer = writer(&dir.path().join("missing"));

        let err = writer.apply(&RenderedConfig::from("one")).await.unwrap_err();
        assert!(matches!(err, ConfigWriteError::Io { step: "stage", .. }));
    }
}
