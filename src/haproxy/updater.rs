//! Installs generated configuration and drives the HAProxy process through
//! the operator supplied shell commands.

use std::path::{Path, PathBuf};

use log::{debug, error, info};
use sha2::{Digest, Sha256};
use tokio::process::Command;

use crate::config::ServiceCommands;
use crate::errors::{Error, Result};

pub struct ServiceUpdater {
    config_file: PathBuf,
    config_file_new: PathBuf,
    config_file_backup: PathBuf,
    pid_file: PathBuf,
    check_config: String,
    status: String,
    start: String,
    reload: String,
}

impl ServiceUpdater {
    pub fn new(commands: &ServiceCommands) -> Self {
        let config_file = commands.config.clone();
        let name = config_file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "haproxy.cfg".into());

        Self {
            config_file_new: config_file.with_file_name(format!(".{}", name)),
            config_file_backup: config_file.with_file_name(format!("{}~bak", name)),
            config_file,
            pid_file: commands.pid_file.clone(),
            check_config: commands.check_config.clone(),
            status: commands.status.clone(),
            start: commands.start.clone(),
            reload: commands.reload.clone(),
        }
    }

    pub async fn needs_update(&self, new_config: &[u8]) -> Result<bool> {
        Ok(compute_hash(new_config) != self.file_hash().await?)
    }

    /// Writes `new_config` next to the live file, validates it and only then
    /// moves it into place. The live file is untouched when validation fails.
    pub async fn update_config(&self, new_config: &[u8]) -> Result<()> {
        info!("Writing new configuration to {}", self.config_file_new.display());
        tokio::fs::write(&self.config_file_new, new_config).await?;

        info!("Validating {}", self.config_file_new.display());
        if !self.validate_config(&self.config_file_new).await {
            let _ = tokio::fs::remove_file(&self.config_file_new).await;
            return Err(Error::Update("generated config is not valid".into()));
        }

        if tokio::fs::metadata(&self.config_file)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false)
        {
            debug!("Creating backup file: {}", self.config_file_backup.display());
            tokio::fs::rename(&self.config_file, &self.config_file_backup).await?;
        }

        info!("Installing new config in {}", self.config_file.display());
        tokio::fs::rename(&self.config_file_new, &self.config_file).await?;
        Ok(())
    }

    pub async fn validate_config(&self, file: &Path) -> bool {
        self.run(&self.check_config, file).await
    }

    pub async fn is_running(&self) -> bool {
        self.run(&self.status, &self.config_file).await
    }

    pub async fn start(&self) -> bool {
        self.run(&self.start, &self.config_file).await
    }

    pub async fn reload(&self) -> bool {
        self.run(&self.reload, &self.config_file).await
    }

    async fn run(&self, template: &str, config: &Path) -> bool {
        let command = template
            .replace("{config}", &config.to_string_lossy())
            .replace("{pidfile}", &self.pid_file.to_string_lossy());
        debug!("Running `{}`", command);

        match Command::new("sh").arg("-c").arg(&command).status().await {
            Ok(status) => status.success(),
            Err(e) => {
                error!("Unable to run `{}`: {}", command, e);
                false
            }
        }
    }

    /// Hash of the installed config, or of the empty string when there's none.
    async fn file_hash(&self) -> Result<String> {
        match tokio::fs::read(&self.config_file).await {
            Ok(data) => Ok(compute_hash(&data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(compute_hash(b"")),
            Err(e) => Err(e.into()),
        }
    }
}

fn compute_hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}
