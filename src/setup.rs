use indicatif::{ProgressBar, ProgressStyle};
use reqwest::Client;
use std::fs;
use std::path::{Path, PathBuf};
use tokio::fs as async_fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::capability::ExecutionProfile;
use crate::config::{Config, WeightFile};
use crate::error::{DesubError, Result};

pub struct SetupManager {
    client: Client,
    weights_dir: PathBuf,
    files: Vec<WeightFile>,
}

impl SetupManager {
    /// Creates the work and weights directories named in `config`.
    pub fn new(config: &Config) -> Result<Self> {
        fs::create_dir_all(&config.pipeline.work_dir)?;
        fs::create_dir_all(&config.weights.dir)?;

        let client = Client::builder()
            .user_agent(concat!("desub/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            weights_dir: config.weights.dir.clone(),
            files: config.weights.files.clone(),
        })
    }

    pub fn weights_dir(&self) -> &Path {
        &self.weights_dir
    }

    pub fn weight_files(&self) -> &[WeightFile] {
        &self.files
    }

    pub fn local_path(&self, file: &WeightFile) -> PathBuf {
        self.weights_dir.join(&file.filename)
    }

    /// Weight files not yet present locally
    pub fn missing_weights(&self) -> Vec<&WeightFile> {
        self.files
            .iter()
            .filter(|file| !self.local_path(file).exists())
            .collect()
    }

    /// Fetches missing weights when the profile allows it.
    ///
    /// Returns the number of files downloaded.
    pub async fn ensure_weights(&self, profile: &ExecutionProfile) -> Result<usize> {
        let missing = self.missing_weights();
        if missing.is_empty() {
            info!("All {} weight files present", self.files.len());
            return Ok(0);
        }

        if !profile.auto_fetch_weights {
            warn!(
                "{} weight file(s) missing; automatic download is disabled on {} hosts",
                missing.len(),
                profile.device
            );
            return Ok(0);
        }

        for file in &missing {
            self.download_weight(file).await?;
        }
        Ok(missing.len())
    }

    pub async fn download_weight(&self, file: &WeightFile) -> Result<PathBuf> {
        let local_path = self.local_path(file);

        if local_path.exists() {
            info!("Weights {} already exist at {}", file.name, local_path.display());
            return Ok(local_path);
        }

        info!("Downloading {} weights from {}", file.name, file.url);

        let mut response = self.client.get(&file.url).send().await?;
        if !response.status().is_success() {
            return Err(DesubError::Transfer {
                location: file.url.clone(),
                detail: format!("HTTP {}", response.status()),
            });
        }

        let pb = ProgressBar::new(response.content_length().unwrap_or(0));
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
                .map_err(|e| DesubError::Config(format!("Invalid progress template: {}", e)))?
                .progress_chars("#>-"),
        );

        // Removed on drop unless persisted, so a failed download leaves nothing behind
        let temp_path = tempfile::Builder::new()
            .prefix(&file.filename)
            .suffix(".part")
            .tempfile_in(&self.weights_dir)?
            .into_temp_path();
        let mut file_handle = async_fs::File::create(&temp_path).await?;
        while let Some(chunk) = response.chunk().await? {
            file_handle.write_all(&chunk).await?;
            pb.inc(chunk.len() as u64);
        }
        file_handle.flush().await?;
        drop(file_handle);

        temp_path.persist(&local_path).map_err(|e| DesubError::Io(e.error))?;

        pb.finish_with_message(format!("Downloaded {}", file.name));
        info!("Successfully downloaded {} to {}", file.name, local_path.display());

        Ok(local_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_in(root: &Path) -> Config {
        let mut config = Config::default();
        config.pipeline.work_dir = root.join("runs");
        config.weights.dir = root.join("weights");
        config.weights.files = vec![
            WeightFile {
                name: "big-lama".to_string(),
                filename: "big-lama.ckpt".to_string(),
                url: "http://127.0.0.1:9/big-lama.ckpt".to_string(),
            },
            WeightFile {
                name: "refiner".to_string(),
                filename: "refiner.pth".to_string(),
                url: "http://127.0.0.1:9/refiner.pth".to_string(),
            },
        ];
        config
    }

    #[test]
    fn test_new_creates_directories() {
        let root = tempfile::tempdir().unwrap();
        let manager = SetupManager::new(&config_in(root.path())).unwrap();
        assert!(root.path().join("runs").is_dir());
        assert!(manager.weights_dir().is_dir());
    }

    #[test]
    fn test_missing_weights() {
        let root = tempfile::tempdir().unwrap();
        let manager = SetupManager::new(&config_in(root.path())).unwrap();
        fs::write(root.path().join("weights/big-lama.ckpt"), b"weights").unwrap();

        let missing = manager.missing_weights();
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].name, "refiner");
    }

    #[tokio::test]
    async fn test_cpu_profile_skips_download() {
        let root = tempfile::tempdir().unwrap();
        let manager = SetupManager::new(&config_in(root.path())).unwrap();

        // The URLs are unreachable; a download attempt would fail.
        let fetched = manager.ensure_weights(&ExecutionProfile::cpu()).await.unwrap();
        assert_eq!(fetched, 0);
        assert_eq!(manager.missing_weights().len(), 2);
    }
}
