// Remote artifact staging
//
// StagingClient moves files and directory trees between local disk and an
// object store addressed by `s3://bucket/key` locators. When credentials
// cannot be established the client is built anyway in an unavailable state:
// transfers fail with RemoteUnavailable and `exists` answers false, so an
// offline run can go ahead on local paths.

pub mod s3;

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

pub use s3::S3ObjectStore;

use crate::config::StorageConfig;
use crate::error::{DesubError, Result};

pub const SCHEME: &str = "s3://";

/// `s3://bucket/key`; everything after the bucket belongs to the key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteLocator {
    pub bucket: String,
    pub key: String,
}

impl RemoteLocator {
    pub fn parse(uri: &str) -> Result<Self> {
        let malformed = |reason: &str| DesubError::MalformedLocator {
            uri: uri.to_string(),
            reason: reason.to_string(),
        };

        let rest = uri
            .trim()
            .strip_prefix(SCHEME)
            .ok_or_else(|| malformed("missing s3:// scheme"))?;
        let (bucket, key) = rest
            .split_once('/')
            .ok_or_else(|| malformed("missing key after bucket"))?;

        if bucket.is_empty() {
            return Err(malformed("empty bucket"));
        }
        if key.is_empty() {
            return Err(malformed("missing key after bucket"));
        }

        Ok(Self {
            bucket: bucket.to_string(),
            key: key.to_string(),
        })
    }

    /// True when `uri` uses the remote scheme, whether or not it is well formed.
    pub fn is_remote(uri: &str) -> bool {
        uri.trim().starts_with(SCHEME)
    }

    /// Child locator `key/relative`.
    pub fn join(&self, relative: &str) -> Self {
        Self {
            bucket: self.bucket.clone(),
            key: format!(
                "{}/{}",
                self.key.trim_end_matches('/'),
                relative.trim_start_matches('/')
            ),
        }
    }
}

impl fmt::Display for RemoteLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}/{}", SCHEME, self.bucket, self.key)
    }
}

impl FromStr for RemoteLocator {
    type Err = DesubError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// The object store operations staging relies on.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Stream an object into a local file
    async fn get_to_path(&self, bucket: &str, key: &str, path: &Path) -> Result<()>;

    /// Stream a local file into an object
    async fn put_from_path(&self, bucket: &str, key: &str, path: &Path) -> Result<()>;

    /// Whether an object exists
    async fn head(&self, bucket: &str, key: &str) -> Result<bool>;

    /// Keys under a prefix
    async fn list_keys(&self, bucket: &str, prefix: &str) -> Result<Vec<String>>;
}

/// Outcome of a best-effort bulk transfer.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TreeTransferReport {
    pub attempted: usize,
    pub transferred: usize,
    pub failures: Vec<TransferFailure>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferFailure {
    pub path: PathBuf,
    pub error: String,
}

impl TreeTransferReport {
    fn record(mut self, path: PathBuf, outcome: Result<()>) -> Self {
        self.attempted += 1;
        match outcome {
            Ok(()) => self.transferred += 1,
            Err(e) => {
                warn!("Failed to transfer {}: {}", path.display(), e);
                self.failures.push(TransferFailure {
                    path,
                    error: e.to_string(),
                });
            }
        }
        self
    }

    fn into_result(self, location: String) -> Result<Self> {
        if self.transferred > 0 {
            return Ok(self);
        }
        let detail = match self.failures.first() {
            Some(first) => format!(
                "none of {} files transferred (first error: {})",
                self.attempted, first.error
            ),
            None => "no files to transfer".to_string(),
        };
        Err(DesubError::Transfer { location, detail })
    }
}

pub struct StagingClient {
    store: Option<Arc<dyn ObjectStore>>,
    unavailable_reason: String,
}

impl StagingClient {
    /// Connects to S3; never fails, degrading to the unavailable state.
    pub async fn connect(config: &StorageConfig) -> Self {
        match S3ObjectStore::connect(config).await {
            Ok(store) => {
                info!("Remote storage credentials configured successfully");
                Self::with_store(Arc::new(store))
            }
            Err(e) => {
                warn!("Remote storage unavailable, continuing with local paths only: {}", e);
                Self::unavailable(e.to_string())
            }
        }
    }

    pub fn with_store(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store: Some(store),
            unavailable_reason: String::new(),
        }
    }

    pub fn unavailable<S: Into<String>>(reason: S) -> Self {
        Self {
            store: None,
            unavailable_reason: reason.into(),
        }
    }

    pub fn is_available(&self) -> bool {
        self.store.is_some()
    }

    fn store(&self) -> Result<&dyn ObjectStore> {
        self.store
            .as_deref()
            .ok_or_else(|| DesubError::RemoteUnavailable(self.unavailable_reason.clone()))
    }

    /// Downloads one object; returns the local size in bytes.
    pub async fn download<P: AsRef<Path>>(&self, locator: &RemoteLocator, local_path: P) -> Result<u64> {
        let store = self.store()?;
        let local_path = local_path.as_ref();

        if let Some(parent) = local_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        info!("Downloading {} -> {}", locator, local_path.display());
        store
            .get_to_path(&locator.bucket, &locator.key, local_path)
            .await?;

        // An empty or absent file after a successful call is still a failure.
        let size = match tokio::fs::metadata(local_path).await {
            Ok(meta) if meta.is_file() && meta.len() > 0 => meta.len(),
            _ => {
                return Err(DesubError::Transfer {
                    location: locator.to_string(),
                    detail: format!("{} is missing or empty after download", local_path.display()),
                });
            }
        };

        info!("Downloaded successfully ({:.1} MB)", size as f64 / 1024.0 / 1024.0);
        Ok(size)
    }

    /// Uploads one local file; returns its size in bytes.
    pub async fn upload<P: AsRef<Path>>(&self, local_path: P, locator: &RemoteLocator) -> Result<u64> {
        let store = self.store()?;
        let local_path = local_path.as_ref();

        let size = match tokio::fs::metadata(local_path).await {
            Ok(meta) if meta.is_file() => meta.len(),
            _ => return Err(DesubError::FileNotFound(local_path.to_path_buf())),
        };

        info!(
            "Uploading {} ({:.1} MB) -> {}",
            local_path.display(),
            size as f64 / 1024.0 / 1024.0,
            locator
        );
        store
            .put_from_path(&locator.bucket, &locator.key, local_path)
            .await?;

        info!("Upload completed successfully");
        Ok(size)
    }

    /// Uploads every file under `local_dir` to `base/<relative path>`.
    ///
    /// Individual failures are recorded and the walk continues; the call
    /// fails only when no file at all was uploaded.
    pub async fn upload_tree<P: AsRef<Path>>(
        &self,
        local_dir: P,
        base: &RemoteLocator,
    ) -> Result<TreeTransferReport> {
        let store = self.store()?;
        let local_dir = local_dir.as_ref();
        if !local_dir.is_dir() {
            return Err(DesubError::FileNotFound(local_dir.to_path_buf()));
        }

        info!("Uploading directory {} -> {}", local_dir.display(), base);

        let mut files: Vec<PathBuf> = Vec::new();
        let mut report = TreeTransferReport::default();
        for entry in WalkDir::new(local_dir).sort_by_file_name() {
            match entry {
                Ok(entry) if entry.file_type().is_file() => files.push(entry.into_path()),
                Ok(_) => {}
                Err(e) => {
                    let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| local_dir.to_path_buf());
                    report = report.record(path, Err(DesubError::Io(e.into())));
                }
            }
        }

        for path in files {
            let outcome = match relative_key(local_dir, &path) {
                Some(relative) => {
                    let target = base.join(&relative);
                    debug!("Uploading {} -> {}", relative, target);
                    store.put_from_path(&target.bucket, &target.key, &path).await
                }
                None => Err(DesubError::Config(format!(
                    "{} is not below {}",
                    path.display(),
                    local_dir.display()
                ))),
            };
            report = report.record(path, outcome);
        }

        info!(
            "Directory upload completed: {}/{} files",
            report.transferred, report.attempted
        );
        report.into_result(base.to_string())
    }

    /// Downloads every object under `base/` into `local_dir`, same accounting
    /// as [`upload_tree`](Self::upload_tree).
    pub async fn download_tree<P: AsRef<Path>>(
        &self,
        base: &RemoteLocator,
        local_dir: P,
    ) -> Result<TreeTransferReport> {
        let store = self.store()?;
        let local_dir = local_dir.as_ref();
        let prefix = format!("{}/", base.key.trim_end_matches('/'));

        info!("Downloading directory {} -> {}", base, local_dir.display());
        let keys = store.list_keys(&base.bucket, &prefix).await?;

        let mut report = TreeTransferReport::default();
        for key in keys {
            let relative = match key.strip_prefix(&prefix) {
                Some(relative) if !relative.is_empty() && !relative.ends_with('/') => relative,
                _ => continue,
            };
            let target = local_dir.join(relative);
            let outcome = if safe_relative(relative) {
                let locator = RemoteLocator {
                    bucket: base.bucket.clone(),
                    key: key.clone(),
                };
                self.download(&locator, &target).await.map(|_| ())
            } else {
                Err(DesubError::Config(format!(
                    "refusing to write outside {} for key {}",
                    local_dir.display(),
                    key
                )))
            };
            report = report.record(target, outcome);
        }

        info!(
            "Directory download completed: {}/{} files",
            report.transferred, report.attempted
        );
        report.into_result(base.to_string())
    }

    /// Whether the object exists. Unavailable storage and probe errors both
    /// answer `false`, preferring a redundant transfer over a wrong skip.
    pub async fn exists(&self, locator: &RemoteLocator) -> bool {
        let Ok(store) = self.store() else {
            return false;
        };

        match store.head(&locator.bucket, &locator.key).await {
            Ok(found) => found,
            Err(e) => {
                debug!("Existence check for {} failed: {}", locator, e);
                false
            }
        }
    }
}

/// Relative path of `path` under `root`, with `/` separators.
fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let relative = pathdiff::diff_paths(path, root)?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Option<_>>()?;

    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

fn safe_relative(relative: &str) -> bool {
    Path::new(relative)
        .components()
        .all(|c| matches!(c, Component::Normal(_)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Mutex;

    #[test]
    fn test_parse_locator() {
        let locator = RemoteLocator::parse("s3://bucket/a/b/c").unwrap();
        assert_eq!(locator.bucket, "bucket");
        assert_eq!(locator.key, "a/b/c");
        assert_eq!(locator.to_string(), "s3://bucket/a/b/c");
    }

    #[test]
    fn test_parse_locator_rejects_malformed() {
        for uri in ["bucket/key", "s3://bucket", "s3://bucket/", "s3:///key", "http://bucket/key"] {
            let err = RemoteLocator::parse(uri).unwrap_err();
            assert!(
                matches!(err, DesubError::MalformedLocator { .. }),
                "{} should be malformed",
                uri
            );
        }
        assert!(
            RemoteLocator::parse("bucket/key")
                .unwrap_err()
                .to_string()
                .contains("scheme")
        );
        assert!(
            RemoteLocator::parse("s3://bucket")
                .unwrap_err()
                .to_string()
                .contains("missing key")
        );
    }

    #[test]
    fn test_join_and_relative_keys() {
        let base = RemoteLocator::parse("s3://bucket/runs/42/").unwrap();
        assert_eq!(base.join("frames/frame_00001.png").key, "runs/42/frames/frame_00001.png");

        let root = Path::new("/work/run");
        assert_eq!(
            relative_key(root, Path::new("/work/run/masks/mask_00001.png")).as_deref(),
            Some("masks/mask_00001.png")
        );
        assert!(relative_key(root, root).is_none());
        assert!(!safe_relative("../etc/passwd"));
        assert!(safe_relative("frames/frame_00001.png"));
    }

    #[tokio::test]
    async fn test_unavailable_client() {
        let client = StagingClient::unavailable("no credentials");
        let locator = RemoteLocator::parse("s3://bucket/video.mp4").unwrap();
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("nested/video.mp4");

        assert!(!client.is_available());
        assert!(!client.exists(&locator).await);

        let err = client.download(&locator, &target).await.unwrap_err();
        assert!(matches!(err, DesubError::RemoteUnavailable(_)));
        assert!(!target.parent().unwrap().exists());

        let err = client.upload(dir.path(), &locator).await.unwrap_err();
        assert!(matches!(err, DesubError::RemoteUnavailable(_)));
    }

    #[tokio::test]
    async fn test_upload_tree_continues_past_failures() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("frames")).unwrap();
        for index in 1..=4 {
            fs::write(dir.path().join(format!("frames/frame_{:05}.png", index)), b"png").unwrap();
        }
        fs::write(dir.path().join("report.json"), b"{}").unwrap();

        let uploaded = Arc::new(Mutex::new(Vec::new()));
        let seen = uploaded.clone();
        let mut store = MockObjectStore::new();
        store
            .expect_put_from_path()
            .times(5)
            .returning(move |bucket, key, _| {
                if key.ends_with("frame_00003.png") {
                    return Err(DesubError::Transfer {
                        location: format!("s3://{}/{}", bucket, key),
                        detail: "checksum mismatch".to_string(),
                    });
                }
                seen.lock().unwrap().push(key.to_string());
                Ok(())
            });

        let client = StagingClient::with_store(Arc::new(store));
        let base = RemoteLocator::parse("s3://bucket/runs/1").unwrap();
        let report = client.upload_tree(dir.path(), &base).await.unwrap();

        assert_eq!(report.attempted, 5);
        assert_eq!(report.transferred, 4);
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].path.ends_with("frames/frame_00003.png"));
        assert!(report.failures[0].error.contains("checksum mismatch"));

        let keys = uploaded.lock().unwrap();
        assert!(keys.contains(&"runs/1/frames/frame_00001.png".to_string()));
        assert!(keys.contains(&"runs/1/report.json".to_string()));
    }

    #[tokio::test]
    async fn test_upload_tree_fails_when_nothing_uploaded() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.png"), b"a").unwrap();

        let mut store = MockObjectStore::new();
        store.expect_put_from_path().returning(|_, _, _| {
            Err(DesubError::Transfer {
                location: "s3://bucket/x".to_string(),
                detail: "access denied".to_string(),
            })
        });

        let client = StagingClient::with_store(Arc::new(store));
        let base = RemoteLocator::parse("s3://bucket/x").unwrap();
        let err = client.upload_tree(dir.path(), &base).await.unwrap_err();
        assert!(err.to_string().contains("access denied"));
    }

    #[tokio::test]
    async fn test_download_creates_parents_and_checks_size() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = MockObjectStore::new();
        store
            .expect_get_to_path()
            .returning(|_, key, path| {
                let body: &[u8] = if key == "empty.mp4" { b"" } else { b"video" };
                fs::write(path, body).unwrap();
                Ok(())
            });
        let client = StagingClient::with_store(Arc::new(store));

        let target = dir.path().join("input/source.mp4");
        let size = client
            .download(&RemoteLocator::parse("s3://bucket/source.mp4").unwrap(), &target)
            .await
            .unwrap();
        assert_eq!(size, 5);
        assert!(target.exists());

        let err = client
            .download(
                &RemoteLocator::parse("s3://bucket/empty.mp4").unwrap(),
                dir.path().join("empty.mp4"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DesubError::Transfer { .. }));
    }

    #[tokio::test]
    async fn test_upload_missing_local_file() {
        let mut store = MockObjectStore::new();
        store.expect_put_from_path().never();
        let client = StagingClient::with_store(Arc::new(store));

        let err = client
            .upload("/nonexistent/out.mp4", &RemoteLocator::parse("s3://bucket/out.mp4").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, DesubError::FileNotFound(_)));
    }

    #[tokio::test]
    async fn test_exists_treats_errors_as_absent() {
        let mut store = MockObjectStore::new();
        store.expect_head().returning(|bucket, key| match key {
            "present.mp4" => Ok(true),
            "absent.mp4" => Ok(false),
            _ => Err(DesubError::Transfer {
                location: format!("s3://{}/{}", bucket, key),
                detail: "timeout".to_string(),
            }),
        });
        let client = StagingClient::with_store(Arc::new(store));

        assert!(client.exists(&RemoteLocator::parse("s3://b/present.mp4").unwrap()).await);
        assert!(!client.exists(&RemoteLocator::parse("s3://b/absent.mp4").unwrap()).await);
        assert!(!client.exists(&RemoteLocator::parse("s3://b/flaky.mp4").unwrap()).await);
    }

    #[tokio::test]
    async fn test_download_tree_maps_keys_to_paths() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = MockObjectStore::new();
        store.expect_list_keys().returning(|_, prefix| {
            assert_eq!(prefix, "runs/7/");
            Ok(vec![
                "runs/7/".to_string(),
                "runs/7/frames/frame_00001.png".to_string(),
                "runs/7/../escape.png".to_string(),
            ])
        });
        store.expect_get_to_path().returning(|_, _, path| {
            fs::write(path, b"png").unwrap();
            Ok(())
        });
        let client = StagingClient::with_store(Arc::new(store));

        let report = client
            .download_tree(&RemoteLocator::parse("s3://bucket/runs/7").unwrap(), dir.path())
            .await
            .unwrap();

        assert_eq!(report.attempted, 2);
        assert_eq!(report.transferred, 1);
        assert!(dir.path().join("frames/frame_00001.png").exists());
        assert!(!dir.path().parent().unwrap().join("escape.png").exists());
    }
}
