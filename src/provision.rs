//! Language-data provisioning.
//!
//! Copies the read-only `tessdata` bundle into a writable runtime directory
//! before recognition. Every refresh copies into a sibling staging directory
//! first and swaps it into place with renames, so a failed copy leaves the
//! previous complete data set untouched.
//!
//! The staged directory is guarded by an `RwLock`: provisioning holds the
//! write side, and callers keep a [`DataLease`] (read side) for as long as the
//! engine may read from the directory.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{OwnedRwLockReadGuard, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Name of the staged directory under the runtime root.
pub const DATA_DIR_NAME: &str = "tessdata";

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("language data bundle not found at {}", .0.display())]
    SourceMissing(PathBuf),
    #[error("writable data directory unavailable: {0}")]
    DestinationUnavailable(String),
    #[error("failed to copy language data: {0}")]
    CopyFailed(String),
}

/// When the bundle is re-copied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionPolicy {
    /// Full refresh before every request.
    Always,
    /// Refresh on first use per process; later calls only check the staged
    /// directory still exists.
    Once,
}

impl ProvisionPolicy {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "always" => Some(Self::Always),
            "once" => Some(Self::Once),
            _ => None,
        }
    }
}

/// Summary of the staged directory handed out with every lease.
#[derive(Debug, Clone, Serialize)]
pub struct ProvisionReport {
    pub path: PathBuf,
    pub files: usize,
    /// False when a warm `Once` call reused the existing copy.
    pub refreshed: bool,
}

#[derive(Debug, Default)]
struct StagedState {
    current: Option<ProvisionReport>,
}

/// Read access to the provisioned directory.
///
/// No re-provisioning can swap the directory while a lease is alive.
pub struct DataLease {
    report: ProvisionReport,
    _guard: OwnedRwLockReadGuard<StagedState>,
}

impl DataLease {
    pub fn path(&self) -> &Path {
        &self.report.path
    }

    pub fn report(&self) -> &ProvisionReport {
        &self.report
    }
}

/// Owns the writable language-data directory.
pub struct Provisioner {
    source: PathBuf,
    runtime_root: Option<PathBuf>,
    policy: ProvisionPolicy,
    state: Arc<RwLock<StagedState>>,
}

impl Provisioner {
    /// `runtime_root` is `None` when the platform offers no writable location;
    /// provisioning then fails with `DestinationUnavailable`.
    pub fn new(source: PathBuf, runtime_root: Option<PathBuf>, policy: ProvisionPolicy) -> Self {
        Self {
            source,
            runtime_root,
            policy,
            state: Arc::new(RwLock::new(StagedState::default())),
        }
    }

    /// Make sure the writable directory holds a complete copy of the bundle
    /// and return a lease on it.
    pub async fn ensure_provisioned(&self) -> Result<DataLease, ProvisionError> {
        let state = self.state.clone().write_owned().await;
        let source = self.source.clone();
        let root = self.runtime_root.clone();
        let policy = self.policy;

        // The write guard moves with the copy: a caller dropped mid-await must
        // not release the lock while the swap is still running.
        let (state, staged) = tokio::task::spawn_blocking(move || {
            let mut state = state;
            let staged = refresh(&mut state, policy, &source, root.as_deref());
            (state, staged)
        })
        .await
        .map_err(|e| ProvisionError::CopyFailed(format!("provisioning task failed: {}", e)))?;

        Ok(DataLease {
            report: staged?,
            _guard: state.downgrade(),
        })
    }
}

/// Runs with the write lock held.
fn refresh(
    state: &mut StagedState,
    policy: ProvisionPolicy,
    source: &Path,
    root: Option<&Path>,
) -> Result<ProvisionReport, ProvisionError> {
    if policy == ProvisionPolicy::Once {
        if let Some(current) = &state.current {
            if current.path.is_dir() {
                debug!("Provisioner: reusing {}", current.path.display());
                return Ok(ProvisionReport {
                    refreshed: false,
                    ..current.clone()
                });
            }
            warn!(
                "Provisioner: staged directory {} vanished, staging again",
                current.path.display()
            );
        }
    }

    match stage(source, root) {
        Ok(report) => {
            info!(
                path = %report.path.display(),
                files = report.files,
                "Provisioner: language data staged"
            );
            state.current = Some(report.clone());
            Ok(report)
        }
        Err(e) => {
            error!("Provisioner: failed to stage language data: {}", e);
            Err(e)
        }
    }
}

/// Copy `source` into `<root>/tessdata`, replacing any previous copy.
fn stage(source: &Path, root: Option<&Path>) -> Result<ProvisionReport, ProvisionError> {
    if !source.is_dir() {
        return Err(ProvisionError::SourceMissing(source.to_path_buf()));
    }

    let root = root.ok_or_else(|| {
        ProvisionError::DestinationUnavailable("no writable data directory available".to_string())
    })?;
    fs::create_dir_all(root).map_err(|e| {
        ProvisionError::DestinationUnavailable(format!("{}: {}", root.display(), e))
    })?;

    let dest = root.join(DATA_DIR_NAME);
    let staging = root.join(format!(".{}-staging-{}", DATA_DIR_NAME, Uuid::new_v4()));

    let files = match copy_tree(source, &staging) {
        Ok(files) => files,
        Err(e) => {
            discard(&staging);
            return Err(ProvisionError::CopyFailed(format!(
                "{} -> {}: {}",
                source.display(),
                staging.display(),
                e
            )));
        }
    };

    if let Err(e) = swap_into_place(&staging, &dest) {
        discard(&staging);
        return Err(ProvisionError::CopyFailed(format!(
            "could not move staged data into {}: {}",
            dest.display(),
            e
        )));
    }

    Ok(ProvisionReport {
        path: dest,
        files,
        refreshed: true,
    })
}

/// Recursively copy a directory tree, following symlinks. Returns the number
/// of files copied.
fn copy_tree(from: &Path, to: &Path) -> io::Result<usize> {
    fs::create_dir_all(to)?;
    let mut files = 0;

    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let path = entry.path();
        let target = to.join(entry.file_name());

        if fs::metadata(&path)?.is_dir() {
            files += copy_tree(&path, &target)?;
        } else {
            fs::copy(&path, &target)?;
            files += 1;
        }
    }

    Ok(files)
}

/// Replace `dest` with `staging`. The old copy is renamed aside first and
/// restored if the second rename fails.
fn swap_into_place(staging: &Path, dest: &Path) -> io::Result<()> {
    if !dest.exists() {
        return fs::rename(staging, dest);
    }

    let retired = dest.with_file_name(format!(".{}-retired-{}", DATA_DIR_NAME, Uuid::new_v4()));
    fs::rename(dest, &retired)?;

    if let Err(e) = fs::rename(staging, dest) {
        if let Err(restore) = fs::rename(&retired, dest) {
            error!(
                "Provisioner: could not restore {} after failed swap: {}",
                dest.display(),
                restore
            );
        }
        return Err(e);
    }

    discard(&retired);
    Ok(())
}

fn discard(dir: &Path) {
    if let Err(e) = fs::remove_dir_all(dir) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!("Provisioner: could not remove {}: {}", dir.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::time::Duration;
    use tempfile::TempDir;

    fn bundle(dir: &Path) -> PathBuf {
        let source = dir.join("bundle");
        fs::create_dir_all(source.join("configs")).unwrap();
        fs::write(source.join("eng.traineddata"), b"eng-model").unwrap();
        fs::write(source.join("deu.traineddata"), b"deu-model").unwrap();
        fs::write(source.join("configs").join("hocr"), b"tessedit_create_hocr 1").unwrap();
        source
    }

    fn file_set(dir: &Path) -> BTreeSet<PathBuf> {
        let mut out = BTreeSet::new();
        let mut pending = vec![dir.to_path_buf()];
        while let Some(current) = pending.pop() {
            for entry in fs::read_dir(&current).unwrap() {
                let path = entry.unwrap().path();
                if path.is_dir() {
                    pending.push(path);
                } else {
                    out.insert(path.strip_prefix(dir).unwrap().to_path_buf());
                }
            }
        }
        out
    }

    fn leftovers(root: &Path) -> Vec<String> {
        fs::read_dir(root)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with('.'))
            .collect()
    }

    #[tokio::test]
    async fn test_stages_full_bundle() {
        let tmp = TempDir::new().unwrap();
        let source = bundle(tmp.path());
        let root = tmp.path().join("runtime");
        let provisioner = Provisioner::new(source.clone(), Some(root.clone()), ProvisionPolicy::Always);

        let lease = provisioner.ensure_provisioned().await.unwrap();
        assert_eq!(lease.path(), root.join(DATA_DIR_NAME));
        assert_eq!(lease.report().files, 3);
        assert!(lease.report().refreshed);
        assert_eq!(file_set(lease.path()), file_set(&source));
        assert_eq!(
            fs::read(lease.path().join("eng.traineddata")).unwrap(),
            b"eng-model"
        );
    }

    #[tokio::test]
    async fn test_repeated_provisioning_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let source = bundle(tmp.path());
        let root = tmp.path().join("runtime");
        let provisioner = Provisioner::new(source, Some(root.clone()), ProvisionPolicy::Always);

        let first = {
            let lease = provisioner.ensure_provisioned().await.unwrap();
            file_set(lease.path())
        };
        // A stray file from a previous run must not survive the refresh.
        fs::write(root.join(DATA_DIR_NAME).join("stale.traineddata"), b"old").unwrap();

        let lease = provisioner.ensure_provisioned().await.unwrap();
        assert!(lease.report().refreshed);
        assert_eq!(file_set(lease.path()), first);
        drop(lease);
        assert!(leftovers(&root).is_empty());
    }

    #[tokio::test]
    async fn test_once_policy_skips_warm_calls() {
        let tmp = TempDir::new().unwrap();
        let source = bundle(tmp.path());
        let root = tmp.path().join("runtime");
        let provisioner = Provisioner::new(source, Some(root.clone()), ProvisionPolicy::Once);

        assert!(provisioner.ensure_provisioned().await.unwrap().report().refreshed);
        assert!(!provisioner.ensure_provisioned().await.unwrap().report().refreshed);

        fs::remove_dir_all(root.join(DATA_DIR_NAME)).unwrap();
        let lease = provisioner.ensure_provisioned().await.unwrap();
        assert!(lease.report().refreshed);
        assert!(lease.path().join("eng.traineddata").is_file());
    }

    #[tokio::test]
    async fn test_missing_source() {
        let tmp = TempDir::new().unwrap();
        let provisioner = Provisioner::new(
            tmp.path().join("nope"),
            Some(tmp.path().join("runtime")),
            ProvisionPolicy::Always,
        );

        let err = provisioner.ensure_provisioned().await.err().unwrap();
        assert!(matches!(err, ProvisionError::SourceMissing(_)));
    }

    #[tokio::test]
    async fn test_destination_unavailable() {
        let tmp = TempDir::new().unwrap();
        let source = bundle(tmp.path());

        let provisioner = Provisioner::new(source.clone(), None, ProvisionPolicy::Always);
        let err = provisioner.ensure_provisioned().await.err().unwrap();
        assert!(matches!(err, ProvisionError::DestinationUnavailable(_)));

        // A regular file where the root directory should go.
        let blocker = tmp.path().join("blocker");
        fs::write(&blocker, b"").unwrap();
        let provisioner = Provisioner::new(source, Some(blocker.join("runtime")), ProvisionPolicy::Always);
        let err = provisioner.ensure_provisioned().await.err().unwrap();
        assert!(matches!(err, ProvisionError::DestinationUnavailable(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_copy_keeps_previous_data() {
        let tmp = TempDir::new().unwrap();
        let source = bundle(tmp.path());
        let root = tmp.path().join("runtime");
        let provisioner = Provisioner::new(source.clone(), Some(root.clone()), ProvisionPolicy::Always);

        let before = {
            let lease = provisioner.ensure_provisioned().await.unwrap();
            file_set(lease.path())
        };

        std::os::unix::fs::symlink(tmp.path().join("missing"), source.join("broken.traineddata"))
            .unwrap();

        let err = provisioner.ensure_provisioned().await.err().unwrap();
        assert!(matches!(err, ProvisionError::CopyFailed(_)));
        assert_eq!(file_set(&root.join(DATA_DIR_NAME)), before);
        assert!(leftovers(&root).is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_provisioning_completes_under_lock() {
        let tmp = TempDir::new().unwrap();
        let source = bundle(tmp.path());
        let root = tmp.path().join("runtime");
        let provisioner = Provisioner::new(source.clone(), Some(root.clone()), ProvisionPolicy::Always);

        for _ in 0..5 {
            // Drop the caller while the copy is (likely) still running.
            let _ = tokio::time::timeout(Duration::from_micros(1), provisioner.ensure_provisioned()).await;
        }

        let lease = provisioner.ensure_provisioned().await.unwrap();
        assert_eq!(file_set(lease.path()), file_set(&source));
        drop(lease);
        assert!(leftovers(&root).is_empty());
    }

    #[test]
    fn test_policy_from_str() {
        assert_eq!(ProvisionPolicy::from_str("always"), Some(ProvisionPolicy::Always));
        assert_eq!(ProvisionPolicy::from_str("once"), Some(ProvisionPolicy::Once));
        assert_eq!(ProvisionPolicy::from_str("sometimes"), None);
    }
}
