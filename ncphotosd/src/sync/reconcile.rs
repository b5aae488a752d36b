use std::collections::HashSet;
use std::io;
use std::path::PathBuf;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub removed: Vec<String>,
    pub kept: usize,
    /// Symlinks, directories and other non-regular entries left alone.
    pub skipped: Vec<String>,
    pub failed: Vec<String>,
}

/// Evicts cache files that the latest listing no longer references.
#[derive(Debug, Clone)]
pub struct CacheReconciler {
    cache_root: PathBuf,
}

impl CacheReconciler {
    pub fn new(cache_root: PathBuf) -> Self {
        Self { cache_root }
    }

    /// Deletes every regular file in the cache directory whose name is not in
    /// `keep`. Only failing to read the directory itself is an error; single
    /// deletions are best-effort.
    pub async fn reconcile(&self, keep: &HashSet<String>) -> io::Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let mut entries = match tokio::fs::read_dir(&self.cache_root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(report),
            Err(err) => return Err(err),
        };

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if keep.contains(&name) {
                report.kept += 1;
                continue;
            }
            // DirEntry::file_type does not follow symlinks.
            let is_regular = match entry.file_type().await {
                Ok(kind) => kind.is_file(),
                Err(err) => {
                    tracing::warn!(name = %name, "cannot stat cache entry: {err}");
                    report.failed.push(name);
                    continue;
                }
            };
            if !is_regular {
                tracing::debug!(name = %name, "leaving non-regular cache entry");
                report.skipped.push(name);
                continue;
            }
            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => {
                    tracing::info!(name = %name, "evicted cached photo");
                    report.removed.push(name);
                }
                Err(err) => {
                    tracing::warn!(name = %name, "failed to evict cached photo: {err}");
                    report.failed.push(name);
                }
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn names(items: &[&str]) -> HashSet<String> {
        items.iter().map(|item| item.to_string()).collect()
    }

    #[tokio::test]
    async fn keeping_everything_deletes_nothing() {
        let dir = tempdir().unwrap();
        for name in ["a.jpg", "b.jpg"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        let reconciler = CacheReconciler::new(dir.path().to_path_buf());

        let report = reconciler.reconcile(&names(&["a.jpg", "b.jpg"])).await.unwrap();

        assert!(report.removed.is_empty());
        assert_eq!(report.kept, 2);
        assert!(dir.path().join("a.jpg").exists());
        assert!(dir.path().join("b.jpg").exists());
    }

    #[tokio::test]
    async fn removes_only_unreferenced_files() {
        let dir = tempdir().unwrap();
        for name in ["keep.jpg", "stale.jpg", "left.jpg.partial"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        let reconciler = CacheReconciler::new(dir.path().to_path_buf());

        let mut report = reconciler.reconcile(&names(&["keep.jpg"])).await.unwrap();
        report.removed.sort();

        assert_eq!(report.removed, vec!["left.jpg.partial", "stale.jpg"]);
        assert!(dir.path().join("keep.jpg").exists());
        assert!(!dir.path().join("stale.jpg").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn empty_keep_set_spares_symlinks_and_directories() {
        let outside = tempdir().unwrap();
        let victim = outside.path().join("victim.jpg");
        std::fs::write(&victim, b"precious").unwrap();

        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.jpg"), b"x").unwrap();
        std::fs::create_dir(dir.path().join("album")).unwrap();
        std::fs::write(dir.path().join("album/inner.jpg"), b"x").unwrap();
        std::os::unix::fs::symlink(&victim, dir.path().join("link.jpg")).unwrap();
        let reconciler = CacheReconciler::new(dir.path().to_path_buf());

        let mut report = reconciler.reconcile(&HashSet::new()).await.unwrap();
        report.skipped.sort();

        assert_eq!(report.removed, vec!["a.jpg"]);
        assert_eq!(report.skipped, vec!["album", "link.jpg"]);
        assert!(dir.path().join("album/inner.jpg").exists());
        assert!(
            std::fs::symlink_metadata(dir.path().join("link.jpg"))
                .unwrap()
                .file_type()
                .is_symlink()
        );
        assert_eq!(std::fs::read(victim).unwrap(), b"precious");
    }

    #[tokio::test]
    async fn missing_cache_directory_is_empty() {
        let dir = tempdir().unwrap();
        let reconciler = CacheReconciler::new(dir.path().join("never-created"));

        let report = reconciler.reconcile(&HashSet::new()).await.unwrap();

        assert_eq!(report, ReconcileReport::default());
    }
}
