use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;

use relay_domain::config::{RollbackConfig, SnapshotConfig};
use relay_domain::Result;

use crate::oplog::{OperationLog, OperationRecord};
use crate::snapshot::{capture_clipboard, restore_clipboard, EnvironmentState, Snapshot};

/// Result of the non-blocking pre-task check. A failed check is a
/// warning to surface, never a hard stop.
#[derive(Debug, Clone)]
pub struct PreCheckResult {
    pub passed: bool,
    pub issues: Vec<String>,
}

/// Result of the post-task integrity check.
#[derive(Debug, Clone)]
pub struct PostCheckResult {
    pub passed: bool,
    pub missing_files: Vec<PathBuf>,
    pub integrity_errors: Vec<String>,
}

#[derive(Default)]
struct Inner {
    /// snapshot_id → snapshot
    snapshots: HashMap<String, Snapshot>,
    /// task_id → snapshot_id
    tasks: HashMap<String, String>,
    /// task_id → operation log
    logs: HashMap<String, OperationLog>,
}

/// Transaction-like state guard for one task: snapshot before, log
/// during, commit or rollback after.
///
/// Shared across sessions; isolation is per `task_id`. The in-memory
/// maps sit behind one short mutex (the only contended resource);
/// file I/O happens outside it.
pub struct StateConsistencyManager {
    snapshot_cfg: SnapshotConfig,
    rollback_cfg: RollbackConfig,
    inner: Mutex<Inner>,
}

impl StateConsistencyManager {
    /// Construct the manager: ensures the snapshot root exists, then
    /// purges expired and orphaned snapshot directories.
    pub fn new(snapshot_cfg: SnapshotConfig, rollback_cfg: RollbackConfig) -> Result<Self> {
        std::fs::create_dir_all(&snapshot_cfg.storage_path)?;
        let manager = Self {
            snapshot_cfg,
            rollback_cfg,
            inner: Mutex::new(Inner::default()),
        };
        manager.purge_stale_snapshots();
        Ok(manager)
    }

    fn root(&self) -> &Path {
        &self.snapshot_cfg.storage_path
    }

    fn purge_stale_snapshots(&self) {
        let retention = chrono::Duration::hours(self.snapshot_cfg.retention_hours as i64);
        let now = Utc::now();
        let Ok(entries) = std::fs::read_dir(self.root()) else {
            return;
        };
        for entry in entries.flatten() {
            let dir = entry.path();
            if !dir.is_dir() {
                continue;
            }
            let Some(snapshot_id) = dir.file_name().and_then(|n| n.to_str()).map(String::from)
            else {
                continue;
            };
            match Snapshot::load_from_disk(self.root(), &snapshot_id) {
                Ok((snapshot, _)) => {
                    if snapshot.created_at + retention < now {
                        tracing::info!(snapshot_id = %snapshot_id, "purging expired snapshot");
                        snapshot.remove_from_disk(self.root());
                    }
                }
                Err(_) => {
                    // Missing or corrupt metadata: orphan, purge.
                    tracing::warn!(snapshot_id = %snapshot_id, "purging orphan snapshot");
                    let _ = std::fs::remove_dir_all(&dir);
                }
            }
        }
    }

    // ── Pre / post checks ─────────────────────────────────────────

    /// Non-blocking sanity check before a task starts: free disk and
    /// write permission on each affected path (or its parent for
    /// not-yet-existing files).
    pub fn pre_task_check(&self, affected_files: &[PathBuf]) -> PreCheckResult {
        let mut issues = Vec::new();

        let free = fs2::available_space(self.root()).unwrap_or(u64::MAX);
        let min = self.snapshot_cfg.free_disk_min_mb * 1024 * 1024;
        if free < min {
            issues.push(format!(
                "low disk space: {} MB free, {} MB required",
                free / (1024 * 1024),
                self.snapshot_cfg.free_disk_min_mb
            ));
        }

        for path in affected_files {
            if path.exists() {
                match std::fs::metadata(path) {
                    Ok(meta) if meta.permissions().readonly() => {
                        issues.push(format!("not writable: {}", path.display()));
                    }
                    Err(e) => issues.push(format!("cannot stat {}: {e}", path.display())),
                    _ => {}
                }
            } else {
                let parent = path.parent().unwrap_or(Path::new("."));
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    issues.push(format!("parent missing: {}", parent.display()));
                } else if let Ok(meta) = std::fs::metadata(parent) {
                    if meta.permissions().readonly() {
                        issues.push(format!("parent not writable: {}", parent.display()));
                    }
                }
            }
        }

        PreCheckResult {
            passed: issues.is_empty(),
            issues,
        }
    }

    /// Verify expected outputs exist and that every file written during
    /// the task is non-empty.
    pub fn post_task_check(&self, task_id: &str, expected_outputs: &[PathBuf]) -> PostCheckResult {
        let mut missing = Vec::new();
        for path in expected_outputs {
            if !path.exists() {
                missing.push(path.clone());
            }
        }

        let written = {
            let inner = self.inner.lock();
            inner
                .logs
                .get(task_id)
                .map(|log| log.written_paths())
                .unwrap_or_default()
        };

        let mut integrity_errors = Vec::new();
        for path in written {
            match std::fs::metadata(&path) {
                Ok(meta) if meta.len() == 0 => {
                    integrity_errors.push(format!("empty file: {}", path.display()));
                }
                Err(e) => integrity_errors.push(format!("unreadable: {} - {e}", path.display())),
                _ => {}
            }
        }

        PostCheckResult {
            passed: missing.is_empty() && integrity_errors.is_empty(),
            missing_files: missing,
            integrity_errors,
        }
    }

    // ── Snapshot lifecycle ────────────────────────────────────────

    /// Create the pre-task snapshot. Missing files are silently
    /// skipped; directories are walked recursively up to the capture
    /// caps (file count and cumulative size).
    pub fn create_snapshot(&self, task_id: &str, affected_files: &[PathBuf]) -> Result<String> {
        let environment = EnvironmentState {
            cwd: if self.snapshot_cfg.capture_cwd {
                std::env::current_dir().ok()
            } else {
                None
            },
            clipboard_text: if self.snapshot_cfg.capture_clipboard {
                capture_clipboard()
            } else {
                None
            },
            timestamp: Utc::now(),
        };

        let mut snapshot = Snapshot::new(task_id, environment);

        if self.snapshot_cfg.capture_files {
            let max_bytes = self.snapshot_cfg.max_size_mb * 1024 * 1024;
            let mut captured_bytes: u64 = 0;
            let mut queue: Vec<PathBuf> = affected_files.to_vec();
            while let Some(path) = queue.pop() {
                if snapshot.file_contents.len() >= self.snapshot_cfg.max_files
                    || captured_bytes >= max_bytes
                {
                    tracing::warn!(task_id, "snapshot capture limits reached");
                    break;
                }
                if path.is_dir() {
                    if let Ok(entries) = std::fs::read_dir(&path) {
                        queue.extend(entries.flatten().map(|e| e.path()));
                    }
                    continue;
                }
                if !path.is_file() {
                    continue; // missing or special file: skip silently
                }
                if let Ok(bytes) = std::fs::read(&path) {
                    captured_bytes += bytes.len() as u64;
                    let content = String::from_utf8_lossy(&bytes).into_owned();
                    snapshot.file_contents.insert(path, content);
                }
            }
        }

        snapshot.write_to_disk(self.root())?;

        let snapshot_id = snapshot.snapshot_id.clone();
        let mut inner = self.inner.lock();
        inner.tasks.insert(task_id.to_owned(), snapshot_id.clone());
        inner.snapshots.insert(snapshot_id.clone(), snapshot);
        inner.logs.entry(task_id.to_owned()).or_default();
        drop(inner);

        tracing::info!(task_id, snapshot_id = %snapshot_id, "snapshot created");
        Ok(snapshot_id)
    }

    /// Lazily capture a file the task didn't declare upfront. Returns
    /// false when nothing was captured (unknown task, not a regular
    /// file, or already captured).
    pub fn ensure_file_captured(&self, task_id: &str, path: &Path) -> bool {
        if !path.is_file() {
            return false;
        }
        let snapshot_id = {
            let inner = self.inner.lock();
            let Some(id) = inner.tasks.get(task_id) else {
                return false;
            };
            let Some(snapshot) = inner.snapshots.get(id) else {
                return false;
            };
            if snapshot.file_contents.contains_key(path) {
                return false;
            }
            if snapshot.file_contents.len() >= self.snapshot_cfg.max_files {
                return false;
            }
            id.clone()
        };

        let Ok(bytes) = std::fs::read(path) else {
            return false;
        };
        let content = String::from_utf8_lossy(&bytes).into_owned();

        let mut inner = self.inner.lock();
        let Some(snapshot) = inner.snapshots.get_mut(&snapshot_id) else {
            return false;
        };
        snapshot.file_contents.insert(path.to_owned(), content);
        let snapshot = snapshot.clone();
        drop(inner);

        if let Err(e) = snapshot.write_one_file(self.root(), path) {
            tracing::warn!(task_id, error = %e, "lazy capture persistence failed");
        }
        true
    }

    /// Append a reversible operation to the task's log.
    pub fn record_operation(&self, task_id: &str, record: OperationRecord) {
        let mut inner = self.inner.lock();
        inner.logs.entry(task_id.to_owned()).or_default().append(record);
    }

    // ── Commit / rollback ─────────────────────────────────────────

    /// Success path: drop the snapshot and log without restoring.
    pub fn commit(&self, task_id: &str) {
        let snapshot = {
            let mut inner = self.inner.lock();
            inner.logs.remove(task_id);
            inner
                .tasks
                .remove(task_id)
                .and_then(|id| inner.snapshots.remove(&id))
        };
        if let Some(snapshot) = snapshot {
            snapshot.remove_from_disk(self.root());
            tracing::info!(task_id, snapshot_id = %snapshot.snapshot_id, "snapshot committed");
        }
    }

    /// Restore everything the snapshot captured, within the rollback
    /// timeout budget. Returns status messages; individual failures
    /// never abort the pass.
    pub fn rollback(&self, snapshot_id: &str) -> Vec<String> {
        let deadline =
            Instant::now() + Duration::from_secs(self.rollback_cfg.rollback_timeout_seconds);
        let mut messages = Vec::new();

        // Snapshot from memory, else from disk (post-crash recovery).
        let (snapshot, mut log) = {
            let mut inner = self.inner.lock();
            let snapshot = inner.snapshots.remove(snapshot_id);
            let log = snapshot
                .as_ref()
                .and_then(|s| inner.logs.remove(&s.task_id));
            if let Some(s) = &snapshot {
                inner.tasks.remove(&s.task_id);
            }
            (snapshot, log)
        };

        let snapshot = match snapshot {
            Some(s) => s,
            None => match Snapshot::load_from_disk(self.root(), snapshot_id) {
                Ok((s, problems)) => {
                    messages.extend(problems);
                    s
                }
                Err(e) => {
                    messages.push(format!("快照不存在: {snapshot_id} - {e}"));
                    return messages;
                }
            },
        };

        // 1. Inverse operations, newest first.
        if let Some(log) = log.as_mut() {
            messages.extend(log.rollback_all(Some(deadline)));
        }

        // 2. Restore captured file contents.
        for (path, content) in &snapshot.file_contents {
            if Instant::now() >= deadline {
                messages.push(format!("skipped (timeout): {}", path.display()));
                continue;
            }
            let restore = (|| -> std::io::Result<()> {
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent)?;
                    }
                }
                std::fs::write(path, content)
            })();
            match restore {
                Ok(()) => messages.push(format!("已恢复: {}", path.display())),
                Err(e) => messages.push(format!("恢复失败: {} - {e}", path.display())),
            }
        }

        // 3. Environment: cwd, then clipboard (macOS only).
        if let Some(cwd) = &snapshot.environment.cwd {
            match std::env::set_current_dir(cwd) {
                Ok(()) => messages.push(format!("已恢复工作目录: {}", cwd.display())),
                Err(e) => messages.push(format!("工作目录恢复失败: {e}")),
            }
        }
        if let Some(text) = &snapshot.environment.clipboard_text {
            if restore_clipboard(text) {
                messages.push("已恢复剪贴板".to_string());
            }
        }

        // 4. Drop the snapshot from disk.
        snapshot.remove_from_disk(self.root());
        tracing::info!(snapshot_id, restored = messages.len(), "rollback finished");
        messages
    }

    // ── Queries ───────────────────────────────────────────────────

    /// Whether the auto-rollback policy fires for this failure state.
    pub fn should_auto_rollback(&self, consecutive_failures: u32, is_critical: bool) -> bool {
        consecutive_failures >= self.rollback_cfg.auto_rollback_on_consecutive_failures
            || (is_critical && self.rollback_cfg.auto_rollback_on_critical_error)
    }

    pub fn snapshot_id_for_task(&self, task_id: &str) -> Option<String> {
        self.inner.lock().tasks.get(task_id).cloned()
    }

    pub fn has_snapshot(&self, task_id: &str) -> bool {
        self.inner.lock().tasks.contains_key(task_id)
    }

    /// Rollback options for the user-facing prompt (one per recorded
    /// operation).
    pub fn rollback_options(&self, task_id: &str) -> Vec<serde_json::Value> {
        let inner = self.inner.lock();
        inner
            .logs
            .get(task_id)
            .map(|log| log.rollback_options())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager(root: &TempDir) -> StateConsistencyManager {
        let cfg = SnapshotConfig {
            storage_path: root.path().join("snapshots"),
            ..SnapshotConfig::default()
        };
        StateConsistencyManager::new(cfg, RollbackConfig::default()).unwrap()
    }

    #[test]
    fn snapshot_then_rollback_restores_bytes() {
        let root = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let a = work.path().join("a.txt");
        let b = work.path().join("b.txt");
        std::fs::write(&a, "A").unwrap();
        std::fs::write(&b, "B").unwrap();

        let mgr = manager(&root);
        let sid = mgr
            .create_snapshot("task-1", &[a.clone(), b.clone()])
            .unwrap();

        std::fs::write(&a, "A'").unwrap();
        mgr.record_operation("task-1", OperationRecord::file_write(&a, "A"));

        let messages = mgr.rollback(&sid);
        assert_eq!(std::fs::read_to_string(&a).unwrap(), "A");
        assert_eq!(std::fs::read_to_string(&b).unwrap(), "B");
        assert!(messages.iter().any(|m| m.starts_with("已恢复:")));
    }

    #[test]
    fn commit_is_a_noop_on_files() {
        let root = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let a = work.path().join("a.txt");
        std::fs::write(&a, "A").unwrap();

        let mgr = manager(&root);
        let sid = mgr.create_snapshot("task-1", &[a.clone()]).unwrap();
        std::fs::write(&a, "changed").unwrap();

        mgr.commit("task-1");
        assert_eq!(std::fs::read_to_string(&a).unwrap(), "changed");
        // Snapshot directory is gone.
        assert!(!root.path().join("snapshots").join(&sid).exists());
        assert!(!mgr.has_snapshot("task-1"));
    }

    #[test]
    fn missing_file_is_silently_skipped() {
        let root = TempDir::new().unwrap();
        let mgr = manager(&root);
        let sid = mgr
            .create_snapshot("task-1", &[PathBuf::from("/definitely/not/here.txt")])
            .unwrap();
        let inner_empty = {
            let inner = mgr.inner.lock();
            inner.snapshots[&sid].file_contents.is_empty()
        };
        assert!(inner_empty);
    }

    #[test]
    fn rollback_recovers_from_disk_after_crash() {
        let root = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let a = work.path().join("a.txt");
        std::fs::write(&a, "original").unwrap();

        let sid = {
            let mgr = manager(&root);
            mgr.create_snapshot("task-1", &[a.clone()]).unwrap()
        };
        std::fs::write(&a, "mutated").unwrap();

        // A fresh manager instance (simulated crash) can still roll back.
        let mgr2 = manager(&root);
        let messages = mgr2.rollback(&sid);
        assert_eq!(std::fs::read_to_string(&a).unwrap(), "original");
        assert!(messages.iter().any(|m| m.starts_with("已恢复:")));
    }

    #[test]
    fn rollback_of_deleted_snapshot_reports_not_raises() {
        let root = TempDir::new().unwrap();
        let mgr = manager(&root);
        let messages = mgr.rollback("no-such-snapshot");
        assert_eq!(messages.len(), 1);
        assert!(messages[0].contains("快照不存在"));
    }

    #[test]
    fn ensure_file_captured_semantics() {
        let root = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let a = work.path().join("late.txt");
        std::fs::write(&a, "late content").unwrap();

        let mgr = manager(&root);
        mgr.create_snapshot("task-1", &[]).unwrap();

        assert!(mgr.ensure_file_captured("task-1", &a));
        // Second call: already captured.
        assert!(!mgr.ensure_file_captured("task-1", &a));
        // Unknown task.
        assert!(!mgr.ensure_file_captured("task-2", &a));
        // Non-file.
        assert!(!mgr.ensure_file_captured("task-1", work.path()));
    }

    #[test]
    fn expired_snapshots_are_purged_at_construction() {
        let root = TempDir::new().unwrap();
        let cfg = SnapshotConfig {
            storage_path: root.path().join("snapshots"),
            retention_hours: 0,
            ..SnapshotConfig::default()
        };
        let sid = {
            let mgr = StateConsistencyManager::new(cfg.clone(), RollbackConfig::default()).unwrap();
            mgr.create_snapshot("task-1", &[]).unwrap()
        };
        assert!(root.path().join("snapshots").join(&sid).exists());

        // retention 0 → anything already on disk is expired.
        let _mgr2 = StateConsistencyManager::new(cfg, RollbackConfig::default()).unwrap();
        assert!(!root.path().join("snapshots").join(&sid).exists());
    }

    #[test]
    fn orphan_directories_are_purged() {
        let root = TempDir::new().unwrap();
        let snapshots = root.path().join("snapshots");
        std::fs::create_dir_all(snapshots.join("corrupt-snap")).unwrap();
        std::fs::write(snapshots.join("corrupt-snap/metadata.json"), "not json").unwrap();

        let _mgr = manager(&root);
        assert!(!snapshots.join("corrupt-snap").exists());
    }

    #[test]
    fn auto_rollback_policy() {
        let root = TempDir::new().unwrap();
        let mgr = manager(&root);
        assert!(mgr.should_auto_rollback(3, false));
        assert!(!mgr.should_auto_rollback(2, false));
        assert!(mgr.should_auto_rollback(0, true));
    }

    #[test]
    fn pre_check_flags_missing_parent() {
        let root = TempDir::new().unwrap();
        let mgr = manager(&root);
        let result = mgr.pre_task_check(&[PathBuf::from("/no/such/parent/file.txt")]);
        assert!(!result.passed);
        assert!(result.issues.iter().any(|i| i.contains("parent missing")));
    }

    #[test]
    fn post_check_reports_missing_and_empty() {
        let root = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let empty = work.path().join("empty.txt");
        std::fs::write(&empty, "").unwrap();

        let mgr = manager(&root);
        mgr.create_snapshot("task-1", &[]).unwrap();
        mgr.record_operation("task-1", OperationRecord::file_create(&empty));

        let result = mgr.post_task_check("task-1", &[PathBuf::from("/missing/output.txt")]);
        assert!(!result.passed);
        assert_eq!(result.missing_files.len(), 1);
        assert_eq!(result.integrity_errors.len(), 1);
    }
}
