use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use relay_domain::{Error, Result};

/// Process-level state captured alongside file contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clipboard_text: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Pre-task capture of file contents and environment state.
///
/// On-disk layout, one directory per snapshot:
/// ```text
/// <root>/<snapshot_id>/
///   metadata.json         snapshot_id, task_id, affected_files, environment
///   file_manifest.json    original path → backup filename
///   files/<hash16>.bak    UTF-8 content per captured path
/// ```
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub snapshot_id: String,
    pub task_id: String,
    pub file_contents: HashMap<PathBuf, String>,
    pub environment: EnvironmentState,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotMetadata {
    snapshot_id: String,
    task_id: String,
    affected_files: Vec<PathBuf>,
    environment: EnvironmentState,
    created_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn new(task_id: impl Into<String>, environment: EnvironmentState) -> Self {
        Self {
            snapshot_id: Uuid::new_v4().to_string(),
            task_id: task_id.into(),
            file_contents: HashMap::new(),
            environment,
            created_at: Utc::now(),
        }
    }

    /// Backup filename for a captured path: first 16 hex chars of the
    /// path digest.
    pub fn backup_name(path: &Path) -> String {
        let digest = Sha256::digest(path.to_string_lossy().as_bytes());
        format!("{}.bak", &hex::encode(digest)[..16])
    }

    pub fn dir(&self, root: &Path) -> PathBuf {
        root.join(&self.snapshot_id)
    }

    /// Persist the snapshot directory. `metadata.json` is written last
    /// so a directory without it is recognizably incomplete (orphan).
    pub fn write_to_disk(&self, root: &Path) -> Result<()> {
        let dir = self.dir(root);
        let files_dir = dir.join("files");
        std::fs::create_dir_all(&files_dir)?;

        let mut manifest: HashMap<String, String> = HashMap::new();
        for (path, content) in &self.file_contents {
            let backup = Self::backup_name(path);
            std::fs::write(files_dir.join(&backup), content)?;
            manifest.insert(path.display().to_string(), backup);
        }
        std::fs::write(
            dir.join("file_manifest.json"),
            serde_json::to_vec_pretty(&manifest)?,
        )?;

        let metadata = SnapshotMetadata {
            snapshot_id: self.snapshot_id.clone(),
            task_id: self.task_id.clone(),
            affected_files: self.file_contents.keys().cloned().collect(),
            environment: self.environment.clone(),
            created_at: self.created_at,
        };
        std::fs::write(dir.join("metadata.json"), serde_json::to_vec_pretty(&metadata)?)?;
        Ok(())
    }

    /// Persist one newly captured file into an existing snapshot dir
    /// (lazy capture path).
    pub fn write_one_file(&self, root: &Path, path: &Path) -> Result<()> {
        let dir = self.dir(root);
        let files_dir = dir.join("files");
        std::fs::create_dir_all(&files_dir)?;

        let content = self
            .file_contents
            .get(path)
            .ok_or_else(|| Error::Other(format!("path not captured: {}", path.display())))?;
        std::fs::write(files_dir.join(Self::backup_name(path)), content)?;

        // Rewrite the manifest to include the new entry.
        let mut manifest: HashMap<String, String> = HashMap::new();
        for captured in self.file_contents.keys() {
            manifest.insert(captured.display().to_string(), Self::backup_name(captured));
        }
        std::fs::write(
            dir.join("file_manifest.json"),
            serde_json::to_vec_pretty(&manifest)?,
        )?;
        Ok(())
    }

    /// Load a snapshot back from disk (post-crash recovery). Missing
    /// backup files yield per-path errors in the returned list but do
    /// not fail the load.
    pub fn load_from_disk(root: &Path, snapshot_id: &str) -> Result<(Self, Vec<String>)> {
        let dir = root.join(snapshot_id);
        let metadata: SnapshotMetadata =
            serde_json::from_slice(&std::fs::read(dir.join("metadata.json"))?)?;
        let manifest: HashMap<String, String> =
            serde_json::from_slice(&std::fs::read(dir.join("file_manifest.json"))?)?;

        let mut file_contents = HashMap::new();
        let mut problems = Vec::new();
        for (original, backup) in manifest {
            match std::fs::read_to_string(dir.join("files").join(&backup)) {
                Ok(content) => {
                    file_contents.insert(PathBuf::from(original), content);
                }
                Err(e) => problems.push(format!("备份缺失: {original} - {e}")),
            }
        }

        Ok((
            Self {
                snapshot_id: metadata.snapshot_id,
                task_id: metadata.task_id,
                file_contents,
                environment: metadata.environment,
                created_at: metadata.created_at,
            },
            problems,
        ))
    }

    pub fn remove_from_disk(&self, root: &Path) {
        let dir = self.dir(root);
        if let Err(e) = std::fs::remove_dir_all(&dir) {
            if dir.exists() {
                tracing::warn!(snapshot_id = %self.snapshot_id, error = %e, "snapshot cleanup failed");
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Clipboard (platform-gated)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Capture clipboard text. macOS only (`pbpaste`); every other
/// platform returns `None` silently.
pub fn capture_clipboard() -> Option<String> {
    #[cfg(target_os = "macos")]
    {
        let output = std::process::Command::new("pbpaste").output().ok()?;
        if output.status.success() {
            return Some(String::from_utf8_lossy(&output.stdout).into_owned());
        }
        None
    }
    #[cfg(not(target_os = "macos"))]
    {
        None
    }
}

/// Restore clipboard text. macOS only (`pbcopy`); silent skip elsewhere.
pub fn restore_clipboard(text: &str) -> bool {
    #[cfg(target_os = "macos")]
    {
        use std::io::Write;
        let child = std::process::Command::new("pbcopy")
            .stdin(std::process::Stdio::piped())
            .spawn();
        if let Ok(mut child) = child {
            if let Some(stdin) = child.stdin.as_mut() {
                if stdin.write_all(text.as_bytes()).is_ok() {
                    return child.wait().map(|s| s.success()).unwrap_or(false);
                }
            }
        }
        false
    }
    #[cfg(not(target_os = "macos"))]
    {
        let _ = text;
        false
    }
}
