use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Recorded side-effect kinds. The inverse action is derived from the
/// action plus the captured before-state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpAction {
    FileWrite,
    FileCreate,
    FileDelete,
    FileRename,
}

/// State captured before an operation, enough to derive its inverse.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BeforeState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_path: Option<PathBuf>,
}

/// One append-only log entry for a reversible operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRecord {
    pub operation_id: String,
    pub action: OpAction,
    pub target: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before_state: Option<BeforeState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after_state: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl OperationRecord {
    fn new(action: OpAction, target: impl Into<PathBuf>, before_state: Option<BeforeState>) -> Self {
        Self {
            operation_id: Uuid::new_v4().to_string(),
            action,
            target: target.into(),
            before_state,
            after_state: None,
            timestamp: Utc::now(),
        }
    }

    /// A write over existing content: the inverse restores the old bytes.
    pub fn file_write(target: impl Into<PathBuf>, before_content: impl Into<String>) -> Self {
        Self::new(
            OpAction::FileWrite,
            target,
            Some(BeforeState {
                content: Some(before_content.into()),
                original_path: None,
            }),
        )
    }

    /// A newly created file: the inverse deletes it.
    pub fn file_create(target: impl Into<PathBuf>) -> Self {
        Self::new(OpAction::FileCreate, target, None)
    }

    /// A deletion: the inverse recreates the file with its old content.
    pub fn file_delete(target: impl Into<PathBuf>, before_content: impl Into<String>) -> Self {
        Self::new(
            OpAction::FileDelete,
            target,
            Some(BeforeState {
                content: Some(before_content.into()),
                original_path: None,
            }),
        )
    }

    /// A rename: the inverse renames the target back.
    pub fn file_rename(target: impl Into<PathBuf>, original_path: impl Into<PathBuf>) -> Self {
        Self::new(
            OpAction::FileRename,
            target,
            Some(BeforeState {
                content: None,
                original_path: Some(original_path.into()),
            }),
        )
    }

    /// Execute the derived inverse of this record. `Ok(None)` means no
    /// inverse could be derived (nothing captured).
    fn apply_inverse(&self) -> std::io::Result<Option<String>> {
        match self.action {
            OpAction::FileWrite => {
                if let Some(content) = self.before_state.as_ref().and_then(|b| b.content.as_ref()) {
                    ensure_parent(&self.target)?;
                    std::fs::write(&self.target, content)?;
                    return Ok(Some(format!("已回滚: file_write {}", self.target.display())));
                }
                Ok(None)
            }
            OpAction::FileCreate => {
                if self.target.exists() {
                    std::fs::remove_file(&self.target)?;
                }
                Ok(Some(format!("已回滚: file_create {}", self.target.display())))
            }
            OpAction::FileDelete => {
                if let Some(content) = self.before_state.as_ref().and_then(|b| b.content.as_ref()) {
                    ensure_parent(&self.target)?;
                    std::fs::write(&self.target, content)?;
                    return Ok(Some(format!("已回滚: file_delete {}", self.target.display())));
                }
                Ok(None)
            }
            OpAction::FileRename => {
                if let Some(original) = self
                    .before_state
                    .as_ref()
                    .and_then(|b| b.original_path.as_ref())
                {
                    std::fs::rename(&self.target, original)?;
                    return Ok(Some(format!("已回滚: file_rename {}", self.target.display())));
                }
                Ok(None)
            }
        }
    }
}

fn ensure_parent(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

/// Log event delivered to subscribers (dashboard progress, devtools).
pub type LogListener = Box<dyn Fn(&str, &serde_json::Value) + Send + Sync>;

/// Ordered log of reversible operations for one task. Rollback executes
/// inverses in reverse order; individual failures never abort the pass.
#[derive(Default)]
pub struct OperationLog {
    records: Vec<OperationRecord>,
    listeners: Vec<LogListener>,
}

impl OperationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, listener: LogListener) {
        self.listeners.push(listener);
    }

    pub fn append(&mut self, record: OperationRecord) {
        let payload = serde_json::to_value(&record).unwrap_or_default();
        for listener in &self.listeners {
            listener("append", &payload);
        }
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[OperationRecord] {
        &self.records
    }

    /// Paths touched by write/create operations, for post-task
    /// integrity checks.
    pub fn written_paths(&self) -> Vec<PathBuf> {
        self.records
            .iter()
            .filter(|r| matches!(r.action, OpAction::FileWrite | OpAction::FileCreate))
            .map(|r| r.target.clone())
            .collect()
    }

    /// Execute every recorded inverse in reverse order. Failures
    /// accumulate into the returned messages; a `deadline` in the past
    /// flags the remaining records as skipped. Clears the log.
    pub fn rollback_all(&mut self, deadline: Option<Instant>) -> Vec<String> {
        let mut messages = Vec::new();
        for record in self.records.iter().rev() {
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    messages.push(format!(
                        "skipped (timeout): {} {}",
                        action_name(record.action),
                        record.target.display()
                    ));
                    continue;
                }
            }
            match record.apply_inverse() {
                Ok(Some(message)) => messages.push(message),
                Ok(None) => messages.push(format!(
                    "无回滚动作: {} {}",
                    action_name(record.action),
                    record.target.display()
                )),
                Err(e) => {
                    tracing::warn!(
                        operation_id = %record.operation_id,
                        error = %e,
                        "rollback step failed"
                    );
                    messages.push(format!("回滚失败: {} - {e}", record.target.display()));
                }
            }
        }
        let payload = serde_json::to_value(&messages).unwrap_or_default();
        for listener in &self.listeners {
            listener("rollback", &payload);
        }
        self.records.clear();
        messages
    }

    /// User-facing rollback options for the HITL prompt.
    pub fn rollback_options(&self) -> Vec<serde_json::Value> {
        self.records
            .iter()
            .map(|r| {
                serde_json::json!({
                    "id": r.operation_id,
                    "action": action_name(r.action),
                    "target": r.target.display().to_string(),
                })
            })
            .collect()
    }
}

fn action_name(action: OpAction) -> &'static str {
    match action {
        OpAction::FileWrite => "file_write",
        OpAction::FileCreate => "file_create",
        OpAction::FileDelete => "file_delete",
        OpAction::FileRename => "file_rename",
    }
}
