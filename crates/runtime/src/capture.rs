//! Side-effect capture around tool execution.
//!
//! Before a tool runs, any files it references (destructive shell
//! commands, absolute paths in its input) are backed up into the
//! task's snapshot; after it runs, an operation record with a derived
//! inverse is appended to the task's log.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use relay_state::{OperationRecord, StateConsistencyManager};

/// Shell commands whose targets must be captured before execution.
const DESTRUCTIVE_COMMANDS: [&str; 15] = [
    "rm", "rmdir", "mv", "chmod", "chown", "truncate", "shred", "unlink", "cp", "tee", "dd",
    "install", "sed", "awk", "patch",
];

/// Commands whose effect is removal of the target.
const DELETE_COMMANDS: [&str; 4] = ["rm", "rmdir", "shred", "unlink"];

/// Recursive directory capture caps.
const MAX_CAPTURE_FILES: usize = 200;
const MAX_CAPTURE_BYTES: u64 = 50 * 1024 * 1024;

/// What was observed before the tool ran.
#[derive(Debug, Default)]
pub struct CaptureReport {
    /// Referenced files that existed, with their pre-execution content.
    pub existing: Vec<(PathBuf, String)>,
    /// Referenced paths that did not exist yet.
    pub missing: Vec<PathBuf>,
    /// Parsed shell command tokens, when the input carried one.
    pub command: Option<Vec<String>>,
}

impl CaptureReport {
    pub fn is_empty(&self) -> bool {
        self.existing.is_empty() && self.missing.is_empty()
    }
}

/// Basename of the command word ("/bin/rm -rf x" → "rm").
fn command_basename(token: &str) -> &str {
    token.rsplit('/').next().unwrap_or(token)
}

pub fn is_destructive_command(command: &str) -> bool {
    DESTRUCTIVE_COMMANDS.contains(&command_basename(command))
}

fn is_delete_command(command: &str) -> bool {
    DELETE_COMMANDS.contains(&command_basename(command))
}

/// Whitespace tokens of the input's `command` field, when present.
pub fn command_tokens(input: &serde_json::Value) -> Option<Vec<String>> {
    let command = input.get("command")?.as_str()?;
    let tokens: Vec<String> = command.split_whitespace().map(String::from).collect();
    if tokens.is_empty() {
        None
    } else {
        Some(tokens)
    }
}

/// Every absolute path mentioned anywhere in the tool input: string
/// values that are absolute paths, plus absolute tokens inside command
/// strings.
pub fn referenced_paths(input: &serde_json::Value) -> Vec<PathBuf> {
    let mut out: Vec<PathBuf> = Vec::new();
    let mut seen: HashSet<PathBuf> = HashSet::new();

    fn walk(value: &serde_json::Value, out: &mut Vec<PathBuf>, seen: &mut HashSet<PathBuf>) {
        match value {
            serde_json::Value::String(s) => {
                for token in s.split_whitespace() {
                    if token.starts_with('/') && token.len() > 1 {
                        let path = PathBuf::from(token);
                        if seen.insert(path.clone()) {
                            out.push(path);
                        }
                    }
                }
            }
            serde_json::Value::Array(items) => {
                for item in items {
                    walk(item, out, seen);
                }
            }
            serde_json::Value::Object(map) => {
                for item in map.values() {
                    walk(item, out, seen);
                }
            }
            _ => {}
        }
    }

    walk(input, &mut out, &mut seen);
    out
}

/// Whether this tool call warrants capture at all.
pub fn needs_capture(input: &serde_json::Value) -> bool {
    if let Some(tokens) = command_tokens(input) {
        if is_destructive_command(&tokens[0]) {
            return true;
        }
    }
    !referenced_paths(input).is_empty()
}

/// Back up every referenced existing file into the task's snapshot.
/// Directories targeted by destructive commands are walked recursively
/// up to the capture caps.
pub fn pre_capture(
    manager: &Arc<StateConsistencyManager>,
    task_id: &str,
    input: &serde_json::Value,
) -> CaptureReport {
    let mut report = CaptureReport {
        command: command_tokens(input),
        ..CaptureReport::default()
    };
    if !needs_capture(input) {
        return report;
    }

    let destructive = report
        .command
        .as_ref()
        .map(|t| is_destructive_command(&t[0]))
        .unwrap_or(false);

    let mut captured_bytes: u64 = 0;
    let mut queue = referenced_paths(input);
    while let Some(path) = queue.pop() {
        if report.existing.len() >= MAX_CAPTURE_FILES || captured_bytes >= MAX_CAPTURE_BYTES {
            tracing::warn!(task_id, "capture limits reached, remaining paths skipped");
            break;
        }
        if path.is_dir() {
            if destructive {
                if let Ok(entries) = std::fs::read_dir(&path) {
                    queue.extend(entries.flatten().map(|e| e.path()));
                }
            }
            continue;
        }
        if !path.is_file() {
            report.missing.push(path);
            continue;
        }
        manager.ensure_file_captured(task_id, &path);
        if let Ok(bytes) = std::fs::read(&path) {
            captured_bytes += bytes.len() as u64;
            report
                .existing
                .push((path, String::from_utf8_lossy(&bytes).into_owned()));
        }
    }
    report
}

/// Append operation records after the tool executed, with the action
/// inferred from the command family: rm-family → file_delete, mv →
/// file_rename, everything else → file_write (or file_create for paths
/// that did not exist before).
pub fn record_operations(
    manager: &Arc<StateConsistencyManager>,
    task_id: &str,
    report: &CaptureReport,
) {
    if report.is_empty() {
        return;
    }

    if let Some(tokens) = &report.command {
        let command = &tokens[0];
        if is_delete_command(command) {
            for (path, content) in &report.existing {
                manager.record_operation(task_id, OperationRecord::file_delete(path, content));
            }
            return;
        }
        if command_basename(command) == "mv" {
            // Last two absolute tokens are source and destination.
            let paths: Vec<&str> = tokens
                .iter()
                .skip(1)
                .map(String::as_str)
                .filter(|t| t.starts_with('/'))
                .collect();
            if let [.., src, dst] = paths.as_slice() {
                manager.record_operation(
                    task_id,
                    OperationRecord::file_rename(Path::new(dst), Path::new(src)),
                );
            }
            return;
        }
    }

    for (path, content) in &report.existing {
        manager.record_operation(task_id, OperationRecord::file_write(path, content));
    }
    for path in &report.missing {
        if path.exists() {
            manager.record_operation(task_id, OperationRecord::file_create(path));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_domain::config::{RollbackConfig, SnapshotConfig};
    use tempfile::TempDir;

    fn make_manager(root: &TempDir) -> Arc<StateConsistencyManager> {
        let cfg = SnapshotConfig {
            storage_path: root.path().join("snapshots"),
            ..SnapshotConfig::default()
        };
        Arc::new(StateConsistencyManager::new(cfg, RollbackConfig::default()).unwrap())
    }

    #[test]
    fn destructive_commands_detected_with_path_prefix() {
        assert!(is_destructive_command("rm"));
        assert!(is_destructive_command("/bin/rm"));
        assert!(is_destructive_command("/usr/bin/sed"));
        assert!(!is_destructive_command("ls"));
        assert!(!is_destructive_command("echo"));
    }

    #[test]
    fn referenced_paths_from_nested_input() {
        let input = serde_json::json!({
            "command": "cp /etc/hosts /tmp/hosts.bak",
            "options": { "workdir": "/home/user" },
            "files": ["/var/log/app.log", "relative.txt"]
        });
        let paths = referenced_paths(&input);
        assert!(paths.contains(&PathBuf::from("/etc/hosts")));
        assert!(paths.contains(&PathBuf::from("/tmp/hosts.bak")));
        assert!(paths.contains(&PathBuf::from("/home/user")));
        assert!(paths.contains(&PathBuf::from("/var/log/app.log")));
        assert!(!paths.iter().any(|p| p.ends_with("relative.txt")));
    }

    #[test]
    fn needs_capture_rules() {
        assert!(needs_capture(
            &serde_json::json!({"command": "rm -rf /tmp/x"})
        ));
        assert!(needs_capture(&serde_json::json!({"path": "/tmp/a.txt"})));
        assert!(!needs_capture(&serde_json::json!({"query": "weather"})));
        assert!(!needs_capture(&serde_json::json!({"command": "echo hi"})));
    }

    #[test]
    fn pre_capture_backs_up_existing_files() {
        let root = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let file = work.path().join("a.txt");
        std::fs::write(&file, "before").unwrap();

        let mgr = make_manager(&root);
        mgr.create_snapshot("task-1", &[]).unwrap();

        let input = serde_json::json!({ "command": format!("rm {}", file.display()) });
        let report = pre_capture(&mgr, "task-1", &input);

        assert_eq!(report.existing.len(), 1);
        assert_eq!(report.existing[0].1, "before");
        // The snapshot now holds the file too.
        assert!(!mgr.ensure_file_captured("task-1", &file)); // already captured
    }

    #[test]
    fn record_operations_infers_delete_family() {
        let root = TempDir::new().unwrap();
        let mgr = make_manager(&root);
        mgr.create_snapshot("task-1", &[]).unwrap();

        let report = CaptureReport {
            existing: vec![(PathBuf::from("/tmp/x.txt"), "old".into())],
            missing: vec![],
            command: Some(vec!["rm".into(), "/tmp/x.txt".into()]),
        };
        record_operations(&mgr, "task-1", &report);

        let options = mgr.rollback_options("task-1");
        assert_eq!(options.len(), 1);
        assert_eq!(options[0]["action"], "file_delete");
    }

    #[test]
    fn record_operations_infers_rename() {
        let root = TempDir::new().unwrap();
        let mgr = make_manager(&root);
        mgr.create_snapshot("task-1", &[]).unwrap();

        let report = CaptureReport {
            existing: vec![(PathBuf::from("/tmp/src.txt"), "x".into())],
            missing: vec![PathBuf::from("/tmp/dst.txt")],
            command: Some(vec![
                "mv".into(),
                "/tmp/src.txt".into(),
                "/tmp/dst.txt".into(),
            ]),
        };
        record_operations(&mgr, "task-1", &report);

        let options = mgr.rollback_options("task-1");
        assert_eq!(options.len(), 1);
        assert_eq!(options[0]["action"], "file_rename");
    }

    #[test]
    fn record_operations_defaults_to_write() {
        let root = TempDir::new().unwrap();
        let mgr = make_manager(&root);
        mgr.create_snapshot("task-1", &[]).unwrap();

        let report = CaptureReport {
            existing: vec![(PathBuf::from("/tmp/cfg.toml"), "old".into())],
            missing: vec![],
            command: Some(vec!["sed".into(), "-i".into(), "/tmp/cfg.toml".into()]),
        };
        record_operations(&mgr, "task-1", &report);

        let options = mgr.rollback_options("task-1");
        assert_eq!(options[0]["action"], "file_write");
    }
}
