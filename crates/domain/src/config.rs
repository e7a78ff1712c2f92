use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Configuration surface of the execution core. Every section has
/// serde defaults so a partial TOML/JSON document deserializes cleanly.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CoreConfig {
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub terminator: TerminatorConfig,
    #[serde(default)]
    pub compaction: CompactionConfig,
    #[serde(default)]
    pub hitl: HitlConfig,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    #[serde(default)]
    pub rollback: RollbackConfig,
    /// Per-model pricing for cost estimation (key = model name).
    /// Models without an entry skip the cost-aware termination tiers.
    #[serde(default)]
    pub pricing: HashMap<String, ModelPricing>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Executor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default = "d_true")]
    pub allow_parallel_tools: bool,
    #[serde(default = "d_5")]
    pub max_parallel_tools: usize,
    /// Tools that must never run concurrently with anything else.
    #[serde(default = "d_serial_only")]
    pub serial_only_tools: HashSet<String>,
    #[serde(default = "d_3")]
    pub max_backtrack_attempts: u32,
    /// Per-session replay ring for late event subscribers.
    #[serde(default = "d_256")]
    pub event_replay_buffer: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            allow_parallel_tools: true,
            max_parallel_tools: 5,
            serial_only_tools: d_serial_only(),
            max_backtrack_attempts: 3,
            event_replay_buffer: 256,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Termination
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminatorConfig {
    #[serde(default = "d_30")]
    pub max_turns: u32,
    #[serde(default = "d_1800")]
    pub max_duration_seconds: u64,
    #[serde(default = "d_120")]
    pub idle_timeout_seconds: u64,
    #[serde(default = "d_5_u32")]
    pub consecutive_failure_limit: u32,
    #[serde(default = "d_20")]
    pub long_running_confirm_after_turns: u32,
    #[serde(default)]
    pub cost_alert: CostAlertConfig,
}

impl Default for TerminatorConfig {
    fn default() -> Self {
        Self {
            max_turns: 30,
            max_duration_seconds: 1800,
            idle_timeout_seconds: 120,
            consecutive_failure_limit: 5,
            long_running_confirm_after_turns: 20,
            cost_alert: CostAlertConfig::default(),
        }
    }
}

/// Tiered cost thresholds in USD. All tiers ask the user; the core
/// never stops a task over cost on its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostAlertConfig {
    #[serde(default = "d_warn")]
    pub warn_threshold: f64,
    #[serde(default = "d_confirm")]
    pub confirm_threshold: f64,
    #[serde(default = "d_urgent")]
    pub urgent_threshold: f64,
}

impl Default for CostAlertConfig {
    fn default() -> Self {
        Self {
            warn_threshold: 0.50,
            confirm_threshold: 2.00,
            urgent_threshold: 10.00,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HITL
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HitlConfig {
    #[serde(default = "d_true")]
    pub enabled: bool,
    /// Danger keywords. A pending tool matches on exact name or when
    /// its lowercased name contains a keyword (delete_file → delete).
    #[serde(default = "d_danger_words")]
    pub require_confirmation: Vec<String>,
    #[serde(default)]
    pub on_rejection: OnRejection,
    #[serde(default = "d_true")]
    pub show_rollback_on_error: bool,
}

impl Default for HitlConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            require_confirmation: d_danger_words(),
            on_rejection: OnRejection::default(),
            show_rollback_on_error: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OnRejection {
    Stop,
    Rollback,
    #[default]
    AskRollback,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Compaction
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    #[serde(default = "d_180k")]
    pub token_budget: usize,
    /// Compaction triggers when the estimate exceeds
    /// `token_budget - safe_threshold_margin`.
    #[serde(default = "d_20k")]
    pub safe_threshold_margin: usize,
    #[serde(default = "d_4")]
    pub preserve_first_messages: usize,
    #[serde(default = "d_8")]
    pub preserve_last_messages: usize,
    #[serde(default = "d_true")]
    pub preserve_tool_results: bool,
    /// Tool results in the last N messages keep their images.
    #[serde(default = "d_2")]
    pub preserve_last_images: usize,
    /// Prefilter: any single message above this many characters is
    /// truncated mid-content before structural trimming runs.
    #[serde(default = "d_50k")]
    pub per_message_char_cap: usize,
    /// Fresh tool results longer than this are truncated head+tail
    /// before entering the history.
    #[serde(default = "d_6000")]
    pub fresh_result_max_chars: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            token_budget: 180_000,
            safe_threshold_margin: 20_000,
            preserve_first_messages: 4,
            preserve_last_messages: 8,
            preserve_tool_results: true,
            preserve_last_images: 2,
            per_message_char_cap: 50_000,
            fresh_result_max_chars: 6_000,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Snapshots & rollback
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    #[serde(default = "d_snapshot_path")]
    pub storage_path: PathBuf,
    #[serde(default = "d_24")]
    pub retention_hours: u64,
    #[serde(default = "d_500")]
    pub max_size_mb: u64,
    /// Cap for recursive directory capture.
    #[serde(default = "d_200")]
    pub max_files: usize,
    #[serde(default = "d_true")]
    pub capture_cwd: bool,
    #[serde(default = "d_true")]
    pub capture_files: bool,
    #[serde(default)]
    pub capture_clipboard: bool,
    /// Pre-task check fails below this much free disk.
    #[serde(default = "d_100")]
    pub free_disk_min_mb: u64,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            storage_path: d_snapshot_path(),
            retention_hours: 24,
            max_size_mb: 500,
            max_files: 200,
            capture_cwd: true,
            capture_files: true,
            capture_clipboard: false,
            free_disk_min_mb: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackConfig {
    #[serde(default = "d_3")]
    pub auto_rollback_on_consecutive_failures: u32,
    #[serde(default = "d_true")]
    pub auto_rollback_on_critical_error: bool,
    #[serde(default = "d_60")]
    pub rollback_timeout_seconds: u64,
}

impl Default for RollbackConfig {
    fn default() -> Self {
        Self {
            auto_rollback_on_consecutive_failures: 3,
            auto_rollback_on_critical_error: true,
            rollback_timeout_seconds: 60,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pricing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelPricing {
    /// Dollars per 1 million input tokens.
    pub input_per_1m: f64,
    /// Dollars per 1 million output tokens.
    pub output_per_1m: f64,
}

impl ModelPricing {
    pub fn estimate_cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64 * self.input_per_1m + output_tokens as f64 * self.output_per_1m)
            / 1_000_000.0
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Serde default helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn d_true() -> bool {
    true
}
fn d_2() -> usize {
    2
}
fn d_3() -> u32 {
    3
}
fn d_4() -> usize {
    4
}
fn d_5() -> usize {
    5
}
fn d_5_u32() -> u32 {
    5
}
fn d_8() -> usize {
    8
}
fn d_20() -> u32 {
    20
}
fn d_24() -> u64 {
    24
}
fn d_30() -> u32 {
    30
}
fn d_60() -> u64 {
    60
}
fn d_100() -> u64 {
    100
}
fn d_120() -> u64 {
    120
}
fn d_200() -> usize {
    200
}
fn d_256() -> usize {
    256
}
fn d_500() -> u64 {
    500
}
fn d_1800() -> u64 {
    1800
}
fn d_6000() -> usize {
    6000
}
fn d_20k() -> usize {
    20_000
}
fn d_50k() -> usize {
    50_000
}
fn d_180k() -> usize {
    180_000
}
fn d_warn() -> f64 {
    0.50
}
fn d_confirm() -> f64 {
    2.00
}
fn d_urgent() -> f64 {
    10.00
}
fn d_snapshot_path() -> PathBuf {
    PathBuf::from(".relay/snapshots")
}
fn d_serial_only() -> HashSet<String> {
    ["plan", "hitl"].into_iter().map(String::from).collect()
}
fn d_danger_words() -> Vec<String> {
    ["delete", "overwrite", "send_email", "publish", "payment"]
        .into_iter()
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = CoreConfig::default();
        assert!(cfg.executor.allow_parallel_tools);
        assert_eq!(cfg.executor.max_parallel_tools, 5);
        assert!(cfg.executor.serial_only_tools.contains("plan"));
        assert!(cfg.executor.serial_only_tools.contains("hitl"));
        assert_eq!(cfg.terminator.max_turns, 30);
        assert_eq!(cfg.terminator.idle_timeout_seconds, 120);
        assert_eq!(cfg.terminator.cost_alert.confirm_threshold, 2.00);
        assert_eq!(cfg.compaction.token_budget, 180_000);
        assert_eq!(cfg.compaction.preserve_first_messages, 4);
        assert_eq!(cfg.compaction.preserve_last_messages, 8);
        assert_eq!(cfg.snapshot.retention_hours, 24);
        assert_eq!(cfg.rollback.rollback_timeout_seconds, 60);
        assert_eq!(cfg.hitl.on_rejection, OnRejection::AskRollback);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let cfg: CoreConfig = toml::from_str(
            r#"
            [terminator]
            max_turns = 10

            [compaction]
            token_budget = 90000

            [hitl]
            on_rejection = "rollback"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.terminator.max_turns, 10);
        // Untouched fields keep their defaults.
        assert_eq!(cfg.terminator.max_duration_seconds, 1800);
        assert_eq!(cfg.compaction.token_budget, 90_000);
        assert_eq!(cfg.compaction.safe_threshold_margin, 20_000);
        assert_eq!(cfg.hitl.on_rejection, OnRejection::Rollback);
        assert!(cfg.hitl.require_confirmation.iter().any(|w| w == "delete"));
    }

    #[test]
    fn empty_document_is_valid() {
        let cfg: CoreConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.executor.max_backtrack_attempts, 3);
        assert!(cfg.pricing.is_empty());
    }

    #[test]
    fn pricing_estimate() {
        let pricing = ModelPricing {
            input_per_1m: 3.0,
            output_per_1m: 15.0,
        };
        let cost = pricing.estimate_cost(1_000_000, 200_000);
        assert!((cost - 6.0).abs() < 1e-9);
        assert_eq!(pricing.estimate_cost(0, 0), 0.0);
    }
}
