//! C8 — Structured logger.
//!
//! An in-memory append-only log with incrementally maintained summary
//! counters; flushed to disk exactly once at end of run regardless of how
//! the run ended (spec.md §4.8). Grounded on the teacher's `session.rs`
//! `log.jsonl` writer — same append-only/one-file-per-run shape, adapted to
//! batched flush, sanitization, and retention by recorded start time instead
//! of an unbounded per-session directory.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};

pub const MAX_DEBUG_LOGS: usize = 20;

const LARGE_CONTENT_KEYS: &[&str] =
    &["content", "file_content", "patch", "diff", "body", "old_string", "new_string"];
const LARGE_CONTENT_LIMIT: usize = 500;
const GENERIC_STRING_LIMIT: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogCategory {
    AgentLoop,
    Llm,
    ToolCall,
    ToolParse,
    Message,
    Snapshot,
    Context,
    Mcp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub iso_timestamp: String,
    pub elapsed_ms: u64,
    pub level: LogLevel,
    pub category: LogCategory,
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Summary {
    pub iterations: u32,
    pub total_tool_calls: u64,
    pub tool_calls_by_name: BTreeMap<String, u64>,
    pub errors: u64,
    pub warnings: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub doom_loop_detected: bool,
    pub hit_iteration_limit: bool,
    pub aborted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebugLog {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub project_id: String,
    pub model: String,
    pub mode: String,
    pub started_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_ms: Option<u64>,
    pub summary: Summary,
    pub entries: Vec<LogEntry>,
}

/// Owns the in-memory log for one run. `flush` is the only point it ever
/// touches disk.
pub struct StructuredLogger {
    log: DebugLog,
    start: Instant,
}

impl StructuredLogger {
    pub fn new(
        id: impl Into<String>,
        session_id: Option<String>,
        project_id: impl Into<String>,
        model: impl Into<String>,
        mode: impl Into<String>,
    ) -> Self {
        StructuredLogger {
            log: DebugLog {
                id: id.into(),
                session_id,
                project_id: project_id.into(),
                model: model.into(),
                mode: mode.into(),
                started_at: Utc::now().to_rfc3339(),
                completed_at: None,
                total_ms: None,
                summary: Summary::default(),
                entries: Vec::new(),
            },
            start: Instant::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.log.id
    }

    /// Milliseconds elapsed since this logger was constructed.
    pub fn start_timer(&self) -> impl Fn() -> u64 + '_ {
        move || self.start.elapsed().as_millis() as u64
    }

    pub fn log(
        &mut self,
        level: LogLevel,
        category: LogCategory,
        event: impl Into<String>,
        data: Option<serde_json::Value>,
        iteration: Option<u32>,
        duration_ms: Option<u64>,
    ) {
        if matches!(level, LogLevel::Error) {
            self.log.summary.errors += 1;
        } else if matches!(level, LogLevel::Warning) {
            self.log.summary.warnings += 1;
        }
        self.log.entries.push(LogEntry {
            iso_timestamp: Utc::now().to_rfc3339(),
            elapsed_ms: self.start.elapsed().as_millis() as u64,
            level,
            category,
            event: event.into(),
            data: data.map(sanitize),
            iteration,
            duration_ms,
        });
    }

    pub fn record_tool_call(&mut self, name: &str) {
        self.log.summary.total_tool_calls += 1;
        *self.log.summary.tool_calls_by_name.entry(name.to_string()).or_insert(0) += 1;
    }

    pub fn record_iteration(&mut self) {
        self.log.summary.iterations += 1;
    }

    pub fn record_tokens(&mut self, input: u64, output: u64) {
        self.log.summary.input_tokens += input;
        self.log.summary.output_tokens += output;
    }

    pub fn mark_doom_loop_detected(&mut self) {
        self.log.summary.doom_loop_detected = true;
    }

    pub fn mark_hit_iteration_limit(&mut self) {
        self.log.summary.hit_iteration_limit = true;
    }

    pub fn mark_aborted(&mut self) {
        self.log.summary.aborted = true;
    }

    pub fn summary(&self) -> &Summary {
        &self.log.summary
    }

    /// Serialize and write to
    /// `<project_root>/.agent/sessions/<session_id>/debug-logs/<id>.json`, or
    /// `<project_root>/.agent/debug-logs/<id>.json` with no session id, then
    /// trim to the newest `MAX_DEBUG_LOGS`. All failures are swallowed by the
    /// caller (spec.md §4.8) — this returns `Result` only so a caller that
    /// wants to know can `let _ = logger.flush(...)`.
    pub fn flush(&mut self, project_root: &Path, max_debug_logs: usize) -> anyhow::Result<()> {
        self.log.completed_at = Some(Utc::now().to_rfc3339());
        self.log.total_ms = Some(self.start.elapsed().as_millis() as u64);

        let dir = debug_logs_dir(project_root, self.log.session_id.as_deref());
        fs::create_dir_all(&dir)?;

        let path = dir.join(format!("{}.json", self.log.id));
        let tmp_path = dir.join(format!(".{}.json.tmp", self.log.id));
        let content = serde_json::to_string_pretty(&self.log)?;
        fs::write(&tmp_path, &content)?;
        fs::rename(&tmp_path, &path)?;

        retain_newest(&dir, max_debug_logs)
    }
}

fn debug_logs_dir(project_root: &Path, session_id: Option<&str>) -> PathBuf {
    match session_id {
        Some(id) => project_root.join(".agent").join("sessions").join(id).join("debug-logs"),
        None => project_root.join(".agent").join("debug-logs"),
    }
}

/// Keep the newest `keep` log files by the real `started_at` timestamp
/// recorded inside each one — the log id itself is a random UUID (no
/// chronological ordering), so sorting by filename would discard an
/// arbitrary subset instead of the oldest logs. Mirrors `snapshot.rs`'s
/// `enforce_retention`, which reads the real `timestamp` field out of each
/// snapshot's `metadata.json` rather than trusting its directory name.
/// `started_at` is RFC3339 in UTC, which sorts lexically in chronological
/// order; a file that fails to parse sorts first (oldest) so it is deleted
/// before any readable log is.
fn retain_newest(dir: &Path, keep: usize) -> anyhow::Result<()> {
    let mut files: Vec<(String, PathBuf)> = fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().map(|ext| ext == "json").unwrap_or(false))
        .map(|e| {
            let started_at = fs::read_to_string(e.path())
                .ok()
                .and_then(|content| serde_json::from_str::<DebugLog>(&content).ok())
                .map(|log| log.started_at)
                .unwrap_or_default();
            (started_at, e.path())
        })
        .collect();

    files.sort_by(|a, b| a.0.cmp(&b.0));
    if files.len() > keep {
        for (_, path) in &files[..files.len() - keep] {
            let _ = fs::remove_file(path);
        }
    }
    Ok(())
}

/// Recursively truncate long string fields per spec.md §4.8's sanitization
/// rule: known large-content keys get a tighter limit with a total-count
/// suffix, everything else gets the generic limit.
fn sanitize(value: serde_json::Value) -> serde_json::Value {
    sanitize_inner(value, None)
}

fn sanitize_inner(value: serde_json::Value, key: Option<&str>) -> serde_json::Value {
    match value {
        serde_json::Value::String(s) => serde_json::Value::String(truncate_field(key, s)),
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.into_iter().map(|v| sanitize_inner(v, None)).collect())
        }
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.into_iter().map(|(k, v)| (k.clone(), sanitize_inner(v, Some(&k)))).collect(),
        ),
        other => other,
    }
}

fn truncate_field(key: Option<&str>, s: String) -> String {
    let limit = match key {
        Some(k) if LARGE_CONTENT_KEYS.contains(&k) => LARGE_CONTENT_LIMIT,
        _ => GENERIC_STRING_LIMIT,
    };
    let total = s.chars().count();
    if total <= limit {
        return s;
    }
    let head: String = s.chars().take(limit).collect();
    format!("{head}… ({total} chars total)")
}
