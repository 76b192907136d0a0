// Poisoned mutex should fail the program
#![allow(clippy::unwrap_used)]

//! Correlates `read_file`/`write_file`/`edit_file` tool calls with their
//! results to produce `file_operation` events with line metrics and a
//! unified diff.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;

use dataagent_protocol::FileOpMetrics;
use dataagent_protocol::ToolStatus;
use similar::ChangeTag;
use similar::TextDiff;
use tracing::debug;

use crate::workspace::SandboxedFs;

const TRACKED_TOOLS: [&str; 3] = ["read_file", "write_file", "edit_file"];

struct PendingOp {
    tool_name: String,
    display_path: String,
    physical_path: Option<PathBuf>,
    before_content: Option<String>,
    /// Physical-path resolution failed (for example a sandbox escape);
    /// the completion is reported as an error with zeroed metrics.
    failed: bool,
}

/// Completion record handed back to the pipeline, which emits the
/// `file_operation` event.
#[derive(Debug, Clone, PartialEq)]
pub struct FileOpRecord {
    pub tool_name: String,
    pub display_path: String,
    pub metrics: FileOpMetrics,
    pub diff: Option<String>,
    pub status: ToolStatus,
}

pub struct FileOpTracker {
    sandbox: Option<Arc<SandboxedFs>>,
    diff_max_lines: usize,
    pending: Mutex<HashMap<String, PendingOp>>,
}

impl FileOpTracker {
    pub fn new(sandbox: Option<Arc<SandboxedFs>>, diff_max_lines: usize) -> Self {
        Self {
            sandbox,
            diff_max_lines,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Record a tracked tool call. Calls for other tools are ignored.
    pub fn start_operation(&self, tool_name: &str, args: &serde_json::Value, tool_call_id: &str) {
        if !TRACKED_TOOLS.contains(&tool_name) {
            return;
        }
        let display_path = display_path_from_args(args);
        let (physical_path, failed) = match &self.sandbox {
            Some(sandbox) => match sandbox.resolve(&display_path) {
                Ok(path) => (Some(path), false),
                Err(e) => {
                    debug!("file op path resolution failed for '{display_path}': {e}");
                    (None, true)
                }
            },
            None => (None, false),
        };
        let before_content = physical_path
            .as_deref()
            .filter(|_| tool_name != "read_file")
            .and_then(|p| std::fs::read_to_string(p).ok());

        self.pending.lock().unwrap().insert(
            tool_call_id.to_string(),
            PendingOp {
                tool_name: tool_name.to_string(),
                display_path,
                physical_path,
                before_content,
                failed,
            },
        );
    }

    /// Later chunks may re-deliver args for an already-announced call.
    pub fn update_args(&self, tool_call_id: &str, args: &serde_json::Value) {
        let mut pending = self.pending.lock().unwrap();
        if let Some(op) = pending.get_mut(tool_call_id) {
            let display_path = display_path_from_args(args);
            if !display_path.is_empty() {
                op.display_path = display_path;
            }
        }
    }

    /// Complete the operation matching a tool result. Returns `None` for
    /// untracked tool calls.
    pub fn complete(
        &self,
        tool_call_id: &str,
        result: &str,
        status: ToolStatus,
    ) -> Option<FileOpRecord> {
        let op = self.pending.lock().unwrap().remove(tool_call_id)?;

        if op.failed || status == ToolStatus::Error {
            return Some(FileOpRecord {
                tool_name: op.tool_name,
                display_path: op.display_path,
                metrics: FileOpMetrics::default(),
                diff: None,
                status: ToolStatus::Error,
            });
        }

        let mut metrics = FileOpMetrics::default();
        let mut diff = None;

        match op.tool_name.as_str() {
            "read_file" => {
                metrics.lines_read = result.lines().count() as u64;
            }
            "write_file" | "edit_file" => {
                let after = op
                    .physical_path
                    .as_deref()
                    .and_then(|p| std::fs::read_to_string(p).ok())
                    .unwrap_or_default();
                metrics.lines_written = after.lines().count() as u64;
                let before = op.before_content.as_deref().unwrap_or("");
                let (added, removed, rendered) =
                    unified_diff(before, &after, &op.display_path, self.diff_max_lines);
                metrics.lines_added = added;
                metrics.lines_removed = removed;
                diff = rendered;
            }
            _ => {}
        }

        Some(FileOpRecord {
            tool_name: op.tool_name,
            display_path: op.display_path,
            metrics,
            diff,
            status: ToolStatus::Success,
        })
    }
}

fn display_path_from_args(args: &serde_json::Value) -> String {
    args.get("file_path")
        .or_else(|| args.get("path"))
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

/// Returns `(lines_added, lines_removed, rendered_diff)`. The rendered
/// diff is capped at `max_lines` lines and omitted entirely when the
/// contents are identical.
fn unified_diff(
    before: &str,
    after: &str,
    display_path: &str,
    max_lines: usize,
) -> (u64, u64, Option<String>) {
    if before == after {
        return (0, 0, None);
    }
    let text_diff = TextDiff::from_lines(before, after);
    let mut added = 0;
    let mut removed = 0;
    for change in text_diff.iter_all_changes() {
        match change.tag() {
            ChangeTag::Insert => added += 1,
            ChangeTag::Delete => removed += 1,
            ChangeTag::Equal => {}
        }
    }
    let rendered = text_diff
        .unified_diff()
        .header(&format!("a/{display_path}"), &format!("b/{display_path}"))
        .to_string();
    let rendered = truncate_lines(&rendered, max_lines);
    (added, removed, Some(rendered))
}

fn truncate_lines(text: &str, max_lines: usize) -> String {
    let mut lines: Vec<&str> = text.lines().collect();
    if lines.len() <= max_lines {
        return text.to_string();
    }
    let omitted = lines.len() - max_lines;
    lines.truncate(max_lines);
    let mut out = lines.join("\n");
    out.push_str(&format!("\n... ({omitted} lines truncated)"));
    out
}
