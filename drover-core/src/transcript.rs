//! Session transcript health analysis
//!
//! Worker sessions leave JSONL transcripts behind. A session caught in a
//! warmup loop, or retrying the same command endlessly, shows up there long
//! before it shows up as a stuck worker. This module scans transcripts and
//! flags the ones worth cleaning up.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Warmup errors above this mark a warmup loop
pub const WARMUP_ERROR_LIMIT: usize = 10;
/// Messages above this are excessive
pub const MESSAGE_LIMIT: usize = 500;
/// A single command repeated more often than this is a retry loop
pub const REPEATED_COMMAND_LIMIT: usize = 50;
/// Transcripts larger than this are flagged
pub const SIZE_LIMIT_BYTES: u64 = 2000 * 1024;

const TOP_COMMANDS: usize = 5;

/// How serious a transcript issue is
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Worth a look
    Warning,
    /// The session is broken; safe to remove
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Warning => write!(f, "WARNING"),
            Severity::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// One problem found in a transcript
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptIssue {
    /// Severity
    pub severity: Severity,
    /// Description
    pub message: String,
}

/// Findings for one transcript file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptReport {
    /// Transcript path
    pub path: PathBuf,
    /// File size in bytes
    pub size_bytes: u64,
    /// Lines in the transcript
    pub message_count: usize,
    /// Tool results that failed with a warmup error
    pub warmup_errors: usize,
    /// Most repeated tool commands with their counts
    pub top_commands: Vec<(String, usize)>,
    /// Transcript belongs to a sidechain session
    pub is_sidechain: bool,
    /// Problems found
    pub issues: Vec<TranscriptIssue>,
}

impl TranscriptReport {
    /// File name of the transcript
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Whether any issue was found
    pub fn has_issues(&self) -> bool {
        !self.issues.is_empty()
    }

    /// Whether a critical issue was found
    pub fn is_critical(&self) -> bool {
        self.issues.iter().any(|i| i.severity == Severity::Critical)
    }
}

/// Scan one JSONL transcript
pub fn analyze_transcript(path: &Path) -> Result<TranscriptReport> {
    let size_bytes = std::fs::metadata(path)?.len();
    let file = std::fs::File::open(path)?;

    let mut message_count = 0;
    let mut warmup_errors = 0;
    let mut is_sidechain = false;
    let mut commands: HashMap<String, usize> = HashMap::new();

    for line in BufReader::new(file).lines() {
        let line = line?;
        message_count += 1;

        let Ok(message) = serde_json::from_str::<Value>(&line) else {
            continue;
        };

        if message.get("isSidechain").and_then(Value::as_bool) == Some(true) {
            is_sidechain = true;
        }

        let content = message
            .pointer("/message/content")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();

        match message.get("type").and_then(Value::as_str) {
            Some("user") => {
                warmup_errors += content
                    .iter()
                    .filter(|item| {
                        item.get("content").and_then(Value::as_str) == Some("Warmup")
                            && item.get("is_error").and_then(Value::as_bool) == Some(true)
                    })
                    .count();
            }
            Some("assistant") => {
                for item in content {
                    if item.get("type").and_then(Value::as_str) != Some("tool_use") {
                        continue;
                    }
                    let Some(input) = item.get("input").and_then(Value::as_object) else {
                        continue;
                    };
                    let command = input
                        .get("command")
                        .and_then(Value::as_str)
                        .or_else(|| item.get("name").and_then(Value::as_str))
                        .unwrap_or("unknown");
                    *commands.entry(command.to_string()).or_insert(0) += 1;
                }
            }
            _ => {}
        }
    }

    let mut top_commands: Vec<(String, usize)> = commands.into_iter().collect();
    top_commands.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    top_commands.truncate(TOP_COMMANDS);

    let mut issues = Vec::new();
    if warmup_errors > WARMUP_ERROR_LIMIT {
        issues.push(TranscriptIssue {
            severity: Severity::Critical,
            message: format!("Warmup loop detected ({} warmup errors)", warmup_errors),
        });
    }
    if message_count > MESSAGE_LIMIT {
        issues.push(TranscriptIssue {
            severity: Severity::Warning,
            message: format!("Excessive messages ({})", message_count),
        });
    }
    for (command, count) in &top_commands {
        if *count > REPEATED_COMMAND_LIMIT {
            let shown: String = command.chars().take(50).collect();
            issues.push(TranscriptIssue {
                severity: Severity::Warning,
                message: format!("Command repeated {}x: {}", count, shown),
            });
        }
    }
    if size_bytes > SIZE_LIMIT_BYTES {
        issues.push(TranscriptIssue {
            severity: Severity::Warning,
            message: format!("Large session file ({}KB)", size_bytes / 1024),
        });
    }

    Ok(TranscriptReport {
        path: path.to_path_buf(),
        size_bytes,
        message_count,
        warmup_errors,
        top_commands,
        is_sidechain,
        issues,
    })
}

/// Where worker sessions keep their transcripts by default
pub fn default_transcript_root() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".claude").join("projects"))
        .unwrap_or_else(|| PathBuf::from(".claude/projects"))
}

/// Every `*.jsonl` file under `root`, sorted
pub fn find_transcripts(root: &Path) -> Vec<PathBuf> {
    let mut found: Vec<PathBuf> = WalkDir::new(root)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                debug!(error = %e, "Skipping unreadable directory entry");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "jsonl"))
        .map(|entry| entry.into_path())
        .collect();
    found.sort();
    found
}

/// Analyze every transcript under `root`; unreadable files are logged and skipped
pub fn check_transcripts(root: &Path) -> Vec<TranscriptReport> {
    find_transcripts(root)
        .into_iter()
        .filter_map(|path| match analyze_transcript(&path) {
            Ok(report) => Some(report),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to analyze transcript");
                None
            }
        })
        .collect()
}

/// Delete transcripts with a critical issue; returns the removed paths
pub fn remove_critical(reports: &[TranscriptReport]) -> Vec<PathBuf> {
    let mut removed = Vec::new();
    for report in reports.iter().filter(|r| r.is_critical()) {
        match std::fs::remove_file(&report.path) {
            Ok(()) => removed.push(report.path.clone()),
            Err(e) => warn!(path = %report.path.display(), error = %e, "Failed to remove transcript"),
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn warmup_line() -> String {
        serde_json::json!({
            "type": "user",
            "isSidechain": true,
            "message": {"content": [{"type": "tool_result", "content": "Warmup", "is_error": true}]}
        })
        .to_string()
    }

    fn tool_line(command: &str) -> String {
        serde_json::json!({
            "type": "assistant",
            "message": {"content": [{"type": "tool_use", "name": "Bash", "input": {"command": command}}]}
        })
        .to_string()
    }

    fn write_lines(path: &Path, lines: &[String]) {
        let mut file = std::fs::File::create(path).unwrap();
        for line in lines {
            writeln!(file, "{}", line).unwrap();
        }
    }

    #[test]
    fn test_warmup_loop_is_critical() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("loop.jsonl");
        write_lines(&path, &vec![warmup_line(); 11]);

        let report = analyze_transcript(&path).unwrap();
        assert_eq!(report.warmup_errors, 11);
        assert!(report.is_sidechain);
        assert!(report.is_critical());
    }

    #[test]
    fn test_repeated_command_is_warning() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("retry.jsonl");
        let mut lines = vec![tool_line("cargo test"); 51];
        lines.push("not json".to_string());
        write_lines(&path, &lines);

        let report = analyze_transcript(&path).unwrap();
        assert_eq!(report.message_count, 52);
        assert_eq!(report.top_commands[0], ("cargo test".to_string(), 51));
        assert!(report.has_issues());
        assert!(!report.is_critical());
    }

    #[test]
    fn test_healthy_transcript() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ok.jsonl");
        write_lines(&path, &[tool_line("ls"), warmup_line()]);

        let report = analyze_transcript(&path).unwrap();
        assert!(!report.has_issues());
    }

    #[test]
    fn test_find_and_remove_only_critical() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("project-a");
        std::fs::create_dir_all(&nested).unwrap();
        write_lines(&nested.join("bad.jsonl"), &vec![warmup_line(); 12]);
        write_lines(&nested.join("busy.jsonl"), &vec![tool_line("make"); 60]);
        write_lines(&dir.path().join("notes.txt"), &["ignored".to_string()]);

        let reports = check_transcripts(dir.path());
        assert_eq!(reports.len(), 2);

        let removed = remove_critical(&reports);
        assert_eq!(removed, vec![nested.join("bad.jsonl")]);
        assert!(nested.join("busy.jsonl").exists());
    }
}
