//! Ingest and search progress reporting for the CLI.
//!
//! Renders [`RagEvent`]s so users see each file move through the chunk,
//! embed and persist stages. Progress is emitted on **stderr** so stdout
//! remains parseable for scripts.

use std::io::Write;

use convo_rag_core::models::{SearchState, TaskState};

use crate::events::RagEvent;

/// Reports events. Implementations write to stderr (human or JSON).
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: &RagEvent);
}

/// Human-friendly progress on stderr: "ingest notes-1  embed  success  (200) 12 of 12 chunks embedded".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: &RagEvent) {
        let line = match event {
            RagEvent::Ingest(e) => format!(
                "ingest {}  {}  {}{}{}\n",
                e.file_id,
                e.stage_id,
                task_state_label(e.state),
                e.code.map(|c| format!("  ({})", c)).unwrap_or_default(),
                e.message
                    .as_deref()
                    .map(|m| format!(" {}", m))
                    .unwrap_or_default(),
            ),
            RagEvent::Search(e) => format!(
                "search {}  {}  {} results\n",
                e.session_id,
                search_state_label(e.state),
                format_number(e.result.len() as u64),
            ),
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: &RagEvent) {
        if let Ok(line) = serde_json::to_string(event) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: &RagEvent) {}
}

fn task_state_label(state: TaskState) -> &'static str {
    match state {
        TaskState::Pending => "pending",
        TaskState::Processing => "processing",
        TaskState::Success => "success",
        TaskState::Failed => "failed",
        TaskState::Aborted => "aborted",
    }
}

fn search_state_label(state: SearchState) -> &'static str {
    match state {
        SearchState::Pending => "pending",
        SearchState::Success => "success",
        SearchState::Failed => "failed",
        SearchState::Aborted => "aborted",
    }
}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
