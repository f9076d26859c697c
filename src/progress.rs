//! Pipeline progress reporting.
//!
//! Reports observable progress while subtasks run so operators see which
//! stage is active and how many records are done. Progress is emitted on
//! **stderr** so stdout remains parseable for scripts.

use std::io::Write;

use lake_harness_core::models::{Stage, SubtaskOutcome};

/// A single progress event.
#[derive(Clone, Debug, PartialEq)]
pub enum ProgressEvent {
    /// A subtask began for a scope.
    Started {
        stage: Stage,
        subtask: String,
        scope: String,
    },
    /// `n` records processed; `total` when known up front.
    Progress {
        subtask: String,
        n: u64,
        total: Option<u64>,
    },
    Finished {
        subtask: String,
        outcome: SubtaskOutcome,
    },
}

/// Reports pipeline progress. Implementations write to stderr (human or JSON).
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Human-friendly progress on stderr: "extract issues  1,234 / 5,000 records".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: ProgressEvent) {
        let line = match &event {
            ProgressEvent::Started {
                stage,
                subtask,
                scope,
            } => format!("{} {}  started  {}\n", stage, subtask, scope),
            ProgressEvent::Progress { subtask, n, total } => match total {
                Some(total) => format!(
                    "{}  {} / {} records\n",
                    subtask,
                    format_number(*n),
                    format_number(*total)
                ),
                None => format!("{}  {} records\n", subtask, format_number(*n)),
            },
            ProgressEvent::Finished { subtask, outcome } => {
                format!("{}  {}\n", subtask, outcome)
            }
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: ProgressEvent) {
        let obj = match &event {
            ProgressEvent::Started {
                stage,
                subtask,
                scope,
            } => serde_json::json!({
                "event": "started",
                "stage": stage,
                "subtask": subtask,
                "scope": scope
            }),
            ProgressEvent::Progress { subtask, n, total } => serde_json::json!({
                "event": "progress",
                "subtask": subtask,
                "n": n,
                "total": total
            }),
            ProgressEvent::Finished { subtask, outcome } => serde_json::json!({
                "event": "finished",
                "subtask": subtask,
                "outcome": outcome
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

fn format_number(n: u64) -> String {
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
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
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

impl std::str::FromStr for ProgressMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "off" => Ok(ProgressMode::Off),
            "human" => Ok(ProgressMode::Human),
            "json" => Ok(ProgressMode::Json),
            other => anyhow::bail!("unknown progress mode: '{}' (expected off, human or json)", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(1), "1");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1234), "1,234");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn progress_mode_parses() {
        assert_eq!("json".parse::<ProgressMode>().unwrap(), ProgressMode::Json);
        assert!("loud".parse::<ProgressMode>().is_err());
    }
}
