//! Apply progress reporting.
//!
//! Reports what the writer is doing during `rentsync import` / `export`:
//! the change-set sizes once an entity is reconciled, then a running count
//! per write phase. Progress is emitted on **stderr** so stdout keeps the run
//! summary parseable for scripts.

use std::io::Write;

/// Write phase of one entity.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ApplyPhase {
    Deleting,
    Updating,
    Adding,
}

impl ApplyPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplyPhase::Deleting => "deleting",
            ApplyPhase::Updating => "updating",
            ApplyPhase::Adding => "adding",
        }
    }
}

/// A single progress event.
#[derive(Clone, Debug)]
pub enum ApplyProgressEvent {
    /// The change set of an entity is known.
    Reconciled {
        entity: String,
        add: u64,
        update: u64,
        remove: u64,
    },
    /// `n` of `total` records of a phase are written.
    Writing {
        entity: String,
        phase: ApplyPhase,
        n: u64,
        total: u64,
    },
}

/// Reports apply progress. Implementations write to stderr (human or JSON).
pub trait ApplyProgressReporter: Send + Sync {
    fn report(&self, event: ApplyProgressEvent);
}

/// Human-friendly progress on stderr: "deal  adding  120 / 1,500 records".
pub struct StderrProgress;

impl ApplyProgressReporter for StderrProgress {
    fn report(&self, event: ApplyProgressEvent) {
        let line = match &event {
            ApplyProgressEvent::Reconciled {
                entity,
                add,
                update,
                remove,
            } => format!(
                "{}  reconciled  +{} ~{} -{}\n",
                entity,
                format_number(*add),
                format_number(*update),
                format_number(*remove)
            ),
            ApplyProgressEvent::Writing {
                entity,
                phase,
                n,
                total,
            } => format!(
                "{}  {}  {} / {} records\n",
                entity,
                phase.as_str(),
                format_number(*n),
                format_number(*total)
            ),
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ApplyProgressReporter for JsonProgress {
    fn report(&self, event: ApplyProgressEvent) {
        let obj = match &event {
            ApplyProgressEvent::Reconciled {
                entity,
                add,
                update,
                remove,
            } => serde_json::json!({
                "event": "reconciled",
                "entity": entity,
                "add": add,
                "update": update,
                "remove": remove
            }),
            ApplyProgressEvent::Writing {
                entity,
                phase,
                n,
                total,
            } => serde_json::json!({
                "event": "progress",
                "entity": entity,
                "phase": phase.as_str(),
                "n": n,
                "total": total
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

impl ApplyProgressReporter for NoProgress {
    fn report(&self, _event: ApplyProgressEvent) {}
}

pub(crate) fn format_number(n: u64) -> String {
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

    pub fn reporter(&self) -> Box<dyn ApplyProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
