//! Run Journal - explicit accumulator threaded through extract → bench → analyze
//!
//! Every stage appends to the journal it is handed instead of writing to
//! shared global state. Entries are mirrored to the `log` facade.

use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Extract,
    Request,
    Bench,
    Score,
    Analyze,
    Lineage,
    Mutate,
    Patch,
    Evolve,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warn,
}

#[derive(Debug, Clone, Serialize)]
pub struct JournalEntry {
    pub stage: Stage,
    pub severity: Severity,
    pub message: String,
    pub elapsed_ms: f64,
}

#[derive(Debug)]
pub struct RunJournal {
    started: Instant,
    entries: Vec<JournalEntry>,
    counters: BTreeMap<String, u64>,
}

impl RunJournal {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            entries: Vec::new(),
            counters: BTreeMap::new(),
        }
    }

    pub fn note(&mut self, stage: Stage, message: impl Into<String>) {
        let message = message.into();
        log::debug!("[{:?}] {}", stage, message);
        self.push(stage, Severity::Info, message);
    }

    pub fn warn(&mut self, stage: Stage, message: impl Into<String>) {
        let message = message.into();
        log::warn!("[{:?}] {}", stage, message);
        self.push(stage, Severity::Warn, message);
    }

    fn push(&mut self, stage: Stage, severity: Severity, message: String) {
        self.entries.push(JournalEntry {
            stage,
            severity,
            message,
            elapsed_ms: self.started.elapsed().as_secs_f64() * 1000.0,
        });
    }

    pub fn incr(&mut self, counter: &str, by: u64) {
        *self.counters.entry(counter.to_string()).or_insert(0) += by;
    }

    pub fn counter(&self, counter: &str) -> u64 {
        self.counters.get(counter).copied().unwrap_or(0)
    }

    pub fn entries(&self) -> &[JournalEntry] {
        &self.entries
    }

    pub fn warnings(&self) -> impl Iterator<Item = &JournalEntry> {
        self.entries.iter().filter(|e| e.severity == Severity::Warn)
    }

    pub fn summary(&self) -> String {
        let mut out = format!(
            "{} entries ({} warnings) in {:.1}ms",
            self.entries.len(),
            self.warnings().count(),
            self.started.elapsed().as_secs_f64() * 1000.0
        );
        for (name, value) in &self.counters {
            out.push_str(&format!("\n  {}: {}", name, value));
        }
        out
    }
}

impl Default for RunJournal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_journal_accumulates() {
        let mut journal = RunJournal::new();
        journal.note(Stage::Extract, "found 3 units");
        journal.warn(Stage::Bench, "variant x failed to load");
        journal.incr("variants", 2);
        journal.incr("variants", 1);

        assert_eq!(journal.entries().len(), 2);
        assert_eq!(journal.warnings().count(), 1);
        assert_eq!(journal.counter("variants"), 3);
        assert_eq!(journal.counter("missing"), 0);
        assert!(journal.summary().contains("variants: 3"));
    }
}
