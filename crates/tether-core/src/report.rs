//! # Reports
//!
//! Per-item diagnostics collected while a context runs. Failures that only
//! affect one item or one library never abort a stage; they land here and
//! the stage moves on. Every entry is also emitted as a tracing event.

use crate::BlockKind;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ReportLevel {
    Info,
    Warning,
    Error,
}

/// What a report entry is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DiagnosticKind {
    LibraryNotFound,
    ItemNotFound,
    NameCollision,
    Placeholder,
    Relocation,
    AssetResolution,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportEntry {
    pub level: ReportLevel,
    pub kind: DiagnosticKind,
    pub message: String,
}

/// Accumulated diagnostics and counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reports {
    pub missing_libraries: u32,
    pub missing_items: u32,
    pub placeholders: u32,
    pub resolved_overrides: u32,
    entries: Vec<ReportEntry>,
}

impl Reports {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[ReportEntry] {
        &self.entries
    }

    /// Number of entries of `kind`.
    #[must_use]
    pub fn count(&self, kind: DiagnosticKind) -> usize {
        self.entries.iter().filter(|e| e.kind == kind).count()
    }

    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.entries.iter().any(|e| e.level == ReportLevel::Error)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn push(&mut self, level: ReportLevel, kind: DiagnosticKind, message: String) {
        match level {
            ReportLevel::Info => info!(?kind, "{message}"),
            ReportLevel::Warning => warn!(?kind, "{message}"),
            ReportLevel::Error => error!(?kind, "{message}"),
        }
        self.entries.push(ReportEntry {
            level,
            kind,
            message,
        });
    }

    pub fn warning(&mut self, kind: DiagnosticKind, message: String) {
        self.push(ReportLevel::Warning, kind, message);
    }

    pub fn info(&mut self, kind: DiagnosticKind, message: String) {
        self.push(ReportLevel::Info, kind, message);
    }

    pub(crate) fn library_not_found(&mut self, path: &str, reason: &str) {
        self.missing_libraries += 1;
        self.push(
            ReportLevel::Warning,
            DiagnosticKind::LibraryNotFound,
            format!("Cannot read library '{path}': {reason}"),
        );
    }

    pub(crate) fn item_not_found(&mut self, kind: BlockKind, name: &str, libraries: &[&str]) {
        self.missing_items += 1;
        self.push(
            ReportLevel::Warning,
            DiagnosticKind::ItemNotFound,
            format!(
                "Cannot find {kind} '{name}' in {}",
                if libraries.is_empty() {
                    "any library".to_string()
                } else {
                    libraries.join(", ")
                }
            ),
        );
    }

    pub(crate) fn name_collision(&mut self, kind: BlockKind, name: &str) {
        self.push(
            ReportLevel::Warning,
            DiagnosticKind::NameCollision,
            format!("A local {kind} named '{name}' already exists, keeping it linked"),
        );
    }

    pub(crate) fn placeholder(&mut self, kind: BlockKind, name: &str, library: &str) {
        self.placeholders += 1;
        self.push(
            ReportLevel::Info,
            DiagnosticKind::Placeholder,
            format!("Created placeholder for missing {kind} '{name}' of '{library}'"),
        );
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_follow_entries() {
        let mut reports = Reports::new();
        reports.library_not_found("a.tether", "no such archive");
        reports.item_not_found(BlockKind::Mesh, "Cube", &["a.tether", "b.tether"]);
        reports.item_not_found(BlockKind::Mesh, "Sphere", &[]);

        assert_eq!(reports.missing_libraries, 1);
        assert_eq!(reports.missing_items, 2);
        assert_eq!(reports.count(DiagnosticKind::ItemNotFound), 2);
        assert!(!reports.has_errors());
        assert!(
            reports
                .entries()
                .iter()
                .any(|e| e.message.contains("a.tether, b.tether"))
        );
    }
}
