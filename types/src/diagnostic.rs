//! Diagnostics as reported by a compiler service.
//!
//! A [`Diagnostic`] is always filed under one [`DiagnosticCategory`] for one
//! file. The aggregator replaces whole (file, category) pairs, so categories
//! form the unit of freshness: a new semantic check never wipes syntax errors.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;

/// Which kind of check produced a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticCategory {
    Syntax,
    Semantic,
    Suggestion,
}

impl DiagnosticCategory {
    /// Every category, in display order.
    pub const ALL: [Self; 3] = [Self::Syntax, Self::Semantic, Self::Suggestion];

    /// Map a service push event name (`syntaxDiag`, ...) to its category.
    #[must_use]
    pub fn from_event(event: &str) -> Option<Self> {
        match event {
            "syntaxDiag" => Some(Self::Syntax),
            "semanticDiag" => Some(Self::Semantic),
            "suggestionDiag" => Some(Self::Suggestion),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Syntax => "syntax",
            Self::Semantic => "semantic",
            Self::Suggestion => "suggestion",
        }
    }
}

/// Severity level for a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticSeverity {
    Error,
    Warning,
    Suggestion,
    Message,
}

impl DiagnosticSeverity {
    /// Convert from the service's category label.
    ///
    /// Returns `None` for unknown labels; boundary code picks the fallback.
    #[must_use]
    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "error" => Some(Self::Error),
            "warning" => Some(Self::Warning),
            "suggestion" => Some(Self::Suggestion),
            "message" => Some(Self::Message),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_error(self) -> bool {
        self == Self::Error
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Suggestion => "suggestion",
            Self::Message => "message",
        }
    }
}

/// A 0-indexed line/column position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize)]
pub struct Position {
    pub line: u32,
    pub col: u32,
}

impl Position {
    #[must_use]
    pub fn new(line: u32, col: u32) -> Self {
        Self { line, col }
    }

    /// Convert from the service's 1-based `line`/`offset` pair.
    #[must_use]
    pub fn from_one_based(line: u32, offset: u32) -> Self {
        Self {
            line: line.saturating_sub(1),
            col: offset.saturating_sub(1),
        }
    }
}

/// A single diagnostic from a compiler service.
///
/// Fields are private; external consumers read via accessors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    severity: DiagnosticSeverity,
    message: String,
    start: Position,
    end: Position,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<u32>,
    /// Source of the diagnostic (e.g. "ts").
    source: String,
}

impl Diagnostic {
    #[must_use]
    pub fn new(
        severity: DiagnosticSeverity,
        message: String,
        start: Position,
        end: Position,
        code: Option<u32>,
        source: String,
    ) -> Self {
        Self {
            severity,
            message,
            start,
            end,
            code,
            source,
        }
    }

    #[must_use]
    pub fn severity(&self) -> DiagnosticSeverity {
        self.severity
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn start(&self) -> Position {
        self.start
    }

    #[must_use]
    pub fn end(&self) -> Position {
        self.end
    }

    #[must_use]
    pub fn code(&self) -> Option<u32> {
        self.code
    }

    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Format as `path:line:col: severity: [source code] message` (1-indexed for display).
    #[must_use]
    pub fn display_with_path(&self, path: &Path) -> String {
        let code = self.code.map(|c| format!(" TS{c}")).unwrap_or_default();
        format!(
            "{}:{}:{}: {}: [{}{code}] {}",
            path.display(),
            self.start.line + 1,
            self.start.col + 1,
            self.severity.label(),
            self.source,
            self.message,
        )
    }
}

/// All current diagnostics of one file, grouped by category.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FileDiagnostics {
    path: PathBuf,
    categories: BTreeMap<DiagnosticCategory, Vec<Diagnostic>>,
}

impl FileDiagnostics {
    #[must_use]
    pub fn new(path: PathBuf, categories: BTreeMap<DiagnosticCategory, Vec<Diagnostic>>) -> Self {
        Self { path, categories }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn category(&self, category: DiagnosticCategory) -> &[Diagnostic] {
        self.categories.get(&category).map_or(&[], Vec::as_slice)
    }

    /// Every diagnostic of the file, in category order.
    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.categories.values().flatten()
    }

    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.iter().any(|d| d.severity().is_error())
    }
}

/// Immutable snapshot of all diagnostics, suitable for UI rendering.
///
/// Counts are computed from the canonical source (`files`), never cached.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DiagnosticsSnapshot {
    /// Per-file diagnostics, sorted with error-containing files first.
    files: Vec<FileDiagnostics>,
}

impl DiagnosticsSnapshot {
    #[must_use]
    pub fn new(files: Vec<FileDiagnostics>) -> Self {
        Self { files }
    }

    #[must_use]
    pub fn files(&self) -> &[FileDiagnostics] {
        &self.files
    }

    #[must_use]
    pub fn file(&self, path: &Path) -> Option<&FileDiagnostics> {
        self.files.iter().find(|f| f.path() == path)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    fn count_by_severity(&self, severity: DiagnosticSeverity) -> usize {
        self.files
            .iter()
            .flat_map(FileDiagnostics::iter)
            .filter(|d| d.severity() == severity)
            .count()
    }

    #[must_use]
    pub fn error_count(&self) -> usize {
        self.count_by_severity(DiagnosticSeverity::Error)
    }

    #[must_use]
    pub fn warning_count(&self) -> usize {
        self.count_by_severity(DiagnosticSeverity::Warning)
    }

    #[must_use]
    pub fn total_count(&self) -> usize {
        self.files.iter().map(|f| f.iter().count()).sum()
    }

    /// Format a compact status string like "E:3 W:5".
    #[must_use]
    pub fn status_string(&self) -> String {
        if self.is_empty() {
            return String::new();
        }
        format!("E:{} W:{}", self.error_count(), self.warning_count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_diag(severity: DiagnosticSeverity, msg: &str) -> Diagnostic {
        Diagnostic::new(
            severity,
            msg.to_string(),
            Position::new(10, 5),
            Position::new(10, 8),
            Some(2304),
            "ts".to_string(),
        )
    }

    #[test]
    fn test_category_from_event() {
        assert_eq!(
            DiagnosticCategory::from_event("syntaxDiag"),
            Some(DiagnosticCategory::Syntax)
        );
        assert_eq!(
            DiagnosticCategory::from_event("semanticDiag"),
            Some(DiagnosticCategory::Semantic)
        );
        assert_eq!(
            DiagnosticCategory::from_event("suggestionDiag"),
            Some(DiagnosticCategory::Suggestion)
        );
        assert_eq!(DiagnosticCategory::from_event("requestCompleted"), None);
    }

    #[test]
    fn test_severity_from_label() {
        assert_eq!(
            DiagnosticSeverity::from_label("error"),
            Some(DiagnosticSeverity::Error)
        );
        assert_eq!(
            DiagnosticSeverity::from_label("message"),
            Some(DiagnosticSeverity::Message)
        );
        assert_eq!(DiagnosticSeverity::from_label("fatal"), None);
    }

    #[test]
    fn test_position_from_one_based() {
        assert_eq!(Position::from_one_based(1, 1), Position::new(0, 0));
        assert_eq!(Position::from_one_based(12, 4), Position::new(11, 3));
        // Malformed zero values clamp instead of wrapping.
        assert_eq!(Position::from_one_based(0, 0), Position::new(0, 0));
    }

    #[test]
    fn test_display_with_path() {
        let diag = make_diag(DiagnosticSeverity::Error, "Cannot find name 'x'.");
        assert_eq!(
            diag.display_with_path(Path::new("src/a.ts")),
            "src/a.ts:11:6: error: [ts TS2304] Cannot find name 'x'."
        );
    }

    #[test]
    fn test_file_diagnostics_category_lookup() {
        let mut categories = BTreeMap::new();
        categories.insert(
            DiagnosticCategory::Semantic,
            vec![make_diag(DiagnosticSeverity::Warning, "w")],
        );
        let file = FileDiagnostics::new(PathBuf::from("a.ts"), categories);
        assert_eq!(file.category(DiagnosticCategory::Semantic).len(), 1);
        assert!(file.category(DiagnosticCategory::Syntax).is_empty());
        assert!(!file.has_errors());
    }

    #[test]
    fn test_snapshot_counts() {
        let mut categories = BTreeMap::new();
        categories.insert(
            DiagnosticCategory::Syntax,
            vec![make_diag(DiagnosticSeverity::Error, "e1")],
        );
        categories.insert(
            DiagnosticCategory::Semantic,
            vec![
                make_diag(DiagnosticSeverity::Error, "e2"),
                make_diag(DiagnosticSeverity::Warning, "w1"),
                make_diag(DiagnosticSeverity::Suggestion, "s1"),
            ],
        );
        let snap =
            DiagnosticsSnapshot::new(vec![FileDiagnostics::new(PathBuf::from("a.ts"), categories)]);
        assert_eq!(snap.error_count(), 2);
        assert_eq!(snap.warning_count(), 1);
        assert_eq!(snap.total_count(), 4);
        assert_eq!(snap.status_string(), "E:2 W:1");
        assert!(snap.file(Path::new("a.ts")).is_some());
    }

    #[test]
    fn test_snapshot_default_is_empty() {
        let snap = DiagnosticsSnapshot::default();
        assert!(snap.is_empty());
        assert_eq!(snap.status_string(), "");
    }
}
