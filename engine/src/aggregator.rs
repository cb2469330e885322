//! Diagnostics store keyed by (file, category).
//!
//! Every update carries the [`Stamp`] it was given when the service pushed
//! it. Clearing a file records a tombstone stamp; updates stamped before the
//! tombstone are stale and discarded, so a push that raced with a document
//! close cannot bring its diagnostics back.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use tsmux_types::{
    Diagnostic, DiagnosticCategory, DiagnosticClock, DiagnosticsSnapshot, FileDiagnostics, Stamp,
};

type Categories = BTreeMap<DiagnosticCategory, Vec<Diagnostic>>;

#[derive(Debug)]
pub struct DiagnosticAggregator {
    clock: DiagnosticClock,
    files: BTreeMap<PathBuf, Categories>,
    tombstones: HashMap<PathBuf, Stamp>,
    /// Set by `clear_all`; applies to every file.
    floor: Option<Stamp>,
}

impl DiagnosticAggregator {
    #[must_use]
    pub fn new(clock: DiagnosticClock) -> Self {
        Self {
            clock,
            files: BTreeMap::new(),
            tombstones: HashMap::new(),
            floor: None,
        }
    }

    fn is_stale(&self, stamp: Stamp, path: &Path) -> bool {
        self.floor.is_some_and(|floor| stamp < floor)
            || self.tombstones.get(path).is_some_and(|t| stamp < *t)
    }

    /// Replace the diagnostics of one (file, category) pair.
    ///
    /// Returns `false` when the update was stale and nothing changed.
    pub fn set_diagnostics(
        &mut self,
        stamp: Stamp,
        category: DiagnosticCategory,
        path: PathBuf,
        items: Vec<Diagnostic>,
    ) -> bool {
        if self.is_stale(stamp, &path) {
            tracing::debug!(
                path = %path.display(),
                category = category.as_str(),
                stamp = stamp.value(),
                "Discarding stale diagnostics"
            );
            return false;
        }

        if items.is_empty() {
            if let Some(categories) = self.files.get_mut(&path) {
                categories.remove(&category);
                if categories.is_empty() {
                    self.files.remove(&path);
                }
            }
        } else {
            self.files.entry(path).or_default().insert(category, items);
        }
        true
    }

    /// Remove every category of `path`.
    pub fn clear_file(&mut self, path: &Path) {
        let stamp = self.clock.tick();
        self.files.remove(path);
        self.tombstones.insert(path.to_path_buf(), stamp);
    }

    /// Remove everything.
    pub fn clear_all(&mut self) {
        self.floor = Some(self.clock.tick());
        self.files.clear();
        self.tombstones.clear();
    }

    #[must_use]
    pub fn get(&self, path: &Path) -> Option<FileDiagnostics> {
        self.files
            .get(path)
            .map(|categories| FileDiagnostics::new(path.to_path_buf(), categories.clone()))
    }

    /// Files with errors first, then by path.
    #[must_use]
    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        let mut files: Vec<FileDiagnostics> = self
            .files
            .iter()
            .map(|(path, categories)| FileDiagnostics::new(path.clone(), categories.clone()))
            .collect();
        files.sort_by(|a, b| {
            b.has_errors()
                .cmp(&a.has_errors())
                .then_with(|| a.path().cmp(b.path()))
        });
        DiagnosticsSnapshot::new(files)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tsmux_types::{DiagnosticSeverity, Position};

    fn make_diag(severity: DiagnosticSeverity, msg: &str) -> Diagnostic {
        Diagnostic::new(
            severity,
            msg.to_string(),
            Position::new(0, 0),
            Position::new(0, 1),
            None,
            "ts".to_string(),
        )
    }

    fn setup() -> (DiagnosticClock, DiagnosticAggregator) {
        let clock = DiagnosticClock::new();
        let aggregator = DiagnosticAggregator::new(clock.clone());
        (clock, aggregator)
    }

    #[test]
    fn test_full_replace_within_pair() {
        let (clock, mut agg) = setup();
        let path = PathBuf::from("/p/a.ts");
        agg.set_diagnostics(
            clock.tick(),
            DiagnosticCategory::Semantic,
            path.clone(),
            vec![
                make_diag(DiagnosticSeverity::Error, "one"),
                make_diag(DiagnosticSeverity::Error, "two"),
            ],
        );
        agg.set_diagnostics(
            clock.tick(),
            DiagnosticCategory::Semantic,
            path.clone(),
            vec![make_diag(DiagnosticSeverity::Warning, "three")],
        );

        let file = agg.get(&path).unwrap();
        let semantic = file.category(DiagnosticCategory::Semantic);
        assert_eq!(semantic.len(), 1);
        assert_eq!(semantic[0].message(), "three");
    }

    #[test]
    fn test_categories_are_independent() {
        let (clock, mut agg) = setup();
        let path = PathBuf::from("/p/a.ts");
        agg.set_diagnostics(
            clock.tick(),
            DiagnosticCategory::Syntax,
            path.clone(),
            vec![make_diag(DiagnosticSeverity::Error, "';' expected")],
        );
        agg.set_diagnostics(
            clock.tick(),
            DiagnosticCategory::Semantic,
            path.clone(),
            vec![make_diag(DiagnosticSeverity::Error, "type mismatch")],
        );
        agg.set_diagnostics(clock.tick(), DiagnosticCategory::Semantic, path.clone(), vec![]);

        let file = agg.get(&path).unwrap();
        assert_eq!(file.category(DiagnosticCategory::Syntax).len(), 1);
        assert!(file.category(DiagnosticCategory::Semantic).is_empty());
    }

    #[test]
    fn test_empty_last_pair_removes_file() {
        let (clock, mut agg) = setup();
        let path = PathBuf::from("/p/a.ts");
        agg.set_diagnostics(
            clock.tick(),
            DiagnosticCategory::Syntax,
            path.clone(),
            vec![make_diag(DiagnosticSeverity::Error, "x")],
        );
        agg.set_diagnostics(clock.tick(), DiagnosticCategory::Syntax, path.clone(), vec![]);
        assert!(agg.get(&path).is_none());
        assert!(agg.is_empty());
    }

    #[test]
    fn test_clear_file_discards_earlier_stamped_update() {
        let (clock, mut agg) = setup();
        let path = PathBuf::from("/p/a.ts");

        // Pushed by the service before the close...
        let raced = clock.tick();
        agg.clear_file(&path);
        // ...but processed after it.
        let applied = agg.set_diagnostics(
            raced,
            DiagnosticCategory::Semantic,
            path.clone(),
            vec![make_diag(DiagnosticSeverity::Error, "stale")],
        );
        assert!(!applied);
        assert!(agg.get(&path).is_none());

        // A fresh push after the clear is accepted.
        assert!(agg.set_diagnostics(
            clock.tick(),
            DiagnosticCategory::Semantic,
            path.clone(),
            vec![make_diag(DiagnosticSeverity::Error, "fresh")],
        ));
        assert_eq!(agg.get(&path).unwrap().iter().count(), 1);
    }

    #[test]
    fn test_clear_file_leaves_other_files() {
        let (clock, mut agg) = setup();
        for name in ["/p/a.ts", "/p/b.ts"] {
            agg.set_diagnostics(
                clock.tick(),
                DiagnosticCategory::Syntax,
                PathBuf::from(name),
                vec![make_diag(DiagnosticSeverity::Error, "x")],
            );
        }
        agg.clear_file(Path::new("/p/a.ts"));
        assert!(agg.get(Path::new("/p/a.ts")).is_none());
        assert!(agg.get(Path::new("/p/b.ts")).is_some());
    }

    #[test]
    fn test_clear_all_sets_floor() {
        let (clock, mut agg) = setup();
        let raced = clock.tick();
        agg.set_diagnostics(
            clock.tick(),
            DiagnosticCategory::Syntax,
            PathBuf::from("/p/a.ts"),
            vec![make_diag(DiagnosticSeverity::Error, "x")],
        );
        agg.clear_all();
        assert!(agg.is_empty());
        assert!(!agg.set_diagnostics(
            raced,
            DiagnosticCategory::Syntax,
            PathBuf::from("/p/b.ts"),
            vec![make_diag(DiagnosticSeverity::Error, "y")],
        ));
        assert!(agg.is_empty());
    }

    #[test]
    fn test_snapshot_errors_first() {
        let (clock, mut agg) = setup();
        agg.set_diagnostics(
            clock.tick(),
            DiagnosticCategory::Semantic,
            PathBuf::from("/p/a.ts"),
            vec![make_diag(DiagnosticSeverity::Warning, "w")],
        );
        agg.set_diagnostics(
            clock.tick(),
            DiagnosticCategory::Semantic,
            PathBuf::from("/p/z.ts"),
            vec![make_diag(DiagnosticSeverity::Error, "e")],
        );

        let snap = agg.snapshot();
        assert_eq!(snap.files()[0].path(), Path::new("/p/z.ts"));
        assert_eq!(snap.files()[1].path(), Path::new("/p/a.ts"));
        assert_eq!(snap.error_count(), 1);
        assert_eq!(snap.warning_count(), 1);
    }
}
