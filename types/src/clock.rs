use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// A point on the [`DiagnosticClock`].
///
/// Stamps from the same clock are totally ordered: a stamp taken earlier
/// always compares less than one taken later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Stamp(u64);

impl Stamp {
    #[must_use]
    pub fn value(self) -> u64 {
        self.0
    }
}

/// Shared monotonic counter ordering diagnostic updates against clears.
///
/// Every diagnostics push is stamped when the service emits it; every clear
/// is stamped when it happens. An update whose stamp precedes the latest
/// clear of its file is stale.
#[derive(Debug, Clone, Default)]
pub struct DiagnosticClock {
    next: Arc<AtomicU64>,
}

impl DiagnosticClock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the next stamp.
    #[must_use]
    pub fn tick(&self) -> Stamp {
        Stamp(self.next.fetch_add(1, Ordering::Relaxed))
    }
}
