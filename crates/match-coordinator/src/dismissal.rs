//! Single-fire dismissal latch
//!
//! Convergence can be noticed by the push path, the poll path and the
//! leader's own post-submission check, possibly at the same instant. Only
//! the first to flip the latch dismisses the waiting screen.

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

/// Which path observed convergence first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DetectionPath {
    Push,
    Poll,
    PostSubmission,
}

impl fmt::Display for DetectionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DetectionPath::Push => write!(f, "push"),
            DetectionPath::Poll => write!(f, "poll"),
            DetectionPath::PostSubmission => write!(f, "post-submission check"),
        }
    }
}

#[derive(Debug, Default)]
pub struct DismissalGuard {
    fired: AtomicBool,
}

impl DismissalGuard {
    /// Create a new, unfired guard
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` for exactly one caller over the guard's lifetime
    pub fn fire(&self) -> bool {
        self.fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Like [`fire`](Self::fire), logging which path won or lost
    pub fn fire_from(&self, path: DetectionPath) -> bool {
        let won = self.fire();
        if won {
            tracing::info!("Convergence observed via {}", path);
        } else {
            tracing::debug!("Convergence via {} ignored, already dismissed", path);
        }
        won
    }

    /// Whether any path has fired
    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn test_fires_once() {
        let guard = DismissalGuard::new();
        assert!(!guard.has_fired());
        assert!(guard.fire_from(DetectionPath::Poll));
        assert!(!guard.fire_from(DetectionPath::Push));
        assert!(!guard.fire_from(DetectionPath::PostSubmission));
        assert!(guard.has_fired());
    }

    #[test]
    fn test_concurrent_paths_single_winner() {
        let guard = Arc::new(DismissalGuard::new());
        let wins = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = [
            DetectionPath::Push,
            DetectionPath::Poll,
            DetectionPath::PostSubmission,
        ]
        .into_iter()
        .cycle()
        .take(12)
        .map(|path| {
            let guard = guard.clone();
            let wins = wins.clone();
            std::thread::spawn(move || {
                if guard.fire_from(path) {
                    wins.fetch_add(1, Ordering::SeqCst);
                }
            })
        })
        .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(wins.load(Ordering::SeqCst), 1);
    }
}
