//! Single-use enforcement for request signatures.
//!
//! Every admitted signature is remembered until its stamp falls outside the
//! validity window. Entries are ordered by stamp, so pruning walks from the
//! oldest and stops at the first entry that is still fresh. A request stamped
//! in the future stays until its own stamp ages out without holding back the
//! pruning of anything stamped before it.
//!
//! The window is local to this process. Running several gateway instances
//! gives each one an independent window, so a signature can be replayed once
//! against every other instance.

use std::collections::{BTreeSet, HashSet};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::debug;

/// Default validity window for a signed request.
pub const DEFAULT_REPLAY_WINDOW: Duration = Duration::from_millis(5_000);

/// A signature that has already been accepted.
///
/// Sorts by stamp first. Replay detection looks at the signature alone.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct UsedSignature {
    /// Client stamp, epoch milliseconds.
    pub issued_at: i64,
    pub signature: String,
}

#[derive(Debug, Default)]
struct Window {
    by_stamp: BTreeSet<UsedSignature>,
    seen: HashSet<String>,
}

/// Thread-safe record of recently used signatures.
#[derive(Debug)]
pub struct ReplayGuard {
    window: Mutex<Window>,
    timeout_ms: i64,
}

impl ReplayGuard {
    pub fn new(timeout: Duration) -> Self {
        Self {
            window: Mutex::new(Window::default()),
            timeout_ms: i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX),
        }
    }

    /// Records `signature` if it has not been seen inside the window.
    ///
    /// Returns `false` when the signature is a replay.
    pub fn admit(&self, signature: &str, issued_at: i64) -> bool {
        self.admit_at(signature, issued_at, Utc::now().timestamp_millis())
    }

    /// As [`admit`](Self::admit), evaluated at `now` (epoch milliseconds).
    pub fn admit_at(&self, signature: &str, issued_at: i64, now: i64) -> bool {
        let mut window = self.window.lock();

        if !window.seen.insert(signature.to_string()) {
            debug!("signature already present in replay window");
            return false;
        }
        window.by_stamp.insert(UsedSignature {
            issued_at,
            signature: signature.to_string(),
        });

        let mut pruned = 0usize;
        while let Some(oldest) = window.by_stamp.first() {
            if now.saturating_sub(oldest.issued_at) <= self.timeout_ms {
                break;
            }
            if let Some(expired) = window.by_stamp.pop_first() {
                window.seen.remove(&expired.signature);
                pruned += 1;
            }
        }
        if pruned > 0 {
            debug!("pruned {} expired signatures", pruned);
        }

        true
    }

    pub fn len(&self) -> usize {
        self.window.lock().seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ReplayGuard {
    fn default() -> Self {
        Self::new(DEFAULT_REPLAY_WINDOW)
    }
}
