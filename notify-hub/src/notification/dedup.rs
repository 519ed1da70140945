//! Session-scoped deduplication.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

/// Set of event ids already accepted during the current session.
///
/// Grows for the lifetime of a session and is only emptied by [`reset`],
/// which the lifecycle manager calls on clear and on sign-out.
///
/// [`reset`]: DedupStore::reset
#[derive(Debug, Default, Clone)]
pub struct DedupStore {
    seen: HashSet<String>,
}

impl DedupStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `event_id`. Returns `false`, leaving the store untouched, if it
    /// was already seen.
    pub fn accept(&mut self, event_id: &str) -> bool {
        if self.seen.contains(event_id) {
            return false;
        }
        self.seen.insert(event_id.to_string());
        true
    }

    pub fn contains(&self, event_id: &str) -> bool {
        self.seen.contains(event_id)
    }

    pub fn reset(&mut self) {
        self.seen.clear();
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// Content fingerprints seen within a sliding time window.
///
/// Only consulted for envelopes whose id was minted locally, so two id-less
/// deliveries of the same payload inside the window collapse.
#[derive(Debug, Clone)]
pub struct ContentFingerprints {
    window: Duration,
    seen: HashMap<String, Instant>,
}

impl ContentFingerprints {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: HashMap::new(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Record `fingerprint` at `now`. Returns `false` if the same fingerprint
    /// was recorded less than one window ago.
    pub fn accept_at(&mut self, fingerprint: &str, now: Instant) -> bool {
        let window = self.window;
        self.seen
            .retain(|_, seen_at| now.saturating_duration_since(*seen_at) < window);

        if self.seen.contains_key(fingerprint) {
            return false;
        }
        self.seen.insert(fingerprint.to_string(), now);
        true
    }

    pub fn accept(&mut self, fingerprint: &str) -> bool {
        self.accept_at(fingerprint, Instant::now())
    }

    pub fn reset(&mut self) {
        self.seen.clear();
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
