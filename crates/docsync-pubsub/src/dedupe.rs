//! TTL-based dedupe set for replicated message ids.
//!
//! One map per process, keyed by `(namespacedDocId, messageId)`; entries are pruned lazily on
//! access rather than by a background sweep, avoiding a second timer in addition to each
//! session's cleanup timer.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use docsync_proto::{MessageId, NamespacedDocId};
use parking_lot::Mutex;

const DEFAULT_TTL: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct Entry {
    expires_at: Instant,
}

/// Tracks recently-seen `(doc, message)` pairs so a replicated message is accepted at most once
/// per TTL window.
pub struct Dedupe {
    ttl: Duration,
    seen: Mutex<HashMap<(NamespacedDocId, MessageId), Entry>>,
}

impl Dedupe {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `true` the first time `(doc, message_id)` is seen within the TTL window, `false`
    /// on every subsequent call until the entry expires.
    pub fn should_accept(&self, doc: &NamespacedDocId, message_id: &MessageId) -> bool {
        let now = Instant::now();
        let mut seen = self.seen.lock();

        // Amortized prune: evict anything expired whenever we touch the map. Bounded by the
        // number of entries actually expired since the last call, not the whole map size.
        seen.retain(|_, entry| entry.expires_at > now);

        let key = (doc.clone(), message_id.clone());
        if seen.contains_key(&key) {
            return false;
        }
        seen.insert(
            key,
            Entry {
                expires_at: now + self.ttl,
            },
        );
        true
    }

    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Dedupe {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn doc(s: &str) -> NamespacedDocId {
        NamespacedDocId(s.to_string())
    }

    fn msg(s: &str) -> MessageId {
        MessageId(s.to_string())
    }

    #[test]
    fn accepts_once_then_rejects() {
        let dedupe = Dedupe::new(Duration::from_secs(60));
        assert!(dedupe.should_accept(&doc("d1"), &msg("m1")));
        assert!(!dedupe.should_accept(&doc("d1"), &msg("m1")));
    }

    #[test]
    fn distinct_docs_are_independent() {
        let dedupe = Dedupe::new(Duration::from_secs(60));
        assert!(dedupe.should_accept(&doc("d1"), &msg("m1")));
        assert!(dedupe.should_accept(&doc("d2"), &msg("m1")));
    }

    #[test]
    fn expired_entries_are_accepted_again() {
        let dedupe = Dedupe::new(Duration::from_millis(1));
        assert!(dedupe.should_accept(&doc("d1"), &msg("m1")));
        std::thread::sleep(Duration::from_millis(20));
        assert!(dedupe.should_accept(&doc("d1"), &msg("m1")));
    }

    proptest! {
        // Within a TTL window long enough not to expire mid-test, should_accept must behave
        // like a set's `insert`: true the first time a key is seen, false on every repeat,
        // regardless of how the keys are interleaved.
        #[test]
        fn should_accept_is_idempotent_per_key(keys in prop::collection::vec(0u8..6, 0..100)) {
            let dedupe = Dedupe::new(Duration::from_secs(3600));
            let mut already_seen = std::collections::HashSet::new();
            for k in keys {
                let expected_first_time = already_seen.insert(k);
                let accepted = dedupe.should_accept(&doc("d1"), &msg(&k.to_string()));
                prop_assert_eq!(accepted, expected_first_time);
            }
        }
    }
}
