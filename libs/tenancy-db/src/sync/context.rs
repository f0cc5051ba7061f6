use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

/// Progress of one workspace key within a unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Processing,
    Committed(i64),
}

/// Outcome of [`SyncContext::claim`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// Caller owns the key and must commit or release it.
    Claimed,
    /// Key already synchronized in this unit of work.
    Resolved(i64),
    /// Another save of the same key has not finished.
    InFlight,
}

/// In-flight and resolved workspace keys for one unit of work.
///
/// Create one per request (or per batch job) and pass it to every
/// synchronizer call made on its behalf.
#[derive(Debug, Default)]
pub struct SyncContext {
    states: DashMap<String, SyncState>,
}

impl SyncContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn claim(&self, key: &str) -> Claim {
        match self.states.entry(key.to_owned()) {
            Entry::Occupied(e) => match *e.get() {
                SyncState::Processing => Claim::InFlight,
                SyncState::Committed(id) => Claim::Resolved(id),
            },
            Entry::Vacant(e) => {
                e.insert(SyncState::Processing);
                Claim::Claimed
            }
        }
    }

    pub fn commit(&self, key: &str, id: i64) {
        self.states.insert(key.to_owned(), SyncState::Committed(id));
    }

    /// Forget a key that failed; committed keys are kept.
    pub fn release(&self, key: &str) {
        self.states
            .remove_if(key, |_, state| *state == SyncState::Processing);
    }

    #[must_use]
    pub fn state(&self, key: &str) -> Option<SyncState> {
        self.states.get(key).map(|s| *s.value())
    }
}
