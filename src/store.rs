use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tracing::debug;

use crate::status::UpsState;
use crate::ups::Fetcher;

/// Holds the last known ups state, shared between the poller and queries.
///
/// The value is a small `Copy` record swapped whole under a write lock, so a
/// reader never sees a half written state. Poisoned locks are recovered for
/// the same reason.
pub struct StateStore {
    state: RwLock<Option<UpsState>>,
    // Serializes the on-demand fetch so concurrent first queries share it.
    init: Mutex<()>,
    fetcher: Arc<Fetcher>,
}

impl StateStore {
    pub fn new(fetcher: Arc<Fetcher>) -> StateStore {
        StateStore {
            state: RwLock::new(None),
            init: Mutex::new(()),
            fetcher,
        }
    }

    pub fn fetcher(&self) -> &Arc<Fetcher> {
        &self.fetcher
    }

    /// The last stored state, without ever touching the network.
    pub fn peek(&self) -> Option<UpsState> {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// The last stored state. Before the first poll this fetches once,
    /// synchronously, and stores the result.
    pub fn current(&self) -> UpsState {
        if let Some(state) = self.peek() {
            return state;
        }

        let _init = self.init.lock().unwrap_or_else(PoisonError::into_inner);
        // Someone else may have filled it while we waited.
        if let Some(state) = self.peek() {
            return state;
        }

        debug!("No state yet, fetching on demand");
        let state = self.fetcher.fetch_state();
        let mut slot = self.state.write().unwrap_or_else(PoisonError::into_inner);
        // A poll cycle that landed during our fetch is newer, keep it.
        *slot.get_or_insert(state)
    }

    /// Swaps in `state` and returns what was there before.
    pub fn update(&self, state: UpsState) -> Option<UpsState> {
        let mut slot = self.state.write().unwrap_or_else(PoisonError::into_inner);
        slot.replace(state)
    }
}
