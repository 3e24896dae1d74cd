use std::{collections::HashMap, sync::Arc};

use anyhow::{bail, Result};
use log::{debug, trace};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::{
    select,
    sync::{watch, OwnedSemaphorePermit, Semaphore},
};
use tokio_util::sync::CancellationToken;
use types::{phase0::primitives::Slot, snapshot::AgnosticState};

#[derive(Debug, Error)]
pub enum Error {
    #[error("state cache is closed")]
    CacheClosed,
    #[error("state at slot {slot} could not be obtained")]
    StateUnavailable { slot: Slot },
}

#[derive(Clone, Default)]
enum Promise {
    #[default]
    Pending,
    Ready(Arc<AgnosticState>),
    Unavailable,
}

impl Promise {
    const fn is_settled(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

struct Entry {
    sender: watch::Sender<Promise>,
    // Held while the state occupies the cache. Dropped when the entry is consumed.
    permit: Option<OwnedSemaphorePermit>,
}

impl Entry {
    fn pending() -> Self {
        Self {
            sender: watch::Sender::new(Promise::Pending),
            permit: None,
        }
    }
}

/// Snapshots keyed by slot, handed from the thread that fetches them to the one that consumes
/// them.
///
/// Every slot has a promise that a consumer can wait on before the state arrives. A state is
/// evicted as soon as its consumer has received it. At most `capacity` states are held at once;
/// producers wait for space instead of buffering ahead without bound.
pub struct StateCache {
    entries: Mutex<HashMap<Slot, Entry>>,
    capacity: Arc<Semaphore>,
    closed: CancellationToken,
}

impl StateCache {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity: Arc::new(Semaphore::new(capacity)),
            closed: CancellationToken::new(),
        }
    }

    /// Publishes a state. Waits while the cache is full.
    pub async fn insert(&self, state: Arc<AgnosticState>) -> Result<()> {
        let slot = state.slot;

        let permit = select! {
            permit = Arc::clone(&self.capacity).acquire_owned() => permit?,
            () = self.closed.cancelled() => bail!(Error::CacheClosed),
        };

        let mut entries = self.entries.lock();
        let entry = entries.entry(slot).or_insert_with(Entry::pending);

        entry.permit = Some(permit);
        entry.sender.send_replace(Promise::Ready(state));

        trace!("state at slot {slot} cached");

        Ok(())
    }

    /// Settles the promise for `slot` without a state so that its consumer can move on.
    pub fn mark_unavailable(&self, slot: Slot) {
        self.entries
            .lock()
            .entry(slot)
            .or_insert_with(Entry::pending)
            .sender
            .send_replace(Promise::Unavailable);

        debug!("state at slot {slot} marked unavailable");
    }

    /// Waits until the state at `slot` is published and takes it out of the cache.
    ///
    /// Each slot is expected to have a single consumer.
    pub async fn wait(&self, slot: Slot) -> Result<Arc<AgnosticState>> {
        let mut receiver = self
            .entries
            .lock()
            .entry(slot)
            .or_insert_with(Entry::pending)
            .sender
            .subscribe();

        let promise = select! {
            result = receiver.wait_for(Promise::is_settled) => match result {
                Ok(promise) => promise.clone(),
                Err(_) => bail!(Error::CacheClosed),
            },
            () = self.closed.cancelled() => bail!(Error::CacheClosed),
        };

        self.entries.lock().remove(&slot);

        match promise {
            Promise::Ready(state) => Ok(state),
            Promise::Unavailable => bail!(Error::StateUnavailable { slot }),
            Promise::Pending => bail!(Error::CacheClosed),
        }
    }

    /// Wakes every waiter and producer with [`Error::CacheClosed`].
    pub fn close(&self) {
        self.closed.cancel();
        self.entries.lock().clear();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Number of states published but not yet consumed.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .values()
            .filter(|entry| entry.permit.is_some())
            .count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
