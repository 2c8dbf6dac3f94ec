use tokio::sync::watch;

use crate::power::PowerState;

/// Latest power value plus the number of writes that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Snapshot {
    pub state: PowerState,
    pub version: u64,
}

/// The single shared power cell. Last write wins; every write bumps `version`
/// so callers racing each other can tell which of them landed last.
#[derive(Debug)]
pub struct StateMirror {
    tx: watch::Sender<Snapshot>,
}

impl StateMirror {
    pub fn new(initial: PowerState) -> Self {
        let (tx, _) = watch::channel(Snapshot {
            state: initial,
            version: 0,
        });
        Self { tx }
    }

    /// Overwrite the value and return the sequence number of this write.
    pub fn set(&self, state: PowerState) -> u64 {
        let mut version = 0;
        self.tx.send_modify(|snap| {
            snap.version += 1;
            snap.state = state;
            version = snap.version;
        });
        version
    }

    pub fn get(&self) -> PowerState {
        self.tx.borrow().state
    }

    pub fn snapshot(&self) -> Snapshot {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.tx.subscribe()
    }
}

impl Default for StateMirror {
    fn default() -> Self {
        Self::new(PowerState::Off)
    }
}
