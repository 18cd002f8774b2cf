use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};

use tokio::sync::watch;

use crate::FlagSnapshot;

/// `SnapshotStore` holds the latest environment snapshot and lets readers either read it or wait
/// for changes.
///
/// Snapshots are swapped wholesale, so a reader never observes a partially updated set of flags.
/// Writers take a [`WriteTicket`] before fetching; a write is dropped if a fetch started later has
/// already been stored, so the snapshot never goes back to older data.
pub struct SnapshotStore {
    sender: watch::Sender<Option<Arc<FlagSnapshot>>>,
    next_ticket: AtomicU64,
    applied: Mutex<u64>,
}

/// Orders snapshot writes by the time their fetch started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct WriteTicket(u64);

impl SnapshotStore {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(None);
        Self {
            sender,
            next_ticket: AtomicU64::new(1),
            applied: Mutex::new(0),
        }
    }

    pub fn get_snapshot(&self) -> Option<Arc<FlagSnapshot>> {
        self.sender.borrow().clone()
    }

    /// Take a ticket for a fetch that is about to start.
    pub fn ticket(&self) -> WriteTicket {
        WriteTicket(self.next_ticket.fetch_add(1, Ordering::Relaxed))
    }

    /// Store `snapshot` unless a write with a later ticket was already stored.
    ///
    /// Returns `true` if the snapshot was stored and published.
    pub fn set_snapshot(&self, ticket: WriteTicket, snapshot: Arc<FlagSnapshot>) -> bool {
        let mut applied = self
            .applied
            .lock()
            .expect("thread holding snapshot lock should not panic");
        if ticket.0 <= *applied {
            log::debug!(target: "flagsync", ticket = ticket.0, applied = *applied; "dropping outdated snapshot");
            return false;
        }
        *applied = ticket.0;
        self.sender.send_replace(Some(snapshot));
        true
    }

    /// Subscribe to snapshot changes. The receiver starts with the current value marked as seen.
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<FlagSnapshot>>> {
        self.sender.subscribe()
    }
}

impl Default for SnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}
