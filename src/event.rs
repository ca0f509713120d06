//! Typed observer events and the watcher registry.
//!
//! Exactly two things are observable: cluster membership and session
//! open-state. Observers register an unbounded channel and receive events
//! until they drop the receiving half or deregister with their token.

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::options::ServerAddress;

/// A change in the set of servers a cluster model tracks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServerMembershipChanged {
    Added { address: ServerAddress },
    Removed { address: ServerAddress },
}

/// A session leaving the OPEN state. Sessions are never reopened, so the
/// transition is always open -> closed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionOpenStateChanged {
    pub address: ServerAddress,
}

/// A token handed out on registration; required for deregistration.
///
/// Tokens carry the slot's generation, so a token kept past its watcher's
/// lifetime can never deregister a later occupant of the same slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct WatchToken {
    index: usize,
    generation: u64,
}

struct Slot<E> {
    generation: u64,
    sender: Option<UnboundedSender<E>>,
}

/// An arena of observer channels with generation-counted removal tokens.
pub(crate) struct WatcherSet<E> {
    slots: Vec<Slot<E>>,
    free: Vec<usize>,
}

impl<E: Clone> WatcherSet<E> {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    /// Registers a new watcher, returning the receiving half and a removal
    /// token.
    pub(crate) fn watch(&mut self) -> (WatchToken, UnboundedReceiver<E>) {
        let (sender, receiver) = unbounded_channel();
        let token = self.insert(sender);
        (token, receiver)
    }

    pub(crate) fn insert(&mut self, sender: UnboundedSender<E>) -> WatchToken {
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index];
                slot.generation += 1;
                slot.sender = Some(sender);
                WatchToken {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    sender: Some(sender),
                });
                WatchToken {
                    index: self.slots.len() - 1,
                    generation: 0,
                }
            }
        }
    }

    /// Deregisters a watcher. Stale tokens are no-ops.
    pub(crate) fn remove(&mut self, token: WatchToken) {
        if let Some(slot) = self.slots.get_mut(token.index) {
            if slot.generation == token.generation && slot.sender.is_some() {
                slot.sender = None;
                self.free.push(token.index);
            }
        }
    }

    /// Sends `event` to every live watcher, reclaiming slots whose receiver
    /// has been dropped.
    pub(crate) fn broadcast(&mut self, event: &E) {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let Some(ref sender) = slot.sender {
                if sender.send(event.clone()).is_err() {
                    slot.sender = None;
                    self.free.push(index);
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.sender.is_some()).count()
    }
}
