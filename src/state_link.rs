use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use crate::state::State;

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// a process-wide unique id
    pub fn next() -> ConnectionId {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        ConnectionId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Display for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identifies one link of one connection, which is how a [`State`] refers to the links bound
///  to it
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct LinkKey {
    pub connection: ConnectionId,
    pub link_id: u16,
}

/// Lifecycle of a link: a requested link is `Listening` until the peer answers with `LinkUp`.
///  Links that went down are removed, so `Down` is what a lookup reports for them.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum LinkState {
    Down,
    Listening,
    Up,
}

/// The ids of a connection's links that have unsent changes. States push into it when a value
///  becomes dirty, the connection drains it once per update cycle.
#[derive(Default, Debug)]
pub struct DirtyLinkQueue {
    link_ids: Mutex<Vec<u16>>,
}

impl DirtyLinkQueue {
    pub fn push(&self, link_id: u16) {
        let mut link_ids = self.link_ids.lock().unwrap_or_else(PoisonError::into_inner);
        if !link_ids.contains(&link_id) {
            link_ids.push(link_id);
        }
    }

    pub fn take(&self) -> Vec<u16> {
        std::mem::take(&mut *self.link_ids.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn clear(&self) {
        self.link_ids.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    pub fn is_empty(&self) -> bool {
        self.link_ids.lock().unwrap_or_else(PoisonError::into_inner).is_empty()
    }
}

/// A connection's view of one link
pub(crate) struct StateLink {
    pub state: Arc<State>,
    pub link_state: LinkState,
    pub read_only: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dirty_link_queue_dedup() {
        let queue = DirtyLinkQueue::default();
        queue.push(3);
        queue.push(1);
        queue.push(3);

        assert_eq!(queue.take(), vec![3, 1]);
        assert!(queue.is_empty());

        queue.push(2);
        queue.clear();
        assert!(queue.take().is_empty());
    }

    #[test]
    fn test_connection_ids_unique() {
        let a = ConnectionId::next();
        let b = ConnectionId::next();
        assert_ne!(a, b);
    }
}
