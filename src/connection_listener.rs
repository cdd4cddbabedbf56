use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use crate::connection::Connection;
use crate::state::State;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectionFailedReason {
    Generic,
    /// the peer did not answer the connection request in time
    Timeout,
    Rejected,
    NoCommonProtocol,
    /// the peer's answer could not be understood
    InvalidMessage,
}

/// Application callbacks of a [`Connection`]. They are called outside of the connection's lock,
///  so they are free to call back into the connection.
#[async_trait]
pub trait ConnectionListener: Send + Sync + 'static {
    async fn connection_established(&self, _connection: &Arc<Connection>) {}

    async fn connection_failed(&self, _connection: &Arc<Connection>, _reason: ConnectionFailedReason) {}

    async fn connection_closed(&self, _connection: &Arc<Connection>) {}

    async fn message_received(&self, _connection: &Arc<Connection>, _message: Bytes) {}

    /// A long message is arriving in parts: `bytes_received` have arrived so far
    async fn message_progress(&self, _connection: &Arc<Connection>, _bytes_received: usize) {}

    /// The peer asks to link one of its states to a local one. `message` is whatever the peer
    ///  passed to [`Connection::link_state`] for identifying the state. Returning `None`
    ///  rejects the link.
    ///
    /// NB: This is called while the connection is locked, and it must not block.
    fn create_state(&self, _message: &Bytes, _read_only: bool) -> Option<Arc<State>> {
        None
    }
}
