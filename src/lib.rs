//! Reliable messaging and state replication on top of UDP.
//!
//! A client [`connection::Connection`] connects to a [`server::Server`]. Once connected, both
//!  sides can send unreliable messages, reliable messages (delivered exactly once and in order,
//!  split into parts if they are long), and link [`state::State`]s: a linked state's values are
//!  replicated to the peer whenever they change.

pub mod address;
pub mod buf_ext;
pub mod config;
pub mod connection;
pub mod connection_listener;
pub mod endpoint;
pub mod fragmentation;
pub mod math;
pub mod protocol;
pub mod reliable_receive;
pub mod reliable_send;
pub mod sequence_number;
pub mod server;
pub mod state;
pub mod state_link;
pub mod test_util;
pub mod value;


#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
