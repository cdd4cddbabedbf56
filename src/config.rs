use std::time::Duration;
use anyhow::bail;

/// durations configured through the `with_*` setters are never shorter than this
pub const MIN_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// While connecting, the connection request is resent at this interval until the peer
    ///  answers or `connect_timeout` elapses.
    pub connect_resend_interval: Duration,
    pub connect_timeout: Duration,

    /// A reliable message that was sent but not acknowledged is resent at this interval.
    pub reliable_resend_interval: Duration,
    /// If a reliable message stays unacknowledged for this long, the peer is considered dead
    ///  and the connection is closed. This is fatal for the connection.
    pub reliable_timeout: Duration,

    /// This is the maximum number of reliable messages that are sent but not yet acknowledged.
    ///  It is also the receive window, so both peers must use the same value.
    pub reliable_window_size: u16,

    /// Reliable messages and link requests longer than this are split into parts of this size.
    ///  The default keeps a part's datagram below typical path MTU.
    pub long_message_part_size: usize,

    /// Period of a connection's update task, which drives resends, timeouts and the flushing
    ///  of dirty state.
    pub update_interval: Duration,

    /// Upper bound for reliable messages, after which sending is rejected as a usage error
    pub max_message_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            connect_resend_interval: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(5),
            reliable_resend_interval: Duration::from_millis(500),
            reliable_timeout: Duration::from_secs(3),
            reliable_window_size: 10,
            long_message_part_size: 1357,
            update_interval: Duration::from_millis(5),
            max_message_size: 16*1024*1024,
        }
    }
}

impl ConnectionConfig {
    pub fn with_connect_resend_interval(mut self, interval: Duration) -> Self {
        self.connect_resend_interval = interval.max(MIN_INTERVAL);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout.max(MIN_INTERVAL);
        self
    }

    pub fn with_reliable_resend_interval(mut self, interval: Duration) -> Self {
        self.reliable_resend_interval = interval.max(MIN_INTERVAL);
        self
    }

    pub fn with_reliable_timeout(mut self, timeout: Duration) -> Self {
        self.reliable_timeout = timeout.max(MIN_INTERVAL);
        self
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.reliable_window_size == 0 || self.reliable_window_size > 4096 {
            bail!("reliable window size must be between 1 and 4096, is {}", self.reliable_window_size);
        }
        if self.long_message_part_size < 64 || self.long_message_part_size > 60_000 {
            bail!("long message part size must be between 64 and 60000, is {}", self.long_message_part_size);
        }
        if self.update_interval.is_zero() {
            bail!("update interval must not be zero");
        }
        if self.connect_resend_interval.is_zero() || self.reliable_resend_interval.is_zero() {
            bail!("resend intervals must not be zero");
        }
        if self.reliable_timeout < self.reliable_resend_interval {
            bail!("reliable timeout must not be shorter than the reliable resend interval");
        }
        if self.max_message_size == 0 {
            bail!("max message size must not be zero");
        }
        Ok(())
    }
}
