//! Command codes, ack codes and flag bytes of the wire protocol. Every datagram starts with a
//!  single [`CommandCode`] byte; reliable commands continue with a little-endian u16 sequence
//!  number.

use bitflags::bitflags;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// port used when an address string does not specify one
pub const DEFAULT_PORT: u16 = 3413;

/// value of the version field in a `ConnectionRequest`
pub const PROTOCOL_VERSION: u16 = 1;

/// protocols a client offers when connecting, in order of preference
pub const SUPPORTED_PROTOCOLS: [Protocol; 1] = [Protocol::DENetworkProtocol];

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum CommandCode {
    ConnectionRequest = 0,
    ConnectionAck = 1,
    ConnectionClose = 2,
    Message = 3,
    ReliableMessage = 4,
    ReliableLinkState = 5,
    ReliableAck = 6,
    LinkUp = 7,
    LinkDown = 8,
    LinkUpdate = 9,
    ReliableMessageLong = 10,
    ReliableLinkStateLong = 11,
}

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum ConnectionAckCode {
    Accepted = 0,
    Rejected = 1,
    NoCommonProtocol = 2,
}

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum ReliableAckCode {
    Success = 0,
    Failed = 1,
}

#[repr(u16)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum Protocol {
    DENetworkProtocol = 0,
}

bitflags! {
    /// flags byte of a `ReliableMessageLong` part
    #[derive(Debug, PartialEq, Eq, Copy, Clone)]
    pub struct LongMessageFlags: u8 {
        const FIRST = 0b0000_0001;
        const LAST  = 0b0000_0010;
    }
}

bitflags! {
    /// flags byte of a `ReliableLinkState` request
    #[derive(Debug, PartialEq, Eq, Copy, Clone)]
    pub struct LinkStateFlags: u8 {
        const READ_ONLY = 0b0000_0001;
    }
}

bitflags! {
    /// flags byte of a `ReliableLinkStateLong` part
    #[derive(Debug, PartialEq, Eq, Copy, Clone)]
    pub struct LongLinkStateFlags: u8 {
        const FIRST     = 0b0000_0001;
        const LAST      = 0b0000_0010;
        const READ_ONLY = 0b0000_0100;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::request(0, Some(CommandCode::ConnectionRequest))]
    #[case::close(2, Some(CommandCode::ConnectionClose))]
    #[case::link_update(9, Some(CommandCode::LinkUpdate))]
    #[case::long_link_state(11, Some(CommandCode::ReliableLinkStateLong))]
    #[case::unknown(12, None)]
    #[case::max(255, None)]
    fn test_command_code_from_byte(#[case] raw: u8, #[case] expected: Option<CommandCode>) {
        assert_eq!(CommandCode::try_from(raw).ok(), expected);
    }

    #[test]
    fn test_long_link_state_flags() {
        let flags = LongLinkStateFlags::from_bits_truncate(0b1111_0101);
        assert!(flags.contains(LongLinkStateFlags::FIRST));
        assert!(!flags.contains(LongLinkStateFlags::LAST));
        assert!(flags.contains(LongLinkStateFlags::READ_ONLY));
    }
}
