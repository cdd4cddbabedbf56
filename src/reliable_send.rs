use std::collections::VecDeque;
use std::time::Duration;
use anyhow::bail;
use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, trace};
use crate::protocol::{CommandCode, ReliableAckCode};
use crate::sequence_number::SequenceNumber;

/// Messages that are queued and not acknowledged never exceed half the sequence space, so a
///  number always identifies a single queued message.
pub const MAX_QUEUED_RELIABLES: usize = 1 << 15;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ReliableKind {
    Message,
    LinkState,
    MessageLong,
    LinkStateLong,
}

impl ReliableKind {
    pub fn command_code(&self) -> CommandCode {
        match self {
            ReliableKind::Message => CommandCode::ReliableMessage,
            ReliableKind::LinkState => CommandCode::ReliableLinkState,
            ReliableKind::MessageLong => CommandCode::ReliableMessageLong,
            ReliableKind::LinkStateLong => CommandCode::ReliableLinkStateLong,
        }
    }

    pub fn from_command_code(code: CommandCode) -> Option<ReliableKind> {
        match code {
            CommandCode::ReliableMessage => Some(ReliableKind::Message),
            CommandCode::ReliableLinkState => Some(ReliableKind::LinkState),
            CommandCode::ReliableMessageLong => Some(ReliableKind::MessageLong),
            CommandCode::ReliableLinkStateLong => Some(ReliableKind::LinkStateLong),
            _ => None,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RealMessageState {
    /// waiting for space in the send window
    Pending,
    /// sent and not yet acknowledged
    Sent,
    /// acknowledged, but a message with a lower number is not
    Done,
}

#[derive(Debug)]
pub struct RealMessage {
    pub number: SequenceNumber,
    pub kind: ReliableKind,
    pub state: RealMessageState,
    /// the complete datagram, starting with command code and sequence number
    pub datagram: Bytes,
    pub since_send: Duration,
    pub since_first_send: Duration,
}

#[derive(Debug, Eq, PartialEq)]
pub enum TickOutcome {
    Resend(Vec<Bytes>),
    /// a message was not acknowledged within the hard timeout: the peer is gone
    TimedOut(SequenceNumber),
}

/// The sending half of reliable messaging: a queue of numbered messages in a sliding window.
///
/// Each message gets the number following all queued messages. Only the first `window_size`
///  queued messages are eligible for sending, so there are never more than `window_size`
///  messages in flight, and all of them are in the peer's receive window. Acknowledged messages
///  are removed from the head of the queue strictly in order, which slides the window.
///
/// This is pure bookkeeping: it returns the datagrams to be sent, and time is passed in
///  by the owner.
pub struct ReliableSender {
    window_size: u16,
    resend_interval: Duration,
    timeout: Duration,
    send_base: SequenceNumber,
    queue: VecDeque<RealMessage>,
}

impl ReliableSender {
    pub fn new(window_size: u16, resend_interval: Duration, timeout: Duration) -> ReliableSender {
        ReliableSender {
            window_size,
            resend_interval,
            timeout,
            send_base: SequenceNumber::ZERO,
            queue: VecDeque::new(),
        }
    }

    pub fn send_base(&self) -> SequenceNumber {
        self.send_base
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn num_in_flight(&self) -> usize {
        self.queue.iter()
            .filter(|m| m.state == RealMessageState::Sent)
            .count()
    }

    /// Fails if `num_messages` more messages would not fit into the queue
    pub fn ensure_capacity(&self, num_messages: usize) -> anyhow::Result<()> {
        if self.queue.len() + num_messages > MAX_QUEUED_RELIABLES {
            bail!("reliable send queue is full: {} queued, {} more requested", self.queue.len(), num_messages);
        }
        Ok(())
    }

    /// Queues a message without sending it, returning its number. `payload` is what follows
    ///  the sequence number on the wire.
    pub fn enqueue(&mut self, kind: ReliableKind, payload: &[u8]) -> anyhow::Result<SequenceNumber> {
        self.ensure_capacity(1)?;

        let number = self.send_base + self.queue.len() as u16;

        let mut datagram = BytesMut::with_capacity(3 + payload.len());
        datagram.put_u8(kind.command_code().into());
        number.ser(&mut datagram);
        datagram.put_slice(payload);

        trace!("queueing reliable message #{} ({:?}, {} bytes)", number, kind, payload.len());
        self.queue.push_back(RealMessage {
            number,
            kind,
            state: RealMessageState::Pending,
            datagram: datagram.freeze(),
            since_send: Duration::ZERO,
            since_first_send: Duration::ZERO,
        });
        Ok(number)
    }

    /// Moves all pending messages inside the window to `Sent`, returning their datagrams
    pub fn flush_pending(&mut self) -> Vec<Bytes> {
        self.queue.iter_mut()
            .take(self.window_size as usize)
            .filter(|m| m.state == RealMessageState::Pending)
            .map(|m| {
                m.state = RealMessageState::Sent;
                m.since_send = Duration::ZERO;
                m.since_first_send = Duration::ZERO;
                m.datagram.clone()
            })
            .collect()
    }

    /// Handles an acknowledgement, returning datagrams to be sent as a consequence. Acks for
    ///  numbers that are not queued (e.g. duplicates) are ignored.
    pub fn on_ack(&mut self, number: SequenceNumber, code: ReliableAckCode) -> Vec<Bytes> {
        let index = number.distance_from(self.send_base) as usize;
        let Some(message) = self.queue.get_mut(index) else {
            trace!("ack for #{} which is not queued - ignoring", number);
            return Vec::new();
        };

        match code {
            ReliableAckCode::Success => {
                if message.state == RealMessageState::Done {
                    return Vec::new();
                }
                message.state = RealMessageState::Done;

                while self.queue.front().map(|m| m.state) == Some(RealMessageState::Done) {
                    self.queue.pop_front();
                    self.send_base = self.send_base.next();
                }
                self.flush_pending()
            }
            ReliableAckCode::Failed => {
                if message.state != RealMessageState::Sent {
                    return Vec::new();
                }
                debug!("peer failed to process #{} ({:?}) - resending", number, message.kind);
                message.since_send = Duration::ZERO;
                vec![message.datagram.clone()]
            }
        }
    }

    /// Advances the timers of all messages in flight
    pub fn on_tick(&mut self, elapsed: Duration) -> TickOutcome {
        let mut resend = Vec::new();

        for message in self.queue.iter_mut() {
            if message.state != RealMessageState::Sent {
                continue;
            }

            message.since_first_send += elapsed;
            if message.since_first_send > self.timeout {
                return TickOutcome::TimedOut(message.number);
            }

            message.since_send += elapsed;
            if message.since_send >= self.resend_interval {
                trace!("resending #{} ({:?})", message.number, message.kind);
                message.since_send = Duration::ZERO;
                resend.push(message.datagram.clone());
            }
        }
        TickOutcome::Resend(resend)
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.send_base = SequenceNumber::ZERO;
    }
}
