use std::collections::BTreeMap;
use bytes::Bytes;
use tracing::trace;
use crate::reliable_send::ReliableKind;
use crate::sequence_number::SequenceNumber;

#[derive(Debug, Eq, PartialEq)]
pub enum ReceiveOutcome {
    /// the message was the expected one: it and all buffered messages following it without a
    ///  gap are ready for processing, in order
    Deliver(Vec<(ReliableKind, Bytes)>),
    /// inside the receive window but ahead of a gap
    Buffered,
    /// processed before, the peer probably missed the ack
    Duplicate,
    /// outside the window, dropped without ack
    Dropped,
}

impl ReceiveOutcome {
    pub fn requires_ack(&self) -> bool {
        !matches!(self, ReceiveOutcome::Dropped)
    }
}

/// The receiving half of reliable messaging: accepts numbered messages in
///  `[expected, expected + window_size)`, buffering them until they can be processed in order.
pub struct ReliableReceiver {
    window_size: u16,
    expected: SequenceNumber,
    buffered: BTreeMap<SequenceNumber, (ReliableKind, Bytes)>,
}

impl ReliableReceiver {
    pub fn new(window_size: u16) -> ReliableReceiver {
        ReliableReceiver {
            window_size,
            expected: SequenceNumber::ZERO,
            buffered: BTreeMap::new(),
        }
    }

    pub fn expected(&self) -> SequenceNumber {
        self.expected
    }

    pub fn num_buffered(&self) -> usize {
        self.buffered.len()
    }

    pub fn accept(&mut self, number: SequenceNumber, kind: ReliableKind, payload: Bytes) -> ReceiveOutcome {
        if number == self.expected {
            let mut ready = vec![(kind, payload)];
            self.expected = self.expected.next();
            while let Some(buffered) = self.buffered.remove(&self.expected) {
                ready.push(buffered);
                self.expected = self.expected.next();
            }
            trace!("reliable #{}: {} message(s) ready, now expecting #{}", number, ready.len(), self.expected);
            return ReceiveOutcome::Deliver(ready);
        }

        if number.is_in_window(self.expected, self.window_size) {
            trace!("reliable #{} ahead of #{} - buffering", number, self.expected);
            self.buffered.entry(number).or_insert((kind, payload));
            return ReceiveOutcome::Buffered;
        }

        if number.is_recently_before(self.expected, self.window_size) {
            trace!("reliable #{} was processed before", number);
            return ReceiveOutcome::Duplicate;
        }

        trace!("reliable #{} outside the receive window at #{} - dropping", number, self.expected);
        ReceiveOutcome::Dropped
    }

    pub fn clear(&mut self) {
        self.expected = SequenceNumber::ZERO;
        self.buffered.clear();
    }
}
