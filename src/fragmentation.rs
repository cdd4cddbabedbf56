//! Splitting of reliable payloads that exceed the part size, and their reassembly. Parts are
//!  regular reliable messages, so they arrive complete and in order; reassembly only has to
//!  concatenate them between a `FIRST` and a `LAST` part.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::debug;
use crate::buf_ext::BufExt;
use crate::protocol::{LinkStateFlags, LongLinkStateFlags, LongMessageFlags};

#[derive(Debug, Eq, PartialEq)]
pub enum AssemblyProgress<T> {
    /// a part without a preceding `FIRST` part, or one that made the assembly exceed its limit
    Dropped,
    /// number of bytes assembled so far
    Progress(usize),
    Complete(T),
}

/// Part payloads of a `ReliableMessageLong`: `[flags][fragment]`
pub fn split_message(message: &[u8], part_size: usize) -> Vec<Bytes> {
    let num_parts = message.len().div_ceil(part_size).max(1);

    (0..num_parts)
        .map(|i| {
            let fragment = &message[i*part_size .. ((i+1)*part_size).min(message.len())];

            let mut flags = LongMessageFlags::empty();
            if i == 0 {
                flags |= LongMessageFlags::FIRST;
            }
            if i == num_parts - 1 {
                flags |= LongMessageFlags::LAST;
            }

            let mut part = BytesMut::with_capacity(1 + fragment.len());
            part.put_u8(flags.bits());
            part.put_slice(fragment);
            part.freeze()
        })
        .collect()
}

pub struct LongMessageAssembler {
    buffer: Option<BytesMut>,
    max_len: usize,
}

impl LongMessageAssembler {
    /// An assembler that drops a message once it grows beyond `max_len` bytes
    pub fn new(max_len: usize) -> LongMessageAssembler {
        LongMessageAssembler { buffer: None, max_len }
    }

    pub fn on_part(&mut self, part: &mut impl Buf) -> anyhow::Result<AssemblyProgress<Bytes>> {
        let flags = LongMessageFlags::from_bits_truncate(part.try_get_u8()?);

        if flags.contains(LongMessageFlags::FIRST) {
            if self.buffer.is_some() {
                debug!("long message part starts a new message - discarding incomplete message");
            }
            self.buffer = Some(BytesMut::new());
        }

        let Some(buffer) = self.buffer.as_mut() else {
            debug!("long message part without a first part - dropping");
            return Ok(AssemblyProgress::Dropped);
        };
        if buffer.len() + part.remaining() > self.max_len {
            debug!("long message exceeds the maximum of {} bytes - dropping", self.max_len);
            self.buffer = None;
            return Ok(AssemblyProgress::Dropped);
        }
        buffer.put(part);

        if flags.contains(LongMessageFlags::LAST) {
            let complete = self.buffer.take().unwrap_or_default();
            Ok(AssemblyProgress::Complete(complete.freeze()))
        }
        else {
            Ok(AssemblyProgress::Progress(buffer.len()))
        }
    }

    pub fn clear(&mut self) {
        self.buffer = None;
    }
}

/// A request to link a state: the application's negotiation message and the snapshot of the
///  requesting side's values
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct LinkRequest {
    pub link_id: u16,
    pub read_only: bool,
    pub message: Bytes,
    pub values: Bytes,
}

impl LinkRequest {
    /// serialized length in the single-part form
    pub fn serialized_len(&self) -> usize {
        2 + 1 + 2 + self.message.len() + self.values.len()
    }

    /// `[link id][flags][message length][message][values]`
    pub fn ser(&self, buf: &mut BytesMut) {
        let flags = if self.read_only { LinkStateFlags::READ_ONLY } else { LinkStateFlags::empty() };

        buf.put_u16_le(self.link_id);
        buf.put_u8(flags.bits());
        buf.put_u16_le(self.message.len() as u16);
        buf.put_slice(&self.message);
        buf.put_slice(&self.values);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<LinkRequest> {
        let link_id = buf.try_get_u16_le()?;
        let flags = LinkStateFlags::from_bits_truncate(buf.try_get_u8()?);
        let message = buf.try_get_data16()?;
        let values = buf.copy_to_bytes(buf.remaining());

        Ok(LinkRequest {
            link_id,
            read_only: flags.contains(LinkStateFlags::READ_ONLY),
            message,
            values,
        })
    }

    /// Part payloads of a `ReliableLinkStateLong`:
    ///  `[link id][flags][message fragment length][message fragment][values fragment]`.
    ///
    /// Message and values are treated as one stream of `part_size` chunks, so the message
    ///  fragments come first and the values follow.
    pub fn split(&self, part_size: usize) -> Vec<Bytes> {
        let total = self.message.len() + self.values.len();
        let num_parts = total.div_ceil(part_size).max(1);

        (0..num_parts)
            .map(|i| {
                let start = i * part_size;
                let end = ((i+1) * part_size).min(total);

                let message_fragment = &self.message[start.min(self.message.len()) .. end.min(self.message.len())];
                let values_fragment = &self.values[start.saturating_sub(self.message.len()) .. end.saturating_sub(self.message.len())];

                let mut flags = LongLinkStateFlags::empty();
                if i == 0 {
                    flags |= LongLinkStateFlags::FIRST;
                }
                if i == num_parts - 1 {
                    flags |= LongLinkStateFlags::LAST;
                }
                if self.read_only {
                    flags |= LongLinkStateFlags::READ_ONLY;
                }

                let mut part = BytesMut::with_capacity(5 + end - start);
                part.put_u16_le(self.link_id);
                part.put_u8(flags.bits());
                part.put_u16_le(message_fragment.len() as u16);
                part.put_slice(message_fragment);
                part.put_slice(values_fragment);
                part.freeze()
            })
            .collect()
    }
}

struct LinkRequestInProgress {
    link_id: u16,
    message: BytesMut,
    values: BytesMut,
}

pub struct LinkRequestAssembler {
    in_progress: Option<LinkRequestInProgress>,
    max_len: usize,
}

impl LinkRequestAssembler {
    /// An assembler that drops a request once message and values together exceed `max_len` bytes
    pub fn new(max_len: usize) -> LinkRequestAssembler {
        LinkRequestAssembler { in_progress: None, max_len }
    }

    pub fn on_part(&mut self, part: &mut impl Buf) -> anyhow::Result<AssemblyProgress<LinkRequest>> {
        let link_id = part.try_get_u16_le()?;
        let flags = LongLinkStateFlags::from_bits_truncate(part.try_get_u8()?);
        let message_fragment = part.try_get_data16()?;

        if flags.contains(LongLinkStateFlags::FIRST) {
            self.in_progress = Some(LinkRequestInProgress {
                link_id,
                message: BytesMut::new(),
                values: BytesMut::new(),
            });
        }

        let Some(in_progress) = self.in_progress.as_mut() else {
            debug!("link state part without a first part - dropping");
            return Ok(AssemblyProgress::Dropped);
        };
        if in_progress.link_id != link_id {
            debug!("link state part for link {} while assembling link {} - dropping both", link_id, in_progress.link_id);
            self.in_progress = None;
            return Ok(AssemblyProgress::Dropped);
        }

        let assembled = in_progress.message.len() + in_progress.values.len();
        if assembled + message_fragment.len() + part.remaining() > self.max_len {
            debug!("link state request for link {} exceeds the maximum of {} bytes - dropping", link_id, self.max_len);
            self.in_progress = None;
            return Ok(AssemblyProgress::Dropped);
        }

        in_progress.message.put_slice(&message_fragment);
        in_progress.values.put(part);

        if !flags.contains(LongLinkStateFlags::LAST) {
            return Ok(AssemblyProgress::Progress(in_progress.message.len() + in_progress.values.len()));
        }

        // the read-only flag of the last part is authoritative
        Ok(match self.in_progress.take() {
            Some(done) => AssemblyProgress::Complete(LinkRequest {
                link_id,
                read_only: flags.contains(LongLinkStateFlags::READ_ONLY),
                message: done.message.freeze(),
                values: done.values.freeze(),
            }),
            None => AssemblyProgress::Dropped,
        })
    }

    pub fn clear(&mut self) {
        self.in_progress = None;
    }
}
