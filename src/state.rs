//! A [`State`] is an ordered list of [`Value`]s that is replicated to peers through links. The
//!  order of values is part of the wire contract: both sides must agree on it, which is verified
//!  by comparing type tags when a link is established.
//!
//! A state can be linked to many connections at the same time, each link having its own dirty
//!  bits. Changing a value marks it dirty in every link and enqueues the link in its
//!  connection's [`DirtyLinkQueue`], which the connection drains on its next update cycle.

use crate::state_link::{DirtyLinkQueue, LinkKey};
use crate::value::{Value, ValueData};
use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tracing::trace;

/// maximum number of values per link in a single `LinkUpdate`
pub const MAX_VALUES_PER_LINK_UPDATE: usize = 255;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum StateEvent {
    /// a value was changed by a peer
    ValueChanged { index: usize },
}

struct LinkSlot {
    key: LinkKey,
    dirty: Vec<bool>,
    /// the link has dirty values, and it is registered in its connection's queue
    changed: bool,
    queue: Arc<DirtyLinkQueue>,
}

impl LinkSlot {
    fn mark_dirty(&mut self, index: usize) {
        if let Some(bit) = self.dirty.get_mut(index) {
            *bit = true;
        }
        if !self.changed {
            self.changed = true;
            self.queue.push(self.key.link_id);
        }
    }
}

struct StateInner {
    values: Vec<Value>,
    links: Vec<LinkSlot>,
}

impl StateInner {
    fn mark_dirty_except(&mut self, index: usize, except: Option<LinkKey>) {
        for link in self.links.iter_mut() {
            if Some(link.key) != except {
                link.mark_dirty(index);
            }
        }
    }
}

/// outcome of writing one link's dirty values into a `LinkUpdate`
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) struct LinkFlush {
    pub values_written: usize,
    /// dirty values remain for a later cycle
    pub still_changed: bool,
}

pub struct State {
    read_only: bool,
    inner: Mutex<StateInner>,
    events: broadcast::Sender<StateEvent>,
}

impl State {
    pub fn new(read_only: bool) -> State {
        let (events, _) = broadcast::channel(128);
        State {
            read_only,
            inner: Mutex::new(StateInner {
                values: Vec::new(),
                links: Vec::new(),
            }),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, StateInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// This is a convention between application code on both sides, the engine does not
    ///  prevent writes to a read-only state
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.events.subscribe()
    }

    /// Appends a value, returning its index. The layout of a state can not change while it is
    ///  linked.
    pub fn add_value(&self, data: ValueData) -> anyhow::Result<usize> {
        let mut inner = self.lock();
        if !inner.links.is_empty() {
            bail!("cannot add a value to a linked state");
        }
        inner.values.push(Value::new(data)?);
        Ok(inner.values.len() - 1)
    }

    /// Removes a value, shifting the indices of all following values down by one
    pub fn remove_value(&self, index: usize) -> anyhow::Result<Value> {
        let mut inner = self.lock();
        if !inner.links.is_empty() {
            bail!("cannot remove a value from a linked state");
        }
        if index >= inner.values.len() {
            bail!("value index {} out of range", index);
        }
        Ok(inner.values.remove(index))
    }

    pub fn value_count(&self) -> usize {
        self.lock().values.len()
    }

    pub fn value(&self, index: usize) -> Option<ValueData> {
        self.lock().values.get(index)
            .map(|v| v.data().clone())
    }

    pub fn values(&self) -> Vec<ValueData> {
        self.lock().values.iter()
            .map(|v| v.data().clone())
            .collect()
    }

    pub fn precision(&self, index: usize) -> Option<f64> {
        self.lock().values.get(index)
            .map(|v| v.precision())
    }

    pub fn link_count(&self) -> usize {
        self.lock().links.len()
    }

    /// Sets a value. If it changed by more than its precision, it is marked dirty in every link.
    pub fn set_value(&self, index: usize, data: ValueData) -> anyhow::Result<()> {
        let mut inner = self.lock();
        let Some(value) = inner.values.get_mut(index) else {
            bail!("value index {} out of range", index);
        };
        if value.set(data)? {
            inner.mark_dirty_except(index, None);
        }
        Ok(())
    }

    pub fn set_precision(&self, index: usize, precision: f64) -> anyhow::Result<()> {
        let mut inner = self.lock();
        let Some(value) = inner.values.get_mut(index) else {
            bail!("value index {} out of range", index);
        };
        value.set_precision(precision);
        if value.needs_sync() {
            inner.mark_dirty_except(index, None);
        }
        Ok(())
    }

    /// Writes the full type-tagged snapshot that accompanies a link request
    pub(crate) fn ser_snapshot(&self, buf: &mut BytesMut) -> anyhow::Result<()> {
        let mut inner = self.lock();
        let Ok(count) = u16::try_from(inner.values.len()) else {
            bail!("a state with {} values cannot be linked", inner.values.len());
        };

        buf.put_u16_le(count);
        for value in inner.values.iter_mut() {
            buf.put_u8(value.type_tag());
            value.ser(buf)?;
            value.mark_synced();
        }
        Ok(())
    }

    /// Verifies a peer's snapshot against this state's layout and applies its values. On
    ///  success, the link is bound to this state with no dirty values, while all other links
    ///  get the new values as dirty.
    ///
    /// Nothing is applied if the snapshot does not match.
    pub(crate) fn apply_snapshot_and_attach(&self, key: LinkKey, queue: Arc<DirtyLinkQueue>, buf: &mut impl Buf) -> anyhow::Result<()> {
        let mut inner = self.lock();

        let count = buf.try_get_u16_le()? as usize;
        if count != inner.values.len() {
            bail!("snapshot has {} values, local state has {}", count, inner.values.len());
        }

        let mut received = Vec::with_capacity(count);
        for value in inner.values.iter() {
            let tag = buf.try_get_u8()?;
            if tag != value.type_tag() {
                bail!("snapshot value type {} does not match local type {}", tag, value.type_tag());
            }
            received.push(value.deser_data(buf)?);
        }

        for (index, data) in received.into_iter().enumerate() {
            inner.values[index].apply_received(data);
            inner.mark_dirty_except(index, None);
        }
        let value_count = inner.values.len();
        inner.links.push(LinkSlot {
            key,
            dirty: vec![false; value_count],
            changed: false,
            queue,
        });
        drop(inner);

        for index in 0..count {
            let _ = self.events.send(StateEvent::ValueChanged { index });
        }
        Ok(())
    }

    /// Binds a link with no dirty values
    pub(crate) fn attach_link(&self, key: LinkKey, queue: Arc<DirtyLinkQueue>) {
        let mut inner = self.lock();
        let value_count = inner.values.len();
        inner.links.retain(|l| l.key != key);
        inner.links.push(LinkSlot {
            key,
            dirty: vec![false; value_count],
            changed: false,
            queue,
        });
    }

    pub(crate) fn detach_link(&self, key: LinkKey) {
        self.lock().links.retain(|l| l.key != key);
    }

    /// Writes `[link id][count][(index, value)...]` for the link's dirty values, at most
    ///  [`MAX_VALUES_PER_LINK_UPDATE`] of them, without letting `buf` grow beyond `max_len`.
    ///  Values that do not fit stay dirty. Writes nothing if no value is written.
    pub(crate) fn ser_link_update(&self, key: LinkKey, buf: &mut BytesMut, max_len: usize) -> anyhow::Result<LinkFlush> {
        let mut inner = self.lock();
        let StateInner { values, links } = &mut *inner;

        let Some(link) = links.iter_mut().find(|l| l.key == key) else {
            return Ok(LinkFlush { values_written: 0, still_changed: false });
        };

        let start = buf.len();
        buf.put_u16_le(key.link_id);
        buf.put_u8(0);

        let mut values_written = 0;
        for index in 0..link.dirty.len() {
            if !link.dirty[index] {
                continue;
            }
            if values_written == MAX_VALUES_PER_LINK_UPDATE {
                break;
            }

            let before_value = buf.len();
            buf.put_u16_le(index as u16);
            if let Err(e) = values[index].ser(buf) {
                buf.truncate(start);
                return Err(e);
            }
            if buf.len() > max_len {
                buf.truncate(before_value);
                break;
            }

            values[index].mark_synced();
            link.dirty[index] = false;
            values_written += 1;
        }

        if values_written == 0 {
            buf.truncate(start);
        }
        else {
            buf[start + 2] = values_written as u8;
        }

        let still_changed = link.dirty.iter().any(|&d| d);
        link.changed = still_changed;
        trace!("link {:?}: wrote {} dirty values", key, values_written);

        Ok(LinkFlush {
            values_written,
            still_changed,
        })
    }

    /// Applies `[count][(index, value)...]` received on a link. Other links of this state get
    ///  the values as dirty so they propagate further.
    pub(crate) fn apply_link_update(&self, key: LinkKey, buf: &mut impl Buf) -> anyhow::Result<()> {
        let mut inner = self.lock();

        let count = buf.try_get_u8()? as usize;
        let mut received = Vec::with_capacity(count);
        for _ in 0..count {
            let index = buf.try_get_u16_le()? as usize;
            let Some(value) = inner.values.get(index) else {
                bail!("value index {} out of range", index);
            };
            received.push((index, value.deser_data(buf)?));
        }

        for (index, data) in &received {
            inner.values[*index].apply_received(data.clone());
            inner.mark_dirty_except(*index, Some(key));
        }
        drop(inner);

        for (index, _) in received {
            let _ = self.events.send(StateEvent::ValueChanged { index });
        }
        Ok(())
    }
}
