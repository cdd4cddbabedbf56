//! A [`Connection`] is one side of a peer relationship. It runs the handshake, reliable
//!  messaging on top of the datagram transport, and the link protocol that replicates states.
//!
//! All protocol state of a connection is guarded by a single lock. Two contexts take it: the
//!  transport's receive loop delivering datagrams, and a periodic update task that drives
//!  resends, timeouts and the flushing of dirty state. Neither sends datagrams nor calls the
//!  application while holding the lock: processing collects its effects in an outbox, which is
//!  carried out after the lock is released.

use crate::address::resolve_address;
use crate::config::ConnectionConfig;
use crate::connection_listener::{ConnectionFailedReason, ConnectionListener};
use crate::endpoint::{DatagramListener, Endpoint, Transport, UdpTransport};
use crate::fragmentation::{split_message, AssemblyProgress, LinkRequest, LinkRequestAssembler, LongMessageAssembler};
use crate::protocol::{CommandCode, ConnectionAckCode, Protocol, ReliableAckCode, PROTOCOL_VERSION, SUPPORTED_PROTOCOLS};
use crate::reliable_receive::{ReceiveOutcome, ReliableReceiver};
use crate::reliable_send::{ReliableKind, ReliableSender, TickOutcome};
use crate::sequence_number::SequenceNumber;
use crate::server::Server;
use crate::state::State;
use crate::state_link::{ConnectionId, DirtyLinkQueue, LinkKey, LinkState, StateLink};
use anyhow::bail;
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

/// maximum number of links in a single `LinkUpdate`
const MAX_LINKS_PER_LINK_UPDATE: usize = 255;

/// maximum payload of a UDP datagram
const MAX_DATAGRAM_LEN: usize = 65_507;

/// maximum payload of an unreliable message, which must fit into a single UDP datagram
const MAX_UNRELIABLE_MESSAGE_LEN: usize = MAX_DATAGRAM_LEN - 1;

/// hard limit for a `LinkUpdate`, used when a single value exceeds the part size
const MAX_LINK_UPDATE_LEN: usize = MAX_DATAGRAM_LEN;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    /// a connection request was sent, and the peer did not answer yet
    Connecting,
    Connected,
}

#[derive(Debug, Clone)]
enum ConnectionEvent {
    Established,
    Failed(ConnectionFailedReason),
    Closed,
    MessageReceived(Bytes),
    MessageProgress(usize),
}

/// Effects of protocol processing, carried out after the connection's lock is released
#[derive(Default)]
struct Outbox {
    target: Option<(Arc<dyn Endpoint>, SocketAddr)>,
    datagrams: Vec<Bytes>,
    events: Vec<ConnectionEvent>,
    /// an endpoint owned by the connection that is released, closed after all datagrams are sent
    close_endpoint: Option<Arc<dyn Endpoint>>,
    torn_down: bool,
}

impl Outbox {
    fn push(&mut self, datagram: impl Into<Bytes>) {
        self.datagrams.push(datagram.into());
    }
}

/// A `LinkUpdate` being assembled: `[9][link count]` followed by per-link sections
struct LinkUpdateDatagram {
    buf: BytesMut,
    num_links: usize,
}

impl LinkUpdateDatagram {
    fn new() -> LinkUpdateDatagram {
        let mut buf = BytesMut::new();
        buf.put_u8(CommandCode::LinkUpdate.into());
        buf.put_u8(0);
        LinkUpdateDatagram { buf, num_links: 0 }
    }

    fn is_empty(&self) -> bool {
        self.num_links == 0
    }

    /// Pushes the datagram unless it is empty, leaving an empty one in its place
    fn finish_into(&mut self, out: &mut Outbox) {
        if self.is_empty() {
            return;
        }
        let mut finished = std::mem::replace(self, LinkUpdateDatagram::new());
        finished.buf[1] = finished.num_links as u8;
        trace!("sending update for {} links, {} bytes", finished.num_links, finished.buf.len());
        out.push(finished.buf.freeze());
    }
}

fn ack_datagram(number: SequenceNumber, code: ReliableAckCode) -> Bytes {
    let mut buf = BytesMut::with_capacity(4);
    buf.put_u8(CommandCode::ReliableAck.into());
    number.ser(&mut buf);
    buf.put_u8(code.into());
    buf.freeze()
}

fn link_datagram(code: CommandCode, link_id: u16) -> Bytes {
    let mut buf = BytesMut::with_capacity(3);
    buf.put_u8(code.into());
    buf.put_u16_le(link_id);
    buf.freeze()
}

pub(crate) fn connection_accepted_datagram(protocol: Protocol) -> Bytes {
    let mut buf = BytesMut::with_capacity(4);
    buf.put_u8(CommandCode::ConnectionAck.into());
    buf.put_u8(ConnectionAckCode::Accepted.into());
    buf.put_u16_le(protocol.into());
    buf.freeze()
}

struct ConnectionInner {
    id: ConnectionId,
    config: Arc<ConnectionConfig>,
    server_side: bool,

    connection_state: ConnectionState,
    endpoint: Option<Arc<dyn Endpoint>>,
    owns_endpoint: bool,
    remote_addr: Option<SocketAddr>,
    protocol: Option<Protocol>,

    connect_elapsed: Duration,
    connect_resend_elapsed: Duration,

    /// Incremented whenever the update task is started or the connection is torn down. An
    ///  update task exits when it sees a generation other than its own.
    update_generation: u64,

    sender: ReliableSender,
    receiver: ReliableReceiver,
    message_assembler: LongMessageAssembler,
    link_request_assembler: LinkRequestAssembler,

    links: BTreeMap<u16, StateLink>,
    dirty_links: Arc<DirtyLinkQueue>,
}

impl ConnectionInner {
    fn new(id: ConnectionId, config: Arc<ConnectionConfig>, server_side: bool) -> ConnectionInner {
        ConnectionInner {
            id,
            server_side,
            connection_state: ConnectionState::Disconnected,
            endpoint: None,
            owns_endpoint: false,
            remote_addr: None,
            protocol: None,
            connect_elapsed: Duration::ZERO,
            connect_resend_elapsed: Duration::ZERO,
            update_generation: 0,
            sender: ReliableSender::new(config.reliable_window_size, config.reliable_resend_interval, config.reliable_timeout),
            receiver: ReliableReceiver::new(config.reliable_window_size),
            message_assembler: LongMessageAssembler::new(config.max_message_size),
            link_request_assembler: LinkRequestAssembler::new(config.max_message_size),
            links: BTreeMap::new(),
            dirty_links: Default::default(),
            config,
        }
    }

    fn outbox(&self) -> Outbox {
        Outbox {
            target: self.endpoint.clone().zip(self.remote_addr),
            ..Default::default()
        }
    }

    fn link_key(&self, link_id: u16) -> LinkKey {
        LinkKey { connection: self.id, link_id }
    }

    fn is_connected(&self) -> bool {
        self.connection_state == ConnectionState::Connected
    }

    fn push_connection_request(&self, out: &mut Outbox) {
        let mut buf = BytesMut::new();
        buf.put_u8(CommandCode::ConnectionRequest.into());
        buf.put_u16_le(PROTOCOL_VERSION);
        buf.put_u16_le(SUPPORTED_PROTOCOLS.len() as u16);
        for protocol in SUPPORTED_PROTOCOLS {
            buf.put_u16_le(protocol.into());
        }
        out.push(buf.freeze());
    }

    fn update_timeouts(&mut self, elapsed: Duration, out: &mut Outbox) {
        match self.connection_state {
            ConnectionState::Disconnected => {}
            ConnectionState::Connecting => {
                self.connect_elapsed += elapsed;
                if self.connect_elapsed > self.config.connect_timeout {
                    warn!("connection {}: no answer to connection request after {:?} - giving up", self.id, self.connect_elapsed);
                    self.fail(ConnectionFailedReason::Timeout, out);
                    return;
                }

                self.connect_resend_elapsed += elapsed;
                if self.connect_resend_elapsed >= self.config.connect_resend_interval {
                    trace!("connection {}: resending connection request", self.id);
                    self.connect_resend_elapsed = Duration::ZERO;
                    self.push_connection_request(out);
                }
            }
            ConnectionState::Connected => {
                match self.sender.on_tick(elapsed) {
                    TickOutcome::Resend(datagrams) => out.datagrams.extend(datagrams),
                    TickOutcome::TimedOut(number) => {
                        warn!("connection {}: reliable message #{} was not acknowledged in time - closing", self.id, number);
                        self.teardown(true, true, out);
                    }
                }
            }
        }
    }

    /// Sends the dirty values of all links that are up as `LinkUpdate` datagrams. A datagram
    ///  is closed once it reaches the part size, and a value that is too big for an empty one
    ///  is sent in a datagram of its own. Links that are still waiting for the peer stay queued.
    fn flush_dirty_links(&mut self, out: &mut Outbox) {
        if !self.is_connected() {
            return;
        }

        let part_size = self.config.long_message_part_size;
        let mut requeue = Vec::new();
        let mut update = LinkUpdateDatagram::new();

        for link_id in self.dirty_links.take() {
            let Some(link) = self.links.get(&link_id) else {
                continue;
            };
            if link.link_state != LinkState::Up {
                requeue.push(link_id);
                continue;
            }
            let key = self.link_key(link_id);

            loop {
                if update.num_links == MAX_LINKS_PER_LINK_UPDATE {
                    update.finish_into(out);
                }

                let mut flushed = link.state.ser_link_update(key, &mut update.buf, part_size);
                if matches!(&flushed, Ok(f) if f.values_written == 0 && f.still_changed) && update.is_empty() {
                    flushed = link.state.ser_link_update(key, &mut update.buf, MAX_LINK_UPDATE_LEN);
                }

                let flush = match flushed {
                    Ok(flush) => flush,
                    Err(e) => {
                        warn!("connection {}: error writing update for link {}: {}", self.id, link_id, e);
                        break;
                    }
                };
                if flush.values_written > 0 {
                    update.num_links += 1;
                }
                if !flush.still_changed {
                    break;
                }
                if update.is_empty() {
                    warn!("connection {}: dirty value on link {} does not fit into a datagram", self.id, link_id);
                    requeue.push(link_id);
                    break;
                }
                update.finish_into(out);
            }
        }

        for link_id in requeue {
            self.dirty_links.push(link_id);
        }
        update.finish_into(out);
    }

    fn release_endpoint(&mut self, out: &mut Outbox) {
        if let Some(endpoint) = self.endpoint.take() {
            if self.owns_endpoint {
                out.close_endpoint = Some(endpoint);
            }
        }
        self.owns_endpoint = false;
    }

    fn fail(&mut self, reason: ConnectionFailedReason, out: &mut Outbox) {
        info!("connection {}: failed: {:?}", self.id, reason);
        self.reset(out);
        out.events.push(ConnectionEvent::Failed(reason));
    }

    /// Closes the connection. When closing locally, pending updates and reliable messages get a
    ///  last chance to go out before the `ConnectionClose`.
    fn teardown(&mut self, send_close: bool, notify: bool, out: &mut Outbox) {
        if self.connection_state == ConnectionState::Disconnected && self.endpoint.is_none() {
            return;
        }

        if self.is_connected() && send_close {
            self.flush_dirty_links(out);
            out.datagrams.extend(self.sender.flush_pending());
            out.push(vec![u8::from(CommandCode::ConnectionClose)]);
        }

        info!("connection {}: closed", self.id);
        self.reset(out);
        if notify {
            out.events.push(ConnectionEvent::Closed);
        }
    }

    fn reset(&mut self, out: &mut Outbox) {
        for (&link_id, link) in &self.links {
            link.state.detach_link(self.link_key(link_id));
        }
        self.links.clear();
        self.dirty_links.clear();

        self.sender.clear();
        self.receiver.clear();
        self.message_assembler.clear();
        self.link_request_assembler.clear();

        self.release_endpoint(out);
        self.connection_state = ConnectionState::Disconnected;
        self.protocol = None;
        self.update_generation += 1;
        out.torn_down = true;
    }

    fn process_datagram(&mut self, mut datagram: Bytes, listener: &dyn ConnectionListener, out: &mut Outbox) -> anyhow::Result<()> {
        let code = CommandCode::try_from(datagram.try_get_u8()?)?;
        trace!("connection {}: received {:?}", self.id, code);

        if code == CommandCode::ConnectionAck {
            return self.process_connection_ack(datagram, out);
        }
        if !self.is_connected() {
            debug!("connection {}: {:?} while not connected - dropping", self.id, code);
            return Ok(());
        }

        match code {
            CommandCode::ConnectionRequest => {
                if self.server_side {
                    // the client missed our ack
                    if let Some(protocol) = self.protocol {
                        out.push(connection_accepted_datagram(protocol));
                    }
                }
            }
            CommandCode::ConnectionAck => {}
            CommandCode::ConnectionClose => {
                info!("connection {}: closed by peer", self.id);
                self.teardown(false, true, out);
            }
            CommandCode::Message => {
                out.events.push(ConnectionEvent::MessageReceived(datagram));
            }
            CommandCode::ReliableAck => {
                let number = SequenceNumber::deser(&mut datagram)?;
                let code = ReliableAckCode::try_from(datagram.try_get_u8()?)?;
                out.datagrams.extend(self.sender.on_ack(number, code));
            }
            CommandCode::LinkUp => {
                let link_id = datagram.try_get_u16_le()?;
                match self.links.get_mut(&link_id) {
                    Some(link) if link.link_state == LinkState::Listening => {
                        debug!("connection {}: link {} is up", self.id, link_id);
                        link.link_state = LinkState::Up;
                    }
                    _ => debug!("connection {}: LinkUp for link {} which is not listening - ignoring", self.id, link_id),
                }
            }
            CommandCode::LinkDown => {
                let link_id = datagram.try_get_u16_le()?;
                if let Some(link) = self.links.remove(&link_id) {
                    debug!("connection {}: link {} is down", self.id, link_id);
                    link.state.detach_link(self.link_key(link_id));
                }
            }
            CommandCode::LinkUpdate => {
                self.process_link_update(datagram)?;
            }
            CommandCode::ReliableMessage
            | CommandCode::ReliableLinkState
            | CommandCode::ReliableMessageLong
            | CommandCode::ReliableLinkStateLong => {
                if let Some(kind) = ReliableKind::from_command_code(code) {
                    self.process_reliable(kind, datagram, listener, out)?;
                }
            }
        }
        Ok(())
    }

    fn process_connection_ack(&mut self, mut datagram: Bytes, out: &mut Outbox) -> anyhow::Result<()> {
        if self.connection_state != ConnectionState::Connecting {
            trace!("connection {}: connection ack while not connecting - ignoring", self.id);
            return Ok(());
        }

        let code = datagram.try_get_u8().ok()
            .and_then(|raw| ConnectionAckCode::try_from(raw).ok());

        match code {
            Some(ConnectionAckCode::Accepted) => {
                let protocol = datagram.try_get_u16_le().ok()
                    .and_then(|raw| Protocol::try_from(raw).ok());
                let Some(protocol) = protocol else {
                    self.fail(ConnectionFailedReason::InvalidMessage, out);
                    return Ok(());
                };

                info!("connection {}: connected to {:?} with {:?}", self.id, self.remote_addr, protocol);
                self.connection_state = ConnectionState::Connected;
                self.protocol = Some(protocol);
                self.connect_elapsed = Duration::ZERO;
                self.connect_resend_elapsed = Duration::ZERO;
                out.events.push(ConnectionEvent::Established);
            }
            Some(ConnectionAckCode::Rejected) => self.fail(ConnectionFailedReason::Rejected, out),
            Some(ConnectionAckCode::NoCommonProtocol) => self.fail(ConnectionFailedReason::NoCommonProtocol, out),
            None => self.fail(ConnectionFailedReason::InvalidMessage, out),
        }
        Ok(())
    }

    fn process_reliable(&mut self, kind: ReliableKind, mut datagram: Bytes, listener: &dyn ConnectionListener, out: &mut Outbox) -> anyhow::Result<()> {
        let number = SequenceNumber::deser(&mut datagram)?;

        let outcome = self.receiver.accept(number, kind, datagram);
        if outcome.requires_ack() {
            out.push(ack_datagram(number, ReliableAckCode::Success));
        }

        if let ReceiveOutcome::Deliver(ready) = outcome {
            for (kind, payload) in ready {
                if let Err(e) = self.process_reliable_payload(kind, payload, listener, out) {
                    debug!("connection {}: malformed {:?} - dropping: {}", self.id, kind, e);
                }
            }
        }
        Ok(())
    }

    fn process_reliable_payload(&mut self, kind: ReliableKind, mut payload: Bytes, listener: &dyn ConnectionListener, out: &mut Outbox) -> anyhow::Result<()> {
        match kind {
            ReliableKind::Message => {
                out.events.push(ConnectionEvent::MessageReceived(payload));
            }
            ReliableKind::MessageLong => {
                match self.message_assembler.on_part(&mut payload)? {
                    AssemblyProgress::Complete(message) => out.events.push(ConnectionEvent::MessageReceived(message)),
                    AssemblyProgress::Progress(len) => out.events.push(ConnectionEvent::MessageProgress(len)),
                    AssemblyProgress::Dropped => {}
                }
            }
            ReliableKind::LinkState => {
                let request = LinkRequest::deser(&mut payload)?;
                self.process_link_request(request, listener, out);
            }
            ReliableKind::LinkStateLong => {
                if let AssemblyProgress::Complete(request) = self.link_request_assembler.on_part(&mut payload)? {
                    self.process_link_request(request, listener, out);
                }
            }
        }
        Ok(())
    }

    /// The peer asks to link a state: the application provides the local state, which must
    ///  match the peer's snapshot. The link is answered with `LinkUp` or `LinkDown`.
    fn process_link_request(&mut self, request: LinkRequest, listener: &dyn ConnectionListener, out: &mut Outbox) {
        let link_id = request.link_id;

        if self.links.contains_key(&link_id) {
            debug!("connection {}: link request for link {} which is in use - rejecting", self.id, link_id);
            out.push(link_datagram(CommandCode::LinkDown, link_id));
            return;
        }

        let Some(state) = listener.create_state(&request.message, request.read_only) else {
            debug!("connection {}: no state for link request {} - rejecting", self.id, link_id);
            out.push(link_datagram(CommandCode::LinkDown, link_id));
            return;
        };

        let key = self.link_key(link_id);
        let mut values = request.values.clone();
        if let Err(e) = state.apply_snapshot_and_attach(key, self.dirty_links.clone(), &mut values) {
            debug!("connection {}: state for link request {} does not match: {} - rejecting", self.id, link_id, e);
            out.push(link_datagram(CommandCode::LinkDown, link_id));
            return;
        }

        debug!("connection {}: link {} is up (requested by peer)", self.id, link_id);
        self.links.insert(link_id, StateLink {
            state,
            link_state: LinkState::Up,
            read_only: request.read_only,
        });
        out.push(link_datagram(CommandCode::LinkUp, link_id));
    }

    fn process_link_update(&mut self, mut datagram: Bytes) -> anyhow::Result<()> {
        let num_links = datagram.try_get_u8()?;
        for _ in 0..num_links {
            let link_id = datagram.try_get_u16_le()?;
            let Some(link) = self.links.get(&link_id).filter(|l| l.link_state == LinkState::Up) else {
                bail!("update for link {} which is not up", link_id);
            };
            link.state.apply_link_update(self.link_key(link_id), &mut datagram)?;
        }
        Ok(())
    }
}

/// Routes datagrams from a client connection's own endpoint to the connection
struct ClientDatagramListener {
    connection: Weak<Connection>,
}

#[async_trait]
impl DatagramListener for ClientDatagramListener {
    async fn on_datagram(&self, from: SocketAddr, datagram: Bytes) {
        if let Some(connection) = self.connection.upgrade() {
            connection.on_datagram(from, datagram).await;
        }
    }
}

pub struct Connection {
    id: ConnectionId,
    config: Arc<ConnectionConfig>,
    transport: Arc<dyn Transport>,
    listener: Arc<dyn ConnectionListener>,
    server: Option<Weak<Server>>,
    inner: Mutex<ConnectionInner>,
    update_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
    myself: Weak<Connection>,
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(handle) = self.update_handle.get_mut().unwrap_or_else(PoisonError::into_inner).take() {
            handle.abort();
        }
    }
}

impl Connection {
    /// A client connection over UDP with default configuration
    pub fn new(listener: Arc<dyn ConnectionListener>) -> Arc<Connection> {
        Self::create(Arc::new(ConnectionConfig::default()), Arc::new(UdpTransport), listener, None)
    }

    pub fn with_transport(config: ConnectionConfig, transport: Arc<dyn Transport>, listener: Arc<dyn ConnectionListener>) -> anyhow::Result<Arc<Connection>> {
        config.validate()?;
        Ok(Self::create(Arc::new(config), transport, listener, None))
    }

    fn create(config: Arc<ConnectionConfig>, transport: Arc<dyn Transport>, listener: Arc<dyn ConnectionListener>, server: Option<Weak<Server>>) -> Arc<Connection> {
        let id = ConnectionId::next();
        Arc::new_cyclic(|myself| Connection {
            id,
            inner: Mutex::new(ConnectionInner::new(id, config.clone(), server.is_some())),
            config,
            transport,
            listener,
            server,
            update_handle: Default::default(),
            myself: myself.clone(),
        })
    }

    /// A connection that a server accepted: it starts out connected, sending through the
    ///  server's endpoint
    pub(crate) async fn new_accepted(
        config: Arc<ConnectionConfig>,
        transport: Arc<dyn Transport>,
        listener: Arc<dyn ConnectionListener>,
        server: Weak<Server>,
        endpoint: Arc<dyn Endpoint>,
        remote_addr: SocketAddr,
        protocol: Protocol,
    ) -> Arc<Connection> {
        let connection = Self::create(config, transport, listener, Some(server));
        {
            let mut inner = connection.inner.lock().await;
            inner.endpoint = Some(endpoint);
            inner.owns_endpoint = false;
            inner.remote_addr = Some(remote_addr);
            inner.protocol = Some(protocol);
            inner.connection_state = ConnectionState::Connected;
            connection.start_update_task(&mut inner);
        }
        connection
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.inner.lock().await.connection_state
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.lock().await.is_connected()
    }

    pub async fn remote_address(&self) -> Option<SocketAddr> {
        self.inner.lock().await.remote_addr
    }

    pub async fn local_address(&self) -> Option<SocketAddr> {
        self.inner.lock().await.endpoint.as_ref()
            .map(|e| e.local_addr())
    }

    pub async fn protocol(&self) -> Option<Protocol> {
        self.inner.lock().await.protocol
    }

    /// The state of the link between `state` and this connection, `Down` if there is none
    pub async fn link_state_of(&self, state: &Arc<State>) -> LinkState {
        self.inner.lock().await.links.values()
            .find(|l| Arc::ptr_eq(&l.state, state))
            .map(|l| l.link_state)
            .unwrap_or(LinkState::Down)
    }

    /// `Some(read_only)` if `state` is linked through this connection
    pub async fn link_read_only(&self, state: &Arc<State>) -> Option<bool> {
        self.inner.lock().await.links.values()
            .find(|l| Arc::ptr_eq(&l.state, state))
            .map(|l| l.read_only)
    }

    pub async fn link_count(&self) -> usize {
        self.inner.lock().await.links.len()
    }

    /// Connects to a peer at `host`, `host:port` or an IP literal; the port defaults to
    ///  [`crate::protocol::DEFAULT_PORT`]. Returns once the request is sent: the outcome is
    ///  reported to the listener.
    pub async fn connect(&self, address: &str) -> anyhow::Result<()> {
        if self.server.is_some() {
            bail!("a connection accepted by a server cannot connect");
        }
        {
            let inner = self.inner.lock().await;
            if inner.endpoint.is_some() || inner.connection_state != ConnectionState::Disconnected {
                bail!("connection {} is already in use", self.id);
            }
        }

        let remote_addr = resolve_address(address).await?;
        let local_addr: SocketAddr = if remote_addr.is_ipv6() {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        }
        else {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        };
        let endpoint = self.transport
            .open(local_addr, Arc::new(ClientDatagramListener { connection: self.myself.clone() }))
            .await?;

        let mut inner = self.inner.lock().await;
        if inner.endpoint.is_some() || inner.connection_state != ConnectionState::Disconnected {
            endpoint.close();
            bail!("connection {} is already in use", self.id);
        }

        info!("connection {}: connecting to {:?}", self.id, remote_addr);
        inner.endpoint = Some(endpoint);
        inner.owns_endpoint = true;
        inner.remote_addr = Some(remote_addr);
        inner.connection_state = ConnectionState::Connecting;
        inner.connect_elapsed = Duration::ZERO;
        inner.connect_resend_elapsed = Duration::ZERO;

        let mut out = inner.outbox();
        inner.push_connection_request(&mut out);
        self.start_update_task(&mut inner);
        drop(inner);

        self.dispatch(out).await;
        Ok(())
    }

    /// Closes the connection, notifying the listener. Does nothing if it is not connected.
    pub async fn disconnect(&self) {
        let mut inner = self.inner.lock().await;
        let mut out = inner.outbox();
        inner.teardown(true, true, &mut out);
        drop(inner);

        self.dispatch(out).await;
    }

    /// Closes the connection without notifying the listener, and stops all background
    ///  activity. Calling it repeatedly is harmless.
    pub async fn dispose(&self) {
        let mut inner = self.inner.lock().await;
        let mut out = inner.outbox();
        inner.teardown(true, false, &mut out);
        inner.update_generation += 1;
        drop(inner);

        self.dispatch(out).await;
    }

    /// Sends a message without any delivery or ordering guarantees
    pub async fn send_message(&self, message: &[u8]) -> anyhow::Result<()> {
        if message.is_empty() {
            bail!("message must not be empty");
        }
        if message.len() > MAX_UNRELIABLE_MESSAGE_LEN {
            bail!("unreliable message of {} bytes does not fit into a datagram", message.len());
        }

        let inner = self.inner.lock().await;
        if !inner.is_connected() {
            bail!("connection {} is not connected", self.id);
        }

        let mut datagram = BytesMut::with_capacity(1 + message.len());
        datagram.put_u8(CommandCode::Message.into());
        datagram.put_slice(message);

        let mut out = inner.outbox();
        out.push(datagram.freeze());
        drop(inner);

        self.dispatch(out).await;
        Ok(())
    }

    /// Sends a message that is delivered exactly once and in order with all other reliable
    ///  messages. Messages longer than the part size are sent in parts.
    pub async fn send_reliable_message(&self, message: &[u8]) -> anyhow::Result<()> {
        if message.is_empty() {
            bail!("message must not be empty");
        }
        if message.len() > self.config.max_message_size {
            bail!("message of {} bytes exceeds the maximum of {}", message.len(), self.config.max_message_size);
        }

        let mut inner = self.inner.lock().await;
        if !inner.is_connected() {
            bail!("connection {} is not connected", self.id);
        }

        if message.len() > self.config.long_message_part_size {
            let parts = split_message(message, self.config.long_message_part_size);
            inner.sender.ensure_capacity(parts.len())?;
            for part in parts {
                inner.sender.enqueue(ReliableKind::MessageLong, &part)?;
            }
        }
        else {
            inner.sender.enqueue(ReliableKind::Message, message)?;
        }

        let mut out = inner.outbox();
        out.datagrams.extend(inner.sender.flush_pending());
        drop(inner);

        self.dispatch(out).await;
        Ok(())
    }

    /// Asks the peer to link `state` to one of its states. `message` tells the peer's
    ///  application which state to link. The link is `Listening` until the peer agrees, and
    ///  changes to the state's values are replicated once it is up.
    ///
    /// Returns the link's id.
    pub async fn link_state(&self, message: &[u8], state: &Arc<State>, read_only: bool) -> anyhow::Result<u16> {
        if message.len() > u16::MAX as usize {
            bail!("link message of {} bytes exceeds the maximum of {}", message.len(), u16::MAX);
        }

        let mut inner = self.inner.lock().await;
        if !inner.is_connected() {
            bail!("connection {} is not connected", self.id);
        }
        if inner.links.values().any(|l| Arc::ptr_eq(&l.state, state)) {
            bail!("state is already linked through connection {}", self.id);
        }
        let Some(link_id) = (0..=u16::MAX).find(|id| !inner.links.contains_key(id)) else {
            bail!("connection {} has no free link ids", self.id);
        };

        let mut values = BytesMut::new();
        state.ser_snapshot(&mut values)?;
        let request = LinkRequest {
            link_id,
            read_only,
            message: Bytes::copy_from_slice(message),
            values: values.freeze(),
        };

        if request.serialized_len() > self.config.long_message_part_size {
            let parts = request.split(self.config.long_message_part_size);
            inner.sender.ensure_capacity(parts.len())?;
            for part in parts {
                inner.sender.enqueue(ReliableKind::LinkStateLong, &part)?;
            }
        }
        else {
            let mut buf = BytesMut::with_capacity(request.serialized_len());
            request.ser(&mut buf);
            inner.sender.enqueue(ReliableKind::LinkState, &buf)?;
        }

        debug!("connection {}: requesting link {}", self.id, link_id);
        let key = inner.link_key(link_id);
        state.attach_link(key, inner.dirty_links.clone());
        inner.links.insert(link_id, StateLink {
            state: state.clone(),
            link_state: LinkState::Listening,
            read_only,
        });

        let mut out = inner.outbox();
        out.datagrams.extend(inner.sender.flush_pending());
        drop(inner);

        self.dispatch(out).await;
        Ok(link_id)
    }

    /// Entry point for datagrams from the transport. Datagrams from anyone but the peer, and
    ///  datagrams that violate the protocol, are dropped.
    pub(crate) async fn on_datagram(&self, from: SocketAddr, datagram: Bytes) {
        let mut inner = self.inner.lock().await;
        if inner.remote_addr != Some(from) {
            debug!("connection {}: datagram from {:?} which is not the peer - dropping", self.id, from);
            return;
        }

        let mut out = inner.outbox();
        if let Err(e) = inner.process_datagram(datagram, self.listener.as_ref(), &mut out) {
            debug!("connection {}: malformed datagram from {:?} - dropping: {}", self.id, from, e);
        }
        drop(inner);

        self.dispatch(out).await;
    }

    /// Called by the server once the acceptance is sent to the peer
    pub(crate) async fn announce_established(&self) {
        if let Some(myself) = self.myself.upgrade() {
            self.listener.connection_established(&myself).await;
        }
    }

    fn start_update_task(&self, inner: &mut ConnectionInner) {
        inner.update_generation += 1;
        let generation = inner.update_generation;
        let connection = self.myself.clone();
        let period = self.config.update_interval;

        let handle = tokio::spawn(async move {
            let mut ticks = interval(period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut last_tick = Instant::now();

            loop {
                ticks.tick().await;
                let Some(connection) = connection.upgrade() else {
                    break;
                };

                let now = Instant::now();
                let elapsed = now.duration_since(last_tick);
                last_tick = now;

                if !connection.on_tick(generation, elapsed).await {
                    break;
                }
            }
            trace!("update task generation {} finished", generation);
        });

        // a previous task notices the new generation and exits on its own
        *self.update_handle.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    /// One update cycle, returning `false` if the update task should exit
    async fn on_tick(&self, generation: u64, elapsed: Duration) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.update_generation != generation {
            return false;
        }

        let mut out = inner.outbox();
        inner.update_timeouts(elapsed, &mut out);
        inner.flush_dirty_links(&mut out);
        let keep_running = inner.update_generation == generation;
        drop(inner);

        self.dispatch(out).await;
        keep_running
    }

    async fn dispatch(&self, out: Outbox) {
        if let Some((endpoint, to)) = &out.target {
            for datagram in &out.datagrams {
                endpoint.send_datagram(*to, datagram).await;
            }
        }
        if out.torn_down {
            if let Some(server) = self.server.as_ref().and_then(Weak::upgrade) {
                server.remove_connection(self.id).await;
            }
        }

        if let Some(myself) = self.myself.upgrade() {
            for event in out.events {
                match event {
                    ConnectionEvent::Established => self.listener.connection_established(&myself).await,
                    ConnectionEvent::Failed(reason) => self.listener.connection_failed(&myself, reason).await,
                    ConnectionEvent::Closed => self.listener.connection_closed(&myself).await,
                    ConnectionEvent::MessageReceived(message) => self.listener.message_received(&myself, message).await,
                    ConnectionEvent::MessageProgress(len) => self.listener.message_progress(&myself, len).await,
                }
            }
        }

        // this may be running on the endpoint's own receive task, so closing it comes last
        if let Some(endpoint) = &out.close_endpoint {
            endpoint.close();
        }
    }
}
