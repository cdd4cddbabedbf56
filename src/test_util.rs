//! Utilities for testing code built on connections and states. They are used by this crate's own
//!  tests, and they are exported for testing applications.
//!
//! [`SimulatedNetwork`] is an in-memory [`Transport`] that loses, duplicates and reorders
//!  datagrams in a reproducible way, and [`RecordingConnectionListener`] records the callbacks of
//!  a connection for later assertions.

use crate::connection::Connection;
use crate::connection_listener::{ConnectionFailedReason, ConnectionListener};
use crate::endpoint::{DatagramListener, Endpoint, Transport};
use crate::state::State;
use anyhow::bail;
use async_trait::async_trait;
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustc_hash::FxHashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{trace, warn};

type DatagramSender = mpsc::UnboundedSender<(SocketAddr, Bytes)>;

struct NetworkInner {
    loss: f64,
    duplication: f64,
    max_delay: Duration,
    rng: Mutex<StdRng>,
    endpoints: Mutex<FxHashMap<SocketAddr, DatagramSender>>,
    next_port: AtomicU16,
}

impl NetworkInner {
    fn endpoints(&self) -> std::sync::MutexGuard<'_, FxHashMap<SocketAddr, DatagramSender>> {
        self.endpoints.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// the delays of all copies of a datagram that get delivered
    fn roll_deliveries(&self) -> Vec<Duration> {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        if rng.gen_bool(self.loss) {
            return Vec::new();
        }
        let num_copies = if rng.gen_bool(self.duplication) { 2 } else { 1 };

        (0..num_copies)
            .map(|_| {
                if self.max_delay.is_zero() {
                    Duration::ZERO
                }
                else {
                    Duration::from_micros(rng.gen_range(0..=self.max_delay.as_micros() as u64))
                }
            })
            .collect()
    }
}

/// An in-memory datagram network. All endpoints opened through the same `SimulatedNetwork` (or
///  its clones) can reach each other. Endpoints opened on an unspecified IP or port 0 get
///  `127.0.0.1` and a fresh port.
///
/// Random delays reorder datagrams. Each endpoint's listener is called serially, like
///  a socket's receive loop.
#[derive(Clone)]
pub struct SimulatedNetwork {
    inner: Arc<NetworkInner>,
}

impl Default for SimulatedNetwork {
    fn default() -> Self {
        SimulatedNetwork::new()
    }
}

impl SimulatedNetwork {
    /// a network that delivers every datagram immediately and exactly once
    pub fn new() -> SimulatedNetwork {
        SimulatedNetwork::lossy(0.0, 0.0, Duration::ZERO, 0)
    }

    pub fn lossy(loss: f64, duplication: f64, max_delay: Duration, seed: u64) -> SimulatedNetwork {
        SimulatedNetwork {
            inner: Arc::new(NetworkInner {
                loss,
                duplication,
                max_delay,
                rng: Mutex::new(StdRng::seed_from_u64(seed)),
                endpoints: Default::default(),
                next_port: AtomicU16::new(40_000),
            }),
        }
    }
}

#[async_trait]
impl Transport for SimulatedNetwork {
    async fn open(&self, local_addr: SocketAddr, listener: Arc<dyn DatagramListener>) -> anyhow::Result<Arc<dyn Endpoint>> {
        let ip = if local_addr.ip().is_unspecified() {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
        else {
            local_addr.ip()
        };
        let port = if local_addr.port() == 0 {
            self.inner.next_port.fetch_add(1, Ordering::Relaxed)
        }
        else {
            local_addr.port()
        };
        let local_addr = SocketAddr::new(ip, port);

        let (sender, mut receiver) = mpsc::unbounded_channel::<(SocketAddr, Bytes)>();
        {
            let mut endpoints = self.inner.endpoints();
            if endpoints.contains_key(&local_addr) {
                bail!("address {:?} is in use", local_addr);
            }
            endpoints.insert(local_addr, sender);
        }

        let delivery_handle = tokio::spawn(async move {
            while let Some((from, datagram)) = receiver.recv().await {
                listener.on_datagram(from, datagram).await;
            }
        });

        Ok(Arc::new(SimulatedEndpoint {
            network: self.inner.clone(),
            local_addr,
            delivery_handle: Mutex::new(Some(delivery_handle)),
        }))
    }
}

/// the largest payload a UDP datagram can carry
const MAX_SIMULATED_DATAGRAM_LEN: usize = 65_507;

struct SimulatedEndpoint {
    network: Arc<NetworkInner>,
    local_addr: SocketAddr,
    delivery_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for SimulatedEndpoint {
    fn drop(&mut self) {
        self.close();
    }
}

#[async_trait]
impl Endpoint for SimulatedEndpoint {
    async fn send_datagram(&self, to: SocketAddr, datagram: &[u8]) {
        if datagram.len() > MAX_SIMULATED_DATAGRAM_LEN {
            warn!("simulated network: datagram of {} bytes is too big for UDP - dropping", datagram.len());
            return;
        }
        let Some(target) = self.network.endpoints().get(&to).cloned() else {
            trace!("simulated network: no endpoint at {:?} - dropping", to);
            return;
        };

        let datagram = Bytes::copy_from_slice(datagram);
        for delay in self.network.roll_deliveries() {
            if delay.is_zero() {
                let _ = target.send((self.local_addr, datagram.clone()));
            }
            else {
                let target = target.clone();
                let from = self.local_addr;
                let datagram = datagram.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = target.send((from, datagram));
                });
            }
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn close(&self) {
        if let Some(handle) = self.delivery_handle.lock().unwrap_or_else(PoisonError::into_inner).take() {
            self.network.endpoints().remove(&self.local_addr);
            handle.abort();
        }
    }
}

/// Forwards received datagrams into a channel
pub struct DatagramChannel(pub mpsc::UnboundedSender<(SocketAddr, Bytes)>);

#[async_trait]
impl DatagramListener for DatagramChannel {
    async fn on_datagram(&self, from: SocketAddr, datagram: Bytes) {
        let _ = self.0.send((from, datagram));
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum RecordedEvent {
    Established,
    Failed(ConnectionFailedReason),
    Closed,
    Message(Bytes),
    Progress(usize),
}

type StateFactory = Box<dyn Fn(&Bytes, bool) -> Option<Arc<State>> + Send + Sync>;

pub struct RecordingConnectionListener {
    events: Arc<RwLock<Vec<RecordedEvent>>>,
    state_factory: Option<StateFactory>,
}

impl Default for RecordingConnectionListener {
    fn default() -> Self {
        RecordingConnectionListener::new()
    }
}

impl RecordingConnectionListener {
    pub fn new() -> RecordingConnectionListener {
        RecordingConnectionListener {
            events: Default::default(),
            state_factory: None,
        }
    }

    /// `factory` answers link requests from the peer
    pub fn with_state_factory(factory: impl Fn(&Bytes, bool) -> Option<Arc<State>> + Send + Sync + 'static) -> RecordingConnectionListener {
        RecordingConnectionListener {
            events: Default::default(),
            state_factory: Some(Box::new(factory)),
        }
    }

    pub async fn events(&self) -> Vec<RecordedEvent> {
        self.events.read().await.clone()
    }

    pub async fn messages(&self) -> Vec<Bytes> {
        self.events.read().await
            .iter()
            .filter_map(|e| match e {
                RecordedEvent::Message(message) => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    /// Waits up to ten seconds for the recorded events to satisfy `predicate`
    pub async fn wait_for(&self, predicate: impl Fn(&[RecordedEvent]) -> bool) -> bool {
        for _ in 0..1000 {
            if predicate(&self.events.read().await) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    async fn record(&self, event: RecordedEvent) {
        self.events.write().await.push(event);
    }
}

#[async_trait]
impl ConnectionListener for RecordingConnectionListener {
    async fn connection_established(&self, _connection: &Arc<Connection>) {
        self.record(RecordedEvent::Established).await;
    }

    async fn connection_failed(&self, _connection: &Arc<Connection>, reason: ConnectionFailedReason) {
        self.record(RecordedEvent::Failed(reason)).await;
    }

    async fn connection_closed(&self, _connection: &Arc<Connection>) {
        self.record(RecordedEvent::Closed).await;
    }

    async fn message_received(&self, _connection: &Arc<Connection>, message: Bytes) {
        self.record(RecordedEvent::Message(message)).await;
    }

    async fn message_progress(&self, _connection: &Arc<Connection>, bytes_received: usize) {
        self.record(RecordedEvent::Progress(bytes_received)).await;
    }

    fn create_state(&self, message: &Bytes, read_only: bool) -> Option<Arc<State>> {
        self.state_factory.as_ref()
            .and_then(|factory| factory(message, read_only))
    }
}
