//! A [`Server`] listens on one endpoint and accepts connection requests. Every accepted
//!  [`Connection`] sends through the server's endpoint, and the server routes received datagrams
//!  to connections by their source address.

use crate::address::resolve_listen_address;
use crate::config::ConnectionConfig;
use crate::connection::{connection_accepted_datagram, Connection};
use crate::connection_listener::ConnectionListener;
use crate::endpoint::{DatagramListener, Endpoint, Transport, UdpTransport};
use crate::protocol::{CommandCode, ConnectionAckCode, Protocol, PROTOCOL_VERSION};
use crate::state_link::ConnectionId;
use anyhow::bail;
use async_trait::async_trait;
use bytes::{Buf, Bytes};
use rustc_hash::FxHashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tracing::{debug, info, trace};

/// the protocol a server speaks
const SERVER_PROTOCOL: Protocol = Protocol::DENetworkProtocol;

#[async_trait]
pub trait ServerListener: Send + Sync + 'static {
    /// Provides the listener for a connection that is about to be accepted
    fn create_connection_listener(&self) -> Arc<dyn ConnectionListener>;

    /// A client was accepted. This is the place to link states to it.
    async fn client_connected(&self, _server: &Server, _connection: &Arc<Connection>) {}
}

struct ServerInner {
    endpoint: Option<Arc<dyn Endpoint>>,
    connections: FxHashMap<SocketAddr, Arc<Connection>>,
}

pub struct Server {
    config: Arc<ConnectionConfig>,
    transport: Arc<dyn Transport>,
    listener: Arc<dyn ServerListener>,
    inner: Mutex<ServerInner>,
    myself: Weak<Server>,
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Some(endpoint) = self.inner.get_mut().endpoint.take() {
            endpoint.close();
        }
    }
}

struct ServerDatagramListener {
    server: Weak<Server>,
}

#[async_trait]
impl DatagramListener for ServerDatagramListener {
    async fn on_datagram(&self, from: SocketAddr, datagram: Bytes) {
        if let Some(server) = self.server.upgrade() {
            server.on_datagram(from, datagram).await;
        }
    }
}

impl Server {
    /// A server on UDP with default configuration
    pub fn new(listener: Arc<dyn ServerListener>) -> Arc<Server> {
        Self::create(Arc::new(ConnectionConfig::default()), Arc::new(UdpTransport), listener)
    }

    /// `config` applies to all accepted connections
    pub fn with_transport(config: ConnectionConfig, transport: Arc<dyn Transport>, listener: Arc<dyn ServerListener>) -> anyhow::Result<Arc<Server>> {
        config.validate()?;
        Ok(Self::create(Arc::new(config), transport, listener))
    }

    fn create(config: Arc<ConnectionConfig>, transport: Arc<dyn Transport>, listener: Arc<dyn ServerListener>) -> Arc<Server> {
        Arc::new_cyclic(|myself| Server {
            config,
            transport,
            listener,
            inner: Mutex::new(ServerInner {
                endpoint: None,
                connections: Default::default(),
            }),
            myself: myself.clone(),
        })
    }

    /// Starts listening on `host:port`, `host` or an IP literal. A host of `*` stands for this
    ///  machine's public address, and the port defaults to [`crate::protocol::DEFAULT_PORT`].
    pub async fn listen_on(&self, address: &str) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.endpoint.is_some() {
            bail!("server is already listening");
        }

        let local_addr = resolve_listen_address(address).await?;
        let endpoint = self.transport
            .open(local_addr, Arc::new(ServerDatagramListener { server: self.myself.clone() }))
            .await?;

        info!("server listening on {:?}", endpoint.local_addr());
        inner.endpoint = Some(endpoint);
        Ok(())
    }

    /// Disposes all connections, and releases the endpoint
    pub async fn stop_listening(&self) {
        let (endpoint, connections) = {
            let mut inner = self.inner.lock().await;
            let connections = inner.connections.drain()
                .map(|(_, c)| c)
                .collect::<Vec<_>>();
            (inner.endpoint.take(), connections)
        };

        for connection in connections {
            connection.dispose().await;
        }
        if let Some(endpoint) = endpoint {
            info!("server stopped listening on {:?}", endpoint.local_addr());
            endpoint.close();
        }
    }

    pub async fn dispose(&self) {
        self.stop_listening().await;
    }

    pub async fn is_listening(&self) -> bool {
        self.inner.lock().await.endpoint.is_some()
    }

    /// the bound address, if the server is listening
    pub async fn address(&self) -> Option<SocketAddr> {
        self.inner.lock().await.endpoint.as_ref()
            .map(|e| e.local_addr())
    }

    pub async fn connections(&self) -> Vec<Arc<Connection>> {
        self.inner.lock().await.connections.values()
            .cloned()
            .collect()
    }

    pub(crate) async fn remove_connection(&self, id: ConnectionId) {
        self.inner.lock().await.connections
            .retain(|_, c| c.id() != id);
    }

    async fn on_datagram(&self, from: SocketAddr, datagram: Bytes) {
        let connection = self.inner.lock().await.connections.get(&from).cloned();
        if let Some(connection) = connection {
            connection.on_datagram(from, datagram).await;
            return;
        }

        if let Err(e) = self.on_connection_request(from, datagram).await {
            debug!("malformed datagram from {:?} - dropping: {}", from, e);
        }
    }

    async fn on_connection_request(&self, from: SocketAddr, mut datagram: Bytes) -> anyhow::Result<()> {
        let code = CommandCode::try_from(datagram.try_get_u8()?)?;
        if code != CommandCode::ConnectionRequest {
            trace!("{:?} from {:?} which has no connection - dropping", code, from);
            return Ok(());
        }

        let version = datagram.try_get_u16_le()?;
        let num_protocols = datagram.try_get_u16_le()?;
        let offered = (0..num_protocols)
            .map(|_| datagram.try_get_u16_le())
            .collect::<Result<Vec<_>, _>>()?;
        trace!("connection request from {:?}: version {}, protocols {:?}", from, version, offered);
        if version != PROTOCOL_VERSION {
            debug!("connection request from {:?} with protocol version {}", from, version);
        }

        let mut inner = self.inner.lock().await;
        let Some(endpoint) = inner.endpoint.clone() else {
            // a receive task that is still draining after the endpoint was released
            trace!("connection request from {:?} while not listening - dropping", from);
            return Ok(());
        };

        if !offered.contains(&SERVER_PROTOCOL.into()) {
            drop(inner);
            debug!("connection request from {:?} without a common protocol - rejecting", from);
            endpoint.send_datagram(from, &[CommandCode::ConnectionAck.into(), ConnectionAckCode::NoCommonProtocol.into()]).await;
            return Ok(());
        }

        let connection = Connection::new_accepted(
            self.config.clone(),
            self.transport.clone(),
            self.listener.create_connection_listener(),
            self.myself.clone(),
            endpoint.clone(),
            from,
            SERVER_PROTOCOL,
        ).await;
        inner.connections.insert(from, connection.clone());
        drop(inner);

        endpoint.send_datagram(from, &connection_accepted_datagram(SERVER_PROTOCOL)).await;

        info!("accepted connection {} from {:?}", connection.id(), from);
        connection.announce_established().await;
        self.listener.client_connected(self, &connection).await;
        Ok(())
    }
}
