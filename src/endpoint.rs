//! The datagram transport underneath connections: an [`Endpoint`] is a bound socket that sends
//!  datagrams and delivers received ones to a [`DatagramListener`]. [`UdpTransport`] is the
//!  implementation on top of a tokio `UdpSocket`; tests plug in other transports.

use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace};

/// largest possible UDP payload
const MAX_DATAGRAM_LEN: usize = 65_535;

#[async_trait]
pub trait DatagramListener: Send + Sync + 'static {
    /// Called for every received datagram, one at a time per endpoint
    async fn on_datagram(&self, from: SocketAddr, datagram: Bytes);
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait Endpoint: Send + Sync + 'static {
    /// Sends without waiting for anything but the local socket. Errors are logged and otherwise
    ///  ignored: datagrams may get lost anyway.
    async fn send_datagram(&self, to: SocketAddr, datagram: &[u8]);

    fn local_addr(&self) -> SocketAddr;

    /// stops delivering datagrams to the listener
    fn close(&self);
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn open(&self, local_addr: SocketAddr, listener: Arc<dyn DatagramListener>) -> anyhow::Result<Arc<dyn Endpoint>>;
}

#[derive(Default, Debug, Clone, Copy)]
pub struct UdpTransport;

#[async_trait]
impl Transport for UdpTransport {
    async fn open(&self, local_addr: SocketAddr, listener: Arc<dyn DatagramListener>) -> anyhow::Result<Arc<dyn Endpoint>> {
        let socket = Arc::new(UdpSocket::bind(local_addr).await?);
        let local_addr = socket.local_addr()?;
        info!("bound UDP socket to {:?}", local_addr);

        let recv_handle = tokio::spawn(UdpEndpoint::recv_loop(socket.clone(), listener));
        Ok(Arc::new(UdpEndpoint {
            socket,
            local_addr,
            recv_handle: Mutex::new(Some(recv_handle)),
        }))
    }
}

pub struct UdpEndpoint {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    recv_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for UdpEndpoint {
    fn drop(&mut self) {
        self.close();
    }
}

impl UdpEndpoint {
    async fn recv_loop(socket: Arc<UdpSocket>, listener: Arc<dyn DatagramListener>) {
        debug!("starting receive loop");

        let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
        loop {
            let (num_read, from) = match socket.recv_from(&mut buf).await {
                Ok(x) => x,
                Err(e) => {
                    error!("socket error: {}", e);
                    continue;
                }
            };
            trace!("received datagram from {:?}: {:?}", from, &buf[..num_read]);

            listener.on_datagram(from, Bytes::copy_from_slice(&buf[..num_read])).await;
        }
    }
}

#[async_trait]
impl Endpoint for UdpEndpoint {
    async fn send_datagram(&self, to: SocketAddr, datagram: &[u8]) {
        trace!("UDP socket: sending datagram to {:?}", to);

        if let Err(e) = self.socket.send_to(datagram, to).await {
            error!("error sending UDP datagram to {:?}: {}", to, e);
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn close(&self) {
        if let Some(handle) = self.recv_handle.lock().unwrap_or_else(PoisonError::into_inner).take() {
            debug!("closing UDP socket {:?}", self.local_addr);
            handle.abort();
        }
    }
}
