use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::anyhow;
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::config::{ConnectionRole, TransportConfig};
use crate::error::UsageError;
use crate::handler::{PacketHandler, PacketListener};
use crate::heartbeat::{spawn_heartbeat, HeartbeatTarget};
use crate::packet::PacketPayload;


/// Holds a single connection to a host.
///
/// Creating a client does not connect it: [Client::try_connect] makes a single connection
///  attempt. There are no automatic retries or reconnects - it is up to the application to
///  call `try_connect` again after a failed attempt, or after the connection was closed.
pub struct Client<P: PacketPayload> {
    handler: PacketHandler<P>,
    host_addr: SocketAddr,
    /// serializes connection attempts without blocking readers of `connection`
    connecting: Mutex<()>,
    connection: RwLock<Option<HostConnection>>,
}

/// the host's address as registered with the handler, and the heartbeat sent to it
struct HostConnection {
    addr: SocketAddr,
    heartbeat: JoinHandle<()>,
}

impl<P: PacketPayload> Client<P> {
    pub fn new(host_addr: SocketAddr, config: TransportConfig, listener: Arc<dyn PacketListener<P>>, executor: Handle) -> anyhow::Result<Client<P>> {
        config.validate()?;

        Ok(Client {
            handler: PacketHandler::new(ConnectionRole::Client, Arc::new(config), listener, executor),
            host_addr,
            connecting: Default::default(),
            connection: Default::default(),
        })
    }

    pub fn host_addr(&self) -> SocketAddr {
        self.host_addr
    }

    pub fn handler(&self) -> &PacketHandler<P> {
        &self.handler
    }

    /// Connect to the host, waiting at most for the configured connect timeout. On success,
    ///  the connection is registered and heartbeats to the host start.
    ///
    /// This fails while the client has a live connection. Once that connection was closed,
    ///  the client can connect again.
    pub async fn try_connect(&self) -> anyhow::Result<()> {
        let _connecting = self.connecting.lock().await;

        if self.is_connected().await {
            return Err(UsageError::AlreadyConnected(self.host_addr).into());
        }
        if self.handler.is_closed() {
            return Err(UsageError::HandlerClosed.into());
        }
        if let Some(stale) = self.connection.write().await.take() {
            debug!(role = %ConnectionRole::Client, "discarding closed connection to {}", stale.addr);
            stale.heartbeat.abort();
        }

        let connect_timeout = self.handler.config().connect_timeout;
        info!(role = %ConnectionRole::Client, "connecting to host {}", self.host_addr);

        let stream = match timeout(connect_timeout, TcpStream::connect(self.host_addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                info!(role = %ConnectionRole::Client, "unable to open connection to host {}: {}", self.host_addr, e);
                return Err(anyhow!("unable to open connection to host {}: {}", self.host_addr, e));
            }
            Err(_) => {
                info!(role = %ConnectionRole::Client, "timeout connecting to host {} after {:?}", self.host_addr, connect_timeout);
                return Err(anyhow!("timeout connecting to host {} after {:?}", self.host_addr, connect_timeout));
            }
        };

        let addr = self.handler.register_connection(stream).await?;
        let heartbeat = spawn_heartbeat(&self.handler, HeartbeatTarget::Single(addr));
        *self.connection.write().await = Some(HostConnection {
            addr,
            heartbeat,
        });
        Ok(())
    }

    async fn connection_addr(&self) -> Option<SocketAddr> {
        self.connection.read().await
            .as_ref()
            .map(|c| c.addr)
    }

    pub async fn is_connected(&self) -> bool {
        match self.connection_addr().await {
            Some(addr) => self.handler.is_connected(addr).await,
            None => false,
        }
    }

    /// Send a packet to the host
    pub async fn write_packet(&self, payload: &P) -> anyhow::Result<()> {
        let addr = self.connection_addr().await
            .ok_or(UsageError::NotConnected)?;
        self.handler.write_packet(addr, payload).await
    }

    pub async fn close(&self) -> anyhow::Result<()> {
        self.handler.close().await
    }
}
