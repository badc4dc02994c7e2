use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::select;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::{ConnectionRole, TransportConfig};
use crate::handler::{PacketHandler, PacketListener, ReleaseResources, WeakPacketHandler};
use crate::heartbeat::{spawn_heartbeat, HeartbeatTarget};
use crate::packet::PacketPayload;
use crate::worker::{RepeatingTask, RepeatingWorker, WorkerSignal};


/// Accepts connections from any number of clients on a listening socket, and sends heartbeats
///  to all of them.
pub struct Host<P: PacketPayload> {
    handler: PacketHandler<P>,
    local_addr: SocketAddr,
}

impl<P: PacketPayload> Host<P> {
    /// Bind the listening socket and start accepting connections. Binding to port 0 picks an
    ///  ephemeral port, see [Host::local_addr].
    pub async fn bind(bind_addr: SocketAddr, config: TransportConfig, listener: Arc<dyn PacketListener<P>>, executor: Handle) -> anyhow::Result<Host<P>> {
        config.validate()?;

        let tcp_listener = match TcpListener::bind(bind_addr).await {
            Ok(l) => l,
            Err(e) => {
                error!(role = %ConnectionRole::Host, "unable to open server socket on {}: {}", bind_addr, e);
                return Err(anyhow!("unable to open server socket on {}: {}", bind_addr, e));
            }
        };
        let local_addr = tcp_listener.local_addr()?;
        info!(role = %ConnectionRole::Host, "listening on {}", local_addr);

        let handler = PacketHandler::new(ConnectionRole::Host, Arc::new(config), listener, executor.clone());

        let accept_step = Arc::new(AcceptStep {
            handler: handler.downgrade(),
            acceptor: Mutex::new(Some(tcp_listener)),
        });
        let accept = Arc::new(AcceptWorker {
            worker: RepeatingWorker::new("accept", ConnectionRole::Host),
            step: accept_step.clone(),
        });
        handler.set_release(accept.clone());
        accept.worker.start(&executor, accept_step).await?;

        spawn_heartbeat(&handler, HeartbeatTarget::All);

        Ok(Host {
            handler,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn handler(&self) -> &PacketHandler<P> {
        &self.handler
    }

    pub async fn write_packet(&self, addr: SocketAddr, payload: &P) -> anyhow::Result<()> {
        self.handler.write_packet(addr, payload).await
    }

    pub async fn write_packet_all(&self, payload: &P) -> anyhow::Result<()> {
        self.handler.write_packet_all(payload).await
    }

    pub async fn write_packet_all_except(&self, payload: &P, excluded: &[SocketAddr]) -> anyhow::Result<()> {
        self.handler.write_packet_all_except(payload, excluded).await
    }

    pub async fn close_connection(&self, addr: SocketAddr) -> anyhow::Result<()> {
        self.handler.close_connection(addr).await
    }

    /// Stop accepting connections, close the listening socket and then close all connections.
    pub async fn close(&self) -> anyhow::Result<()> {
        self.handler.close().await
    }
}


struct AcceptWorker<P: PacketPayload> {
    worker: RepeatingWorker,
    step: Arc<AcceptStep<P>>,
}

#[async_trait]
impl<P: PacketPayload> ReleaseResources for AcceptWorker<P> {
    async fn release(&self) {
        if let Err(e) = self.worker.stop() {
            warn!(role = %ConnectionRole::Host, "unable to stop accepting connections: {}", e);
        }

        // the current step gives up the listener when it sees the stop
        match self.step.acceptor.lock().await.take() {
            Some(_) => debug!(role = %ConnectionRole::Host, "closed server socket"),
            None => warn!(role = %ConnectionRole::Host, "server socket was closed before"),
        }

        self.worker.join().await;
    }
}

/// the source of incoming connections
#[async_trait]
trait Acceptor: Send + Sync + 'static {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)>;
}

#[async_trait]
impl Acceptor for TcpListener {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }
}

/// Accepts a single connection per step. Registration runs on a task of its own, so listener
///  hooks never run on the accepting task and are free to close the host.
struct AcceptStep<P: PacketPayload, A: Acceptor = TcpListener> {
    handler: WeakPacketHandler<P>,
    acceptor: Mutex<Option<A>>,
}

#[async_trait]
impl<P: PacketPayload, A: Acceptor> RepeatingTask for AcceptStep<P, A> {
    async fn step(&self, signal: &WorkerSignal) {
        let accepted = {
            let acceptor = self.acceptor.lock().await;
            match acceptor.as_ref() {
                None => None,
                Some(acceptor) => select! {
                    r = acceptor.accept() => Some(r),
                    _ = signal.stopped() => None,
                }
            }
        };

        match accepted {
            None => {
                debug!("stopped accepting connections");
                signal.stopped().await;
            }
            Some(Ok((stream, addr))) => {
                let Some(handler) = self.handler.upgrade() else {
                    debug!("dropping connection from {} because the host no longer exists", addr);
                    return;
                };
                debug!("accepted connection from {}", addr);
                let executor = handler.executor().clone();
                executor.spawn(async move {
                    if let Err(e) = handler.register_connection(stream).await {
                        info!("unable to register connection from {}: {:#}", addr, e);
                    }
                });
            }
            Some(Err(e)) => {
                if signal.is_active() {
                    info!("unable to accept connection: {}", e);
                }
                else {
                    debug!("accept failed after stop: {}", e);
                }
            }
        }
    }
}
