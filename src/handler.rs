use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, trace, warn};

use crate::channel::{ConnectionChannel, PacketSubscriber, PacketSubscription};
use crate::codec::{encode_frame, encode_payload_frame};
use crate::config::{ConnectionRole, TransportConfig};
use crate::error::UsageError;
use crate::packet::{Packet, PacketPayload, ReceivedPacket};


/// The application's view of a packet handler's events. All hooks receive the handler, so
///  the application can send packets in response.
///
/// Hooks are awaited on the task that produced the event: a connection's next packet is read
///  only after [PacketListener::on_packet_received] returned for the previous one.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PacketListener<P: PacketPayload>: Send + Sync + 'static {
    /// A new connection was registered. This is called before any packet from that
    ///  connection is delivered.
    async fn on_new_connection(&self, handler: &PacketHandler<P>, addr: SocketAddr);

    /// Heartbeats are handled by the transport and never show up here.
    async fn on_packet_received(&self, handler: &PacketHandler<P>, packet: ReceivedPacket<P>);

    /// A connection was closed, either by the peer or locally. This is called once per
    ///  connection, after it was removed from the handler.
    async fn on_socket_closed(&self, handler: &PacketHandler<P>, addr: SocketAddr);

    /// The handler is about to close its connections.
    async fn on_before_closed(&self, _handler: &PacketHandler<P>) {}
}

tokio::task_local! {
    /// the connection whose [PacketListener::on_new_connection] is running on the current task
    static ANNOUNCING: SocketAddr;
}

/// Role specific resources that must be released before a handler closes its connections,
///  e.g. a host's listening socket.
#[async_trait]
pub(crate) trait ReleaseResources: Send + Sync + 'static {
    async fn release(&self);
}


/// The set of live connections of a host or client, keyed by their peer address.
///
/// The handler owns its connections: it registers them, dispatches received packets to the
///  [PacketListener], and keeps track of connections until they are closed. Closing the
///  handler closes all its connections.
///
/// This is a cheap handle around shared state, clones refer to the same handler.
pub struct PacketHandler<P: PacketPayload> {
    inner: Arc<HandlerInner<P>>,
}
impl<P: PacketPayload> Clone for PacketHandler<P> {
    fn clone(&self) -> Self {
        PacketHandler {
            inner: self.inner.clone(),
        }
    }
}

pub(crate) struct WeakPacketHandler<P: PacketPayload> {
    inner: Weak<HandlerInner<P>>,
}
impl<P: PacketPayload> WeakPacketHandler<P> {
    pub fn upgrade(&self) -> Option<PacketHandler<P>> {
        self.inner.upgrade()
            .map(|inner| PacketHandler { inner })
    }
}

struct HandlerInner<P: PacketPayload> {
    role: ConnectionRole,
    config: Arc<TransportConfig>,
    executor: Handle,
    listener: Arc<dyn PacketListener<P>>,
    connections: RwLock<FxHashMap<SocketAddr, ConnectionEntry<P>>>,
    /// set under the write lock of `connections`: once it is set, no connection is registered
    closed: watch::Sender<bool>,
    close_started: AtomicBool,
    release: OnceLock<Arc<dyn ReleaseResources>>,
}

struct ConnectionEntry<P: PacketPayload> {
    channel: Arc<ConnectionChannel<P>>,
    subscriber: Arc<ConnectionSubscriber<P>>,
}
impl<P: PacketPayload> Clone for ConnectionEntry<P> {
    fn clone(&self) -> Self {
        ConnectionEntry {
            channel: self.channel.clone(),
            subscriber: self.subscriber.clone(),
        }
    }
}

impl<P: PacketPayload> PacketHandler<P> {
    pub fn new(role: ConnectionRole, config: Arc<TransportConfig>, listener: Arc<dyn PacketListener<P>>, executor: Handle) -> PacketHandler<P> {
        let (closed, _) = watch::channel(false);
        PacketHandler {
            inner: Arc::new(HandlerInner {
                role,
                config,
                executor,
                listener,
                connections: Default::default(),
                closed,
                close_started: AtomicBool::new(false),
                release: OnceLock::new(),
            })
        }
    }

    pub(crate) fn downgrade(&self) -> WeakPacketHandler<P> {
        WeakPacketHandler {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub(crate) fn set_release(&self, release: Arc<dyn ReleaseResources>) {
        if self.inner.release.set(release).is_err() {
            warn!(role = %self.inner.role, "resources to release were registered twice - this is a bug");
        }
    }

    pub fn role(&self) -> ConnectionRole {
        self.inner.role
    }

    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    pub(crate) fn executor(&self) -> &Handle {
        &self.inner.executor
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// resolves once the handler is closed, and immediately if it is closed already
    pub(crate) fn closed_signal(&self) -> watch::Receiver<bool> {
        self.inner.closed.subscribe()
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.connections.read().await.len()
    }

    pub async fn connected_addrs(&self) -> Vec<SocketAddr> {
        self.inner.connections.read().await
            .keys()
            .copied()
            .collect()
    }

    pub async fn is_connected(&self, addr: SocketAddr) -> bool {
        self.inner.connections.read().await
            .contains_key(&addr)
    }

    /// Take ownership of an established connection and start receiving packets from it.
    ///
    /// The listener is notified of the new connection before any of its packets.
    #[tracing::instrument(level = "debug", skip_all, fields(role = %self.inner.role))]
    pub async fn register_connection(&self, stream: TcpStream) -> anyhow::Result<SocketAddr> {
        if self.is_closed() {
            return Err(UsageError::HandlerClosed.into());
        }

        let channel = Arc::new(ConnectionChannel::new(stream, self.inner.role, self.inner.config.clone(), self.inner.executor.clone())?);
        let peer_addr = channel.peer_addr();

        let subscriber = Arc::new(ConnectionSubscriber {
            handler: self.downgrade(),
            peer_addr,
            subscription: OnceLock::new(),
            registered: AtomicBool::new(false),
            announced: watch::channel(false).0,
        });
        let subscription = channel.subscribe(subscriber.clone()).await?;

        let rejection = {
            let mut connections = self.inner.connections.write().await;
            if *self.inner.closed.borrow() {
                Some(UsageError::HandlerClosed)
            }
            else if connections.contains_key(&peer_addr) {
                Some(UsageError::DuplicateConnection(peer_addr))
            }
            else {
                subscriber.registered.store(true, Ordering::Release);
                connections.insert(peer_addr, ConnectionEntry {
                    channel: channel.clone(),
                    subscriber: subscriber.clone(),
                });
                None
            }
        };
        if let Some(e) = rejection {
            warn!(peer = %peer_addr, "rejecting connection: {}", e);
            if let Err(e) = subscription.cancel().await {
                debug!(peer = %peer_addr, "rejected connection was closed concurrently: {}", e);
            }
            return Err(e.into());
        }

        info!(peer = %peer_addr, "registered connection");
        let announced = AnnouncedOnDrop(&subscriber.announced);
        ANNOUNCING.scope(peer_addr, self.inner.listener.on_new_connection(self, peer_addr)).await;
        drop(announced);

        if !subscription.is_cancelled() {
            subscription.request(1);
        }
        Ok(peer_addr)
    }

    async fn entry(&self, addr: SocketAddr) -> anyhow::Result<ConnectionEntry<P>> {
        self.inner.connections.read().await
            .get(&addr)
            .cloned()
            .ok_or_else(|| UsageError::UnknownConnection(addr).into())
    }

    pub async fn write_packet(&self, addr: SocketAddr, payload: &P) -> anyhow::Result<()> {
        let entry = self.entry(addr).await?;
        let frame = encode_payload_frame(payload, self.inner.config.max_packet_size)?;
        entry.channel.write_encoded(&frame).await
    }

    pub(crate) async fn write_heartbeat(&self, addr: SocketAddr) -> anyhow::Result<()> {
        let entry = self.entry(addr).await?;
        entry.channel.write_packet(&Packet::Heartbeat).await
    }

    /// Send a packet to all connections that exist when this method is called. Failing to
    ///  send to one connection does not affect the others.
    pub async fn write_packet_all(&self, payload: &P) -> anyhow::Result<()> {
        self.write_packet_all_except(payload, &[]).await
    }

    pub async fn write_packet_all_except(&self, payload: &P, excluded: &[SocketAddr]) -> anyhow::Result<()> {
        let frame = encode_payload_frame(payload, self.inner.config.max_packet_size)?;
        self.broadcast(&frame, excluded).await;
        Ok(())
    }

    pub(crate) async fn write_heartbeat_all(&self) -> anyhow::Result<()> {
        let frame = encode_frame::<P>(&Packet::Heartbeat, self.inner.config.max_packet_size)?;
        self.broadcast(&frame, &[]).await;
        Ok(())
    }

    async fn broadcast(&self, frame: &Bytes, excluded: &[SocketAddr]) {
        let channels = self.inner.connections.read().await
            .iter()
            .filter(|(addr, _)| !excluded.contains(addr))
            .map(|(_, entry)| entry.channel.clone())
            .collect::<Vec<_>>();

        trace!(role = %self.inner.role, "broadcasting packet to {} connections", channels.len());
        for channel in channels {
            if let Err(e) = channel.write_encoded(frame).await {
                debug!(role = %self.inner.role, peer = %channel.peer_addr(), "error broadcasting packet: {:#}", e);
            }
        }
    }

    /// Close a single connection. When this returns successfully, the connection is removed
    ///  and the listener was notified.
    pub async fn close_connection(&self, addr: SocketAddr) -> anyhow::Result<()> {
        let entry = self.entry(addr).await?;
        entry.subscriber.cancel().await
    }

    /// Close the handler and all its connections. A handler can be closed only once.
    ///
    /// Role specific resources are released first, then the listener's
    ///  [PacketListener::on_before_closed] is called. After that, no new connections are
    ///  accepted, and all existing connections are closed. When this method returns, there
    ///  are no connections left.
    pub async fn close(&self) -> anyhow::Result<()> {
        if self.inner.close_started.swap(true, Ordering::AcqRel) {
            return Err(UsageError::HandlerClosed.into());
        }
        info!(role = %self.inner.role, "closing packet handler");

        if let Some(release) = self.inner.release.get() {
            release.release().await;
        }
        self.inner.listener.on_before_closed(self).await;

        let entries = {
            let connections = self.inner.connections.write().await;
            self.inner.closed.send_replace(true);
            connections.values()
                .cloned()
                .collect::<Vec<_>>()
        };
        debug!(role = %self.inner.role, "closing {} connections", entries.len());

        for entry in entries {
            if let Err(e) = entry.subscriber.cancel().await {
                // someone else is closing it, so wait for that to complete
                debug!(role = %self.inner.role, peer = %entry.channel.peer_addr(), "{}", e);
                entry.channel.closed().await;
            }
        }

        info!(role = %self.inner.role, "packet handler closed");
        Ok(())
    }
}


/// The handler's subscriber for a single connection: it dispatches received packets to the
///  listener and requests the next packet after each one.
struct ConnectionSubscriber<P: PacketPayload> {
    handler: WeakPacketHandler<P>,
    peer_addr: SocketAddr,
    subscription: OnceLock<PacketSubscription<P>>,
    /// a connection that was rejected during registration is closed without telling the
    ///  listener
    registered: AtomicBool,
    /// set when `on_new_connection` returned: the listener hears about a closed connection
    ///  only after it heard about the connection
    announced: watch::Sender<bool>,
}

/// marks a connection as announced even if the registering future is dropped or panics
struct AnnouncedOnDrop<'a>(&'a watch::Sender<bool>);
impl Drop for AnnouncedOnDrop<'_> {
    fn drop(&mut self) {
        self.0.send_replace(true);
    }
}

impl<P: PacketPayload> ConnectionSubscriber<P> {
    async fn cancel(&self) -> anyhow::Result<()> {
        match self.subscription.get() {
            Some(subscription) => subscription.cancel().await,
            None => Err(UsageError::AlreadyClosing(self.peer_addr).into()),
        }
    }
}

#[async_trait]
impl<P: PacketPayload> PacketSubscriber<P> for ConnectionSubscriber<P> {
    async fn on_subscribe(&self, subscription: PacketSubscription<P>) {
        if self.subscription.set(subscription).is_err() {
            warn!(peer = %self.peer_addr, "subscribed twice - this is a bug");
        }
    }

    async fn on_packet(&self, packet: ReceivedPacket<Packet<P>>) {
        let Some(subscription) = self.subscription.get() else {
            warn!(peer = %self.peer_addr, "packet without subscription - this is a bug");
            return;
        };

        let origin = packet.origin();
        match packet.into_content() {
            Packet::Heartbeat => {
                trace!(peer = %origin, "received heartbeat");
            }
            Packet::Payload(payload) => {
                match self.handler.upgrade() {
                    Some(handler) => {
                        trace!(role = %handler.role(), peer = %origin, "received packet");
                        handler.inner.listener.on_packet_received(&handler, ReceivedPacket::new(origin, payload)).await;
                    }
                    None => debug!(peer = %origin, "dropping packet because the handler no longer exists"),
                }
            }
        }

        if !subscription.is_cancelled() {
            subscription.request(1);
        }
    }

    async fn on_error(&self, error: anyhow::Error) {
        info!(peer = %self.peer_addr, "error receiving packet: {:#}", error);
    }

    async fn on_complete(&self) {
        if !self.registered.load(Ordering::Acquire) {
            debug!(peer = %self.peer_addr, "closed unregistered connection");
            return;
        }

        // closing from within the connection's own `on_new_connection` must not wait for it
        let announcing_here = ANNOUNCING.try_with(|addr| *addr == self.peer_addr).unwrap_or(false);
        if !announcing_here {
            let mut announced = self.announced.subscribe();
            if announced.wait_for(|announced| *announced).await.is_err() {
                warn!(peer = %self.peer_addr, "announcement flag dropped - this is a bug");
            }
        }
        let Some(handler) = self.handler.upgrade() else {
            debug!(peer = %self.peer_addr, "connection closed after its handler was dropped");
            return;
        };

        handler.inner.connections.write().await
            .remove(&self.peer_addr);
        info!(role = %handler.role(), peer = %self.peer_addr, "connection closed");

        handler.inner.listener.on_socket_closed(&handler, self.peer_addr).await;
    }
}
