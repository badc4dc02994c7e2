use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::select;
use tokio::sync::{watch, Mutex};
use tokio::time::timeout;
use tracing::{debug, info, info_span, trace, warn, Instrument, Span};

use crate::codec::{encode_frame, read_frame, write_frame, ReadError};
use crate::config::{ConnectionRole, TransportConfig};
use crate::error::UsageError;
use crate::packet::{Packet, PacketPayload, ReceivedPacket};


#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ConnectionState {
    Open,
    /// cancellation has begun: nothing is read or written any more
    Closing,
    /// the socket is closed and the subscriber was notified
    Closed,
}

/// The consuming side of a [ConnectionChannel]'s packet stream.
///
/// Delivery is pull based: the subscriber receives at most one packet per
///  [PacketSubscription::request], and it is the subscriber's responsibility to request the next
///  packet once it is ready for it.
#[async_trait]
pub trait PacketSubscriber<P: PacketPayload>: Send + Sync + 'static {
    /// called once when the subscription is established, before any packet is delivered
    async fn on_subscribe(&self, subscription: PacketSubscription<P>);

    async fn on_packet(&self, packet: ReceivedPacket<Packet<P>>);

    /// misuse of the subscription, e.g. an invalid request
    async fn on_error(&self, error: anyhow::Error);

    /// The connection is closed, there will be no further callbacks. This is called exactly once
    ///  per subscription, regardless of which side initiated the close.
    async fn on_complete(&self);
}


/// Owns a single TCP connection to a peer: it writes packets to the connection, and it reads
///  packets from it one at a time as requested by its (single) subscriber.
///
/// Reading and writing use separate halves of the socket and do not block each other. Writes
///  are serialized so that frames never interleave.
///
/// All paths that close the connection (explicit close, end of stream, read or write failure)
///  go through [PacketSubscription::cancel].
pub struct ConnectionChannel<P: PacketPayload> {
    shared: Arc<ChannelShared<P>>,
}

struct ChannelShared<P: PacketPayload> {
    peer_addr: SocketAddr,
    role: ConnectionRole,
    config: Arc<TransportConfig>,
    executor: Handle,
    span: Span,
    state: watch::Sender<ConnectionState>,
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    subscriber: OnceLock<Arc<dyn PacketSubscriber<P>>>,
    read_pending: AtomicBool,
}

impl<P: PacketPayload> ConnectionChannel<P> {
    /// Wrap an established connection. This fails if the stream is not connected.
    pub fn new(stream: TcpStream, role: ConnectionRole, config: Arc<TransportConfig>, executor: Handle) -> anyhow::Result<ConnectionChannel<P>> {
        let peer_addr = stream.peer_addr()
            .map_err(|e| anyhow!("expected an established connection: {}", e))?;
        if let Err(e) = stream.set_nodelay(config.tcp_nodelay) {
            warn!(%role, peer = %peer_addr, "unable to configure TCP_NODELAY: {}", e);
        }

        info!(%role, peer = %peer_addr, "opening connection");

        let (reader, writer) = stream.into_split();
        let (state, _) = watch::channel(ConnectionState::Open);

        Ok(ConnectionChannel {
            shared: Arc::new(ChannelShared {
                peer_addr,
                role,
                config,
                executor,
                span: info_span!("connection", %role, peer = %peer_addr),
                state,
                reader: Mutex::new(Some(reader)),
                writer: Mutex::new(Some(writer)),
                subscriber: OnceLock::new(),
                read_pending: AtomicBool::new(false),
            })
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.shared.peer_addr
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.shared.is_open()
    }

    /// Register the subscriber for this connection's packets. There can be only one subscriber
    ///  per channel: a second call is rejected (and the rejected subscriber is notified) without
    ///  affecting the existing subscription.
    pub async fn subscribe(&self, subscriber: Arc<dyn PacketSubscriber<P>>) -> anyhow::Result<PacketSubscription<P>> {
        if self.shared.subscriber.set(subscriber.clone()).is_err() {
            subscriber.on_error(UsageError::SubscriptionAlreadyActive.into()).await;
            return Err(UsageError::SubscriptionAlreadyActive.into());
        }

        let subscription = PacketSubscription {
            peer_addr: self.shared.peer_addr,
            channel: Arc::downgrade(&self.shared),
        };
        subscriber.on_subscribe(subscription.clone()).await;
        Ok(subscription)
    }

    pub async fn write_packet(&self, packet: &Packet<P>) -> anyhow::Result<()> {
        let frame = encode_frame(packet, self.shared.config.max_packet_size)?;
        self.write_encoded(&frame).await
    }

    /// Write a frame that was encoded by [crate::codec::encode_frame]. This allows encoding a
    ///  packet once for sending it to many connections.
    ///
    /// A failure to write is fatal to the connection: it is closed before this method returns
    ///  the error.
    pub async fn write_encoded(&self, frame: &Bytes) -> anyhow::Result<()> {
        let shared = &self.shared;

        let result = {
            let mut writer = shared.writer.lock().await;
            let writer = match writer.as_mut() {
                Some(w) if shared.is_open() => w,
                _ => return Err(UsageError::ConnectionClosed(shared.peer_addr).into()),
            };

            let mut state = shared.state.subscribe();
            select! {
                r = write_frame(writer, frame) => Some(r),
                _ = wait_until_closing(&mut state) => None,
            }
        };

        match result {
            Some(Ok(())) => {
                trace!(role = %shared.role, peer = %shared.peer_addr, "wrote packet of {} bytes", frame.len());
                Ok(())
            }
            Some(Err(e)) => {
                info!(role = %shared.role, peer = %shared.peer_addr, "error writing packet - closing connection: {}", e);
                shared.cancel_after_failure().await;
                Err(anyhow!("error writing packet to {}: {}", shared.peer_addr, e))
            }
            None => Err(UsageError::ConnectionClosed(shared.peer_addr).into()),
        }
    }

    /// Resolves once the connection is completely closed, i.e. after the subscriber was
    ///  notified.
    pub async fn closed(&self) {
        let mut state = self.shared.state.subscribe();
        let _ = state.wait_for(|s| *s == ConnectionState::Closed).await;
    }
}


/// The producing side's handle for a subscriber: it requests packets one at a time and cancels
///  the subscription, which closes the connection.
///
/// A subscription does not keep its channel alive.
#[derive(Debug)]
pub struct PacketSubscription<P: PacketPayload> {
    peer_addr: SocketAddr,
    channel: Weak<ChannelShared<P>>,
}
impl<P: PacketPayload> Clone for PacketSubscription<P> {
    fn clone(&self) -> Self {
        PacketSubscription {
            peer_addr: self.peer_addr,
            channel: self.channel.clone(),
        }
    }
}

impl<P: PacketPayload> PacketSubscription<P> {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn is_cancelled(&self) -> bool {
        match self.channel.upgrade() {
            Some(channel) => !channel.is_open(),
            None => true,
        }
    }

    /// Request the next packet. Only `n == 1` is supported - at most one read is outstanding at
    ///  any time, which preserves the order of packets.
    ///
    /// This returns immediately: the packet is read and delivered asynchronously. Errors are
    ///  reported asynchronously to the subscriber's [PacketSubscriber::on_error].
    pub fn request(&self, n: u64) {
        match self.channel.upgrade() {
            Some(channel) => channel.request(n),
            None => debug!(peer = %self.peer_addr, "request for a connection that no longer exists"),
        }
    }

    /// Close the connection. This fails if the connection is already closing or closed.
    ///
    /// When this returns successfully, the socket is closed and the subscriber was notified
    ///  through [PacketSubscriber::on_complete].
    pub async fn cancel(&self) -> anyhow::Result<()> {
        match self.channel.upgrade() {
            Some(channel) => channel.cancel().await,
            None => Err(UsageError::AlreadyClosing(self.peer_addr).into()),
        }
    }
}


impl<P: PacketPayload> ChannelShared<P> {
    fn is_open(&self) -> bool {
        *self.state.borrow() == ConnectionState::Open
    }

    fn request(self: Arc<Self>, n: u64) {
        let subscriber = match self.subscriber.get() {
            Some(s) => s.clone(),
            None => {
                warn!(role = %self.role, peer = %self.peer_addr, "request without subscriber - this is a bug");
                return;
            }
        };

        if n != 1 {
            self.report_error(subscriber, UsageError::InvalidRequest(n));
            return;
        }
        if !self.is_open() {
            self.report_error(subscriber, UsageError::SubscriptionCancelled);
            return;
        }
        if self.read_pending.swap(true, Ordering::AcqRel) {
            self.report_error(subscriber, UsageError::RequestAlreadyPending);
            return;
        }

        let span = self.span.clone();
        let executor = self.executor.clone();
        executor.spawn(self.read_and_deliver(subscriber).instrument(span));
    }

    fn report_error(&self, subscriber: Arc<dyn PacketSubscriber<P>>, e: UsageError) {
        debug!(role = %self.role, peer = %self.peer_addr, "reporting subscription error: {}", e);
        self.executor.spawn(async move {
            subscriber.on_error(e.into()).await;
        });
    }

    async fn read_and_deliver(self: Arc<Self>, subscriber: Arc<dyn PacketSubscriber<P>>) {
        let outcome = {
            let mut reader_guard = self.reader.lock().await;
            let outcome = match reader_guard.as_mut() {
                None => None,
                Some(reader) => {
                    let mut state = self.state.subscribe();
                    select! {
                        r = self.read_packet(reader) => Some(r),
                        _ = wait_until_closing(&mut state) => None,
                    }
                }
            };
            if outcome.is_none() {
                // the connection is closing: release the read half so the socket gets closed
                reader_guard.take();
            }
            outcome
        };

        // cleared before delivery so that the subscriber can request the next packet right away
        self.read_pending.store(false, Ordering::Release);

        match outcome {
            None => {
                debug!("read abandoned because the connection is closing");
            }
            Some(Ok(packet)) => {
                if self.is_open() {
                    trace!("received packet");
                    subscriber.on_packet(ReceivedPacket::new(self.peer_addr, packet)).await;
                }
                else {
                    debug!("discarding packet that was received while closing");
                }
            }
            Some(Err(ReadError::Closed(e))) => {
                if self.is_open() {
                    info!("connection closed by peer: {}", e);
                    self.cancel_after_failure().await;
                }
                else {
                    debug!("connection closed while reading: {}", e);
                }
            }
            Some(Err(ReadError::Failed(e))) => {
                if self.is_open() {
                    warn!("error reading packet - closing connection: {:#}", e);
                    self.cancel_after_failure().await;
                }
                else {
                    debug!("error reading packet while closing: {:#}", e);
                }
            }
        }
    }

    async fn read_packet(&self, reader: &mut OwnedReadHalf) -> Result<Packet<P>, ReadError> {
        let max_packet_size = self.config.max_packet_size;
        match self.config.read_idle_timeout {
            Some(idle_timeout) => {
                match timeout(idle_timeout, read_frame(reader, max_packet_size)).await {
                    Ok(result) => result,
                    Err(_) => Err(ReadError::Failed(anyhow!("nothing received for {:?}", idle_timeout))),
                }
            }
            None => read_frame(reader, max_packet_size).await,
        }
    }

    /// closing after a transport failure races with other ways of closing the connection, and
    ///  losing that race is fine
    async fn cancel_after_failure(&self) {
        if let Err(e) = self.cancel().await {
            debug!(role = %self.role, peer = %self.peer_addr, "connection was closed concurrently: {}", e);
        }
    }

    async fn cancel(&self) -> anyhow::Result<()> {
        let mut was_open = false;
        self.state.send_if_modified(|state| {
            if *state != ConnectionState::Open {
                return false;
            }
            *state = ConnectionState::Closing;
            was_open = true;
            true
        });
        if !was_open {
            return Err(UsageError::AlreadyClosing(self.peer_addr).into());
        }

        async {
            info!("closing connection");

            // pending reads and writes see the state change and release their half of the socket
            if let Some(mut writer) = self.writer.lock().await.take() {
                if let Err(e) = writer.shutdown().await {
                    debug!("error shutting down the connection: {}", e);
                }
            }
            drop(self.reader.lock().await.take());

            match self.subscriber.get() {
                Some(subscriber) => subscriber.on_complete().await,
                None => debug!("connection closed before it was subscribed"),
            }

            self.state.send_replace(ConnectionState::Closed);
            debug!("connection closed");
        }
            .instrument(self.span.clone())
            .await;

        Ok(())
    }
}

async fn wait_until_closing(state: &mut watch::Receiver<ConnectionState>) {
    // an error means the channel is gone, which is as closed as it gets
    let _ = state.wait_for(|s| *s != ConnectionState::Open).await;
}


#[cfg(test)]
mod tests {
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::sync::mpsc;
    use crate::test_util::{tcp_pair, TestPayload};
    use super::*;

    #[derive(Debug)]
    enum Event {
        Packet(ReceivedPacket<Packet<TestPayload>>),
        Error(Option<UsageError>),
        Complete,
    }

    /// forwards all callbacks to a channel, never requesting packets on its own
    struct CollectingSubscriber {
        subscription: OnceLock<PacketSubscription<TestPayload>>,
        events: mpsc::UnboundedSender<Event>,
    }
    impl CollectingSubscriber {
        fn new() -> (Arc<CollectingSubscriber>, mpsc::UnboundedReceiver<Event>) {
            let (events, recv) = mpsc::unbounded_channel();
            (Arc::new(CollectingSubscriber { subscription: OnceLock::new(), events }), recv)
        }

        fn subscription(&self) -> &PacketSubscription<TestPayload> {
            self.subscription.get().unwrap()
        }
    }

    #[async_trait]
    impl PacketSubscriber<TestPayload> for CollectingSubscriber {
        async fn on_subscribe(&self, subscription: PacketSubscription<TestPayload>) {
            assert!(self.subscription.set(subscription).is_ok());
        }
        async fn on_packet(&self, packet: ReceivedPacket<Packet<TestPayload>>) {
            let _ = self.events.send(Event::Packet(packet));
        }
        async fn on_error(&self, error: anyhow::Error) {
            let _ = self.events.send(Event::Error(error.downcast_ref::<UsageError>().cloned()));
        }
        async fn on_complete(&self) {
            let _ = self.events.send(Event::Complete);
        }
    }

    fn test_config() -> Arc<TransportConfig> {
        Arc::new(TransportConfig {
            read_idle_timeout: None,
            ..TransportConfig::new()
        })
    }

    async fn subscribed_channel() -> (ConnectionChannel<TestPayload>, Arc<CollectingSubscriber>, mpsc::UnboundedReceiver<Event>, TcpStream) {
        let (local, remote) = tcp_pair().await;
        let channel = ConnectionChannel::new(local, ConnectionRole::Host, test_config(), Handle::current()).unwrap();
        let (subscriber, events) = CollectingSubscriber::new();
        channel.subscribe(subscriber.clone()).await.unwrap();
        (channel, subscriber, events, remote)
    }

    async fn send_raw(stream: &mut TcpStream, packet: Packet<TestPayload>) {
        let frame = encode_frame(&packet, 1024).unwrap();
        stream.write_all(&frame).await.unwrap();
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<Event>) -> Event {
        timeout(Duration::from_secs(5), events.recv()).await
            .expect("timeout waiting for event")
            .expect("event channel closed")
    }

    async fn assert_no_event(events: &mut mpsc::UnboundedReceiver<Event>) {
        if let Ok(evt) = timeout(Duration::from_millis(200), events.recv()).await {
            panic!("unexpected event {:?}", evt);
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_one_packet_per_request() {
        let (channel, subscriber, mut events, mut remote) = subscribed_channel().await;
        for s in ["a", "b", "c"] {
            send_raw(&mut remote, Packet::Payload(TestPayload::new(s))).await;
        }

        // nothing is delivered without a request
        assert_no_event(&mut events).await;

        for expected in ["a", "b", "c"] {
            subscriber.subscription().request(1);
            match next_event(&mut events).await {
                Event::Packet(p) => {
                    assert_eq!(p.content(), &Packet::Payload(TestPayload::new(expected)));
                    assert_eq!(p.origin(), channel.peer_addr());
                    assert_eq!(p.origin(), remote.local_addr().unwrap());
                }
                other => panic!("unexpected {:?}", other),
            }
            assert_no_event(&mut events).await;
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_heartbeats_are_delivered_to_subscriber() {
        let (_channel, subscriber, mut events, mut remote) = subscribed_channel().await;
        send_raw(&mut remote, Packet::Heartbeat).await;

        subscriber.subscription().request(1);
        match next_event(&mut events).await {
            Event::Packet(p) => assert!(p.content().is_heartbeat()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[rstest::rstest]
    #[case::zero(0)]
    #[case::two(2)]
    #[case::many(u64::MAX)]
    #[tokio::test(flavor = "multi_thread")]
    async fn test_invalid_request(#[case] n: u64) {
        let (channel, subscriber, mut events, mut remote) = subscribed_channel().await;
        send_raw(&mut remote, Packet::Payload(TestPayload::new("x"))).await;

        subscriber.subscription().request(n);
        match next_event(&mut events).await {
            Event::Error(e) => assert_eq!(e, Some(UsageError::InvalidRequest(n))),
            other => panic!("unexpected {:?}", other),
        }
        assert_no_event(&mut events).await;
        assert!(channel.is_open());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_request_while_pending() {
        let (_channel, subscriber, mut events, mut remote) = subscribed_channel().await;

        subscriber.subscription().request(1);
        subscriber.subscription().request(1);
        match next_event(&mut events).await {
            Event::Error(e) => assert_eq!(e, Some(UsageError::RequestAlreadyPending)),
            other => panic!("unexpected {:?}", other),
        }

        send_raw(&mut remote, Packet::Payload(TestPayload::new("x"))).await;
        assert!(matches!(next_event(&mut events).await, Event::Packet(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_subscribe_twice() {
        let (channel, subscriber, mut events, _remote) = subscribed_channel().await;

        let (second, mut second_events) = CollectingSubscriber::new();
        let e = channel.subscribe(second.clone()).await.unwrap_err();
        assert_eq!(e.downcast_ref::<UsageError>(), Some(&UsageError::SubscriptionAlreadyActive));
        match next_event(&mut second_events).await {
            Event::Error(e) => assert_eq!(e, Some(UsageError::SubscriptionAlreadyActive)),
            other => panic!("unexpected {:?}", other),
        }
        assert!(second.subscription.get().is_none());

        // the first subscription is unaffected
        assert!(!subscriber.subscription().is_cancelled());
        assert_no_event(&mut events).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cancel_closes_socket() {
        let (channel, subscriber, mut events, mut remote) = subscribed_channel().await;

        subscriber.subscription().cancel().await.unwrap();
        assert!(matches!(next_event(&mut events).await, Event::Complete));
        assert_eq!(channel.state(), ConnectionState::Closed);
        assert!(subscriber.subscription().is_cancelled());

        let mut buf = [0u8; 16];
        assert_eq!(remote.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cancel_twice() {
        let (channel, subscriber, mut events, _remote) = subscribed_channel().await;

        subscriber.subscription().cancel().await.unwrap();
        let e = subscriber.subscription().cancel().await.unwrap_err();
        assert_eq!(e.downcast_ref::<UsageError>(), Some(&UsageError::AlreadyClosing(channel.peer_addr())));

        assert!(matches!(next_event(&mut events).await, Event::Complete));
        assert_no_event(&mut events).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cancel_with_pending_read() {
        let (channel, subscriber, mut events, _remote) = subscribed_channel().await;

        subscriber.subscription().request(1);
        tokio::time::sleep(Duration::from_millis(50)).await;

        subscriber.subscription().cancel().await.unwrap();
        assert!(matches!(next_event(&mut events).await, Event::Complete));
        assert_no_event(&mut events).await;
        channel.closed().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_request_after_cancel() {
        let (_channel, subscriber, mut events, _remote) = subscribed_channel().await;

        subscriber.subscription().cancel().await.unwrap();
        assert!(matches!(next_event(&mut events).await, Event::Complete));

        subscriber.subscription().request(1);
        match next_event(&mut events).await {
            Event::Error(e) => assert_eq!(e, Some(UsageError::SubscriptionCancelled)),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_peer_close_cancels() {
        let (channel, subscriber, mut events, remote) = subscribed_channel().await;

        subscriber.subscription().request(1);
        drop(remote);

        assert!(matches!(next_event(&mut events).await, Event::Complete));
        channel.closed().await;
        assert!(subscriber.subscription().is_cancelled());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_garbage_from_peer_closes_connection() {
        let (channel, subscriber, mut events, mut remote) = subscribed_channel().await;

        remote.write_all(b"\0\0\0\x03\x42xy").await.unwrap();
        subscriber.subscription().request(1);

        assert!(matches!(next_event(&mut events).await, Event::Complete));
        channel.closed().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_idle_timeout_closes_connection() {
        let (local, _remote) = tcp_pair().await;
        let config = Arc::new(TransportConfig {
            heartbeat_interval: Duration::from_millis(50),
            read_idle_timeout: Some(Duration::from_millis(200)),
            ..TransportConfig::new()
        });
        let channel = ConnectionChannel::<TestPayload>::new(local, ConnectionRole::Client, config, Handle::current()).unwrap();
        let (subscriber, mut events) = CollectingSubscriber::new();
        channel.subscribe(subscriber.clone()).await.unwrap();

        subscriber.subscription().request(1);
        assert!(matches!(next_event(&mut events).await, Event::Complete));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_write_packet() {
        let (channel, _subscriber, _events, mut remote) = subscribed_channel().await;

        channel.write_packet(&Packet::Payload(TestPayload::new("hi"))).await.unwrap();
        channel.write_packet(&Packet::Heartbeat).await.unwrap();

        let mut buf = [0u8; 12];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"\0\0\0\x03\x01hi\0\0\0\x01\0");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_write_to_closed_channel() {
        let (channel, subscriber, _events, _remote) = subscribed_channel().await;
        subscriber.subscription().cancel().await.unwrap();

        let e = channel.write_packet(&Packet::Heartbeat).await.unwrap_err();
        assert_eq!(e.downcast_ref::<UsageError>(), Some(&UsageError::ConnectionClosed(channel.peer_addr())));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_write_failure_closes_connection() {
        let (channel, _subscriber, mut events, remote) = subscribed_channel().await;
        drop(remote);

        // the first writes may still be buffered locally, the peer's reset shows up eventually
        for _ in 0..100 {
            if channel.write_packet(&Packet::Payload(TestPayload::new("x"))).await.is_err() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(matches!(next_event(&mut events).await, Event::Complete));
        assert!(!channel.is_open());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_oversized_packet_is_rejected_without_closing() {
        let (local, _remote) = tcp_pair().await;
        let config = Arc::new(TransportConfig {
            max_packet_size: 4,
            ..TransportConfig::new()
        });
        let channel = ConnectionChannel::<TestPayload>::new(local, ConnectionRole::Host, config, Handle::current()).unwrap();

        assert!(channel.write_packet(&Packet::Payload(TestPayload::new("too long"))).await.is_err());
        assert!(channel.is_open());
        channel.write_packet(&Packet::Payload(TestPayload::new("ok"))).await.unwrap();
    }
}
