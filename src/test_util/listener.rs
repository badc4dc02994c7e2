use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::timeout;

use crate::handler::{PacketHandler, PacketListener};
use crate::packet::ReceivedPacket;
use crate::test_util::payload::TestPayload;

const WAIT_TIMEOUT: Duration = Duration::from_secs(5);


#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ListenerEvent {
    NewConnection(SocketAddr),
    Packet(ReceivedPacket<TestPayload>),
    SocketClosed(SocketAddr),
    BeforeClosed,
}

/// A [PacketListener] that records all callbacks, with helpers for waiting until expected
///  events have happened.
///
/// An echoing listener additionally sends every received payload back to where it came from.
pub struct RecordingListener {
    events: watch::Sender<Vec<ListenerEvent>>,
    echo: bool,
}

impl RecordingListener {
    pub fn new() -> RecordingListener {
        Self::create(false)
    }

    pub fn echoing() -> RecordingListener {
        Self::create(true)
    }

    fn create(echo: bool) -> RecordingListener {
        let (events, _) = watch::channel(Vec::new());
        RecordingListener { events, echo }
    }

    fn record(&self, event: ListenerEvent) {
        self.events.send_modify(|events| events.push(event));
    }

    pub fn events(&self) -> Vec<ListenerEvent> {
        self.events.borrow().clone()
    }

    /// returns recorded events, clearing the internal buffer
    pub fn take_events(&self) -> Vec<ListenerEvent> {
        let mut result = Vec::new();
        self.events.send_modify(|events| result = std::mem::take(events));
        result
    }

    pub fn received_packets(&self) -> Vec<ReceivedPacket<TestPayload>> {
        self.events.borrow().iter()
            .filter_map(|evt| match evt {
                ListenerEvent::Packet(p) => Some(p.clone()),
                _ => None,
            })
            .collect()
    }

    /// Wait until the recorded events satisfy a condition, panicking after a generous timeout.
    pub async fn wait_until(&self, description: &str, condition: impl Fn(&[ListenerEvent]) -> bool) {
        let mut events = self.events.subscribe();
        let satisfied = timeout(WAIT_TIMEOUT, async {
            let _ = events.wait_for(|events| condition(events.as_slice())).await;
        }).await;

        if satisfied.is_err() {
            panic!("timeout waiting for {} - events: {:?}", description, self.events());
        }
    }

    pub async fn wait_for_event(&self, event: ListenerEvent) {
        self.wait_until(&format!("{:?}", event), |events| events.contains(&event)).await;
    }

    pub async fn wait_for_packets(&self, num_packets: usize) {
        self.wait_until(&format!("{} packets", num_packets), |events| {
            events.iter()
                .filter(|evt| matches!(evt, ListenerEvent::Packet(_)))
                .count() >= num_packets
        }).await;
    }

    /// asserts that no packets beyond the expected number arrive within a short period
    pub async fn assert_no_further_packets(&self, num_received: usize) {
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(self.received_packets().len(), num_received, "{:?}", self.events());
    }
}

impl Default for RecordingListener {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PacketListener<TestPayload> for RecordingListener {
    async fn on_new_connection(&self, _handler: &PacketHandler<TestPayload>, addr: SocketAddr) {
        self.record(ListenerEvent::NewConnection(addr));
    }

    async fn on_packet_received(&self, handler: &PacketHandler<TestPayload>, packet: ReceivedPacket<TestPayload>) {
        self.record(ListenerEvent::Packet(packet.clone()));

        if self.echo {
            if let Err(e) = handler.write_packet(packet.origin(), packet.content()).await {
                tracing::debug!("unable to echo packet to {}: {}", packet.origin(), e);
            }
        }
    }

    async fn on_socket_closed(&self, _handler: &PacketHandler<TestPayload>, addr: SocketAddr) {
        self.record(ListenerEvent::SocketClosed(addr));
    }

    async fn on_before_closed(&self, _handler: &PacketHandler<TestPayload>) {
        self.record(ListenerEvent::BeforeClosed);
    }
}
