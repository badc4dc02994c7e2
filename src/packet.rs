use std::fmt::Debug;
use std::net::SocketAddr;

use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};


/// Application defined packet content. The transport does not interpret payloads, it only
///  asks them to serialize themselves into a buffer and to deserialize from the exact bytes
///  that were written.
///
/// Both sides of a connection must agree on the payload type.
pub trait PacketPayload: Debug + Send + Sync + 'static {
    fn ser(&self, buf: &mut BytesMut);

    /// `buf` contains exactly the bytes that [PacketPayload::ser] wrote on the sending side
    fn deser(buf: &[u8]) -> anyhow::Result<Self> where Self: Sized;
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
enum PacketTag {
    /// reserved for heartbeats, which have no payload
    Heartbeat = 0,
    Payload = 1,
}

/// A packet as it travels between peers: either an application payload or a heartbeat.
///  Heartbeats exist only to keep idle connections from timing out, they are consumed by the
///  transport and never reach the application.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Packet<P> {
    Heartbeat,
    Payload(P),
}

impl<P: PacketPayload> Packet<P> {
    pub fn is_heartbeat(&self) -> bool {
        matches!(self, Packet::Heartbeat)
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        match self {
            Packet::Heartbeat => buf.put_u8(PacketTag::Heartbeat.into()),
            Packet::Payload(payload) => Self::ser_payload(payload, buf),
        }
    }

    /// serialize a payload the way [Packet::Payload] would, without having to take ownership
    ///  of it
    pub fn ser_payload(payload: &P, buf: &mut BytesMut) {
        buf.put_u8(PacketTag::Payload.into());
        payload.ser(buf);
    }

    pub fn deser(buf: &[u8]) -> anyhow::Result<Packet<P>> {
        let mut buf = buf;
        if !buf.has_remaining() {
            bail!("empty packet");
        }

        let tag = PacketTag::try_from(buf.get_u8())
            .map_err(|e| anyhow!("invalid packet discriminator {}", e.number))?;

        match tag {
            PacketTag::Heartbeat => {
                if buf.has_remaining() {
                    bail!("heartbeat packet with {} unexpected trailing bytes", buf.remaining());
                }
                Ok(Packet::Heartbeat)
            }
            PacketTag::Payload => Ok(Packet::Payload(P::deser(buf)?)),
        }
    }
}


/// A packet (or its content) together with the address of the peer it was received from.
///
/// The origin is stamped locally when a packet is read from a connection - it is not part of
///  the wire format. It is fixed at construction, there is no way to change it afterwards.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ReceivedPacket<T> {
    origin: SocketAddr,
    content: T,
}

impl<T> ReceivedPacket<T> {
    pub(crate) fn new(origin: SocketAddr, content: T) -> ReceivedPacket<T> {
        ReceivedPacket {
            origin,
            content,
        }
    }

    pub fn origin(&self) -> SocketAddr {
        self.origin
    }

    pub fn content(&self) -> &T {
        &self.content
    }

    pub fn into_content(self) -> T {
        self.content
    }
}
