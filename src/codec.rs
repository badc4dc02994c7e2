//! Wire format: each packet is sent as a single frame
//!
//! ```ascii
//! 0: frame length (u32 BE) - number of bytes *after* this length field
//! 4: packet discriminator (u8) - 0 for heartbeat, 1 for application payload
//! 5: payload, serialized by the application (absent for heartbeats)
//! ```
//!
//! A single read consumes exactly one complete frame. The sender's address is not part of the
//!  frame, the receiving side stamps it based on the connection.

use std::io;
use std::io::ErrorKind;

use anyhow::{anyhow, bail};
use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::packet::{Packet, PacketPayload};
use crate::util::safe_converter::{PrecheckedCast, SafeCast};

const LEN_PREFIX_SIZE: usize = std::mem::size_of::<u32>();


/// Failure reading a frame. The distinction matters for the connection's lifecycle: a
///  [ReadError::Closed] is the expected outcome of the peer (or this side) closing the
///  connection, while [ReadError::Failed] means the stream is broken or the peer sent garbage.
#[derive(Error, Debug)]
pub enum ReadError {
    #[error("connection closed: {0}")]
    Closed(#[source] io::Error),
    #[error("{0:#}")]
    Failed(anyhow::Error),
}
impl From<io::Error> for ReadError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            ErrorKind::UnexpectedEof
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::NotConnected => ReadError::Closed(e),
            _ => ReadError::Failed(e.into()),
        }
    }
}

/// Serialize a packet into a complete frame including its length prefix. The result can be
///  written to any number of connections, which is what broadcasts do.
pub fn encode_frame<P: PacketPayload>(packet: &Packet<P>, max_packet_size: usize) -> anyhow::Result<Bytes> {
    encode_with(max_packet_size, |buf| packet.ser(buf))
}

/// Same as [encode_frame] for a [Packet::Payload], borrowing the payload
pub fn encode_payload_frame<P: PacketPayload>(payload: &P, max_packet_size: usize) -> anyhow::Result<Bytes> {
    encode_with(max_packet_size, |buf| Packet::ser_payload(payload, buf))
}

fn encode_with(max_packet_size: usize, ser: impl FnOnce(&mut BytesMut)) -> anyhow::Result<Bytes> {
    let mut buf = BytesMut::new();
    buf.put_u32(0); // placeholder, patched below
    ser(&mut buf);

    let packet_len = buf.len() - LEN_PREFIX_SIZE;
    if packet_len > max_packet_size {
        bail!("packet of {} bytes exceeds the configured maximum of {} bytes", packet_len, max_packet_size);
    }

    let packet_len: u32 = packet_len.prechecked_cast();
    buf[..LEN_PREFIX_SIZE].copy_from_slice(&packet_len.to_be_bytes());
    Ok(buf.freeze())
}

pub async fn write_frame(writer: &mut (impl AsyncWrite + Unpin), frame: &[u8]) -> io::Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await
}

/// Read exactly one frame and deserialize the packet in it.
///
/// NB: This is not cancellation safe - dropping the future halfway through a frame leaves the
///      stream at an undefined position. Callers only abandon a read when the connection is
///      being closed anyway.
pub async fn read_frame<P: PacketPayload>(reader: &mut (impl AsyncRead + Unpin), max_packet_size: usize) -> Result<Packet<P>, ReadError> {
    let mut len_buf = [0u8; LEN_PREFIX_SIZE];
    reader.read_exact(&mut len_buf).await?;

    let packet_len: usize = u32::from_be_bytes(len_buf).safe_cast();
    if packet_len > max_packet_size {
        return Err(ReadError::Failed(anyhow!("received a packet of {} bytes, exceeding the configured maximum of {} bytes", packet_len, max_packet_size)));
    }

    let mut packet_buf = vec![0u8; packet_len];
    reader.read_exact(&mut packet_buf).await?;

    Packet::deser(&packet_buf)
        .map_err(ReadError::Failed)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use tokio::io::duplex;
    use crate::test_util::TestPayload;
    use super::*;

    #[rstest]
    #[case::heartbeat(Packet::Heartbeat, b"\0\0\0\x01\0")]
    #[case::payload(Packet::Payload(TestPayload::new("hello")), b"\0\0\0\x06\x01hello")]
    fn test_encode_frame(#[case] packet: Packet<TestPayload>, #[case] expected: &[u8]) {
        let frame = encode_frame(&packet, 1024).unwrap();
        assert_eq!(frame.as_ref(), expected);
    }

    #[test]
    fn test_encode_payload_frame() {
        let payload = TestPayload::new("hello");
        assert_eq!(
            encode_payload_frame(&payload, 1024).unwrap(),
            encode_frame(&Packet::Payload(payload.clone()), 1024).unwrap(),
        );
    }

    #[test]
    fn test_encode_frame_too_big() {
        let packet = Packet::Payload(TestPayload::new("0123456789"));
        assert!(encode_frame(&packet, 10).is_err());
        assert!(encode_frame(&packet, 11).is_ok());
    }

    #[tokio::test]
    async fn test_frames_keep_their_boundaries() {
        let (mut a, mut b) = duplex(64);

        let writer = tokio::spawn(async move {
            for packet in [Packet::Payload(TestPayload::new("a")), Packet::Heartbeat, Packet::Payload(TestPayload::new("bcd"))] {
                let frame = encode_frame(&packet, 1024).unwrap();
                write_frame(&mut a, &frame).await.unwrap();
            }
        });

        assert_eq!(read_frame::<TestPayload>(&mut b, 1024).await.unwrap(), Packet::Payload(TestPayload::new("a")));
        assert_eq!(read_frame::<TestPayload>(&mut b, 1024).await.unwrap(), Packet::Heartbeat);
        assert_eq!(read_frame::<TestPayload>(&mut b, 1024).await.unwrap(), Packet::Payload(TestPayload::new("bcd")));
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_read_eof_is_closed() {
        let (a, mut b) = duplex(64);
        drop(a);

        match read_frame::<TestPayload>(&mut b, 1024).await {
            Err(ReadError::Closed(_)) => {}
            other => panic!("expected closed, was {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_read_eof_mid_frame_is_closed() {
        let (mut a, mut b) = duplex(64);
        a.write_all(b"\0\0\0\x05\x01ab").await.unwrap();
        drop(a);

        match read_frame::<TestPayload>(&mut b, 1024).await {
            Err(ReadError::Closed(_)) => {}
            other => panic!("expected closed, was {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_read_oversized_frame_fails() {
        let (mut a, mut b) = duplex(64);
        a.write_all(b"\0\0\x10\0").await.unwrap();

        match read_frame::<TestPayload>(&mut b, 1024).await {
            Err(ReadError::Failed(_)) => {}
            other => panic!("expected failure, was {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_read_garbage_fails() {
        let (mut a, mut b) = duplex(64);
        a.write_all(b"\0\0\0\x02\x09x").await.unwrap();

        match read_frame::<TestPayload>(&mut b, 1024).await {
            Err(ReadError::Failed(_)) => {}
            other => panic!("expected failure, was {:?}", other),
        }
    }

    #[rstest]
    #[case(ErrorKind::UnexpectedEof, true)]
    #[case(ErrorKind::ConnectionReset, true)]
    #[case(ErrorKind::ConnectionAborted, true)]
    #[case(ErrorKind::BrokenPipe, true)]
    #[case(ErrorKind::TimedOut, false)]
    #[case(ErrorKind::InvalidData, false)]
    fn test_io_error_classification(#[case] kind: ErrorKind, #[case] is_closed: bool) {
        let e: ReadError = io::Error::from(kind).into();
        assert_eq!(matches!(e, ReadError::Closed(_)), is_closed);
    }
}
