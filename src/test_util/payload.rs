use bytes::{BufMut, BytesMut};

use crate::packet::PacketPayload;


/// A payload consisting of a UTF-8 string. It is serialized as its raw bytes, so a frame's
///  content is easy to read in a test's expected bytes.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct TestPayload(pub String);

impl TestPayload {
    pub fn new(s: &str) -> TestPayload {
        TestPayload(s.to_string())
    }
}

impl PacketPayload for TestPayload {
    fn ser(&self, buf: &mut BytesMut) {
        buf.put_slice(self.0.as_bytes());
    }

    fn deser(buf: &[u8]) -> anyhow::Result<Self> {
        Ok(TestPayload(String::from_utf8(buf.to_vec())?))
    }
}
