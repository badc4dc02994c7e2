use std::fmt::{Display, Formatter};
use std::time::Duration;

use anyhow::bail;


/// The side of a connection that a packet handler acts on. This is used for diagnostics: all
///  log output of a handler carries its role.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum ConnectionRole {
    Host,
    Client,
}
impl Display for ConnectionRole {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionRole::Host => write!(f, "HOST"),
            ConnectionRole::Client => write!(f, "CLIENT"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Interval between two heartbeats sent on an otherwise idle connection. This must be
    ///  comfortably shorter than the peer's [TransportConfig::read_idle_timeout].
    pub heartbeat_interval: Duration,

    /// Upper bound for a client's connection attempt
    pub connect_timeout: Duration,

    /// A connection that does not receive anything (not even a heartbeat) for this long is
    ///  considered broken and closed. `None` waits forever.
    pub read_idle_timeout: Option<Duration>,

    /// Maximum length of a single encoded packet, excluding the four byte length prefix. This
    ///  is checked both before sending and on receipt, i.e. a peer sending a bigger packet
    ///  gets disconnected.
    pub max_packet_size: usize,

    pub tcp_nodelay: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportConfig {
    pub const MAX_SUPPORTED_PACKET_SIZE: usize = u32::MAX as usize;

    pub fn new() -> TransportConfig {
        TransportConfig {
            heartbeat_interval: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            read_idle_timeout: Some(Duration::from_secs(15)),
            max_packet_size: 16*1024*1024,
            tcp_nodelay: true,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.heartbeat_interval.is_zero() {
            bail!("heartbeat interval must be greater than zero");
        }
        if self.connect_timeout.is_zero() {
            bail!("connect timeout must be greater than zero");
        }
        if let Some(read_idle_timeout) = self.read_idle_timeout {
            if read_idle_timeout.is_zero() {
                bail!("read idle timeout must be greater than zero");
            }
            if read_idle_timeout <= self.heartbeat_interval {
                bail!("read idle timeout ({:?}) must be longer than the heartbeat interval ({:?})", read_idle_timeout, self.heartbeat_interval);
            }
        }
        if self.max_packet_size == 0 {
            bail!("max packet size must be greater than zero");
        }
        if self.max_packet_size > Self::MAX_SUPPORTED_PACKET_SIZE {
            bail!("max packet size {} exceeds the maximum that can be encoded ({})", self.max_packet_size, Self::MAX_SUPPORTED_PACKET_SIZE);
        }
        Ok(())
    }
}
