//! A bidirectional packet transport over TCP.
//!
//! A [host::Host] accepts connections from many peers, a [client::Client] holds exactly one
//!  connection to a host. Both exchange typed packets with their peers through a
//!  [handler::PacketHandler] and keep idle connections alive with periodic heartbeats.
//!
//! Application code plugs in at two seams: a [packet::PacketPayload] type defining the
//!  packets' serialized form, and a [handler::PacketListener] receiving connection and packet
//!  events. Channels and subscriptions are the plumbing underneath, applications do not need
//!  to touch them.

pub mod channel;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod handler;
mod heartbeat;
pub mod host;
pub mod packet;
pub mod test_util;
pub mod util;
pub mod worker;
