//! Utilities for testing code that is based on this crate's transport. They are used for testing
//!  the transport itself, but they are also exported for application testing, which is why
//!  they are part of the crate's regular (non-#[cfg(test)]) code.

pub mod listener;
pub mod net;
pub mod payload;

pub use listener::{ListenerEvent, RecordingListener};
pub use net::{tcp_pair, unused_local_addr};
pub use payload::TestPayload;
