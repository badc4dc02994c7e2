use std::net::SocketAddr;

use thiserror::Error;


/// Misuse of the transport's API by its caller. These are programming errors rather than
///  transport failures: they are reported to the offending caller and never cause a
///  connection to be torn down.
///
/// They travel inside [anyhow::Error] like all other failures, so callers that need to
///  distinguish them use `err.downcast_ref::<UsageError>()`.
#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum UsageError {
    #[error("unknown connection {0}")]
    UnknownConnection(SocketAddr),
    #[error("there is already an active subscription")]
    SubscriptionAlreadyActive,
    /// only single-unit pull requests are supported
    #[error("invalid request for {0} packets - only single packet requests are supported")]
    InvalidRequest(u64),
    #[error("there is already a pending request")]
    RequestAlreadyPending,
    #[error("the subscription was cancelled")]
    SubscriptionCancelled,
    #[error("connection to {0} is already closing")]
    AlreadyClosing(SocketAddr),
    #[error("connection to {0} is closed")]
    ConnectionClosed(SocketAddr),
    #[error("packet handler is closed")]
    HandlerClosed,
    #[error("there is already a connection to {0}")]
    DuplicateConnection(SocketAddr),
    #[error("worker {0} is already active")]
    WorkerAlreadyActive(&'static str),
    #[error("worker {0} is not active")]
    WorkerNotActive(&'static str),
    #[error("client is already connected to {0}")]
    AlreadyConnected(SocketAddr),
    #[error("client is not connected")]
    NotConnected,
}
