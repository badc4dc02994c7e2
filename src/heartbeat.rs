use std::net::SocketAddr;
use std::time::Duration;

use tokio::select;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info_span, Instrument};

use crate::handler::{PacketHandler, WeakPacketHandler};
use crate::packet::PacketPayload;


#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) enum HeartbeatTarget {
    /// every connection of the handler at the time of the heartbeat
    All,
    Single(SocketAddr),
}

/// Periodically send heartbeats until the handler is closed. The first heartbeat is sent
///  right away.
///
/// The task does not keep the handler alive, it terminates when the handler is dropped.
pub(crate) fn spawn_heartbeat<P: PacketPayload>(handler: &PacketHandler<P>, target: HeartbeatTarget) -> JoinHandle<()> {
    let span = info_span!("heartbeat", role = %handler.role());
    let interval = handler.config().heartbeat_interval;
    let closed = handler.closed_signal();

    handler.executor().spawn(
        do_heartbeat(handler.downgrade(), target, interval, closed)
            .instrument(span)
    )
}

async fn do_heartbeat<P: PacketPayload>(handler: WeakPacketHandler<P>, target: HeartbeatTarget, interval: Duration, mut closed: watch::Receiver<bool>) {
    debug!("starting heartbeat every {:?} to {:?}", interval, target);

    loop {
        if *closed.borrow() {
            break;
        }
        let Some(handler) = handler.upgrade() else {
            break;
        };

        let result = match target {
            HeartbeatTarget::All => handler.write_heartbeat_all().await,
            HeartbeatTarget::Single(addr) => handler.write_heartbeat(addr).await,
        };
        if let Err(e) = result {
            debug!("error sending heartbeat: {:#}", e);
        }
        drop(handler);

        select! {
            _ = sleep(interval) => {}
            _ = wait_until_closed(&mut closed) => break,
        }
    }

    debug!("heartbeat terminated");
}

async fn wait_until_closed(closed: &mut watch::Receiver<bool>) {
    // the handler being dropped counts as closed
    let _ = closed.wait_for(|closed| *closed).await;
}
