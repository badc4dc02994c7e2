use std::net::{Ipv4Addr, SocketAddr};

use tokio::net::{TcpListener, TcpStream};


/// two ends of an established localhost connection
pub async fn tcp_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await
        .expect("unable to bind localhost listener");
    let addr = listener.local_addr()
        .expect("listener has no local address");

    let (connected, accepted) = tokio::join!(
        TcpStream::connect(addr),
        listener.accept(),
    );
    let connected = connected.expect("unable to connect to localhost listener");
    let (accepted, _) = accepted.expect("unable to accept localhost connection");
    (connected, accepted)
}

/// A localhost address that nobody listens on. The port was free when this function returned,
///  which is good enough for tests.
pub async fn unused_local_addr() -> SocketAddr {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await
        .expect("unable to bind localhost listener");
    listener.local_addr()
        .expect("listener has no local address")
}
