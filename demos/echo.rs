use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use clap::Parser;
use clap_derive::{Parser, Subcommand};
use packet_transport::client::Client;
use packet_transport::config::TransportConfig;
use packet_transport::handler::{PacketHandler, PacketListener};
use packet_transport::host::Host;
use packet_transport::packet::{PacketPayload, ReceivedPacket};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::runtime::Handle;
use tracing::{info, warn, Level};

#[derive(Parser)]
struct Args {
    #[clap(subcommand)]
    mode: Mode,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Mode {
    /// accept connections and echo every line back to its sender
    Host {
        #[clap(default_value = "127.0.0.1:4711")]
        bind_addr: SocketAddr,
    },
    /// send lines from stdin to a host and print what comes back
    Client {
        #[clap(default_value = "127.0.0.1:4711")]
        host_addr: SocketAddr,
    },
}

#[derive(Debug)]
struct Line(String);

impl PacketPayload for Line {
    fn ser(&self, buf: &mut BytesMut) {
        buf.put_slice(self.0.as_bytes());
    }

    fn deser(buf: &[u8]) -> anyhow::Result<Self> {
        Ok(Line(String::from_utf8(buf.to_vec())?))
    }
}

struct EchoListener;

#[async_trait]
impl PacketListener<Line> for EchoListener {
    async fn on_new_connection(&self, _handler: &PacketHandler<Line>, addr: SocketAddr) {
        info!("client {} connected", addr);
    }

    async fn on_packet_received(&self, handler: &PacketHandler<Line>, packet: ReceivedPacket<Line>) {
        info!("{}: {}", packet.origin(), packet.content().0);
        if let Err(e) = handler.write_packet(packet.origin(), packet.content()).await {
            warn!("unable to echo to {}: {}", packet.origin(), e);
        }
    }

    async fn on_socket_closed(&self, _handler: &PacketHandler<Line>, addr: SocketAddr) {
        info!("client {} disconnected", addr);
    }
}

struct PrintingListener;

#[async_trait]
impl PacketListener<Line> for PrintingListener {
    async fn on_new_connection(&self, _handler: &PacketHandler<Line>, addr: SocketAddr) {
        info!("connected to {}", addr);
    }

    async fn on_packet_received(&self, _handler: &PacketHandler<Line>, packet: ReceivedPacket<Line>) {
        println!("< {}", packet.content().0);
    }

    async fn on_socket_closed(&self, _handler: &PacketHandler<Line>, addr: SocketAddr) {
        info!("connection to {} closed", addr);
    }
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(if args.verbose { Level::DEBUG } else { Level::INFO })
        .try_init()
        .ok();

    match args.mode {
        Mode::Host { bind_addr } => run_host(bind_addr).await,
        Mode::Client { host_addr } => run_client(host_addr).await,
    }
}

async fn run_host(bind_addr: SocketAddr) -> anyhow::Result<()> {
    let host = Host::bind(bind_addr, TransportConfig::new(), Arc::new(EchoListener), Handle::current()).await?;
    info!("echo host listening on {} - press ctrl-c to stop", host.local_addr());

    tokio::signal::ctrl_c().await?;
    host.close().await
}

async fn run_client(host_addr: SocketAddr) -> anyhow::Result<()> {
    let client = Client::new(host_addr, TransportConfig::new(), Arc::new(PrintingListener), Handle::current())?;
    client.try_connect().await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if !client.is_connected().await {
            warn!("lost connection to host");
            break;
        }
        client.write_packet(&Line(line)).await?;
    }

    client.close().await
}
