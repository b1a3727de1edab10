//! TCP implementation of [`Transport`].
//!
//! The sender binds one listener on all interfaces and advertises every
//! address the receiver might reach it at. Relayed connections send a
//! [`RelayHello`] and block until the relay reports the peer has arrived.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};

use async_trait::async_trait;
use log::debug;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};

use crate::error::{Error, Result};
use crate::transit::{ByteStream, DirectListener, Transport};
use crate::utils::{ConnectionHint, RelayHello};

/// Byte the relay writes once both peers with the same token are present.
pub const RELAY_PAIRED: u8 = 0x01;

pub fn create_reusable_socket(local_addr: SocketAddr) -> std::io::Result<TcpSocket> {
    let socket = match local_addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_reuseaddr(true)?;
    socket.bind(local_addr)?;
    Ok(socket)
}

/// Best guess at this host's LAN address: the source address the kernel would
/// pick for an outbound route. Nothing is actually sent.
fn local_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("192.0.2.1:9").ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_unspecified()).then_some(ip)
}

/// Write a length-prefixed bincode hello and wait for the paired byte.
pub async fn relay_handshake<S>(stream: &mut S, hello: &RelayHello) -> Result<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let encoded = bincode::serialize(hello)?;
    let length = u32::try_from(encoded.len()).map_err(|_| Error::protocol("relay hello too large"))?;
    stream.write_all(&length.to_be_bytes()).await.map_err(Error::transport)?;
    stream.write_all(&encoded).await.map_err(Error::transport)?;
    stream.flush().await.map_err(Error::transport)?;

    match stream.read_u8().await.map_err(Error::transport)? {
        RELAY_PAIRED => Ok(()),
        other => Err(Error::protocol(format!("relay answered with unexpected byte {other:#04x}"))),
    }
}

#[derive(Debug, Default, Clone)]
pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        TcpTransport
    }
}

struct TcpDirectListener {
    listener: TcpListener,
    hints: Vec<ConnectionHint>,
}

#[async_trait]
impl DirectListener for TcpDirectListener {
    fn hints(&self) -> Vec<ConnectionHint> {
        self.hints.clone()
    }

    async fn accept(&mut self) -> Result<ByteStream> {
        let (stream, addr) = self.listener.accept().await.map_err(Error::transport)?;
        debug!("Accepted direct connection from {}", addr);
        let _ = stream.set_nodelay(true);
        Ok(Box::new(stream))
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn listen(&self) -> Result<Box<dyn DirectListener>> {
        let socket = create_reusable_socket(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0))
            .map_err(Error::transport)?;
        let listener = socket.listen(64).map_err(Error::transport)?;
        let port = listener.local_addr().map_err(Error::transport)?.port();

        let mut hints = Vec::new();
        if let Some(ip) = local_ip() {
            hints.push(ConnectionHint::Tcp(SocketAddr::new(ip, port)));
        }
        hints.push(ConnectionHint::Tcp(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)));
        debug!("Listening for direct connections on port {} ({} hints)", port, hints.len());

        Ok(Box::new(TcpDirectListener { listener, hints }))
    }

    async fn connect(&self, hint: &ConnectionHint) -> Result<ByteStream> {
        match hint {
            ConnectionHint::Tcp(addr) => {
                let stream = TcpStream::connect(addr).await.map_err(Error::transport)?;
                let _ = stream.set_nodelay(true);
                Ok(Box::new(stream))
            }
            other => Err(Error::protocol(format!("TCP transport cannot dial {other:?}"))),
        }
    }

    async fn connect_relay(&self, relay: &str, hello: &RelayHello) -> Result<ByteStream> {
        let mut stream = TcpStream::connect(relay).await.map_err(Error::transport)?;
        debug!("Connected to relay {}, waiting for peer", relay);
        relay_handshake(&mut stream, hello).await?;
        let _ = stream.set_nodelay(true);
        Ok(Box::new(stream))
    }
}
