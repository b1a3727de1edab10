//! Transit relay server.
//!
//! Connections announce themselves with a [`RelayHello`]. A manager task owns
//! the table of waiting connections; when a connection arrives whose token
//! matches a waiting one of the opposite role, both get [`RELAY_PAIRED`] and
//! their bytes are spliced until either side hangs up. The relay never sees
//! the session key, only the token derived from it.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::error::Error;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt, Interest, copy_bidirectional};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, Receiver, Sender};

use crate::networking::RELAY_PAIRED;
use crate::utils::{RelayHello, Role};

const MAX_HELLO_LEN: u32 = 1024;
const HELLO_TIMEOUT: Duration = Duration::from_secs(10);
/// Parked connections older than this are dropped even if they look alive.
const MAX_PARK_TIME: Duration = Duration::from_secs(120);

pub struct Connection {
    pub stream: TcpStream,
    pub addr: SocketAddr,
    pub role: Role,
}

pub struct NewConnection {
    pub connection: Connection,
    pub token: [u8; 32],
}

pub enum Message {
    NewConnection(NewConnection),
}

struct Parked {
    connection: Connection,
    since: Instant,
}

pub struct ConnectionManager {
    waiting: HashMap<[u8; 32], Parked>,
    max_park: Duration,
    receiver_channel: Receiver<Message>,
}

impl ConnectionManager {
    pub fn new(receiver_channel: Receiver<Message>) -> Self {
        ConnectionManager { waiting: HashMap::new(), max_park: MAX_PARK_TIME, receiver_channel }
    }

    /// Park the connection, or pair it with the peer already parked under
    /// the same token. Returns the pair to splice, if any.
    pub fn pair_or_wait(&mut self, message: NewConnection) -> Option<(Connection, Connection)> {
        let NewConnection { connection, token } = message;
        match self.waiting.entry(token) {
            Entry::Vacant(entry) => {
                debug!("{} from {} waiting for its peer", connection.role, connection.addr);
                entry.insert(Parked { connection, since: Instant::now() });
                None
            }
            Entry::Occupied(entry) => {
                if entry.get().connection.role == connection.role {
                    warn!("Rejecting second {} from {} for the same token", connection.role, connection.addr);
                    return None;
                }
                let waiting = entry.remove().connection;
                Some((waiting, connection))
            }
        }
    }

    /// Forget parked connections whose client already gave up, or that have
    /// waited longer than `max_park` for a peer.
    async fn prune(&mut self) {
        let mut stale = Vec::new();
        for (token, parked) in &self.waiting {
            if parked.since.elapsed() >= self.max_park || !is_connection_alive(&parked.connection.stream).await {
                stale.push(*token);
            }
        }
        for token in stale {
            if let Some(parked) = self.waiting.remove(&token) {
                debug!("Dropping stale {} from {}", parked.connection.role, parked.connection.addr);
            }
        }
    }
}

/// A parked connection has nothing to say until it is paired, so readable
/// data or EOF both mean it is no longer usable.
async fn is_connection_alive(stream: &TcpStream) -> bool {
    match tokio::time::timeout(Duration::ZERO, stream.ready(Interest::READABLE)).await {
        Err(_) => true,
        Ok(Ok(ready)) => !(ready.is_readable() || ready.is_read_closed()),
        Ok(Err(_)) => false,
    }
}

pub async fn relay_manager(mut manager: ConnectionManager) {
    while let Some(message) = manager.receiver_channel.recv().await {
        match message {
            Message::NewConnection(connection) => {
                manager.prune().await;
                if let Some((first, second)) = manager.pair_or_wait(connection) {
                    tokio::spawn(splice(first, second));
                }
            }
        }
    }
}

async fn splice(mut first: Connection, mut second: Connection) {
    for connection in [&mut first, &mut second] {
        if let Err(e) = connection.stream.write_u8(RELAY_PAIRED).await {
            warn!("Could not tell {} it was paired: {}", connection.addr, e);
            return;
        }
    }
    info!("Relaying between {} and {}", first.addr, second.addr);

    match copy_bidirectional(&mut first.stream, &mut second.stream).await {
        Ok((forward, backward)) => info!(
            "Relay session {} <-> {} ended after {} / {} bytes",
            first.addr, second.addr, forward, backward
        ),
        Err(e) => debug!("Relay session {} <-> {} ended: {}", first.addr, second.addr, e),
    }
}

async fn read_hello(stream: &mut TcpStream) -> Result<RelayHello, Box<dyn Error + Send + Sync>> {
    let length = stream.read_u32().await?;
    if length > MAX_HELLO_LEN {
        return Err(format!("hello of {length} bytes is too large").into());
    }
    let mut body = vec![0u8; length as usize];
    stream.read_exact(&mut body).await?;
    Ok(bincode::deserialize(&body)?)
}

pub async fn relay_new_connection(mut stream: TcpStream, addr: SocketAddr, manager_channel: Sender<Message>) {
    let hello = match tokio::time::timeout(HELLO_TIMEOUT, read_hello(&mut stream)).await {
        Ok(Ok(hello)) => hello,
        Ok(Err(e)) => {
            warn!("Invalid relay hello from {}: {}", addr, e);
            return;
        }
        Err(_) => {
            warn!("No relay hello from {} in time", addr);
            return;
        }
    };
    let _ = stream.set_nodelay(true);

    let message = NewConnection { connection: Connection { stream, addr, role: hello.role }, token: hello.token };
    if let Err(e) = manager_channel.send(Message::NewConnection(message)).await {
        warn!("Relay manager is gone: {}", e);
    }
}

/// Accept relay clients on `listener` forever.
pub async fn serve(listener: TcpListener) -> std::io::Result<()> {
    let (sender_channel, receiver_channel) = mpsc::channel::<Message>(100);
    tokio::spawn(relay_manager(ConnectionManager::new(receiver_channel)));

    loop {
        let (stream, addr) = listener.accept().await?;
        debug!("Relay client connected: {}", addr);
        tokio::spawn(relay_new_connection(stream, addr, sender_channel.clone()));
    }
}
