//! Mailbox broker client speaking newline-delimited JSON over TCP.
//!
//! One connection is shared by every session of a client. Requests carry an
//! `id` echoed back in the reply; `message` events pushed by the broker are
//! routed to the subscription for their nameplate.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, oneshot};

use super::{MailboxBroker, MailboxMessage, Side};
use crate::code::Nameplate;
use crate::error::{Error, Result};

#[derive(Serialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BrokerRequest<'a> {
    Allocate { id: u64 },
    Open { id: u64, nameplate: u64, side: &'a str },
    Post { id: u64, nameplate: u64, side: &'a str, body: String },
    Subscribe { id: u64, nameplate: u64, side: &'a str },
    Release { id: u64, nameplate: u64, side: &'a str },
}

#[derive(Deserialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BrokerReply {
    Allocated { id: u64, nameplate: u64 },
    Ok { id: u64 },
    Error { id: u64, kind: String, detail: String },
    Message { nameplate: u64, side: String, body: String },
}

type Pending = Mutex<HashMap<u64, oneshot::Sender<BrokerReply>>>;
type Subscriptions = Mutex<HashMap<(u64, Side), mpsc::UnboundedSender<MailboxMessage>>>;

struct Connection {
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    pending: Pending,
    subscriptions: Subscriptions,
    next_id: AtomicU64,
    alive: std::sync::atomic::AtomicBool,
}

pub struct TcpBroker {
    addr: String,
    connection: tokio::sync::Mutex<Option<Arc<Connection>>>,
}

impl TcpBroker {
    pub fn new(addr: impl Into<String>) -> Self {
        TcpBroker { addr: addr.into(), connection: tokio::sync::Mutex::new(None) }
    }

    /// Current connection, dialling the broker if there is none or the last
    /// one died.
    async fn connection(&self) -> Result<Arc<Connection>> {
        let mut slot = self.connection.lock().await;
        if let Some(conn) = slot.as_ref() {
            if conn.alive.load(Ordering::Acquire) {
                return Ok(Arc::clone(conn));
            }
        }

        debug!("Connecting to mailbox broker at {}", self.addr);
        let stream = TcpStream::connect(&self.addr).await.map_err(Error::transport)?;
        let (read_half, write_half) = stream.into_split();
        let conn = Arc::new(Connection {
            writer: tokio::sync::Mutex::new(write_half),
            pending: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            alive: std::sync::atomic::AtomicBool::new(true),
        });
        tokio::spawn(read_replies(read_half, Arc::clone(&conn)));
        *slot = Some(Arc::clone(&conn));
        Ok(conn)
    }

    async fn call<'a>(&self, build: impl FnOnce(u64) -> BrokerRequest<'a>) -> Result<BrokerReply> {
        let conn = self.connection().await?;
        let id = conn.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        lock(&conn.pending).insert(id, tx);

        let mut line = serde_json::to_vec(&build(id)).map_err(|e| Error::protocol(e.to_string()))?;
        line.push(b'\n');
        {
            let mut writer = conn.writer.lock().await;
            if let Err(e) = writer.write_all(&line).await {
                lock(&conn.pending).remove(&id);
                conn.alive.store(false, Ordering::Release);
                return Err(Error::transport(e));
            }
        }

        let reply = rx.await.map_err(|_| {
            Error::transport(std::io::Error::new(
                std::io::ErrorKind::ConnectionAborted,
                "broker connection closed before replying",
            ))
        })?;
        match reply {
            BrokerReply::Error { kind, detail, .. } => Err(map_broker_error(&kind, detail)),
            other => Ok(other),
        }
    }
}

fn map_broker_error(kind: &str, detail: String) -> Error {
    match kind {
        "busy" | "crowded" => Error::NameplateBusy(detail),
        "not_found" | "expired" => Error::NameplateNotFound(detail),
        _ => Error::Protocol(format!("broker error {kind}: {detail}")),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Reader task: routes replies to their callers and pushed messages to
/// subscriptions until the broker hangs up.
async fn read_replies(read_half: OwnedReadHalf, conn: Arc<Connection>) {
    let mut lines = BufReader::new(read_half).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("Mailbox broker connection failed: {}", e);
                break;
            }
        };

        let reply: BrokerReply = match serde_json::from_str(&line) {
            Ok(reply) => reply,
            Err(e) => {
                warn!("Ignoring undecodable broker line: {}", e);
                continue;
            }
        };

        match reply {
            BrokerReply::Message { nameplate, side, body } => {
                let Ok(body) = hex::decode(&body) else {
                    warn!("Ignoring broker message with a non-hex body");
                    continue;
                };
                let subscriptions = lock(&conn.subscriptions);
                for ((np, _), tx) in subscriptions.iter() {
                    if *np == nameplate {
                        let _ = tx.send(MailboxMessage { side: side.clone(), body: body.clone() });
                    }
                }
            }
            other => {
                let id = match &other {
                    BrokerReply::Allocated { id, .. } | BrokerReply::Ok { id } | BrokerReply::Error { id, .. } => *id,
                    BrokerReply::Message { .. } => continue,
                };
                if let Some(tx) = lock(&conn.pending).remove(&id) {
                    let _ = tx.send(other);
                }
            }
        }
    }

    // Dropping the senders fails every waiter and ends every subscription.
    conn.alive.store(false, Ordering::Release);
    lock(&conn.pending).clear();
    lock(&conn.subscriptions).clear();
    debug!("Mailbox broker connection closed");
}

#[async_trait]
impl MailboxBroker for TcpBroker {
    async fn allocate_nameplate(&self) -> Result<Nameplate> {
        match self.call(|id| BrokerRequest::Allocate { id }).await? {
            BrokerReply::Allocated { nameplate, .. } => Nameplate::new(nameplate),
            other => Err(Error::protocol(format!("unexpected reply to allocate: {other:?}"))),
        }
    }

    async fn open(&self, nameplate: Nameplate, side: &Side) -> Result<()> {
        self.call(|id| BrokerRequest::Open { id, nameplate: nameplate.value(), side }).await?;
        Ok(())
    }

    async fn post(&self, nameplate: Nameplate, side: &Side, body: Vec<u8>) -> Result<()> {
        let body = hex::encode(body);
        self.call(|id| BrokerRequest::Post { id, nameplate: nameplate.value(), side, body }).await?;
        Ok(())
    }

    async fn subscribe(&self, nameplate: Nameplate, side: &Side) -> Result<mpsc::UnboundedReceiver<MailboxMessage>> {
        let conn = self.connection().await?;
        let (tx, rx) = mpsc::unbounded_channel();
        // Register before asking, so the backlog the broker replays is not lost.
        lock(&conn.subscriptions).insert((nameplate.value(), side.clone()), tx);
        if let Err(e) = self.call(|id| BrokerRequest::Subscribe { id, nameplate: nameplate.value(), side }).await {
            lock(&conn.subscriptions).remove(&(nameplate.value(), side.clone()));
            return Err(e);
        }
        Ok(rx)
    }

    async fn release(&self, nameplate: Nameplate, side: &Side) -> Result<()> {
        if let Some(conn) = self.connection.lock().await.as_ref() {
            lock(&conn.subscriptions).remove(&(nameplate.value(), side.clone()));
        }
        self.call(|id| BrokerRequest::Release { id, nameplate: nameplate.value(), side }).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_request_wire_format() {
        let request = BrokerRequest::Open { id: 3, nameplate: 7, side: "sender-01" };
        let json = serde_json::to_string(&request).unwrap();
        assert_eq!(json, r#"{"type":"open","id":3,"nameplate":7,"side":"sender-01"}"#);
    }

    #[test]
    fn test_reply_wire_format() {
        let reply: BrokerReply = serde_json::from_str(r#"{"type":"error","id":2,"kind":"busy","detail":"7"}"#).unwrap();
        assert!(matches!(reply, BrokerReply::Error { id: 2, .. }));
        let pushed: BrokerReply =
            serde_json::from_str(r#"{"type":"message","nameplate":7,"side":"a","body":"0102"}"#).unwrap();
        assert!(matches!(pushed, BrokerReply::Message { nameplate: 7, .. }));
    }

    #[test]
    fn test_broker_error_mapping() {
        assert!(matches!(map_broker_error("busy", "7".into()), Error::NameplateBusy(_)));
        assert!(matches!(map_broker_error("not_found", "7".into()), Error::NameplateNotFound(_)));
        assert!(matches!(map_broker_error("weird", "7".into()), Error::Protocol(_)));
    }

    /// Broker stub answering a fixed script, enough to drive the client.
    #[tokio::test]
    async fn test_allocate_and_pushed_message() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut lines = BufReader::new(read_half).lines();
            while let Some(line) = lines.next_line().await.unwrap() {
                let request: serde_json::Value = serde_json::from_str(&line).unwrap();
                let id = request["id"].as_u64().unwrap();
                let reply = match request["type"].as_str().unwrap() {
                    "allocate" => format!(r#"{{"type":"allocated","id":{id},"nameplate":42}}"#),
                    "subscribe" => format!(
                        "{}\n{}",
                        r#"{"type":"message","nameplate":42,"side":"peer","body":"cafe"}"#,
                        format_args!(r#"{{"type":"ok","id":{id}}}"#)
                    ),
                    _ => format!(r#"{{"type":"ok","id":{id}}}"#),
                };
                write_half.write_all(format!("{reply}\n").as_bytes()).await.unwrap();
            }
        });

        let broker = TcpBroker::new(addr.to_string());
        let nameplate = broker.allocate_nameplate().await.expect("Should allocate");
        assert_eq!(nameplate.value(), 42);

        let side = "me".to_string();
        broker.open(nameplate, &side).await.expect("Should open");
        let mut rx = broker.subscribe(nameplate, &side).await.expect("Should subscribe");
        let message = rx.recv().await.expect("Should receive pushed message");
        assert_eq!(message.side, "peer");
        assert_eq!(message.body, vec![0xca, 0xfe]);
        broker.release(nameplate, &side).await.expect("Should release");
    }
}
