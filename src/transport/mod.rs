//! Point-to-point messaging over persistent TCP connections.
//!
//! Every connection carries newline terminated JSON records. A single reader task per
//! connection reads complete records in arrival order, decodes them and pushes them into the
//! owner's bounded event queue, so a slow owner applies backpressure to the socket rather than
//! piling up detached tasks. Writes go through a connection owned writer guarded by an async
//! mutex, so each `send` writes exactly one whole record.
//!
//! Every connection first emits an `Opened` event carrying a handle to itself, and finally
//! exactly one `Closed` event, after which it delivers no more records.

mod message;
#[cfg(test)]
mod mod_test;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use uuid::Uuid;

use crate::error::TransportError;

pub use message::Message;

/// The maximum size of a single record.
const MAX_RECORD_BYTES: u64 = 16 * 1024 * 1024;

/// An event from a connection's reader.
#[derive(Debug)]
pub struct ConnectionEvent {
    /// The ID of the connection which produced this event.
    pub conn: Uuid,
    pub kind: ConnectionEventKind,
}

/// The kinds of events a connection produces.
#[derive(Debug)]
pub enum ConnectionEventKind {
    /// The connection is open. Always the first event of a connection.
    Opened(Connection),
    /// A record was received and decoded.
    Record(Message),
    /// The connection is closed, along with the error which closed it, if any.
    Closed(Option<TransportError>),
}

/// A handle to an open connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").field("id", &self.inner.id).field("peer", &self.inner.peer).finish()
    }
}

struct ConnectionInner {
    id: Uuid,
    peer: SocketAddr,
    /// The write half of the socket, `None` once the connection is closed.
    writer: Mutex<Option<BufWriter<OwnedWriteHalf>>>,
    /// A signal used to stop the reader task.
    closed: watch::Sender<bool>,
}

impl Connection {
    /// Take ownership of the given socket, spawning its reader task.
    ///
    /// Events from the reader are sent to `events` tagged with the new connection's ID.
    pub fn spawn(socket: TcpStream, events: mpsc::Sender<ConnectionEvent>) -> Result<Self, TransportError> {
        let peer = socket.peer_addr()?;
        socket.set_nodelay(true)?;
        let (read_half, write_half) = socket.into_split();
        let (closed, closed_rx) = watch::channel(false);
        let inner = Arc::new(ConnectionInner {
            id: Uuid::new_v4(),
            peer,
            writer: Mutex::new(Some(BufWriter::new(write_half))),
            closed,
        });
        tracing::debug!(conn = %inner.id, %peer, "connection opened");
        tokio::spawn(read_records(inner.clone(), read_half, events, closed_rx));
        Ok(Self { inner })
    }

    /// Open a connection to the given address.
    pub async fn connect(addr: &str, events: mpsc::Sender<ConnectionEvent>) -> Result<Self, TransportError> {
        let socket = TcpStream::connect(addr).await?;
        Self::spawn(socket, events)
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.inner.peer
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// Send a single message on this connection.
    ///
    /// Fails with `TransportError::Closed` once the connection has been closed. A write error
    /// closes the connection.
    pub async fn send(&self, msg: &Message) -> Result<(), TransportError> {
        let record = msg.encode()?;
        let mut writer = self.inner.writer.lock().await;
        let res = match writer.as_mut() {
            Some(writer) => write_record(writer, record.as_bytes()).await,
            None => return Err(TransportError::Closed),
        };
        if res.is_err() {
            writer.take();
            drop(writer);
            self.inner.closed.send_replace(true);
        }
        res
    }

    /// Close this connection, releasing the socket and stopping the reader.
    pub async fn close(&self) {
        self.inner.close().await;
    }
}

impl ConnectionInner {
    async fn close(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
            tracing::debug!(conn = %self.id, peer = %self.peer, "connection closed");
        }
        self.closed.send_replace(true);
    }
}

/// A bound socket accepting inbound connections.
pub struct Listener {
    inner: TcpListener,
}

impl Listener {
    /// Bind a listener to the given address.
    pub async fn bind(addr: &str) -> Result<Self, TransportError> {
        let inner = TcpListener::bind(addr).await?;
        Ok(Self { inner })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.inner.local_addr()?)
    }

    /// Accept the next inbound connection, sending its events to `events`.
    ///
    /// This method is cancellation safe.
    pub async fn accept(&self, events: mpsc::Sender<ConnectionEvent>) -> Result<Connection, TransportError> {
        let (socket, _) = self.inner.accept().await?;
        Connection::spawn(socket, events)
    }
}

async fn write_record(writer: &mut BufWriter<OwnedWriteHalf>, record: &[u8]) -> Result<(), TransportError> {
    writer.write_all(record).await?;
    writer.flush().await?;
    Ok(())
}

/// Read records from the given socket until it is closed, forwarding them as events.
async fn read_records(inner: Arc<ConnectionInner>, read_half: OwnedReadHalf, events: mpsc::Sender<ConnectionEvent>, mut closed: watch::Receiver<bool>) {
    let opened = ConnectionEvent {
        conn: inner.id,
        kind: ConnectionEventKind::Opened(Connection { inner: inner.clone() }),
    };
    if events.send(opened).await.is_err() {
        inner.close().await;
        return;
    }

    let mut reader = BufReader::new(read_half);
    let mut buf = Vec::with_capacity(1024);
    let reason = loop {
        buf.clear();
        let read_res = {
            let mut limited = (&mut reader).take(MAX_RECORD_BYTES);
            tokio::select! {
                read_res = limited.read_until(b'\n', &mut buf) => read_res,
                _ = closed.changed() => break None,
            }
        };
        match read_res {
            Ok(0) => break None,
            Ok(_) if buf.last() != Some(&b'\n') => {
                if buf.len() as u64 >= MAX_RECORD_BYTES {
                    break Some(TransportError::MalformedRecord(format!("record exceeds {} bytes", MAX_RECORD_BYTES)));
                }
                // The peer went away mid-record; partial records are never delivered.
                break Some(TransportError::Io(std::io::ErrorKind::UnexpectedEof.into()));
            }
            Ok(_) if buf.iter().all(u8::is_ascii_whitespace) => continue,
            Ok(_) => match Message::decode(&buf) {
                Ok(msg) => {
                    let event = ConnectionEvent {
                        conn: inner.id,
                        kind: ConnectionEventKind::Record(msg),
                    };
                    if events.send(event).await.is_err() {
                        break None;
                    }
                }
                Err(err) => break Some(err),
            },
            Err(err) => break Some(TransportError::Io(err)),
        }
    };

    if let Some(err) = &reason {
        tracing::debug!(conn = %inner.id, peer = %inner.peer, error = %err, "connection failed");
    }
    inner.close().await;
    let _ = events
        .send(ConnectionEvent {
            conn: inner.id,
            kind: ConnectionEventKind::Closed(reason),
        })
        .await;
}
