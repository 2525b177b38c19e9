//! TCP plumbing between nodes.
//!
//! The listener and dialers hand raw streams to the manager, which registers
//! them in its `ConnectionTable`. Each registered stream gets a reader task
//! that decodes frames into `ConnEvent::Received` and a writer task fed by
//! an unbounded queue. Either side ending tears the connection down and the
//! reader reports `ConnEvent::Lost` exactly once.


use std::collections::HashMap;
use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::types::ConnId;
use crate::wire::{Payload, read_frame, write_frame};

/// ConnEvent is everything the connection layer reports to the manager.
#[derive(Debug)]
pub enum ConnEvent {
    Accepted {
        stream: TcpStream,
        peer: SocketAddr,
    },
    Dialed {
        stream: TcpStream,
        address: String,
    },
    DialFailed {
        address: String,
        error: String,
    },
    Received {
        conn: ConnId,
        payload: Payload,
    },
    Lost {
        conn: ConnId,
    },
}

/// ConnectionTable owns the outbound half of every live connection.
#[derive(Debug)]
pub struct ConnectionTable {
    next_id: u64,
    writers: HashMap<ConnId, mpsc::UnboundedSender<Payload>>,
    events: mpsc::Sender<ConnEvent>,
    shutdown: watch::Receiver<bool>,
}

impl ConnectionTable {
    #[must_use]
    pub fn new(events: mpsc::Sender<ConnEvent>, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            next_id: 1,
            writers: HashMap::new(),
            events,
            shutdown,
        }
    }

    /// `register` assigns a `ConnId` to `stream` and starts its tasks.
    pub fn register(&mut self, stream: TcpStream) -> ConnId {
        let conn = ConnId(self.next_id);
        self.next_id += 1;

        if let Err(err) = stream.set_nodelay(true) {
            debug!("conn: {conn} set_nodelay failed: {err}");
        }
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = oneshot::channel();

        tokio::spawn(run_writer(conn, write_half, rx, done_tx));
        tokio::spawn(run_reader(
            conn,
            read_half,
            self.events.clone(),
            done_rx,
            self.shutdown.clone(),
        ));

        self.writers.insert(conn, tx);
        conn
    }

    /// `send` queues `payload` on `conn`.
    ///
    /// # Errors
    /// Hands the payload back when the connection is unknown or closed.
    pub fn send(&self, conn: ConnId, payload: Payload) -> Result<(), Payload> {
        match self.writers.get(&conn) {
            Some(tx) => tx.send(payload).map_err(|err| err.0),
            None => Err(payload),
        }
    }

    /// `sender` clones the outbound queue of `conn` for tasks that stream
    /// payloads outside the manager.
    #[must_use]
    pub fn sender(&self, conn: ConnId) -> Option<mpsc::UnboundedSender<Payload>> {
        self.writers.get(&conn).cloned()
    }

    pub fn ids(&self) -> impl Iterator<Item = ConnId> + '_ {
        self.writers.keys().copied()
    }

    /// `close` drops the outbound queue, which stops the writer and then the
    /// reader.
    pub fn close(&mut self, conn: ConnId) {
        self.writers.remove(&conn);
    }

    pub fn close_all(&mut self) {
        self.writers.clear();
    }

    #[must_use]
    pub fn is_open(&self, conn: ConnId) -> bool {
        self.writers.contains_key(&conn)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.writers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.writers.is_empty()
    }
}

async fn run_writer(
    conn: ConnId,
    mut write_half: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Payload>,
    _done: oneshot::Sender<()>,
) {
    while let Some(payload) = rx.recv().await {
        if let Err(err) = write_frame(&mut write_half, &payload).await {
            warn!("conn: {conn} write failed: {err}");
            break;
        }
    }
    debug!("conn: {conn} writer stopped");
}

async fn run_reader(
    conn: ConnId,
    mut read_half: OwnedReadHalf,
    events: mpsc::Sender<ConnEvent>,
    mut writer_done: oneshot::Receiver<()>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            frame = read_frame(&mut read_half) => {
                match frame {
                    Ok(Some(payload)) => {
                        if events.send(ConnEvent::Received { conn, payload }).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => {
                        debug!("conn: {conn} closed by peer");
                        break;
                    }
                    Err(err) => {
                        warn!("conn: {conn} dropping connection: {err}");
                        break;
                    }
                }
            },
            _ = &mut writer_done => {
                debug!("conn: {conn} writer gone");
                break;
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            },
        }
    }
    let _ = events.send(ConnEvent::Lost { conn }).await;
}

/// `run_listener` accepts node-to-node connections until shutdown.
pub async fn run_listener(
    listener: TcpListener,
    events: mpsc::Sender<ConnEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        debug!("conn: accepted {peer}");
                        if events.send(ConnEvent::Accepted { stream, peer }).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => warn!("conn: accept failed: {err}"),
                }
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            },
        }
    }
    info!("conn: listener stopped");
}

/// `spawn_dial` connects to `address` in the background and reports the
/// outcome as `Dialed` or `DialFailed`.
pub fn spawn_dial(address: String, events: mpsc::Sender<ConnEvent>) {
    tokio::spawn(async move {
        let event = match TcpStream::connect(address.as_str()).await {
            Ok(stream) => ConnEvent::Dialed { stream, address },
            Err(err) => ConnEvent::DialFailed {
                address,
                error: err.to_string(),
            },
        };
        let _ = events.send(event).await;
    });
}
