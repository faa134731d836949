//! The pipelined duplex connection.
//!
//! Owns one outbound byte buffer (mutex-guarded, so `send` may be called
//! from any task) and a dedicated read-loop task that feeds the decoder and
//! forwards every reply — in wire order — to whoever is waiting on the
//! event channel returned by [`Connection::connect`]. That channel, drained
//! by exactly one task on the client side, is this crate's async stand-in
//! for "the transport's completion thread": it's what gives callers the
//! serial, submission-order delivery a pipelining client needs.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::codec::{encode_command, Decoder};
use crate::reply::Reply;
use crate::transport::{self, DisconnectSignal, TransportReader, TransportWriter};

/// Something the connection's read loop hands to its owner.
pub enum ConnEvent {
    Reply(Reply),
    /// The socket is gone, locally or peer-initiated. Fired exactly once.
    Disconnected,
}

pub struct Connection {
    outbound: Arc<Mutex<BytesMut>>,
    writer: Arc<AsyncMutex<TransportWriter>>,
    signal: Arc<DisconnectSignal>,
    read_task: JoinHandle<()>,
}

impl Connection {
    pub async fn connect(
        host: &str,
        port: u16,
        timeout: Duration,
        read_buffer_size: usize,
    ) -> crate::Result<(Connection, mpsc::UnboundedReceiver<ConnEvent>)> {
        let (reader, writer, signal) =
            transport::connect(host, port, timeout, read_buffer_size).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let read_task = tokio::spawn(read_loop(reader, tx, signal.clone()));

        Ok((
            Connection {
                outbound: Arc::new(Mutex::new(BytesMut::new())),
                writer: Arc::new(AsyncMutex::new(writer)),
                signal,
                read_task,
            },
            rx,
        ))
    }

    /// Encodes `argv` and appends it to the outbound buffer. Does not touch
    /// the network; call [`Connection::commit`] to flush. The outbound
    /// buffer only ever holds whole, already-encoded commands.
    pub fn send(&self, argv: &[Bytes]) {
        let encoded = encode_command(argv);
        let mut buf = self.outbound.lock().unwrap();
        buf.extend_from_slice(&encoded);
    }

    /// Atomically swaps out the outbound buffer and writes it in one call.
    /// Concurrent `send`s race only with each other for the buffer lock;
    /// the actual socket write is additionally serialised against other
    /// concurrent `commit`s so that two flushes can never interleave their
    /// bytes on the wire.
    pub async fn commit(&self) -> crate::Result<()> {
        let bytes = {
            let mut buf = self.outbound.lock().unwrap();
            std::mem::replace(&mut *buf, BytesMut::new())
        };
        if bytes.is_empty() {
            return Ok(());
        }
        let mut writer = self.writer.lock().await;
        writer.write_all(&bytes).await
    }

    pub fn is_connected(&self) -> bool {
        !self.signal.is_fired()
    }

    /// Forces the connection closed. The read loop's task is aborted and
    /// the disconnect signal fires if it hasn't already.
    pub async fn disconnect(&self) {
        self.signal.fire();
        self.read_task.abort();
    }
}

async fn read_loop(
    mut reader: TransportReader,
    tx: mpsc::UnboundedSender<ConnEvent>,
    signal: Arc<DisconnectSignal>,
) {
    let mut decoder = Decoder::new();
    loop {
        tokio::select! {
            _ = signal.wait() => {
                debug!("read loop observed external disconnect signal");
                break;
            }
            chunk = reader.read_chunk() => {
                match chunk {
                    Ok(Some(bytes)) => {
                        if let Err(e) = decoder.feed(&bytes) {
                            warn!(error = %e, "protocol error, tearing down connection");
                            signal.fire();
                            let _ = tx.send(ConnEvent::Disconnected);
                            break;
                        }
                        while let Some(reply) = decoder.pop() {
                            if tx.send(ConnEvent::Reply(reply)).is_err() {
                                return;
                            }
                        }
                    }
                    Ok(None) => {
                        debug!("peer closed the connection");
                        let _ = tx.send(ConnEvent::Disconnected);
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "transport read failed");
                        let _ = tx.send(ConnEvent::Disconnected);
                        break;
                    }
                }
            }
        }
    }
}
