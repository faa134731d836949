//! Async TCP transport.
//!
//! A `tokio::net::TcpStream` split into owned halves: the read half is
//! driven by the connection's dedicated read-loop task, the write half by
//! whichever task calls `commit`. Both halves share a [`DisconnectSignal`]
//! that fires exactly once, whichever side notices the socket is gone
//! first.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Notify;

use crate::error::RedisError;

/// Fires once, from whichever side (reader or writer) first observes the
/// connection is gone: a latch plus a notify, specialised to
/// per-connection transport teardown rather than process-wide shutdown.
#[derive(Default)]
pub struct DisconnectSignal {
    fired: AtomicBool,
    notify: Notify,
}

impl DisconnectSignal {
    pub fn fire(&self) {
        if !self.fired.swap(true, Ordering::SeqCst) {
            self.notify.notify_waiters();
        }
    }

    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    pub async fn wait(&self) {
        if self.is_fired() {
            return;
        }
        self.notify.notified().await;
    }
}

pub struct TransportReader {
    half: OwnedReadHalf,
    signal: Arc<DisconnectSignal>,
    read_buffer_size: usize,
}

pub struct TransportWriter {
    half: OwnedWriteHalf,
    signal: Arc<DisconnectSignal>,
}

/// Opens a TCP connection to `(host, port)`, bounded by `timeout` (zero
/// means infinite).
pub async fn connect(
    host: &str,
    port: u16,
    timeout: Duration,
    read_buffer_size: usize,
) -> crate::Result<(TransportReader, TransportWriter, Arc<DisconnectSignal>)> {
    let addr = format!("{host}:{port}");
    let stream = if timeout.is_zero() {
        TcpStream::connect(&addr).await?
    } else {
        tokio::time::timeout(timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| RedisError::Transport(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("connect to {addr} timed out"),
            )))??
    };
    stream.set_nodelay(true).ok();

    let signal = Arc::new(DisconnectSignal::default());
    let (read_half, write_half) = stream.into_split();
    Ok((
        TransportReader {
            half: read_half,
            signal: signal.clone(),
            read_buffer_size,
        },
        TransportWriter {
            half: write_half,
            signal: signal.clone(),
        },
        signal,
    ))
}

impl TransportReader {
    /// Reads whatever is available, up to `read_buffer_size` bytes.
    /// Returns `Ok(None)` on clean EOF. An I/O error fires the disconnect
    /// signal and is returned as [`RedisError::Transport`].
    pub async fn read_chunk(&mut self) -> crate::Result<Option<Bytes>> {
        let mut buf = BytesMut::zeroed(self.read_buffer_size);
        match self.half.read(&mut buf).await {
            Ok(0) => {
                self.signal.fire();
                Ok(None)
            }
            Ok(n) => {
                buf.truncate(n);
                Ok(Some(buf.freeze()))
            }
            Err(e) => {
                self.signal.fire();
                Err(RedisError::Transport(e))
            }
        }
    }
}

impl TransportWriter {
    /// Writes a whole, already-encoded buffer of commands. An I/O error
    /// fires the disconnect signal and is returned as
    /// [`RedisError::Transport`].
    pub async fn write_all(&mut self, bytes: &[u8]) -> crate::Result<()> {
        if let Err(e) = self.half.write_all(bytes).await {
            self.signal.fire();
            return Err(RedisError::Transport(e));
        }
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        !self.signal.is_fired()
    }
}
