//! The pipelining client: FIFO callback matching, auth/select replay, and
//! automatic reconnection.
//!
//! `Client` is a cheap `Arc`-backed handle over [`Shared`] state: cloning
//! bumps a reference count, the real state lives behind a
//! `std::sync::Mutex` with no `.await` ever held across it, and a single
//! background task (spawned once, replaced across reconnects) is the async
//! stand-in for "the transport's completion thread": it delivers replies to
//! callbacks strictly in submission order.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, warn};

use crate::config::ClientConfig;
use crate::connection::{ConnEvent, Connection};
use crate::error::RedisError;
use crate::reply::Reply;

/// A completion callback. Always invoked exactly once: with a real reply,
/// a server error reply, or a network-error reply.
pub type ReplyCallback = Box<dyn FnOnce(Reply) + Send + 'static>;

/// Status passed to a [`DisconnectCallback`]. `Dropped` is the only status
/// this crate raises today, mirroring cpp_redis's `connect_state::dropped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectStatus {
    Dropped,
}

/// Notified on every transition into `Reconnecting` or `Disconnected`.
/// `Arc`-backed so the handler can be shared between the caller and the
/// background event loop without cloning its captured state.
pub type DisconnectCallback = Arc<dyn Fn(DisconnectStatus) + Send + Sync + 'static>;

fn noop_callback() -> ReplyCallback {
    Box::new(|_| {})
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

struct PendingCommand {
    argv: Vec<Bytes>,
    callback: ReplyCallback,
}

struct Inner {
    status: Status,
    connection: Option<Arc<Connection>>,
    pending: VecDeque<PendingCommand>,
    resubmit: VecDeque<PendingCommand>,
    auth_password: Option<Bytes>,
    selected_db: i64,
}

impl Inner {
    fn new() -> Self {
        Inner {
            status: Status::Disconnected,
            connection: None,
            pending: VecDeque::new(),
            resubmit: VecDeque::new(),
            auth_password: None,
            selected_db: 0,
        }
    }
}

struct Shared {
    host: String,
    port: u16,
    config: ClientConfig,
    inner: Mutex<Inner>,
    disc_cb: Option<DisconnectCallback>,
}

/// An async Redis client speaking the line-oriented RESP protocol over one
/// pipelined TCP connection.
#[derive(Clone)]
pub struct Client {
    shared: Arc<Shared>,
}

impl Client {
    /// Connects with default configuration (no auto-reconnect, no
    /// disconnect callback).
    pub async fn connect(host: impl Into<String>, port: u16) -> crate::Result<Client> {
        Client::connect_with_config(host, port, ClientConfig::default(), None).await
    }

    /// Connects with `config` and an optional `disc_cb`, invoked with
    /// `DisconnectStatus::Dropped` on every transition into `Reconnecting`
    /// or `Disconnected` (never on a clean, caller-initiated `disconnect`).
    pub async fn connect_with_config(
        host: impl Into<String>,
        port: u16,
        config: ClientConfig,
        disc_cb: Option<DisconnectCallback>,
    ) -> crate::Result<Client> {
        let host = host.into();
        let shared = Arc::new(Shared {
            host: host.clone(),
            port,
            config,
            inner: Mutex::new(Inner::new()),
            disc_cb,
        });

        {
            let mut inner = shared.inner.lock().unwrap();
            inner.status = Status::Connecting;
        }

        let connect_result = Connection::connect(
            &host,
            port,
            shared.config.connect_timeout,
            shared.config.read_buffer_size,
        )
        .await;

        let (conn, rx) = match connect_result {
            Ok(pair) => pair,
            Err(e) => {
                let mut inner = shared.inner.lock().unwrap();
                inner.status = Status::Disconnected;
                return Err(e);
            }
        };

        {
            let mut inner = shared.inner.lock().unwrap();
            inner.connection = Some(Arc::new(conn));
            inner.status = Status::Connected;
        }

        tokio::spawn(event_loop(shared.clone(), rx));

        info!(host = %host, port, "client connected");
        Ok(Client { shared })
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.shared.inner.lock().unwrap().status, Status::Connected)
    }

    /// Enqueues `argv` with its completion callback and forwards it to the
    /// connection. Returns `self` for fluent chaining
    /// (`client.send(..).send(..).commit()`).
    pub fn send(&self, argv: Vec<Bytes>, cb: Option<ReplyCallback>) -> &Self {
        let callback = cb.unwrap_or_else(noop_callback);
        let mut inner = self.shared.inner.lock().unwrap();
        match inner.status {
            Status::Connected => {
                let conn = inner
                    .connection
                    .clone()
                    .expect("Connected status implies a connection");
                inner.pending.push_back(PendingCommand {
                    argv: argv.clone(),
                    callback,
                });
                drop(inner);
                conn.send(&argv);
            }
            Status::Reconnecting | Status::Connecting => {
                inner.resubmit.push_back(PendingCommand { argv, callback });
            }
            Status::Disconnected => {
                drop(inner);
                callback(Reply::Error("ERR not connected".into()));
            }
        }
        self
    }

    /// Flushes the outbound buffer over the network. No-op while
    /// disconnected or reconnecting.
    pub async fn commit(&self) -> &Self {
        let conn = {
            let inner = self.shared.inner.lock().unwrap();
            inner.connection.clone()
        };
        if let Some(conn) = conn {
            if let Err(e) = conn.commit().await {
                warn!(error = %e, "commit failed, awaiting disconnect handling");
            }
        }
        self
    }

    /// Captures the currently pending callback set, flushes, then blocks
    /// until every captured callback has fired or `timeout` elapses. A
    /// `None` timeout waits forever. On timeout, unfulfilled callbacks are
    /// orphaned, not destroyed — they still fire whenever their reply
    /// eventually arrives.
    pub async fn sync_commit(&self, timeout: Option<Duration>) -> &Self {
        let remaining = Arc::new(AtomicUsize::new(0));
        let notify = Arc::new(Notify::new());

        {
            let mut inner = self.shared.inner.lock().unwrap();
            let count = inner.pending.len();
            if count > 0 {
                remaining.store(count, Ordering::SeqCst);
                for cmd in inner.pending.iter_mut() {
                    let remaining = remaining.clone();
                    let notify = notify.clone();
                    let original = std::mem::replace(&mut cmd.callback, noop_callback());
                    cmd.callback = Box::new(move |reply| {
                        original(reply);
                        if remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
                            notify.notify_one();
                        }
                    });
                }
            }
        }

        self.commit().await;

        if remaining.load(Ordering::SeqCst) == 0 {
            return self;
        }

        match timeout {
            Some(d) => {
                if tokio::time::timeout(d, notify.notified()).await.is_err() {
                    debug!("sync_commit timed out; callbacks remain pending");
                }
            }
            None => notify.notified().await,
        }

        self
    }

    /// Sends `AUTH password`. Remembers the password only after a
    /// successful reply, so it is replayed before any user command on
    /// reconnect.
    pub fn auth(&self, password: impl Into<Bytes>, cb: Option<ReplyCallback>) -> &Self {
        let password = password.into();
        let shared = self.shared.clone();
        let remembered = password.clone();
        let wrapped: ReplyCallback = Box::new(move |reply: Reply| {
            if !reply.is_error() {
                shared.inner.lock().unwrap().auth_password = Some(remembered);
            }
            if let Some(cb) = cb {
                cb(reply);
            }
        });
        self.send(vec![Bytes::from_static(b"AUTH"), password], Some(wrapped))
    }

    /// Sends `SELECT db`. Remembers the index only after a successful
    /// reply.
    pub fn select(&self, db: i64, cb: Option<ReplyCallback>) -> &Self {
        let shared = self.shared.clone();
        let wrapped: ReplyCallback = Box::new(move |reply: Reply| {
            if !reply.is_error() {
                shared.inner.lock().unwrap().selected_db = db;
            }
            if let Some(cb) = cb {
                cb(reply);
            }
        });
        self.send(
            vec![Bytes::from_static(b"SELECT"), Bytes::from(db.to_string())],
            Some(wrapped),
        )
    }

    /// Forces the client closed from any state, failing every pending
    /// callback with a network-error reply.
    pub async fn disconnect(&self) {
        let conn = {
            let mut inner = self.shared.inner.lock().unwrap();
            inner.status = Status::Disconnected;
            inner.connection.take()
        };
        if let Some(conn) = conn {
            conn.disconnect().await;
        }
        let failed = {
            let mut inner = self.shared.inner.lock().unwrap();
            let mut all: Vec<PendingCommand> = inner.pending.drain(..).collect();
            all.extend(inner.resubmit.drain(..));
            all
        };
        for cmd in failed {
            (cmd.callback)(Reply::network_error());
        }
    }
}

async fn event_loop(shared: Arc<Shared>, mut rx: mpsc::UnboundedReceiver<ConnEvent>) {
    loop {
        match rx.recv().await {
            Some(ConnEvent::Reply(reply)) => {
                let cmd = {
                    let mut inner = shared.inner.lock().unwrap();
                    inner.pending.pop_front()
                };
                match cmd {
                    Some(cmd) => (cmd.callback)(reply),
                    None => warn!("reply arrived with no matching pending command"),
                }
            }
            Some(ConnEvent::Disconnected) | None => match reconnect(&shared).await {
                Some(new_rx) => rx = new_rx,
                None => return,
            },
        }
    }
}

/// Drives the whole `Reconnecting` state: moves in-flight commands
/// out of `pending`, retries `connect` + auth/select replay up to policy,
/// and on success drains everything accepted in the meantime. Returns the
/// new connection's event receiver, or `None` if reconnection is disabled
/// or exhausted (in which case every pending callback has already been
/// failed with a network-error reply).
async fn reconnect(shared: &Arc<Shared>) -> Option<mpsc::UnboundedReceiver<ConnEvent>> {
    let (mut inflight, allowed) = {
        let mut inner = shared.inner.lock().unwrap();
        let inflight: Vec<PendingCommand> = inner.pending.drain(..).collect();
        inner.connection = None;
        let allowed = shared.config.reconnect_allowed();
        inner.status = if allowed {
            Status::Reconnecting
        } else {
            Status::Disconnected
        };
        (inflight, allowed)
    };
    notify_disconnect(shared);

    if !allowed {
        warn!("reconnect disabled by policy, failing all pending commands");
        inflight.extend(take_resubmit(shared));
        fail_all(inflight);
        return None;
    }

    warn!("connection dropped, entering reconnecting state");
    let mut attempts: i64 = 0;

    loop {
        if shared.config.attempt_exhausted(attempts) {
            error!(attempts, "reconnect attempts exhausted");
            inflight.extend(take_resubmit(shared));
            fail_all(inflight);
            shared.inner.lock().unwrap().status = Status::Disconnected;
            notify_disconnect(shared);
            return None;
        }
        attempts += 1;
        tokio::time::sleep(shared.config.retry_interval).await;

        match try_reconnect_once(shared).await {
            Ok((conn, rx)) => {
                let conn = Arc::new(conn);
                let combined: Vec<PendingCommand> =
                    inflight.drain(..).chain(take_resubmit(shared)).collect();

                let mut inner = shared.inner.lock().unwrap();
                inner.connection = Some(conn.clone());
                inner.status = Status::Connected;
                for cmd in combined {
                    conn.send(&cmd.argv);
                    inner.pending.push_back(cmd);
                }
                drop(inner);
                if let Err(e) = conn.commit().await {
                    warn!(error = %e, "failed to flush resubmitted commands");
                }
                info!(attempt = attempts, "reconnected successfully");
                return Some(rx);
            }
            Err(RedisError::Server(msg)) => {
                // Auth/select was rejected with the remembered credentials;
                // retrying with the same ones would only fail again, so
                // this is treated as fatal rather than one failed attempt.
                error!(error = %msg, "auth/select rejected during reconnect, giving up");
                inflight.extend(take_resubmit(shared));
                fail_all(inflight);
                shared.inner.lock().unwrap().status = Status::Disconnected;
                notify_disconnect(shared);
                return None;
            }
            Err(e) => {
                warn!(error = %e, attempt = attempts, "reconnect attempt failed");
            }
        }
    }
}

fn notify_disconnect(shared: &Arc<Shared>) {
    if let Some(cb) = &shared.disc_cb {
        cb(DisconnectStatus::Dropped);
    }
}

fn take_resubmit(shared: &Arc<Shared>) -> Vec<PendingCommand> {
    shared.inner.lock().unwrap().resubmit.drain(..).collect()
}

fn fail_all(commands: Vec<PendingCommand>) {
    for cmd in commands {
        (cmd.callback)(Reply::network_error());
    }
}

/// One connect attempt plus auth/select replay. auth-then-select is sent
/// and awaited directly against the fresh receiver, before the client's
/// normal FIFO dispatch loop ever sees this connection — guaranteeing no
/// user command can race ahead of them.
async fn try_reconnect_once(
    shared: &Arc<Shared>,
) -> crate::Result<(Connection, mpsc::UnboundedReceiver<ConnEvent>)> {
    let (conn, mut rx) = Connection::connect(
        &shared.host,
        shared.port,
        shared.config.connect_timeout,
        shared.config.read_buffer_size,
    )
    .await?;

    let (password, db) = {
        let inner = shared.inner.lock().unwrap();
        (inner.auth_password.clone(), inner.selected_db)
    };

    if let Some(password) = password {
        let reply =
            send_and_await(&conn, &mut rx, vec![Bytes::from_static(b"AUTH"), password]).await?;
        if reply.is_error() {
            return Err(RedisError::Server(reply.to_string()));
        }
    }

    if db != 0 {
        let reply = send_and_await(
            &conn,
            &mut rx,
            vec![Bytes::from_static(b"SELECT"), Bytes::from(db.to_string())],
        )
        .await?;
        if reply.is_error() {
            return Err(RedisError::Server(reply.to_string()));
        }
    }

    Ok((conn, rx))
}

async fn send_and_await(
    conn: &Connection,
    rx: &mut mpsc::UnboundedReceiver<ConnEvent>,
    argv: Vec<Bytes>,
) -> crate::Result<Reply> {
    conn.send(&argv);
    conn.commit().await?;
    loop {
        match rx.recv().await {
            Some(ConnEvent::Reply(reply)) => return Ok(reply),
            Some(ConnEvent::Disconnected) | None => return Err(RedisError::Network),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Accepts one connection, echoes back a canned reply for every full
    /// command it sees — good enough to assert FIFO ordering without a
    /// real server.
    async fn spawn_echo_server(replies: Vec<&'static [u8]>) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            for reply in replies {
                let _ = socket.read(&mut buf).await;
                let _ = socket.write_all(reply).await;
            }
            // Keep the socket open so later reads just park instead of EOFing.
            let mut sink = [0u8; 1];
            let _ = socket.read(&mut sink).await;
        });
        port
    }

    #[tokio::test]
    async fn pipeline_replies_dispatch_in_fifo_order() {
        let port = spawn_echo_server(vec![b"+first\r\n", b"+second\r\n", b"+third\r\n"]).await;
        let client = Client::connect("127.0.0.1", port).await.unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        for label in ["first", "second", "third"] {
            let order = order.clone();
            client.send(
                vec![Bytes::from_static(b"PING")],
                Some(Box::new(move |reply| {
                    order.lock().unwrap().push((label, reply));
                })),
            );
        }
        client.sync_commit(Some(Duration::from_secs(2))).await;

        let got = order.lock().unwrap();
        assert_eq!(got.len(), 3);
        assert_eq!(got[0].0, "first");
        assert_eq!(got[1].0, "second");
        assert_eq!(got[2].0, "third");
    }

    #[tokio::test]
    async fn disconnected_client_fails_synchronously() {
        let port = spawn_echo_server(vec![]).await;
        let client = Client::connect("127.0.0.1", port).await.unwrap();
        client.disconnect().await;

        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        client.send(
            vec![Bytes::from_static(b"PING")],
            Some(Box::new(move |reply| {
                assert!(reply.is_error());
                fired2.store(true, Ordering::SeqCst);
            })),
        );
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn sync_commit_times_out_without_losing_the_callback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let _ = socket.read(&mut buf).await;
            tokio::time::sleep(Duration::from_millis(200)).await;
            let _ = socket.write_all(b"+late\r\n").await;
            let mut sink = [0u8; 1];
            let _ = socket.read(&mut sink).await;
        });

        let client = Client::connect("127.0.0.1", port).await.unwrap();
        let got = Arc::new(Mutex::new(None));
        let got2 = got.clone();
        client.send(
            vec![Bytes::from_static(b"PING")],
            Some(Box::new(move |reply| {
                *got2.lock().unwrap() = Some(reply);
            })),
        );
        client.sync_commit(Some(Duration::from_millis(20))).await;
        assert!(
            got.lock().unwrap().is_none(),
            "reply should not have arrived yet"
        );

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(
            got.lock().unwrap().is_some(),
            "orphaned callback should still fire"
        );
    }
}
