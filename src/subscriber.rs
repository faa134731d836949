//! Pub/sub connection mode.
//!
//! A `Subscriber` drives its own [`Connection`] directly: `SUBSCRIBE` and
//! friends never go through the FIFO callback queue the way ordinary
//! commands do, because the server's replies to them are themselves
//! `message`-shaped push frames, demultiplexed here by first element
//! rather than matched head-of-queue.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::client::{DisconnectCallback, DisconnectStatus, ReplyCallback};
use crate::connection::{ConnEvent, Connection};
use crate::reply::Reply;

/// Invoked with `(channel, payload)` — for `pmessage` the *concrete*
/// channel, never the pattern that matched it.
pub type MessageHandler = Arc<dyn Fn(String, Bytes) + Send + Sync + 'static>;

struct SharedState {
    channel_handlers: Mutex<HashMap<String, MessageHandler>>,
    pattern_handlers: Mutex<HashMap<String, MessageHandler>>,
    subscribed_channels: AtomicUsize,
    subscribed_patterns: AtomicUsize,
    /// Callbacks for the non-push commands (`AUTH`) that a subscriber
    /// connection may still send before it starts subscribing. Matched to
    /// replies in submission order, same as the ordinary client's FIFO
    /// queue, but only ever holds these one-off administrative commands.
    pending_replies: Mutex<VecDeque<ReplyCallback>>,
    disc_cb: Option<DisconnectCallback>,
}

impl SharedState {
    fn new(disc_cb: Option<DisconnectCallback>) -> Self {
        SharedState {
            channel_handlers: Mutex::new(HashMap::new()),
            pattern_handlers: Mutex::new(HashMap::new()),
            subscribed_channels: AtomicUsize::new(0),
            subscribed_patterns: AtomicUsize::new(0),
            pending_replies: Mutex::new(VecDeque::new()),
            disc_cb,
        }
    }
}

pub struct Subscriber {
    connection: Arc<Connection>,
    state: Arc<SharedState>,
    dispatch_task: JoinHandle<()>,
}

impl Subscriber {
    pub async fn connect(host: impl Into<String>, port: u16) -> crate::Result<Subscriber> {
        Subscriber::connect_with_disconnect_handler(host, port, None).await
    }

    /// Like [`Subscriber::connect`], with `disc_cb` invoked with
    /// `DisconnectStatus::Dropped` once, when this subscriber's connection
    /// is lost. A `Subscriber` has no reconnect state machine of its own, so
    /// unlike `Client` this is a single terminal notification, not one per
    /// retry.
    pub async fn connect_with_disconnect_handler(
        host: impl Into<String>,
        port: u16,
        disc_cb: Option<DisconnectCallback>,
    ) -> crate::Result<Subscriber> {
        let host = host.into();
        let (conn, rx) = Connection::connect(&host, port, Duration::ZERO, 4096).await?;
        let connection = Arc::new(conn);
        let state = Arc::new(SharedState::new(disc_cb));
        let dispatch_task = tokio::spawn(dispatch_loop(state.clone(), rx));
        Ok(Subscriber {
            connection,
            state,
            dispatch_task,
        })
    }

    /// Sends `AUTH password`, ahead of any `subscribe`/`psubscribe` call.
    /// Its reply is not push-shaped, so it is matched against this one
    /// pending slot instead of being demultiplexed by first element.
    pub fn auth(&self, password: impl Into<Bytes>, cb: Option<ReplyCallback>) -> &Self {
        self.state
            .pending_replies
            .lock()
            .unwrap()
            .push_back(cb.unwrap_or_else(|| Box::new(|_| {})));
        self.connection
            .send(&[Bytes::from_static(b"AUTH"), password.into()]);
        self
    }

    /// Installs `handler` for `channel` and issues `SUBSCRIBE`. The handler
    /// is live as soon as the server's ack arrives; until then, no
    /// `message` frame can reference this channel.
    pub fn subscribe(&self, channel: impl Into<String>, handler: MessageHandler) -> &Self {
        let channel = channel.into();
        self.state
            .channel_handlers
            .lock()
            .unwrap()
            .insert(channel.clone(), handler);
        self.connection
            .send(&[Bytes::from_static(b"SUBSCRIBE"), Bytes::from(channel)]);
        self
    }

    pub fn psubscribe(&self, pattern: impl Into<String>, handler: MessageHandler) -> &Self {
        let pattern = pattern.into();
        self.state
            .pattern_handlers
            .lock()
            .unwrap()
            .insert(pattern.clone(), handler);
        self.connection
            .send(&[Bytes::from_static(b"PSUBSCRIBE"), Bytes::from(pattern)]);
        self
    }

    /// Removes the handler and issues `UNSUBSCRIBE`. The handler is
    /// removed immediately rather than on ack: any `message` that arrives
    /// for this channel in between is conservatively dropped instead of
    /// routed to a handler the caller considers gone.
    pub fn unsubscribe(&self, channel: impl Into<String>) -> &Self {
        let channel = channel.into();
        self.state.channel_handlers.lock().unwrap().remove(&channel);
        self.connection
            .send(&[Bytes::from_static(b"UNSUBSCRIBE"), Bytes::from(channel)]);
        self
    }

    pub fn punsubscribe(&self, pattern: impl Into<String>) -> &Self {
        let pattern = pattern.into();
        self.state.pattern_handlers.lock().unwrap().remove(&pattern);
        self.connection
            .send(&[Bytes::from_static(b"PUNSUBSCRIBE"), Bytes::from(pattern)]);
        self
    }

    pub async fn commit(&self) -> &Self {
        if let Err(e) = self.connection.commit().await {
            warn!(error = %e, "subscriber commit failed");
        }
        self
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn subscribed_channel_count(&self) -> usize {
        self.state.subscribed_channels.load(Ordering::SeqCst)
    }

    pub fn subscribed_pattern_count(&self) -> usize {
        self.state.subscribed_patterns.load(Ordering::SeqCst)
    }

    pub async fn disconnect(&self) {
        self.connection.disconnect().await;
        self.dispatch_task.abort();
    }
}

async fn dispatch_loop(state: Arc<SharedState>, mut rx: mpsc::UnboundedReceiver<ConnEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            ConnEvent::Reply(reply) => match reply.as_array() {
                Ok(items) => dispatch_message(&state, items),
                Err(_) => {
                    let pending = state.pending_replies.lock().unwrap().pop_front();
                    match pending {
                        Some(cb) => cb(reply),
                        None => warn!("non-array reply in subscriber mode, dropping"),
                    }
                }
            },
            ConnEvent::Disconnected => {
                if let Some(cb) = &state.disc_cb {
                    cb(DisconnectStatus::Dropped);
                }
                break;
            }
        }
    }
}

fn dispatch_message(state: &SharedState, items: &[Reply]) {
    let Some(kind) = items.first().and_then(|r| r.as_string().ok()) else {
        return;
    };

    match kind.as_str() {
        "subscribe" => {
            state.subscribed_channels.fetch_add(1, Ordering::SeqCst);
        }
        "unsubscribe" => {
            state.subscribed_channels.fetch_sub(1, Ordering::SeqCst);
        }
        "psubscribe" => {
            state.subscribed_patterns.fetch_add(1, Ordering::SeqCst);
        }
        "punsubscribe" => {
            state.subscribed_patterns.fetch_sub(1, Ordering::SeqCst);
        }
        "message" => {
            let channel = items.get(1).and_then(|r| r.as_string().ok());
            let payload = items.get(2).and_then(|r| r.as_bytes().ok());
            if let (Some(channel), Some(payload)) = (channel, payload) {
                let handler = state.channel_handlers.lock().unwrap().get(&channel).cloned();
                if let Some(handler) = handler {
                    handler(channel, payload);
                }
            }
        }
        "pmessage" => {
            let pattern = items.get(1).and_then(|r| r.as_string().ok());
            let channel = items.get(2).and_then(|r| r.as_string().ok());
            let payload = items.get(3).and_then(|r| r.as_bytes().ok());
            if let (Some(pattern), Some(channel), Some(payload)) = (pattern, channel, payload) {
                let handler = state.pattern_handlers.lock().unwrap().get(&pattern).cloned();
                if let Some(handler) = handler {
                    handler(channel, payload);
                }
            }
        }
        _ => warn!(kind = %kind, "unrecognised push frame in subscriber mode"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn message_dispatches_to_its_channel_handler_once() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let _ = socket.read(&mut buf).await; // SUBSCRIBE news
            let _ = socket
                .write_all(b"*3\r\n$9\r\nsubscribe\r\n$4\r\nnews\r\n:1\r\n")
                .await;
            let _ = socket
                .write_all(b"*3\r\n$7\r\nmessage\r\n$4\r\nnews\r\n$5\r\nhello\r\n")
                .await;
            let mut sink = [0u8; 1];
            let _ = socket.read(&mut sink).await;
        });

        let subscriber = Subscriber::connect("127.0.0.1", port).await.unwrap();
        let received = Arc::new(StdMutex::new(Vec::new()));
        let received2 = received.clone();
        subscriber.subscribe(
            "news",
            Arc::new(move |channel, payload| {
                received2.lock().unwrap().push((channel, payload));
            }),
        );
        subscriber.commit().await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        let got = received.lock().unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].0, "news");
        assert_eq!(&got[0].1[..], b"hello");
        assert_eq!(subscriber.subscribed_channel_count(), 1);
    }

    #[tokio::test]
    async fn pmessage_handler_receives_the_concrete_channel() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let _ = socket.read(&mut buf).await; // PSUBSCRIBE news.*
            let _ = socket
                .write_all(b"*3\r\n$10\r\npsubscribe\r\n$6\r\nnews.*\r\n:1\r\n")
                .await;
            let _ = socket
                .write_all(b"*4\r\n$8\r\npmessage\r\n$6\r\nnews.*\r\n$8\r\nnews.foo\r\n$2\r\nhi\r\n")
                .await;
            let mut sink = [0u8; 1];
            let _ = socket.read(&mut sink).await;
        });

        let subscriber = Subscriber::connect("127.0.0.1", port).await.unwrap();
        let received = Arc::new(StdMutex::new(None));
        let received2 = received.clone();
        subscriber.psubscribe(
            "news.*",
            Arc::new(move |channel, payload| {
                *received2.lock().unwrap() = Some((channel, payload));
            }),
        );
        subscriber.commit().await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        let got = received.lock().unwrap();
        let (channel, payload) = got.as_ref().unwrap();
        assert_eq!(channel, "news.foo");
        assert_eq!(&payload[..], b"hi");
    }

    #[tokio::test]
    async fn auth_reply_is_matched_even_though_its_not_push_shaped() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let _ = socket.read(&mut buf).await; // AUTH secret
            let _ = socket.write_all(b"+OK\r\n").await;
            let mut sink = [0u8; 1];
            let _ = socket.read(&mut sink).await;
        });

        let subscriber = Subscriber::connect("127.0.0.1", port).await.unwrap();
        let got = Arc::new(StdMutex::new(None));
        let got2 = got.clone();
        subscriber.auth(
            "secret",
            Some(Box::new(move |reply| {
                *got2.lock().unwrap() = Some(reply);
            })),
        );
        subscriber.commit().await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            got.lock().unwrap().take(),
            Some(Reply::SimpleString("OK".to_string()))
        );
    }

    #[tokio::test]
    async fn disconnect_callback_fires_once_when_the_connection_drops() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });

        let fired = Arc::new(StdMutex::new(0));
        let fired2 = fired.clone();
        let _subscriber = Subscriber::connect_with_disconnect_handler(
            "127.0.0.1",
            port,
            Some(Arc::new(move |status| {
                assert_eq!(status, DisconnectStatus::Dropped);
                *fired2.lock().unwrap() += 1;
            })),
        )
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*fired.lock().unwrap(), 1);
    }
}
