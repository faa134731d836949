//! Consumer-group stream consumer.
//!
//! Binds to one consumer group (created lazily, `BUSYGROUP` tolerated) and
//! a session name, then loops `XREADGROUP` for every registered stream,
//! fanning entries out through a [`WorkerPool`] and `XACK`ing only the ones
//! whose handler returns `Ok`. Backpressure is a high/low water mark on the
//! pool's queue depth, the consumer's analogue of the client's outbound
//! buffer mutex.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use rand::Rng;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::{DisconnectCallback, ReplyCallback};
use crate::config::{ClientConfig, ConsumerConfig, BLOCK_FOREVER};
use crate::error::RedisError;
use crate::future_client::FutureClient;
use crate::pool::{Task, WorkerPool};
use crate::reply::Reply;

/// One stream entry: its id and its field/value map.
#[derive(Debug, Clone)]
pub struct StreamEntry {
    pub id: String,
    pub fields: HashMap<String, Bytes>,
}

/// Runs on a worker-pool thread. `Ok` acks the entry; `Err` leaves it
/// pending for redelivery.
pub type EntryHandler = Arc<
    dyn Fn(StreamEntry) -> Pin<Box<dyn Future<Output = crate::Result<()>> + Send>> + Send + Sync,
>;

struct Shared {
    future_client: FutureClient,
    config: ConsumerConfig,
    session_name: String,
    registrations: Mutex<Vec<(String, EntryHandler)>>,
    alive: AtomicBool,
}

/// A consumer-group stream consumer.
pub struct Consumer {
    shared: Arc<Shared>,
    pool: Arc<WorkerPool>,
    poll_task: Mutex<Option<JoinHandle<()>>>,
}

impl Consumer {
    pub async fn connect(
        host: impl Into<String>,
        port: u16,
        config: ConsumerConfig,
    ) -> crate::Result<Consumer> {
        Consumer::connect_with_disconnect_handler(host, port, config, None).await
    }

    /// Like [`Consumer::connect`], with `disc_cb` forwarded straight to the
    /// underlying [`crate::Client`] this consumer wraps: it fires with
    /// `DisconnectStatus::Dropped` whenever that connection is lost, the
    /// same notification a bare `Client` gives its own caller.
    pub async fn connect_with_disconnect_handler(
        host: impl Into<String>,
        port: u16,
        config: ConsumerConfig,
        disc_cb: Option<DisconnectCallback>,
    ) -> crate::Result<Consumer> {
        let client = crate::client::Client::connect_with_config(
            host,
            port,
            ClientConfig::default(),
            disc_cb,
        )
        .await?;
        let session_name = config
            .session_name
            .clone()
            .unwrap_or_else(random_session_name);
        let pool = Arc::new(WorkerPool::new(
            format!("consumer-{session_name}"),
            config.max_concurrency,
            config.high_water_mark.max(1),
        ));
        let shared = Arc::new(Shared {
            future_client: FutureClient::new(client),
            config,
            session_name,
            registrations: Mutex::new(Vec::new()),
            alive: AtomicBool::new(true),
        });
        Ok(Consumer {
            shared,
            pool,
            poll_task: Mutex::new(None),
        })
    }

    /// Sends `AUTH password` over the underlying client connection, ahead
    /// of starting the poll loop with [`Consumer::commit`].
    pub fn auth(&self, password: impl Into<Bytes>, cb: Option<ReplyCallback>) -> &Self {
        self.shared.future_client.client().auth(password, cb);
        self
    }

    /// Registers `handler` for entries on `stream_key`. The group is
    /// created (if absent) the first time the poll loop sees this stream,
    /// not synchronously here.
    pub fn subscribe(&self, stream_key: impl Into<String>, handler: EntryHandler) -> &Self {
        self.shared
            .registrations
            .lock()
            .unwrap()
            .push((stream_key.into(), handler));
        self
    }

    /// Starts the poll loop. Idempotent: calling twice has no additional
    /// effect.
    pub fn commit(&self) -> &Self {
        let mut poll_task = self.poll_task.lock().unwrap();
        if poll_task.is_some() {
            return self;
        }
        let shared = self.shared.clone();
        let pool = self.pool.clone();
        *poll_task = Some(tokio::spawn(poll_loop(shared, pool)));
        self
    }

    pub fn is_connected(&self) -> bool {
        self.shared.future_client.client().is_connected()
    }

    pub fn pending_dispatch_depth(&self) -> usize {
        self.pool.size()
    }

    /// Stops polling, waits for in-flight handlers to finish, then shuts
    /// the pool down (Draining → Stopped).
    pub async fn shutdown(self) {
        self.shared.alive.store(false, Ordering::SeqCst);
        if let Some(task) = self.poll_task.lock().unwrap().take() {
            let _ = task.await;
        }
        match Arc::try_unwrap(self.pool) {
            Ok(pool) => pool.shutdown().await,
            Err(pool) => {
                // Other references remain; shutting down through a shared
                // reference isn't possible, so just stop admitting new work.
                debug!(depth = pool.size(), "consumer pool has other referents at shutdown");
            }
        }
    }
}

fn random_session_name() -> String {
    let suffix: u32 = rand::thread_rng().gen();
    format!("consumer-{suffix:08x}")
}

async fn poll_loop(shared: Arc<Shared>, pool: Arc<WorkerPool>) {
    let mut ensured_groups: HashSet<String> = HashSet::new();

    while shared.alive.load(Ordering::SeqCst) {
        while pool.size() >= shared.config.high_water_mark {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if !shared.alive.load(Ordering::SeqCst) {
                return;
            }
            if pool.size() < shared.config.low_water_mark {
                break;
            }
        }

        let regs: Vec<(String, EntryHandler)> =
            shared.registrations.lock().unwrap().clone();
        if regs.is_empty() {
            tokio::time::sleep(Duration::from_millis(50)).await;
            continue;
        }

        for (stream_key, _) in &regs {
            if ensured_groups.insert(stream_key.clone()) {
                if let Err(e) = ensure_group(&shared, stream_key).await {
                    warn!(stream = %stream_key, error = %e, "failed to create consumer group");
                    ensured_groups.remove(stream_key);
                }
            }
        }

        let reply = shared.future_client.call(build_xreadgroup(&shared, &regs)).await;
        match parse_xreadgroup_reply(&reply) {
            Ok(streams) => {
                for (stream_key, entries) in streams {
                    if let Some((_, handler)) = regs.iter().find(|(k, _)| *k == stream_key) {
                        for entry in entries {
                            dispatch_entry(&shared, &pool, stream_key.clone(), entry, handler.clone())
                                .await;
                        }
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "XREADGROUP failed, retrying after a short delay");
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        }
    }
}

async fn ensure_group(shared: &Arc<Shared>, stream_key: &str) -> crate::Result<()> {
    let argv = vec![
        Bytes::from_static(b"XGROUP"),
        Bytes::from_static(b"CREATE"),
        Bytes::from(stream_key.to_string()),
        Bytes::from(shared.config.group_name.clone()),
        Bytes::from_static(b"$"),
        Bytes::from_static(b"MKSTREAM"),
    ];
    let reply = shared.future_client.call(argv).await;
    if let Reply::Error(msg) = &reply {
        if msg.contains("BUSYGROUP") {
            return Ok(());
        }
        return Err(RedisError::Server(msg.clone()));
    }
    info!(stream = %stream_key, group = %shared.config.group_name, "consumer group created");
    Ok(())
}

fn build_xreadgroup(shared: &Shared, regs: &[(String, EntryHandler)]) -> Vec<Bytes> {
    let mut argv = vec![
        Bytes::from_static(b"XREADGROUP"),
        Bytes::from_static(b"GROUP"),
        Bytes::from(shared.config.group_name.clone()),
        Bytes::from(shared.session_name.clone()),
    ];
    if let Some(ms) = block_ms_arg(shared.config.block_ms) {
        argv.push(Bytes::from_static(b"BLOCK"));
        argv.push(Bytes::from(ms));
    }
    argv.push(Bytes::from_static(b"COUNT"));
    argv.push(Bytes::from(shared.config.count.to_string()));
    argv.push(Bytes::from_static(b"STREAMS"));
    for (key, _) in regs {
        argv.push(Bytes::from(key.clone()));
    }
    for _ in regs {
        argv.push(Bytes::from_static(b">"));
    }
    argv
}

/// `block_ms == 0` is non-blocking: no `BLOCK` clause is issued at all, so
/// the poll returns immediately. [`BLOCK_FOREVER`] (`u64::MAX`) is rendered
/// as the wire's own `0`, which is how the server spells "block forever" —
/// the sentinel only exists at this crate's own API boundary.
fn block_ms_arg(block_ms: u64) -> Option<String> {
    if block_ms == 0 {
        None
    } else if block_ms == BLOCK_FOREVER {
        Some("0".to_string())
    } else {
        Some(block_ms.to_string())
    }
}

fn parse_xreadgroup_reply(reply: &Reply) -> crate::Result<Vec<(String, Vec<StreamEntry>)>> {
    if reply.is_null() {
        return Ok(Vec::new());
    }
    let streams = reply.as_array()?;
    let mut out = Vec::with_capacity(streams.len());
    for stream in streams {
        let pair = stream.as_array()?;
        let key = pair
            .first()
            .ok_or_else(malformed)?
            .as_string()?;
        let entries_reply = pair.get(1).ok_or_else(malformed)?.as_array()?;
        let mut entries = Vec::with_capacity(entries_reply.len());
        for entry in entries_reply {
            let entry_pair = entry.as_array()?;
            let id = entry_pair.first().ok_or_else(malformed)?.as_string()?;
            let fields_reply = entry_pair.get(1).ok_or_else(malformed)?.as_array()?;
            let mut fields = HashMap::new();
            let mut it = fields_reply.iter();
            while let (Some(k), Some(v)) = (it.next(), it.next()) {
                fields.insert(k.as_string()?, v.as_bytes()?);
            }
            entries.push(StreamEntry { id, fields });
        }
        out.push((key, entries));
    }
    Ok(out)
}

fn malformed() -> RedisError {
    RedisError::Protocol("malformed XREADGROUP reply".to_string())
}

async fn dispatch_entry(
    shared: &Arc<Shared>,
    pool: &Arc<WorkerPool>,
    stream_key: String,
    entry: StreamEntry,
    handler: EntryHandler,
) {
    let shared = shared.clone();
    let id = entry.id.clone();
    let task: Task = Box::pin(async move {
        match (handler)(entry).await {
            Ok(()) => {
                let argv = vec![
                    Bytes::from_static(b"XACK"),
                    Bytes::from(stream_key.clone()),
                    Bytes::from(shared.config.group_name.clone()),
                    Bytes::from(id.clone()),
                ];
                let reply = shared.future_client.call(argv).await;
                if reply.is_error() {
                    warn!(stream = %stream_key, id = %id, reply = %reply, "XACK failed");
                }
            }
            Err(e) => {
                warn!(stream = %stream_key, id = %id, error = %e, "handler failed, entry left pending");
            }
        }
    });
    if pool.submit(task).await.is_err() {
        warn!(stream = %stream_key, "worker pool is shut down, dropping entry");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_ms_forever_sentinel_renders_as_zero() {
        assert_eq!(block_ms_arg(BLOCK_FOREVER), Some("0".to_string()));
        assert_eq!(block_ms_arg(0), None);
        assert_eq!(block_ms_arg(5_000), Some("5000".to_string()));
    }

    #[test]
    fn parses_a_single_stream_single_entry_reply() {
        let reply = Reply::Array(Some(vec![Reply::Array(Some(vec![
            Reply::BulkString(Some(Bytes::from_static(b"orders"))),
            Reply::Array(Some(vec![Reply::Array(Some(vec![
                Reply::BulkString(Some(Bytes::from_static(b"1-0"))),
                Reply::Array(Some(vec![
                    Reply::BulkString(Some(Bytes::from_static(b"field"))),
                    Reply::BulkString(Some(Bytes::from_static(b"value"))),
                ])),
            ]))])),
        ]))]));

        let parsed = parse_xreadgroup_reply(&reply).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].0, "orders");
        assert_eq!(parsed[0].1[0].id, "1-0");
        assert_eq!(
            parsed[0].1[0].fields.get("field").unwrap(),
            &Bytes::from_static(b"value")
        );
    }

    #[test]
    fn null_reply_is_no_entries() {
        let parsed = parse_xreadgroup_reply(&Reply::Array(None)).unwrap();
        assert!(parsed.is_empty());
    }
}
