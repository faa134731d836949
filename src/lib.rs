//! An async client library for a Redis-compatible key/value server.
//!
//! Speaks the line-oriented RESP wire protocol over a single pipelined TCP
//! connection, and layers three connection modes on top of it:
//!
//! - [`Client`]: FIFO callback pipelining, with authentication/database
//!   replay and automatic reconnection.
//! - [`Subscriber`]: channel and pattern pub/sub, dispatching push messages
//!   to per-subscription handlers.
//! - [`Consumer`]: a consumer-group stream poll loop dispatching entries
//!   through a bounded worker pool, with acknowledgement.
//!
//! [`FutureClient`] layers a futures-based API over [`Client`] for callers
//! who would rather `.await` a reply than install a callback.

pub mod client;
pub use client::{Client, DisconnectCallback, DisconnectStatus, ReplyCallback};

pub mod codec;
pub use codec::Decoder;

pub mod config;
pub use config::{ClientConfig, ConsumerConfig, BLOCK_FOREVER, UNLIMITED_ATTEMPTS};

mod connection;
pub use connection::{ConnEvent, Connection};

pub mod consumer;
pub use consumer::{Consumer, EntryHandler, StreamEntry};

pub mod error;
pub use error::RedisError;

pub mod future_client;
pub use future_client::FutureClient;

pub mod pool;
pub use pool::{PoolShutDown, Task, WorkerPool};

pub mod reply;
pub use reply::Reply;

pub mod subscriber;
pub use subscriber::{MessageHandler, Subscriber};

mod transport;

/// The port a Redis-compatible server listens on by default.
pub const DEFAULT_PORT: u16 = 6379;

/// This crate's result type.
pub type Result<T> = std::result::Result<T, RedisError>;
