//! A futures façade over [`Client`].
//!
//! A oneshot per request turns the callback-based API into something
//! `.await`-able. No extra actor task is needed — [`Client`] is already
//! safe to call from any task, so the oneshot is installed directly as the
//! completion callback.

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::client::Client;
use crate::reply::Reply;

/// Wraps a [`Client`], replacing `send`'s callback with a future.
#[derive(Clone)]
pub struct FutureClient {
    inner: Client,
}

impl FutureClient {
    pub fn new(inner: Client) -> Self {
        FutureClient { inner }
    }

    /// Sends `argv`, flushes, and resolves once its reply arrives. A
    /// dropped connection before the reply arrives resolves to a
    /// network-error reply, same as the callback contract.
    pub async fn call(&self, argv: Vec<Bytes>) -> Reply {
        let (tx, rx) = oneshot::channel();
        self.inner.send(
            argv,
            Some(Box::new(move |reply| {
                let _ = tx.send(reply);
            })),
        );
        self.inner.commit().await;
        rx.await.unwrap_or_else(|_| Reply::network_error())
    }

    /// The underlying callback-style client, for pipelining many commands
    /// before awaiting any of them.
    pub fn client(&self) -> &Client {
        &self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn call_resolves_with_the_matching_reply() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let _ = socket.read(&mut buf).await;
            let _ = socket.write_all(b"+PONG\r\n").await;
            let mut sink = [0u8; 1];
            let _ = socket.read(&mut sink).await;
        });

        let client = Client::connect("127.0.0.1", port).await.unwrap();
        let future_client = FutureClient::new(client);
        let reply = future_client.call(vec![Bytes::from_static(b"PING")]).await;
        assert_eq!(reply, Reply::SimpleString("PONG".to_string()));
    }
}
