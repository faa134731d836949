use redpipe::{Client, ClientConfig};

use bytes::Bytes;
use std::time::Duration;
use structopt::StructOpt;

/// Sends one raw command to a Redis-compatible server and prints its reply.
#[derive(StructOpt)]
struct Cli {
    #[structopt(name = "hostname", long = "--host", default_value = "127.0.0.1")]
    host: String,

    #[structopt(name = "port", long = "--port", default_value = "6379")]
    port: u16,

    #[structopt(name = "timeout-ms", long = "--timeout-ms", default_value = "0")]
    timeout_ms: u64,

    /// Command name followed by its arguments, e.g. `SET foo bar`.
    command: Vec<String>,
}

/// `flavor = "current_thread"`: a CLI invocation is one request and one
/// reply, no benefit from a multi-threaded runtime.
#[tokio::main(flavor = "current_thread")]
async fn main() -> redpipe::Result<()> {
    tracing_subscriber::fmt::try_init().ok();

    let cli = Cli::from_args();
    if cli.command.is_empty() {
        eprintln!("usage: redpipe-cli [--host H] [--port P] COMMAND [ARG...]");
        std::process::exit(2);
    }

    let config =
        ClientConfig::default().with_connect_timeout(Duration::from_millis(cli.timeout_ms));
    let client = Client::connect_with_config(cli.host, cli.port, config, None).await?;

    let argv: Vec<Bytes> = cli.command.iter().map(|s| Bytes::from(s.clone())).collect();
    let (tx, rx) = tokio::sync::oneshot::channel();
    client.send(
        argv,
        Some(Box::new(move |reply| {
            let _ = tx.send(reply);
        })),
    );
    client.sync_commit(None).await;

    match rx.await {
        Ok(reply) => println!("{reply}"),
        Err(_) => eprintln!("connection closed before a reply arrived"),
    }

    Ok(())
}
