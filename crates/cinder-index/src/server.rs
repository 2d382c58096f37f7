//! Control-plane TCP listener.
//!
//! Accepts line-oriented control connections (memcached-style text) and
//! dispatches admin commands against the directory and coordinator:
//!
//! ```text
//! ping                                   -> OK
//! nodes                                  -> one line per node, then END
//! node add <host> <port>                 -> OK
//! node remove <host> <port>              -> OK
//! queue <host> <port> <ident> [args...]  -> OK
//! quit                                   -> closes the connection
//! ```
//!
//! Every command handler is registered with the time watcher while it
//! runs, so a handler wedged on a lock or a slow peer gets flagged by
//! the background sweeper.

use std::sync::Arc;
use std::time::Duration;

use cinder_cluster::{
    Node, NodeAddress, NodeDirectory, Shutdown, ThreadQueue, TimeWatcher,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::coordinator::Coordinator;

/// Shared state for control connections.
pub struct ServerContext {
    pub directory: Arc<NodeDirectory>,
    pub coordinator: Arc<Coordinator>,
    pub watcher: Arc<TimeWatcher>,
    pub slow_threshold: Duration,
}

/// Outcome of one dispatched command.
enum Reply {
    Ok,
    Lines(Vec<String>),
    ClientError(String),
    Error,
    Quit,
}

/// Runs the accept loop until shutdown.
pub async fn run(listener: TcpListener, context: Arc<ServerContext>, mut shutdown: Shutdown) {
    if let Ok(addr) = listener.local_addr() {
        info!("control listener on {addr}");
    }

    loop {
        let accepted = tokio::select! {
            _ = shutdown.requested() => break,
            accepted = listener.accept() => accepted,
        };

        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                warn!("accept failed: {e}");
                continue;
            }
        };

        let context = Arc::clone(&context);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, context).await {
                debug!("control connection from {peer} ended: {e}");
            }
        });
    }

    info!("control listener stopped");
}

async fn handle_connection(
    stream: TcpStream,
    context: Arc<ServerContext>,
) -> std::io::Result<()> {
    let (read, write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    let mut write = BufWriter::new(write);

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        // flag handlers stuck beyond the slow threshold
        let watch = context
            .watcher
            .register(context.slow_threshold, {
                let line = line.to_string();
                move |elapsed| {
                    warn!("control command '{line}' pending for {elapsed:?}");
                }
            });
        let reply = dispatch(line, &context).await;
        context.watcher.unregister(watch);

        match reply {
            Reply::Ok => write.write_all(b"OK\r\n").await?,
            Reply::Lines(lines) => {
                for line in lines {
                    write.write_all(line.as_bytes()).await?;
                    write.write_all(b"\r\n").await?;
                }
                write.write_all(b"END\r\n").await?;
            }
            Reply::ClientError(message) => {
                write
                    .write_all(format!("CLIENT_ERROR {message}\r\n").as_bytes())
                    .await?;
            }
            Reply::Error => write.write_all(b"ERROR\r\n").await?,
            Reply::Quit => break,
        }
        write.flush().await?;
    }

    Ok(())
}

async fn dispatch(line: &str, context: &ServerContext) -> Reply {
    let parts: Vec<&str> = line.split_whitespace().collect();

    match parts.as_slice() {
        ["ping"] => Reply::Ok,
        ["quit"] => Reply::Quit,

        ["nodes"] => {
            let lines = context
                .directory
                .snapshot()
                .into_iter()
                .map(|n| {
                    format!(
                        "{} {} {} {} {}",
                        n.address.host, n.address.port, n.role, n.state, n.balance
                    )
                })
                .collect();
            Reply::Lines(lines)
        }

        ["node", "add", host, port] => match parse_address(host, port) {
            Ok(address) => {
                if context.directory.add_node(Node::new(address.clone())) {
                    Reply::Ok
                } else {
                    Reply::ClientError(format!("node {address} already exists"))
                }
            }
            Err(reply) => reply,
        },

        ["node", "remove", host, port] => match parse_address(host, port) {
            Ok(address) => {
                if context.directory.remove_node(&address).is_some() {
                    Reply::Ok
                } else {
                    Reply::ClientError(format!("unknown node {address}"))
                }
            }
            Err(reply) => reply,
        },

        ["queue", host, port, ident, args @ ..] => match parse_address(host, port) {
            Ok(address) => {
                let queue = match ThreadQueue::decode(ident, args, &context.directory) {
                    Ok(queue) => queue,
                    Err(e) => return Reply::ClientError(e.to_string()),
                };
                if context.coordinator.enqueue(&address, queue).await {
                    Reply::Ok
                } else {
                    Reply::ClientError(format!("node {address} is not watched"))
                }
            }
            Err(reply) => reply,
        },

        _ => {
            debug!("unknown control command: {line}");
            Reply::Error
        }
    }
}

fn parse_address(host: &str, port: &str) -> Result<NodeAddress, Reply> {
    let port: u16 = port
        .parse()
        .map_err(|_| Reply::ClientError(format!("invalid port '{port}'")))?;
    if host.is_empty() {
        return Err(Reply::ClientError("empty host".into()));
    }
    Ok(NodeAddress::new(host, port))
}

/// Binds the control listener.
pub async fn bind(addr: std::net::SocketAddr) -> std::io::Result<TcpListener> {
    let listener = TcpListener::bind(addr).await?;
    Ok(listener)
}
