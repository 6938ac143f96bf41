//! TCP command listener: one request per connection, answered and closed.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::{error, info, warn};

use crate::command::{Command, Request, HELLO_REPLY};
use crate::engine::SequencerHandle;
use crate::valve::ValveId;

/// A request must fit in a single read of this size.
const REQUEST_LIMIT: usize = 1024;

/// Prepended to every reply so a browser shows the acknowledgement.
const REPLY_PREAMBLE: &[u8] = b"HTTP/1.0 200 OK \n\n   ";

enum Flow {
    Continue,
    Exit,
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Bind `port` on all interfaces and serve until an `exit` command arrives.
pub async fn listen(port: u16, valves: Vec<ValveId>, sequencer: SequencerHandle) -> Result<()> {
    let listener = bind(port)?;
    serve(listener, &valves, &sequencer).await
}

pub fn bind(port: u16) -> Result<TcpListener> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let socket = TcpSocket::new_v4().context("failed to create listening socket")?;
    socket.set_reuseaddr(true)?;
    socket
        .bind(addr)
        .with_context(|| format!("failed to bind {addr}"))?;
    let listener = socket
        .listen(1)
        .with_context(|| format!("failed to listen on {addr}"))?;

    info!(%addr, "listening for commands");
    Ok(listener)
}

/// Accept loop. Returns after an `exit` command, dropping the listener.
pub async fn serve(
    listener: TcpListener,
    valves: &[ValveId],
    sequencer: &SequencerHandle,
) -> Result<()> {
    let mut counter: u64 = 0;

    loop {
        let (mut conn, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("accept failed: {e}");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        info!(connection = counter, %peer, "got connection");
        counter += 1;

        let flow = match handle(&mut conn, valves, sequencer).await {
            Ok(flow) => flow,
            Err(e) => {
                warn!(%peer, "request failed: {e:#}");
                Flow::Continue
            }
        };
        let _ = conn.shutdown().await;
        drop(conn);

        if let Flow::Exit = flow {
            info!("received a request to exit, closing listener");
            break;
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Per-connection handling
// ---------------------------------------------------------------------------

async fn handle(
    conn: &mut TcpStream,
    valves: &[ValveId],
    sequencer: &SequencerHandle,
) -> Result<Flow> {
    let mut buf = [0u8; REQUEST_LIMIT];
    let n = conn.read(&mut buf).await.context("read failed")?;
    let request = Request::parse(&buf[..n]);

    if request.greet {
        reply(conn, HELLO_REPLY).await;
    }

    let Some(command) = request.command else {
        info!(bytes = n, "received packet, was not a water request");
        return Ok(Flow::Continue);
    };
    if let Some(text) = command.reply() {
        reply(conn, text).await;
    }

    match command {
        Command::WaterOn => sequencer.start(valves.to_vec()).await?,
        Command::WaterOff => sequencer.stop().await?,
        Command::WaterTime => info!("watering time is fixed, request ignored"),
        Command::Exit => {
            // Exit regardless; an unreachable sequencer has already closed
            // its valves on shutdown.
            if let Err(e) = sequencer.stop().await {
                error!("stop before exit failed: {e:#}");
            }
            return Ok(Flow::Exit);
        }
    }

    Ok(Flow::Continue)
}

/// Best effort: a client that hung up early must not block the command.
async fn reply(conn: &mut TcpStream, text: &str) {
    let mut content = Vec::with_capacity(REPLY_PREAMBLE.len() + text.len());
    content.extend_from_slice(REPLY_PREAMBLE);
    content.extend_from_slice(text.as_bytes());

    if let Err(e) = conn.write_all(&content).await {
        warn!(reply = text, "failed to send reply: {e}");
    }
}

// ===========================================================================
// Tests
// ===========================================================================
