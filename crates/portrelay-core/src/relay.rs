//! Per-connection duplex relay
//!
//! Each accepted connection dials the forwarder's remote address and copies
//! bytes in both directions. The pair is torn down as soon as either leg
//! finishes: the other leg is aborted even if it still has data in flight.
//! This is the relay's half-close contract, not a shortcut.

use crate::sink::LogSink;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

/// Size of the copy buffer used by each leg
pub const RELAY_BUFFER_SIZE: usize = 32 * 1024;

/// Where relays of one forwarder dial, and how they report
#[derive(Clone)]
pub struct RelayTarget {
    pub name: String,
    pub remote: String,
    pub dial_timeout: Duration,
    pub trace_payload: bool,
    pub sink: Arc<dyn LogSink>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    /// client -> remote
    Upstream,
    /// remote -> client
    Downstream,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Upstream => write!(f, "client->remote"),
            Direction::Downstream => write!(f, "remote->client"),
        }
    }
}

struct LegOutcome {
    direction: Direction,
    result: io::Result<()>,
}

/// Relay one accepted connection until either direction ends.
///
/// Dial failures are logged and drop the inbound connection; they never
/// affect the forwarder that accepted it.
pub async fn relay(inbound: TcpStream, peer: SocketAddr, target: RelayTarget) {
    let outbound =
        match tokio::time::timeout(target.dial_timeout, TcpStream::connect(&target.remote)).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                target.sink.error(&format!(
                    "{}: failed to dial {} for {}: {}",
                    target.name, target.remote, peer, e
                ));
                return;
            }
            Err(_) => {
                target.sink.error(&format!(
                    "{}: dialing {} for {} timed out after {:?}",
                    target.name, target.remote, peer, target.dial_timeout
                ));
                return;
            }
        };

    let _ = inbound.set_nodelay(true);
    let _ = outbound.set_nodelay(true);

    let (client_read, client_write) = inbound.into_split();
    let (remote_read, remote_write) = outbound.into_split();

    let (done_tx, mut done_rx) = mpsc::channel::<LegOutcome>(2);
    let sent = Arc::new(AtomicU64::new(0));
    let received = Arc::new(AtomicU64::new(0));

    let upstream = tokio::spawn(copy_leg(
        Direction::Upstream,
        client_read,
        remote_write,
        sent.clone(),
        target.clone(),
        done_tx.clone(),
    ));
    let downstream = tokio::spawn(copy_leg(
        Direction::Downstream,
        remote_read,
        client_write,
        received.clone(),
        target.clone(),
        done_tx,
    ));

    let first = done_rx.recv().await;

    // Dropping the halves held by the aborted task closes both sockets.
    upstream.abort();
    downstream.abort();
    let _ = upstream.await;
    let _ = downstream.await;

    let sent = sent.load(Ordering::Relaxed);
    let received = received.load(Ordering::Relaxed);
    match first {
        Some(LegOutcome {
            direction,
            result: Err(e),
        }) => target.sink.error(&format!(
            "{}: connection from {} closed after {} error: {} ({} bytes up, {} bytes down)",
            target.name, peer, direction, e, sent, received
        )),
        Some(LegOutcome { direction, .. }) => target.sink.info(&format!(
            "{}: connection from {} closed by {} ({} bytes up, {} bytes down)",
            target.name, peer, direction, sent, received
        )),
        None => {}
    }
}

async fn copy_leg<R, W>(
    direction: Direction,
    reader: R,
    writer: W,
    counter: Arc<AtomicU64>,
    target: RelayTarget,
    done: mpsc::Sender<LegOutcome>,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let result = copy(direction, reader, writer, &counter, &target).await;
    let _ = done.send(LegOutcome { direction, result }).await;
}

/// Copy until EOF (`Ok`) or the first read/write error.
async fn copy<R, W>(
    direction: Direction,
    mut reader: R,
    mut writer: W,
    counter: &AtomicU64,
    target: &RelayTarget,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            return Ok(());
        }

        let chunk = &buffer[..n];
        if target.trace_payload {
            target.sink.info(&format!(
                "{} [{}] {}",
                target.name,
                direction,
                String::from_utf8_lossy(chunk)
            ));
        }

        writer.write_all(chunk).await?;
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}
