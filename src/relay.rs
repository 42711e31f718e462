//! Bidirectional byte relay shared by the CONNECT and SOCKS5 paths.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Bytes read per iteration; also the most data in flight per direction.
pub const RELAY_CHUNK_SIZE: usize = 8192;

/// How long the surviving direction may keep running after the other one hit EOF
pub const RELAY_DRAIN_GRACE: Duration = Duration::from_secs(10);

/// Bytes delivered in each direction once the relay has finished
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub a_to_b: u64,
    pub b_to_a: u64,
}

impl RelayStats {
    pub fn total(&self) -> u64 {
        self.a_to_b + self.b_to_a
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PumpEnd {
    Eof,
    Failed,
}

/// Pump bytes between `a` and `b` with the default [`RELAY_DRAIN_GRACE`].
pub async fn relay<A, B>(a: A, b: B) -> RelayStats
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    relay_with_grace(a, b, RELAY_DRAIN_GRACE).await
}

/// Pump bytes between `a` and `b` until the tunnel is done.
///
/// Each direction reads at most [`RELAY_CHUNK_SIZE`] bytes and waits for the
/// write to complete before reading again. When a direction reaches EOF it
/// shuts down the write side of its destination and the other direction gets
/// at most `grace` to finish. An I/O error ends both directions at once.
/// Both streams are dropped, and so closed, when this returns.
pub async fn relay_with_grace<A, B>(a: A, b: B, grace: Duration) -> RelayStats
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);
    let a_to_b = AtomicU64::new(0);
    let b_to_a = AtomicU64::new(0);

    let up = pump(&mut a_read, &mut b_write, &a_to_b, "a->b");
    let down = pump(&mut b_read, &mut a_write, &b_to_a, "b->a");
    tokio::pin!(up);
    tokio::pin!(down);

    let up_ended_first = tokio::select! {
        end = &mut up => Ok(end),
        end = &mut down => Err(end),
    };
    match up_ended_first {
        Ok(end) => drain(down, end, grace, "b->a").await,
        Err(end) => drain(up, end, grace, "a->b").await,
    }

    RelayStats {
        a_to_b: a_to_b.load(Ordering::Relaxed),
        b_to_a: b_to_a.load(Ordering::Relaxed),
    }
}

async fn drain<F>(
    rest: Pin<&mut F>,
    first: PumpEnd,
    grace: Duration,
    direction: &'static str,
) where
    F: Future<Output = PumpEnd>,
{
    if first == PumpEnd::Failed {
        debug!("Relay {} abandoned after the other direction failed", direction);
        return;
    }
    if tokio::time::timeout(grace, rest).await.is_err() {
        debug!("Relay {} still open {:?} after peer EOF, closing", direction, grace);
    }
}

async fn pump<R, W>(
    src: &mut R,
    dst: &mut W,
    forwarded: &AtomicU64,
    direction: &'static str,
) -> PumpEnd
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_CHUNK_SIZE];

    let end = loop {
        match src.read(&mut buf).await {
            Ok(0) => break PumpEnd::Eof,
            Ok(n) => {
                if let Err(e) = dst.write_all(&buf[..n]).await {
                    debug!("Relay {} write error: {}", direction, e);
                    break PumpEnd::Failed;
                }
                forwarded.fetch_add(n as u64, Ordering::Relaxed);
            }
            Err(e) => {
                debug!("Relay {} read error: {}", direction, e);
                break PumpEnd::Failed;
            }
        }
    };

    if let Err(e) = dst.shutdown().await {
        debug!("Relay {} shutdown error: {}", direction, e);
    }
    end
}
