//! Byte relay between two async endpoints.
//!
//! [`relay`] copies one direction in fixed-size chunks. [`relay_pair`] runs both
//! directions of a bridge under one scope: the first direction that fails cancels
//! the scope so the other one unwinds too.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::quicssh::error::{TunnelError, TunnelResult};
use crate::quicssh::shutdown::Shutdown;

pub const RELAY_CHUNK_SIZE: usize = 4096;

/// Copy `src` into `dst` until end-of-stream, an I/O error, or cancellation.
///
/// End-of-stream is success: the destination's write side is shut down so the
/// peer sees the half-close, and the byte count is returned.
pub async fn relay<R, W>(scope: &Shutdown, src: &mut R, dst: &mut W) -> TunnelResult<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; RELAY_CHUNK_SIZE];
    let mut total = 0u64;

    loop {
        if scope.is_cancelled() {
            return Err(TunnelError::Cancelled);
        }

        let n = tokio::select! {
            biased;
            _ = scope.cancelled() => return Err(TunnelError::Cancelled),
            res = src.read(&mut buf) => res.map_err(TunnelError::Relay)?,
        };

        if n == 0 {
            tokio::select! {
                biased;
                _ = scope.cancelled() => return Err(TunnelError::Cancelled),
                res = dst.shutdown() => {
                    if let Err(err) = res {
                        tracing::debug!(err = %err, "relay: shutdown after eof failed");
                    }
                }
            }
            return Ok(total);
        }

        tokio::select! {
            biased;
            _ = scope.cancelled() => return Err(TunnelError::Cancelled),
            res = write_chunk(dst, &buf[..n]) => res.map_err(TunnelError::Relay)?,
        }
        total += n as u64;
    }
}

async fn write_chunk<W>(dst: &mut W, chunk: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    dst.write_all(chunk).await?;
    dst.flush().await
}

#[derive(Debug)]
pub struct PairOutcome {
    pub a_to_b: TunnelResult<u64>,
    pub b_to_a: TunnelResult<u64>,
}

impl PairOutcome {
    /// First failure that was not caused by cancellation.
    pub fn first_error(&self) -> Option<&TunnelError> {
        [&self.a_to_b, &self.b_to_a]
            .into_iter()
            .filter_map(|r| r.as_ref().err())
            .find(|e| !e.is_cancelled())
    }

    pub fn was_cancelled(&self) -> bool {
        [&self.a_to_b, &self.b_to_a]
            .into_iter()
            .any(|r| matches!(r, Err(TunnelError::Cancelled)))
    }

    pub fn bytes(&self) -> (u64, u64) {
        (
            *self.a_to_b.as_ref().unwrap_or(&0),
            *self.b_to_a.as_ref().unwrap_or(&0),
        )
    }
}

/// Bridge `a` and `b` in both directions until both sides finish.
///
/// Runs under a child of `parent`: an abnormal end of either direction cancels
/// the child (never the parent), which stops the other direction.
pub async fn relay_pair<A, B>(parent: &Shutdown, a: &mut A, b: &mut B) -> PairOutcome
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let scope = parent.child();
    let (mut a_rd, mut a_wr) = tokio::io::split(a);
    let (mut b_rd, mut b_wr) = tokio::io::split(b);

    let forward = async {
        let res = relay(&scope, &mut a_rd, &mut b_wr).await;
        if matches!(res, Err(TunnelError::Relay(_))) {
            scope.cancel();
        }
        res
    };
    let backward = async {
        let res = relay(&scope, &mut b_rd, &mut a_wr).await;
        if matches!(res, Err(TunnelError::Relay(_))) {
            scope.cancel();
        }
        res
    };

    let (a_to_b, b_to_a) = tokio::join!(forward, backward);
    PairOutcome { a_to_b, b_to_a }
}
