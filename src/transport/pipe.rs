//! Half-duplex copy loop
//!
//! One `pipe` moves bytes from a single source to a single destination,
//! running each chunk through an optional [`ByteFilter`]. The two pipes of a
//! connection pair share a [`PairHandle`]; whichever stops first closes the
//! pair, which unblocks the other one.

use crate::constants::RELAY_BUFFER_SIZE;
use crate::filter::ByteFilter;
use std::fmt;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Close signal shared by both directions of one connection pair
///
/// Closing is idempotent and may race freely between the two pipes.
#[derive(Debug, Clone)]
pub struct PairHandle {
    id: u64,
    token: CancellationToken,
}

impl PairHandle {
    /// New pair handle that is also closed when `shutdown` is cancelled.
    pub fn new(id: u64, shutdown: &CancellationToken) -> Self {
        Self {
            id,
            token: shutdown.child_token(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Close both ends of the pair. Later calls are no-ops.
    pub fn close(&self) {
        self.token.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the pair has been closed.
    pub async fn closed(&self) {
        self.token.cancelled().await
    }
}

/// Which way a pipe moves bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to upstream
    Request,
    /// Upstream to client
    Response,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Request => f.write_str("client->upstream"),
            Direction::Response => f.write_str("upstream->client"),
        }
    }
}

/// Why a pipe stopped
#[derive(Debug)]
pub enum PipeEnd {
    /// Source reached end of stream
    Eof,
    /// The pair was closed by the other direction or by shutdown
    Closed,
    Read(io::Error),
    Write(io::Error),
}

impl fmt::Display for PipeEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipeEnd::Eof => f.write_str("end of stream"),
            PipeEnd::Closed => f.write_str("pair closed"),
            PipeEnd::Read(e) => write!(f, "read failed: {}", e),
            PipeEnd::Write(e) => write!(f, "write failed: {}", e),
        }
    }
}

/// Result of a finished pipe
#[derive(Debug)]
pub struct PipeOutcome {
    /// Bytes written to the destination, after filtering
    pub forwarded: u64,
    pub end: PipeEnd,
}

/// Copy from `src` to `dst` until either side fails or the pair is closed.
///
/// The pair is always closed and `dst` shut down before returning.
pub async fn pipe<R, W>(
    mut src: R,
    mut dst: W,
    mut filter: Option<Box<dyn ByteFilter>>,
    pair: PairHandle,
    direction: Direction,
) -> PipeOutcome
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    // Filtered output, reused across reads; grows only if a filter extends a chunk
    let mut filtered = Vec::new();
    let mut forwarded = 0u64;

    let end = loop {
        let n = tokio::select! {
            biased;
            _ = pair.closed() => break PipeEnd::Closed,
            result = src.read(&mut buf) => match result {
                Ok(0) => break PipeEnd::Eof,
                Ok(n) => n,
                Err(e) => break PipeEnd::Read(e),
            },
        };

        let chunk = match filter.as_mut() {
            Some(filter) => {
                filtered.clear();
                filtered.extend_from_slice(&buf[..n]);
                filter.filter(&mut filtered);
                filtered.as_slice()
            }
            None => &buf[..n],
        };
        if chunk.is_empty() {
            continue;
        }

        tokio::select! {
            biased;
            _ = pair.closed() => break PipeEnd::Closed,
            result = dst.write_all(chunk) => {
                if let Err(e) = result {
                    break PipeEnd::Write(e);
                }
            }
        }
        forwarded += chunk.len() as u64;
    };

    match &end {
        PipeEnd::Read(_) | PipeEnd::Write(_) => {
            warn!(pair = pair.id(), %direction, forwarded, "Relay stopped: {}", end)
        }
        PipeEnd::Eof | PipeEnd::Closed => {
            debug!(pair = pair.id(), %direction, forwarded, "Relay stopped: {}", end)
        }
    }

    pair.close();
    let _ = dst.shutdown().await;

    PipeOutcome { forwarded, end }
}
