//! Bidirectional forwarding between a multiplexed stream and another connection

use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

const COPY_BUF_SIZE: usize = 16 * 1024;

/// Bytes moved in each direction
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SpliceStats {
    /// `a` -> `b`, `prefix` included
    pub a_to_b: u64,
    pub b_to_a: u64,
}

/// Forward bytes between `a` and `b` until either side closes
///
/// `prefix` is written to `b` before anything read from `a`. When one
/// direction reaches EOF its destination is shut down and the other direction
/// is abandoned, so both connections are dropped together. An unfinished
/// `MuxStream` dropped this way resets, which frees it on the peer too.
pub async fn splice<A, B>(a: A, b: B, prefix: &[u8]) -> io::Result<SpliceStats>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    if !prefix.is_empty() {
        b_write.write_all(prefix).await?;
    }

    let mut stats = SpliceStats {
        a_to_b: prefix.len() as u64,
        b_to_a: 0,
    };
    let (direction, result) = tokio::select! {
        result = pipe(&mut a_read, &mut b_write, &mut stats.a_to_b) => ("a -> b", result),
        result = pipe(&mut b_read, &mut a_write, &mut stats.b_to_a) => ("b -> a", result),
    };
    result?;

    trace!("Splice finished by {}: {:?}", direction, stats);
    Ok(stats)
}

/// Copy until EOF, then shut the writer down
async fn pipe<R, W>(reader: &mut R, writer: &mut W, copied: &mut u64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return writer.shutdown().await;
        }
        writer.write_all(&buf[..n]).await?;
        *copied += n as u64;
    }
}
