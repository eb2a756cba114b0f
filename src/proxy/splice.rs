//! Full-duplex byte forwarding
// (c) 2024 Ross Younger

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};

const COPY_BUFFER: usize = 32 * 1024;

/// Copies bytes both ways between `a` and `b` until both directions finish.
///
/// The two directions are independent: when one side's read returns EOF, the
/// opposite write half is shut down (half-close) while the other direction
/// keeps flowing. A read or write error on either direction aborts the whole
/// splice. With `idle_timeout` set, the splice also ends once *neither*
/// direction has moved bytes for that long.
///
/// Returns (bytes a→b, bytes b→a).
pub(crate) async fn splice<A, B>(
    a: A,
    b: B,
    idle_timeout: Option<Duration>,
) -> io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Send,
    B: AsyncRead + AsyncWrite + Send,
{
    let (mut a_rd, mut a_wr) = tokio::io::split(a);
    let (mut b_rd, mut b_wr) = tokio::io::split(b);
    let activity = AtomicU64::new(0);

    let up = copy_one_way(&mut a_rd, &mut b_wr, &activity);
    let down = copy_one_way(&mut b_rd, &mut a_wr, &activity);
    let both = async { tokio::try_join!(up, down) };

    match idle_timeout {
        None => both.await,
        Some(limit) => {
            tokio::select! {
                result = both => result,
                () = idle_watchdog(&activity, limit) => {
                    Err(io::Error::new(io::ErrorKind::TimedOut, "connection idle timeout"))
                }
            }
        }
    }
}

async fn copy_one_way<R, W>(
    reader: &mut R,
    writer: &mut W,
    activity: &AtomicU64,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            // EOF: half-close our direction. The other direction is not ours
            // to touch.
            let _ = writer.shutdown().await;
            return Ok(total);
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        total += n as u64;
        let _ = activity.fetch_add(1, Ordering::Relaxed);
    }
}

/// Resolves once the activity counter stops moving for a full `limit`.
/// Granularity means the effective timeout lands in [limit, 2*limit).
async fn idle_watchdog(activity: &AtomicU64, limit: Duration) {
    let mut last = activity.load(Ordering::Relaxed);
    loop {
        tokio::time::sleep(limit).await;
        let seen = activity.load(Ordering::Relaxed);
        if seen == last {
            return;
        }
        last = seen;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

    #[tokio::test]
    async fn bytes_flow_both_ways() -> anyhow::Result<()> {
        let (mut local, far) = tokio::io::duplex(1024);
        let (remote_near, mut remote) = tokio::io::duplex(1024);
        let task = tokio::spawn(splice(far, remote_near, None));

        local.write_all(b"ping").await?;
        local.flush().await?;
        let mut buf = [0u8; 4];
        remote.read_exact(&mut buf).await?;
        assert_eq!(&buf, b"ping");

        remote.write_all(b"pong").await?;
        remote.flush().await?;
        local.read_exact(&mut buf).await?;
        assert_eq!(&buf, b"pong");

        drop(local);
        drop(remote);
        let (up, down) = task.await??;
        assert_eq!((up, down), (4, 4));
        Ok(())
    }

    #[tokio::test]
    async fn eof_propagates_as_half_close() -> anyhow::Result<()> {
        let (mut local, far) = tokio::io::duplex(1024);
        let (remote_near, mut remote) = tokio::io::duplex(1024);
        let task = tokio::spawn(splice(far, remote_near, None));

        // Local finishes sending; remote sees EOF but can still reply.
        local.write_all(b"last words").await?;
        local.shutdown().await?;

        let mut buf = Vec::new();
        let _ = remote.read_to_end(&mut buf).await?;
        assert_eq!(&buf, b"last words");

        remote.write_all(b"reply").await?;
        remote.shutdown().await?;
        let mut reply = Vec::new();
        let _ = local.read_to_end(&mut reply).await?;
        assert_eq!(&reply, b"reply");

        let _ = task.await??;
        Ok(())
    }

    #[tokio::test]
    async fn idle_timeout_fires() {
        let (_local, far) = tokio::io::duplex(64);
        let (remote_near, _remote) = tokio::io::duplex(64);
        // Keep both halves alive but silent.
        let result = splice(far, remote_near, Some(Duration::from_millis(50))).await;
        let err = result.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn active_connection_survives_idle_timer() -> anyhow::Result<()> {
        let (mut local, far) = tokio::io::duplex(64);
        let (remote_near, mut remote) = tokio::io::duplex(64);
        let task = tokio::spawn(splice(far, remote_near, Some(Duration::from_millis(80))));

        // Trickle traffic more often than the timeout.
        for _ in 0..5 {
            local.write_all(b"x").await?;
            let mut byte = [0u8; 1];
            remote.read_exact(&mut byte).await?;
            tokio::time::sleep(Duration::from_millis(40)).await;
        }
        drop(local);
        drop(remote);
        let (up, _down) = task.await??;
        assert_eq!(up, 5);
        Ok(())
    }
}
