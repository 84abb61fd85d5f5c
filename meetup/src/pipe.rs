//! Bidirectional pipe between two paired connections
//!
//! A pipe runs two copy loops, one per direction, as separate tasks. Each
//! loop applies a fresh read deadline before every read and a fresh write
//! deadline before every write. An expired read deadline only ends the pipe
//! when neither direction has moved any data for the whole read timeout, so
//! a transfer that only flows one way is kept alive by its traffic.
//!
//! The loops share a cancellation token: as soon as one of them stops, for
//! whatever reason, the other is told to stop too and both connections are
//! closed, so the peer on the far side sees the disconnect instead of
//! waiting for its own deadline.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::connection::{Connection, DeadlineReader, DeadlineWriter};
use crate::error::PipeError;
use crate::{Graceful, Timeouts};

/// Size of the transfer buffer used by each copy direction
pub const COPY_BUFFER_SIZE: usize = 32 * 1024;

/// Why a copy direction stopped
#[derive(Debug)]
pub enum Termination {
    /// The source closed its side cleanly
    Eof,
    /// The other direction stopped, or shutdown was requested
    Closed,
    /// Read or write failure, including an expired deadline
    Failed(PipeError),
    /// The direction task panicked; set by the pipe supervisor
    Aborted,
}

impl Termination {
    pub fn error(&self) -> Option<&PipeError> {
        match self {
            Termination::Failed(e) => Some(e),
            _ => None,
        }
    }
}

/// Final state of one copy direction
#[derive(Debug)]
pub struct DirectionReport {
    /// Bytes delivered to the destination
    pub written: u64,
    pub termination: Termination,
}

/// Final state of a whole pipe
#[derive(Debug)]
pub struct PipeReport {
    pub first_to_second: DirectionReport,
    pub second_to_first: DirectionReport,
}

/// Time of the last data movement in either direction of a pipe
#[derive(Debug)]
pub struct Activity {
    origin: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    pub fn touch(&self) {
        let now = self.origin.elapsed().as_millis() as u64;
        self.last_ms.fetch_max(now, Ordering::Relaxed);
    }

    /// How long no data has moved
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
        self.origin.elapsed().saturating_sub(last)
    }
}

impl Default for Activity {
    fn default() -> Self {
        Self::new()
    }
}

/// Copy bytes from `src` to `dst` until end of stream, an error, or `stop`
/// is cancelled. `activity` is shared with the opposite direction.
pub async fn copy_with_deadlines<R, W>(
    src: &mut DeadlineReader<R>,
    dst: &mut DeadlineWriter<W>,
    timeouts: &Timeouts,
    activity: &Activity,
    stop: &CancellationToken,
) -> DirectionReport
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];

    let termination = loop {
        src.set_deadline(Instant::now() + timeouts.read);
        let read = tokio::select! {
            _ = stop.cancelled() => None,
            read = src.read(&mut buf) => Some(read),
        };
        src.clear_deadline();

        let n = match read {
            None => break Termination::Closed,
            Some(Ok(0)) => break Termination::Eof,
            Some(Ok(n)) => n,
            Some(Err(e)) if e.kind() == std::io::ErrorKind::TimedOut => {
                if activity.idle_for() < timeouts.read {
                    // The other direction is moving data
                    continue;
                }
                break Termination::Failed(PipeError::ReadTimeout(timeouts.read));
            }
            Some(Err(e)) => break Termination::Failed(PipeError::Read(e)),
        };
        activity.touch();

        dst.set_deadline(Instant::now() + timeouts.write);
        let write = tokio::select! {
            _ = stop.cancelled() => None,
            write = write_chunk(dst, &buf[..n], timeouts.write, activity) => Some(write),
        };
        dst.clear_deadline();

        match write {
            None => break Termination::Closed,
            Some(Ok(())) => {}
            Some(Err(e)) => break Termination::Failed(e),
        }
    };

    DirectionReport {
        written: dst.written(),
        termination,
    }
}

/// Write all of `chunk` under the deadline already set on `dst`
async fn write_chunk<W>(
    dst: &mut DeadlineWriter<W>,
    chunk: &[u8],
    write_timeout: Duration,
    activity: &Activity,
) -> Result<(), PipeError>
where
    W: AsyncWrite + Unpin,
{
    let mut done = 0;
    while done < chunk.len() {
        match dst.write(&chunk[done..]).await {
            Ok(0) => {
                return Err(PipeError::ShortWrite {
                    written: done,
                    expected: chunk.len(),
                });
            }
            Ok(w) => {
                done += w;
                activity.touch();
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                return Err(PipeError::WriteTimeout(write_timeout));
            }
            Err(e) => return Err(PipeError::Write(e)),
        }
    }
    Ok(())
}

/// Start piping `first` and `second` into each other.
///
/// Returns immediately; the returned handle resolves once both directions
/// have stopped and both connections are closed.
pub fn spawn(
    id: u64,
    first: Connection,
    second: Connection,
    timeouts: Timeouts,
    graceful: &Graceful,
) -> tokio::task::JoinHandle<PipeReport> {
    let stop = graceful.child_token();
    let activity = Arc::new(Activity::new());
    let first_label = first.to_string();
    let second_label = second.to_string();

    tracing::info!(pipe = id, "Pipe open: {first_label} <-> {second_label}");

    let (mut first_read, mut first_write) = first.into_split();
    let (mut second_read, mut second_write) = second.into_split();

    let forward = {
        let stop = stop.clone();
        let activity = activity.clone();
        let from = first_label.clone();
        let to = second_label.clone();
        graceful.spawn(async move {
            let (src, dst) = (&mut first_read, &mut second_write);
            run_direction(id, &from, &to, src, dst, &timeouts, &activity, &stop).await
        })
    };

    let backward = {
        let from = second_label.clone();
        let to = first_label.clone();
        graceful.spawn(async move {
            let (src, dst) = (&mut second_read, &mut first_write);
            run_direction(id, &from, &to, src, dst, &timeouts, &activity, &stop).await
        })
    };

    graceful.spawn(async move {
        let first_to_second = join_direction(id, forward).await;
        let second_to_first = join_direction(id, backward).await;

        tracing::info!(
            pipe = id,
            "Pipe closed: {first_label} <-> {second_label}, {} bytes sent, {} bytes received",
            first_to_second.written,
            second_to_first.written
        );

        PipeReport {
            first_to_second,
            second_to_first,
        }
    })
}

#[allow(clippy::too_many_arguments)]
#[tracing::instrument(name = "direction", skip_all, fields(pipe = id, from = %from))]
async fn run_direction<R, W>(
    id: u64,
    from: &str,
    to: &str,
    src: &mut DeadlineReader<R>,
    dst: &mut DeadlineWriter<W>,
    timeouts: &Timeouts,
    activity: &Activity,
    stop: &CancellationToken,
) -> DirectionReport
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let report = copy_with_deadlines(src, dst, timeouts, activity, stop).await;

    match report.termination.error() {
        Some(e) => tracing::warn!("copy: {from} -> {to}: {e}"),
        None => tracing::debug!(
            "{from} -> {to}: {:?} after {} bytes",
            report.termination,
            report.written
        ),
    }

    // Closing: take the sibling direction down with us
    stop.cancel();
    if let Err(e) = dst.shutdown().await {
        tracing::trace!("shutdown {to}: {e}");
    }

    report
}

async fn join_direction(id: u64, handle: tokio::task::JoinHandle<DirectionReport>) -> DirectionReport {
    match handle.await {
        Ok(report) => report,
        Err(e) => {
            tracing::error!(pipe = id, "copy task failed: {e}");
            DirectionReport {
                written: 0,
                termination: Termination::Aborted,
            }
        }
    }
}
