//! Bidirectional frame relay between a client and its backend.
//!
//! Each direction is an independent pump: decode a frame from the source,
//! forward its raw bytes to the sink, then apply the termination rule for that
//! direction. Pumps stop on end of stream, a read or write failure, an idle
//! timeout, or cancellation by the opposite pump. No buffered frame is dropped
//! silently; everything decoded before a pump stops has been forwarded.
//!
//! The idle deadline is shared: a frame in either direction keeps the whole
//! tunnel alive, so a direction that is silent while the other streams (the
//! reply side during an upload, the request side during a fetch) does not
//! time out.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{Sink, SinkExt};
use parking_lot::Mutex;
use stash_netproto::{
    stream::FrameReader,
    termination::{ExchangeTracker, Side, Verdict},
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::{Instant, sleep_until};
use tokio_util::codec::{BytesCodec, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
pub struct TunnelConfig {
    /// Maximum silence in both directions before the tunnel is torn down.
    pub idle_timeout: Duration,
    /// Per-direction reassembly buffer.
    pub rx_buffer: usize,
}

/// Why one direction of a tunnel stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectionEnd {
    /// The termination rule for this direction was satisfied.
    Complete,
    /// The source closed its end of the stream.
    PeerClosed,
    /// The opposite direction finished first.
    Cancelled,
    IdleTimeout,
    Failed(String),
}

impl DirectionEnd {
    pub fn is_clean(&self) -> bool {
        matches!(self, DirectionEnd::Complete | DirectionEnd::Cancelled)
    }
}

impl fmt::Display for DirectionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DirectionEnd::Complete => f.write_str("complete"),
            DirectionEnd::PeerClosed => f.write_str("peer closed"),
            DirectionEnd::Cancelled => f.write_str("cancelled"),
            DirectionEnd::IdleTimeout => f.write_str("idle timeout"),
            DirectionEnd::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Outcome of a finished tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelReport {
    /// Client to backend.
    pub upstream: DirectionEnd,
    /// Backend to client.
    pub downstream: DirectionEnd,
    pub frames_up: u64,
    pub frames_down: u64,
}

/// Last time a frame crossed the tunnel in either direction.
#[derive(Debug)]
struct Activity {
    last: Mutex<Instant>,
    idle: Duration,
}

impl Activity {
    fn new(idle: Duration) -> Self {
        Self {
            last: Mutex::new(Instant::now()),
            idle,
        }
    }

    fn touch(&self) {
        *self.last.lock() = Instant::now();
    }

    fn deadline(&self) -> Instant {
        *self.last.lock() + self.idle
    }
}

/// Relay frames between `client` and `backend` until both directions stop.
///
/// Request frames whose username differs from `owner` are discarded. An empty
/// `owner` disables the check.
pub async fn run_tunnel<CR, CW, BR, BW>(
    (client_rd, client_wr): (CR, CW),
    (backend_rd, backend_wr): (BR, BW),
    owner: &str,
    config: TunnelConfig,
) -> TunnelReport
where
    CR: AsyncRead + Unpin,
    CW: AsyncWrite + Unpin,
    BR: AsyncRead + Unpin,
    BW: AsyncWrite + Unpin,
{
    let cancel = CancellationToken::new();
    let activity = Activity::new(config.idle_timeout);

    let upstream = pump(
        Side::Request,
        FrameReader::new(client_rd, config.rx_buffer),
        FramedWrite::new(backend_wr, BytesCodec::new()),
        owner,
        &activity,
        &cancel,
    );
    let downstream = pump(
        Side::Reply,
        FrameReader::new(backend_rd, config.rx_buffer),
        FramedWrite::new(client_wr, BytesCodec::new()),
        "",
        &activity,
        &cancel,
    );

    let ((upstream, frames_up), (downstream, frames_down)) = tokio::join!(upstream, downstream);

    TunnelReport {
        upstream,
        downstream,
        frames_up,
        frames_down,
    }
}

async fn pump<R, S>(
    side: Side,
    mut source: FrameReader<R>,
    mut sink: S,
    owner: &str,
    activity: &Activity,
    cancel: &CancellationToken,
) -> (DirectionEnd, u64)
where
    R: AsyncRead + Unpin,
    S: Sink<Bytes, Error = std::io::Error> + Unpin,
{
    let mut tracker = ExchangeTracker::new(side);
    let mut forwarded = 0u64;

    let end = 'pump: loop {
        let next = {
            let read = source.next_frame();
            tokio::pin!(read);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break 'pump DirectionEnd::Cancelled,
                    next = &mut read => break next,
                    _ = sleep_until(activity.deadline()) => {
                        // The other direction may have moved the deadline.
                        if Instant::now() >= activity.deadline() {
                            break 'pump DirectionEnd::IdleTimeout;
                        }
                    }
                }
            }
        };

        let received = match next {
            Err(e) => break DirectionEnd::Failed(e.to_string()),
            Ok(None) => break DirectionEnd::PeerClosed,
            Ok(Some(received)) => received,
        };

        let frame = &received.frame;
        if !owner.is_empty() && frame.username != owner {
            warn!(
                ?side,
                owner,
                username = %frame.username,
                op = frame.operation,
                "Discarding frame addressed to another user"
            );
            continue;
        }

        if let Err(e) = sink.send(received.raw.clone()).await {
            break DirectionEnd::Failed(format!("write: {e}"));
        }
        forwarded += 1;
        activity.touch();

        let observed = tracker.observe(frame);
        if !observed.in_sequence {
            debug!(
                ?side,
                op = frame.operation,
                seq = frame.sequence,
                expected = observed.expected,
                "Out-of-sequence frame forwarded"
            );
        }
        if observed.verdict == Verdict::SessionDone {
            break DirectionEnd::Complete;
        }
    };

    // A completed request side still owes the client its final reply, so the
    // reply side keeps running until it completes on its own.
    if !(side == Side::Request && end == DirectionEnd::Complete) {
        cancel.cancel();
    }

    // Flush what was forwarded and half-close the sink.
    if let Err(e) = sink.close().await {
        debug!(?side, error = %e, "Closing tunnel sink failed");
    }

    (end, forwarded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use stash_netproto::{
        codec::encode_frame,
        op::{Operation, Status},
    };
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

    fn frame(op: Operation, status: Status, user: &str, seq: u32, payload: &[u8]) -> Vec<u8> {
        encode_frame(op as u8, status as u8, user, seq, payload, 1024).unwrap()
    }

    fn config() -> TunnelConfig {
        TunnelConfig {
            idle_timeout: Duration::from_secs(5),
            rx_buffer: 8192,
        }
    }

    #[tokio::test]
    async fn relays_backup_exchange_and_completes() {
        let (client, client_far) = duplex(4096);
        let (backend, backend_far) = duplex(4096);
        let (client_rd, client_wr) = tokio::io::split(client_far);
        let (backend_rd, backend_wr) = tokio::io::split(backend_far);

        let tunnel = tokio::spawn(async move {
            run_tunnel(
                (client_rd, client_wr),
                (backend_rd, backend_wr),
                "alice",
                config(),
            )
            .await
        });

        let (mut client_r, mut client_w) = tokio::io::split(client);
        let (mut backend_r, mut backend_w) = tokio::io::split(backend);

        let mut up = Vec::new();
        up.extend(frame(Operation::Login, Status::Continue, "alice", 0, b"pw"));
        up.extend(frame(Operation::StartBackup, Status::Continue, "alice", 0, b"f|1"));
        up.extend(frame(Operation::WriteChunk, Status::Continue, "alice", 0, b"AAAA"));
        up.extend(frame(Operation::WriteChunk, Status::Final, "alice", 1, b""));
        client_w.write_all(&up).await.unwrap();

        // Upstream completes and half-closes the backend side.
        let mut seen = Vec::new();
        backend_r.read_to_end(&mut seen).await.unwrap();
        assert_eq!(seen, up);

        let mut down = Vec::new();
        down.extend(frame(Operation::Login, Status::Continue, "alice", 0, b"ok"));
        down.extend(frame(Operation::StartBackup, Status::Continue, "alice", 0, b"f"));
        down.extend(frame(Operation::WriteChunk, Status::Final, "alice", 0, b"stored"));
        backend_w.write_all(&down).await.unwrap();

        let mut replies = Vec::new();
        client_r.read_to_end(&mut replies).await.unwrap();
        assert_eq!(replies, down);

        let report = tunnel.await.unwrap();
        assert_eq!(report.upstream, DirectionEnd::Complete);
        assert_eq!(report.downstream, DirectionEnd::Complete);
        assert_eq!(report.frames_up, 4);
        assert_eq!(report.frames_down, 3);
    }

    #[tokio::test]
    async fn backend_close_tears_down_client_side() {
        let (client, client_far) = duplex(4096);
        let (backend, backend_far) = duplex(4096);
        let (client_rd, client_wr) = tokio::io::split(client_far);
        let (backend_rd, backend_wr) = tokio::io::split(backend_far);

        let tunnel = tokio::spawn(async move {
            run_tunnel(
                (client_rd, client_wr),
                (backend_rd, backend_wr),
                "alice",
                config(),
            )
            .await
        });

        let (mut client_r, mut client_w) = tokio::io::split(client);
        client_w
            .write_all(&frame(Operation::Login, Status::Continue, "alice", 0, b"pw"))
            .await
            .unwrap();

        // Backend vanishes mid-session.
        drop(backend);

        let mut rest = Vec::new();
        let n = tokio::time::timeout(Duration::from_secs(2), client_r.read_to_end(&mut rest))
            .await
            .expect("client side was not closed")
            .unwrap();
        assert_eq!(n, 0);

        // Either the failed forward or the closed backend stops the tunnel first.
        let report = tunnel.await.unwrap();
        assert_ne!(report.downstream, DirectionEnd::Complete);
        assert_ne!(report.upstream, DirectionEnd::Complete);
        drop(client_w);
    }

    #[tokio::test]
    async fn frames_for_other_users_are_dropped() {
        let (client, client_far) = duplex(4096);
        let (backend, backend_far) = duplex(4096);
        let (client_rd, client_wr) = tokio::io::split(client_far);
        let (backend_rd, backend_wr) = tokio::io::split(backend_far);

        let tunnel = tokio::spawn(async move {
            run_tunnel(
                (client_rd, client_wr),
                (backend_rd, backend_wr),
                "alice",
                config(),
            )
            .await
        });

        let (_client_r, mut client_w) = tokio::io::split(client);
        let (mut backend_r, _backend_w) = tokio::io::split(backend);

        let stray = frame(Operation::ListBackups, Status::Continue, "mallory", 0, b"");
        let good = frame(Operation::ListBackups, Status::Continue, "alice", 0, b"");
        client_w.write_all(&stray).await.unwrap();
        client_w.write_all(&good).await.unwrap();

        let mut buf = vec![0u8; good.len()];
        backend_r.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, good);

        client_w.shutdown().await.unwrap();
        let report = tunnel.await.unwrap();
        assert_eq!(report.upstream, DirectionEnd::PeerClosed);
        assert_eq!(report.downstream, DirectionEnd::Cancelled);
        assert_eq!(report.frames_up, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_direction_times_out() {
        let (client, client_far) = duplex(4096);
        let (backend, backend_far) = duplex(4096);
        let (client_rd, client_wr) = tokio::io::split(client_far);
        let (backend_rd, backend_wr) = tokio::io::split(backend_far);

        let report = run_tunnel(
            (client_rd, client_wr),
            (backend_rd, backend_wr),
            "",
            TunnelConfig {
                idle_timeout: Duration::from_millis(200),
                rx_buffer: 8192,
            },
        )
        .await;

        assert!(
            report.upstream == DirectionEnd::IdleTimeout
                || report.downstream == DirectionEnd::IdleTimeout
        );
        drop((client, backend));
    }

    fn short_idle() -> TunnelConfig {
        TunnelConfig {
            idle_timeout: Duration::from_millis(300),
            rx_buffer: 8192,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_upload_outlives_idle_timeout() {
        let (client, client_far) = duplex(4096);
        let (backend, backend_far) = duplex(4096);
        let (client_rd, client_wr) = tokio::io::split(client_far);
        let (backend_rd, backend_wr) = tokio::io::split(backend_far);

        let tunnel = tokio::spawn(async move {
            run_tunnel(
                (client_rd, client_wr),
                (backend_rd, backend_wr),
                "alice",
                short_idle(),
            )
            .await
        });

        let (mut backend_r, mut backend_w) = tokio::io::split(backend);
        let backend = tokio::spawn(async move {
            backend_w
                .write_all(&frame(Operation::Login, Status::Continue, "alice", 0, b"ok"))
                .await
                .unwrap();
            backend_w
                .write_all(&frame(Operation::StartBackup, Status::Continue, "alice", 0, b"f"))
                .await
                .unwrap();
            // Nothing flows back until the upload ends.
            let mut seen = Vec::new();
            backend_r.read_to_end(&mut seen).await.unwrap();
            backend_w
                .write_all(&frame(Operation::WriteChunk, Status::Final, "alice", 0, b"stored"))
                .await
                .unwrap();
            seen
        });

        let (mut client_r, mut client_w) = tokio::io::split(client);
        let mut up = Vec::new();
        up.extend(frame(Operation::Login, Status::Continue, "alice", 0, b"pw"));
        up.extend(frame(Operation::StartBackup, Status::Continue, "alice", 0, b"f|1"));
        client_w.write_all(&up).await.unwrap();
        for seq in 0..10u32 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let chunk = frame(Operation::WriteChunk, Status::Continue, "alice", seq, b"AAAA");
            client_w.write_all(&chunk).await.unwrap();
            up.extend(chunk);
        }
        let last = frame(Operation::WriteChunk, Status::Final, "alice", 10, b"");
        client_w.write_all(&last).await.unwrap();
        up.extend(last);

        assert_eq!(backend.await.unwrap(), up);
        let mut replies = Vec::new();
        client_r.read_to_end(&mut replies).await.unwrap();

        let report = tunnel.await.unwrap();
        assert_eq!(report.upstream, DirectionEnd::Complete);
        assert_eq!(report.downstream, DirectionEnd::Complete);
        assert_eq!(report.frames_up, 13);
        assert_eq!(report.frames_down, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_fetch_outlives_idle_timeout() {
        let (client, client_far) = duplex(4096);
        let (backend, backend_far) = duplex(4096);
        let (client_rd, client_wr) = tokio::io::split(client_far);
        let (backend_rd, backend_wr) = tokio::io::split(backend_far);

        let tunnel = tokio::spawn(async move {
            run_tunnel(
                (client_rd, client_wr),
                (backend_rd, backend_wr),
                "alice",
                short_idle(),
            )
            .await
        });

        let (mut client_r, mut client_w) = tokio::io::split(client);
        client_w
            .write_all(&frame(Operation::Login, Status::Continue, "alice", 0, b"pw"))
            .await
            .unwrap();
        client_w
            .write_all(&frame(Operation::FetchBackup, Status::Continue, "alice", 0, b"f"))
            .await
            .unwrap();

        let (_backend_r, mut backend_w) = tokio::io::split(backend);
        let mut down = frame(Operation::Login, Status::Continue, "alice", 0, b"ok");
        backend_w.write_all(&down).await.unwrap();
        for seq in 0..10u32 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let chunk = frame(Operation::FetchBackup, Status::Continue, "alice", seq, b"BBBB");
            backend_w.write_all(&chunk).await.unwrap();
            down.extend(chunk);
        }
        let last = frame(Operation::FetchBackup, Status::Final, "alice", 10, b"");
        backend_w.write_all(&last).await.unwrap();
        down.extend(last);

        let mut replies = Vec::new();
        client_r.read_to_end(&mut replies).await.unwrap();
        assert_eq!(replies, down);

        let report = tunnel.await.unwrap();
        assert_eq!(report.downstream, DirectionEnd::Complete);
        assert_eq!(report.upstream, DirectionEnd::Cancelled);
        assert_eq!(report.frames_down, 12);
        drop(client_w);
    }

    #[tokio::test]
    async fn oversized_frame_fails_the_direction() {
        let (client, client_far) = duplex(4096);
        let (backend, backend_far) = duplex(4096);
        let (client_rd, client_wr) = tokio::io::split(client_far);
        let (backend_rd, backend_wr) = tokio::io::split(backend_far);

        let tunnel = tokio::spawn(async move {
            run_tunnel(
                (client_rd, client_wr),
                (backend_rd, backend_wr),
                "",
                TunnelConfig {
                    idle_timeout: Duration::from_secs(5),
                    rx_buffer: 64,
                },
            )
            .await
        });

        let (_client_r, mut client_w) = tokio::io::split(client);
        let big = encode_frame(Operation::WriteChunk as u8, 0, "a", 0, &[7u8; 200], 1024).unwrap();
        client_w.write_all(&big).await.unwrap();

        let report = tunnel.await.unwrap();
        assert!(matches!(report.upstream, DirectionEnd::Failed(_)));
        assert_eq!(report.frames_up, 0);
        drop(backend);
    }
}
