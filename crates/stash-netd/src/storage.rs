//! Storage server: accepts backup sessions directly, or behind a gateway.

use std::net::SocketAddr;
use std::sync::Arc;

use stash_netproto::stream::{FrameReader, FrameWriter};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::backup::BackupService;
use crate::backup::session::{BackupSession, Flow};
use crate::error::SessionError;

/// Bind `bind` and serve backup sessions until the listener fails.
pub async fn run_storage_server(
    bind: SocketAddr,
    service: Arc<BackupService>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind).await?;
    info!(addr = %listener.local_addr()?, "Storage server listening");
    run_storage_listener(listener, service).await
}

/// Accept loop on an existing listener. One task per connection.
pub async fn run_storage_listener(
    listener: TcpListener,
    service: Arc<BackupService>,
) -> anyhow::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let service = Arc::clone(&service);
        tokio::spawn(async move {
            serve_tcp(stream, peer, service).await;
        });
    }
}

/// Serve one accepted TCP connection, logging how it ended.
pub async fn serve_tcp(stream: TcpStream, peer: SocketAddr, service: Arc<BackupService>) {
    let _ = stream.set_nodelay(true);
    let (rd, wr) = stream.into_split();
    match serve_backup_connection(rd, wr, service).await {
        Ok(()) => debug!(%peer, "Session closed"),
        Err(e) => warn!(%peer, error = %e, class = ?e.class(), "Session aborted"),
    }
}

/// Drive one backup session over a read/write pair.
///
/// Frames are handled strictly in arrival order. The session ends when the
/// peer closes, when a handler asks to close, on a fatal error, or when the
/// peer stays silent longer than the configured idle timeout. An unfinished
/// upload is discarded in every case.
pub async fn serve_backup_connection<R, W>(
    rd: R,
    wr: W,
    service: Arc<BackupService>,
) -> Result<(), SessionError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let limits = service.limits();
    let idle = service.idle_timeout();
    let mut reader = FrameReader::new(rd, limits.rx_buffer);
    let mut writer = FrameWriter::new(wr, "", limits.max_payload);
    let mut session = BackupSession::new(service);

    let result = loop {
        let next = match timeout(idle, reader.next_frame()).await {
            Ok(next) => next,
            Err(_) => {
                warn!(state = session.state().name(), "Session idle too long");
                break Err(SessionError::Timeout("next frame"));
            }
        };

        let received = match next {
            Ok(Some(received)) => received,
            Ok(None) => break Ok(()),
            Err(e) => break Err(e.into()),
        };

        match session.handle(&received.frame, &mut writer).await {
            Ok(Flow::Continue) => {}
            Ok(Flow::Close) => break Ok(()),
            Err(e) => break Err(e),
        }
    };

    session.close().await;
    let _ = writer.shutdown().await;
    result
}
