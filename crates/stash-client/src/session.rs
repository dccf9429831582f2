//! Client side of a backup session.
//!
//! A session is one login followed by one transfer (backup, list or fetch).
//! Through a gateway the tunnel closes once the transfer completes, so a new
//! [`SessionClient`] is needed for each transfer. Failed list and fetch
//! requests leave the session usable.

use std::net::SocketAddr;
use std::path::Path;
use std::time::UNIX_EPOCH;

use stash_netproto::{
    frame::Frame,
    op::{Operation, Status},
    stream::{FrameReader, FrameWriter},
    termination::ExchangeTracker,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{
    TcpStream,
    tcp::{OwnedReadHalf, OwnedWriteHalf},
};
use tokio::time::timeout;
use tracing::{debug, info};

use crate::config::{ClientConfig, Route};
use crate::error::ClientError;

/// Summary of a finished upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupReceipt {
    pub name: String,
    pub bytes: u64,
    pub chunks: u32,
    /// Server acknowledgement text.
    pub message: String,
}

/// Ask the gateway for a session port.
pub async fn negotiate_port(
    gateway: SocketAddr,
    config: &ClientConfig,
) -> Result<u16, ClientError> {
    let stream = connect(gateway, config).await?;
    let (rd, wr) = stream.into_split();
    let mut writer = FrameWriter::new(wr, config.username.as_str(), config.limits.max_payload);
    writer
        .send(Operation::PortRequest, Status::Continue, 0, b"")
        .await?;

    let mut reader = FrameReader::new(rd, config.limits.rx_buffer);
    let reply = match timeout(config.timeout, reader.next_frame()).await {
        Err(_) => return Err(ClientError::Timeout("port reply")),
        Ok(next) => next?.ok_or(ClientError::ConnectionClosed)?.frame,
    };
    let reply = check_reply(reply, Operation::PortRequest)?;

    let text = reply.payload_text();
    match text.trim().parse::<u16>() {
        Ok(port) if port != 0 => {
            debug!(port, "Session port assigned");
            Ok(port)
        }
        _ => Err(ClientError::BadPort(text)),
    }
}

async fn connect(addr: SocketAddr, config: &ClientConfig) -> Result<TcpStream, ClientError> {
    let stream = match timeout(config.timeout, TcpStream::connect(addr)).await {
        Err(_) => return Err(ClientError::Timeout("connect")),
        Ok(Err(e)) => return Err(ClientError::ConnectionFailed(format!("{addr}: {e}"))),
        Ok(Ok(stream)) => stream,
    };
    let _ = stream.set_nodelay(true);
    Ok(stream)
}

/// Reject replies for another operation and turn error statuses into errors.
fn check_reply(frame: Frame, op: Operation) -> Result<Frame, ClientError> {
    if frame.op() != Some(op) {
        return Err(ClientError::UnexpectedReply(format!(
            "expected {op:?}, got op {}",
            frame.operation
        )));
    }
    if let Some(status) = frame.error() {
        return Err(ClientError::Rejected {
            status,
            message: frame.payload_text(),
        });
    }
    Ok(frame)
}

/// An authenticated session.
pub struct SessionClient {
    reader: FrameReader<OwnedReadHalf>,
    writer: FrameWriter<OwnedWriteHalf>,
    replies: ExchangeTracker,
    config: ClientConfig,
    peer: SocketAddr,
}

impl SessionClient {
    /// Reach the service along `config.route` and log in.
    pub async fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        let addr = match config.route {
            Route::Direct(addr) => addr,
            Route::Gateway(gateway) => {
                let port = negotiate_port(gateway, &config).await?;
                SocketAddr::new(gateway.ip(), port)
            }
        };

        let stream = connect(addr, &config).await?;
        let (rd, wr) = stream.into_split();
        let mut client = Self {
            reader: FrameReader::new(rd, config.limits.rx_buffer),
            writer: FrameWriter::new(wr, config.username.as_str(), config.limits.max_payload),
            replies: ExchangeTracker::replies(),
            config,
            peer: addr,
        };
        client.login().await?;
        Ok(client)
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn username(&self) -> &str {
        &self.config.username
    }

    /// Send one frame as this session's user.
    pub async fn send(
        &mut self,
        op: Operation,
        status: Status,
        seq: u32,
        payload: &[u8],
    ) -> Result<(), ClientError> {
        self.writer.send(op, status, seq, payload).await?;
        Ok(())
    }

    /// Next reply frame, whatever it is.
    pub async fn recv(&mut self) -> Result<Frame, ClientError> {
        let received = match timeout(self.config.timeout, self.reader.next_frame()).await {
            Err(_) => return Err(ClientError::Timeout("reply")),
            Ok(next) => next?.ok_or(ClientError::ConnectionClosed)?,
        };
        let frame = received.frame;
        let observed = self.replies.observe(&frame);
        if !observed.in_sequence && frame.error().is_none() {
            return Err(ClientError::UnexpectedReply(format!(
                "sequence {} where {} was expected",
                frame.sequence, observed.expected
            )));
        }
        Ok(frame)
    }

    async fn expect_reply(&mut self, op: Operation) -> Result<Frame, ClientError> {
        let frame = self.recv().await?;
        check_reply(frame, op)
    }

    async fn login(&mut self) -> Result<(), ClientError> {
        let password = self.config.password.clone();
        self.send(Operation::Login, Status::Continue, 0, password.as_bytes())
            .await?;
        let reply = self.expect_reply(Operation::Login).await?;
        info!(
            user = %self.config.username,
            peer = %self.peer,
            reply = %reply.payload_text(),
            "Logged in"
        );
        Ok(())
    }

    /// Upload everything `data` yields as artifact `name`.
    pub async fn backup<R>(
        &mut self,
        name: &str,
        timestamp: u64,
        mut data: R,
    ) -> Result<BackupReceipt, ClientError>
    where
        R: AsyncRead + Unpin,
    {
        let start = format!("{name}|{timestamp}");
        self.send(Operation::StartBackup, Status::Continue, 0, start.as_bytes())
            .await?;
        self.expect_reply(Operation::StartBackup).await?;

        let mut buf = vec![0u8; self.writer.max_payload()];
        let mut seq = 0u32;
        let mut bytes = 0u64;
        loop {
            let n = data.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            self.writer
                .send(Operation::WriteChunk, Status::Continue, seq, &buf[..n])
                .await?;
            seq += 1;
            bytes += n as u64;
        }
        self.writer
            .send(Operation::WriteChunk, Status::Final, seq, b"")
            .await?;
        self.writer.flush().await?;

        let ack = self.expect_reply(Operation::WriteChunk).await?;
        if !ack.is_final() {
            return Err(ClientError::UnexpectedReply(
                "write acknowledgement is not final".to_string(),
            ));
        }
        info!(artifact = name, bytes, chunks = seq, "Backup complete");
        Ok(BackupReceipt {
            name: name.to_string(),
            bytes,
            chunks: seq,
            message: ack.payload_text(),
        })
    }

    /// Upload a local file under its file name, stamped with its modification time.
    pub async fn backup_file(&mut self, path: &Path) -> Result<BackupReceipt, ClientError> {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            let msg = format!("no file name in {}", path.display());
            return Err(ClientError::Io(std::io::Error::other(msg)));
        };
        let name = name.to_string();
        let file = tokio::fs::File::open(path).await?;
        let timestamp = file
            .metadata()
            .await?
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map_or(0, |d| d.as_secs());
        self.backup(&name, timestamp, file).await
    }

    /// Names of this user's stored artifacts.
    pub async fn list(&mut self) -> Result<Vec<String>, ClientError> {
        self.send(Operation::ListBackups, Status::Continue, 0, b"")
            .await?;
        let mut names = Vec::new();
        loop {
            let frame = self.expect_reply(Operation::ListBackups).await?;
            if frame.is_final() {
                return Ok(names);
            }
            names.push(frame.payload_text());
        }
    }

    /// Download artifact `name` into `out`. Returns the number of bytes written.
    pub async fn fetch<W>(&mut self, name: &str, mut out: W) -> Result<u64, ClientError>
    where
        W: AsyncWrite + Unpin,
    {
        self.send(Operation::FetchBackup, Status::Continue, 0, name.as_bytes())
            .await?;
        let mut bytes = 0u64;
        loop {
            let frame = self.expect_reply(Operation::FetchBackup).await?;
            out.write_all(&frame.payload).await?;
            bytes += frame.payload.len() as u64;
            if frame.is_final() {
                break;
            }
        }
        out.flush().await?;
        Ok(bytes)
    }

    /// Close the connection.
    pub async fn close(mut self) {
        let _ = self.writer.shutdown().await;
    }
}
