//! Per-connection backup state machine.
//!
//! ```text
//! AwaitingLogin --login ok--> Authenticated --any request--> Idle
//! Idle --start backup--> ReceivingBackup --final chunk--> Idle
//! any --login failure / fatal error / disconnect--> Closed
//! ```
//!
//! Requests that are wrong for the current state are answered with an error
//! status and leave the state untouched.

use std::sync::Arc;

use stash_netproto::{
    frame::Frame,
    op::{Operation, Status},
    stream::FrameWriter,
};
use tokio::io::{AsyncReadExt, AsyncWrite};
use tracing::{debug, info, warn};

use super::BackupService;
use super::store::{BackupId, StoreError, Upload};
use crate::error::SessionError;

#[derive(Debug)]
pub enum SessionState {
    AwaitingLogin,
    Authenticated,
    Idle,
    ReceivingBackup(Upload),
    Closed,
}

impl SessionState {
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::AwaitingLogin => "awaiting-login",
            SessionState::Authenticated => "authenticated",
            SessionState::Idle => "idle",
            SessionState::ReceivingBackup(_) => "receiving-backup",
            SessionState::Closed => "closed",
        }
    }
}

/// What the connection loop does after a frame has been handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

pub struct BackupSession {
    service: Arc<BackupService>,
    state: SessionState,
    username: Option<String>,
}

impl BackupSession {
    pub fn new(service: Arc<BackupService>) -> Self {
        Self {
            service,
            state: SessionState::AwaitingLogin,
            username: None,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    /// Handle one request frame, writing any replies to `out`.
    ///
    /// Errors returned here are transport or protocol failures on `out`;
    /// application failures are reported to the peer instead.
    pub async fn handle<W>(
        &mut self,
        frame: &Frame,
        out: &mut FrameWriter<W>,
    ) -> Result<Flow, SessionError>
    where
        W: AsyncWrite + Unpin,
    {
        if matches!(self.state, SessionState::Closed) {
            return Ok(Flow::Close);
        }

        if let Some(owner) = &self.username
            && frame.username != *owner
        {
            warn!(
                owner = %owner,
                username = %frame.username,
                op = frame.operation,
                "Discarding frame addressed to another user"
            );
            return Ok(Flow::Continue);
        }

        let Some(op) = frame.op() else {
            warn!(op = frame.operation, "Unknown operation (ignored)");
            return Ok(Flow::Continue);
        };

        match op {
            Operation::Login => self.login(frame, out).await,
            Operation::PortRequest => {
                out.set_username(&frame.username);
                refuse(out, op, Status::BadRequest, "port requests go to the gateway").await?;
                Ok(Flow::Continue)
            }
            _ => {
                let Some(user) = self.username.clone() else {
                    out.set_username(&frame.username);
                    refuse(out, op, Status::NotAuthenticated, "login required").await?;
                    return Ok(Flow::Continue);
                };
                if matches!(self.state, SessionState::Authenticated) {
                    self.state = SessionState::Idle;
                }
                match op {
                    Operation::StartBackup => self.start_backup(&user, frame, out).await,
                    Operation::WriteChunk => self.write_chunk(frame, out).await,
                    Operation::ListBackups => self.list(&user, out).await,
                    Operation::FetchBackup => self.fetch(&user, frame, out).await,
                    Operation::Login | Operation::PortRequest => Ok(Flow::Continue),
                }
            }
        }
    }

    /// Tear the session down, discarding an unfinished upload.
    pub async fn close(&mut self) {
        if let SessionState::ReceivingBackup(upload) =
            std::mem::replace(&mut self.state, SessionState::Closed)
        {
            warn!(
                path = %upload.target().display(),
                received = upload.written(),
                "Session ended mid-upload; discarding partial artifact"
            );
            upload.discard().await;
        }
    }

    async fn login<W>(
        &mut self,
        frame: &Frame,
        out: &mut FrameWriter<W>,
    ) -> Result<Flow, SessionError>
    where
        W: AsyncWrite + Unpin,
    {
        out.set_username(&frame.username);
        if !matches!(self.state, SessionState::AwaitingLogin) {
            refuse(out, Operation::Login, Status::BadRequest, "already logged in").await?;
            return Ok(Flow::Continue);
        }

        if self
            .service
            .credentials()
            .verify(&frame.username, &frame.payload)
        {
            info!(username = %frame.username, "Login accepted");
            self.username = Some(frame.username.clone());
            self.state = SessionState::Authenticated;
            reply(out, Operation::Login, Status::Continue, 0, b"welcome").await?;
            Ok(Flow::Continue)
        } else {
            warn!(username = %frame.username, "Login rejected");
            self.state = SessionState::Closed;
            refuse(out, Operation::Login, Status::LoginFailed, "invalid credentials").await?;
            Ok(Flow::Close)
        }
    }

    async fn start_backup<W>(
        &mut self,
        user: &str,
        frame: &Frame,
        out: &mut FrameWriter<W>,
    ) -> Result<Flow, SessionError>
    where
        W: AsyncWrite + Unpin,
    {
        if matches!(self.state, SessionState::ReceivingBackup(_)) {
            refuse(out, Operation::StartBackup, Status::BadRequest, "backup already in progress")
                .await?;
            return Ok(Flow::Continue);
        }

        let opened = match BackupId::parse(&frame.payload) {
            Ok(id) => self.service.store().begin_upload(user, &id).await.map(|u| (id, u)),
            Err(e) => Err(e),
        };
        match opened {
            Ok((id, upload)) => {
                info!(
                    username = user,
                    artifact = %id.name,
                    timestamp = ?id.timestamp,
                    "Backup started"
                );
                self.state = SessionState::ReceivingBackup(upload);
                reply(out, Operation::StartBackup, Status::Continue, 0, id.name.as_bytes()).await?;
                Ok(Flow::Continue)
            }
            Err(e) => {
                warn!(username = user, error = %e, "Cannot create artifact");
                self.state = SessionState::Closed;
                refuse(out, Operation::StartBackup, Status::CannotCreateArtifact, e).await?;
                Ok(Flow::Close)
            }
        }
    }

    async fn write_chunk<W>(
        &mut self,
        frame: &Frame,
        out: &mut FrameWriter<W>,
    ) -> Result<Flow, SessionError>
    where
        W: AsyncWrite + Unpin,
    {
        let SessionState::ReceivingBackup(upload) = &mut self.state else {
            refuse(out, Operation::WriteChunk, Status::BadRequest, "no backup in progress").await?;
            return Ok(Flow::Continue);
        };

        if let Err(e) = upload.append(&frame.payload).await {
            warn!(error = %e, "Writing chunk failed");
            self.close().await;
            refuse(out, Operation::WriteChunk, Status::Internal, e).await?;
            return Ok(Flow::Close);
        }
        if !frame.is_final() {
            return Ok(Flow::Continue);
        }

        let finished = std::mem::replace(&mut self.state, SessionState::Idle);
        let SessionState::ReceivingBackup(upload) = finished else {
            return Ok(Flow::Continue);
        };
        match upload.finish().await {
            Ok(bytes) => {
                info!(bytes, "Backup stored");
                let msg = format!("stored {bytes} bytes");
                reply(out, Operation::WriteChunk, Status::Final, 0, msg.as_bytes()).await?;
                Ok(Flow::Continue)
            }
            Err(e) => {
                warn!(error = %e, "Committing artifact failed");
                self.state = SessionState::Closed;
                refuse(out, Operation::WriteChunk, Status::Internal, e).await?;
                Ok(Flow::Close)
            }
        }
    }

    async fn list<W>(&mut self, user: &str, out: &mut FrameWriter<W>) -> Result<Flow, SessionError>
    where
        W: AsyncWrite + Unpin,
    {
        let names = match self.service.store().list(user).await {
            Ok(names) => names,
            Err(e) => {
                warn!(username = user, error = %e, "Listing artifacts failed");
                refuse(out, Operation::ListBackups, Status::Internal, e).await?;
                return Ok(Flow::Continue);
            }
        };

        let mut seq = 0u32;
        for name in &names {
            if name.len() > out.max_payload() {
                warn!(name = %name, "Artifact name exceeds payload limit; not listed");
                continue;
            }
            reply(out, Operation::ListBackups, Status::Continue, seq, name.as_bytes()).await?;
            seq += 1;
        }
        reply(out, Operation::ListBackups, Status::Final, seq, b"").await?;
        debug!(username = user, count = seq, "Listed artifacts");
        Ok(Flow::Continue)
    }

    async fn fetch<W>(
        &mut self,
        user: &str,
        frame: &Frame,
        out: &mut FrameWriter<W>,
    ) -> Result<Flow, SessionError>
    where
        W: AsyncWrite + Unpin,
    {
        let name = frame.payload_text();
        let mut file = match self.service.store().open(user, &name).await {
            Ok(file) => file,
            Err(e @ (StoreError::NotFound(_) | StoreError::InvalidName { .. })) => {
                refuse(out, Operation::FetchBackup, Status::NotFound, e).await?;
                return Ok(Flow::Continue);
            }
            Err(e) => {
                refuse(out, Operation::FetchBackup, Status::Internal, e).await?;
                return Ok(Flow::Continue);
            }
        };

        let mut buf = vec![0u8; out.max_payload()];
        let mut seq = 0u32;
        loop {
            let n = match file.read(&mut buf).await {
                Ok(n) => n,
                Err(e) => {
                    warn!(artifact = %name, error = %e, "Reading artifact failed");
                    refuse(out, Operation::FetchBackup, Status::Internal, e).await?;
                    return Ok(Flow::Continue);
                }
            };
            if n == 0 {
                break;
            }
            reply(out, Operation::FetchBackup, Status::Continue, seq, &buf[..n]).await?;
            seq += 1;
        }
        reply(out, Operation::FetchBackup, Status::Final, seq, b"").await?;
        info!(username = user, artifact = %name, chunks = seq, "Artifact sent");
        Ok(Flow::Continue)
    }
}

async fn reply<W>(
    out: &mut FrameWriter<W>,
    op: Operation,
    status: Status,
    seq: u32,
    payload: &[u8],
) -> Result<(), SessionError>
where
    W: AsyncWrite + Unpin,
{
    out.send(op, status, seq, payload).await?;
    out.flush().await?;
    Ok(())
}

/// Single-frame error reply carrying a diagnostic.
async fn refuse<W>(
    out: &mut FrameWriter<W>,
    op: Operation,
    status: Status,
    message: impl std::fmt::Display,
) -> Result<(), SessionError>
where
    W: AsyncWrite + Unpin,
{
    reply(out, op, status, 0, message.to_string().as_bytes()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::credentials::StaticCredentials;
    use crate::backup::store::ArtifactStore;
    use stash_netproto::{codec::decode_frame, limits::Limits};
    use std::time::Duration;

    fn service(root: &std::path::Path) -> Arc<BackupService> {
        let creds = StaticCredentials::new().with_user("alice", "pw");
        Arc::new(BackupService::new(
            ArtifactStore::new(root),
            Arc::new(creds),
            Limits::default(),
            Duration::from_secs(5),
        ))
    }

    fn req(op: Operation, status: Status, seq: u32, payload: &[u8]) -> Frame {
        Frame::new(op, status, "alice", seq, payload.to_vec())
    }

    fn replies(buf: &[u8]) -> Vec<Frame> {
        let mut frames = Vec::new();
        let mut rest = buf;
        while !rest.is_empty() {
            let (frame, used) = decode_frame(rest).unwrap();
            frames.push(frame);
            rest = &rest[used..];
        }
        frames
    }

    #[tokio::test]
    async fn requests_before_login_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = BackupSession::new(service(dir.path()));
        let mut out = FrameWriter::new(Vec::new(), "", 1024);

        let flow = session
            .handle(&req(Operation::ListBackups, Status::Continue, 0, b""), &mut out)
            .await
            .unwrap();
        assert_eq!(flow, Flow::Continue);
        assert!(matches!(session.state(), SessionState::AwaitingLogin));

        let sent = replies(out.get_ref());
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].error(), Some(Status::NotAuthenticated));
    }

    #[tokio::test]
    async fn failed_login_closes_session() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = BackupSession::new(service(dir.path()));
        let mut out = FrameWriter::new(Vec::new(), "", 1024);

        let flow = session
            .handle(&req(Operation::Login, Status::Continue, 0, b"nope"), &mut out)
            .await
            .unwrap();
        assert_eq!(flow, Flow::Close);
        assert!(matches!(session.state(), SessionState::Closed));
        assert_eq!(replies(out.get_ref())[0].error(), Some(Status::LoginFailed));
    }

    #[tokio::test]
    async fn backup_walks_through_states() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = BackupSession::new(service(dir.path()));
        let mut out = FrameWriter::new(Vec::new(), "", 1024);

        session
            .handle(&req(Operation::Login, Status::Continue, 0, b"pw"), &mut out)
            .await
            .unwrap();
        assert!(matches!(session.state(), SessionState::Authenticated));

        session
            .handle(&req(Operation::StartBackup, Status::Continue, 0, b"file1.txt|1"), &mut out)
            .await
            .unwrap();
        assert!(matches!(session.state(), SessionState::ReceivingBackup(_)));

        session
            .handle(&req(Operation::WriteChunk, Status::Continue, 0, b"AAAA"), &mut out)
            .await
            .unwrap();
        session
            .handle(&req(Operation::WriteChunk, Status::Final, 1, b""), &mut out)
            .await
            .unwrap();
        assert!(matches!(session.state(), SessionState::Idle));

        let sent = replies(out.get_ref());
        assert_eq!(sent.len(), 3);
        assert!(sent.iter().all(|f| f.error().is_none()));
        assert_eq!(sent[2].op(), Some(Operation::WriteChunk));
        assert!(sent[2].is_final());

        let stored = std::fs::read(dir.path().join("alice").join("file1.txt")).unwrap();
        assert_eq!(stored, b"AAAA");
    }

    #[tokio::test]
    async fn chunk_without_backup_is_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = BackupSession::new(service(dir.path()));
        let mut out = FrameWriter::new(Vec::new(), "", 1024);

        session
            .handle(&req(Operation::Login, Status::Continue, 0, b"pw"), &mut out)
            .await
            .unwrap();
        let flow = session
            .handle(&req(Operation::WriteChunk, Status::Continue, 0, b"x"), &mut out)
            .await
            .unwrap();
        assert_eq!(flow, Flow::Continue);
        assert!(matches!(session.state(), SessionState::Idle));
        assert_eq!(replies(out.get_ref())[1].error(), Some(Status::BadRequest));
    }

    #[tokio::test]
    async fn invalid_artifact_name_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = BackupSession::new(service(dir.path()));
        let mut out = FrameWriter::new(Vec::new(), "", 1024);

        session
            .handle(&req(Operation::Login, Status::Continue, 0, b"pw"), &mut out)
            .await
            .unwrap();
        let flow = session
            .handle(&req(Operation::StartBackup, Status::Continue, 0, b"../escape|1"), &mut out)
            .await
            .unwrap();
        assert_eq!(flow, Flow::Close);
        assert_eq!(
            replies(out.get_ref())[1].error(),
            Some(Status::CannotCreateArtifact)
        );
    }

    #[tokio::test]
    async fn close_mid_upload_discards_partial() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = BackupSession::new(service(dir.path()));
        let mut out = FrameWriter::new(Vec::new(), "", 1024);

        session
            .handle(&req(Operation::Login, Status::Continue, 0, b"pw"), &mut out)
            .await
            .unwrap();
        session
            .handle(&req(Operation::StartBackup, Status::Continue, 0, b"big.bin"), &mut out)
            .await
            .unwrap();
        session
            .handle(&req(Operation::WriteChunk, Status::Continue, 0, b"half"), &mut out)
            .await
            .unwrap();
        session.close().await;

        assert!(matches!(session.state(), SessionState::Closed));
        let user_dir = dir.path().join("alice");
        assert_eq!(std::fs::read_dir(&user_dir).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn frames_from_other_users_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = BackupSession::new(service(dir.path()));
        let mut out = FrameWriter::new(Vec::new(), "", 1024);

        session
            .handle(&req(Operation::Login, Status::Continue, 0, b"pw"), &mut out)
            .await
            .unwrap();
        let stray = Frame::new(Operation::ListBackups, Status::Continue, "mallory", 0, Vec::new());
        session.handle(&stray, &mut out).await.unwrap();
        assert_eq!(replies(out.get_ref()).len(), 1);
    }

    #[tokio::test]
    async fn fetch_streams_chunks_then_final() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());
        std::fs::create_dir_all(dir.path().join("alice")).unwrap();
        std::fs::write(dir.path().join("alice").join("data.bin"), vec![9u8; 2500]).unwrap();

        let mut session = BackupSession::new(svc);
        let mut out = FrameWriter::new(Vec::new(), "", 1024);
        session
            .handle(&req(Operation::Login, Status::Continue, 0, b"pw"), &mut out)
            .await
            .unwrap();
        session
            .handle(&req(Operation::FetchBackup, Status::Continue, 0, b"data.bin"), &mut out)
            .await
            .unwrap();

        let sent = replies(out.get_ref());
        let fetch: Vec<_> = sent[1..].to_vec();
        let last = fetch.last().unwrap();
        assert!(last.is_final());
        assert!(last.payload.is_empty());
        assert_eq!(last.sequence as usize, fetch.len() - 1);

        let body: Vec<u8> = fetch.iter().flat_map(|f| f.payload.to_vec()).collect();
        assert_eq!(body, vec![9u8; 2500]);
        for (i, f) in fetch.iter().enumerate() {
            assert_eq!(f.sequence as usize, i);
            assert!(f.payload.len() <= 1024);
        }
    }

    #[tokio::test]
    async fn fetch_missing_artifact_reports_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = BackupSession::new(service(dir.path()));
        let mut out = FrameWriter::new(Vec::new(), "", 1024);
        session
            .handle(&req(Operation::Login, Status::Continue, 0, b"pw"), &mut out)
            .await
            .unwrap();
        let flow = session
            .handle(&req(Operation::FetchBackup, Status::Continue, 0, b"ghost"), &mut out)
            .await
            .unwrap();
        assert_eq!(flow, Flow::Continue);
        assert_eq!(replies(out.get_ref())[1].error(), Some(Status::NotFound));
    }
}
