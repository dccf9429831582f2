use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::ops::RangeInclusive;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use stash_client::{ClientConfig, ClientError, Route, SessionClient, negotiate_port};
use stash_netd::{
    BackupService, Gateway, GatewayConfig, Upstream,
    backup::{credentials::StaticCredentials, store::ArtifactStore},
    run_storage_listener,
};
use stash_netproto::{limits::Limits, op::Status};
use tokio::net::TcpListener;

fn service(root: &Path) -> Arc<BackupService> {
    Arc::new(BackupService::new(
        ArtifactStore::new(root),
        Arc::new(StaticCredentials::new().with_user("alice", "pw")),
        Limits::default(),
        Duration::from_secs(5),
    ))
}

async fn spawn_storage(root: &Path) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let service = service(root);
    tokio::spawn(async move {
        let _ = run_storage_listener(listener, service).await;
    });
    addr
}

async fn spawn_gateway(ports: RangeInclusive<u16>, upstream: Upstream) -> SocketAddr {
    let config = GatewayConfig {
        listen: "127.0.0.1:0".parse().unwrap(),
        ephemeral_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port_range: ports,
        reconnect_timeout: Duration::from_secs(5),
        connect_timeout: Duration::from_secs(2),
        idle_timeout: Duration::from_secs(5),
        limits: Limits::default(),
    };
    let listener = TcpListener::bind(config.listen).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let gateway = Gateway::new(config, upstream);
    tokio::spawn(async move {
        let _ = gateway.run(listener).await;
    });
    addr
}

fn config(route: Route, password: &str) -> ClientConfig {
    let mut config = ClientConfig::new(route, "alice", password);
    config.timeout = Duration::from_secs(5);
    config
}

#[tokio::test]
async fn backup_list_fetch_through_gateway() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let backend = spawn_storage(dir.path()).await;
    let gateway = spawn_gateway(47200..=47209, Upstream::Backend(backend)).await;
    let route = Route::Gateway(gateway);

    // Larger than one payload so the upload spans several chunks.
    let data: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
    let mut session = SessionClient::connect(config(route, "pw")).await?;
    let receipt = session.backup("blob.bin", 1_700_000_000, &data[..]).await?;
    assert_eq!(receipt.bytes, 3000);
    assert_eq!(receipt.chunks, 3);
    session.close().await;

    let mut session = SessionClient::connect(config(route, "pw")).await?;
    assert_eq!(session.list().await?, vec!["blob.bin"]);
    session.close().await;

    let mut session = SessionClient::connect(config(route, "pw")).await?;
    let mut fetched = Vec::new();
    let n = session.fetch("blob.bin", &mut fetched).await?;
    assert_eq!(n, 3000);
    assert_eq!(fetched, data);
    Ok(())
}

#[tokio::test]
async fn backup_file_uses_file_name() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let src = tempfile::tempdir()?;
    let path = src.path().join("file1.txt");
    std::fs::write(&path, b"AAAA")?;

    let gateway = spawn_gateway(47210..=47219, Upstream::Local(service(dir.path()))).await;
    let mut session = SessionClient::connect(config(Route::Gateway(gateway), "pw")).await?;
    let receipt = session.backup_file(&path).await?;
    assert_eq!(receipt.name, "file1.txt");
    assert_eq!(receipt.bytes, 4);
    assert_eq!(std::fs::read(dir.path().join("alice").join("file1.txt"))?, b"AAAA");
    Ok(())
}

#[tokio::test]
async fn wrong_password_is_rejected() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let storage = spawn_storage(dir.path()).await;

    let err = SessionClient::connect(config(Route::Direct(storage), "nope"))
        .await
        .err()
        .expect("login should fail");
    assert_eq!(err.status(), Some(Status::LoginFailed));
    Ok(())
}

#[tokio::test]
async fn missing_artifact_leaves_session_usable() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let backend = spawn_storage(dir.path()).await;
    let gateway = spawn_gateway(47220..=47229, Upstream::Backend(backend)).await;

    let mut session = SessionClient::connect(config(Route::Gateway(gateway), "pw")).await?;
    let err = session.fetch("ghost", Vec::new()).await.unwrap_err();
    assert!(matches!(
        err,
        ClientError::Rejected { status: Status::NotFound, .. }
    ));

    assert!(session.list().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn exhausted_gateway_reports_no_ports() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let gateway = spawn_gateway(47230..=47230, Upstream::Local(service(dir.path()))).await;
    let cfg = config(Route::Gateway(gateway), "pw");

    // Claims the only port and holds it until reconnect times out.
    let port = negotiate_port(gateway, &cfg).await?;
    assert_eq!(port, 47230);

    let err = negotiate_port(gateway, &cfg).await.unwrap_err();
    assert_eq!(err.status(), Some(Status::NoPortsAvailable));
    Ok(())
}
