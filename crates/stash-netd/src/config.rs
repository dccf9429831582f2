//! Runtime configuration for the gateway and storage server.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::time::Duration;

use stash_netproto::constants::{GATEWAY_PORT, STORAGE_PORT};
use stash_netproto::limits::Limits;

/// Ports handed out for per-session listeners.
pub const DEFAULT_PORT_RANGE: RangeInclusive<u16> = 50000..=50999;

/// Gateway settings.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Well-known address that receives port requests.
    pub listen: SocketAddr,
    /// Address ephemeral session listeners bind to.
    pub ephemeral_host: IpAddr,
    /// Ephemeral port pool.
    pub port_range: RangeInclusive<u16>,
    /// How long a client has to send its port request, and then to reconnect
    /// on the port it was given.
    pub reconnect_timeout: Duration,
    /// Upper bound on opening the backend connection.
    pub connect_timeout: Duration,
    /// Maximum silence in either tunnel direction before the session is torn down.
    pub idle_timeout: Duration,
    pub limits: Limits,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], GATEWAY_PORT)),
            ephemeral_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port_range: DEFAULT_PORT_RANGE,
            reconnect_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(60),
            limits: Limits::default(),
        }
    }
}

/// Storage server settings.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub listen: SocketAddr,
    /// Artifacts live under `<root>/<username>/`.
    pub root: PathBuf,
    /// Maximum time a session may sit between frames (including mid-upload)
    /// before it is aborted.
    pub idle_timeout: Duration,
    pub limits: Limits,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], STORAGE_PORT)),
            root: PathBuf::from("backups"),
            idle_timeout: Duration::from_secs(60),
            limits: Limits::default(),
        }
    }
}
