use std::net::SocketAddr;
use std::time::Duration;

use stash_netproto::limits::Limits;

/// How a client reaches the storage service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Ask the gateway for a session port, then reconnect on it.
    Gateway(SocketAddr),
    /// Talk to a storage server directly.
    Direct(SocketAddr),
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub route: Route,
    pub username: String,
    pub password: String,
    pub limits: Limits,
    /// Upper bound on connecting and on waiting for each reply.
    pub timeout: Duration,
}

impl ClientConfig {
    pub fn new(route: Route, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            route,
            username: username.into(),
            password: password.into(),
            limits: Limits::default(),
            timeout: Duration::from_secs(10),
        }
    }
}
