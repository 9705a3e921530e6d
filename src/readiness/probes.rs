//! Stock probes: closures, TCP reachability, local network, display server presence

use async_trait::async_trait;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;
use sysinfo::{Networks, ProcessesToUpdate, System};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use super::Probe;

/// Wraps a synchronous predicate
pub struct FnProbe<F> {
    check: F,
}

impl<F> FnProbe<F>
where
    F: Fn() -> bool + Send + Sync,
{
    pub fn new(check: F) -> Self {
        Self { check }
    }
}

#[async_trait]
impl<F> Probe for FnProbe<F>
where
    F: Fn() -> bool + Send + Sync,
{
    async fn check(&self) -> bool {
        (self.check)()
    }
}

/// Succeeds when a TCP connection to `addr` can be opened
#[derive(Debug, Clone)]
pub struct TcpProbe {
    addr: String,
    connect_timeout: Duration,
}

impl TcpProbe {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout: Duration::from_secs(2),
        }
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

#[async_trait]
impl Probe for TcpProbe {
    async fn check(&self) -> bool {
        match timeout(self.connect_timeout, TcpStream::connect(&self.addr)).await {
            Ok(Ok(_stream)) => true,
            Ok(Err(e)) => {
                debug!("probe {} failed: {}", self.addr, e);
                false
            }
            Err(_) => {
                debug!("probe {} timed out", self.addr);
                false
            }
        }
    }
}

/// Local network readiness: an interface holds a routable address.
///
/// With `interface` set only that interface counts. Loopback, unspecified
/// and link-local addresses never count, so a node whose DHCP lease has
/// not arrived yet is still pending.
#[derive(Debug, Clone, Default)]
pub struct NetworkProbe {
    interface: Option<String>,
}

impl NetworkProbe {
    pub fn new(interface: Option<String>) -> Self {
        Self { interface }
    }

    fn interfaces() -> Vec<(String, Vec<IpAddr>)> {
        Networks::new_with_refreshed_list()
            .iter()
            .map(|(name, data)| {
                let addrs = data.ip_networks().iter().map(|network| network.addr).collect();
                (name.clone(), addrs)
            })
            .collect()
    }
}

fn routable(addr: &IpAddr) -> bool {
    if addr.is_loopback() || addr.is_unspecified() {
        return false;
    }
    match addr {
        IpAddr::V4(v4) => !v4.is_link_local(),
        IpAddr::V6(v6) => v6.segments()[0] & 0xffc0 != 0xfe80,
    }
}

fn has_routable_address(interfaces: &[(String, Vec<IpAddr>)], wanted: Option<&str>) -> bool {
    interfaces
        .iter()
        .filter(|(name, _)| wanted.map_or(true, |wanted| wanted == name))
        .any(|(_, addrs)| addrs.iter().any(routable))
}

#[async_trait]
impl Probe for NetworkProbe {
    async fn check(&self) -> bool {
        let interfaces = tokio::task::spawn_blocking(Self::interfaces)
            .await
            .unwrap_or_default();
        let ready = has_routable_address(&interfaces, self.interface.as_deref());
        if !ready {
            debug!("no routable address on {}", self.interface.as_deref().unwrap_or("any interface"));
        }
        ready
    }
}

/// Display server readiness: any known socket exists, or any known
/// compositor/X server process is running.
#[derive(Debug, Clone, Default)]
pub struct DisplayProbe {
    sockets: Vec<PathBuf>,
    processes: Vec<String>,
}

impl DisplayProbe {
    pub fn new(sockets: Vec<PathBuf>, processes: Vec<String>) -> Self {
        Self { sockets, processes }
    }

    fn process_running(names: &[String]) -> bool {
        if names.is_empty() {
            return false;
        }
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::All, true);
        system.processes().values().any(|process| {
            let name = process.name().to_string_lossy();
            names.iter().any(|wanted| *wanted == name)
        })
    }
}

#[async_trait]
impl Probe for DisplayProbe {
    async fn check(&self) -> bool {
        if self.sockets.iter().any(|socket| socket.exists()) {
            return true;
        }

        let names = self.processes.clone();
        tokio::task::spawn_blocking(move || Self::process_running(&names))
            .await
            .unwrap_or(false)
    }
}
