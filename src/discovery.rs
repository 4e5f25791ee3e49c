//! mDNS discovery collaborator
//!
//! Browses the LAN for Sendspin servers and advertises this player. The
//! core only depends on [`Discovery::discover`] returning an optional
//! address; advertising is fire-and-forget on a 10-second cadence.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{Error, Result};

/// Service type browsed for servers
pub const SERVER_SERVICE_TYPE: &str = "_sendspin-server._tcp.local.";

/// Service type this player advertises
pub const PLAYER_SERVICE_TYPE: &str = "_sendspin._tcp.local.";

/// Advertisement refresh cadence
pub const ADVERTISE_INTERVAL_SECS: u64 = 10;

/// Protocol version published in the TXT record
const TXT_PROTOCOL_VERSION: &str = "1";

/// Server locator consumed by the supervisor
///
/// `discover` browses until a server resolves or the timeout elapses;
/// `Ok(None)` means nothing was found in time.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Browse for a server, returning its "host:port" address
    async fn discover(&self, timeout_ms: u64) -> Result<Option<String>>;
}

/// mDNS-backed discovery: browses for servers and advertises this player
pub struct MdnsDiscovery {
    daemon: ServiceDaemon,
    service_fullname: String,
    advertise_task: JoinHandle<()>,
}

impl MdnsDiscovery {
    /// Register the player advertisement and start its refresh task
    pub fn new(player_name: &str, client_id: &str, advertise_port: u16) -> Result<Self> {
        let daemon = ServiceDaemon::new()
            .map_err(|e| Error::Discovery(format!("failed to create mDNS daemon: {}", e)))?;

        let hostname = gethostname::gethostname().to_string_lossy().to_string();
        let instance_name = format!("{}-{}", hostname, advertise_port);

        let mut properties = HashMap::new();
        properties.insert("v".to_string(), TXT_PROTOCOL_VERSION.to_string());
        properties.insert("name".to_string(), player_name.to_string());
        properties.insert("id".to_string(), client_id.to_string());

        let service = ServiceInfo::new(
            PLAYER_SERVICE_TYPE,
            &instance_name,
            &format!("{}.local.", hostname),
            (),
            advertise_port,
            properties,
        )
        .map_err(|e| Error::Discovery(format!("failed to build service info: {}", e)))?;

        let service_fullname = service.get_fullname().to_string();

        daemon
            .register(service.clone())
            .map_err(|e| Error::Discovery(format!("failed to register service: {}", e)))?;

        info!(
            service = %service_fullname,
            port = advertise_port,
            "player advertised via mDNS"
        );

        let advertise_task = {
            let daemon = daemon.clone();
            tokio::spawn(async move {
                let mut tick =
                    tokio::time::interval(Duration::from_secs(ADVERTISE_INTERVAL_SECS));
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                tick.tick().await; // skip the immediate first tick

                loop {
                    tick.tick().await;
                    if let Err(e) = daemon.register(service.clone()) {
                        warn!("failed to refresh mDNS advertisement: {}", e);
                    }
                }
            })
        };

        Ok(Self {
            daemon,
            service_fullname,
            advertise_task,
        })
    }
}

#[async_trait]
impl Discovery for MdnsDiscovery {
    async fn discover(&self, timeout_ms: u64) -> Result<Option<String>> {
        let receiver = self
            .daemon
            .browse(SERVER_SERVICE_TYPE)
            .map_err(|e| Error::Discovery(format!("failed to browse: {}", e)))?;

        debug!(service = SERVER_SERVICE_TYPE, timeout_ms, "browsing for servers");

        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        let mut found = None;

        while found.is_none() {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }

            match tokio::time::timeout(remaining, receiver.recv_async()).await {
                Ok(Ok(ServiceEvent::ServiceResolved(resolved))) => {
                    found = service_address(&resolved);
                    if let Some(addr) = &found {
                        info!(%addr, "discovered server");
                    }
                }
                Ok(Ok(_)) => {}
                Ok(Err(_)) => break, // daemon gone
                Err(_) => break,     // timeout
            }
        }

        let _ = self.daemon.stop_browse(SERVER_SERVICE_TYPE);
        Ok(found)
    }
}

impl Drop for MdnsDiscovery {
    fn drop(&mut self) {
        self.advertise_task.abort();
        if let Err(e) = self.daemon.unregister(&self.service_fullname) {
            debug!("failed to unregister mDNS service: {}", e);
        }
        let _ = self.daemon.shutdown();
    }
}

/// "host:port" of a resolved server, from its first address
fn service_address(resolved: &ServiceInfo) -> Option<String> {
    let ip = resolved.get_addresses().iter().next().copied()?;
    Some(format!("{}:{}", ip, resolved.get_port()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_address_from_resolved_info() {
        let mut properties = HashMap::new();
        properties.insert("v".to_string(), "1".to_string());

        let service = ServiceInfo::new(
            SERVER_SERVICE_TYPE,
            "test-server",
            "test-host.local.",
            "192.168.1.42",
            8927,
            properties,
        )
        .unwrap();

        assert_eq!(
            service_address(&service),
            Some("192.168.1.42:8927".to_string())
        );
    }

    #[test]
    fn test_service_address_without_addresses() {
        let service = ServiceInfo::new(
            SERVER_SERVICE_TYPE,
            "test-server",
            "test-host.local.",
            (),
            8927,
            HashMap::<String, String>::new(),
        )
        .unwrap();

        assert_eq!(service_address(&service), None);
    }
}
