use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::net::SocketAddr;

use serde::Deserialize;
use serde::Serialize;
use tracing::warn;

use crate::Error;
use crate::Result;

/// Prometheus exposition of the replication plane counters
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MonitoringConfig {
    /// Serve `/metrics` from this member
    #[serde(default)]
    pub prometheus_enabled: bool,

    #[serde(default = "default_prometheus_port")]
    pub prometheus_port: u16,

    /// Interface the metrics endpoint binds to
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            prometheus_enabled: false,
            prometheus_port: default_prometheus_port(),
            bind_address: default_bind_address(),
        }
    }
}

impl MonitoringConfig {
    /// # Errors
    /// `Error::InvalidConfig` when the endpoint is enabled without a port or
    /// bound to a multicast address.
    pub fn validate(&self) -> Result<()> {
        if !self.prometheus_enabled {
            return Ok(());
        }
        if self.prometheus_port == 0 {
            return Err(Error::InvalidConfig(
                "monitoring.prometheus_port cannot be 0 when prometheus is enabled".into(),
            ));
        }
        if self.bind_address.is_multicast() {
            return Err(Error::InvalidConfig(format!(
                "monitoring.bind_address {} is a multicast address",
                self.bind_address
            )));
        }
        if self.bind_address.is_loopback() {
            warn!(
                "metrics endpoint bound to {}, other cluster members cannot scrape it",
                self.bind_address
            );
        }
        Ok(())
    }

    pub fn metrics_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.prometheus_port)
    }
}

fn default_prometheus_port() -> u16 {
    9090
}

fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}
