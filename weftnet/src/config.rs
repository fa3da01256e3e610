//! Endpoint configuration.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use weftwire::{validate_name, Color};

use crate::error::{NetError, Result};

/// Configuration shared by both endpoint roles.
///
/// Durations are given as [`Duration`] values; the framework treats them
/// with millisecond granularity.
#[derive(Debug, Clone)]
pub struct Config {
    /// Display name of the local user (pure ASCII, at most 100 bytes).
    pub username: String,
    /// Display color of the local user.
    pub color: Color,
    /// Display name of the server (server role; same validation as usernames).
    pub servername: String,
    /// Reconnect to the last known server when the session restarts.
    pub reconnect_after_recompile: bool,
    /// UDP data port the server listens on.
    pub port: u16,
    /// UDP port discovery beacons are sent to and received on.
    pub discovery_port: u16,
    /// Address beacons are broadcast to.
    pub broadcast_address: IpAddr,
    /// How long a client waits for the handshake to complete.
    pub server_connection_timeout: Duration,
    /// Interval between discovery beacons (server role).
    pub server_heartbeat_delay: Duration,
    /// How long a discovered server stays listed without a fresh beacon.
    pub server_discovery_timeout: Duration,
    /// Retransmissions of an unacknowledged reliable frame before the peer
    /// is evicted as unreachable.
    pub max_resend_reliable_packets: u32,
    /// Round-trip estimate; the retransmit delay is 1.25x this value.
    pub rtt: Duration,
    /// Single-frame payload ceiling in bytes. Larger reliable payloads are
    /// chunked; larger unreliable payloads are rejected.
    pub mtu: usize,
    /// Maximum number of connected client peers (server role).
    pub max_clients: u8,
    /// Accept local addresses without a default route (VPNs, containers,
    /// loopback-only test setups).
    pub allow_virtual_ips: bool,
    /// Hex-trace every frame on the data path.
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            username: "player".into(),
            color: Color::WHITE,
            servername: "weft server".into(),
            reconnect_after_recompile: false,
            port: 24690,
            discovery_port: 24691,
            broadcast_address: IpAddr::V4(Ipv4Addr::BROADCAST),
            server_connection_timeout: Duration::from_millis(5000),
            server_heartbeat_delay: Duration::from_millis(1000),
            server_discovery_timeout: Duration::from_millis(3000),
            max_resend_reliable_packets: 5,
            rtt: Duration::from_millis(200),
            mtu: 1024,
            max_clients: 16,
            allow_virtual_ips: false,
            debug: false,
        }
    }
}

impl Config {
    /// Check the configuration before session start.
    pub fn validate(&self) -> Result<()> {
        validate_name(&self.username)
            .map_err(|e| NetError::InvalidConfig(format!("username: {e}")))?;
        validate_name(&self.servername)
            .map_err(|e| NetError::InvalidConfig(format!("servername: {e}")))?;
        if self.username.is_empty() {
            return Err(NetError::InvalidConfig("username must not be empty".into()));
        }
        if self.mtu == 0 {
            return Err(NetError::InvalidConfig("mtu must be at least 1".into()));
        }
        if self.mtu > u16::MAX as usize {
            return Err(NetError::InvalidConfig(
                "mtu must fit the 16-bit payload length field".into(),
            ));
        }
        if self.max_clients == 0 {
            return Err(NetError::InvalidConfig(
                "max_clients must be at least 1".into(),
            ));
        }
        if self.port == self.discovery_port {
            return Err(NetError::InvalidConfig(
                "data and discovery ports must differ".into(),
            ));
        }
        Ok(())
    }

    /// Delay before a reliable frame is retransmitted.
    pub fn retransmit_delay(&self) -> Duration {
        self.rtt + self.rtt / 4
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn non_ascii_username_rejected() {
        let config = Config {
            username: "ünïcode".into(),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn overlong_servername_rejected() {
        let config = Config {
            servername: "s".repeat(101),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn port_collision_rejected() {
        let config = Config {
            port: 4000,
            discovery_port: 4000,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn retransmit_delay_is_five_quarters_rtt() {
        let config = Config {
            rtt: Duration::from_millis(200),
            ..Config::default()
        };
        assert_eq!(config.retransmit_delay(), Duration::from_millis(250));
    }
}
