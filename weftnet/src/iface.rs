//! Local address resolution and special-purpose socket construction.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket as StdUdpSocket};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::debug;

use crate::error::{NetError, Result};

/// Resolve the local IP a session should advertise.
///
/// Probes a throwaway UDP socket toward the LAN broadcast address: the
/// kernel picks the interface of the default route, whose address we read
/// back. A failed probe or a loopback result means the host has no routed
/// interface; that rejects session start unless `allow_virtual_ips`
/// accepts unroutable setups (VPN-only hosts, containers, tests).
pub(crate) fn resolve_local_ip(allow_virtual_ips: bool) -> Result<IpAddr> {
    let probe = StdUdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    probe.set_broadcast(true)?;
    match probe
        .connect((Ipv4Addr::BROADCAST, 9))
        .and_then(|()| probe.local_addr())
    {
        Ok(addr) if !addr.ip().is_loopback() && !addr.ip().is_unspecified() => Ok(addr.ip()),
        Ok(addr) if allow_virtual_ips => Ok(addr.ip()),
        Ok(addr) => {
            debug!(ip = %addr.ip(), "local address is not routed");
            Err(NetError::NoRoute)
        }
        Err(e) if allow_virtual_ips => {
            debug!(error = %e, "no default route, accepting unspecified local address");
            Ok(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
        }
        Err(e) => {
            debug!(error = %e, "local address probe failed");
            Err(NetError::NoRoute)
        }
    }
}

fn broadcast_capable(bind: SocketAddr) -> std::io::Result<StdUdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket.set_reuse_port(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&bind.into())?;
    Ok(socket.into())
}

/// Ephemeral socket for sending discovery beacons to the broadcast address.
pub(crate) fn beacon_socket() -> Result<UdpSocket> {
    let std_socket = broadcast_capable(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))?;
    Ok(UdpSocket::from_std(std_socket)?)
}

/// Passive socket listening for discovery beacons. Address reuse lets
/// several clients on one host share the discovery port.
pub(crate) fn discovery_socket(discovery_port: u16) -> Result<UdpSocket> {
    let std_socket = broadcast_capable(SocketAddr::from((Ipv4Addr::UNSPECIFIED, discovery_port)))?;
    Ok(UdpSocket::from_std(std_socket)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn virtual_ips_always_resolve() {
        // With virtual addresses allowed, resolution must succeed on any
        // host, routed or not.
        assert!(resolve_local_ip(true).is_ok());
    }

    #[tokio::test]
    async fn beacon_socket_binds() {
        let socket = beacon_socket().unwrap();
        assert!(socket.local_addr().is_ok());
    }

    #[tokio::test]
    async fn discovery_port_is_shareable() {
        let a = discovery_socket(0).unwrap();
        let port = a.local_addr().unwrap().port();
        let b = discovery_socket(port);
        assert!(b.is_ok(), "address reuse allows a second listener");
    }
}
