//! Address helpers for diagnostics.
//!
//! Pure accessors over a [`Connection`]. Missing information is reported with
//! sentinels instead of errors: an empty string for IPs and `-1` for ports.

use std::net::{IpAddr, SocketAddr};

use super::Connection;

/// Stateless accessors over a connection's endpoints
pub struct ConnectionAddressView;

impl ConnectionAddressView {
    pub fn local_address(connection: &Connection) -> Option<SocketAddr> {
        connection.local_addr()
    }

    pub fn remote_address(connection: &Connection) -> Option<SocketAddr> {
        connection.peer_addr()
    }

    /// Local IPv4 address, or `""` when unavailable or not IPv4
    pub fn local_ip(connection: &Connection) -> String {
        match connection.local_addr().map(|addr| addr.ip()) {
            Some(IpAddr::V4(ip)) => ip.to_string(),
            _ => String::new(),
        }
    }

    /// Local port, or `-1` when unavailable
    pub fn local_port(connection: &Connection) -> i32 {
        connection
            .local_addr()
            .map_or(-1, |addr| i32::from(addr.port()))
    }

    /// Remote IP, or `""` when unavailable
    pub fn remote_ip(connection: &Connection) -> String {
        connection
            .peer_addr()
            .map(|addr| addr.ip().to_string())
            .unwrap_or_default()
    }

    /// Remote port, or `-1` when unavailable
    pub fn remote_port(connection: &Connection) -> i32 {
        connection
            .peer_addr()
            .map_or(-1, |addr| i32::from(addr.port()))
    }

    /// `[/ip: port]`, or `[/: -1]` when the peer is unknown
    pub fn remote_label(connection: &Connection) -> String {
        format!(
            "[/{}: {}]",
            Self::remote_ip(connection),
            Self::remote_port(connection)
        )
    }

    /// `ip: port`
    pub fn remote_ip_port(connection: &Connection) -> String {
        format!(
            "{}: {}",
            Self::remote_ip(connection),
            Self::remote_port(connection)
        )
    }
}
