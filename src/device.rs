//! Remote endpoint descriptors.

use std::fmt;

/// All possible connection types.
///
/// L2CAP connections are not supported on Windows because of limitations
/// with the Microsoft Bluetooth stack.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ConnectionType {
    #[default]
    None,
    Tcp,
    Udp,
    L2cap,
    Rfcomm,
}

impl ConnectionType {
    /// Whether this is an Internet protocol (TCP or UDP).
    pub fn is_ip(&self) -> bool {
        matches!(self, ConnectionType::Tcp | ConnectionType::Udp)
    }

    /// Whether this is a Bluetooth protocol (RFCOMM or L2CAP).
    pub fn is_bluetooth(&self) -> bool {
        matches!(self, ConnectionType::Rfcomm | ConnectionType::L2cap)
    }
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionType::None => "None",
            ConnectionType::Tcp => "TCP",
            ConnectionType::Udp => "UDP",
            ConnectionType::L2cap => "L2CAP",
            ConnectionType::Rfcomm => "RFCOMM",
        };
        f.write_str(name)
    }
}

/// IP versions.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum IpVersion {
    #[default]
    None,
    V4,
    V6,
}

impl fmt::Display for IpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IpVersion::None => "None",
            IpVersion::V4 => "IPv4",
            IpVersion::V6 => "IPv6",
        };
        f.write_str(name)
    }
}

/// Remote device metadata.
///
/// `address` is a numeric IP address (or a hostname for DNS-resolved
/// connections) for Internet types and a colon-separated MAC address for
/// Bluetooth types. `port` is a TCP/UDP port, an L2CAP PSM, or an RFCOMM
/// channel.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Device {
    /// Connection protocol.
    pub conn_type: ConnectionType,
    /// Device name for display.
    pub name: String,
    /// Address (IP address for TCP/UDP, MAC address for Bluetooth).
    pub address: String,
    /// Port (or PSM for L2CAP, channel for RFCOMM).
    pub port: u16,
}

impl Device {
    /// A device with just the connection essentials filled in.
    pub fn new(conn_type: ConnectionType, address: impl Into<String>, port: u16) -> Device {
        Device {
            conn_type,
            name: String::new(),
            address: address.into(),
            port,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_classification() {
        assert!(ConnectionType::Tcp.is_ip());
        assert!(ConnectionType::Udp.is_ip());
        assert!(!ConnectionType::Rfcomm.is_ip());
        assert!(ConnectionType::Rfcomm.is_bluetooth());
        assert!(ConnectionType::L2cap.is_bluetooth());
        assert!(!ConnectionType::None.is_ip());
        assert!(!ConnectionType::None.is_bluetooth());
    }
}
