//! Connection metadata

use serde::{Serialize, Serializer};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Network type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    Tcp,
    Udp,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Udp => "udp",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Tcp => write!(f, "TCP"),
            Network::Udp => write!(f, "UDP"),
        }
    }
}

impl Serialize for Network {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Connection type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnType {
    Http,
    Https,
    Socks5,
    Mixed,
}

impl fmt::Display for ConnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnType::Http => write!(f, "HTTP"),
            ConnType::Https => write!(f, "HTTPS"),
            ConnType::Socks5 => write!(f, "SOCKS5"),
            ConnType::Mixed => write!(f, "Mixed"),
        }
    }
}

impl Serialize for ConnType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// DNS mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DnsMode {
    #[default]
    Normal,
    FakeIP,
}

/// Immutable description of a connection, produced by the inbound listener
#[derive(Debug, Clone, Serialize)]
pub struct Metadata {
    /// Network type (TCP/UDP)
    pub network: Network,

    /// Connection type
    #[serde(rename = "type")]
    pub conn_type: ConnType,

    /// Source IP address
    #[serde(rename = "sourceIP")]
    pub src_ip: IpAddr,

    /// Source port
    #[serde(rename = "sourcePort")]
    pub src_port: u16,

    /// Destination IP address (may be unset if only host is known)
    #[serde(rename = "destinationIP")]
    pub dst_ip: Option<IpAddr>,

    /// Destination port
    #[serde(rename = "destinationPort")]
    pub dst_port: u16,

    /// Destination host (domain name)
    pub host: String,

    /// Process path (if available)
    #[serde(rename = "processPath", skip_serializing_if = "Option::is_none")]
    pub process_path: Option<String>,

    /// DNS mode
    #[serde(rename = "dnsMode")]
    pub dns_mode: DnsMode,
}

impl Metadata {
    /// Create new metadata
    pub fn new(network: Network, conn_type: ConnType) -> Self {
        Metadata {
            network,
            conn_type,
            src_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            src_port: 0,
            dst_ip: None,
            dst_port: 0,
            host: String::new(),
            process_path: None,
            dns_mode: DnsMode::Normal,
        }
    }

    /// Create TCP metadata
    pub fn tcp() -> Self {
        Self::new(Network::Tcp, ConnType::Mixed)
    }

    /// Create UDP metadata
    pub fn udp() -> Self {
        Self::new(Network::Udp, ConnType::Mixed)
    }

    /// Set source address
    pub fn with_source(mut self, addr: SocketAddr) -> Self {
        self.src_ip = addr.ip();
        self.src_port = addr.port();
        self
    }

    /// Set destination IP
    pub fn with_dst_ip(mut self, ip: IpAddr) -> Self {
        self.dst_ip = Some(ip);
        self
    }

    /// Set destination port
    pub fn with_dst_port(mut self, port: u16) -> Self {
        self.dst_port = port;
        self
    }

    /// Set destination host
    pub fn with_host(mut self, host: String) -> Self {
        self.host = host;
        self
    }

    /// Set DNS mode
    pub fn with_dns_mode(mut self, mode: DnsMode) -> Self {
        self.dns_mode = mode;
        self
    }

    /// Set process path
    pub fn with_process_path(mut self, path: String) -> Self {
        self.process_path = Some(path);
        self
    }

    /// Get remote address string
    pub fn remote_address(&self) -> String {
        if !self.host.is_empty() {
            format!("{}:{}", self.host, self.dst_port)
        } else if let Some(ip) = self.dst_ip {
            format!("{}:{}", ip, self.dst_port)
        } else {
            format!("0.0.0.0:{}", self.dst_port)
        }
    }
}

impl fmt::Display for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}:{} --> {}",
            self.network,
            self.src_ip,
            self.src_port,
            self.remote_address()
        )
    }
}
