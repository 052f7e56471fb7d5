//! Relay configuration

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

/// Inclusive range of public ports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub fn single(port: u16) -> Self {
        Self::new(port, port)
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }

    pub fn len(&self) -> usize {
        (self.end - self.start) as usize + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Parse a comma separated list such as `"2000-3000,3001,4000-4100"`
    pub fn parse_list(s: &str) -> Result<Vec<PortRange>, String> {
        s.split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(PortRange::from_str)
            .collect()
    }
}

impl FromStr for PortRange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse_port = |p: &str| {
            p.trim()
                .parse::<u16>()
                .map_err(|e| format!("invalid port {:?}: {}", p, e))
        };

        let range = match s.split_once('-') {
            Some((start, end)) => PortRange::new(parse_port(start)?, parse_port(end)?),
            None => PortRange::single(parse_port(s)?),
        };

        if range.start == 0 || range.start > range.end {
            return Err(format!("invalid port range {:?}", s));
        }
        Ok(range)
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// Relay configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address agents dial
    pub bind_addr: SocketAddr,
    /// Address public proxy listeners bind to
    pub proxy_bind_addr: IpAddr,
    /// Shared HTTP vhost port; `None` disables http proxies
    pub vhost_http_port: Option<u16>,
    /// Suffix for `subdomain` proxies; custom domains may not fall under it
    pub subdomain_host: Option<String>,
    /// Ports tcp proxies may bind; empty allows any port
    pub allowed_ports: Vec<PortRange>,
    /// Close a session after this long without control traffic
    pub heartbeat_timeout: Duration,
    pub heartbeat_check_interval: Duration,
    /// How long an inbound connection waits for the agent to supply a stream
    pub work_conn_timeout: Duration,
    /// Deadline for the agent's `Login` after connecting
    pub login_timeout: Duration,
    /// Upper bound on the work connection pool an agent may request
    pub max_pool_count: u32,
    /// Limit for the vhost request head
    pub vhost_max_header_bytes: usize,
    pub vhost_read_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 7000),
            proxy_bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            vhost_http_port: None,
            subdomain_host: None,
            allowed_ports: Vec::new(),
            heartbeat_timeout: Duration::from_secs(90),
            heartbeat_check_interval: Duration::from_secs(1),
            work_conn_timeout: Duration::from_secs(10),
            login_timeout: Duration::from_secs(10),
            max_pool_count: 5,
            vhost_max_header_bytes: 8 * 1024,
            vhost_read_timeout: Duration::from_secs(10),
        }
    }
}

impl ServerConfig {
    pub fn is_port_allowed(&self, port: u16) -> bool {
        self.allowed_ports.is_empty() || self.allowed_ports.iter().any(|r| r.contains(port))
    }

    /// Public address reported for a tcp proxy
    pub fn tcp_remote_addr(&self, port: u16) -> String {
        format!("{}:{}", self.proxy_bind_addr, port)
    }

    /// Public URL reported for an http proxy domain
    pub fn http_remote_addr(&self, domain: &str) -> String {
        match self.vhost_http_port {
            Some(80) | None => format!("http://{}", domain),
            Some(port) => format!("http://{}:{}", domain, port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_port_ranges() {
        let ranges = PortRange::parse_list("2000-3000, 3001,4000-4100").unwrap();
        assert_eq!(
            ranges,
            vec![
                PortRange::new(2000, 3000),
                PortRange::single(3001),
                PortRange::new(4000, 4100)
            ]
        );
        assert_eq!(ranges[0].len(), 1001);
        assert_eq!(ranges[1].to_string(), "3001");
    }

    #[test]
    fn test_invalid_port_ranges() {
        assert!("3000-2000".parse::<PortRange>().is_err());
        assert!("0".parse::<PortRange>().is_err());
        assert!("abc".parse::<PortRange>().is_err());
        assert!("70000".parse::<PortRange>().is_err());
    }

    #[test]
    fn test_port_allowed() {
        let mut config = ServerConfig::default();
        assert!(config.is_port_allowed(22));

        config.allowed_ports = vec![PortRange::new(6000, 6010)];
        assert!(config.is_port_allowed(6005));
        assert!(!config.is_port_allowed(22));
    }

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(90));
        assert_eq!(config.work_conn_timeout, Duration::from_secs(10));
        assert_eq!(config.max_pool_count, 5);
        assert_eq!(config.vhost_max_header_bytes, 8192);
    }

    #[test]
    fn test_http_remote_addr() {
        let mut config = ServerConfig::default();
        config.vhost_http_port = Some(8080);
        assert_eq!(
            config.http_remote_addr("a.example.com"),
            "http://a.example.com:8080"
        );
        config.vhost_http_port = Some(80);
        assert_eq!(config.http_remote_addr("a.example.com"), "http://a.example.com");
    }
}
