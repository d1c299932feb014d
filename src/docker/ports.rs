use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// A published port as reported by the daemon, before filtering.
#[derive(Debug, Clone, PartialEq)]
pub struct RawPort {
    pub ip: Option<String>,
    pub private_port: u16,
    pub public_port: Option<u16>,
    pub protocol: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PortMapping {
    pub host_ip: String,
    pub public_port: u16,
    pub private_port: u16,
    pub protocol: String,
}

fn is_ipv4(ip: &str) -> bool {
    match ip.parse::<IpAddr>() {
        Ok(IpAddr::V4(_)) => true,
        Ok(IpAddr::V6(v6)) => v6.to_ipv4_mapped().is_some(),
        Err(_) => false,
    }
}

/// Keeps IPv4 bindings only, rewrites the address to `machine_addr` and sorts
/// by public port, then protocol.
pub fn filter_ports(ports: impl IntoIterator<Item = RawPort>, machine_addr: &str) -> Vec<PortMapping> {
    let mut mappings: Vec<PortMapping> = ports
        .into_iter()
        .filter(|p| p.ip.as_deref().is_some_and(is_ipv4))
        .map(|p| PortMapping {
            host_ip: machine_addr.to_string(),
            public_port: p.public_port.unwrap_or(0),
            private_port: p.private_port,
            protocol: p.protocol,
        })
        .collect();
    mappings.sort_by(|a, b| {
        a.public_port
            .cmp(&b.public_port)
            .then_with(|| a.protocol.cmp(&b.protocol))
    });
    mappings
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port(ip: Option<&str>, public: u16, protocol: &str) -> RawPort {
        RawPort {
            ip: ip.map(str::to_string),
            private_port: 80,
            public_port: Some(public),
            protocol: protocol.to_string(),
        }
    }

    #[test]
    fn drops_ipv6_and_unpublished_ports() {
        let ports = vec![
            port(Some("0.0.0.0"), 8080, "tcp"),
            port(Some("::"), 8080, "tcp"),
            port(None, 0, "tcp"),
            port(Some("not-an-ip"), 9000, "tcp"),
        ];
        let filtered = filter_ports(ports, "192.168.1.10");
        assert_eq!(
            filtered,
            vec![PortMapping {
                host_ip: "192.168.1.10".to_string(),
                public_port: 8080,
                private_port: 80,
                protocol: "tcp".to_string(),
            }]
        );
    }

    #[test]
    fn sorts_by_port_then_protocol() {
        let ports = vec![
            port(Some("0.0.0.0"), 53, "udp"),
            port(Some("0.0.0.0"), 443, "tcp"),
            port(Some("0.0.0.0"), 53, "tcp"),
            port(Some("::ffff:10.0.0.1"), 22, "tcp"),
        ];
        let filtered = filter_ports(ports, "host");
        let keys: Vec<_> = filtered
            .iter()
            .map(|p| (p.public_port, p.protocol.as_str()))
            .collect();
        assert_eq!(keys, [(22, "tcp"), (53, "tcp"), (53, "udp"), (443, "tcp")]);
    }
}
