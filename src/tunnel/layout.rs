//! Addresses and routes the OS side has to configure on the virtual
//! interface for each tunnel mode.

use super::dns::{DnsAddressing, FAKE_DNS_PREFIX_V4, FAKE_DNS_PREFIX_V6};
use crate::config::BlockaConfig;
use crate::error::{TunnelError, TunnelResult};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Left out of the DNS tunnel modes, store downloads break otherwise.
pub const ALWAYS_DISALLOWED: &str = "com.android.vending";

/// Public IPv6 resolver added in VPN mode.
pub const FALLBACK_DNS_V6: Ipv6Addr = Ipv6Addr::new(0x2606, 0x4700, 0x4700, 0, 0, 0, 0, 0x1111);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    pub addr: IpAddr,
    pub prefix: u8,
}

impl Cidr {
    pub fn new(addr: impl Into<IpAddr>, prefix: u8) -> Self {
        Self {
            addr: addr.into(),
            prefix,
        }
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutKind {
    /// Only DNS traffic to the fake resolvers enters the tunnel.
    Dns,
    /// Tunnel up, nothing routed through it.
    Paused,
    /// Everything goes through the encrypted gateway.
    Vpn,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VpnLayout {
    pub kind: LayoutKind,
    pub addresses: Vec<Cidr>,
    pub dns_servers: Vec<IpAddr>,
    pub routes: Vec<Cidr>,
    pub disallowed_apps: Vec<String>,
    pub blocking: bool,
}

impl VpnLayout {
    fn empty(kind: LayoutKind, whitelisted_apps: Vec<String>) -> Self {
        let mut disallowed_apps = whitelisted_apps;
        if kind != LayoutKind::Vpn && !disallowed_apps.iter().any(|app| app == ALWAYS_DISALLOWED) {
            disallowed_apps.push(ALWAYS_DISALLOWED.to_string());
        }
        Self {
            kind,
            addresses: Vec::new(),
            dns_servers: Vec::new(),
            routes: Vec::new(),
            disallowed_apps,
            blocking: true,
        }
    }

    /// The device sees fake resolvers on TEST-NET ranges, each with a host
    /// route into the tunnel.
    pub fn dns(servers: &[SocketAddr], whitelisted_apps: Vec<String>) -> Self {
        let mut layout = Self::empty(LayoutKind::Dns, whitelisted_apps);
        let [a, b, c] = FAKE_DNS_PREFIX_V4;
        layout.addresses.push(Cidr::new(Ipv4Addr::new(a, b, c, 1), 24));

        if servers.iter().any(SocketAddr::is_ipv6) {
            let [a, b, c, d, e, f, g] = FAKE_DNS_PREFIX_V6;
            layout.addresses.push(Cidr::new(Ipv6Addr::new(a, b, c, d, e, f, g, 0), 120));
        }

        for (index, server) in servers.iter().enumerate() {
            let fake = match server {
                SocketAddr::V4(_) => DnsAddressing::fake_v4(index).map(IpAddr::V4),
                SocketAddr::V6(_) => DnsAddressing::fake_v6(index).map(IpAddr::V6),
            };
            let Some(fake) = fake else {
                continue;
            };
            layout.dns_servers.push(fake);
            if fake.is_ipv4() {
                layout.routes.push(Cidr::new(fake, 32));
            }
        }
        layout
    }

    pub fn paused(servers: &[SocketAddr], whitelisted_apps: Vec<String>) -> Self {
        let mut layout = Self::empty(LayoutKind::Paused, whitelisted_apps);
        layout.dns_servers = servers.iter().map(SocketAddr::ip).collect();
        let [a, b, c] = FAKE_DNS_PREFIX_V4;
        layout.addresses.push(Cidr::new(Ipv4Addr::new(a, b, c, 0), 32));
        layout
    }

    pub fn vpn(
        servers: &[SocketAddr],
        whitelisted_apps: Vec<String>,
        blocka: &BlockaConfig,
    ) -> TunnelResult<Self> {
        let vip4: Ipv4Addr = blocka
            .vip4
            .parse()
            .map_err(|_| TunnelError::Config(format!("Invalid vip4: {}", blocka.vip4)))?;
        let vip6: Ipv6Addr = blocka
            .vip6
            .parse()
            .map_err(|_| TunnelError::Config(format!("Invalid vip6: {}", blocka.vip6)))?;

        let mut layout = Self::empty(LayoutKind::Vpn, whitelisted_apps);
        layout.dns_servers = servers.iter().map(SocketAddr::ip).collect();
        layout.dns_servers.push(IpAddr::V6(FALLBACK_DNS_V6));
        layout.addresses = vec![Cidr::new(vip4, 32), Cidr::new(vip6, 128)];
        layout.routes = vec![
            Cidr::new(Ipv4Addr::UNSPECIFIED, 0),
            Cidr::new(Ipv6Addr::UNSPECIFIED, 0),
        ];
        Ok(layout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn servers() -> Vec<SocketAddr> {
        vec![
            "1.1.1.1:53".parse().unwrap(),
            "[2606:4700::1111]:53".parse().unwrap(),
            "9.9.9.9:53".parse().unwrap(),
        ]
    }

    #[test]
    fn test_dns_layout_uses_fake_resolvers() {
        let layout = VpnLayout::dns(&servers(), vec!["org.example.app".into()]);

        assert_eq!(layout.kind, LayoutKind::Dns);
        assert_eq!(layout.addresses[0].to_string(), "203.0.113.1/24");
        assert_eq!(layout.addresses[1].to_string(), "2001:db8::/120");
        let dns: Vec<String> = layout.dns_servers.iter().map(ToString::to_string).collect();
        assert_eq!(dns, vec!["203.0.113.2", "2001:db8::3", "203.0.113.4"]);
        assert_eq!(layout.routes.len(), 2);
        assert_eq!(layout.routes[1].to_string(), "203.0.113.4/32");
        assert_eq!(layout.disallowed_apps, vec!["org.example.app", ALWAYS_DISALLOWED]);
    }

    #[test]
    fn test_dns_layout_without_ipv6_servers() {
        let layout = VpnLayout::dns(&servers()[..1], Vec::new());
        assert_eq!(layout.addresses.len(), 1);
    }

    #[test]
    fn test_vpn_layout_routes_everything() {
        let blocka = BlockaConfig {
            vip4: "10.143.0.2".into(),
            vip6: "fdad:b10c:a::2".into(),
            ..BlockaConfig::default()
        };
        let layout = VpnLayout::vpn(&servers(), vec![], &blocka).unwrap();

        assert_eq!(layout.addresses[0].to_string(), "10.143.0.2/32");
        assert_eq!(layout.routes[0].to_string(), "0.0.0.0/0");
        assert_eq!(layout.routes[1].to_string(), "::/0");
        assert!(layout.dns_servers.contains(&IpAddr::V6(FALLBACK_DNS_V6)));
        assert!(layout.disallowed_apps.is_empty());

        let broken = BlockaConfig::default();
        assert!(VpnLayout::vpn(&servers(), vec![], &broken).is_err());
    }

    #[test]
    fn test_paused_layout_routes_nothing() {
        let layout = VpnLayout::paused(&servers(), vec![]);
        assert!(layout.routes.is_empty());
        assert_eq!(layout.dns_servers[0], IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)));
    }
}
