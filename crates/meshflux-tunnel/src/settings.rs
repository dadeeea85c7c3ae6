//! Engine tunnel options to OS tunnel network settings
//!
//! [`translate`] is a pure function: the same [`TunOptions`] always produce an
//! identical [`TunnelNetworkSettings`], and the input is never modified.

use crate::error::{Result, TunnelError};
use ipnetwork::{Ipv4Network, Ipv6Network};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Remote address reported for the tunnel; the engine runs in-process
pub const TUNNEL_REMOTE_ADDRESS: &str = "127.0.0.1";

/// HTTP proxy requested by the engine
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HttpProxyOptions {
    pub server: String,
    pub port: u16,
    pub bypass_domains: Vec<String>,
    pub match_domains: Vec<String>,
}

/// Network requirements reported by the engine when it opens the tunnel
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TunOptions {
    pub auto_route: bool,
    pub mtu: u32,
    pub dns_server: Option<IpAddr>,
    pub inet4_address: Vec<Ipv4Network>,
    pub inet6_address: Vec<Ipv6Network>,
    pub inet4_route_address: Vec<Ipv4Network>,
    pub inet4_route_exclude_address: Vec<Ipv4Network>,
    pub inet6_route_address: Vec<Ipv6Network>,
    pub inet6_route_exclude_address: Vec<Ipv6Network>,
    pub http_proxy: Option<HttpProxyOptions>,
}

/// The request handed to the OS tunnel-configuration call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelNetworkSettings {
    pub tunnel_remote_address: String,
    pub mtu: Option<u32>,
    pub dns: Option<DnsSettings>,
    pub ipv4: Option<Ipv4Settings>,
    pub ipv6: Option<Ipv6Settings>,
    pub proxy: Option<ProxySettings>,
}

impl TunnelNetworkSettings {
    /// Settings with only the remote address set
    pub fn empty() -> Self {
        Self {
            tunnel_remote_address: TUNNEL_REMOTE_ADDRESS.to_string(),
            mtu: None,
            dns: None,
            ipv4: None,
            ipv6: None,
            proxy: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsSettings {
    pub servers: Vec<IpAddr>,
    /// `[""]` sends every query to the tunnel resolver
    pub match_domains: Vec<String>,
    pub match_domains_no_search: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ipv4Route {
    pub destination: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
}

impl Ipv4Route {
    /// `prefix` must be in `1..=32`
    fn new(destination: [u8; 4], prefix: u8) -> Self {
        Self {
            destination: Ipv4Addr::from(destination),
            subnet_mask: Ipv4Addr::from(u32::MAX << (32 - u32::from(prefix))),
        }
    }
}

impl From<&Ipv4Network> for Ipv4Route {
    fn from(network: &Ipv4Network) -> Self {
        Self {
            destination: network.ip(),
            subnet_mask: network.mask(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ipv6Route {
    pub destination: Ipv6Addr,
    pub prefix_length: u8,
}

impl From<&Ipv6Network> for Ipv6Route {
    fn from(network: &Ipv6Network) -> Self {
        Self {
            destination: network.ip(),
            prefix_length: network.prefix(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ipv4Settings {
    pub addresses: Vec<Ipv4Addr>,
    pub subnet_masks: Vec<Ipv4Addr>,
    pub included_routes: Vec<Ipv4Route>,
    pub excluded_routes: Vec<Ipv4Route>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ipv6Settings {
    pub addresses: Vec<Ipv6Addr>,
    pub prefix_lengths: Vec<u8>,
    pub included_routes: Vec<Ipv6Route>,
    pub excluded_routes: Vec<Ipv6Route>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyServer {
    pub address: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxySettings {
    pub http_server: ProxyServer,
    pub https_server: ProxyServer,
    pub http_enabled: bool,
    pub https_enabled: bool,
    pub exception_list: Option<Vec<String>>,
    pub match_domains: Option<Vec<String>>,
}

impl ProxySettings {
    /// Flip both HTTP and HTTPS enablement together
    pub fn set_enabled(&mut self, enabled: bool) {
        self.http_enabled = enabled;
        self.https_enabled = enabled;
    }
}

/// IPv4 default route split into eight sub-ranges; the OS rejects a single `0.0.0.0/0`
pub fn ipv4_default_split_routes() -> Vec<Ipv4Route> {
    (0..8u8)
        .map(|i| Ipv4Route::new([1u8 << i, 0, 0, 0], 8 - i))
        .collect()
}

/// IPv6 counterpart of [`ipv4_default_split_routes`] (`100::/8` up to `8000::/1`)
pub fn ipv6_default_split_routes() -> Vec<Ipv6Route> {
    (0..8u8)
        .map(|i| Ipv6Route {
            destination: Ipv6Addr::new(0x0100u16 << i, 0, 0, 0, 0, 0, 0, 0),
            prefix_length: 8 - i,
        })
        .collect()
}

/// Build the OS settings request for a tunnel-open request
pub fn translate(options: &TunOptions) -> Result<TunnelNetworkSettings> {
    let mut settings = TunnelNetworkSettings::empty();

    if options.auto_route {
        settings.mtu = Some(options.mtu);

        let dns_server = options.dns_server.ok_or_else(|| {
            TunnelError::InvalidTunOptions("auto route requires a DNS server address".to_string())
        })?;
        settings.dns = Some(DnsSettings {
            servers: vec![dns_server],
            match_domains: vec![String::new()],
            match_domains_no_search: true,
        });

        settings.ipv4 = ipv4_settings(options);
        settings.ipv6 = ipv6_settings(options);
    }

    if let Some(proxy) = &options.http_proxy {
        settings.proxy = Some(proxy_settings(proxy));
    }

    Ok(settings)
}

fn ipv4_settings(options: &TunOptions) -> Option<Ipv4Settings> {
    if options.inet4_address.is_empty() {
        return None;
    }

    let mut included_routes: Vec<Ipv4Route> = options
        .inet4_route_address
        .iter()
        .filter(|network| !network.ip().is_loopback())
        .map(Ipv4Route::from)
        .collect();
    if included_routes.is_empty() {
        included_routes = ipv4_default_split_routes();
    }

    Some(Ipv4Settings {
        addresses: options.inet4_address.iter().map(|n| n.ip()).collect(),
        subnet_masks: options.inet4_address.iter().map(|n| n.mask()).collect(),
        included_routes,
        excluded_routes: options
            .inet4_route_exclude_address
            .iter()
            .filter(|network| !network.ip().is_loopback())
            .map(Ipv4Route::from)
            .collect(),
    })
}

fn ipv6_settings(options: &TunOptions) -> Option<Ipv6Settings> {
    if options.inet6_address.is_empty() {
        return None;
    }

    let mut included_routes: Vec<Ipv6Route> = options
        .inet6_route_address
        .iter()
        .filter(|network| !network.ip().is_loopback())
        .map(Ipv6Route::from)
        .collect();
    if included_routes.is_empty() {
        included_routes = ipv6_default_split_routes();
    }

    Some(Ipv6Settings {
        addresses: options.inet6_address.iter().map(|n| n.ip()).collect(),
        prefix_lengths: options.inet6_address.iter().map(|n| n.prefix()).collect(),
        included_routes,
        excluded_routes: options
            .inet6_route_exclude_address
            .iter()
            .filter(|network| !network.ip().is_loopback())
            .map(Ipv6Route::from)
            .collect(),
    })
}

fn proxy_settings(proxy: &HttpProxyOptions) -> ProxySettings {
    let server = ProxyServer {
        address: proxy.server.clone(),
        port: proxy.port,
    };

    ProxySettings {
        http_server: server.clone(),
        https_server: server,
        http_enabled: true,
        https_enabled: true,
        exception_list: (!proxy.bypass_domains.is_empty()).then(|| proxy.bypass_domains.clone()),
        match_domains: (!proxy.match_domains.is_empty()).then(|| proxy.match_domains.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auto_route_options() -> TunOptions {
        TunOptions {
            auto_route: true,
            mtu: 9000,
            dns_server: Some("172.18.0.2".parse().unwrap()),
            inet4_address: vec!["172.18.0.1/30".parse().unwrap()],
            inet6_address: vec!["fdfe:dcba:9876::1/126".parse().unwrap()],
            ..Default::default()
        }
    }

    #[test]
    fn test_without_auto_route_only_remote_address() {
        let options = TunOptions {
            auto_route: false,
            mtu: 1500,
            inet4_address: vec!["172.18.0.1/30".parse().unwrap()],
            ..Default::default()
        };

        let settings = translate(&options).unwrap();
        assert_eq!(settings, TunnelNetworkSettings::empty());
        assert_eq!(settings.tunnel_remote_address, "127.0.0.1");
    }

    #[test]
    fn test_auto_route_sets_mtu_and_dns() {
        let settings = translate(&auto_route_options()).unwrap();

        assert_eq!(settings.mtu, Some(9000));
        let dns = settings.dns.unwrap();
        assert_eq!(dns.servers, vec!["172.18.0.2".parse::<IpAddr>().unwrap()]);
        assert_eq!(dns.match_domains, vec![String::new()]);
        assert!(dns.match_domains_no_search);
    }

    #[test]
    fn test_auto_route_without_dns_is_rejected() {
        let options = TunOptions {
            dns_server: None,
            ..auto_route_options()
        };

        assert!(matches!(
            translate(&options),
            Err(TunnelError::InvalidTunOptions(_))
        ));
    }

    #[test]
    fn test_empty_routes_become_split_default() {
        let settings = translate(&auto_route_options()).unwrap();

        let ipv4 = settings.ipv4.unwrap();
        assert_eq!(ipv4.addresses, vec![Ipv4Addr::new(172, 18, 0, 1)]);
        assert_eq!(ipv4.subnet_masks, vec![Ipv4Addr::new(255, 255, 255, 252)]);
        assert_eq!(ipv4.included_routes.len(), 8);
        assert_eq!(
            ipv4.included_routes[0],
            Ipv4Route {
                destination: Ipv4Addr::new(1, 0, 0, 0),
                subnet_mask: Ipv4Addr::new(255, 0, 0, 0),
            }
        );
        assert_eq!(
            ipv4.included_routes[7],
            Ipv4Route {
                destination: Ipv4Addr::new(128, 0, 0, 0),
                subnet_mask: Ipv4Addr::new(128, 0, 0, 0),
            }
        );
        assert!(ipv4.excluded_routes.is_empty());

        let ipv6 = settings.ipv6.unwrap();
        assert_eq!(ipv6.prefix_lengths, vec![126]);
        assert_eq!(
            ipv6.included_routes.first().unwrap().destination,
            "100::".parse::<Ipv6Addr>().unwrap()
        );
        assert_eq!(ipv6.included_routes.first().unwrap().prefix_length, 8);
        assert_eq!(
            ipv6.included_routes.last().unwrap().destination,
            "8000::".parse::<Ipv6Addr>().unwrap()
        );
        assert_eq!(ipv6.included_routes.last().unwrap().prefix_length, 1);
    }

    #[test]
    fn test_explicit_routes_kept_and_loopback_dropped() {
        let options = TunOptions {
            inet4_route_address: vec![
                "10.0.0.0/8".parse().unwrap(),
                "127.0.0.0/8".parse().unwrap(),
            ],
            inet4_route_exclude_address: vec![
                "192.168.0.0/16".parse().unwrap(),
                "127.0.0.1/32".parse().unwrap(),
            ],
            ..auto_route_options()
        };

        let ipv4 = translate(&options).unwrap().ipv4.unwrap();
        assert_eq!(
            ipv4.included_routes,
            vec![Ipv4Route {
                destination: Ipv4Addr::new(10, 0, 0, 0),
                subnet_mask: Ipv4Addr::new(255, 0, 0, 0),
            }]
        );
        assert_eq!(
            ipv4.excluded_routes,
            vec![Ipv4Route {
                destination: Ipv4Addr::new(192, 168, 0, 0),
                subnet_mask: Ipv4Addr::new(255, 255, 0, 0),
            }]
        );
    }

    #[test]
    fn test_no_addresses_no_ip_blocks() {
        let options = TunOptions {
            inet4_address: vec![],
            inet6_address: vec![],
            ..auto_route_options()
        };

        let settings = translate(&options).unwrap();
        assert!(settings.ipv4.is_none());
        assert!(settings.ipv6.is_none());
        assert!(settings.dns.is_some());
    }

    #[test]
    fn test_http_proxy() {
        let options = TunOptions {
            http_proxy: Some(HttpProxyOptions {
                server: "127.0.0.1".to_string(),
                port: 2080,
                bypass_domains: vec!["localhost".to_string()],
                match_domains: vec![],
            }),
            ..auto_route_options()
        };

        let proxy = translate(&options).unwrap().proxy.unwrap();
        assert_eq!(proxy.http_server, proxy.https_server);
        assert_eq!(proxy.http_server.port, 2080);
        assert!(proxy.http_enabled && proxy.https_enabled);
        assert_eq!(proxy.exception_list, Some(vec!["localhost".to_string()]));
        assert_eq!(proxy.match_domains, None);
    }

    #[test]
    fn test_translate_is_pure() {
        let options = auto_route_options();
        let snapshot = options.clone();

        let first = serde_json::to_vec(&translate(&options).unwrap()).unwrap();
        let second = serde_json::to_vec(&translate(&options).unwrap()).unwrap();

        assert_eq!(first, second);
        assert_eq!(options, snapshot);
    }
}
