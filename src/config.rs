//! Configuration for the DNS server.
//!
//! This module defines the configuration structure and methods to load
//! configuration from environment variables. Every value is validated here so
//! that a bad setting stops the process before any socket is created.

use std::{
    env, fs,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

use crate::errors::DnsError;

/// Standard DNS port.
pub const NAMESERVER_PORT: u16 = 53;

/// Default number of cached answers.
pub const DEFAULT_CACHE_SIZE: usize = 150;

/// Smallest EDNS packet size we will advertise or accept.
pub const PACKETSZ: usize = 512;

/// Default EDNS packet size.
pub const EDNS_PKTSZ: usize = 1280;

/// Default cap on concurrent TCP worker sessions.
pub const MAX_TCP_SESSIONS: usize = 20;

/// Default hard lifetime of a TCP worker session.
pub const TCP_SESSION_LIFETIME: Duration = Duration::from_secs(150);

/// Default cap on DHCP leases.
pub const MAX_LEASES: usize = 150;

/// Shortest lease the DHCP server hands out, in seconds.
pub const MIN_LEASE_TIME: u32 = 120;

/// A range of addresses handed out by the DHCP server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpRange {
    /// First address in the range.
    pub start: Ipv4Addr,

    /// Last address in the range. Equal to `start` for static-only ranges.
    pub end: Ipv4Addr,

    /// Lease time in seconds, `0` meaning infinite.
    pub lease_time: u32,
}

/// Rewrites upstream A records: `addr & mask == from` becomes `to | (addr & !mask)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressAlias {
    pub from: Ipv4Addr,
    pub to: Ipv4Addr,
    pub mask: Ipv4Addr,
}

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port the DNS listeners bind to.
    pub port: u16,

    /// Number of forwarded answers to cache. Zero disables the cache.
    pub cache_size: usize,

    /// Interface names to serve on. Empty means every interface.
    pub interfaces: Vec<String>,

    /// Interface addresses to serve on.
    pub listen_addresses: Vec<IpAddr>,

    /// Interface names never served on.
    pub except_interfaces: Vec<String>,

    /// Bind one socket pair per interface instead of the wildcard address.
    pub bind_interfaces: bool,

    /// Resolver-list files polled for upstream servers.
    pub resolv_files: Vec<PathBuf>,

    /// Do not read resolver-list files; use `servers` only.
    pub no_resolv: bool,

    /// Do not poll resolver-list files; re-read them on reload only.
    pub no_poll: bool,

    /// Statically configured upstream servers.
    pub servers: Vec<SocketAddr>,

    /// Source port for upstream queries, `0` for an ephemeral port.
    pub query_port: u16,

    /// TTL given to answers from the hosts table.
    pub local_ttl: u32,

    /// Largest EDNS packet we will handle.
    pub edns_packet_max: usize,

    /// Domain appended to bare host names.
    pub domain_suffix: Option<String>,

    /// System hosts file.
    pub hosts_file: PathBuf,

    /// Skip the system hosts file.
    pub no_hosts: bool,

    /// Additional hosts file.
    pub addn_hosts: Option<PathBuf>,

    /// Pidfile written after daemonizing.
    pub pid_file: Option<PathBuf>,

    /// User to switch to after binding.
    pub user: Option<String>,

    /// Group to switch to after binding.
    pub group: Option<String>,

    /// Stay in the foreground and keep privileges.
    pub foreground: bool,

    /// Log every query.
    pub log_queries: bool,

    /// Write log output to this file instead of stderr.
    pub log_file: Option<PathBuf>,

    /// DHCP address ranges. DHCP is enabled when non-empty.
    pub dhcp_ranges: Vec<DhcpRange>,

    /// Lease database path.
    pub lease_file: Option<PathBuf>,

    /// Largest number of leases held at once.
    pub max_leases: usize,

    /// Upstream A records that mean "no such domain".
    pub bogus_nxdomain: Vec<Ipv4Addr>,

    /// Address rewriting rules for upstream answers.
    pub aliases: Vec<AddressAlias>,

    /// Concurrent TCP worker session cap.
    pub max_tcp_sessions: usize,

    /// Hard lifetime of a TCP worker session.
    pub tcp_session_lifetime: Duration,

    /// Periodic forced lease write interval, for hosts without a usable clock.
    pub lease_dump_interval: Option<Duration>,

    /// Address for the Prometheus exporter.
    pub metrics_addr: Option<SocketAddr>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: NAMESERVER_PORT,
            cache_size: DEFAULT_CACHE_SIZE,
            interfaces: Vec::new(),
            listen_addresses: Vec::new(),
            except_interfaces: Vec::new(),
            bind_interfaces: false,
            resolv_files: vec![PathBuf::from("/etc/resolv.conf")],
            no_resolv: false,
            no_poll: false,
            servers: Vec::new(),
            query_port: 0,
            local_ttl: 0,
            edns_packet_max: EDNS_PKTSZ,
            domain_suffix: None,
            hosts_file: PathBuf::from("/etc/hosts"),
            no_hosts: false,
            addn_hosts: None,
            pid_file: Some(PathBuf::from("/var/run/nx9-dns.pid")),
            user: Some("nobody".into()),
            group: Some("dip".into()),
            foreground: false,
            log_queries: false,
            log_file: None,
            dhcp_ranges: Vec::new(),
            lease_file: None,
            max_leases: MAX_LEASES,
            bogus_nxdomain: Vec::new(),
            aliases: Vec::new(),
            max_tcp_sessions: MAX_TCP_SESSIONS,
            tcp_session_lifetime: TCP_SESSION_LIFETIME,
            lease_dump_interval: None,
            metrics_addr: None,
        }
    }
}

impl ServerConfig {
    /// Load server configuration from environment variables.
    ///
    /// # Returns
    /// A `Result` containing either the loaded `ServerConfig` or a `DnsError`.
    pub fn from_env() -> Result<Self, DnsError> {
        Self::from_vars(|key| env::var(key).ok())
    }

    /// Load server configuration through an arbitrary variable lookup.
    ///
    /// # Arguments
    /// * `var` - Returns the value of a configuration variable, if set.
    ///
    /// # Returns
    /// A `Result` containing the validated configuration.
    pub fn from_vars<F>(var: F) -> Result<Self, DnsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let flag = |key: &str| {
            var(key)
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false)
        };

        if let Some(v) = var("NX9_PORT") {
            config.port = v.trim().parse()?;
        }
        if let Some(v) = var("NX9_CACHE_SIZE") {
            config.cache_size = v.trim().parse()?;
        }
        if let Some(v) = var("NX9_INTERFACES") {
            config.interfaces = split_list(&v);
        }
        if let Some(v) = var("NX9_LISTEN_ADDRESSES") {
            config.listen_addresses = split_list(&v)
                .iter()
                .map(|s| s.parse())
                .collect::<Result<_, _>>()?;
        }
        if let Some(v) = var("NX9_EXCEPT_INTERFACES") {
            config.except_interfaces = split_list(&v);
        }
        config.bind_interfaces = flag("NX9_BIND_INTERFACES");

        config.no_resolv = flag("NX9_NO_RESOLV");
        if let Some(v) = var("NX9_RESOLV_FILES") {
            if config.no_resolv {
                return Err(DnsError::Config(
                    "NX9_NO_RESOLV and NX9_RESOLV_FILES are mutually exclusive".into(),
                ));
            }
            config.resolv_files = split_list(&v).into_iter().map(PathBuf::from).collect();
        }
        if config.no_resolv {
            config.resolv_files.clear();
        }
        config.no_poll = flag("NX9_NO_POLL");

        if let Some(v) = var("NX9_SERVERS") {
            config.servers = split_list(&v)
                .iter()
                .map(|s| parse_server(s))
                .collect::<Result<_, _>>()?;
        }
        if let Some(v) = var("NX9_QUERY_PORT") {
            config.query_port = v.trim().parse()?;
        }
        if let Some(v) = var("NX9_LOCAL_TTL") {
            config.local_ttl = v.trim().parse()?;
        }
        if let Some(v) = var("NX9_EDNS_PACKET_MAX") {
            config.edns_packet_max = v.trim().parse()?;
        }
        config.edns_packet_max = config.edns_packet_max.max(PACKETSZ);

        config.domain_suffix = var("NX9_DOMAIN_SUFFIX")
            .map(|v| v.trim().trim_end_matches('.').to_ascii_lowercase())
            .filter(|v| !v.is_empty());
        if let Some(v) = var("NX9_HOSTS_FILE") {
            config.hosts_file = PathBuf::from(v);
        }
        config.no_hosts = flag("NX9_NO_HOSTS");
        if let Some(v) = var("NX9_ADDN_HOSTS") {
            let path = PathBuf::from(v);
            fs::metadata(&path).map_err(|e| {
                DnsError::Config(format!("cannot read {}: {}", path.display(), e))
            })?;
            config.addn_hosts = Some(path);
        }

        if let Some(v) = var("NX9_PID_FILE") {
            config.pid_file = non_empty(v).map(PathBuf::from);
        }
        if let Some(v) = var("NX9_USER") {
            config.user = non_empty(v);
        }
        if let Some(v) = var("NX9_GROUP") {
            config.group = non_empty(v);
        }
        config.foreground = flag("NX9_FOREGROUND");
        config.log_queries = flag("NX9_LOG_QUERIES");
        config.log_file = var("NX9_LOG_FILE").and_then(non_empty).map(PathBuf::from);

        if let Some(v) = var("NX9_DHCP_RANGES") {
            config.dhcp_ranges = v
                .split(';')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(parse_dhcp_range)
                .collect::<Result<_, _>>()?;
        }
        config.lease_file = var("NX9_LEASE_FILE").and_then(non_empty).map(PathBuf::from);
        if config.lease_file.is_none() && !config.dhcp_ranges.is_empty() {
            config.lease_file = Some(PathBuf::from("/var/lib/misc/nx9-dns.leases"));
        }
        if let Some(v) = var("NX9_DHCP_MAX_LEASES") {
            config.max_leases = v.trim().parse()?;
        }

        if let Some(v) = var("NX9_BOGUS_NXDOMAIN") {
            config.bogus_nxdomain = split_list(&v)
                .iter()
                .map(|s| s.parse())
                .collect::<Result<_, _>>()?;
        }
        if let Some(v) = var("NX9_ALIASES") {
            config.aliases = v
                .split(';')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(parse_alias)
                .collect::<Result<_, _>>()?;
        }

        if let Some(v) = var("NX9_MAX_TCP_SESSIONS") {
            config.max_tcp_sessions = v.trim().parse()?;
        }
        if let Some(v) = var("NX9_TCP_SESSION_LIFETIME") {
            config.tcp_session_lifetime = Duration::from_secs(v.trim().parse()?);
        }
        if let Some(v) = var("NX9_LEASE_DUMP_INTERVAL") {
            let secs: u64 = v.trim().parse()?;
            config.lease_dump_interval = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(v) = var("NX9_METRICS_ADDR") {
            config.metrics_addr = Some(v.trim().parse()?);
        }

        Ok(config)
    }

    /// Whether the DHCP server is enabled.
    pub fn dhcp_enabled(&self) -> bool {
        !self.dhcp_ranges.is_empty()
    }

    /// Whether resolver-list files are polled for changes.
    pub fn poll_resolv(&self) -> bool {
        !self.no_resolv && !self.no_poll && !self.resolv_files.is_empty()
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn non_empty(value: String) -> Option<String> {
    let value = value.trim().to_string();
    (!value.is_empty()).then_some(value)
}

/// Parse an upstream server as `addr` or `addr#port`.
fn parse_server(value: &str) -> Result<SocketAddr, DnsError> {
    let (addr, port) = match value.split_once('#') {
        Some((addr, port)) => (addr, port.parse()?),
        None => (value, NAMESERVER_PORT),
    };
    Ok(SocketAddr::new(addr.parse()?, port))
}

/// Parse `start,end[,leasetime]`.
fn parse_dhcp_range(value: &str) -> Result<DhcpRange, DnsError> {
    let parts: Vec<&str> = value.split(',').map(str::trim).collect();
    if parts.len() < 2 || parts.len() > 3 {
        return Err(DnsError::Config(format!("bad DHCP range: {value}")));
    }
    let start: Ipv4Addr = parts[0].parse()?;
    let end: Ipv4Addr = parts[1].parse()?;
    if u32::from(start) > u32::from(end) {
        return Err(DnsError::Config(format!(
            "DHCP range start {start} is after end {end}"
        )));
    }
    let lease_time = match parts.get(2) {
        Some(t) => parse_lease_time(t)?,
        None => 3600,
    };
    Ok(DhcpRange {
        start,
        end,
        lease_time,
    })
}

/// Parse `infinite`, `N`, `Ns`, `Nm` or `Nh`.
fn parse_lease_time(value: &str) -> Result<u32, DnsError> {
    if value.eq_ignore_ascii_case("infinite") {
        return Ok(0);
    }
    let (digits, factor) = match value.chars().last() {
        Some('h') | Some('H') => (&value[..value.len() - 1], 3600),
        Some('m') | Some('M') => (&value[..value.len() - 1], 60),
        Some('s') | Some('S') => (&value[..value.len() - 1], 1),
        _ => (value, 1),
    };
    let secs = digits.parse::<u32>()?.saturating_mul(factor);
    Ok(secs.max(MIN_LEASE_TIME))
}

/// Parse `from,to[,mask]`.
fn parse_alias(value: &str) -> Result<AddressAlias, DnsError> {
    let parts: Vec<&str> = value.split(',').map(str::trim).collect();
    if parts.len() < 2 || parts.len() > 3 {
        return Err(DnsError::Config(format!("bad alias: {value}")));
    }
    let mask = match parts.get(2) {
        Some(m) => m.parse()?,
        None => Ipv4Addr::BROADCAST,
    };
    Ok(AddressAlias {
        from: parts[0].parse()?,
        to: parts[1].parse()?,
        mask,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> Result<ServerConfig, DnsError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_vars(|k| vars.get(k).cloned())
    }

    #[test]
    fn defaults_without_variables() {
        let config = load(&[]).unwrap();
        assert_eq!(config.port, 53);
        assert_eq!(config.cache_size, DEFAULT_CACHE_SIZE);
        assert_eq!(config.resolv_files, vec![PathBuf::from("/etc/resolv.conf")]);
        assert_eq!(config.max_tcp_sessions, 20);
        assert!(!config.dhcp_enabled());
        assert!(config.poll_resolv());
    }

    #[test]
    fn parses_lists_and_servers() {
        let config = load(&[
            ("NX9_INTERFACES", "eth0, wlan0"),
            ("NX9_SERVERS", "1.1.1.1,9.9.9.9#5353"),
            ("NX9_RESOLV_FILES", "/a,/b"),
        ])
        .unwrap();
        assert_eq!(config.interfaces, vec!["eth0", "wlan0"]);
        assert_eq!(config.servers[1], "9.9.9.9:5353".parse().unwrap());
        assert_eq!(config.resolv_files.len(), 2);
    }

    #[test]
    fn no_resolv_conflicts_with_resolv_files() {
        let err = load(&[("NX9_NO_RESOLV", "1"), ("NX9_RESOLV_FILES", "/a")]).unwrap_err();
        assert!(matches!(err, DnsError::Config(_)));
    }

    #[test]
    fn dhcp_range_must_be_ordered() {
        let err = load(&[("NX9_DHCP_RANGES", "10.0.0.20,10.0.0.10")]).unwrap_err();
        assert!(matches!(err, DnsError::Config(_)));
    }

    #[test]
    fn dhcp_range_lease_times() {
        let config = load(&[(
            "NX9_DHCP_RANGES",
            "10.0.0.10,10.0.0.20,12h;10.0.1.5,10.0.1.5,infinite;10.0.2.1,10.0.2.9,30",
        )])
        .unwrap();
        assert_eq!(config.dhcp_ranges[0].lease_time, 12 * 3600);
        assert_eq!(config.dhcp_ranges[1].lease_time, 0);
        assert_eq!(config.dhcp_ranges[2].lease_time, MIN_LEASE_TIME);
        assert!(config.lease_file.is_some());
    }

    #[test]
    fn edns_size_has_a_floor() {
        let config = load(&[("NX9_EDNS_PACKET_MAX", "100")]).unwrap();
        assert_eq!(config.edns_packet_max, PACKETSZ);
    }

    #[test]
    fn missing_additional_hosts_is_fatal() {
        let err = load(&[("NX9_ADDN_HOSTS", "/nonexistent/nx9/hosts")]).unwrap_err();
        assert!(matches!(err, DnsError::Config(_)));
    }

    #[test]
    fn malformed_port_is_an_error() {
        assert!(matches!(
            load(&[("NX9_PORT", "dns")]).unwrap_err(),
            DnsError::Parse(_)
        ));
    }

    #[test]
    fn alias_defaults_to_host_mask() {
        let config = load(&[("NX9_ALIASES", "1.2.3.4,10.0.0.4")]).unwrap();
        assert_eq!(config.aliases[0].mask, Ipv4Addr::BROADCAST);
    }
}
