//! Interface and address enumeration.
//!
//! Produces the set of local addresses we serve on, and the allow-list that
//! TCP sessions and wildcard UDP queries are checked against.

use std::ffi::CStr;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::config::ServerConfig;
use crate::errors::DnsError;

/// An address on a local interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    /// Interface name, e.g. `eth0`.
    pub name: String,

    /// Interface address with the DNS port applied.
    pub addr: SocketAddr,

    /// Whether the interface is a loopback.
    pub is_loopback: bool,
}

/// Read every address of every interface from the system.
pub fn system_interfaces() -> io::Result<Vec<(String, IpAddr, bool)>> {
    let mut head: *mut libc::ifaddrs = std::ptr::null_mut();
    if unsafe { libc::getifaddrs(&mut head) } != 0 {
        return Err(io::Error::last_os_error());
    }

    let mut found = Vec::new();
    let mut cursor = head;
    while !cursor.is_null() {
        let ifa = unsafe { &*cursor };
        cursor = ifa.ifa_next;
        if ifa.ifa_addr.is_null() || ifa.ifa_flags & libc::IFF_UP as libc::c_uint == 0 {
            continue;
        }
        let name = unsafe { CStr::from_ptr(ifa.ifa_name) }
            .to_string_lossy()
            .into_owned();
        let is_loopback = ifa.ifa_flags & libc::IFF_LOOPBACK as libc::c_uint != 0;
        let family = unsafe { (*ifa.ifa_addr).sa_family } as libc::c_int;
        let addr = match family {
            libc::AF_INET => {
                let sin = unsafe { &*(ifa.ifa_addr as *const libc::sockaddr_in) };
                IpAddr::V4(Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)))
            }
            libc::AF_INET6 => {
                let sin6 = unsafe { &*(ifa.ifa_addr as *const libc::sockaddr_in6) };
                IpAddr::V6(Ipv6Addr::from(sin6.sin6_addr.s6_addr))
            }
            _ => continue,
        };
        found.push((name, addr, is_loopback));
    }

    unsafe { libc::freeifaddrs(head) };
    Ok(found)
}

/// Select the interfaces to serve on.
///
/// An interface is used when it is not excluded and either no names or
/// addresses are configured, or it matches one of them. Every configured
/// name and address must match at least one system interface.
///
/// # Arguments
/// * `config` - Names, addresses, exclusions and port.
/// * `system` - Output of [`system_interfaces`].
///
/// # Returns
/// The permitted interfaces, or the first unmatched name or address.
pub fn enumerate_interfaces(
    config: &ServerConfig,
    system: &[(String, IpAddr, bool)],
) -> Result<Vec<Interface>, DnsError> {
    let mut name_used = vec![false; config.interfaces.len()];
    let mut addr_used = vec![false; config.listen_addresses.len()];
    let filtered = !config.interfaces.is_empty() || !config.listen_addresses.is_empty();
    let mut selected = Vec::new();

    for (name, ip, is_loopback) in system {
        if config.except_interfaces.iter().any(|e| e == name) {
            continue;
        }
        let mut matched = !filtered;
        for (i, wanted) in config.interfaces.iter().enumerate() {
            if wanted == name {
                name_used[i] = true;
                matched = true;
            }
        }
        for (i, wanted) in config.listen_addresses.iter().enumerate() {
            if wanted == ip {
                addr_used[i] = true;
                matched = true;
            }
        }
        if matched {
            selected.push(Interface {
                name: name.clone(),
                addr: SocketAddr::new(*ip, config.port),
                is_loopback: *is_loopback,
            });
        }
    }

    if let Some(i) = name_used.iter().position(|used| !used) {
        return Err(DnsError::UnknownInterface(config.interfaces[i].clone()));
    }
    if let Some(i) = addr_used.iter().position(|used| !used) {
        return Err(DnsError::UnknownAddress(config.listen_addresses[i]));
    }
    Ok(selected)
}

/// Which local addresses may be served, for sockets bound to the wildcard.
#[derive(Debug, Clone, Default)]
pub struct AccessList {
    /// Addresses of excluded interfaces.
    except: Vec<IpAddr>,

    /// Addresses of named interfaces plus configured addresses.
    allowed: Vec<IpAddr>,

    /// Whether any names or addresses were configured.
    restricted: bool,
}

impl AccessList {
    /// Build the list from configuration and the system interfaces.
    pub fn new(config: &ServerConfig, system: &[(String, IpAddr, bool)]) -> Self {
        let addrs_of = |names: &[String]| -> Vec<IpAddr> {
            system
                .iter()
                .filter(|(name, _, _)| names.contains(name))
                .map(|(_, ip, _)| *ip)
                .collect()
        };
        let mut allowed = addrs_of(&config.interfaces);
        allowed.extend(config.listen_addresses.iter().copied());
        Self {
            except: addrs_of(&config.except_interfaces),
            allowed,
            restricted: !config.interfaces.is_empty() || !config.listen_addresses.is_empty(),
        }
    }

    /// Whether a connection or packet addressed to `local` may be served.
    ///
    /// Excluded addresses are always denied. With names or addresses
    /// configured the default is deny; otherwise it is allow.
    pub fn allows(&self, local: IpAddr) -> bool {
        let local = match local {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(local),
            v4 => v4,
        };
        if self.except.contains(&local) {
            return false;
        }
        !self.restricted || self.allowed.contains(&local)
    }
}
