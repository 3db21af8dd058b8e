//! DHCP lease store.
//!
//! Leases live in memory and are written out as one line per lease:
//!
//! ```text
//! <expiry> <mac> <address> <hostname|*>
//! ```
//!
//! An expiry of `0` means the lease never expires.

use std::fmt::Write as _;
use std::fs;
use std::io;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use log::{debug, info, warn};

use crate::errors::DnsError;

/// A hardware address.
pub type Mac = [u8; 6];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub mac: Mac,
    pub addr: Ipv4Addr,
    pub hostname: Option<String>,

    /// Unix seconds, `0` for infinite.
    pub expires: u64,
}

impl Lease {
    pub fn expired(&self, now: u64) -> bool {
        self.expires != 0 && self.expires <= now
    }
}

pub fn format_mac(mac: &Mac) -> String {
    mac.iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

pub fn parse_mac(value: &str) -> Option<Mac> {
    let mut mac = [0u8; 6];
    let mut parts = value.split(':');
    for byte in mac.iter_mut() {
        *byte = u8::from_str_radix(parts.next()?, 16).ok()?;
    }
    parts.next().is_none().then_some(mac)
}

/// Parse lease-file contents, dropping malformed and expired lines.
pub fn parse_leases(contents: &str, now: u64) -> Vec<Lease> {
    contents
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let expires = fields.next()?.parse().ok()?;
            let mac = parse_mac(fields.next()?)?;
            let addr = fields.next()?.parse().ok()?;
            let hostname = fields.next().filter(|h| *h != "*").map(String::from);
            Some(Lease {
                mac,
                addr,
                hostname,
                expires,
            })
        })
        .filter(|lease| !lease.expired(now))
        .collect()
}

#[derive(Debug)]
pub struct LeaseStore {
    path: Option<PathBuf>,
    leases: Vec<Lease>,
    domain_suffix: Option<String>,
    max_leases: usize,

    /// In-memory state differs from the file.
    dirty: bool,

    /// File mtime at the last read, for external-reader mode.
    mtime: u64,
}

impl LeaseStore {
    /// Load the lease file.
    ///
    /// # Arguments
    /// * `path` - Lease file; a missing file is an empty store.
    /// * `suffix` - Domain appended to lease hostnames.
    /// * `now` - Current unix time, used to drop expired leases.
    /// * `max_leases` - Cap on leases held.
    ///
    /// # Returns
    /// The store, or an error when the file exists but cannot be read.
    pub fn init(
        path: Option<&Path>,
        suffix: Option<&str>,
        now: u64,
        max_leases: usize,
    ) -> Result<Self, DnsError> {
        let mut store = Self {
            path: path.map(Path::to_path_buf),
            leases: Vec::new(),
            domain_suffix: suffix.map(String::from),
            max_leases,
            dirty: false,
            mtime: 0,
        };
        if let Some(path) = path {
            match fs::read_to_string(path) {
                Ok(contents) => {
                    store.leases = parse_leases(&contents, now);
                    store.leases.truncate(max_leases);
                    store.mtime = mtime_secs(path).unwrap_or(0);
                    info!("read {} leases from {}", store.leases.len(), path.display());
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!("no lease file at {}", path.display());
                }
                Err(e) => {
                    return Err(DnsError::Config(format!(
                        "cannot read lease file {}: {}",
                        path.display(),
                        e
                    )))
                }
            }
        }
        Ok(store)
    }

    pub fn leases(&self) -> &[Lease] {
        &self.leases
    }

    pub fn len(&self) -> usize {
        self.leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }

    pub fn max_leases(&self) -> usize {
        self.max_leases
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn by_mac(&self, mac: &Mac, now: u64) -> Option<&Lease> {
        self.leases
            .iter()
            .find(|l| &l.mac == mac && !l.expired(now))
    }

    pub fn by_addr(&self, addr: Ipv4Addr, now: u64) -> Option<&Lease> {
        self.leases
            .iter()
            .find(|l| l.addr == addr && !l.expired(now))
    }

    /// Create or renew the lease of `mac`.
    ///
    /// # Returns
    /// `false` when the store is full and `mac` holds no lease.
    pub fn upsert(&mut self, mac: Mac, addr: Ipv4Addr, hostname: Option<String>, expires: u64, now: u64) -> bool {
        self.prune(now);
        let lease = Lease {
            mac,
            addr,
            hostname,
            expires,
        };
        let full = self.leases.len() >= self.max_leases;
        match self.leases.iter_mut().find(|l| l.mac == mac) {
            Some(existing) => *existing = lease,
            None if full => return false,
            None => self.leases.push(lease),
        }
        self.dirty = true;
        true
    }

    /// Drop the lease of `mac`, if any.
    pub fn release(&mut self, mac: &Mac) -> Option<Lease> {
        let idx = self.leases.iter().position(|l| &l.mac == mac)?;
        self.dirty = true;
        Some(self.leases.remove(idx))
    }

    fn prune(&mut self, now: u64) {
        let before = self.leases.len();
        self.leases.retain(|l| !l.expired(now));
        if self.leases.len() != before {
            self.dirty = true;
        }
    }

    /// Write the lease file.
    ///
    /// # Arguments
    /// * `force` - Write even when nothing changed.
    /// * `now` - Current unix time; expired leases are dropped first.
    ///
    /// # Returns
    /// Whether the file was written.
    pub fn persist(&mut self, force: bool, now: u64) -> io::Result<bool> {
        self.prune(now);
        let Some(path) = &self.path else {
            return Ok(false);
        };
        if !self.dirty && !force {
            return Ok(false);
        }
        let mut out = String::new();
        for lease in &self.leases {
            let _ = writeln!(
                out,
                "{} {} {} {}",
                lease.expires,
                format_mac(&lease.mac),
                lease.addr,
                lease.hostname.as_deref().unwrap_or("*")
            );
        }
        fs::write(path, out)?;
        self.mtime = mtime_secs(path).unwrap_or(self.mtime);
        self.dirty = false;
        Ok(true)
    }

    /// Re-read the file when something else rewrote it.
    ///
    /// # Returns
    /// Whether the leases were replaced.
    pub fn reload_if_changed(&mut self, now: u64) -> bool {
        let Some(path) = &self.path else {
            return false;
        };
        let mtime = match mtime_secs(path) {
            Ok(mtime) => mtime,
            Err(_) => return false,
        };
        if mtime == self.mtime {
            return false;
        }
        match fs::read_to_string(path) {
            Ok(contents) => {
                self.mtime = mtime;
                self.leases = parse_leases(&contents, now);
                self.leases.truncate(self.max_leases);
                self.dirty = false;
                true
            }
            Err(e) => {
                warn!("failed to read {}: {}", path.display(), e);
                false
            }
        }
    }

    /// Names for the DNS hosts table.
    pub fn hosts(&self) -> Vec<(String, Ipv4Addr)> {
        self.leases
            .iter()
            .filter_map(|l| {
                let name = l.hostname.as_ref()?;
                let name = match &self.domain_suffix {
                    Some(suffix) if !name.contains('.') => format!("{name}.{suffix}"),
                    _ => name.clone(),
                };
                Some((name, l.addr))
            })
            .collect()
    }
}

fn mtime_secs(path: &Path) -> io::Result<u64> {
    let modified = fs::metadata(path)?.modified()?;
    Ok(modified
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0))
}
