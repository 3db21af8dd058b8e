//! DNS cache implementation.
//!
//! This module keeps two kinds of data: a local hosts table built from hosts
//! files and DHCP leases, and an LRU of answers forwarded from upstream
//! servers. The reactor owns the cache; TCP workers only ever see an
//! immutable snapshot of the hosts table.

use std::{
    collections::HashMap,
    fs,
    net::Ipv4Addr,
    num::NonZeroUsize,
    path::Path,
    sync::Arc,
};

use log::{info, warn};
use lru::LruCache;

use crate::config::ServerConfig;
use crate::utils::{
    format_unix_time, is_truncated, min_ttl, rcode, records, RCODE_NOERROR, RCODE_NXDOMAIN, TYPE_OPT,
};

/// TTL applied to cached negative answers without an SOA.
pub const NEGATIVE_TTL: u32 = 60;

/// Names and addresses known locally.
#[derive(Debug, Clone, Default)]
pub struct HostsTable {
    by_name: HashMap<String, Vec<Ipv4Addr>>,
}

impl HostsTable {
    /// Parse hosts-file contents.
    ///
    /// Bare names also get `suffix` appended. IPv6 and malformed lines are
    /// skipped.
    ///
    /// # Returns
    /// The number of addresses read.
    pub fn add_hosts_file(&mut self, contents: &str, suffix: Option<&str>) -> usize {
        let mut added = 0;
        for line in contents.lines() {
            let line = line.split('#').next().unwrap_or_default();
            let mut fields = line.split_whitespace();
            let Some(Ok(addr)) = fields.next().map(str::parse::<Ipv4Addr>) else {
                continue;
            };
            for name in fields {
                self.insert(name, addr, suffix);
                added += 1;
            }
        }
        added
    }

    /// Add one name.
    pub fn insert(&mut self, name: &str, addr: Ipv4Addr, suffix: Option<&str>) {
        let name = name.trim_end_matches('.').to_ascii_lowercase();
        if name.is_empty() {
            return;
        }
        if let (false, Some(suffix)) = (name.contains('.'), suffix) {
            self.push(format!("{name}.{suffix}"), addr);
        }
        self.push(name, addr);
    }

    fn push(&mut self, name: String, addr: Ipv4Addr) {
        let addrs = self.by_name.entry(name).or_default();
        if !addrs.contains(&addr) {
            addrs.push(addr);
        }
    }

    /// Look up the addresses of a name.
    pub fn lookup(&self, name: &str) -> Option<&[Ipv4Addr]> {
        self.by_name.get(name).map(Vec::as_slice)
    }

    /// Number of names held.
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

/// Key of a cached answer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub name: String,
    pub qtype: u16,
}

/// An entry in the DNS cache.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// The upstream answer as received, id included.
    pub answer: Vec<u8>,

    /// When this entry was added, in unix seconds.
    pub inserted: u64,

    /// Time-to-live in seconds.
    pub ttl: u32,
}

impl CacheEntry {
    fn expired(&self, now: u64) -> bool {
        now >= self.inserted + u64::from(self.ttl)
    }
}

/// Cache for DNS answers and local names.
#[derive(Debug)]
pub struct DnsCache {
    /// Forwarded answers. `None` when caching is disabled.
    answers: Option<LruCache<CacheKey, CacheEntry>>,

    /// Hosts read from files on the last reload.
    file_hosts: HostsTable,

    /// Hosts learned from DHCP leases.
    lease_hosts: Vec<(String, Ipv4Addr)>,

    /// Merged view handed to the query path and to TCP workers.
    hosts: Arc<HostsTable>,

    domain_suffix: Option<String>,

    size: usize,

    log_queries: bool,
}

impl DnsCache {
    /// Create a new DNS cache.
    ///
    /// # Arguments
    /// * `size` - Number of forwarded answers to keep; zero disables caching.
    /// * `log_queries` - Whether cache hits and dumps are verbose.
    ///
    /// # Returns
    /// A new `DnsCache` instance.
    pub fn new(size: usize, log_queries: bool) -> Self {
        Self {
            answers: NonZeroUsize::new(size).map(LruCache::new),
            file_hosts: HostsTable::default(),
            lease_hosts: Vec::new(),
            hosts: Arc::new(HostsTable::default()),
            domain_suffix: None,
            size,
            log_queries,
        }
    }

    /// Re-read hosts files and drop every forwarded answer.
    ///
    /// # Arguments
    /// * `config` - The server configuration naming the hosts files.
    pub fn reload(&mut self, config: &ServerConfig) {
        if let Some(answers) = self.answers.as_mut() {
            answers.clear();
        }
        self.domain_suffix = config.domain_suffix.clone();

        let mut table = HostsTable::default();
        if !config.no_hosts {
            read_hosts(&mut table, &config.hosts_file, self.domain_suffix.as_deref());
        }
        if let Some(path) = &config.addn_hosts {
            read_hosts(&mut table, path, self.domain_suffix.as_deref());
        }
        self.file_hosts = table;
        self.rebuild_hosts();
    }

    /// Replace the names learned from DHCP leases.
    pub fn set_lease_hosts(&mut self, hosts: Vec<(String, Ipv4Addr)>) {
        self.lease_hosts = hosts;
        self.rebuild_hosts();
    }

    fn rebuild_hosts(&mut self) {
        let mut merged = self.file_hosts.clone();
        for (name, addr) in &self.lease_hosts {
            merged.insert(name, *addr, self.domain_suffix.as_deref());
        }
        self.hosts = Arc::new(merged);
    }

    /// Snapshot of the local names.
    pub fn hosts(&self) -> Arc<HostsTable> {
        Arc::clone(&self.hosts)
    }

    /// Get a cached answer with TTLs reduced by its age.
    ///
    /// # Arguments
    /// * `key` - Question name and type.
    /// * `now` - Current unix time in seconds.
    ///
    /// # Returns
    /// The answer bytes, still carrying the id of the query that filled it.
    pub fn get(&mut self, key: &CacheKey, now: u64) -> Option<Vec<u8>> {
        let answers = self.answers.as_mut()?;
        let entry = answers.get(key)?;
        if entry.expired(now) {
            answers.pop(key);
            return None;
        }

        let age = now.saturating_sub(entry.inserted) as u32;
        let mut answer = entry.answer.clone();
        for span in records(&answer) {
            if span.rtype == TYPE_OPT {
                continue;
            }
            let ttl = span.ttl.saturating_sub(age);
            answer[span.ttl_offset..span.ttl_offset + 4].copy_from_slice(&ttl.to_be_bytes());
        }
        if self.log_queries {
            info!("cached {} is {} bytes", key.name, answer.len());
        }
        Some(answer)
    }

    /// Add an upstream answer.
    ///
    /// Truncated answers and answers other than NOERROR/NXDOMAIN are not
    /// cached. NXDOMAIN without records is cached for `NEGATIVE_TTL`.
    pub fn insert(&mut self, key: CacheKey, answer: &[u8], now: u64) {
        let Some(answers) = self.answers.as_mut() else {
            return;
        };
        if is_truncated(answer) {
            return;
        }
        let ttl = match (rcode(answer), min_ttl(answer)) {
            (RCODE_NOERROR, Some(ttl)) => ttl,
            (RCODE_NXDOMAIN, ttl) => ttl.unwrap_or(NEGATIVE_TTL).min(NEGATIVE_TTL),
            _ => return,
        };
        if ttl == 0 {
            return;
        }
        answers.put(
            key,
            CacheEntry {
                answer: answer.to_vec(),
                inserted: now,
                ttl,
            },
        );
    }

    /// Log the cache contents.
    ///
    /// # Arguments
    /// * `now` - Current unix time in seconds.
    pub fn dump(&self, now: u64) {
        match &self.answers {
            Some(answers) => info!(
                "cache size {}, {}/{} slots in use",
                self.size,
                answers.len(),
                self.size
            ),
            None => info!("cache disabled"),
        }
        info!("{} local names", self.hosts.len());
        if !self.log_queries {
            return;
        }
        for (name, addrs) in &self.hosts.by_name {
            for addr in addrs {
                info!("  {:<40} {:<15} local", name, addr);
            }
        }
        if let Some(answers) = &self.answers {
            for (key, entry) in answers.iter() {
                let expires = entry.inserted + u64::from(entry.ttl);
                info!(
                    "  {:<40} type {:<5} ttl {:<6} expires {}",
                    key.name,
                    key.qtype,
                    expires.saturating_sub(now),
                    format_unix_time(expires)
                );
            }
        }
    }
}

fn read_hosts(table: &mut HostsTable, path: &Path, suffix: Option<&str>) {
    match fs::read_to_string(path) {
        Ok(contents) => {
            let added = table.add_hosts_file(&contents, suffix);
            info!("read {} - {} addresses", path.display(), added);
        }
        Err(e) => warn!("failed to load names from {}: {}", path.display(), e),
    }
}
