//! NX9 gateway DNS
//!
//! A caching DNS forwarder with an optional DHCP server for small networks.
//! A single reactor serves UDP queries, upstream answers and DHCP packets;
//! TCP queries run as supervised worker tasks with their own copy of the
//! upstream server list.

pub mod cache;
pub mod config;
pub mod dhcp;
pub mod dns;
pub mod errors;
pub mod forward;
pub mod interfaces;
pub mod leases;
pub mod lifecycle;
pub mod listeners;
pub mod pktinfo;
pub mod reactor;
pub mod servers;
pub mod signals;
pub mod tcp;
pub mod utils;
pub mod watcher;

// Re-export commonly used items
pub use cache::DnsCache;
pub use config::ServerConfig;
pub use errors::DnsError;
pub use reactor::{Reactor, Services};
pub use signals::SignalFlags;
