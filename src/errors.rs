//! Crate-wide error type.
//!
//! Anything returned from startup ends the process. Once the reactor runs,
//! errors are logged where they happen and the loop carries on.

use std::net::IpAddr;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DnsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A DNS or DHCP message we could not use.
    #[error("Invalid packet: {0}")]
    Protocol(String),

    /// Bad or conflicting settings, including unreadable required files.
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(#[from] std::num::ParseIntError),

    #[error("Address error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),

    /// A configured interface name matched no system interface.
    #[error("unknown interface {0}")]
    UnknownInterface(String),

    /// A configured listen address is on no system interface.
    #[error("no interface with address {0}")]
    UnknownAddress(IpAddr),

    /// Forking, setsid or the switch to an unprivileged user failed.
    #[error("Privilege error: {0}")]
    Privilege(String),
}
