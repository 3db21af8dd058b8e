//! Process lifecycle: daemonizing, pidfile, descriptor hygiene and dropping
//! root.
//!
//! These run in `main` strictly in order, before the async runtime exists:
//! a `fork` with runtime threads alive would leave them behind.

use std::ffi::CString;
use std::fs;
use std::io;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{info, warn};

use crate::config::ServerConfig;
use crate::errors::DnsError;

/// Highest descriptor number closed after daemonizing, exclusive.
const MAX_INHERITED_FD: RawFd = 64;

/// Current unix time in whole seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Detach from the terminal and write the pidfile.
///
/// Double fork with a new session in between, so the daemon can never
/// reacquire a controlling terminal. The original process and the
/// intermediate child exit here.
pub fn daemonize(pid_file: Option<&Path>) -> Result<(), DnsError> {
    fork_and_exit_parent()?;
    if unsafe { libc::setsid() } < 0 {
        return Err(DnsError::Privilege(format!(
            "setsid: {}",
            io::Error::last_os_error()
        )));
    }
    fork_and_exit_parent()?;

    std::env::set_current_dir("/")?;
    unsafe { libc::umask(0o022) };
    if let Some(path) = pid_file {
        if let Err(e) = write_pidfile(path, std::process::id()) {
            warn!("failed to write pidfile {}: {}", path.display(), e);
        }
    }
    unsafe { libc::umask(0) };
    Ok(())
}

fn fork_and_exit_parent() -> Result<(), DnsError> {
    match unsafe { libc::fork() } {
        -1 => Err(DnsError::Privilege(format!(
            "fork: {}",
            io::Error::last_os_error()
        ))),
        0 => Ok(()),
        _ => unsafe { libc::_exit(0) },
    }
}

/// Write `pid` as a decimal line.
pub fn write_pidfile(path: &Path, pid: u32) -> io::Result<()> {
    fs::write(path, format!("{pid}\n"))
}

/// Close descriptors `3..64` not in `keep`, and point stdio at `/dev/null`.
///
/// # Returns
/// The number of descriptors closed.
pub fn close_unused_descriptors(keep: &[RawFd]) -> io::Result<usize> {
    let mut closed = 0;
    for fd in 3..MAX_INHERITED_FD {
        if keep.contains(&fd) {
            continue;
        }
        if unsafe { libc::close(fd) } == 0 {
            closed += 1;
        }
    }

    let null = fs::OpenOptions::new().read(true).write(true).open("/dev/null")?;
    let null_fd = std::os::unix::io::AsRawFd::as_raw_fd(&null);
    for fd in 0..3 {
        if unsafe { libc::dup2(null_fd, fd) } < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(closed)
}

/// Drop supplementary groups, then switch group and user.
///
/// The group is `group` when it exists, else the user's primary group. An
/// unknown user leaves privileges unchanged.
pub fn drop_privileges(user: Option<&str>, group: Option<&str>) -> Result<(), DnsError> {
    let Some(user) = user else {
        return Ok(());
    };
    let name = CString::new(user).map_err(|_| DnsError::Config(format!("bad user name {user}")))?;
    let pw = unsafe { libc::getpwnam(name.as_ptr()) };
    if pw.is_null() {
        warn!("unknown user {}, not dropping privileges", user);
        return Ok(());
    }
    let (uid, primary_gid) = unsafe { ((*pw).pw_uid, (*pw).pw_gid) };

    let gid = group
        .and_then(|g| CString::new(g).ok())
        .map(|g| unsafe { libc::getgrnam(g.as_ptr()) })
        .filter(|gr| !gr.is_null())
        .map(|gr| unsafe { (*gr).gr_gid })
        .unwrap_or(primary_gid);

    let check = |rc: libc::c_int, what: &str| {
        if rc < 0 {
            Err(DnsError::Privilege(format!(
                "{}: {}",
                what,
                io::Error::last_os_error()
            )))
        } else {
            Ok(())
        }
    };
    check(unsafe { libc::setgroups(0, std::ptr::null()) }, "setgroups")?;
    check(unsafe { libc::setgid(gid) }, "setgid")?;
    check(unsafe { libc::setuid(uid) }, "setuid")?;
    Ok(())
}

/// Format a lease time as `XhYmZs`, omitting zero parts.
pub fn format_lease_time(secs: u32) -> String {
    if secs == 0 {
        return "infinite".into();
    }
    let mut out = String::new();
    for (value, unit) in [(secs / 3600, 'h'), ((secs / 60) % 60, 'm'), (secs % 60, 's')] {
        if value != 0 {
            out.push_str(&format!("{value}{unit}"));
        }
    }
    out
}

/// Lines logged once startup has finished.
pub fn startup_summary(config: &ServerConfig, bind_fallback: bool, running_as_root: bool) -> Vec<(log::Level, String)> {
    let version = env!("CARGO_PKG_VERSION");
    let mut lines = Vec::new();
    if config.cache_size != 0 {
        lines.push((
            log::Level::Info,
            format!("started, version {} cachesize {}", version, config.cache_size),
        ));
    } else {
        lines.push((log::Level::Info, format!("started, version {version} cache disabled")));
    }
    if bind_fallback {
        lines.push((
            log::Level::Warn,
            "binding to interfaces because the wildcard address cannot report destinations".into(),
        ));
    }
    for range in &config.dhcp_ranges {
        let time = format_lease_time(range.lease_time);
        let line = if range.start == range.end {
            format!("DHCP, static leases only on {}, lease time {}", range.end, time)
        } else {
            format!("DHCP, IP range {} -- {}, lease time {}", range.start, range.end, time)
        };
        lines.push((log::Level::Info, line));
    }
    if let (Some(interval), Some(file)) = (config.lease_dump_interval, &config.lease_file) {
        lines.push((
            log::Level::Info,
            format!("DHCP, {} will be written every {}s", file.display(), interval.as_secs()),
        ));
    }
    if running_as_root {
        lines.push((log::Level::Warn, "running as root".into()));
    }
    lines
}

/// Log the startup summary.
pub fn log_startup(config: &ServerConfig, bind_fallback: bool) {
    let root = !config.foreground && unsafe { libc::getuid() == 0 || libc::geteuid() == 0 };
    for (level, line) in startup_summary(config, bind_fallback, root) {
        log::log!(level, "{}", line);
    }
}

/// Schedule the next alarm signal.
pub fn arm_alarm(interval: Duration) {
    let secs = u32::try_from(interval.as_secs()).unwrap_or(u32::MAX).max(1);
    unsafe { libc::alarm(secs) };
}

/// Log the shutdown line.
pub fn log_shutdown() {
    info!("exiting on receipt of SIGTERM");
}
