//! TCP session supervisor.
//!
//! Each accepted connection runs as its own task under a hard deadline. The
//! supervisor counts a session on spawn; only the reaper uncounts it.

use std::future::Future;
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::time::Duration;

use log::debug;
use metrics::counter;

use crate::errors::DnsError;
use crate::forward::{tcp_request, SessionContext};
use crate::interfaces::AccessList;
use crate::signals::{ChildReaper, SignalFlags};

/// Admission decision for an accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accepted,
    /// The local address is not on the allow-list.
    Denied,
    /// The session cap is reached.
    AtCapacity,
}

#[derive(Debug)]
pub struct TcpSupervisor {
    max_sessions: usize,
    lifetime: Duration,

    /// Checked against the local address of each connection. Only set for
    /// wildcard listeners.
    acl: Option<AccessList>,

    next_id: u64,
}

impl TcpSupervisor {
    pub fn new(max_sessions: usize, lifetime: Duration, acl: Option<AccessList>) -> Self {
        Self {
            max_sessions,
            lifetime,
            acl,
            next_id: 0,
        }
    }

    /// Decide whether a connection to `local` may get a session.
    pub fn admit(&self, local: Option<SocketAddr>, flags: &SignalFlags) -> Admission {
        if let (Some(acl), Some(local)) = (&self.acl, local) {
            if !acl.allows(local.ip()) {
                return Admission::Denied;
            }
        }
        if flags.live_children() >= self.max_sessions {
            return Admission::AtCapacity;
        }
        Admission::Accepted
    }

    /// Accept one connection and serve it.
    ///
    /// Refused connections are closed without a response.
    ///
    /// # Arguments
    /// * `listener` - A non-blocking listening socket.
    /// * `context` - Builds the session's private state, called only when the
    ///   connection is admitted.
    ///
    /// # Returns
    /// The admission decision, or `WouldBlock` when nothing was pending.
    pub fn accept<F>(
        &mut self,
        listener: &TcpListener,
        flags: &SignalFlags,
        reaper: &ChildReaper,
        context: F,
    ) -> io::Result<Admission>
    where
        F: FnOnce() -> SessionContext,
    {
        let (stream, peer) = loop {
            match listener.accept() {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => break other?,
            }
        };

        let admission = self.admit(stream.local_addr().ok(), flags);
        match admission {
            Admission::Accepted => {}
            Admission::Denied => {
                debug!("TCP connection from {} to a denied address", peer);
                counter!("nx9_tcp_rejected_total", 1, "reason" => "acl");
                return Ok(admission);
            }
            Admission::AtCapacity => {
                debug!("TCP connection from {} refused, {} sessions live", peer, flags.live_children());
                counter!("nx9_tcp_rejected_total", 1, "reason" => "cap");
                return Ok(admission);
            }
        }

        stream.set_nonblocking(true)?;
        let mut stream = tokio::net::TcpStream::from_std(stream)?;
        let ctx = context();
        self.spawn_session(flags, reaper, async move { tcp_request(ctx, &mut stream).await });
        Ok(admission)
    }

    /// Run `session` as a worker under the session deadline.
    ///
    /// # Returns
    /// The session id.
    pub fn spawn_session<Fut>(&mut self, flags: &SignalFlags, reaper: &ChildReaper, session: Fut) -> u64
    where
        Fut: Future<Output = Result<(), DnsError>> + Send + 'static,
    {
        let id = self.next_id;
        self.next_id += 1;
        let mut guard = reaper.guard(id);
        let lifetime = self.lifetime;

        flags.child_spawned();
        counter!("nx9_tcp_sessions_total", 1);
        tokio::spawn(async move {
            match tokio::time::timeout(lifetime, session).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("TCP session {} failed: {}", id, e),
                Err(_) => guard.timed_out = true,
            }
            drop(guard);
        });
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supervisor(max: usize, lifetime: Duration) -> TcpSupervisor {
        TcpSupervisor::new(max, lifetime, None)
    }

    #[tokio::test]
    async fn refuses_at_the_cap() {
        let flags = SignalFlags::new(false);
        let mut reaper = ChildReaper::new();
        let mut tcp = supervisor(2, Duration::from_secs(30));

        for _ in 0..2 {
            assert_eq!(tcp.admit(None, &flags), Admission::Accepted);
            tcp.spawn_session(&flags, &reaper, std::future::pending());
        }
        assert_eq!(flags.live_children(), 2);
        assert_eq!(tcp.admit(None, &flags), Admission::AtCapacity);
        assert_eq!(reaper.reap(&flags, None), 0);
    }

    #[tokio::test]
    async fn connection_over_the_cap_is_closed_unanswered() {
        use tokio::io::AsyncReadExt;

        let flags = SignalFlags::new(false);
        let reaper = ChildReaper::new();
        let mut tcp = supervisor(1, Duration::from_secs(30));
        tcp.spawn_session(&flags, &reaper, std::future::pending());

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = tokio::net::TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();

        let admission = tcp
            .accept(&listener, &flags, &reaper, || -> SessionContext {
                panic!("no session may be built over the cap")
            })
            .unwrap();
        assert_eq!(admission, Admission::AtCapacity);
        assert_eq!(flags.live_children(), 1);

        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn deadline_kills_stuck_session() {
        let flags = SignalFlags::new(false);
        let mut reaper = ChildReaper::new();
        let mut tcp = supervisor(1, Duration::from_millis(50));

        let id = tcp.spawn_session(&flags, &reaper, std::future::pending());
        assert_eq!(tcp.admit(None, &flags), Admission::AtCapacity);

        let exit = reaper.exited().await.unwrap();
        assert_eq!(exit.id, id);
        assert!(exit.timed_out);
        assert_eq!(reaper.reap(&flags, Some(exit)), 1);
        assert_eq!(flags.live_children(), 0);
        assert_eq!(tcp.admit(None, &flags), Admission::Accepted);
    }

    #[tokio::test]
    async fn failed_session_is_reaped() {
        let flags = SignalFlags::new(false);
        let mut reaper = ChildReaper::new();
        let mut tcp = supervisor(4, Duration::from_secs(5));

        tcp.spawn_session(&flags, &reaper, async { Err(DnsError::Protocol("client went away".into())) });
        let exit = reaper.exited().await.unwrap();
        assert!(!exit.timed_out);
        reaper.reap(&flags, Some(exit));
        assert_eq!(flags.live_children(), 0);
    }

    #[test]
    fn acl_denies_local_address() {
        let config = crate::config::ServerConfig {
            except_interfaces: vec!["lo".into()],
            ..Default::default()
        };
        let system = vec![("lo".to_string(), "127.0.0.1".parse().unwrap(), true)];
        let tcp = TcpSupervisor::new(4, Duration::from_secs(5), Some(AccessList::new(&config, &system)));
        let flags = SignalFlags::new(false);
        assert_eq!(
            tcp.admit(Some("127.0.0.1:53".parse().unwrap()), &flags),
            Admission::Denied
        );
        assert_eq!(
            tcp.admit(Some("192.0.2.1:53".parse().unwrap()), &flags),
            Admission::Accepted
        );
    }
}
