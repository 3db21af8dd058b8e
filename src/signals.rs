//! Signal bridge.
//!
//! OS signals only ever set flags and poke a self-pipe. The reactor consumes
//! the flags at one point per iteration through [`SignalFlags::drain`], so a
//! half-applied notification is never observed.
//!
//! ```text
//! SIGTERM/SIGINT -> terminate     SIGHUP -> reload
//! SIGUSR1        -> dump          SIGALRM -> alarm (periodic maintenance)
//! worker exit    -> ChildReaper -> live_children - 1
//! ```

use std::io::{self, Read};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use log::debug;
use signal_hook::consts::{SIGALRM, SIGHUP, SIGINT, SIGTERM, SIGUSR1};
use tokio::sync::mpsc;

/// Process-wide flags set asynchronously and cleared by the reactor.
#[derive(Debug)]
pub struct SignalFlags {
    terminate: Arc<AtomicBool>,
    reload: Arc<AtomicBool>,
    dump: Arc<AtomicBool>,
    alarm: Arc<AtomicBool>,
    live_children: AtomicUsize,
}

/// Result of draining the flags at the top of an iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Drain {
    /// Termination was requested. Nothing else was consumed.
    Terminate,
    /// The flags that were pending, now cleared.
    Continue(Pending),
}

/// Snapshot of consumed flags, handled in field order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Pending {
    pub reload: bool,
    pub dump: bool,
    pub alarm: bool,
}

impl SignalFlags {
    /// Create the flag set.
    ///
    /// Reload starts set so the first iteration loads the cache and servers
    /// before any query is served. `alarm` starts set when periodic lease
    /// writes are configured.
    pub fn new(alarm_pending: bool) -> Self {
        Self {
            terminate: Arc::new(AtomicBool::new(false)),
            reload: Arc::new(AtomicBool::new(true)),
            dump: Arc::new(AtomicBool::new(false)),
            alarm: Arc::new(AtomicBool::new(alarm_pending)),
            live_children: AtomicUsize::new(0),
        }
    }

    /// Consume pending flags in priority order.
    ///
    /// Terminate outranks everything: when it is set the other flags are
    /// left untouched and no reload or dump happens.
    pub fn drain(&self) -> Drain {
        if self.terminate.load(Ordering::SeqCst) {
            return Drain::Terminate;
        }
        Drain::Continue(Pending {
            reload: self.reload.swap(false, Ordering::SeqCst),
            dump: self.dump.swap(false, Ordering::SeqCst),
            alarm: self.alarm.swap(false, Ordering::SeqCst),
        })
    }

    pub fn request_terminate(&self) {
        self.terminate.store(true, Ordering::SeqCst);
    }

    pub fn request_reload(&self) {
        self.reload.store(true, Ordering::SeqCst);
    }

    pub fn request_dump(&self) {
        self.dump.store(true, Ordering::SeqCst);
    }

    pub fn request_alarm(&self) {
        self.alarm.store(true, Ordering::SeqCst);
    }

    pub fn reload_pending(&self) -> bool {
        self.reload.load(Ordering::SeqCst)
    }

    pub fn dump_pending(&self) -> bool {
        self.dump.load(Ordering::SeqCst)
    }

    /// Number of worker sessions spawned and not yet reaped.
    pub fn live_children(&self) -> usize {
        self.live_children.load(Ordering::SeqCst)
    }

    /// Count a newly spawned worker.
    pub(crate) fn child_spawned(&self) {
        self.live_children.fetch_add(1, Ordering::SeqCst);
    }

    fn child_reaped(&self) {
        // Saturate rather than wrap if an exit is ever reported twice.
        let _ = self
            .live_children
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }
}

/// Self-pipe between the signal handlers and the reactor.
#[derive(Debug)]
pub struct SignalPipe {
    pub reader: UnixStream,

    /// Write ends owned by the handlers. They must survive daemonizing.
    pub writer_fds: Vec<RawFd>,
}

/// Install signal handlers for the flag set.
///
/// Each signal first sets its flag, then writes a byte to the self-pipe so a
/// wait in progress returns.
///
/// # Arguments
/// * `flags` - The flags the handlers set.
///
/// # Returns
/// The self-pipe.
pub fn register(flags: &SignalFlags) -> io::Result<SignalPipe> {
    let (reader, writer) = UnixStream::pair()?;
    reader.set_nonblocking(true)?;
    writer.set_nonblocking(true)?;

    let table = [
        (SIGTERM, &flags.terminate),
        (SIGINT, &flags.terminate),
        (SIGHUP, &flags.reload),
        (SIGUSR1, &flags.dump),
        (SIGALRM, &flags.alarm),
    ];
    let mut writer_fds = Vec::with_capacity(table.len());
    for (signal, flag) in table {
        signal_hook::flag::register(signal, Arc::clone(flag))?;
        let end = writer.try_clone()?;
        writer_fds.push(end.as_raw_fd());
        signal_hook::low_level::pipe::register(signal, end)?;
    }

    Ok(SignalPipe { reader, writer_fds })
}

/// Empty the self-pipe after a wake-up.
pub fn drain_pipe(reader: &UnixStream) {
    let mut buf = [0u8; 64];
    let mut reader = reader;
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => debug!("signal pipe: {} wake-ups", n),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
}

/// Exit notice sent by a finished worker session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExit {
    /// Session identifier.
    pub id: u64,

    /// Whether the session was cut off by its deadline.
    pub timed_out: bool,
}

/// Sends the exit notice when a worker is dropped, however it ends.
#[derive(Debug)]
pub struct ExitGuard {
    pub(crate) id: u64,
    pub(crate) timed_out: bool,
    tx: mpsc::UnboundedSender<WorkerExit>,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        let _ = self.tx.send(WorkerExit {
            id: self.id,
            timed_out: self.timed_out,
        });
    }
}

/// Collects worker exits and keeps the live count authoritative.
#[derive(Debug)]
pub struct ChildReaper {
    tx: mpsc::UnboundedSender<WorkerExit>,
    rx: mpsc::UnboundedReceiver<WorkerExit>,
}

impl ChildReaper {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx }
    }

    /// Guard for a new worker.
    pub fn guard(&self, id: u64) -> ExitGuard {
        ExitGuard {
            id,
            timed_out: false,
            tx: self.tx.clone(),
        }
    }

    /// Wait until at least one worker has exited.
    pub async fn exited(&mut self) -> Option<WorkerExit> {
        self.rx.recv().await
    }

    /// Account for `first`, then every other exit already queued.
    ///
    /// # Returns
    /// The number of workers reaped.
    pub fn reap(&mut self, flags: &SignalFlags, first: Option<WorkerExit>) -> usize {
        let mut reaped = 0;
        let queued = std::iter::from_fn(|| self.rx.try_recv().ok());
        for exit in first.into_iter().chain(queued) {
            if exit.timed_out {
                debug!("TCP session {} killed at its deadline", exit.id);
            }
            flags.child_reaped();
            reaped += 1;
        }
        reaped
    }
}

impl Default for ChildReaper {
    fn default() -> Self {
        Self::new()
    }
}
