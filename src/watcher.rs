//! Resolver-list file watcher.
//!
//! Stat-based: the newest readable file wins, and a rebuild is due only when
//! its modification time moves past the one the pool was last built from.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use log::warn;

/// Watch state of one resolver-list file.
#[derive(Debug, Clone)]
pub struct ResolvFile {
    pub path: PathBuf,

    /// Last seen modification time, unix seconds.
    pub mtime: u64,

    /// An unreadable warning has been logged and the file has not recovered.
    pub warned: bool,
}

/// Outcome of one poll.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Poll {
    /// File to rebuild the pool from, when a rebuild is due.
    pub rebuild: Option<PathBuf>,

    /// Number of warnings logged by this poll.
    pub warnings: usize,
}

#[derive(Debug)]
pub struct ResolvWatcher {
    files: Vec<ResolvFile>,
    resolv_changed: u64,
}

impl ResolvWatcher {
    pub fn new(paths: &[PathBuf]) -> Self {
        Self {
            files: paths
                .iter()
                .map(|path| ResolvFile {
                    path: path.clone(),
                    mtime: 0,
                    warned: false,
                })
                .collect(),
            resolv_changed: 0,
        }
    }

    pub fn files(&self) -> &[ResolvFile] {
        &self.files
    }

    /// Poll the files on disk.
    pub fn poll(&mut self) -> Poll {
        self.poll_with(mtime_secs)
    }

    /// Poll with an injected stat.
    ///
    /// # Arguments
    /// * `stat` - Returns the modification time of a path in unix seconds.
    ///
    /// # Returns
    /// The newest file when its mtime is later than the last rebuild.
    pub fn poll_with<F>(&mut self, mut stat: F) -> Poll
    where
        F: FnMut(&Path) -> io::Result<u64>,
    {
        let mut poll = Poll::default();
        let mut latest: Option<usize> = None;
        let mut last_change = 0;

        for (idx, file) in self.files.iter_mut().enumerate() {
            match stat(&file.path) {
                Ok(mtime) => {
                    file.warned = false;
                    file.mtime = mtime;
                    if mtime > last_change {
                        last_change = mtime;
                        latest = Some(idx);
                    }
                }
                Err(e) => {
                    if !file.warned {
                        warn!("failed to access {}: {}", file.path.display(), e);
                        poll.warnings += 1;
                    }
                    file.warned = true;
                }
            }
        }

        if let Some(idx) = latest {
            if last_change > self.resolv_changed {
                self.resolv_changed = last_change;
                poll.rebuild = Some(self.files[idx].path.clone());
            }
        }
        poll
    }
}

fn mtime_secs(path: &Path) -> io::Result<u64> {
    let modified = fs::metadata(path)?.modified()?;
    modified
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Once-per-second gate over unix seconds.
#[derive(Debug, Default, Clone, Copy)]
pub struct Debounce {
    last: Option<u64>,
}

impl Debounce {
    /// Whether maintenance may run at `now`. Records the run when it may.
    pub fn ready(&mut self, now: u64) -> bool {
        match self.last {
            Some(last) if now <= last => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}
