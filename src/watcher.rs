//! Polling for file changes caused by a trigger command.

use crate::error::Interrupt;
use crate::schema::CommandLine;
use crate::session::Session;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant, SystemTime};
use tracing::debug;

/// Metadata that identifies one version of a file.
///
/// Content is not compared: a rewrite with identical bytes but a new
/// timestamp is a change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStamp {
    modified: Option<SystemTime>,
    changed: (i64, i64),
    len: u64,
    inode: u64,
    device: u64,
}

/// Stamp a file, `None` if it does not exist.
pub fn stamp(path: &Path) -> Option<FileStamp> {
    let meta = std::fs::metadata(path).ok()?;
    Some(FileStamp {
        modified: meta.modified().ok(),
        changed: (meta.ctime(), meta.ctime_nsec()),
        len: meta.len(),
        inode: meta.ino(),
        device: meta.dev(),
    })
}

/// Call `check` every `interval` until it returns true or `timeout` elapses.
///
/// The check always runs at least once. A timeout too large to represent as
/// an instant never elapses.
pub fn poll_until(
    interval: Duration,
    timeout: Duration,
    mut check: impl FnMut() -> Result<bool, Interrupt>,
) -> Result<bool, Interrupt> {
    let deadline = Instant::now().checked_add(timeout);
    loop {
        if check()? {
            return Ok(true);
        }
        let now = Instant::now();
        let pause = match deadline {
            Some(deadline) if now >= deadline => return Ok(false),
            Some(deadline) => interval.min(deadline - now),
            None => interval,
        };
        thread::sleep(pause);
    }
}

impl Session {
    /// Run `trigger` and wait for `file`'s metadata to change.
    ///
    /// Creation and deletion count as changes. Returns false once `timeout`
    /// elapses with the file unchanged.
    pub fn wait_for_change(
        &mut self,
        trigger: &CommandLine,
        file: impl AsRef<Path>,
        interval: Duration,
        timeout: Duration,
    ) -> Result<bool, Interrupt> {
        let path = self.resolve(file);
        let before = stamp(&path);
        self.execute(trigger)?;

        let changed = poll_until(interval, timeout, || Ok(stamp(&path) != before))?;
        debug!(file = %path.display(), changed, "finished watching");
        Ok(changed)
    }
}
