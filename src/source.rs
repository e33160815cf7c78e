//! The watch-source boundary between the engine and the kernel.
//!
//! The engine never touches inotify directly; it talks to a [`WatchSource`]
//! trait object. The production implementation is
//! [`InotifySource`](crate::InotifySource); tests inject a fake that
//! records watch operations and lets them feed synthetic events through
//! [`Monitor::handle_event`](crate::Monitor::handle_event).

use std::io;
use std::os::unix::io::RawFd;

use thiserror::Error;

/// Path prefixes that can never be watched.
///
/// These pseudo-filesystems churn constantly and inotify either refuses
/// them or floods the queue; watch attempts below them fail with
/// [`WatchError::ForbiddenPath`] before reaching the kernel.
pub const FORBIDDEN_PREFIXES: [&str; 3] = ["/proc", "/sys", "/dev/pts"];

/// The procfs entry holding the per-user inotify watch limit.
pub const MAX_USER_WATCHES_FILE: &str = "/proc/sys/fs/inotify/max_user_watches";

/// The kind of change a single event reports.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum FileAction {
    /// An entry appeared (`IN_CREATE`).
    #[default]
    Create,
    /// An entry disappeared (`IN_DELETE`).
    Delete,
    /// A file opened for writing was closed (`IN_CLOSE_WRITE`).
    Modify,
    /// Metadata changed (`IN_ATTRIB`).
    Attrib,
    /// An entry was renamed away (`IN_MOVED_FROM`).
    RenameFrom,
    /// An entry was renamed in (`IN_MOVED_TO`).
    RenameTo,
}

/// One event as delivered by a watch source.
#[derive(Clone, Debug)]
pub struct SourceEvent {
    /// The tag given to [`WatchSource::add_path`] for the directory the
    /// event originates from.
    pub tag: i32,
    /// The affected child entry, or empty when the event concerns the
    /// watched directory itself.
    pub name: String,
    /// Whether `name` is a directory.
    pub is_dir: bool,
    /// What happened.
    pub action: FileAction,
    /// Pairs `RenameFrom` with its `RenameTo`; 0 otherwise.
    pub rename_cookie: u32,
    /// Set when the kernel dropped events; all other fields are
    /// meaningless then.
    pub overflow: bool,
}

impl Default for SourceEvent {
    fn default() -> SourceEvent {
        SourceEvent {
            tag: -1,
            name: String::new(),
            is_dir: false,
            action: FileAction::Create,
            rename_cookie: 0,
            overflow: false,
        }
    }
}

/// A watch operation failed.
#[derive(Debug, Error)]
pub enum WatchError {
    /// The path lies under one of the [`FORBIDDEN_PREFIXES`].
    #[error("path is on an unwatchable filesystem")]
    ForbiddenPath,
    /// No registry entry for the given slot or tag.
    #[error("no watch registered for the given tag")]
    NotFound,
    /// The underlying system call failed with this errno.
    #[error("{}", io::Error::from_raw_os_error(*.0))]
    Os(i32),
}

impl WatchError {
    /// The raw errno, if the error came from the kernel.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            WatchError::Os(errno) => Some(*errno),
            _ => None,
        }
    }
}

/// An injectable inotify-like watch registry.
///
/// Implementations own the kernel interface (or pretend to). `slot` values
/// are stable indices returned from [`add_path`](WatchSource::add_path);
/// passing `-1` where a slot is expected makes the source look the entry up
/// by tag instead.
pub trait WatchSource {
    /// The forbidden path prefixes of this source.
    ///
    /// Exposed so the engine can pre-mark zones whose base is an ancestor
    /// of an unwatchable path.
    fn invalid_paths(&self) -> Vec<String>;

    /// Starts watching a directory, associating it with `tag`.
    ///
    /// `tag` identifies the directory in delivered [`SourceEvent`]s and
    /// should be unique per directory. Returns the slot index of the new
    /// registry entry.
    fn add_path(&mut self, path: &str, tag: i32) -> Result<i32, WatchError>;

    /// Stops watching the directory registered under `slot` (or `tag`, if
    /// `slot` is `-1`).
    fn remove_path(&mut self, slot: i32, tag: i32) -> Result<(), WatchError>;

    /// Re-labels an existing watch from one tag to another.
    ///
    /// The kernel watch itself is untouched: it tracks an inode, and a
    /// rename does not change the inode. Only the tag that connects the
    /// descriptor back to the caller's bookkeeping is swapped.
    fn rename_path(&mut self, slot: i32, from_tag: i32, to_tag: i32) -> Result<(), WatchError>;

    /// Removes every watch and empties the registry.
    fn clear_all(&mut self) -> Result<(), WatchError>;

    /// Appends all pending events to `out`.
    fn drain(&mut self, out: &mut Vec<SourceEvent>) -> io::Result<()>;

    /// The pollable file descriptor behind this source, if any.
    fn raw_fd(&self) -> Option<RawFd> {
        None
    }
}

/// Reads the system-wide per-user watch limit, if procfs allows it.
pub fn system_max_user_watches() -> Option<i64> {
    crate::paths::read_trimmed(MAX_USER_WATCHES_FILE)
        .ok()?
        .parse()
        .ok()
}

/// Whether a path starts with any of the given prefixes.
pub(crate) fn starts_with_any(path: &str, prefixes: &[String]) -> bool {
    prefixes.iter().any(|p| path.starts_with(p.as_str()))
}
