#![warn(missing_docs)]

//! Directory-zone filesystem monitoring for Linux
//!
//! # About
//!
//! zonewatch watches a declared portion of the filesystem — *directory
//! zones* (base path, maximum depth, include/exclude filters, pinned
//! names) plus individual file watches — and reports every create, delete,
//! modify, attribute and rename event inside it, in causal order. Next to
//! the live event stream it maintains a per-path state summary over the
//! whole session: was the entry created, deleted, modified, or merely
//! temporary, and can the record be trusted.
//!
//! The work happens in [`Monitor`], a reconciliation engine on top of the
//! kernel's inotify interface. It keeps a forest of [`WatchedDir`] nodes
//! in sync with the mutating filesystem: watches appear when directories
//! are created, transfer across renames so the kernel descriptor keeps
//! tracking the same inode, and directories are re-scanned for children
//! that appeared before the watch was in place.
//!
//! # Example
//!
//! ```no_run
//! use zonewatch::{DirectoryZone, Monitor};
//!
//! let mut monitor = Monitor::with_inotify(100_000, 100_000)
//!     .expect("failed to initialize inotify");
//!
//! let mut zone = DirectoryZone::new("/home/me/project", 5);
//! zone.subdir_exclude_filters.push(zonewatch::Filter::exact("target"));
//! monitor.add_zone(zone).expect("invalid zone");
//!
//! monitor.set_result_handler(|result| {
//!     println!("{:?} {}", result.kind, result.path());
//! });
//!
//! monitor.start().expect("failed to start watching");
//! // ... deliver events via zonewatch::driver::drive or Monitor::pump ...
//! monitor.stop();
//!
//! for result in monitor.results() {
//!     println!("{:?} {}{}", result.kind, result.path(),
//!         if result.inconsistent { " ?" } else { "" });
//! }
//! ```
//!
//! # Scheduling
//!
//! The engine is single-threaded and runs no loop of its own. A host
//! supplies two hooks: deliver pending events (poll the descriptor from
//! [`Monitor::source_raw_fd`] and call [`Monitor::pump`]) and call
//! [`Monitor::check_open_moves`] roughly every [`SWEEP_INTERVAL_MSEC`]
//! milliseconds so unpaired rename halves get concluded. With the `tokio`
//! feature enabled, [`driver::drive`] does both.
//!
//! Tests inject a fake [`WatchSource`] and feed events straight into
//! [`Monitor::handle_event`]; no loop is required at all.

mod engine;
mod filter;
mod inotify;
mod node;
mod paths;
mod result;
mod source;
mod zone;

#[cfg(feature = "tokio")]
pub mod driver;

pub use engine::{Monitor, OPEN_MOVE_TIMEOUT_USEC, SWEEP_INTERVAL_MSEC};
pub use filter::{Filter, FilterKind};
pub use inotify::InotifySource;
pub use node::{ChildEntry, WatchedDir};
pub use result::{ActionData, ResultKind, WatchedResult};
pub use source::{
    system_max_user_watches, FileAction, SourceEvent, WatchError, WatchSource,
    FORBIDDEN_PREFIXES, MAX_USER_WATCHES_FILE,
};
pub use zone::DirectoryZone;
