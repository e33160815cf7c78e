//! The reconciliation engine.

mod events;
mod rename;
mod setup;

use std::io;
use std::time::Instant;

use log::error;
use thiserror::Error;

use crate::filter::any_match;
use crate::node::WatchedDir;
use crate::paths;
use crate::result::{ActionData, ResultKind, WatchedResult};
use crate::source::{
    starts_with_any, system_max_user_watches, FileAction, WatchSource, MAX_USER_WATCHES_FILE,
};
use crate::zone::DirectoryZone;

/// How long a `RenameFrom` may wait for its `RenameTo` before the sweeper
/// concludes the entry moved out of the watched area.
pub const OPEN_MOVE_TIMEOUT_USEC: i64 = 200;

/// The cadence at which a host should call
/// [`Monitor::check_open_moves`].
pub const SWEEP_INTERVAL_MSEC: u64 = 1;

/// An unrecoverable mid-session failure.
///
/// Routed to the abort handler; the host is expected to call
/// [`Monitor::stop`] and may still use the partial results.
#[derive(Debug, Error)]
pub(crate) enum MonitorError {
    #[error("Reached limit of {0} tracked directories")]
    TooManyDirs(usize),
    #[error("Reached limit of {0} recorded results")]
    TooManyResults(usize),
    #[error("{}", watch_limit_message())]
    WatchLimit,
    #[error("{}", io::Error::from_raw_os_error(*.0))]
    Os(i32),
}

fn watch_limit_message() -> String {
    let max = system_max_user_watches();
    let shown = max.map_or_else(|| "unknown".to_string(), |m| m.to_string());
    let suggested = max.map_or(65536, |m| (m + 25000).max(65536));
    format!(
        "Maximum number of inotify watches reached ({shown})\n\
         Consider increasing the value in file '{MAX_USER_WATCHES_FILE}'\n\
         Example: sudo sh -c 'echo {suggested} >{MAX_USER_WATCHES_FILE}'"
    )
}

/// A pending `RenameFrom` awaiting its `RenameTo` partner.
#[derive(Debug)]
pub(crate) struct OpenMove {
    /// Node index of the directory the entry was renamed out of.
    pub(crate) parent_idx: i32,
    /// Node index of the renamed directory itself; `-1` for files and
    /// filtered-out directories.
    pub(crate) dir_idx: i32,
    pub(crate) is_dir: bool,
    pub(crate) name: String,
    pub(crate) path: String,
    pub(crate) cookie: u32,
    pub(crate) from_time_usec: i64,
    pub(crate) filtered_out: bool,
}

/// The filesystem-zone monitor.
///
/// Owns the declared zones and file watches, the forest of
/// [`WatchedDir`] nodes, the [`WatchedResult`] ledger, and the injected
/// [`WatchSource`]. All state lives on one thread; every callback runs to
/// completion before the next event is processed.
///
/// Typical life cycle: declare zones and files, optionally inspect the
/// forest via [`calc_to_watch_directories`](Monitor::calc_to_watch_directories),
/// then [`start`](Monitor::start), feed events (via
/// [`pump`](Monitor::pump) or a driver), and [`stop`](Monitor::stop).
pub struct Monitor {
    source: Box<dyn WatchSource>,
    invalid_paths: Vec<String>,
    zones: Vec<DirectoryZone>,
    files: Vec<String>,

    dirs: Vec<WatchedDir>,
    root_idx: i32,
    results: Vec<WatchedResult>,
    root_result_idx: i32,
    open_moves: Vec<OpenMove>,

    max_dirs: usize,
    max_results: usize,
    is_root_user: bool,

    event_counter: i64,
    clock: Instant,
    start_usec: i64,
    stop_usec: i64,
    overflow: bool,
    inconsistencies: bool,

    on_result: Option<Box<dyn FnMut(&WatchedResult)>>,
    on_abort: Option<Box<dyn FnMut(&str)>>,
}

impl Monitor {
    /// Creates a monitor over an injected watch source.
    ///
    /// `max_dirs` and `max_results` cap the node and result arenas;
    /// exceeding either aborts the session. `is_root_user` disables the
    /// attribute-visibility heuristic, since root sees everything anyway.
    pub fn new(
        source: Box<dyn WatchSource>,
        max_dirs: usize,
        max_results: usize,
        is_root_user: bool,
    ) -> Monitor {
        assert!(max_dirs > 0);
        assert!(max_results > 0);
        let invalid_paths = source.invalid_paths();
        Monitor {
            source,
            invalid_paths,
            zones: Vec::new(),
            files: Vec::new(),
            dirs: Vec::new(),
            root_idx: -1,
            results: Vec::new(),
            root_result_idx: -1,
            open_moves: Vec::new(),
            max_dirs,
            max_results,
            is_root_user,
            event_counter: 0,
            clock: Instant::now(),
            start_usec: -1,
            stop_usec: -1,
            overflow: false,
            inconsistencies: false,
            on_result: None,
            on_abort: None,
        }
    }

    /// Creates a monitor over a fresh inotify instance.
    pub fn with_inotify(max_dirs: usize, max_results: usize) -> io::Result<Monitor> {
        let source = crate::inotify::InotifySource::new()?;
        let is_root = unsafe { libc::geteuid() } == 0;
        Ok(Monitor::new(Box::new(source), max_dirs, max_results, is_root))
    }

    /// Attaches the observer called whenever a result's state advances.
    pub fn set_result_handler(&mut self, handler: impl FnMut(&WatchedResult) + 'static) {
        self.on_result = Some(Box::new(handler));
    }

    /// Attaches the observer called on fatal failures.
    ///
    /// The handler receives a human-readable reason and should arrange for
    /// [`stop`](Monitor::stop) to be called; partial results remain
    /// available.
    pub fn set_abort_handler(&mut self, handler: impl FnMut(&str) + 'static) {
        self.on_abort = Some(Box::new(handler));
    }

    // ---- declarative API ---------------------------------------------------

    /// Declares a directory zone.
    ///
    /// The base path is normalized and its existing prefix resolved through
    /// the filesystem; it does not have to exist. Fails when the path is
    /// relative, contains dot segments after cleanup, duplicates another
    /// zone's base, lies under an unwatchable prefix, a pinned name
    /// contains `/`, or a filter pattern does not compile.
    pub fn add_zone(&mut self, mut zone: DirectoryZone) -> Result<(), String> {
        if self.is_watching() {
            return Err("Cannot change zones while watching".to_string());
        }
        if zone.max_depth < 0 {
            return Err("Zone max depth cannot be negative".to_string());
        }
        zone.compile_filters()?;
        zone.path = paths::cleanup_path(&zone.path);
        if !zone.path.starts_with('/') {
            return Err(format!("Base path must be absolute: {}", zone.path));
        }
        zone.path = paths::resolve_existing_prefix(&zone.path)?;
        if zone.path.contains("/./") || zone.path.ends_with("/.") {
            return Err(format!("Base path contains '/./': {}", zone.path));
        }
        if zone.path.contains("/../") || zone.path.ends_with("/..") {
            return Err(format!("Base path contains '/../': {}", zone.path));
        }
        if self.find_zone(&zone.path) >= 0 {
            return Err(format!("Base path already defined: {}", zone.path));
        }
        for invalid in &self.invalid_paths {
            if zone.path.starts_with(invalid.as_str()) {
                return Err(format!("Base path is an unwatchable directory: {}", zone.path));
            }
            if invalid.starts_with(zone.path.as_str()) {
                // The base is an ancestor of an unwatchable path.
                zone.might_have_invalid_descendants = true;
            }
        }
        for pinned in zone.pinned_files.iter().chain(zone.pinned_subdirs.iter()) {
            if pinned.contains('/') {
                return Err(format!("Pinned name can't contain a '/': {pinned}"));
            }
        }
        self.zones.push(zone);
        Ok(())
    }

    /// Removes the zone with the given base path.
    pub fn remove_zone(&mut self, path: &str) -> Result<(), String> {
        if self.is_watching() {
            return Err("Cannot change zones while watching".to_string());
        }
        let idx = self.find_zone(path);
        if idx < 0 {
            return Err(format!("Path not defined: {path}"));
        }
        self.zones.remove(idx as usize);
        Ok(())
    }

    /// The declared zones, in declaration order until the first
    /// setup sorts them by base path.
    pub fn zones(&self) -> &[DirectoryZone] {
        &self.zones
    }

    /// Whether a zone with this base path is declared.
    pub fn has_zone(&self, path: &str) -> bool {
        self.find_zone(path) >= 0
    }

    /// Declares a single file to watch.
    ///
    /// The file does not have to exist and does not have to lie inside any
    /// zone; its parent directory is watched on its behalf.
    pub fn add_file(&mut self, path: &str) -> Result<(), String> {
        if self.is_watching() {
            return Err("Cannot change watched files while watching".to_string());
        }
        let path = paths::cleanup_path(path);
        if !path.starts_with('/') {
            return Err(format!("File path must be absolute: {path}"));
        }
        if path == "/" || path.ends_with("/.") || path.ends_with("/..") {
            return Err(format!("Not a file path: {path}"));
        }
        if self.files.iter().any(|f| *f == path) {
            return Err(format!("File already defined: {path}"));
        }
        self.files.push(path);
        Ok(())
    }

    /// Removes a declared file watch.
    pub fn remove_file(&mut self, path: &str) -> Result<(), String> {
        if self.is_watching() {
            return Err("Cannot change watched files while watching".to_string());
        }
        match self.files.iter().position(|f| f == path) {
            Some(idx) => {
                self.files.remove(idx);
                Ok(())
            }
            None => Err(format!("File not defined: {path}")),
        }
    }

    /// The declared file watches.
    pub fn files(&self) -> &[String] {
        &self.files
    }

    /// Whether this exact file path is declared.
    pub fn has_file(&self, path: &str) -> bool {
        self.files.iter().any(|f| f == path)
    }

    // ---- forest inspection -------------------------------------------------

    /// Builds the initial forest without starting a session.
    ///
    /// Creates a node for every directory from each zone base up to `/`,
    /// for the parents of declared files, and for every existing directory
    /// inside the zones. No watches are installed. Idempotent while no
    /// session runs; erases the forest of a previous run.
    pub fn calc_to_watch_directories(&mut self) -> Result<(), String> {
        if self.is_watching() {
            return Err("Cannot recalculate while watching".to_string());
        }
        self.internal_calc().map_err(|err| err.to_string())
    }

    /// The watched-directory forest. Populated by
    /// [`calc_to_watch_directories`](Monitor::calc_to_watch_directories)
    /// or [`start`](Monitor::start).
    pub fn dirs(&self) -> &[WatchedDir] {
        &self.dirs
    }

    /// Index of `/` within [`dirs`](Monitor::dirs), or `-1` before setup.
    pub fn root_dir_idx(&self) -> i32 {
        self.root_idx
    }

    /// The result ledger of the current (or last) session.
    pub fn results(&self) -> &[WatchedResult] {
        &self.results
    }

    // ---- session lifecycle -------------------------------------------------

    /// Starts watching. Resets all data of the previous run.
    pub fn start(&mut self) -> Result<(), String> {
        if self.is_watching() {
            return Err("Already watching".to_string());
        }
        self.event_counter = 1;
        if let Err(err) = self.internal_calc() {
            self.event_counter = 0;
            return Err(err.to_string());
        }
        self.start_usec = self.now_abs_usec();
        self.stop_usec = -1;
        self.root_result_idx = -1;
        self.results.clear();
        self.overflow = false;
        self.inconsistencies = false;
        debug_assert!(self.open_moves.is_empty());
        Ok(())
    }

    /// Stops watching and clears every kernel watch.
    pub fn stop(&mut self) {
        if !self.is_watching() {
            return;
        }
        self.stop_usec = self.now_abs_usec();
        self.open_moves.clear();
        self.event_counter = 0;
        if let Err(err) = self.source.clear_all() {
            error!("failed to clear watches: {err}");
        }
    }

    /// Microseconds between start and stop, or start and now while still
    /// watching. Zero before the first start.
    pub fn duration_usec(&self) -> i64 {
        if self.start_usec < 0 {
            0
        } else if self.stop_usec >= self.start_usec {
            self.stop_usec - self.start_usec
        } else {
            self.now_abs_usec() - self.start_usec
        }
    }

    /// Whether a session is running.
    pub fn is_watching(&self) -> bool {
        self.event_counter > 0
    }

    /// Whether any result was flagged inconsistent this session.
    pub fn has_inconsistencies(&self) -> bool {
        self.inconsistencies
    }

    /// Whether the kernel dropped events this session.
    pub fn has_queue_overflown(&self) -> bool {
        self.overflow
    }

    // ---- event intake ------------------------------------------------------

    /// Drains the watch source and reconciles every pending event.
    pub fn pump(&mut self) -> io::Result<()> {
        let mut events = Vec::new();
        self.source.drain(&mut events)?;
        for event in &events {
            self.handle_event(event);
        }
        Ok(())
    }

    /// The pollable descriptor of the underlying source, if it has one.
    pub fn source_raw_fd(&self) -> Option<std::os::unix::io::RawFd> {
        self.source.raw_fd()
    }

    // ---- internals shared by the engine submodules -------------------------

    pub(crate) fn now_abs_usec(&self) -> i64 {
        self.clock.elapsed().as_micros() as i64
    }

    pub(crate) fn now_rel_usec(&self) -> i64 {
        self.now_abs_usec() - self.start_usec
    }

    pub(crate) fn source_mut(&mut self) -> &mut dyn WatchSource {
        self.source.as_mut()
    }

    fn find_zone(&self, path: &str) -> i32 {
        self.zones
            .iter()
            .position(|z| z.path == path)
            .map_or(-1, |idx| idx as i32)
    }

    pub(crate) fn find_dir(&self, path: &str) -> i32 {
        self.dirs
            .iter()
            .position(|d| d.path == path)
            .map_or(-1, |idx| idx as i32)
    }

    /// Finds `path` among the known children of a node.
    pub(crate) fn find_child_dir(&self, parent_idx: i32, path: &str) -> i32 {
        let parent = &self.dirs[parent_idx as usize];
        for &child_idx in &parent.subdir_idxs {
            if self.dirs[child_idx as usize].path == path {
                return child_idx;
            }
        }
        -1
    }

    pub(crate) fn find_result_in(&self, dir_idx: i32, name: &str, is_dir: bool) -> i32 {
        let dir = &self.dirs[dir_idx as usize];
        for &result_idx in &dir.result_idxs {
            let result = &self.results[result_idx as usize];
            if result.name == name && result.is_dir == is_dir {
                return result_idx;
            }
        }
        -1
    }

    pub(crate) fn find_result_by_path(&self, parent_path: &str, name: &str, is_dir: bool) -> i32 {
        let dir_idx = self.find_dir(parent_path);
        if dir_idx < 0 {
            return -1;
        }
        self.find_result_in(dir_idx, name, is_dir)
    }

    pub(crate) fn find_root_result(&self) -> i32 {
        self.results
            .iter()
            .position(|r| r.parent_path == "/" && r.name.is_empty())
            .map_or(-1, |idx| idx as i32)
    }

    /// Determines the owning zone of a path.
    ///
    /// Zones are sorted by base path, so iterating from the back visits
    /// deeper bases first; the first zone whose area contains the path
    /// wins, which makes the closest base shadow every farther one.
    /// Returns `(zone_idx, depth, max_depth)` or `(-1, 0, 0)` for a gap
    /// filler.
    pub(crate) fn owner_zone_for(&self, path: &str) -> (i32, i32, i32) {
        for (zone_idx, zone) in self.zones.iter().enumerate().rev() {
            let depth = paths::depth_below(path, &zone.path, zone.max_depth);
            if depth >= 0 {
                return (zone_idx as i32, depth, zone.max_depth);
            }
        }
        (-1, 0, 0)
    }

    /// Collects the pinned names of every zone whose area covers `path`.
    pub(crate) fn collect_pinned(&self, path: &str) -> (Vec<String>, Vec<String>) {
        let mut subdirs = Vec::new();
        let mut files = Vec::new();
        for zone in &self.zones {
            if paths::depth_below(path, &zone.path, zone.max_depth) < 0 {
                continue;
            }
            for name in zone.pinned(true) {
                paths::push_unique(&mut subdirs, name.clone());
            }
            for name in zone.pinned(false) {
                paths::push_unique(&mut files, name.clone());
            }
        }
        (subdirs, files)
    }

    /// Whether an entry is hidden from this node by pinning, zone
    /// ownership, unwatchable prefixes, or the zone's filters.
    pub(crate) fn is_filtered_out(
        &self,
        dir: &WatchedDir,
        name: &str,
        path: &str,
        is_dir: bool,
    ) -> bool {
        debug_assert!(!name.is_empty());
        if dir.pinned(is_dir).iter().any(|p| p == name) {
            return false;
        }
        let Some(zone) = self
            .zones
            .get(usize::try_from(dir.owner_zone).unwrap_or(usize::MAX))
        else {
            // Gap filler: everything but the pinned chain is out.
            return true;
        };
        if zone.might_have_invalid_descendants && starts_with_any(path, &self.invalid_paths) {
            return true;
        }
        let (includes, excludes) = if is_dir {
            (&zone.subdir_include_filters, &zone.subdir_exclude_filters)
        } else {
            (&zone.file_include_filters, &zone.file_exclude_filters)
        };
        if !includes.is_empty() && !any_match(includes, name, path) {
            return true;
        }
        if any_match(excludes, name, path) {
            return true;
        }
        false
    }

    // ---- result plumbing ---------------------------------------------------

    /// Creates a result record keyed by `(parent, name, is_dir)`.
    ///
    /// Registers it with the parent node and tombstones a matching
    /// existing-entry, so the entry's at-start existence is consumed
    /// exactly once.
    pub(crate) fn add_result(
        &mut self,
        parent_idx: i32,
        parent_path: &str,
        name: &str,
        is_dir: bool,
    ) -> Result<i32, MonitorError> {
        if self.results.len() >= self.max_results {
            return Err(MonitorError::TooManyResults(self.max_results));
        }
        let result_idx = self.results.len() as i32;
        if !name.is_empty() && parent_idx >= 0 {
            let parent = &mut self.dirs[parent_idx as usize];
            parent.result_idxs.push(result_idx);
            if let Some(pos) = parent.find_existing(is_dir, name) {
                parent.existing[pos].removed = true;
            }
        }
        self.results.push(WatchedResult {
            parent_path: parent_path.to_string(),
            name: name.to_string(),
            is_dir,
            ..WatchedResult::default()
        });
        Ok(result_idx)
    }

    pub(crate) fn add_root_result(&mut self) -> Result<i32, MonitorError> {
        self.add_result(-1, "/", "", true)
    }

    pub(crate) fn set_inconsistent(&mut self, result_idx: i32) {
        self.results[result_idx as usize].inconsistent = true;
        self.inconsistencies = true;
    }

    /// Clears the immediate flag of the last recorded action.
    pub(crate) fn set_not_immediate(&mut self, result_idx: i32) {
        if let Some(action) = self.results[result_idx as usize].actions.last_mut() {
            action.immediate = false;
        }
    }

    /// Appends an action and returns its index within the result.
    pub(crate) fn push_action(
        &mut self,
        result_idx: i32,
        action: FileAction,
        time_usec: i64,
    ) -> usize {
        let actions = &mut self.results[result_idx as usize].actions;
        actions.push(ActionData {
            action,
            other_path: String::new(),
            immediate: false,
            caused_by_attrib: false,
            time_usec,
        });
        actions.len() - 1
    }

    pub(crate) fn last_action_mut(&mut self, result_idx: i32) -> &mut ActionData {
        self.results[result_idx as usize]
            .actions
            .last_mut()
            .expect("result has no actions")
    }

    /// Invokes the result observer.
    pub(crate) fn emit(&mut self, result_idx: i32) {
        if let Some(handler) = self.on_result.as_mut() {
            handler(&self.results[result_idx as usize]);
        }
    }

    /// Routes an unrecoverable failure to the abort observer.
    pub(crate) fn abort_with(&mut self, err: &MonitorError) {
        let message = err.to_string();
        error!("aborting session: {message}");
        if let Some(handler) = self.on_abort.as_mut() {
            handler(&message);
        }
    }

    pub(crate) fn result_kind(&self, result_idx: i32) -> ResultKind {
        self.results[result_idx as usize].kind
    }

    pub(crate) fn set_result_kind(&mut self, result_idx: i32, kind: ResultKind) {
        self.results[result_idx as usize].kind = kind;
    }
}
