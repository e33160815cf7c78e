//! Shared test support: a fake watch source and a scratch file tree.

use std::cell::RefCell;
use std::fs;
use std::io;
use std::rc::Rc;

use tempfile::TempDir;
use zonewatch::{Monitor, SourceEvent, WatchError, WatchSource};

/// The recorded state of a [`FakeSource`], shared with the test.
#[derive(Default)]
pub struct FakeRegistry {
    /// Slot index -> tag; `-1` marks a freed slot.
    pub tags: Vec<i32>,
    pub free_slots: Vec<i32>,
    /// What `invalid_paths()` reports; set before building the monitor.
    pub invalid_paths: Vec<String>,
    /// Every `add_path` call as `(path, tag)`, in order.
    pub added: Vec<(String, i32)>,
    /// Number of `clear_all` calls.
    pub cleared: u32,
}

impl FakeRegistry {
    /// The tags currently holding a watch, in slot order.
    pub fn watched_tags(&self) -> Vec<i32> {
        self.tags.iter().copied().filter(|&t| t >= 0).collect()
    }

    fn slot_for(&self, slot: i32, tag: i32) -> Result<usize, WatchError> {
        if slot < 0 {
            return self
                .tags
                .iter()
                .position(|&t| t == tag)
                .ok_or(WatchError::NotFound);
        }
        let idx = slot as usize;
        match self.tags.get(idx) {
            Some(&t) if t == tag => Ok(idx),
            _ => Err(WatchError::NotFound),
        }
    }
}

/// A watch source that never touches the kernel.
///
/// Keeps the same slot-slab bookkeeping as the real source, so the engine
/// cannot tell the difference, and shares its state with the test through
/// an `Rc` so assertions can inspect the watch set afterwards. Events are
/// not queued here; tests feed them directly to `Monitor::handle_event`.
pub struct FakeSource {
    state: Rc<RefCell<FakeRegistry>>,
}

impl FakeSource {
    pub fn new() -> (FakeSource, Rc<RefCell<FakeRegistry>>) {
        let state = Rc::new(RefCell::new(FakeRegistry::default()));
        (
            FakeSource {
                state: Rc::clone(&state),
            },
            state,
        )
    }
}

impl WatchSource for FakeSource {
    fn invalid_paths(&self) -> Vec<String> {
        self.state.borrow().invalid_paths.clone()
    }

    fn add_path(&mut self, path: &str, tag: i32) -> Result<i32, WatchError> {
        let mut state = self.state.borrow_mut();
        assert!(path.starts_with('/'));
        if state
            .invalid_paths
            .iter()
            .any(|p| path.starts_with(p.as_str()))
        {
            return Err(WatchError::ForbiddenPath);
        }
        // The real source passes ONLYDIR; mimic the kernel's answer for
        // anything that is not an existing directory.
        if !std::path::Path::new(path).is_dir() {
            return Err(WatchError::Os(libc::ENOENT));
        }
        state.added.push((path.to_string(), tag));
        let slot = match state.free_slots.pop() {
            Some(slot) => {
                state.tags[slot as usize] = tag;
                slot
            }
            None => {
                state.tags.push(tag);
                (state.tags.len() - 1) as i32
            }
        };
        Ok(slot)
    }

    fn remove_path(&mut self, slot: i32, tag: i32) -> Result<(), WatchError> {
        let mut state = self.state.borrow_mut();
        let idx = state.slot_for(slot, tag)?;
        state.tags[idx] = -1;
        state.free_slots.push(idx as i32);
        Ok(())
    }

    fn rename_path(&mut self, slot: i32, from_tag: i32, to_tag: i32) -> Result<(), WatchError> {
        let mut state = self.state.borrow_mut();
        let idx = state.slot_for(slot, from_tag)?;
        state.tags[idx] = to_tag;
        Ok(())
    }

    fn clear_all(&mut self) -> Result<(), WatchError> {
        let mut state = self.state.borrow_mut();
        state.tags.clear();
        state.free_slots.clear();
        state.cleared += 1;
        Ok(())
    }

    fn drain(&mut self, _out: &mut Vec<SourceEvent>) -> io::Result<()> {
        Ok(())
    }
}

/// A scratch directory tree for a single test.
pub struct TreeFixture {
    _dir: TempDir,
    base: String,
}

impl TreeFixture {
    pub fn new() -> TreeFixture {
        let dir = TempDir::new().unwrap();
        let base = fs::canonicalize(dir.path())
            .unwrap()
            .to_string_lossy()
            .into_owned();
        TreeFixture { _dir: dir, base }
    }

    /// The canonical absolute base path.
    pub fn base(&self) -> &str {
        &self.base
    }

    /// Absolute path for a relative one inside the tree.
    pub fn path(&self, rel: &str) -> String {
        format!("{}/{rel}", self.base)
    }

    /// Creates (or rewrites) a file, creating parent directories as
    /// needed.
    pub fn create_file(&self, rel: &str) {
        let path = self.path(rel);
        if let Some(pos) = path.rfind('/') {
            fs::create_dir_all(&path[..pos]).unwrap();
        }
        fs::write(&path, b"zonewatch test data\n").unwrap();
    }

    pub fn remove_file(&self, rel: &str) {
        fs::remove_file(self.path(rel)).unwrap();
    }

    pub fn create_dir(&self, rel: &str) {
        fs::create_dir_all(self.path(rel)).unwrap();
    }

    /// Removes a single (empty) directory.
    pub fn remove_dir(&self, rel: &str) {
        fs::remove_dir(self.path(rel)).unwrap();
    }

    pub fn rename(&self, rel_from: &str, rel_to: &str) {
        fs::rename(self.path(rel_from), self.path(rel_to)).unwrap();
    }
}

/// Node index of a path within the monitor's forest.
pub fn dir_idx(monitor: &Monitor, path: &str) -> i32 {
    monitor
        .dirs()
        .iter()
        .position(|d| d.path() == path)
        .map_or(-1, |idx| idx as i32)
}

/// Shorthand for a child event on the directory node `tag`.
pub fn event(tag: i32, name: &str, is_dir: bool, action: zonewatch::FileAction) -> SourceEvent {
    SourceEvent {
        tag,
        name: name.to_string(),
        is_dir,
        action,
        ..SourceEvent::default()
    }
}

/// Same as [`event`] with a rename cookie attached.
pub fn rename_event(
    tag: i32,
    name: &str,
    is_dir: bool,
    action: zonewatch::FileAction,
    cookie: u32,
) -> SourceEvent {
    SourceEvent {
        rename_cookie: cookie,
        ..event(tag, name, is_dir, action)
    }
}
