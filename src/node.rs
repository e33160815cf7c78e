//! Nodes of the watched-directory forest.

/// A child entry captured by scanning a directory.
///
/// Entries are recorded when a watch is installed on an existing directory,
/// so later events can tell "existed before the session" from "appeared
/// during it". An entry is tombstoned instead of removed once a result has
/// been created for it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ChildEntry {
    /// The file or subdirectory name. Never empty.
    pub name: String,
    /// Whether the entry is a directory.
    pub is_dir: bool,
    pub(crate) removed: bool,
}

impl ChildEntry {
    pub(crate) fn new(name: impl Into<String>, is_dir: bool) -> ChildEntry {
        ChildEntry {
            name: name.into(),
            is_dir,
            removed: false,
        }
    }
}

/// A directory the engine tracks: existing or not, watched or not.
///
/// Nodes live in an append-only arena inside the engine and refer to each
/// other by index; indices stay valid for a whole session. A removed
/// directory keeps its node with `exists` cleared, preserving history for
/// inconsistency detection.
#[derive(Debug, Default)]
pub struct WatchedDir {
    pub(crate) path: String,
    pub(crate) name_pos: Option<usize>,
    pub(crate) owner_zone: i32,
    pub(crate) parent: i32,
    pub(crate) depth: i32,
    pub(crate) max_depth: i32,
    pub(crate) exists: bool,
    pub(crate) watch_slot: i32,
    pub(crate) pinned_subdirs: Vec<String>,
    pub(crate) pinned_files: Vec<String>,
    pub(crate) subdir_idxs: Vec<i32>,
    pub(crate) result_idxs: Vec<i32>,
    pub(crate) existing: Vec<ChildEntry>,
}

impl WatchedDir {
    pub(crate) fn new(path: String) -> WatchedDir {
        let name_pos = path.rfind('/').map(|pos| pos + 1);
        let name_pos = if path == "/" { None } else { name_pos };
        WatchedDir {
            path,
            name_pos,
            owner_zone: -1,
            parent: -1,
            watch_slot: -1,
            ..WatchedDir::default()
        }
    }

    /// The absolute path of the directory.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The name part of the path, or `None` for `/`.
    pub fn name(&self) -> Option<&str> {
        self.name_pos.map(|pos| &self.path[pos..])
    }

    /// Whether the directory currently exists.
    pub fn exists(&self) -> bool {
        self.exists
    }

    /// Whether the directory's contents have an installed kernel watch.
    pub fn is_watched(&self) -> bool {
        self.watch_slot >= 0
    }

    /// Whether the node sits at its zone's maximum depth.
    ///
    /// A leaf holds a watch but does not spawn nodes for subdirectories
    /// created beneath it.
    pub fn is_leaf(&self) -> bool {
        self.depth == self.max_depth
    }

    /// Index of the owning zone, or `-1` for a gap filler.
    pub fn owner_zone(&self) -> i32 {
        self.owner_zone
    }

    /// Index of the parent node, or `-1` for `/`.
    pub fn parent_idx(&self) -> i32 {
        self.parent
    }

    /// Depth of this node within its owner zone.
    pub fn depth(&self) -> i32 {
        self.depth
    }

    /// Indices of the known child nodes.
    pub fn subdir_idxs(&self) -> &[i32] {
        &self.subdir_idxs
    }

    /// Indices of the results recorded under this directory.
    pub fn result_idxs(&self) -> &[i32] {
        &self.result_idxs
    }

    /// Names pinned past the filters for this directory.
    pub fn pinned(&self, is_dir: bool) -> &[String] {
        if is_dir {
            &self.pinned_subdirs
        } else {
            &self.pinned_files
        }
    }

    /// The children found to pre-exist when the watch was installed.
    pub fn existing_entries(&self) -> &[ChildEntry] {
        &self.existing
    }

    /// Finds a live (non-tombstoned) existing entry.
    pub(crate) fn find_existing(&self, is_dir: bool, name: &str) -> Option<usize> {
        self.existing
            .iter()
            .position(|e| !e.removed && e.is_dir == is_dir && e.name == name)
    }
}
