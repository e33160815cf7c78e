//! Initial construction of the watched-directory forest.

use std::fs;

use log::{debug, warn};

use crate::node::{ChildEntry, WatchedDir};
use crate::paths;
use crate::source::WatchError;

use super::{Monitor, MonitorError};

impl Monitor {
    pub(crate) fn internal_calc(&mut self) -> Result<(), MonitorError> {
        self.dirs.clear();
        self.root_idx = -1;

        // Order possibly overlapping zones by increasing depth; sorting by
        // path does exactly that, and the reverse loops below then visit
        // the deepest base first so it claims ownership of shared nodes.
        self.zones.sort_by(|a, b| a.path.cmp(&b.path));

        // Every zone base needs its ancestors represented up to `/`.
        for zone_idx in (0..self.zones.len()).rev() {
            let base = self.zones[zone_idx].path.clone();
            self.fill_gaps(-1, &base)?;
        }

        // Same for the parent of every watched file; the file name is
        // pinned so the parent's filters cannot hide it.
        for file_idx in 0..self.files.len() {
            let file_path = self.files[file_idx].clone();
            let parent_path = paths::parent_dir(&file_path).unwrap_or("/").to_string();
            let file_name = paths::file_name(&file_path).to_string();
            let parent_idx = self.fill_gaps(-1, &parent_path)?;
            paths::push_unique(
                &mut self.dirs[parent_idx as usize].pinned_files,
                file_name,
            );
        }

        // Descend into the zones and pick up every existing directory.
        for zone_idx in (0..self.zones.len()).rev() {
            let base = self.zones[zone_idx].path.clone();
            let base_idx = self.find_dir(&base);
            self.scan_zone_dirs(base_idx)?;
        }

        if self.dirs.is_empty() {
            self.fill_gaps(-1, "/")?;
        }
        self.root_idx = self.find_dir("/");
        debug_assert!(self.root_idx >= 0);
        Ok(())
    }

    /// Ensures a node for `path` and for every ancestor up to `/`.
    ///
    /// Idempotent: an already known path only gains the child link. When
    /// `child_idx` is valid, the child's name is pinned on this node so
    /// the chain towards a deeper zone base survives any filters.
    /// Ancestors are created (and, mid-session, watched) before the node
    /// itself, keeping the ancestor-chain invariant.
    pub(crate) fn fill_gaps(&mut self, child_idx: i32, path: &str) -> Result<i32, MonitorError> {
        let mut dir_idx = self.find_dir(path);
        let already_defined = dir_idx >= 0;
        if !already_defined {
            if self.dirs.len() >= self.max_dirs {
                return Err(MonitorError::TooManyDirs(self.max_dirs));
            }
            dir_idx = self.dirs.len() as i32;
            self.dirs.push(WatchedDir::new(path.to_string()));
        }

        if child_idx >= 0 {
            let child_name = self.dirs[child_idx as usize]
                .name()
                .unwrap_or_default()
                .to_string();
            let dir = &mut self.dirs[dir_idx as usize];
            paths::push_unique(&mut dir.pinned_subdirs, child_name);
            paths::push_unique(&mut dir.subdir_idxs, child_idx);
            let child = &mut self.dirs[child_idx as usize];
            if child.parent < 0 {
                child.parent = dir_idx;
            }
        }
        if already_defined {
            return Ok(dir_idx);
        }

        let info = paths::path_info(path);
        let exists_as_dir = info.exists && info.is_dir;
        let (owner_zone, depth, max_depth) = self.owner_zone_for(path);
        let (pinned_subdirs, pinned_files) = self.collect_pinned(path);
        {
            let dir = &mut self.dirs[dir_idx as usize];
            dir.exists = exists_as_dir;
            dir.owner_zone = owner_zone;
            dir.depth = depth;
            dir.max_depth = max_depth;
            for name in pinned_subdirs {
                paths::push_unique(&mut dir.pinned_subdirs, name);
            }
            for name in pinned_files {
                paths::push_unique(&mut dir.pinned_files, name);
            }
        }

        if path != "/" {
            let parent_path = paths::parent_dir(path).unwrap_or("/").to_string();
            self.fill_gaps(dir_idx, &parent_path)?;
        }

        if self.is_watching() {
            self.install_watch(dir_idx)?;
            if exists_as_dir && self.dirs[dir_idx as usize].is_watched() {
                self.capture_existing(dir_idx);
            }
        }
        Ok(dir_idx)
    }

    /// Appends a node for an existing directory discovered mid-walk.
    ///
    /// The caller wires up the parent link; owner zone and pinned names
    /// are derived here.
    pub(crate) fn add_existing_dir(&mut self, path: &str) -> Result<i32, MonitorError> {
        if self.dirs.len() >= self.max_dirs {
            return Err(MonitorError::TooManyDirs(self.max_dirs));
        }
        let dir_idx = self.dirs.len() as i32;
        let mut dir = WatchedDir::new(path.to_string());
        dir.exists = true;
        let (owner_zone, depth, max_depth) = self.owner_zone_for(path);
        dir.owner_zone = owner_zone;
        dir.depth = depth;
        dir.max_depth = max_depth;
        let (pinned_subdirs, pinned_files) = self.collect_pinned(path);
        dir.pinned_subdirs = pinned_subdirs;
        dir.pinned_files = pinned_files;
        self.dirs.push(dir);
        Ok(dir_idx)
    }

    /// Recursively creates nodes for the existing directories of a zone.
    pub(crate) fn scan_zone_dirs(&mut self, parent_idx: i32) -> Result<(), MonitorError> {
        debug_assert!(parent_idx >= 0);
        if parent_idx < 0 {
            return Ok(());
        }
        let (parent_path, parent_owner) = {
            let parent = &self.dirs[parent_idx as usize];
            if parent.is_leaf() {
                return Ok(());
            }
            (parent.path.clone(), parent.owner_zone)
        };
        let running = self.is_watching();
        let entries = match fs::read_dir(&parent_path) {
            Ok(entries) => entries,
            // Typically permission denied; the directory simply stays
            // shallow in the model.
            Err(err) => {
                debug!("cannot enumerate {parent_path}: {err}");
                return Ok(());
            }
        };
        for entry in entries.flatten() {
            let child_name = entry.file_name().to_string_lossy().into_owned();
            let child_path = paths::join(&parent_path, &child_name);
            let info = paths::path_info(&child_path);
            if !(info.exists && info.is_dir) {
                continue;
            }
            let filtered = {
                let parent = &self.dirs[parent_idx as usize];
                self.is_filtered_out(parent, &child_name, &child_path, true)
            };
            if filtered {
                continue;
            }
            let mut child_idx = self.find_child_dir(parent_idx, &child_path);
            if child_idx >= 0 {
                if self.dirs[child_idx as usize].owner_zone != parent_owner {
                    // Base of a deeper zone; that zone's own pass descends
                    // into it.
                    continue;
                }
            } else {
                child_idx = self.add_existing_dir(&child_path)?;
                self.dirs[child_idx as usize].parent = parent_idx;
                paths::push_unique(
                    &mut self.dirs[parent_idx as usize].subdir_idxs,
                    child_idx,
                );
            }
            if running
                && self.dirs[child_idx as usize].exists
                && !self.dirs[child_idx as usize].is_watched()
            {
                self.install_watch(child_idx)?;
                if !self.dirs[child_idx as usize].is_watched() {
                    continue;
                }
                self.capture_existing(child_idx);
            }
            self.scan_zone_dirs(child_idx)?;
        }
        Ok(())
    }

    /// Installs a kernel watch on a node.
    ///
    /// Exhaustion errors (user watch limit, kernel memory, overlong path)
    /// are fatal; everything else leaves the node in the model unwatched.
    pub(crate) fn install_watch(&mut self, dir_idx: i32) -> Result<(), MonitorError> {
        let path = self.dirs[dir_idx as usize].path.clone();
        match self.source_mut().add_path(&path, dir_idx) {
            Ok(slot) => {
                self.dirs[dir_idx as usize].watch_slot = slot;
                Ok(())
            }
            Err(WatchError::Os(errno)) => match errno {
                libc::ENOSPC => Err(MonitorError::WatchLimit),
                libc::ENOMEM | libc::ENAMETOOLONG => Err(MonitorError::Os(errno)),
                _ => {
                    // Typically EACCES or a directory gone again already.
                    debug!("cannot watch {path}: errno {errno}");
                    Ok(())
                }
            },
            Err(err) => {
                warn!("cannot watch {path}: {err}");
                Ok(())
            }
        }
    }

    /// Snapshots the children of a freshly watched directory.
    ///
    /// Runs after the watch installation on purpose: a racing change then
    /// produces an extra event instead of a lost one.
    pub(crate) fn capture_existing(&mut self, dir_idx: i32) {
        let path = self.dirs[dir_idx as usize].path.clone();
        let entries = match fs::read_dir(&path) {
            Ok(entries) => entries,
            Err(_) => return,
        };
        let mut found = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            let info = paths::path_info(entry.path());
            if !info.exists {
                continue;
            }
            found.push(ChildEntry::new(name, info.is_dir));
        }
        self.dirs[dir_idx as usize].existing.extend(found);
    }
}
