//! Pairing of rename events and the subtree walk they trigger.

use log::trace;

use crate::node::ChildEntry;
use crate::paths;
use crate::result::ResultKind;
use crate::source::FileAction;

use super::{Monitor, MonitorError, OpenMove, OPEN_MOVE_TIMEOUT_USEC};

/// One side of a rename.
///
/// `parent_idx >= 0` means the side lies inside the watched area and
/// results are recorded for it. The paths can still be set while
/// `parent_idx` is `-1`: a filtered-out side contributes its path as the
/// rename partner's `other_path` without producing results of its own.
/// A side with empty paths is unknown (the rename crossed the watch
/// boundary).
#[derive(Clone, Debug)]
pub(crate) struct MoveSide {
    pub(crate) parent_idx: i32,
    pub(crate) parent_path: String,
    pub(crate) name: String,
    pub(crate) path: String,
}

impl MoveSide {
    pub(crate) fn unknown() -> MoveSide {
        MoveSide {
            parent_idx: -1,
            parent_path: String::new(),
            name: String::new(),
            path: String::new(),
        }
    }

    pub(crate) fn is_watched(&self) -> bool {
        self.parent_idx >= 0
    }
}

impl Monitor {
    /// Buffers a `RenameFrom` until its partner (or the sweeper) picks it
    /// up. No result is emitted yet.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn on_rename_from(
        &mut self,
        parent_idx: i32,
        name: &str,
        child_path: &str,
        is_dir: bool,
        filtered_out: bool,
        cookie: u32,
        now: i64,
    ) -> Result<(), MonitorError> {
        let mut dir_idx = -1;
        let mut from_time_usec = now;
        if is_dir && !filtered_out {
            dir_idx = self.find_child_dir(parent_idx, child_path);
            if dir_idx < 0 && !self.dirs[parent_idx as usize].is_leaf() {
                // A rename out of a directory the model never saw: the
                // create event was missed or lost to a setup race. Track
                // it unwatched so the walk can still carry its subtree.
                dir_idx = self.add_existing_dir(child_path)?;
                self.dirs[dir_idx as usize].parent = parent_idx;
                paths::push_unique(
                    &mut self.dirs[parent_idx as usize].subdir_idxs,
                    dir_idx,
                );
            }
            // The lookup above may have taken a while; time the move from
            // here so the sweeper horizon starts fresh.
            from_time_usec = self.now_rel_usec();
        }
        self.open_moves.push(OpenMove {
            parent_idx,
            dir_idx,
            is_dir,
            name: name.to_string(),
            path: child_path.to_string(),
            cookie,
            from_time_usec,
            filtered_out,
        });
        Ok(())
    }

    /// Pairs a `RenameTo` with its buffered `RenameFrom`, or treats it as
    /// an arrival from outside the watched area.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn on_rename_to(
        &mut self,
        parent_idx: i32,
        parent_path: &str,
        name: &str,
        child_path: &str,
        is_dir: bool,
        filtered_out: bool,
        cookie: u32,
        now: i64,
    ) -> Result<(), MonitorError> {
        let found = self
            .open_moves
            .iter()
            .position(|m| m.cookie == cookie);
        match found {
            Some(pos) => {
                let mv = self.open_moves.swap_remove(pos);
                if filtered_out && mv.filtered_out {
                    return Ok(());
                }
                // Both subtrees are walked in parallel, transferring the
                // kernel watch by re-tagging so the inode keeps being
                // tracked across the rename. The destination zone may
                // have different depth and filters than the source.
                let from = MoveSide {
                    parent_idx: if mv.filtered_out { -1 } else { mv.parent_idx },
                    parent_path: self.dirs[mv.parent_idx as usize].path.clone(),
                    name: mv.name.clone(),
                    path: mv.path.clone(),
                };
                let to = MoveSide {
                    parent_idx: if filtered_out { -1 } else { parent_idx },
                    parent_path: parent_path.to_string(),
                    name: name.to_string(),
                    path: child_path.to_string(),
                };
                self.traverse_rename(&from, &to, is_dir, now)
            }
            None => {
                // The "from" side came from outside the watched area.
                if filtered_out {
                    return Ok(());
                }
                let to = MoveSide {
                    parent_idx,
                    parent_path: parent_path.to_string(),
                    name: name.to_string(),
                    path: child_path.to_string(),
                };
                self.traverse_rename(&MoveSide::unknown(), &to, is_dir, now)
            }
        }
    }

    /// Concludes open moves whose partner never arrived.
    ///
    /// Hosts call this roughly every
    /// [`SWEEP_INTERVAL_MSEC`](crate::SWEEP_INTERVAL_MSEC) between events.
    /// A `RenameFrom` older than [`OPEN_MOVE_TIMEOUT_USEC`] is a move out
    /// of the watched area and is traversed with an unknown destination.
    pub fn check_open_moves(&mut self) {
        if self.open_moves.is_empty() {
            return;
        }
        let now = self.now_rel_usec();
        let mut i = 0;
        while i < self.open_moves.len() {
            if now < self.open_moves[i].from_time_usec + OPEN_MOVE_TIMEOUT_USEC {
                i += 1;
                continue;
            }
            let mv = self.open_moves.remove(i);
            trace!(
                "open move expired: {} (cookie {}, node {})",
                mv.path,
                mv.cookie,
                mv.dir_idx
            );
            if mv.filtered_out {
                continue;
            }
            let from = MoveSide {
                parent_idx: mv.parent_idx,
                parent_path: self.dirs[mv.parent_idx as usize].path.clone(),
                name: mv.name,
                path: mv.path,
            };
            if let Err(err) = self.traverse_rename(&from, &MoveSide::unknown(), mv.is_dir, now) {
                self.abort_with(&err);
            }
        }
    }

    /// Applies a rename to both subtrees.
    ///
    /// Records RenameFrom/RenameTo results for the sides inside the
    /// watched area, moves or drops the kernel watch, then walks the
    /// source's children — watched nodes first, then result-only children,
    /// then untouched pre-existing entries — reducing each child to the
    /// sides on which it is filter-visible and recursing. Children only
    /// visible on one side still traverse so that side's bookkeeping stays
    /// correct.
    pub(crate) fn traverse_rename(
        &mut self,
        from: &MoveSide,
        to: &MoveSide,
        is_dir: bool,
        now: i64,
    ) -> Result<(), MonitorError> {
        debug_assert!(from.is_watched() || to.is_watched());
        trace!("rename walk: {:?} -> {:?}", from.path, to.path);

        if from.is_watched() {
            let mut result_idx = self.find_result_in(from.parent_idx, &from.name, is_dir);
            if result_idx < 0 {
                result_idx =
                    self.add_result(from.parent_idx, &from.parent_path, &from.name, is_dir)?;
                self.set_result_kind(result_idx, ResultKind::Deleted);
            } else {
                let existed_at_start = self.results[result_idx as usize].existed_at_start();
                if !self.results[result_idx as usize].exists_now() {
                    // Renaming something already gone: a create was missed.
                    self.set_inconsistent(result_idx);
                }
                self.set_result_kind(
                    result_idx,
                    if existed_at_start {
                        ResultKind::Deleted
                    } else {
                        ResultKind::Temporary
                    },
                );
            }
            self.push_action(result_idx, FileAction::RenameFrom, now);
            self.last_action_mut(result_idx).other_path = to.path.clone();
            self.emit(result_idx);
        }

        let mut to_result_idx = -1;
        if to.is_watched() {
            to_result_idx = self.find_result_in(to.parent_idx, &to.name, is_dir);
            if to_result_idx < 0 {
                to_result_idx =
                    self.add_result(to.parent_idx, &to.parent_path, &to.name, is_dir)?;
                self.set_result_kind(to_result_idx, ResultKind::Created);
            } else {
                let existed_at_start = self.results[to_result_idx as usize].existed_at_start();
                self.set_result_kind(
                    to_result_idx,
                    if existed_at_start {
                        ResultKind::Modified
                    } else {
                        ResultKind::Created
                    },
                );
            }
            self.push_action(to_result_idx, FileAction::RenameTo, now);
            self.last_action_mut(to_result_idx).other_path = from.path.clone();
            self.emit(to_result_idx);
        }

        if !is_dir {
            return Ok(());
        }

        let from_idx = if from.is_watched() {
            self.find_child_dir(from.parent_idx, &from.path)
        } else {
            -1
        };
        let from_exists = from_idx >= 0 && self.dirs[from_idx as usize].exists;

        let mut to_idx = if to.is_watched() {
            self.find_child_dir(to.parent_idx, &to.path)
        } else {
            -1
        };
        if to.is_watched() {
            if to_idx < 0 {
                if !self.dirs[to.parent_idx as usize].is_leaf() {
                    let idx = self.add_existing_dir(&to.path)?;
                    self.dirs[idx as usize].parent = to.parent_idx;
                    paths::push_unique(
                        &mut self.dirs[to.parent_idx as usize].subdir_idxs,
                        idx,
                    );
                    // No watch yet: the source side may hand its watch
                    // over below.
                    to_idx = idx;
                }
            } else if self.dirs[to_idx as usize].exists {
                // The destination was supposed to be gone: missed delete.
                let slot = self.dirs[to_idx as usize].watch_slot;
                if slot >= 0 {
                    self.source_mut().remove_path(slot, to_idx).ok();
                    self.dirs[to_idx as usize].watch_slot = -1;
                }
                self.set_inconsistent(to_result_idx);
                self.set_not_immediate(to_result_idx);
                self.dirs[to_idx as usize].existing.clear();
            } else {
                // Keep the node existing even though a queued delete event
                // may already contradict the filesystem.
                self.dirs[to_idx as usize].exists = true;
            }
        }
        let to_exists = to_idx >= 0 && self.dirs[to_idx as usize].exists;
        if !from_exists && !to_exists {
            return Ok(());
        }

        let mut visited: Vec<ChildEntry> = Vec::new();
        if from_exists {
            let from_slot = self.dirs[from_idx as usize].watch_slot;
            if from_slot >= 0 {
                if to_exists {
                    // Transfer the watch: the descriptor tracks the inode,
                    // so re-tagging loses no events mid-rename.
                    self.source_mut()
                        .rename_path(from_slot, from_idx, to_idx)
                        .ok();
                    debug_assert!(!self.dirs[to_idx as usize].is_watched());
                    self.dirs[to_idx as usize].watch_slot = from_slot;
                } else {
                    self.source_mut().remove_path(from_slot, from_idx).ok();
                }
                self.dirs[from_idx as usize].watch_slot = -1;
            }
            self.dirs[from_idx as usize].exists = false;
            let from_node_path = self.dirs[from_idx as usize].path.clone();

            // 1) Watched subdirectories of the source, regardless of
            //    existence: they may carry further descendants.
            let sub_idxs = self.dirs[from_idx as usize].subdir_idxs.clone();
            for from_child_idx in sub_idxs {
                let (child_name, from_child_path, child_exists) = {
                    let child = &self.dirs[from_child_idx as usize];
                    (
                        child.name().unwrap_or_default().to_string(),
                        child.path.clone(),
                        child.exists,
                    )
                };
                visited.push(ChildEntry::new(child_name.clone(), true));
                if !child_exists {
                    continue;
                }
                // A tracked child is never filtered out on the source side.
                let mut to_child_defined = to_exists;
                if to_exists {
                    let known_to_child = self.dirs[to_idx as usize]
                        .subdir_idxs
                        .iter()
                        .copied()
                        .find(|&idx| {
                            self.dirs[idx as usize].name() == Some(child_name.as_str())
                        });
                    if let Some(to_child_idx) = known_to_child {
                        // Tracked on the destination too, so not filtered
                        // out there; if it still "exists" a remove event
                        // was missed.
                        if self.dirs[to_child_idx as usize].exists {
                            self.dirs[to_child_idx as usize].exists = false;
                            self.dirs[to_child_idx as usize].existing.clear();
                            let slot = self.dirs[to_child_idx as usize].watch_slot;
                            if slot >= 0 {
                                self.source_mut().remove_path(slot, to_child_idx).ok();
                                self.dirs[to_child_idx as usize].watch_slot = -1;
                            }
                        }
                    } else {
                        let to_child_path = paths::join(&to.path, &child_name);
                        let filtered = {
                            let to_node = &self.dirs[to_idx as usize];
                            self.is_filtered_out(to_node, &child_name, &to_child_path, true)
                        };
                        if filtered {
                            to_child_defined = false;
                        }
                    }
                }
                let from_side = MoveSide {
                    parent_idx: from_idx,
                    parent_path: from_node_path.clone(),
                    name: child_name.clone(),
                    path: from_child_path,
                };
                let to_side = if to_child_defined {
                    MoveSide {
                        parent_idx: to_idx,
                        parent_path: to.path.clone(),
                        name: child_name.clone(),
                        path: paths::join(&to.path, &child_name),
                    }
                } else {
                    MoveSide::unknown()
                };
                self.traverse_rename(&from_side, &to_side, true, now)?;
                self.dirs[from_child_idx as usize].exists = false;
            }

            // 2) Result children never materialized as nodes, typically
            //    files.
            let result_idxs = self.dirs[from_idx as usize].result_idxs.clone();
            for child_result_idx in result_idxs {
                let (child_name, child_is_dir, child_parent_path, child_exists) = {
                    let result = &self.results[child_result_idx as usize];
                    (
                        result.name.clone(),
                        result.is_dir,
                        result.parent_path.clone(),
                        result.exists_now(),
                    )
                };
                if child_is_dir
                    && visited.iter().any(|v| v.is_dir && v.name == child_name)
                {
                    continue;
                }
                visited.push(ChildEntry::new(child_name.clone(), child_is_dir));
                if !child_exists {
                    continue;
                }
                // An existing result implies the source side is visible.
                let from_child_path = paths::join(&child_parent_path, &child_name);
                let mut to_child_defined = to_exists;
                let to_child_path = if to_exists {
                    paths::join(&to.path, &child_name)
                } else {
                    String::new()
                };
                if to_exists {
                    let filtered = {
                        let to_node = &self.dirs[to_idx as usize];
                        self.is_filtered_out(to_node, &child_name, &to_child_path, child_is_dir)
                    };
                    if filtered {
                        to_child_defined = false;
                    }
                }
                let from_side = MoveSide {
                    parent_idx: from_idx,
                    parent_path: child_parent_path,
                    name: child_name.clone(),
                    path: from_child_path,
                };
                let to_side = if to_child_defined {
                    MoveSide {
                        parent_idx: to_idx,
                        parent_path: to.path.clone(),
                        name: child_name.clone(),
                        path: to_child_path,
                    }
                } else {
                    MoveSide::unknown()
                };
                self.traverse_rename(&from_side, &to_side, child_is_dir, now)?;
            }

            // 3) Pre-existing entries nothing has touched yet.
            let existing = self.dirs[from_idx as usize].existing.clone();
            for entry in existing {
                if entry.removed {
                    continue;
                }
                if visited
                    .iter()
                    .any(|v| v.is_dir == entry.is_dir && v.name == entry.name)
                {
                    continue;
                }
                visited.push(ChildEntry::new(entry.name.clone(), entry.is_dir));
                let from_child_path = paths::join(&from_node_path, &entry.name);
                let from_child_defined = {
                    let from_node = &self.dirs[from_idx as usize];
                    !self.is_filtered_out(from_node, &entry.name, &from_child_path, entry.is_dir)
                };
                let mut to_child_defined = to_exists;
                let to_child_path = if to_exists {
                    paths::join(&to.path, &entry.name)
                } else {
                    String::new()
                };
                if to_exists {
                    let filtered = {
                        let to_node = &self.dirs[to_idx as usize];
                        self.is_filtered_out(to_node, &entry.name, &to_child_path, entry.is_dir)
                    };
                    if filtered {
                        to_child_defined = false;
                        // No result will ever be created for this name on
                        // the destination; record its existence so a later
                        // delete is judged as a real change.
                        self.dirs[to_idx as usize]
                            .existing
                            .push(ChildEntry::new(entry.name.clone(), entry.is_dir));
                    }
                }
                if !(from_child_defined || to_child_defined) {
                    continue;
                }
                let from_side = if from_child_defined {
                    MoveSide {
                        parent_idx: from_idx,
                        parent_path: from_node_path.clone(),
                        name: entry.name.clone(),
                        path: from_child_path,
                    }
                } else {
                    MoveSide::unknown()
                };
                let to_side = if to_child_defined {
                    MoveSide {
                        parent_idx: to_idx,
                        parent_path: to.path.clone(),
                        name: entry.name.clone(),
                        path: to_child_path,
                    }
                } else {
                    MoveSide::unknown()
                };
                self.traverse_rename(&from_side, &to_side, entry.is_dir, now)?;
            }
            self.dirs[from_idx as usize].existing.clear();
        }

        if to_exists {
            let mut newly_watched = false;
            if !self.dirs[to_idx as usize].is_watched() {
                self.install_watch(to_idx)?;
                newly_watched = true;
            }
            if !self.dirs[to_idx as usize].is_watched() {
                // Typically permission denied; the node stays unwatched.
                return Ok(());
            }
            if newly_watched {
                // Entries found now appeared after the rename; everything
                // the rename itself carried was walked above and must not
                // be reported again.
                self.create_immediate_children(to_idx, false, now, &visited)?;
            }
        }
        Ok(())
    }
}
