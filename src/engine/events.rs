//! The live reconciler: one call per delivered event.

use log::{trace, warn};

use crate::node::ChildEntry;
use crate::paths;
use crate::result::ResultKind;
use crate::source::{FileAction, SourceEvent};

use super::{Monitor, MonitorError};

impl Monitor {
    /// Reconciles a single event from the watch source.
    ///
    /// This is the engine's event-loop entry point: the tokio driver and
    /// [`pump`](Monitor::pump) call it for every drained event, and tests
    /// call it directly with synthetic events. Unrecoverable failures are
    /// routed to the abort handler; the call itself never panics on bad
    /// input.
    pub fn handle_event(&mut self, event: &SourceEvent) {
        self.event_counter += 1;
        if event.overflow {
            self.overflow = true;
            return;
        }
        if let Err(err) = self.reconcile(event) {
            self.abort_with(&err);
        }
    }

    fn reconcile(&mut self, event: &SourceEvent) -> Result<(), MonitorError> {
        let parent_idx = event.tag;
        if parent_idx < 0 || parent_idx as usize >= self.dirs.len() {
            warn!("event for unknown watch tag {parent_idx} dropped");
            return Ok(());
        }
        let mut action = event.action;
        let is_dir = event.is_dir;
        let name = event.name.as_str();
        let now = self.now_rel_usec();
        trace!("event: tag {parent_idx} name {name:?} dir {is_dir} {action:?}");

        if name.is_empty() {
            // A self-event on the watched directory. The only interesting
            // one is ATTRIB on `/`: every other directory reports its own
            // changes through its parent's watch, the root has no parent.
            if action != FileAction::Attrib || parent_idx != self.root_idx {
                return Ok(());
            }
            if self.root_result_idx < 0 {
                self.root_result_idx = self.find_root_result();
            }
            if self.root_result_idx < 0 {
                let result_idx = self.add_root_result()?;
                self.root_result_idx = result_idx;
                self.set_result_kind(result_idx, ResultKind::Modified);
                self.push_action(result_idx, action, now);
            }
            return Ok(());
        }

        let parent_path = self.dirs[parent_idx as usize].path.clone();
        let child_path = paths::join(&parent_path, name);
        let filtered_out = {
            let parent = &self.dirs[parent_idx as usize];
            self.is_filtered_out(parent, name, &child_path, is_dir)
        };

        match action {
            FileAction::RenameFrom => {
                return self.on_rename_from(
                    parent_idx,
                    name,
                    &child_path,
                    is_dir,
                    filtered_out,
                    event.rename_cookie,
                    now,
                );
            }
            FileAction::RenameTo => {
                return self.on_rename_to(
                    parent_idx,
                    &parent_path,
                    name,
                    &child_path,
                    is_dir,
                    filtered_out,
                    event.rename_cookie,
                    now,
                );
            }
            _ => {}
        }
        if filtered_out {
            return Ok(());
        }

        // An attribute change can be the first sign of life of an entry the
        // (non-root) process could not see before; treat it as a creation
        // then. Root sees everything, so no such upgrade applies.
        let mut was_attrib = false;
        let mut result_idx = -1;
        let mut lookup_done = false;
        if action == FileAction::Attrib && !self.is_root_user {
            result_idx = self.find_result_by_path(&parent_path, name, is_dir);
            lookup_done = true;
            if result_idx < 0 {
                if self.dirs[parent_idx as usize]
                    .find_existing(is_dir, name)
                    .is_none()
                {
                    action = FileAction::Create;
                    was_attrib = true;
                }
            } else if !self.results[result_idx as usize].exists_now() {
                action = FileAction::Create;
                was_attrib = true;
            }
        }
        if !lookup_done {
            result_idx = self.find_result_in(parent_idx, name, is_dir);
        }

        let result_existed = result_idx >= 0;
        let mut emit_result = true;
        let mut was_immediate = false;
        let mut inconsistent = false;
        if !result_existed {
            let existed = self.dirs[parent_idx as usize]
                .find_existing(is_dir, name)
                .is_some();
            result_idx = self.add_result(parent_idx, &parent_path, name, is_dir)?;
            let kind = match action {
                FileAction::Create => {
                    if existed {
                        // Creating something that already exists: a remove
                        // was missed somewhere.
                        self.set_inconsistent(result_idx);
                    }
                    ResultKind::Created
                }
                FileAction::Delete => {
                    if !existed {
                        self.set_inconsistent(result_idx);
                    }
                    ResultKind::Deleted
                }
                _ => {
                    debug_assert!(matches!(
                        action,
                        FileAction::Modify | FileAction::Attrib
                    ));
                    if !existed {
                        self.set_inconsistent(result_idx);
                    }
                    ResultKind::Modified
                }
            };
            self.set_result_kind(result_idx, kind);
            self.push_action(result_idx, action, now);
            self.last_action_mut(result_idx).caused_by_attrib = was_attrib;
        } else {
            let existed_at_start = self.results[result_idx as usize].existed_at_start();
            match action {
                FileAction::Create => {
                    was_immediate = self.results[result_idx as usize].last_is_immediate();
                    inconsistent =
                        !was_immediate && self.results[result_idx as usize].exists_now();
                    if inconsistent {
                        self.set_inconsistent(result_idx);
                    }
                    if !was_immediate || inconsistent {
                        self.push_action(result_idx, FileAction::Create, now);
                        self.last_action_mut(result_idx).caused_by_attrib = was_attrib;
                    } else {
                        // The immediate-children scan already reported this
                        // creation; the kernel event only confirms it.
                        self.set_not_immediate(result_idx);
                        emit_result = false;
                    }
                    self.set_result_kind(
                        result_idx,
                        if existed_at_start {
                            ResultKind::Modified
                        } else {
                            ResultKind::Created
                        },
                    );
                }
                FileAction::Delete => {
                    if !self.results[result_idx as usize].exists_now() {
                        self.set_inconsistent(result_idx);
                    }
                    self.push_action(result_idx, action, now);
                    self.last_action_mut(result_idx).caused_by_attrib = was_attrib;
                    self.set_result_kind(
                        result_idx,
                        if existed_at_start {
                            ResultKind::Deleted
                        } else {
                            ResultKind::Temporary
                        },
                    );
                }
                _ => {
                    debug_assert!(matches!(
                        action,
                        FileAction::Modify | FileAction::Attrib
                    ));
                    if !self.results[result_idx as usize].exists_now() {
                        self.set_inconsistent(result_idx);
                        self.push_action(result_idx, action, now);
                        self.last_action_mut(result_idx).caused_by_attrib = was_attrib;
                        self.set_result_kind(
                            result_idx,
                            if existed_at_start {
                                ResultKind::Modified
                            } else {
                                ResultKind::Created
                            },
                        );
                    } else {
                        // Already Created or Modified; nothing to record.
                        self.set_not_immediate(result_idx);
                        emit_result = false;
                    }
                }
            }
        }

        if !is_dir {
            if emit_result {
                self.emit(result_idx);
            }
            return Ok(());
        }

        match action {
            FileAction::Create => {
                self.on_dir_created(
                    parent_idx,
                    &child_path,
                    result_idx,
                    result_existed,
                    was_immediate,
                    inconsistent,
                    emit_result,
                    was_attrib,
                    now,
                )?;
            }
            FileAction::Delete => {
                let child_idx = self.find_child_dir(parent_idx, &child_path);
                if child_idx >= 0 && self.dirs[child_idx as usize].exists {
                    let slot = self.dirs[child_idx as usize].watch_slot;
                    if slot >= 0 {
                        self.source_mut().remove_path(slot, child_idx).ok();
                        self.dirs[child_idx as usize].watch_slot = -1;
                    }
                    self.dirs[child_idx as usize].exists = false;
                    // Deeper nodes are not pruned eagerly; the kernel
                    // delivers their delete events individually.
                    self.dirs[child_idx as usize].existing.clear();
                }
                if emit_result {
                    self.emit(result_idx);
                }
            }
            _ => {
                if emit_result {
                    self.emit(result_idx);
                }
            }
        }
        Ok(())
    }

    /// Handles the structural side of a directory creation.
    #[allow(clippy::too_many_arguments)]
    fn on_dir_created(
        &mut self,
        parent_idx: i32,
        child_path: &str,
        result_idx: i32,
        result_existed: bool,
        was_immediate: bool,
        inconsistent: bool,
        mut emit_result: bool,
        was_attrib: bool,
        now: i64,
    ) -> Result<(), MonitorError> {
        let mut child_idx = self.find_child_dir(parent_idx, child_path);
        if child_idx < 0 {
            if self.dirs[parent_idx as usize].is_leaf() {
                // Past the zone's depth: the entry is reported but the
                // directory itself is not tracked.
                if emit_result {
                    self.emit(result_idx);
                }
                return Ok(());
            }
            child_idx = self.add_existing_dir(child_path)?;
            self.dirs[child_idx as usize].parent = parent_idx;
            paths::push_unique(
                &mut self.dirs[parent_idx as usize].subdir_idxs,
                child_idx,
            );
        } else if self.dirs[child_idx as usize].exists {
            // Creating a directory the model believes exists: a delete
            // event was missed.
            if !was_immediate || inconsistent {
                let slot = self.dirs[child_idx as usize].watch_slot;
                if slot >= 0 {
                    // The old watch tracks a gone inode, and the new
                    // directory may not even be watchable.
                    self.source_mut().remove_path(slot, child_idx).ok();
                    self.dirs[child_idx as usize].watch_slot = -1;
                }
                if result_existed {
                    debug_assert!(inconsistent);
                } else if !inconsistent {
                    self.set_inconsistent(result_idx);
                    debug_assert_eq!(self.result_kind(result_idx), ResultKind::Created);
                    // A deleted-then-recreated directory reads as modified.
                    self.set_result_kind(result_idx, ResultKind::Modified);
                }
                self.dirs[child_idx as usize].existing.clear();
            } else {
                emit_result = false;
            }
        } else {
            debug_assert!(!self.dirs[child_idx as usize].is_watched());
            self.dirs[child_idx as usize].exists = true;
        }

        if !self.dirs[child_idx as usize].is_watched() {
            // Watch first, scan second: a race then shows up as an extra
            // event rather than a lost one.
            self.install_watch(child_idx)?;
        }
        if emit_result {
            self.emit(result_idx);
        }
        if self.dirs[child_idx as usize].is_watched() {
            self.create_immediate_children(child_idx, was_attrib, now, &[])?;
        }
        Ok(())
    }

    /// Reports entries that appeared between a directory's creation event
    /// and the installation of its watch.
    ///
    /// Enumerates the directory and synthesizes a Create (flagged
    /// immediate) for every unfiltered entry not listed in `excepts`,
    /// recursing into subdirectories. The immediate flag lets the later
    /// kernel Create for the same entry be folded instead of counted
    /// twice.
    pub(crate) fn create_immediate_children(
        &mut self,
        parent_idx: i32,
        was_attrib: bool,
        now: i64,
        excepts: &[ChildEntry],
    ) -> Result<(), MonitorError> {
        debug_assert!(parent_idx >= 0);
        let (parent_path, parent_is_leaf) = {
            let parent = &self.dirs[parent_idx as usize];
            (parent.path.clone(), parent.is_leaf())
        };
        let entries = match std::fs::read_dir(&parent_path) {
            Ok(entries) => entries,
            Err(_) => return Ok(()),
        };
        for entry in entries.flatten() {
            let child_name = entry.file_name().to_string_lossy().into_owned();
            let child_path = paths::join(&parent_path, &child_name);
            let info = paths::path_info(&child_path);
            if !info.exists {
                continue;
            }
            let is_dir = info.is_dir;
            if excepts
                .iter()
                .any(|e| e.is_dir == is_dir && e.name == child_name)
            {
                continue;
            }
            let filtered = {
                let parent = &self.dirs[parent_idx as usize];
                self.is_filtered_out(parent, &child_name, &child_path, is_dir)
            };
            if filtered {
                // Invisible to results, but its existence must be on
                // record for a later delete to be judged correctly.
                self.dirs[parent_idx as usize]
                    .existing
                    .push(ChildEntry::new(child_name, is_dir));
                continue;
            }

            let mut existed_at_start = false;
            let mut was_immediate = false;
            let mut inconsistent = false;
            let mut emit_result = true;
            let mut result_idx = self.find_result_in(parent_idx, &child_name, is_dir);
            let result_existed = result_idx >= 0;
            if !result_existed {
                result_idx = self.add_result(parent_idx, &parent_path, &child_name, is_dir)?;
            } else {
                let result = &self.results[result_idx as usize];
                was_immediate = result.last_is_immediate();
                existed_at_start = result.existed_at_start();
                inconsistent = !was_immediate && result.exists_now();
                if inconsistent {
                    self.set_inconsistent(result_idx);
                }
            }
            if !was_immediate || inconsistent {
                self.push_action(result_idx, FileAction::Create, now);
                let last = self.last_action_mut(result_idx);
                last.caused_by_attrib = was_attrib;
                last.immediate = !inconsistent;
            } else {
                emit_result = false;
            }
            self.set_result_kind(
                result_idx,
                if existed_at_start {
                    ResultKind::Modified
                } else {
                    ResultKind::Created
                },
            );

            if !is_dir {
                if emit_result {
                    self.emit(result_idx);
                }
                continue;
            }

            let mut child_idx = self.find_child_dir(parent_idx, &child_path);
            if child_idx < 0 {
                if parent_is_leaf {
                    if emit_result {
                        self.emit(result_idx);
                    }
                    continue;
                }
                child_idx = self.add_existing_dir(&child_path)?;
                self.dirs[child_idx as usize].parent = parent_idx;
                paths::push_unique(
                    &mut self.dirs[parent_idx as usize].subdir_idxs,
                    child_idx,
                );
            } else if self.dirs[child_idx as usize].exists {
                if !was_immediate || inconsistent {
                    // Missed delete, same treatment as in the live path.
                    let slot = self.dirs[child_idx as usize].watch_slot;
                    if slot >= 0 {
                        self.source_mut().remove_path(slot, child_idx).ok();
                        self.dirs[child_idx as usize].watch_slot = -1;
                    }
                    if result_existed {
                        debug_assert!(inconsistent);
                    } else if !inconsistent {
                        self.set_inconsistent(result_idx);
                        self.set_result_kind(result_idx, ResultKind::Modified);
                    }
                    self.dirs[child_idx as usize].existing.clear();
                } else {
                    emit_result = false;
                }
            } else {
                debug_assert!(!self.dirs[child_idx as usize].is_watched());
                self.dirs[child_idx as usize].exists = true;
            }

            if !self.dirs[child_idx as usize].is_watched() {
                self.install_watch(child_idx)?;
            }
            if emit_result {
                self.emit(result_idx);
            }
            if self.dirs[child_idx as usize].is_watched() {
                self.create_immediate_children(child_idx, was_attrib, now, &[])?;
            }
        }
        Ok(())
    }
}
