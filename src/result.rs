//! The result ledger: one cumulative record per observed entry.

use crate::source::FileAction;

/// The net state of an observed file or directory.
///
/// The guiding rule: whether the entry existed at the start of the session
/// is preserved across every transition. Deleting an entry that existed at
/// start yields `Deleted`; deleting one first seen during the session
/// yields `Temporary`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ResultKind {
    /// No action recorded yet. Never visible in a finished result.
    #[default]
    None,
    /// A previously absent entry was created.
    Created,
    /// A previously existing entry was deleted.
    Deleted,
    /// A previously existing entry was modified (or replaced).
    Modified,
    /// Created during the session and deleted again before it ended.
    Temporary,
}

/// One observed event on a result.
#[derive(Clone, Debug)]
pub struct ActionData {
    /// What happened.
    pub action: FileAction,
    /// The other side of a rename: the destination path for a
    /// [`RenameFrom`](FileAction::RenameFrom), the origin path for a
    /// [`RenameTo`](FileAction::RenameTo). Empty when unknown or not a
    /// rename.
    pub other_path: String,
    /// Synthesized by a directory scan rather than delivered by the
    /// kernel.
    pub immediate: bool,
    /// The action is really an attribute change that made the entry
    /// visible to the (non-root) process.
    pub caused_by_attrib: bool,
    /// Microseconds since the session started.
    pub time_usec: i64,
}

/// The cumulative record for one `(parent path, name, is-directory)` key.
///
/// A file can be removed and a directory of the same name created during
/// one session, so the is-directory flag is part of the key.
#[derive(Clone, Debug, Default)]
pub struct WatchedResult {
    /// The current net state.
    pub kind: ResultKind,
    /// The parent directory path.
    pub parent_path: String,
    /// The entry name; empty only for the root-directory record.
    pub name: String,
    /// Whether the entry is a directory.
    pub is_dir: bool,
    /// The engine observed an impossible transition for this entry; its
    /// state may be inaccurate.
    pub inconsistent: bool,
    /// Every recorded action, oldest first.
    pub actions: Vec<ActionData>,
}

impl WatchedResult {
    /// The full path of the observed entry.
    pub fn path(&self) -> String {
        crate::paths::join(&self.parent_path, &self.name)
    }

    /// Whether the entry existed when the session started.
    pub(crate) fn existed_at_start(&self) -> bool {
        matches!(self.kind, ResultKind::Deleted | ResultKind::Modified)
    }

    /// Whether the entry exists after the last recorded action.
    pub(crate) fn exists_now(&self) -> bool {
        matches!(self.kind, ResultKind::Created | ResultKind::Modified)
    }

    /// Whether the last action was synthesized by a directory scan.
    pub(crate) fn last_is_immediate(&self) -> bool {
        self.actions.last().is_some_and(|a| a.immediate)
    }
}
