//! Directory-zone declarations.

use crate::filter::Filter;

/// A zone of directories watched with one set of filters.
///
/// A zone with max depth 0 covers just the base path itself, max depth 1
/// additionally covers its direct subdirectories, and so on. The base path
/// does not have to exist; the engine starts watching it the moment it
/// appears.
///
/// If a subdirectory or file satisfies both the include and the exclude
/// filters it is excluded: excludes override includes. Pinned names bypass
/// the filters entirely.
///
/// Two zones may overlap but cannot share a base path. When a directory
/// lies inside several zones, the zone with the closest (longest) base path
/// owns it and shadows the others, including their deeper reach:
///
/// - zones `("/A", 10)` and `("/A/B/C", 1)`
/// - `/A/X/Y/Z/f2.txt` belongs to `/A`
/// - `/A/B/C/f1.txt` belongs to `/A/B/C`
/// - `/A/B/C/D/E/f3.txt` belongs to no zone: `/A/B/C` is closer and
///   shadows `/A`, but only reaches one level down
///
/// Symbolic links are not followed; declare a separate zone for a link
/// target if it should be watched too.
#[derive(Clone, Debug, Default)]
pub struct DirectoryZone {
    /// The absolute base path. Does not need to exist.
    pub path: String,
    /// 0 watches only the base directory itself, 1 also its direct
    /// subdirectories, and so on. Must not be negative.
    pub max_depth: i32,
    /// Subdirectory include filters, ORed together. Empty means no
    /// restriction.
    pub subdir_include_filters: Vec<Filter>,
    /// Subdirectory exclude filters, ORed together.
    pub subdir_exclude_filters: Vec<Filter>,
    /// Subdirectory names (no paths) watched despite the filters.
    pub pinned_subdirs: Vec<String>,
    /// File include filters, ORed together. Empty means no restriction.
    pub file_include_filters: Vec<Filter>,
    /// File exclude filters, ORed together.
    pub file_exclude_filters: Vec<Filter>,
    /// File names (no paths) watched despite the filters.
    pub pinned_files: Vec<String>,
    /// Set when the base path is an ancestor of an unwatchable system path,
    /// so descendants must be checked against the forbidden prefixes.
    pub(crate) might_have_invalid_descendants: bool,
}

impl DirectoryZone {
    /// Creates a zone covering `path` down to `max_depth` levels, with no
    /// filters and no pinned names.
    pub fn new(path: impl Into<String>, max_depth: i32) -> DirectoryZone {
        DirectoryZone {
            path: path.into(),
            max_depth,
            ..DirectoryZone::default()
        }
    }

    /// Compiles every filter's regular expression.
    pub(crate) fn compile_filters(&mut self) -> Result<(), String> {
        for filter in self
            .subdir_include_filters
            .iter_mut()
            .chain(self.subdir_exclude_filters.iter_mut())
            .chain(self.file_include_filters.iter_mut())
            .chain(self.file_exclude_filters.iter_mut())
        {
            filter.compile()?;
        }
        Ok(())
    }

    /// The pinned names appropriate for a directory or a file.
    pub(crate) fn pinned(&self, is_dir: bool) -> &[String] {
        if is_dir {
            &self.pinned_subdirs
        } else {
            &self.pinned_files
        }
    }
}
