//! Path helpers for the engine.
//!
//! The engine works on absolute, canonical path strings: no trailing slash
//! (except `/` itself), no `//`, and no all-dot segments hiding in the
//! middle. These helpers keep that invariant cheap to maintain without
//! allocating more than necessary.

use std::fs;
use std::io;
use std::path::Path;

/// Normalizes a path string.
///
/// Removes trailing and repeated slashes and collapses segments that consist
/// only of dots into `.` or chains of `..`. Does not touch the filesystem;
/// `.` and `..` segments survive (and are rejected later by zone
/// validation).
pub(crate) fn cleanup_path(path: &str) -> String {
    if path.is_empty() {
        return String::new();
    }
    let mut out = String::with_capacity(path.len());
    let absolute = path.starts_with('/');
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        if !out.is_empty() || absolute {
            out.push('/');
        }
        if !segment.is_empty() && segment.bytes().all(|b| b == b'.') {
            // An all-dot segment of n >= 2 dots means n - 1 parent hops.
            match segment.len() {
                1 => out.push('.'),
                n => {
                    out.push_str("..");
                    for _ in 2..n {
                        out.push_str("/..");
                    }
                }
            }
        } else {
            out.push_str(segment);
        }
    }
    if out.is_empty() {
        if absolute {
            out.push('/');
        } else {
            return String::new();
        }
    }
    out
}

/// Returns the parent directory of a cleaned-up path, or `None` for `/`
/// and for relative paths without a slash.
pub(crate) fn parent_dir(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(pos) => Some(&path[..pos]),
        None => None,
    }
}

/// Returns the last component of a cleaned-up path.
pub(crate) fn file_name(path: &str) -> &str {
    match path.rfind('/') {
        Some(pos) => &path[pos + 1..],
        None => path,
    }
}

/// Joins a directory path and a child name.
pub(crate) fn join(dir: &str, name: &str) -> String {
    if dir == "/" {
        format!("/{name}")
    } else {
        format!("{dir}/{name}")
    }
}

/// Computes the depth of `child` below `base`, both cleaned up.
///
/// Returns `0` when the paths are equal, the number of components between
/// them when `child` lies below `base`, and `-1` when `child` is outside
/// `base` or deeper than `max_depth`.
pub(crate) fn depth_below(child: &str, base: &str, max_depth: i32) -> i32 {
    let rest = match child.strip_prefix(base) {
        Some(rest) => rest,
        None => return -1,
    };
    if rest.is_empty() {
        return 0;
    }
    // Reject sibling prefixes like "/a/bb" below "/a/b".
    if base != "/" && !rest.starts_with('/') {
        return -1;
    }
    let mut depth = 0;
    for segment in rest.split('/') {
        if segment.is_empty() {
            continue;
        }
        depth += 1;
        if depth > max_depth {
            return -1;
        }
    }
    depth
}

/// Resolves the longest existing prefix of `path` through the filesystem
/// and re-attaches the non-existing remainder verbatim.
///
/// Declared zone bases may not exist yet, so plain canonicalization is not
/// an option. Walks up the ancestor chain until canonicalization succeeds;
/// symlink loops, overlong paths and unreadable elements are reported as
/// errors, everything else (typically `ENOENT`) just moves one level up.
pub(crate) fn resolve_existing_prefix(path: &str) -> Result<String, String> {
    let mut sub: &str = path;
    loop {
        match fs::canonicalize(sub) {
            Ok(resolved) => {
                let resolved = resolved.to_string_lossy().into_owned();
                let rest = &path[sub.len()..];
                // `rest` keeps its leading slash except when `sub` is `/`
                // itself; avoid both `//` and a dropped separator.
                return Ok(if resolved == "/" && rest.starts_with('/') {
                    rest.to_string()
                } else {
                    format!("{resolved}{rest}")
                });
            }
            Err(err) => match err.raw_os_error() {
                Some(libc::ENAMETOOLONG) => {
                    return Err(format!("Absolute path too long: {path}"));
                }
                Some(libc::ELOOP) => {
                    return Err(format!("Absolute path has too many symlinks: {path}"));
                }
                Some(libc::EACCES) => {
                    return Err(format!("Absolute path has forbidden elements: {path}"));
                }
                _ => {}
            },
        }
        match parent_dir(sub) {
            Some(parent) => sub = parent,
            None => return Ok(path.to_string()),
        }
    }
}

/// What a single `lstat` told us about a path.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct PathInfo {
    pub exists: bool,
    pub is_dir: bool,
    pub is_symlink: bool,
}

/// Stats a path without following a trailing symlink.
pub(crate) fn path_info<P: AsRef<Path>>(path: P) -> PathInfo {
    match fs::symlink_metadata(path) {
        Ok(meta) => PathInfo {
            exists: true,
            is_dir: meta.is_dir(),
            is_symlink: meta.file_type().is_symlink(),
        },
        Err(_) => PathInfo::default(),
    }
}

/// Pushes `value` unless the collection already contains it.
pub(crate) fn push_unique<T: PartialEq>(values: &mut Vec<T>, value: T) {
    if !values.contains(&value) {
        values.push(value);
    }
}

/// Reads a whole file as a trimmed string, for small procfs entries.
pub(crate) fn read_trimmed(path: &str) -> io::Result<String> {
    Ok(fs::read_to_string(path)?.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cleanup_strips_trailing_and_repeated_slashes() {
        assert_eq!(cleanup_path("/a/b/"), "/a/b");
        assert_eq!(cleanup_path("/a//b///c"), "/a/b/c");
        assert_eq!(cleanup_path("////"), "/");
        assert_eq!(cleanup_path("/"), "/");
        assert_eq!(cleanup_path(""), "");
    }

    #[test]
    fn cleanup_collapses_dot_runs() {
        assert_eq!(cleanup_path("/a/./b"), "/a/./b");
        assert_eq!(cleanup_path("/a/..../b"), "/a/../../../b");
        assert_eq!(cleanup_path("/a/.../"), "/a/../..");
    }

    #[test]
    fn parent_and_name_split() {
        assert_eq!(parent_dir("/a/b"), Some("/a"));
        assert_eq!(parent_dir("/a"), Some("/"));
        assert_eq!(parent_dir("/"), None);
        assert_eq!(file_name("/a/b"), "b");
        assert_eq!(file_name("/"), "");
    }

    #[test]
    fn join_handles_root() {
        assert_eq!(join("/", "etc"), "/etc");
        assert_eq!(join("/a", "b"), "/a/b");
    }

    #[test]
    fn resolve_keeps_a_fully_nonexistent_path_intact() {
        let path = "/zonewatch-test-nonexistent/a/b";
        assert_eq!(resolve_existing_prefix(path).unwrap(), path);
    }

    #[test]
    fn depth_below_counts_components() {
        assert_eq!(depth_below("/a/b/c", "/a", 10), 2);
        assert_eq!(depth_below("/a", "/a", 10), 0);
        assert_eq!(depth_below("/a/b", "/", 10), 2);
        assert_eq!(depth_below("/a/b/c", "/a", 1), -1);
        assert_eq!(depth_below("/x/y", "/a", 10), -1);
        // a sibling that merely shares a string prefix is outside
        assert_eq!(depth_below("/a/bb", "/a/b", 10), -1);
    }
}
