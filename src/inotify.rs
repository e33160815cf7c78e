//! The inotify-backed watch source.

use std::ffi::{CString, OsStr};
use std::io;
use std::mem;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;

use inotify_sys as ffi;
use libc::{c_void, size_t};
use log::{debug, trace, warn};

use crate::source::{
    starts_with_any, FileAction, SourceEvent, WatchError, WatchSource, FORBIDDEN_PREFIXES,
};

bitflags::bitflags! {
    /// Event bits delivered by the kernel, limited to the ones the engine
    /// subscribes to plus the synthetic bits inotify may set on any event.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    struct EventMask: u32 {
        const ATTRIB      = ffi::IN_ATTRIB;
        const CLOSE_WRITE = ffi::IN_CLOSE_WRITE;
        const CREATE      = ffi::IN_CREATE;
        const DELETE      = ffi::IN_DELETE;
        const MOVED_FROM  = ffi::IN_MOVED_FROM;
        const MOVED_TO    = ffi::IN_MOVED_TO;
        const IGNORED     = ffi::IN_IGNORED;
        const ISDIR       = ffi::IN_ISDIR;
        const Q_OVERFLOW  = ffi::IN_Q_OVERFLOW;
        const UNMOUNT     = ffi::IN_UNMOUNT;
    }
}

/// The watch mask installed on every directory.
///
/// `CLOSE_WRITE` stands in for plain `MODIFY` so one written file produces
/// one event instead of one per write. `ONLYDIR` keeps a racing
/// file-for-directory swap from installing a file watch, `DONT_FOLLOW`
/// keeps symlinks from escaping the declared zones, and `EXCL_UNLINK`
/// silences events from already-unlinked children.
const WATCH_MASK: u32 = ffi::IN_CREATE
    | ffi::IN_MOVED_TO
    | ffi::IN_DELETE
    | ffi::IN_MOVED_FROM
    | ffi::IN_CLOSE_WRITE
    | ffi::IN_ATTRIB
    | ffi::IN_DONT_FOLLOW
    | ffi::IN_EXCL_UNLINK
    | ffi::IN_ONLYDIR;

/// Big enough for one event carrying a `NAME_MAX` name, with room to batch.
const BUFFER_SIZE: usize = 8192;

#[derive(Clone, Copy)]
struct WatchSlot {
    descriptor: i32,
    tag: i32,
}

/// The production [`WatchSource`]: a thin owning wrapper around one inotify
/// instance.
///
/// Watches live in a slab of `(descriptor, tag)` slots backed by a free
/// list, so the slot index handed back from [`add_path`] stays valid for
/// the lifetime of the watch and removal never shifts other entries.
///
/// [`add_path`]: WatchSource::add_path
pub struct InotifySource {
    fd: RawFd,
    slots: Vec<WatchSlot>,
    free_slots: Vec<i32>,
}

impl InotifySource {
    /// Creates an inotify instance.
    ///
    /// Passes `IN_CLOEXEC` so the descriptor does not leak into spawned
    /// processes and `IN_NONBLOCK` because draining is edge-driven by the
    /// host's poll loop.
    pub fn new() -> io::Result<InotifySource> {
        let fd = unsafe { ffi::inotify_init1(ffi::IN_CLOEXEC | ffi::IN_NONBLOCK) };
        match fd {
            -1 => Err(io::Error::last_os_error()),
            _ => Ok(InotifySource {
                fd,
                slots: Vec::new(),
                free_slots: Vec::new(),
            }),
        }
    }

    fn slot_by_tag(&self, tag: i32) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.tag == tag && s.descriptor >= 0)
    }

    fn slot_by_descriptor(&self, descriptor: i32) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.descriptor == descriptor && s.descriptor >= 0)
    }

    fn resolve_slot(&self, slot: i32, tag: i32) -> Result<usize, WatchError> {
        if slot < 0 {
            return self.slot_by_tag(tag).ok_or(WatchError::NotFound);
        }
        let idx = slot as usize;
        match self.slots.get(idx) {
            Some(entry) if entry.descriptor >= 0 && entry.tag == tag => Ok(idx),
            _ => Err(WatchError::NotFound),
        }
    }

    /// Decodes one raw event from `buffer`, returning the consumed length.
    ///
    /// Assumes a full `inotify_event` plus its name sits at the start of
    /// `buffer`; the kernel never splits events across reads.
    fn parse_event(buffer: &[u8]) -> (usize, ffi::inotify_event, String) {
        let event_size = mem::size_of::<ffi::inotify_event>();
        assert!(buffer.len() >= event_size);

        // The byte buffer has alignment 1 while `inotify_event` wants more,
        // so the pointer must be read unaligned.
        let event_ptr = buffer.as_ptr() as *const ffi::inotify_event;
        let event = unsafe { event_ptr.read_unaligned() };

        let consumed = event_size + event.len as usize;
        assert!(buffer.len() >= consumed);

        // The name is padded with trailing '\0' up to the alignment
        // boundary; `splitn` always yields at least one piece, so the
        // unwrap cannot fail.
        let name = &buffer[event_size..consumed];
        let name = name.splitn(2, |b| b == &0u8).next().unwrap();
        let name = OsStr::from_bytes(name).to_string_lossy().into_owned();

        (consumed, event, name)
    }
}

impl WatchSource for InotifySource {
    fn invalid_paths(&self) -> Vec<String> {
        FORBIDDEN_PREFIXES.iter().map(|p| p.to_string()).collect()
    }

    fn add_path(&mut self, path: &str, tag: i32) -> Result<i32, WatchError> {
        debug_assert!(path.starts_with('/'));
        if starts_with_any(path, &self.invalid_paths()) {
            return Err(WatchError::ForbiddenPath);
        }

        let c_path = CString::new(path.as_bytes()).map_err(|_| WatchError::Os(libc::EINVAL))?;
        let wd = unsafe { ffi::inotify_add_watch(self.fd, c_path.as_ptr() as *const _, WATCH_MASK) };
        if wd == -1 {
            let errno = io::Error::last_os_error().raw_os_error().unwrap_or(0);
            return Err(WatchError::Os(errno));
        }
        trace!("watch added: {path} (wd {wd}, tag {tag})");

        let entry = WatchSlot {
            descriptor: wd,
            tag,
        };
        let slot = match self.free_slots.pop() {
            Some(slot) => {
                self.slots[slot as usize] = entry;
                slot
            }
            None => {
                self.slots.push(entry);
                (self.slots.len() - 1) as i32
            }
        };
        Ok(slot)
    }

    fn remove_path(&mut self, slot: i32, tag: i32) -> Result<(), WatchError> {
        let idx = self.resolve_slot(slot, tag)?;
        let wd = self.slots[idx].descriptor;
        self.slots[idx] = WatchSlot {
            descriptor: -1,
            tag: -1,
        };
        self.free_slots.push(idx as i32);
        // The removal may race an IGNORED already queued for this watch;
        // the kernel then reports EINVAL, which is fine.
        let ret = unsafe { ffi::inotify_rm_watch(self.fd, wd) };
        if ret == -1 {
            let errno = io::Error::last_os_error().raw_os_error().unwrap_or(0);
            trace!("watch removal for tag {tag} reported errno {errno}");
            return Err(WatchError::Os(errno));
        }
        Ok(())
    }

    fn rename_path(&mut self, slot: i32, from_tag: i32, to_tag: i32) -> Result<(), WatchError> {
        let idx = self.resolve_slot(slot, from_tag)?;
        self.slots[idx].tag = to_tag;
        debug!("watch re-tagged: {from_tag} -> {to_tag}");
        Ok(())
    }

    fn clear_all(&mut self) -> Result<(), WatchError> {
        let mut first_errno = 0;
        for slot in &self.slots {
            if slot.descriptor < 0 {
                continue;
            }
            let ret = unsafe { ffi::inotify_rm_watch(self.fd, slot.descriptor) };
            if ret == -1 && first_errno == 0 {
                first_errno = io::Error::last_os_error().raw_os_error().unwrap_or(0);
            }
        }
        self.slots.clear();
        self.free_slots.clear();
        if first_errno != 0 {
            return Err(WatchError::Os(first_errno));
        }
        Ok(())
    }

    fn drain(&mut self, out: &mut Vec<SourceEvent>) -> io::Result<()> {
        let mut buffer = [0u8; BUFFER_SIZE];
        loop {
            let num_bytes = unsafe {
                ffi::read(
                    self.fd,
                    buffer.as_mut_ptr() as *mut c_void,
                    buffer.len() as size_t,
                )
            };
            let num_bytes = match num_bytes {
                0 => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "`read` returned 0, signaling end-of-file",
                    ))
                }
                -1 => {
                    let error = io::Error::last_os_error();
                    if error.kind() == io::ErrorKind::WouldBlock {
                        return Ok(());
                    }
                    return Err(error);
                }
                _ => num_bytes as usize,
            };

            let mut pos = 0;
            while pos < num_bytes {
                let (consumed, event, name) = Self::parse_event(&buffer[pos..num_bytes]);
                pos += consumed;

                let mask = EventMask::from_bits_retain(event.mask);
                if mask.contains(EventMask::Q_OVERFLOW) {
                    out.push(SourceEvent {
                        overflow: true,
                        ..SourceEvent::default()
                    });
                    continue;
                }
                if mask.contains(EventMask::IGNORED) {
                    // The watch was removed, by us or by the kernel; any
                    // bookkeeping already happened on the removal path.
                    continue;
                }
                let slot = match self.slot_by_descriptor(event.wd) {
                    Some(slot) => slot,
                    // Watch already removed; late events are meaningless.
                    None => continue,
                };

                let action = if mask.contains(EventMask::CREATE) {
                    FileAction::Create
                } else if mask.contains(EventMask::DELETE) {
                    FileAction::Delete
                } else if mask.contains(EventMask::CLOSE_WRITE) {
                    FileAction::Modify
                } else if mask.contains(EventMask::ATTRIB) {
                    FileAction::Attrib
                } else if mask.contains(EventMask::MOVED_FROM) {
                    FileAction::RenameFrom
                } else if mask.contains(EventMask::MOVED_TO) {
                    FileAction::RenameTo
                } else {
                    warn!("unexpected inotify mask {:#x} for wd {}", event.mask, event.wd);
                    continue;
                };

                out.push(SourceEvent {
                    tag: self.slots[slot].tag,
                    name,
                    is_dir: mask.contains(EventMask::ISDIR),
                    action,
                    rename_cookie: event.cookie,
                    overflow: false,
                });
            }
        }
    }

    fn raw_fd(&self) -> Option<RawFd> {
        Some(self.fd)
    }
}

impl Drop for InotifySource {
    fn drop(&mut self) {
        unsafe {
            ffi::close(self.fd);
        }
    }
}
