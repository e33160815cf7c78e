//! Tokio integration for driving a [`Monitor`].
//!
//! The engine itself is synchronous and scheduler-free; this module
//! supplies the two hooks it needs from a host loop: a poll on the inotify
//! descriptor and a periodic sweeper tick.

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use tokio::io::unix::AsyncFd;
use tokio::io::Interest;

use crate::engine::SWEEP_INTERVAL_MSEC;
use crate::Monitor;

struct SourceFd(RawFd);

impl AsRawFd for SourceFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

/// Runs a started monitor until it stops watching or an I/O error occurs.
///
/// Waits for the watch source's descriptor to become readable, pumps the
/// engine, and fires the open-move sweeper from an interval timer. Both
/// paths run on the calling task, so event delivery and sweeping stay
/// serialized exactly like the synchronous model requires.
///
/// The abort handler is the place to call [`Monitor::stop`]; once the
/// monitor stops watching this function returns.
pub async fn drive(monitor: &mut Monitor) -> io::Result<()> {
    let fd = monitor.source_raw_fd().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::Unsupported,
            "watch source has no pollable descriptor",
        )
    })?;
    let async_fd = AsyncFd::with_interest(SourceFd(fd), Interest::READABLE)?;
    let mut sweep = tokio::time::interval(Duration::from_millis(SWEEP_INTERVAL_MSEC));
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    while monitor.is_watching() {
        tokio::select! {
            guard = async_fd.readable() => {
                let mut guard = guard?;
                monitor.pump()?;
                guard.clear_ready();
            }
            _ = sweep.tick() => {
                monitor.check_open_moves();
            }
        }
    }
    Ok(())
}
