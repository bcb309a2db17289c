//! Shared hardware window pool
//!
//! The pool owns the set of windows that no output has reserved. It is the
//! only structure shared by every output, so its lock is held just long
//! enough to scan and flip bits, never across I/O or waits.
//!
//! # Usage
//!
//! ```
//! use overlay_commit::mask::WindowMask;
//! use overlay_commit::window_pool::WindowPool;
//!
//! let pool = WindowPool::new(8);
//! let windows = pool.try_acquire(2, WindowMask::EMPTY).unwrap();
//! assert_eq!(windows.bits(), 0b11);
//! pool.release(windows);
//! assert_eq!(pool.available(), WindowMask::full(8));
//! ```

use crate::mask::{WindowMask, MAX_WINDOWS};
use log::{debug, error, trace};
use parking_lot::Mutex;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;

/// Counters describing pool activity since creation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Successful `try_acquire` calls that handed out at least one window
    pub acquisitions: u64,
    /// `try_acquire` calls that found too few windows
    pub failures: u64,
    /// `release` calls
    pub releases: u64,
    /// Total windows handed out
    pub windows_acquired: u64,
    /// Total windows returned
    pub windows_released: u64,
    /// Lowest number of free windows ever observed
    pub low_water: u32,
}

impl PoolStats {
    /// Percentage of acquire calls that failed
    pub fn failure_rate(&self) -> f32 {
        let total = self.acquisitions + self.failures;
        if total == 0 {
            return 0.0;
        }
        (self.failures as f32 / total as f32) * 100.0
    }
}

#[derive(Debug)]
struct PoolInner {
    available: WindowMask,
    stats: PoolStats,
}

/// Fixed pool of hardware windows shared across outputs
#[derive(Debug)]
pub struct WindowPool {
    capacity: u8,
    inner: Mutex<PoolInner>,
    /// Woken whenever windows return to the pool
    released: Notify,
}

impl WindowPool {
    /// Creates a pool with `capacity` windows, all available
    pub fn new(capacity: u8) -> Self {
        let capacity = capacity.min(MAX_WINDOWS);
        debug!("🪟 Window pool created with {} windows", capacity);
        Self {
            capacity,
            inner: Mutex::new(PoolInner {
                available: WindowMask::full(capacity),
                stats: PoolStats {
                    low_water: capacity as u32,
                    ..PoolStats::default()
                },
            }),
            released: Notify::new(),
        }
    }

    pub fn capacity(&self) -> u8 {
        self.capacity
    }

    /// Every window the pool manages
    pub fn universe(&self) -> WindowMask {
        WindowMask::full(self.capacity)
    }

    /// Snapshot of the currently free windows
    pub fn available(&self) -> WindowMask {
        self.inner.lock().available
    }

    pub fn stats(&self) -> PoolStats {
        self.inner.lock().stats.clone()
    }

    /// Takes `count` free windows out of the pool.
    ///
    /// Windows outside `hint` are preferred, lowest index first; `hint` is
    /// the caller's current reservation. Returns `None` without touching the
    /// pool when fewer than `count` windows are free.
    pub fn try_acquire(&self, count: u32, hint: WindowMask) -> Option<WindowMask> {
        if count == 0 {
            return Some(WindowMask::EMPTY);
        }

        let mut inner = self.inner.lock();
        let available = inner.available;

        if available.count() < count {
            inner.stats.failures += 1;
            trace!(
                "Pool acquire of {} failed, only {} free ({})",
                count,
                available.count(),
                available
            );
            return None;
        }

        let preferred = available - hint;
        let picked = match preferred.take_lowest(count) {
            Some(picked) => picked,
            None => {
                let rest = (available & hint).take_lowest(count - preferred.count())?;
                preferred | rest
            }
        };

        inner.available = available - picked;
        inner.stats.acquisitions += 1;
        inner.stats.windows_acquired += count as u64;
        inner.stats.low_water = inner.stats.low_water.min(inner.available.count());

        trace!("Pool acquired {} -> {} free", picked, inner.available);
        Some(picked)
    }

    /// Returns windows to the pool and wakes anyone waiting on a release.
    ///
    /// Releasing a window that is already free is a caller bug.
    pub fn release(&self, mask: WindowMask) {
        if mask.is_empty() {
            return;
        }

        {
            let mut inner = self.inner.lock();
            let overlap = inner.available & mask;
            debug_assert!(overlap.is_empty(), "double release of windows {}", overlap);
            if !overlap.is_empty() {
                error!("❌ Double release of windows {} ignored", overlap);
            }

            let outside = mask - self.universe();
            debug_assert!(outside.is_empty(), "release of foreign windows {}", outside);

            let returned = mask & self.universe() & !inner.available;
            inner.available |= returned;
            inner.stats.releases += 1;
            inner.stats.windows_released += returned.count() as u64;
            trace!("Pool released {} -> {} free", returned, inner.available);
        }

        self.released.notify_waiters();
    }

    /// Future resolving on the next `release`.
    ///
    /// Call [`Notified::enable`] before checking the condition being waited
    /// for, so a release racing with the check is not missed.
    pub fn released(&self) -> Notified<'_> {
        self.released.notified()
    }
}
