//! Bounded, preallocated packet-object pool, grounded on the `pkt_pool_*`
//! family in `services/radio-mac-simple/radio-scheduler.c`. No allocator:
//! `N` fixed-size buffers of `LEN` bytes each live inline in the struct,
//! guarded by a short blocking critical section (never held across an
//! `await`, per spec.md §5's "does not block" note on `get`).
#![cfg_attr(not(test), no_std)]

use core::cell::RefCell;
use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// No free slot was available; the caller is expected to retry after a
    /// short sleep (spec.md §5) rather than treat this as fatal.
    Exhausted,
    /// `handle` does not index a slot of this pool.
    BadHandle,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::Exhausted => write!(f, "packet pool exhausted"),
            Error::BadHandle => write!(f, "packet pool handle out of range"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

struct PoolSlot<const LEN: usize> {
    used: bool,
    len: usize,
    buf: [u8; LEN],
}

impl<const LEN: usize> PoolSlot<LEN> {
    const fn new() -> Self {
        PoolSlot { used: false, len: 0, buf: [0u8; LEN] }
    }
}

/// An index into a [`PacketPool`]. Opaque to callers besides `release`;
/// carries no borrow of the pool so it can travel through `slot-queue`'s
/// `Slot<P>` and across task boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handle(usize);

struct Pool<const N: usize, const LEN: usize> {
    slots: [PoolSlot<LEN>; N],
}

pub struct PacketPool<R: RawMutex, const N: usize, const LEN: usize> {
    inner: Mutex<R, RefCell<Pool<N, LEN>>>,
}

impl<R: RawMutex, const N: usize, const LEN: usize> Default for PacketPool<R, N, LEN> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: RawMutex, const N: usize, const LEN: usize> PacketPool<R, N, LEN> {
    pub fn new() -> Self {
        PacketPool {
            inner: Mutex::new(RefCell::new(Pool { slots: core::array::from_fn(|_| PoolSlot::new()) })),
        }
    }

    /// Claim the first free slot. Does not block; the caller retries with a
    /// short sleep on [`Error::Exhausted`] (spec.md §5).
    pub fn get(&self) -> Result<Handle, Error> {
        self.inner.lock(|cell| {
            let mut pool = cell.borrow_mut();
            let free = pool.slots.iter().position(|s| !s.used).ok_or(Error::Exhausted)?;
            pool.slots[free].used = true;
            pool.slots[free].len = 0;
            Ok(Handle(free))
        })
    }

    /// Release a handle. A no-op if already free, matching the original's
    /// idempotent-release convention.
    pub fn release(&self, handle: Handle) {
        self.inner.lock(|cell| {
            if let Some(slot) = cell.borrow_mut().slots.get_mut(handle.0) {
                slot.used = false;
                slot.len = 0;
            }
        });
    }

    /// Write `data` into the slot's buffer (truncated to `LEN`).
    pub fn write(&self, handle: Handle, data: &[u8]) -> Result<(), Error> {
        self.inner.lock(|cell| {
            let mut pool = cell.borrow_mut();
            let slot = pool.slots.get_mut(handle.0).ok_or(Error::BadHandle)?;
            let n = core::cmp::min(data.len(), LEN);
            slot.buf[..n].copy_from_slice(&data[..n]);
            slot.len = n;
            Ok(())
        })
    }

    /// Copy the slot's current contents into `out`, returning the number of
    /// bytes copied.
    pub fn read(&self, handle: Handle, out: &mut [u8]) -> Result<usize, Error> {
        self.inner.lock(|cell| {
            let pool = cell.borrow();
            let slot = pool.slots.get(handle.0).ok_or(Error::BadHandle)?;
            let n = core::cmp::min(slot.len, out.len());
            out[..n].copy_from_slice(&slot.buf[..n]);
            Ok(n)
        })
    }

    pub fn len_of(&self, handle: Handle) -> Result<usize, Error> {
        self.inner.lock(|cell| cell.borrow().slots.get(handle.0).map(|s| s.len).ok_or(Error::BadHandle))
    }

    pub fn is_used(&self, handle: Handle) -> bool {
        self.inner.lock(|cell| cell.borrow().slots.get(handle.0).map(|s| s.used).unwrap_or(false))
    }

    pub fn free_count(&self) -> usize {
        self.inner.lock(|cell| cell.borrow().slots.iter().filter(|s| !s.used).count())
    }

    pub const fn capacity(&self) -> usize {
        N
    }
}
