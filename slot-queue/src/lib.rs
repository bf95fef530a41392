//! rMAC's slot priority queue: a binary min-heap over `start_us`, grounded on
//! `services/radio-mac-simple/radio-scheduler.c`'s `slot_queue_*` family.
//! Generic over the packet handle type `P` so this crate does not need to
//! depend on `packet-pool` — `rmac-core` wires the two together.
#![cfg_attr(not(test), no_std)]

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::mutex::Mutex;
use embassy_sync::signal::Signal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotType {
    RxSearch,
    RxUnmanaged,
    RxUnicast,
    TxBroadcast,
    TxControl,
    TxUnicast,
}

impl SlotType {
    pub const fn is_tx(self) -> bool {
        matches!(self, SlotType::TxBroadcast | SlotType::TxControl | SlotType::TxUnicast)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Slot<P> {
    pub start_us: u64,
    pub length_us: u32,
    pub kind: SlotType,
    pub peer_id: u32,
    pub packet: Option<P>,
}

impl<P> Slot<P> {
    pub fn new(start_us: u64, length_us: u32, kind: SlotType, peer_id: u32) -> Self {
        Slot { start_us, length_us, kind, peer_id, packet: None }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    Full,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::Full => write!(f, "slot queue is at capacity"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

/// Array-backed binary min-heap on `Slot::start_us`. `N` is the fixed
/// capacity; no allocator is used.
pub struct SlotHeap<P, const N: usize> {
    items: heapless::Vec<Slot<P>, N>,
}

impl<P, const N: usize> Default for SlotHeap<P, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P, const N: usize> SlotHeap<P, N> {
    pub const fn new() -> Self {
        SlotHeap { items: heapless::Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn insert(&mut self, slot: Slot<P>) -> Result<(), Error> {
        self.items.push(slot).map_err(|_| Error::Full)?;
        self.sift_up(self.items.len() - 1);
        Ok(())
    }

    pub fn peek(&self) -> Option<&Slot<P>> {
        self.items.first()
    }

    /// Pop the slot with the smallest `start_us`.
    pub fn remove(&mut self) -> Option<Slot<P>> {
        if self.items.is_empty() {
            return None;
        }
        let last = self.items.len() - 1;
        self.items.swap(0, last);
        let top = self.items.pop();
        if !self.items.is_empty() {
            self.sift_down(0);
        }
        top
    }

    /// Attach `packet` to the queued slot with the smallest `start_us` among
    /// those of kind `kind` that do not already carry a packet. Returns
    /// `false` (and keeps `packet`) if no such slot exists.
    pub fn attach_packet(&mut self, kind: SlotType, packet: P) -> Result<(), P> {
        let target = self
            .items
            .iter()
            .enumerate()
            .filter(|(_, s)| s.kind == kind && s.packet.is_none())
            .min_by_key(|(_, s)| s.start_us)
            .map(|(i, _)| i);
        match target {
            Some(i) => {
                self.items[i].packet = Some(packet);
                Ok(())
            }
            None => Err(packet),
        }
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.items[i].start_us < self.items[parent].start_us {
                self.items.swap(i, parent);
                i = parent;
            } else {
                break;
            }
        }
    }

    fn sift_down(&mut self, mut i: usize) {
        let len = self.items.len();
        loop {
            let left = 2 * i + 1;
            let right = 2 * i + 2;
            let mut smallest = i;
            if left < len && self.items[left].start_us < self.items[smallest].start_us {
                smallest = left;
            }
            if right < len && self.items[right].start_us < self.items[smallest].start_us {
                smallest = right;
            }
            if smallest == i {
                break;
            }
            self.items.swap(i, smallest);
            i = smallest;
        }
    }

    /// `true` iff the backing array satisfies the min-heap property. Used by
    /// tests, not the runtime path.
    pub fn is_valid_heap(&self) -> bool {
        for i in 0..self.items.len() {
            let left = 2 * i + 1;
            let right = 2 * i + 2;
            if left < self.items.len() && self.items[left].start_us < self.items[i].start_us {
                return false;
            }
            if right < self.items.len() && self.items[right].start_us < self.items[i].start_us {
                return false;
            }
        }
        true
    }
}

/// The async-facing slot queue: a mutex-guarded [`SlotHeap`] plus a
/// `tx_available` signal raised whenever a TX-typed slot is inserted, so
/// the TX-process task can wait for one to exist (spec.md §5).
pub struct SlotQueue<R: RawMutex, P, const N: usize> {
    heap: Mutex<R, SlotHeap<P, N>>,
    tx_available: Signal<R, ()>,
}

impl<R: RawMutex, P, const N: usize> Default for SlotQueue<R, P, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: RawMutex, P, const N: usize> SlotQueue<R, P, N> {
    pub fn new() -> Self {
        SlotQueue { heap: Mutex::new(SlotHeap::new()), tx_available: Signal::new() }
    }

    pub async fn insert(&self, slot: Slot<P>) -> Result<(), Error> {
        let is_tx = slot.kind.is_tx();
        let mut heap = self.heap.lock().await;
        heap.insert(slot)?;
        drop(heap);
        if is_tx {
            self.tx_available.signal(());
        }
        Ok(())
    }

    pub async fn peek_start_us(&self) -> Option<u64> {
        self.heap.lock().await.peek().map(|s| s.start_us)
    }

    /// A copy of the top-of-queue slot (smallest `start_us`), without
    /// removing it. The radio scheduler needs more than just `start_us` to
    /// decide whether a peeked slot has already been missed (spec.md §4.8
    /// step 3 needs `start_us + length_us`).
    pub async fn peek(&self) -> Option<Slot<P>>
    where
        P: Clone,
    {
        self.heap.lock().await.peek().cloned()
    }

    pub async fn remove(&self) -> Option<Slot<P>> {
        self.heap.lock().await.remove()
    }

    pub async fn attach_packet(&self, kind: SlotType, packet: P) -> Result<(), P> {
        self.heap.lock().await.attach_packet(kind, packet)
    }

    /// Wait until at least one TX slot has been inserted since the last
    /// call. Does not guarantee one is still present (it may have been
    /// consumed by `remove` in the interim); callers retry.
    pub async fn wait_tx_available(&self) {
        self.tx_available.wait().await;
    }

    pub async fn len(&self) -> usize {
        self.heap.lock().await.len()
    }
}
