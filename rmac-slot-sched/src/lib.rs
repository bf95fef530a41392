//! Fills the rMAC slot queue according to the selected TDMA algorithm,
//! grounded on `services/radio-mac-simple/radio-scheduler.c`'s
//! `slot_scheduler_task`.
#![cfg_attr(not(test), no_std)]

use embassy_sync::blocking_mutex::raw::RawMutex;
use rmac_radio_sched::{CSMA_TX_BROADCAST_LEN_US, IMMEDIATE_RX_FOLLOWUP_LEN_US};
use slot_queue::{Slot, SlotQueue, SlotType};

/// Slot-scheduler task period (spec.md §4.8).
pub const SLOT_SCHED_PERIOD_US: u64 = 100_000;
/// Spacing between slots the task inserts in one pass.
pub const SLOT_SCHED_SPACING_US: u64 = 200_000;
/// How many slots to keep queued in immediate-RX mode.
pub const SLOT_SCHED_IMMEDIATE_RX_FILL: usize = 5;
/// How many slots to keep queued in CSMA mode.
pub const SLOT_SCHED_CSMA_FILL: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TdmaAlgo {
    ImmediateRx,
    Csma,
    /// Declared, not implemented (spec.md §4.8, §9 Open Questions): every
    /// call into [`SlotScheduler::fill`] returns [`SlotSchedError::Unsupported`].
    Hash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum SlotSchedError {
    Unsupported,
    QueueFull,
}

impl core::fmt::Display for SlotSchedError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            SlotSchedError::Unsupported => write!(f, "hash TDMA is not implemented"),
            SlotSchedError::QueueFull => write!(f, "slot queue is at capacity"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for SlotSchedError {}

impl TdmaAlgo {
    fn default_slot_type(self) -> Option<SlotType> {
        match self {
            TdmaAlgo::ImmediateRx => Some(SlotType::TxBroadcast),
            TdmaAlgo::Csma => Some(SlotType::RxUnmanaged),
            TdmaAlgo::Hash => None,
        }
    }

    fn default_length_us(self) -> u32 {
        match self {
            TdmaAlgo::ImmediateRx => CSMA_TX_BROADCAST_LEN_US,
            TdmaAlgo::Csma => IMMEDIATE_RX_FOLLOWUP_LEN_US,
            TdmaAlgo::Hash => 0,
        }
    }

    fn fill_count(self) -> usize {
        match self {
            TdmaAlgo::ImmediateRx => SLOT_SCHED_IMMEDIATE_RX_FILL,
            TdmaAlgo::Csma => SLOT_SCHED_CSMA_FILL,
            TdmaAlgo::Hash => 0,
        }
    }
}

/// One pass of the slot-scheduler task: tops the queue up to its
/// algorithm-specific fill count with slots spaced [`SLOT_SCHED_SPACING_US`]
/// apart, starting at `now_us`.
pub struct SlotScheduler {
    algo: TdmaAlgo,
}

impl SlotScheduler {
    pub fn new(algo: TdmaAlgo) -> Self {
        SlotScheduler { algo }
    }

    pub fn algo(&self) -> TdmaAlgo {
        self.algo
    }

    /// Inserts slots until the queue holds at least `fill_count()` entries
    /// of the algorithm's default type, or the queue is full. `existing`
    /// is the number of already-queued slots of that type (the caller
    /// tracks this; spec.md leaves inspection of slot *kind* counts outside
    /// the queue's own API).
    pub async fn fill<R: RawMutex, P, const N: usize>(
        &self,
        queue: &SlotQueue<R, P, N>,
        now_us: u64,
        existing: usize,
    ) -> Result<usize, SlotSchedError> {
        let Some(kind) = self.algo.default_slot_type() else {
            return Err(SlotSchedError::Unsupported);
        };
        let target = self.algo.fill_count();
        let mut inserted = 0;
        for i in existing..target {
            let start = now_us + (i as u64) * SLOT_SCHED_SPACING_US;
            queue
                .insert(Slot::new(start, self.algo.default_length_us(), kind, 0))
                .await
                .map_err(|_| SlotSchedError::QueueFull)?;
            inserted += 1;
        }
        Ok(inserted)
    }
}
