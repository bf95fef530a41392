//! rMAC's radio scheduler loop and `exec_slot`, grounded on
//! `services/radio-mac-simple/radio-scheduler.c`'s `radio_scheduler_task`.
//!
//! [`RadioScheduler::step`] implements spec.md §4.8 steps 1-6 minus the
//! actual sleeping/busy-waiting: it returns a [`Step`] telling the caller
//! what to do (sleep for N µs, busy-wait, or that a slot executed), so the
//! decision logic stays synchronous and unit-testable against a fake clock
//! while the real sleep/busy-wait primitives stay with the host executor.
#![cfg_attr(not(test), no_std)]
#![allow(async_fn_in_trait)]

use embassy_sync::blocking_mutex::raw::RawMutex;
use packet_pool::{Handle, PacketPool};
use slot_queue::{Slot, SlotQueue, SlotType};

/// Threshold below which the scheduler stops sleeping and busy-waits
/// instead (spec.md §4.8 step 4).
pub const SLOT_NEAR_THRESHOLD_US: u64 = 2_000;
/// Upper bound on any single scheduler sleep (spec.md §4.8 step 4).
pub const SLOT_MAX_SLEEP_US: u64 = 10_000;
/// Guard band trimmed off the back of every executed slot (spec.md §4.8
/// step 6).
pub const SLOT_TAIL_US: u32 = 3_000;
/// Minimum remaining slot time required to still bother executing it.
pub const SLOT_MIN_REMAINING_US: u64 = 2_000;
/// Length of the `rx-unmanaged` slot scheduled right after a TX in
/// immediate-RX mode (spec.md §4.8 `exec_slot`).
pub const IMMEDIATE_RX_FOLLOWUP_LEN_US: u32 = 20_000;
/// Start delay and length of the opportunistic `tx-broadcast` slot CSMA
/// mode schedules after a successful RX (spec.md §4.8 `exec_slot`).
pub const CSMA_TX_BROADCAST_DELAY_US: u64 = 10_000;
pub const CSMA_TX_BROADCAST_LEN_US: u32 = 100_000;

pub const RMAC_RADIO_SYNC_SIZE: usize = 4;

/// `{tv_sec, tv_nsec}` from the injected clock (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSpec {
    pub tv_sec: u64,
    pub tv_nsec: u32,
}

impl TimeSpec {
    /// `sec·1e6 + nsec/1000`, spec.md §6.
    pub fn to_monotonic_us(self) -> u64 {
        self.tv_sec * 1_000_000 + (self.tv_nsec as u64) / 1000
    }
}

pub trait Clock {
    fn now(&self) -> TimeSpec;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SendParams {
    pub mcs: u8,
}

/// `params.rssi_dbm` is reported ×10 (deci-dBm), spec.md §6.
#[derive(Debug, Clone, Copy)]
pub struct ReceivedPacket {
    pub len: usize,
    pub rssi_dbm_x10: i16,
}

pub trait Radio {
    type Error: core::fmt::Debug;
    fn set_frequency(&mut self, hz: u64);
    fn set_bit_rate(&mut self, bps: u32);
    fn set_sync(&mut self, bytes: &[u8]);
    fn set_tx_power(&mut self, dbm: i16);
    async fn send(&mut self, buf: &[u8], params: &SendParams) -> Result<(), Self::Error>;
    async fn receive(&mut self, buf: &mut [u8], timeout_us: u64) -> Result<ReceivedPacket, Self::Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioMode {
    ImmediateRx,
    Csma,
}

/// What [`RadioScheduler::exec_slot`] actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecOutcome {
    RxNone,
    RxReceived { handle: Handle, len: usize, rssi_dbm_x10: i16 },
    TxSent,
    TxNoPacket,
    TxFailed,
}

/// What [`RadioScheduler::step`] did, and what the caller should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Nothing queued; caller should sleep briefly and call again.
    EmptyQueue,
    /// Top-of-queue slot had already ended; discarded, packet released.
    Missed,
    /// Caller should sleep at most this many microseconds, then call again.
    SleepUs(u64),
    /// The slot is imminent; caller should busy-wait (recomputing `now`
    /// itself) rather than sleep, then call again.
    BusyWait,
    /// A slot was popped and executed.
    Executed(ExecOutcome),
}

/// Drives one radio through the slot queue. `Rad`/`Clk` are the injected
/// capabilities; the slot queue and packet pool are shared with
/// `rmac-slot-sched`/`rmac-core` and passed by reference into [`Self::step`].
pub struct RadioScheduler<Rad: Radio, Clk: Clock> {
    radio: Rad,
    clock: Clk,
    mode: RadioMode,
    radio_sync: [u8; RMAC_RADIO_SYNC_SIZE],
    ema_start_skew_us: f32,
}

impl<Rad: Radio, Clk: Clock> RadioScheduler<Rad, Clk> {
    pub fn new(radio: Rad, clock: Clk, mode: RadioMode, radio_sync: [u8; RMAC_RADIO_SYNC_SIZE]) -> Self {
        RadioScheduler { radio, clock, mode, radio_sync, ema_start_skew_us: 0.0 }
    }

    /// EMA of `start − now_at_exec`, for diagnostics only (spec.md §4.8).
    pub fn start_skew_ema_us(&self) -> f32 {
        self.ema_start_skew_us
    }

    fn now_us(&self) -> u64 {
        self.clock.now().to_monotonic_us()
    }

    fn update_skew_ema(&mut self, skew_us: f32) {
        self.ema_start_skew_us = (15.0 * self.ema_start_skew_us + skew_us) / 16.0;
    }

    /// One pass of spec.md §4.8's radio scheduler loop, steps 1-6.
    pub async fn step<R: RawMutex, const SLOTS: usize, const POOL_N: usize, const POOL_LEN: usize>(
        &mut self,
        queue: &SlotQueue<R, Handle, SLOTS>,
        pool: &PacketPool<R, POOL_N, POOL_LEN>,
    ) -> Step {
        let Some(slot) = queue.peek().await else {
            return Step::EmptyQueue;
        };
        let now = self.now_us();
        let end = slot.start_us + slot.length_us as u64;

        if end <= now {
            if let Some(popped) = queue.remove().await {
                if let Some(h) = popped.packet {
                    pool.release(h);
                }
            }
            log::warn!("rmac-radio-sched: slot missed, already past its end");
            return Step::Missed;
        }

        if slot.start_us > now && slot.start_us - now > SLOT_NEAR_THRESHOLD_US {
            return Step::SleepUs(core::cmp::min((slot.start_us - now) / 4, SLOT_MAX_SLEEP_US));
        }

        if now < slot.start_us {
            return Step::BusyWait;
        }

        if end - now < SLOT_MIN_REMAINING_US {
            if let Some(popped) = queue.remove().await {
                if let Some(h) = popped.packet {
                    pool.release(h);
                }
            }
            log::warn!("rmac-radio-sched: slot missed, too little time remaining");
            return Step::Missed;
        }

        let Some(mut popped) = queue.remove().await else {
            return Step::EmptyQueue;
        };
        popped.length_us = popped.length_us.saturating_sub(SLOT_TAIL_US);
        self.update_skew_ema((popped.start_us as i64 - now as i64) as f32);

        let outcome = self.exec_slot(&popped, pool, queue).await;
        if let Some(h) = popped.packet {
            pool.release(h);
        }
        Step::Executed(outcome)
    }

    /// Executes one already-popped slot (spec.md §4.8 `exec_slot`).
    async fn exec_slot<R: RawMutex, const SLOTS: usize, const POOL_N: usize, const POOL_LEN: usize>(
        &mut self,
        slot: &Slot<Handle>,
        pool: &PacketPool<R, POOL_N, POOL_LEN>,
        queue: &SlotQueue<R, Handle, SLOTS>,
    ) -> ExecOutcome {
        self.radio.set_sync(&self.radio_sync);

        if slot.kind.is_tx() {
            let Some(handle) = slot.packet else {
                return ExecOutcome::TxNoPacket;
            };
            let mut buf = [0u8; POOL_LEN];
            let n = pool.read(handle, &mut buf).unwrap_or(0);
            let params = SendParams::default();
            match self.radio.send(&buf[..n], &params).await {
                Ok(()) => {
                    if self.mode == RadioMode::ImmediateRx {
                        let now = self.now_us();
                        let _ = queue.insert(Slot::new(now, IMMEDIATE_RX_FOLLOWUP_LEN_US, SlotType::RxUnmanaged, slot.peer_id)).await;
                    }
                    ExecOutcome::TxSent
                }
                Err(_) => {
                    log::warn!("rmac-radio-sched: radio TX failed");
                    ExecOutcome::TxFailed
                }
            }
        } else {
            let mut buf = [0u8; POOL_LEN];
            match self.radio.receive(&mut buf, slot.length_us as u64).await {
                Ok(received) => match pool.get() {
                    Ok(handle) => {
                        let _ = pool.write(handle, &buf[..received.len]);
                        if self.mode == RadioMode::Csma {
                            let now = self.now_us();
                            let _ = queue
                                .insert(Slot::new(now + CSMA_TX_BROADCAST_DELAY_US, CSMA_TX_BROADCAST_LEN_US, SlotType::TxBroadcast, 0))
                                .await;
                        }
                        ExecOutcome::RxReceived { handle, len: received.len, rssi_dbm_x10: received.rssi_dbm_x10 }
                    }
                    Err(_) => ExecOutcome::RxNone,
                },
                Err(_) => ExecOutcome::RxNone,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::Cell;
    use embassy_sync::blocking_mutex::raw::NoopRawMutex;

    struct FakeClock {
        now_us: Cell<u64>,
    }

    impl Clock for &FakeClock {
        fn now(&self) -> TimeSpec {
            let us = self.now_us.get();
            TimeSpec { tv_sec: us / 1_000_000, tv_nsec: ((us % 1_000_000) * 1000) as u32 }
        }
    }

    struct FakeRadio {
        sent: heapless::Vec<heapless::Vec<u8, 64>, 8>,
        reply: Option<(heapless::Vec<u8, 64>, i16)>,
    }

    impl FakeRadio {
        fn new() -> Self {
            FakeRadio { sent: heapless::Vec::new(), reply: None }
        }
    }

    impl Radio for FakeRadio {
        type Error = ();
        fn set_frequency(&mut self, _hz: u64) {}
        fn set_bit_rate(&mut self, _bps: u32) {}
        fn set_sync(&mut self, _bytes: &[u8]) {}
        fn set_tx_power(&mut self, _dbm: i16) {}
        async fn send(&mut self, buf: &[u8], _params: &SendParams) -> Result<(), ()> {
            let _ = self.sent.push(heapless::Vec::from_slice(buf).unwrap());
            Ok(())
        }
        async fn receive(&mut self, buf: &mut [u8], _timeout_us: u64) -> Result<ReceivedPacket, ()> {
            match self.reply.take() {
                Some((data, rssi)) => {
                    buf[..data.len()].copy_from_slice(&data);
                    Ok(ReceivedPacket { len: data.len(), rssi_dbm_x10: rssi })
                }
                None => Err(()),
            }
        }
    }

    fn block_on<F: core::future::Future>(fut: F) -> F::Output {
        use core::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};
        fn noop(_: *const ()) {}
        fn clone(_: *const ()) -> RawWaker {
            RawWaker::new(core::ptr::null(), &VTABLE)
        }
        static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, noop, noop, noop);
        let waker = unsafe { Waker::from_raw(RawWaker::new(core::ptr::null(), &VTABLE)) };
        let mut cx = Context::from_waker(&waker);
        let mut fut = core::pin::pin!(fut);
        loop {
            if let Poll::Ready(v) = fut.as_mut().poll(&mut cx) {
                return v;
            }
        }
    }

    #[test]
    fn scenario_6_slot_miss_discards_and_releases_without_touching_the_radio() {
        let clock = FakeClock { now_us: Cell::new(1_000_000) };
        let queue: SlotQueue<NoopRawMutex, Handle, 4> = SlotQueue::new();
        let pool: PacketPool<NoopRawMutex, 2, 16> = PacketPool::new();
        let handle = pool.get().unwrap();

        block_on(queue.insert(Slot { packet: Some(handle), ..Slot::new(1_000_000, 100_000, SlotType::RxUnicast, 7) }));

        clock.now_us.set(1_100_001);
        let mut sched = RadioScheduler::new(FakeRadio::new(), &clock, RadioMode::Csma, [0u8; RMAC_RADIO_SYNC_SIZE]);
        let step = block_on(sched.step(&queue, &pool));

        assert_eq!(step, Step::Missed);
        assert!(!pool.is_used(handle));
        assert_eq!(block_on(queue.len()), 0);
        assert!(sched.radio.sent.is_empty());
    }

    #[test]
    fn far_future_slot_yields_a_bounded_sleep() {
        let clock = FakeClock { now_us: Cell::new(0) };
        let queue: SlotQueue<NoopRawMutex, Handle, 4> = SlotQueue::new();
        let pool: PacketPool<NoopRawMutex, 2, 16> = PacketPool::new();
        block_on(queue.insert(Slot::new(1_000_000, 1_000, SlotType::RxSearch, 0)));
        let mut sched = RadioScheduler::new(FakeRadio::new(), &clock, RadioMode::ImmediateRx, [0u8; RMAC_RADIO_SYNC_SIZE]);
        match block_on(sched.step(&queue, &pool)) {
            Step::SleepUs(us) => assert_eq!(us, SLOT_MAX_SLEEP_US),
            other => panic!("expected SleepUs, got {other:?}"),
        }
    }

    #[test]
    fn tx_slot_executes_and_releases_its_packet() {
        let clock = FakeClock { now_us: Cell::new(1_000) };
        let queue: SlotQueue<NoopRawMutex, Handle, 4> = SlotQueue::new();
        let pool: PacketPool<NoopRawMutex, 2, 16> = PacketPool::new();
        let handle = pool.get().unwrap();
        pool.write(handle, b"hello").unwrap();
        block_on(queue.insert(Slot { packet: Some(handle), ..Slot::new(1_000, 10_000, SlotType::TxBroadcast, 0) }));

        let mut sched = RadioScheduler::new(FakeRadio::new(), &clock, RadioMode::ImmediateRx, [0u8; RMAC_RADIO_SYNC_SIZE]);
        let step = block_on(sched.step(&queue, &pool));
        assert_eq!(step, Step::Executed(ExecOutcome::TxSent));
        assert!(!pool.is_used(handle));
        assert_eq!(sched.radio.sent.len(), 1);
        assert_eq!(sched.radio.sent[0].as_slice(), b"hello");
        // immediate-RX mode schedules a follow-up rx-unmanaged slot
        assert_eq!(block_on(queue.len()), 1);
    }

    #[test]
    fn rx_slot_with_no_data_yields_rx_none_without_touching_the_pool() {
        let clock = FakeClock { now_us: Cell::new(1_000) };
        let queue: SlotQueue<NoopRawMutex, Handle, 4> = SlotQueue::new();
        let pool: PacketPool<NoopRawMutex, 2, 16> = PacketPool::new();
        block_on(queue.insert(Slot::new(1_000, 10_000, SlotType::RxSearch, 0)));
        let mut sched = RadioScheduler::new(FakeRadio::new(), &clock, RadioMode::Csma, [0u8; RMAC_RADIO_SYNC_SIZE]);
        let step = block_on(sched.step(&queue, &pool));
        assert_eq!(step, Step::Executed(ExecOutcome::RxNone));
        assert_eq!(pool.free_count(), 2);
    }
}
