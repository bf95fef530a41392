//! rMAC orchestration: configuration, neighbor-table wiring, the upward
//! `MacHost` binding, and the RX/TX process tasks. Grounded on
//! `services/radio-mac-simple/radio-scheduler.c`'s `rx_process_task`/
//! `tx_process_task` and on the teacher's `RpcClient` for the
//! constructor/setter shape of a single orchestrating struct generic over
//! an injected capability.
#![cfg_attr(not(test), no_std)]
#![allow(async_fn_in_trait)]

use core::cell::{Cell, RefCell};
use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::mutex::Mutex;
use nbtable::NbTable;
use packet_pool::{Handle, PacketPool};
use slot_queue::{SlotQueue, SlotType};

pub use rmac_slot_sched::TdmaAlgo;

/// Maximum application payload carried in one `TxMessage`/`RxMessage`. Must
/// leave room, inside the packet pool's per-slot buffer, for
/// [`TAGGED_RECORD_HEADER_LEN`] bytes of header plus [`RMAC_SIV_LEN`] bytes
/// of SIV tag.
pub const RMAC_MAX_PAYLOAD: usize = 400;

/// `source(4) | destination(4) | context(1) | counter(1) | time(4)`,
/// big-endian fixed fields followed by the variable-length `data`. spec.md
/// §4.8 names the fields (`source, destination, context, counter, time,
/// data`) but gives no bit-exact layout; this is this implementation's
/// wire-layout decision (see DESIGN.md).
pub const TAGGED_RECORD_HEADER_LEN: usize = 14;

/// rMAC seals tagged records with the 16-byte SIV parameterization of
/// `pbuf` (NBUS uses the 8-byte one; spec.md §9 Open Question, resolved in
/// DESIGN.md).
pub const RMAC_SIV_LEN: usize = 16;

/// Largest `universe_key` [`RmacCore::new`] accepts (spec.md §6
/// "Configuration knobs").
pub const RMAC_UNIVERSE_KEY_MAX: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    TooBig,
    Malformed,
    Unauthenticated,
    PoolExhausted,
    NoMatchingSlot,
    /// `universe_key` passed to [`RmacCore::new`] exceeds [`RMAC_UNIVERSE_KEY_MAX`].
    KeyTooLong,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::TooBig => write!(f, "record too large for the packet pool buffer"),
            Error::Malformed => write!(f, "record shorter than the tagged-record header"),
            Error::Unauthenticated => write!(f, "record failed SIV authentication"),
            Error::PoolExhausted => write!(f, "packet pool has no free slot"),
            Error::NoMatchingSlot => write!(f, "no queued TX slot of the requested type"),
            Error::KeyTooLong => write!(f, "universe key exceeds RMAC_UNIVERSE_KEY_MAX"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

/// A decoded rMAC tagged record. Borrows `data` from the caller's buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaggedRecord<'a> {
    pub source: u32,
    pub destination: u32,
    pub context: u8,
    pub counter: u8,
    pub time_s: u32,
    pub data: &'a [u8],
}

impl<'a> TaggedRecord<'a> {
    pub fn encode(&self, out: &mut [u8]) -> Result<usize, Error> {
        let total = TAGGED_RECORD_HEADER_LEN + self.data.len();
        if out.len() < total {
            return Err(Error::TooBig);
        }
        out[0..4].copy_from_slice(&self.source.to_be_bytes());
        out[4..8].copy_from_slice(&self.destination.to_be_bytes());
        out[8] = self.context;
        out[9] = self.counter;
        out[10..14].copy_from_slice(&self.time_s.to_be_bytes());
        out[TAGGED_RECORD_HEADER_LEN..total].copy_from_slice(self.data);
        Ok(total)
    }

    pub fn decode(buf: &'a [u8]) -> Result<TaggedRecord<'a>, Error> {
        if buf.len() < TAGGED_RECORD_HEADER_LEN {
            return Err(Error::Malformed);
        }
        Ok(TaggedRecord {
            source: u32::from_be_bytes(buf[0..4].try_into().unwrap()),
            destination: u32::from_be_bytes(buf[4..8].try_into().unwrap()),
            context: buf[8],
            counter: buf[9],
            time_s: u32::from_be_bytes(buf[10..14].try_into().unwrap()),
            data: &buf[TAGGED_RECORD_HEADER_LEN..],
        })
    }
}

/// A packet the upper layer wants transmitted (spec.md §6 "MAC host").
#[derive(Debug, Clone)]
pub struct TxMessage {
    pub destination: u32,
    pub context: u8,
    /// Which TX slot type to attach this packet to.
    pub slot_kind: SlotType,
    pub data: heapless::Vec<u8, RMAC_MAX_PAYLOAD>,
}

/// A packet delivered up to the application (spec.md §6 "MAC host").
#[derive(Debug, Clone)]
pub struct RxMessage {
    pub source: u32,
    pub data: heapless::Vec<u8, RMAC_MAX_PAYLOAD>,
}

/// The upward interface: the application side of rMAC.
pub trait MacHost {
    async fn get_packet_to_send(&mut self) -> TxMessage;
    async fn put_received_packet(&mut self, msg: &RxMessage, context: u8);
}

/// Orchestrates rMAC: owns the neighbor table, packet pool, slot queue and
/// the upward `MacHost` binding; runs the RX/TX process tasks (spec.md
/// §4.8). The radio scheduler and slot-filling scheduler are constructed
/// separately (they own the injected `Radio`/`Clock`) and operate on the
/// [`SlotQueue`]/[`PacketPool`] this type exposes via [`Self::queue`]/
/// [`Self::pool`].
pub struct RmacCore<H: MacHost, RM: RawMutex, const NB: usize, const POOL_N: usize, const POOL_LEN: usize, const SLOTS: usize> {
    node_id: u32,
    keys: pbuf::Keys,
    tdma: BlockingMutex<RM, Cell<TdmaAlgo>>,
    tx_counter: BlockingMutex<RM, Cell<u8>>,
    neighbors: BlockingMutex<RM, RefCell<NbTable<NB>>>,
    host: Mutex<RM, H>,
    queue: SlotQueue<RM, Handle, SLOTS>,
    pool: PacketPool<RM, POOL_N, POOL_LEN>,
}

impl<H, RM, const NB: usize, const POOL_N: usize, const POOL_LEN: usize, const SLOTS: usize> RmacCore<H, RM, NB, POOL_N, POOL_LEN, SLOTS>
where
    H: MacHost,
    RM: RawMutex,
{
    pub fn new(node_id: u32, universe_key: &[u8], tdma: TdmaAlgo, host: H) -> Result<Self, Error> {
        if universe_key.len() > RMAC_UNIVERSE_KEY_MAX {
            return Err(Error::KeyTooLong);
        }
        Ok(RmacCore {
            node_id,
            keys: pbuf::derive_keys(universe_key),
            tdma: BlockingMutex::new(Cell::new(tdma)),
            tx_counter: BlockingMutex::new(Cell::new(0)),
            neighbors: BlockingMutex::new(RefCell::new(NbTable::new())),
            host: Mutex::new(host),
            queue: SlotQueue::new(),
            pool: PacketPool::new(),
        })
    }

    pub fn node_id(&self) -> u32 {
        self.node_id
    }

    pub fn queue(&self) -> &SlotQueue<RM, Handle, SLOTS> {
        &self.queue
    }

    pub fn pool(&self) -> &PacketPool<RM, POOL_N, POOL_LEN> {
        &self.pool
    }

    pub fn tdma_algo(&self) -> TdmaAlgo {
        self.tdma.lock(|c| c.get())
    }

    pub fn set_tdma_algo(&self, algo: TdmaAlgo) {
        self.tdma.lock(|c| c.set(algo));
    }

    pub fn neighbor_rssi_dbm(&self, id: u32) -> Option<f32> {
        self.neighbors.lock(|cell| cell.borrow().get(id).map(|n| n.rssi_dbm_ema))
    }

    fn next_tx_counter(&self) -> u8 {
        self.tx_counter.lock(|c| {
            let cur = c.get();
            c.set(cur.wrapping_add(1));
            cur
        })
    }

    /// RX-process task body (spec.md §4.8): authenticate, decode, update the
    /// neighbor table, and — if addressed to us or broadcast — hand the
    /// payload up to the `MacHost`. `handle` holds the raw (sealed) bytes as
    /// written by the radio scheduler; this call always releases it.
    pub async fn rx_process(&self, handle: Handle, rssi_dbm_x10: i16) -> Result<(), Error> {
        let raw_len = self.pool.len_of(handle).map_err(|_| Error::Malformed)?;
        let mut raw = [0u8; POOL_LEN];
        let _ = self.pool.read(handle, &mut raw);
        self.pool.release(handle);

        let mut plain = [0u8; POOL_LEN];
        let n = match pbuf::open(&self.keys, RMAC_SIV_LEN, &raw[..raw_len], &mut plain) {
            Ok(n) => n,
            Err(_) => {
                log::warn!("rmac: rx record failed SIV authentication");
                return Err(Error::Unauthenticated);
            }
        };
        let record = match TaggedRecord::decode(&plain[..n]) {
            Ok(r) => r,
            Err(e) => {
                log::warn!("rmac: rx record malformed");
                return Err(e);
            }
        };

        self.neighbors.lock(|cell| {
            let mut table = cell.borrow_mut();
            if let Some(entry) = table.find_or_add_id(record.source) {
                NbTable::<NB>::update_rx_counter(entry, record.counter, record.data.len() as u32);
                NbTable::<NB>::update_rssi(entry, rssi_dbm_x10 as f32 / 10.0);
            } else {
                log::debug!("rmac: neighbor table full, dropping entry for {}", record.source);
            }
        });

        if record.destination == 0 || record.destination == self.node_id {
            let mut data = heapless::Vec::new();
            let _ = data.extend_from_slice(record.data);
            let msg = RxMessage { source: record.source, data };
            let mut host = self.host.lock().await;
            host.put_received_packet(&msg, record.context).await;
        }
        Ok(())
    }

    /// TX-process task body (spec.md §4.8): one iteration blocks on the
    /// `MacHost` for a packet to send, then attaches it to the earliest
    /// matching-type queued TX slot, sealing it as a tagged record.
    pub async fn tx_process_once(&self) -> Result<(), Error> {
        let tx = {
            let mut host = self.host.lock().await;
            host.get_packet_to_send().await
        };

        let handle = self.pool.get().map_err(|_| {
            log::warn!("rmac: packet pool exhausted, dropping outgoing packet");
            Error::PoolExhausted
        })?;

        let counter = self.next_tx_counter();
        let record = TaggedRecord { source: self.node_id, destination: tx.destination, context: tx.context, counter, time_s: 0, data: &tx.data };
        let mut plain = [0u8; POOL_LEN];
        let plain_len = match record.encode(&mut plain) {
            Ok(n) => n,
            Err(e) => {
                self.pool.release(handle);
                return Err(e);
            }
        };
        let mut sealed = [0u8; POOL_LEN];
        let sealed_len = match pbuf::seal(&self.keys, RMAC_SIV_LEN, &plain[..plain_len], &mut sealed) {
            Ok(n) => n,
            Err(_) => {
                self.pool.release(handle);
                return Err(Error::TooBig);
            }
        };
        let _ = self.pool.write(handle, &sealed[..sealed_len]);

        loop {
            match self.queue.attach_packet(tx.slot_kind, handle).await {
                Ok(()) => return Ok(()),
                Err(returned) => {
                    // no queued slot of this type yet; wait for the slot
                    // scheduler to add one and retry.
                    let _ = returned;
                    self.queue.wait_tx_available().await;
                }
            }
        }
    }

    /// Runs [`Self::tx_process_once`] forever.
    pub async fn tx_process_task(&self) -> ! {
        loop {
            let _ = self.tx_process_once().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embassy_sync::blocking_mutex::raw::NoopRawMutex;

    #[test]
    fn tagged_record_roundtrips() {
        let mut buf = [0u8; 64];
        let rec = TaggedRecord { source: 7, destination: 0, context: 2, counter: 200, time_s: 99, data: b"payload" };
        let n = rec.encode(&mut buf).unwrap();
        let decoded = TaggedRecord::decode(&buf[..n]).unwrap();
        assert_eq!(decoded, rec);
    }

    #[test]
    fn decode_rejects_truncated_header() {
        assert_eq!(TaggedRecord::decode(&[0u8; 4]), Err(Error::Malformed));
    }

    struct NullHost;
    impl MacHost for NullHost {
        async fn get_packet_to_send(&mut self) -> TxMessage {
            core::future::pending::<()>().await;
            unreachable!()
        }
        async fn put_received_packet(&mut self, _msg: &RxMessage, _context: u8) {}
    }

    type TestCore = RmacCore<NullHost, NoopRawMutex, 4, 4, 64, 4>;

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
    fn rx_process_updates_neighbor_table_and_releases_the_handle() {
        let core: TestCore = RmacCore::new(1, b"0123456789abcdef", TdmaAlgo::Csma, NullHost).unwrap();
        let rec = TaggedRecord { source: 42, destination: 1, context: 0, counter: 5, time_s: 0, data: b"hi" };
        let mut plain = [0u8; 32];
        let n = rec.encode(&mut plain).unwrap();
        let mut sealed = [0u8; 64];
        let m = pbuf::seal(&core.keys, RMAC_SIV_LEN, &plain[..n], &mut sealed).unwrap();
        let handle = core.pool.get().unwrap();
        core.pool.write(handle, &sealed[..m]).unwrap();

        let result = block_on(core.rx_process(handle, -450));
        assert!(result.is_ok());
        assert!(!core.pool.is_used(handle));
        assert!(core.neighbor_rssi_dbm(42).is_some());
    }

    #[test]
    fn rx_process_rejects_tampered_records() {
        let core: TestCore = RmacCore::new(1, b"0123456789abcdef", TdmaAlgo::Csma, NullHost).unwrap();
        let rec = TaggedRecord { source: 42, destination: 1, context: 0, counter: 5, time_s: 0, data: b"hi" };
        let mut plain = [0u8; 32];
        let n = rec.encode(&mut plain).unwrap();
        let mut sealed = [0u8; 64];
        let m = pbuf::seal(&core.keys, RMAC_SIV_LEN, &plain[..n], &mut sealed).unwrap();
        sealed[0] ^= 0x01;
        let handle = core.pool.get().unwrap();
        core.pool.write(handle, &sealed[..m]).unwrap();

        assert_eq!(block_on(core.rx_process(handle, 0)), Err(Error::Unauthenticated));
        assert!(!core.pool.is_used(handle));
    }

    #[test]
    fn new_rejects_universe_key_over_the_max() {
        let key = [0u8; RMAC_UNIVERSE_KEY_MAX + 1];
        let result: Result<TestCore, Error> = RmacCore::new(1, &key, TdmaAlgo::Csma, NullHost);
        assert_eq!(result.err(), Some(Error::KeyTooLong));
    }

    #[test]
    fn tx_counter_wraps_at_8_bits() {
        let core: TestCore = RmacCore::new(1, b"0123456789abcdef", TdmaAlgo::Csma, NullHost).unwrap();
        for _ in 0..255 {
            core.next_tx_counter();
        }
        assert_eq!(core.next_tx_counter(), 255);
        assert_eq!(core.next_tx_counter(), 0);
    }
}
