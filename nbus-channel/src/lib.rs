//! One NBUS channel: identity, short-ID/channel-ID derivation, RPC endpoint
//! 0, and send/receive. Grounded on `services/nbus/nbus.c`'s `nbus_channel`
//! plus `nbus_channel_set_parent`/`nbus_channel_housekeeping`.
#![cfg_attr(not(test), no_std)]
#![allow(async_fn_in_trait)]

use cc_rpc::{Accessor, Kind};
use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::mutex::Mutex;
use embassy_sync::signal::Signal;
use nbus_frame::{Can, CanMessage, ChannelId, Direction, FrameId};

pub const CHANNEL_NAME_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// Payload exceeds the channel MTU.
    TooBig,
    /// `channel_id` is not currently valid; sends are refused.
    InvalidChannelId,
    /// Underlying CAN transport failed.
    Can,
    /// `channel_receive`'s timeout elapsed with nothing completed.
    Timeout,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::TooBig => write!(f, "payload exceeds channel MTU"),
            Error::InvalidChannelId => write!(f, "channel-id not yet valid"),
            Error::Can => write!(f, "CAN transport error"),
            Error::Timeout => write!(f, "receive timed out"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

/// A completed receive, handed back by [`Channel::receive`].
#[derive(Debug)]
pub enum Received {
    /// Endpoint 0 was dispatched internally; nothing for the caller to read.
    RpcHandled,
    /// A non-zero endpoint completed; `len` bytes are in the caller buffer.
    Data { endpoint: u8, len: usize },
}

/// `Blake2s(parent_short_id ‖ name, 4 bytes)`, spec.md §3/§4.3. `0` is the
/// reserved "no parent" short-ID for a root channel (provisioned from
/// hardware by the caller instead of computed here).
pub fn derive_short_id(parent_short_id: u32, name: &str) -> u32 {
    let parent_be = parent_short_id.to_be_bytes();
    let mut out = [0u8; 4];
    crypto_prim::hash(&[&parent_be, name.as_bytes()], &mut out).expect("4-byte output is valid");
    u32::from_be_bytes(out)
}

/// `Blake2s(short_id ‖ channel_id, 2 bytes)`, spec.md §3/§4.3.
fn derive_channel_id(short_id: u32, previous: ChannelId) -> ChannelId {
    let short_be = short_id.to_be_bytes();
    let prev_be = previous.0.to_be_bytes();
    let mut out = [0u8; 2];
    crypto_prim::hash(&[&short_be, &prev_be], &mut out).expect("2-byte output is valid");
    ChannelId(u16::from_be_bytes(out))
}

/// Read-only accessor for the channel's own name.
struct NameAccessor<'a> {
    value: &'a str,
}

impl Accessor for NameAccessor<'_> {
    fn name(&self) -> &str {
        "name"
    }
    fn kind(&self) -> Kind {
        Kind::String
    }
    fn read_string(&mut self, out: &mut [u8]) -> Option<usize> {
        let bytes = self.value.as_bytes();
        if bytes.len() > out.len() {
            return None;
        }
        out[..bytes.len()].copy_from_slice(bytes);
        Some(bytes.len())
    }
}

/// Read-only accessor for the hex-encoded parent short-ID (empty if root).
struct ParentAccessor {
    parent: Option<u32>,
}

const HEX_DIGITS: &[u8; 16] = b"0123456789abcdef";

impl Accessor for ParentAccessor {
    fn name(&self) -> &str {
        "parent"
    }
    fn kind(&self) -> Kind {
        Kind::String
    }
    fn read_string(&mut self, out: &mut [u8]) -> Option<usize> {
        match self.parent {
            None => Some(0),
            Some(id) => {
                if out.len() < 8 {
                    return None;
                }
                for (i, byte) in id.to_be_bytes().iter().enumerate() {
                    out[i * 2] = HEX_DIGITS[(byte >> 4) as usize];
                    out[i * 2 + 1] = HEX_DIGITS[(byte & 0xF) as usize];
                }
                Some(8)
            }
        }
    }
}

struct TxState<const MTU: usize = { nbus_frame::NBUS_CHANNEL_MTU }> {
    fragmenter: nbus_txp::TxFragmenter<MTU>,
    counter: u32,
}

/// One NBUS channel. `R` is the `embassy-sync` raw mutex (`NoopRawMutex` in
/// single-executor or test builds, a real critical-section mutex otherwise).
pub struct Channel<R: RawMutex, const MTU: usize = { nbus_frame::NBUS_CHANNEL_MTU }> {
    name: heapless::String<CHANNEL_NAME_LEN>,
    short_id: u32,
    parent: Option<u32>,
    channel_id: ChannelId,
    valid: bool,
    adv_ticks: u32,
    keys: pbuf::Keys,
    rx_fsm: nbus_rxp::RxFsm<MTU>,
    last_done_endpoint: u8,
    tx: Mutex<R, TxState<MTU>>,
    rx_ready: Signal<R, ()>,
}

impl<R: RawMutex, const MTU: usize> Channel<R, MTU> {
    /// `channel_init(name)`. `key` is this channel's symmetric key, from
    /// which `pbuf`'s `(Ke, Km)` pair is derived once and cached.
    pub fn new(name: &str, key: &[u8]) -> Self {
        Channel {
            name: heapless::String::try_from(name).unwrap_or_default(),
            short_id: 0,
            parent: None,
            channel_id: ChannelId(0),
            valid: false,
            adv_ticks: 0,
            keys: pbuf::derive_keys(key),
            rx_fsm: nbus_rxp::RxFsm::new(),
            last_done_endpoint: 0,
            tx: Mutex::new(TxState { fragmenter: nbus_txp::TxFragmenter::new(), counter: 0 }),
            rx_ready: Signal::new(),
        }
    }

    pub fn short_id(&self) -> u32 {
        self.short_id
    }

    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// `set_parent(parent)`: records the parent by short-ID only and
    /// (re)derives this channel's own short-ID.
    pub fn set_parent(&mut self, parent_short_id: u32) {
        self.parent = Some(parent_short_id);
        self.short_id = derive_short_id(parent_short_id, &self.name);
    }

    /// One housekeeping tick (spec.md §4.3). Returns `true` if an
    /// advertisement should be sent this tick.
    pub fn housekeeping_tick(&mut self, adv_period_ticks: u32) -> bool {
        if !self.valid {
            self.channel_id = derive_channel_id(self.short_id, self.channel_id);
            self.valid = true;
            self.adv_ticks = 0;
            return true;
        }
        self.adv_ticks += 1;
        if self.adv_ticks >= adv_period_ticks {
            self.adv_ticks = 0;
            return true;
        }
        false
    }

    /// An advertisement for `adv_channel_id`/`adv_short_id` was observed on
    /// the bus. Returns `true` if it collided with this channel's own valid
    /// channel-ID (and therefore invalidated it, per spec.md §3/§4.3).
    pub fn observe_advertisement(&mut self, adv_channel_id: ChannelId, adv_short_id: u32) -> bool {
        if self.valid && self.channel_id == adv_channel_id && adv_short_id != self.short_id {
            self.valid = false;
            self.rx_fsm.abort_invalid_id();
            true
        } else {
            false
        }
    }

    /// `channel_send(ep, buf, len)`.
    pub async fn send(&self, ep: u8, direction: Direction, buf: &[u8], can: &mut impl Can, wire_mtu: usize) -> Result<(), Error> {
        if buf.len() > MTU {
            return Err(Error::TooBig);
        }
        if !self.valid {
            return Err(Error::InvalidChannelId);
        }
        let mut tx = self.tx.lock().await;
        tx.counter = tx.counter.wrapping_add(1);
        let counter = tx.counter;
        tx.fragmenter.start(ep, counter, 0, buf, &self.keys, wire_mtu).map_err(|_| Error::TooBig)?;
        while let Some((opcode, payload)) = tx.fragmenter.next() {
            let id = FrameId { channel: self.channel_id, direction, opcode }.to_id();
            can.send(&CanMessage::new(id, payload), 1000).await.map_err(|_| Error::Can)?;
        }
        Ok(())
    }

    /// Reply to a request, copying its counter rather than incrementing the
    /// channel's own (spec.md §4.1 leaves the counter's meaning up to the
    /// caller; a response echoes the request it answers).
    pub async fn respond(&self, ep: u8, request_counter: u32, buf: &[u8], can: &mut impl Can, wire_mtu: usize) -> Result<(), Error> {
        if buf.len() > MTU {
            return Err(Error::TooBig);
        }
        if !self.valid {
            return Err(Error::InvalidChannelId);
        }
        let mut tx = self.tx.lock().await;
        tx.fragmenter.start(ep, request_counter, 0, buf, &self.keys, wire_mtu).map_err(|_| Error::TooBig)?;
        while let Some((opcode, payload)) = tx.fragmenter.next() {
            let id = FrameId { channel: self.channel_id, direction: Direction::Response, opcode }.to_id();
            can.send(&CanMessage::new(id, payload), 1000).await.map_err(|_| Error::Can)?;
        }
        Ok(())
    }

    /// Feed one fragment belonging to this channel into its RX FSM. Called
    /// by `nbus-core`'s receive task after demultiplexing by channel-ID.
    pub fn feed(&mut self, opcode: nbus_frame::Opcode, payload: &[u8], wire_mtu: usize) {
        if let nbus_rxp::Event::Done { endpoint, .. } = nbus_rxp::feed(&mut self.rx_fsm, opcode, payload, wire_mtu, &self.keys) {
            self.last_done_endpoint = endpoint;
            self.rx_ready.signal(());
        }
    }

    /// `channel_receive(ep, buf, cap, timeout)`. `extra` accessors are the
    /// caller's own RPC accessors, layered on top of the two built-ins.
    pub async fn receive(&mut self, buf: &mut [u8], extra: &mut [&mut dyn Accessor]) -> Result<Received, Error> {
        self.rx_ready.wait().await;
        self.rx_ready.reset();
        let endpoint = self.rx_fsm_endpoint();
        if endpoint == 0 {
            self.dispatch_rpc(extra)?;
            Ok(Received::RpcHandled)
        } else {
            let mut scratch = [0u8; MTU];
            let n = self.rx_fsm.consume(&mut scratch).map_err(|_| Error::Timeout)?;
            if n > buf.len() {
                return Err(Error::TooBig);
            }
            buf[..n].copy_from_slice(&scratch[..n]);
            Ok(Received::Data { endpoint, len: n })
        }
    }

    fn rx_fsm_endpoint(&self) -> u8 {
        self.last_done_endpoint
    }

    fn dispatch_rpc(&mut self, extra: &mut [&mut dyn Accessor]) -> Result<(), Error> {
        let mut scratch = [0u8; cc_rpc::CBOR_RPC_REQ_SIZE];
        let n = self.rx_fsm.consume(&mut scratch).map_err(|_| Error::TooBig)?;
        let mut name_acc = NameAccessor { value: self.name.as_str() };
        let mut parent_acc = ParentAccessor { parent: self.parent };
        let mut all: heapless::Vec<&mut dyn Accessor, 16> = heapless::Vec::new();
        let _ = all.push(&mut name_acc);
        let _ = all.push(&mut parent_acc);
        for acc in extra.iter_mut() {
            let _ = all.push(*acc);
        }
        let mut response = [0u8; cc_rpc::CBOR_RPC_RESP_SIZE];
        let _ = cc_rpc::dispatch(&mut all, &scratch[..n], &mut response);
        Ok(())
    }
}
