//! Per-channel incoming reassembly FSM, grounded on
//! `services/nbus/nbus.c`'s `nbus_rxpacket_process_fragment`.
//!
//! `ready → data → trailing → done → (consumed → ready) | invalid`
//! (spec.md §4.2). Exactly one instance exists per channel (spec.md §4.2
//! "Concurrency"), so no internal lock is needed; `nbus-core`'s single
//! receive task is the only writer.
#![cfg_attr(not(test), no_std)]

use nbus_frame::{Opcode, TRAILING_LEN};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// `consume` was called while not in the `done` state.
    NotDone,
    /// The caller's output buffer is smaller than the reassembled packet.
    TooBig,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::NotDone => write!(f, "no completed packet to consume"),
            Error::TooBig => write!(f, "output buffer smaller than reassembled packet"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

/// Result of feeding one fragment to the FSM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// Still collecting; nothing for the caller to act on.
    InProgress,
    /// A `leading` fragment reset an in-progress reassembly. Spec.md §4.2:
    /// logged at low verbosity, not an error.
    Reset,
    /// The packet completed and authenticated; `channel_receive` should wake.
    Done { endpoint: u8, counter: u32, len: usize },
    /// Sequence gap, oversized payload, or SIV mismatch. The FSM moved to
    /// `invalid` and stays there until the next `leading` fragment.
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Ready,
    Data,
    Trailing,
    Done,
    Invalid,
}

/// Reassembles one channel's incoming fragments into a plaintext packet of
/// up to `MTU` bytes.
pub struct RxFsm<const MTU: usize = { nbus_frame::NBUS_CHANNEL_MTU }> {
    state: State,
    buf: [u8; MTU],
    endpoint: u8,
    counter: u32,
    expected_len: usize,
    flags: u16,
    seq: u8,
    write_pos: usize,
    wire_mtu: usize,
}

impl<const MTU: usize> Default for RxFsm<MTU> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const MTU: usize> RxFsm<MTU> {
    pub const fn new() -> Self {
        RxFsm {
            state: State::Ready,
            buf: [0u8; MTU],
            endpoint: 0,
            counter: 0,
            expected_len: 0,
            flags: 0,
            seq: 0,
            write_pos: 0,
            wire_mtu: 8,
        }
    }

    /// A `leading` fragment arrived. Always resets the FSM to `data`
    /// (spec.md §4.2: "A leading fragment in any non-ready state resets the
    /// FSM, one warning, no error return"), regardless of current state.
    pub fn feed_leading(&mut self, payload: &[u8], wire_mtu: usize) -> Event {
        let was_in_progress = !matches!(self.state, State::Ready);
        let decoded = match nbus_frame::LeadingPayload::decode(payload) {
            Ok(d) => d,
            Err(_) => {
                self.state = State::Invalid;
                return Event::Invalid;
            }
        };
        if decoded.len as usize > MTU {
            self.state = State::Invalid;
            return Event::Invalid;
        }
        self.counter = decoded.counter;
        self.expected_len = decoded.len as usize;
        self.flags = decoded.flags;
        self.seq = 0;
        self.write_pos = 0;
        self.wire_mtu = wire_mtu.max(1);
        self.state = if self.expected_len == 0 { State::Trailing } else { State::Data };
        if was_in_progress {
            Event::Reset
        } else {
            Event::InProgress
        }
    }

    /// Record which endpoint this `leading` fragment is for; `nbus-core`
    /// calls this right after `feed_leading` returns something other than
    /// `Invalid`, since the opcode (not the payload) carries the endpoint.
    pub fn set_endpoint(&mut self, endpoint: u8) {
        self.endpoint = endpoint;
    }

    pub fn feed_data(&mut self, seq: u8, payload: &[u8]) -> Event {
        if !matches!(self.state, State::Data) {
            return Event::InProgress;
        }
        if seq != self.seq {
            self.state = State::Invalid;
            return Event::Invalid;
        }
        if self.write_pos + payload.len() > self.expected_len || self.write_pos + payload.len() > MTU {
            self.state = State::Invalid;
            return Event::Invalid;
        }
        self.buf[self.write_pos..self.write_pos + payload.len()].copy_from_slice(payload);
        self.write_pos += payload.len();
        self.seq = self.seq.wrapping_add(1);
        if self.write_pos >= self.expected_len {
            self.state = State::Trailing;
        }
        Event::InProgress
    }

    /// The trailing (SIV) fragment arrived; verify and, on success, decrypt
    /// the ciphertext collected in `buf` in place.
    pub fn feed_trailing(&mut self, siv: &[u8], keys: &pbuf::Keys) -> Event {
        if !matches!(self.state, State::Trailing) || siv.len() != TRAILING_LEN {
            self.state = State::Invalid;
            return Event::Invalid;
        }
        let mut ciphertext = [0u8; MTU];
        ciphertext[..self.expected_len].copy_from_slice(&self.buf[..self.expected_len]);
        match pbuf::open_split(keys, &ciphertext[..self.expected_len], siv, &mut self.buf[..self.expected_len]) {
            Ok(_) => {
                self.state = State::Done;
                Event::Done { endpoint: self.endpoint, counter: self.counter, len: self.expected_len }
            }
            Err(_) => {
                self.buf[..self.expected_len].fill(0);
                self.state = State::Invalid;
                Event::Invalid
            }
        }
    }

    /// An advertisement for this channel's own channel-ID arrived while a
    /// reassembly was in flight (spec.md §4.2 "invalid-id" case). `nbus-core`
    /// detects the condition (by channel-ID comparison) and calls this.
    pub fn abort_invalid_id(&mut self) -> bool {
        let was_in_progress = !matches!(self.state, State::Ready | State::Done);
        if was_in_progress {
            self.state = State::Invalid;
        }
        was_in_progress
    }

    /// Copy out the completed, decrypted packet and return to `ready`.
    pub fn consume(&mut self, out: &mut [u8]) -> Result<usize, Error> {
        if !matches!(self.state, State::Done) {
            return Err(Error::NotDone);
        }
        if out.len() < self.expected_len {
            return Err(Error::TooBig);
        }
        out[..self.expected_len].copy_from_slice(&self.buf[..self.expected_len]);
        self.state = State::Ready;
        Ok(self.expected_len)
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state, State::Ready)
    }
}

/// Dispatch one incoming opcode/payload pair to an [`RxFsm`]. `nbus-core`
/// wraps this so the per-channel FSM never needs to know about `Opcode`
/// itself — kept here since the mapping is fragment-layer behavior.
pub fn feed<const MTU: usize>(fsm: &mut RxFsm<MTU>, opcode: Opcode, payload: &[u8], wire_mtu: usize, keys: &pbuf::Keys) -> Event {
    match opcode {
        Opcode::Leading(ep) => {
            let ev = fsm.feed_leading(payload, wire_mtu);
            fsm.set_endpoint(ep);
            ev
        }
        Opcode::Data(seq) => fsm.feed_data(seq, payload),
        Opcode::Trailing => fsm.feed_trailing(payload, keys),
        Opcode::Advertisement => Event::InProgress,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nbus_frame::LeadingPayload;

    fn keys() -> pbuf::Keys {
        pbuf::derive_keys(b"channel-key-bytes")
    }

    #[test]
    fn scenario_2_roundtrip_via_txp_output() {
        let k = keys();
        let mut tx: nbus_txp::TxFragmenter<{ nbus_frame::NBUS_CHANNEL_MTU }> = nbus_txp::TxFragmenter::new();
        tx.start(3, 7, 0, b"Hello", &k, 8).unwrap();
        let mut rx: RxFsm<{ nbus_frame::NBUS_CHANNEL_MTU }> = RxFsm::new();
        let mut last = Event::InProgress;
        while let Some((op, payload)) = tx.next() {
            last = feed(&mut rx, op, payload, 8, &k);
        }
        assert_eq!(last, Event::Done { endpoint: 3, counter: 7, len: 5 });
        let mut out = [0u8; nbus_frame::NBUS_CHANNEL_MTU];
        let n = rx.consume(&mut out).unwrap();
        assert_eq!(&out[..n], b"Hello");
        assert!(rx.is_ready());
    }

    #[test]
    fn scenario_3_sequence_gap_invalidates() {
        let k = keys();
        let mut rx: RxFsm<{ nbus_frame::NBUS_CHANNEL_MTU }> = RxFsm::new();
        let leading = LeadingPayload { counter: 0, len: 10, flags: 0 }.encode();
        assert_eq!(feed(&mut rx, Opcode::Leading(0), &leading, 8, &k), Event::InProgress);
        assert_eq!(feed(&mut rx, Opcode::Data(0), &[0u8; 8], 8, &k), Event::InProgress);
        assert_eq!(feed(&mut rx, Opcode::Data(2), &[0u8; 2], 8, &k), Event::Invalid);
        // Trailing after invalidation is discarded, no `done`.
        assert_eq!(feed(&mut rx, Opcode::Trailing, &[0u8; 8], 8, &k), Event::Invalid);
    }

    #[test]
    fn bit_flip_in_data_fails_mac_and_zeros_output() {
        let k = keys();
        let mut tx: nbus_txp::TxFragmenter<{ nbus_frame::NBUS_CHANNEL_MTU }> = nbus_txp::TxFragmenter::new();
        tx.start(0, 0, 0, b"authenticate me please", &k, 8).unwrap();
        let mut rx: RxFsm<{ nbus_frame::NBUS_CHANNEL_MTU }> = RxFsm::new();
        let mut frames: heapless::Vec<(Opcode, heapless::Vec<u8, 64>), 8> = heapless::Vec::new();
        while let Some((op, payload)) = tx.next() {
            frames.push((op, heapless::Vec::from_slice(payload).unwrap())).unwrap();
        }
        // Flip a bit in the first data fragment.
        if let Some((Opcode::Data(_), buf)) = frames.iter_mut().find(|(op, _)| matches!(op, Opcode::Data(_))) {
            buf[0] ^= 0x01;
        }
        let mut last = Event::InProgress;
        for (op, payload) in frames.iter() {
            last = feed(&mut rx, *op, payload, 8, &k);
        }
        assert_eq!(last, Event::Invalid);
    }

    #[test]
    fn leading_mid_reassembly_resets_with_warning_event() {
        let k = keys();
        let mut rx: RxFsm<{ nbus_frame::NBUS_CHANNEL_MTU }> = RxFsm::new();
        let leading = LeadingPayload { counter: 0, len: 10, flags: 0 }.encode();
        feed(&mut rx, Opcode::Leading(0), &leading, 8, &k);
        let ev = feed(&mut rx, Opcode::Leading(1), &leading, 8, &k);
        assert_eq!(ev, Event::Reset);
    }

    #[test]
    fn abort_invalid_id_only_fires_mid_reassembly() {
        let mut rx: RxFsm<{ nbus_frame::NBUS_CHANNEL_MTU }> = RxFsm::new();
        assert!(!rx.abort_invalid_id());
        let leading = LeadingPayload { counter: 0, len: 4, flags: 0 }.encode();
        feed(&mut rx, Opcode::Leading(0), &leading, 8, &pbuf::derive_keys(b"k"));
        assert!(rx.abort_invalid_id());
        assert!(!rx.is_ready());
    }

    #[test]
    fn oversized_leading_len_aborts_without_allocating() {
        let mut rx: RxFsm<16> = RxFsm::new();
        let leading = LeadingPayload { counter: 0, len: 17, flags: 0 }.encode();
        assert_eq!(feed(&mut rx, Opcode::Leading(0), &leading, 8, &pbuf::derive_keys(b"k")), Event::Invalid);
    }
}
