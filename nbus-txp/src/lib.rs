//! Per-channel outgoing fragmentation FSM, grounded on
//! `services/nbus/nbus.c`'s `nbus_txpacket_get_fragment`. Pull-based: the
//! caller (`nbus-channel`) repeatedly calls [`TxFragmenter::next`] and puts
//! each `(Opcode, payload)` on the wire until it returns `None`.
//!
//! `leading → data* → trailing → done`, matching spec.md §4.2. Unlike the
//! original C, which emitted an all-zero 8-byte SIV stub for the trailing
//! frame (`/** @todo check the MAC here */`), this implementation computes
//! a real SIV over the plaintext via [`pbuf::seal_split`] before fragmenting
//! the ciphertext — spec.md §8's bit-flip authenticity property requires it.
#![cfg_attr(not(test), no_std)]

use nbus_frame::{Opcode, TRAILING_LEN};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// Plaintext length exceeds the fragmenter's `MTU`.
    TooBig,
    /// `next` was called, or `start` was called, in the wrong state.
    BadState,
    Pbuf(pbuf::Error),
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::TooBig => write!(f, "payload exceeds channel MTU"),
            Error::BadState => write!(f, "tx fragmenter called out of sequence"),
            Error::Pbuf(e) => write!(f, "pbuf: {e}"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

impl From<pbuf::Error> for Error {
    fn from(e: pbuf::Error) -> Self {
        Error::Pbuf(e)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Leading,
    Data,
    Trailing,
    Done,
}

/// Fragments one outgoing packet of up to `MTU` bytes of plaintext at a
/// time into NBUS wire frames. `MTU` is the channel MTU
/// (`nbus_frame::NBUS_CHANNEL_MTU` per spec.md §6); `wire_mtu` (set per-
/// `start` call) is the CAN payload size per frame (8 for classic CAN, up to
/// 64 for CAN-FD).
pub struct TxFragmenter<const MTU: usize = { nbus_frame::NBUS_CHANNEL_MTU }> {
    state: State,
    ciphertext: [u8; MTU],
    siv: [u8; TRAILING_LEN],
    leading_payload: [u8; nbus_frame::LEADING_PAYLOAD_LEN],
    len: usize,
    endpoint: u8,
    counter: u32,
    flags: u16,
    wire_mtu: usize,
    pos: usize,
}

impl<const MTU: usize> Default for TxFragmenter<MTU> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const MTU: usize> TxFragmenter<MTU> {
    pub const fn new() -> Self {
        TxFragmenter {
            state: State::Idle,
            ciphertext: [0u8; MTU],
            siv: [0u8; TRAILING_LEN],
            leading_payload: [0u8; nbus_frame::LEADING_PAYLOAD_LEN],
            len: 0,
            endpoint: 0,
            counter: 0,
            flags: 0,
            wire_mtu: 8,
            pos: 0,
        }
    }

    /// Begin fragmenting `plaintext` for `endpoint`, sealing it with `keys`.
    /// `wire_mtu` is the CAN payload chunk size (8 or up to 64 bytes).
    pub fn start(
        &mut self,
        endpoint: u8,
        counter: u32,
        flags: u16,
        plaintext: &[u8],
        keys: &pbuf::Keys,
        wire_mtu: usize,
    ) -> Result<(), Error> {
        if plaintext.len() > MTU {
            return Err(Error::TooBig);
        }
        pbuf::seal_split(keys, plaintext, &mut self.ciphertext[..plaintext.len()], &mut self.siv)?;
        self.len = plaintext.len();
        self.endpoint = endpoint;
        self.counter = counter;
        self.flags = flags;
        self.wire_mtu = wire_mtu.max(1);
        self.pos = 0;
        self.state = State::Leading;
        Ok(())
    }

    /// Pull the next `(opcode, payload)` to transmit, or `None` once the
    /// packet is fully fragmented. `payload` borrows an internal buffer.
    pub fn next(&mut self) -> Option<(Opcode, &[u8])> {
        match self.state {
            State::Idle | State::Done => None,
            State::Leading => {
                self.state = if self.len == 0 { State::Trailing } else { State::Data };
                let payload = nbus_frame::LeadingPayload { counter: self.counter, len: self.len as u16, flags: self.flags }.encode();
                self.leading_payload = payload;
                Some((Opcode::Leading(self.endpoint), &self.leading_payload))
            }
            State::Data => {
                let start = self.pos;
                let end = core::cmp::min(start + self.wire_mtu, self.len);
                let seq = (start / self.wire_mtu) as u8;
                self.pos = end;
                if end >= self.len {
                    self.state = State::Trailing;
                }
                Some((Opcode::Data(seq), &self.ciphertext[start..end]))
            }
            State::Trailing => {
                self.state = State::Done;
                Some((Opcode::Trailing, &self.siv))
            }
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, State::Done | State::Idle)
    }
}
