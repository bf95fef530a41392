//! NBUS bus owner: the CAN interface, the channel list, the receive task,
//! and the 1 Hz housekeeping task. Grounded on `services/nbus/nbus.c`'s
//! `nbus_receive_task`/`nbus_housekeeping_task`.
#![cfg_attr(not(test), no_std)]
#![allow(async_fn_in_trait)]

use embassy_sync::blocking_mutex::raw::RawMutex;
use nbus_channel::Channel;
use nbus_frame::{Can, CanMessage, Direction, FrameId, Opcode};

/// Housekeeping ticks between advertisements for an already-valid channel,
/// spec.md §6 (≈ 2 s at a 1 Hz housekeeping rate).
pub const NBUS_ADV_TIME: u32 = 2;

/// How long the receive task blocks waiting for one CAN frame before giving
/// the executor a chance to run other tasks.
pub const NBUS_RX_TIMEOUT_MS: u32 = 5000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// The channel table is already at its fixed capacity.
    Full,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::Full => write!(f, "channel table is full"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

/// Owns the bus: one CAN transport, up to `N` channels of uniform MTU
/// `MTU`. Channels are added once at init and never removed (spec.md §3:
/// "destroyed only at shutdown").
pub struct NbusCore<C: Can, R: RawMutex, const N: usize, const MTU: usize = { nbus_frame::NBUS_CHANNEL_MTU }> {
    can: C,
    channels: heapless::Vec<Channel<R, MTU>, N>,
    wire_mtu: usize,
}

impl<C: Can, R: RawMutex, const N: usize, const MTU: usize> NbusCore<C, R, N, MTU> {
    pub fn new(can: C, wire_mtu: usize) -> Self {
        NbusCore { can, channels: heapless::Vec::new(), wire_mtu: wire_mtu.max(1) }
    }

    /// Registers a new channel, keyed by its own symmetric key. Returns its
    /// index in this core's channel table.
    pub fn add_channel(&mut self, name: &str, key: &[u8]) -> Result<usize, Error> {
        self.channels.push(Channel::new(name, key)).map_err(|_| Error::Full)?;
        Ok(self.channels.len() - 1)
    }

    pub fn channel(&self, index: usize) -> Option<&Channel<R, MTU>> {
        self.channels.get(index)
    }

    pub fn channel_mut(&mut self, index: usize) -> Option<&mut Channel<R, MTU>> {
        self.channels.get_mut(index)
    }

    pub fn can_mut(&mut self) -> &mut C {
        &mut self.can
    }

    /// One pass of the receive task's demultiplexing logic (spec.md §4.5),
    /// pulled out of the blocking loop so it can be driven directly by
    /// tests and by whatever executor runs [`Self::receive_task`].
    pub fn handle_frame(&mut self, msg: &CanMessage) {
        if !msg.extended {
            return;
        }
        let Ok(frame) = FrameId::from_id(msg.id) else {
            return;
        };
        if let Opcode::Advertisement = frame.opcode {
            if let Ok(short_id) = nbus_frame::decode_advertisement(msg.payload()) {
                for ch in self.channels.iter_mut() {
                    ch.observe_advertisement(frame.channel, short_id);
                }
            }
            return;
        }
        if let Some(ch) = self.channels.iter_mut().find(|c| c.channel_id() == frame.channel) {
            ch.feed(frame.opcode, msg.payload(), self.wire_mtu);
        }
        // Missing channel: dropped silently per spec.md §4.5.
    }

    /// Blocking receive loop; never returns under normal operation.
    pub async fn receive_task(&mut self) -> ! {
        loop {
            match self.can.receive(NBUS_RX_TIMEOUT_MS).await {
                Ok(msg) => self.handle_frame(&msg),
                Err(_) => log::warn!("nbus-core: CAN receive error"),
            }
        }
    }

    /// One housekeeping tick (spec.md §4.5): advertises channels due for
    /// one, and derives a channel-ID for any channel that still lacks one.
    /// `nbus-core` itself does not own a clock; callers invoke this once a
    /// second from whatever timer source the platform provides.
    pub async fn housekeeping_tick(&mut self) {
        for ch in self.channels.iter_mut() {
            if ch.housekeeping_tick(NBUS_ADV_TIME) {
                let payload = nbus_frame::encode_advertisement(ch.short_id());
                let id = FrameId { channel: ch.channel_id(), direction: Direction::Publish, opcode: Opcode::Advertisement }.to_id();
                if self.can.send(&CanMessage::new(id, &payload), 1000).await.is_err() {
                    log::warn!("nbus-core: advertisement send failed");
                }
            }
        }
    }
}
