//! Multi-port NBUS switch: learns `(channel-id, direction) → port` and
//! forwards accordingly, falling back to flooding. Grounded on
//! `services/nbus-switch/nbus_switch.c`'s `nbus_switch_process_task`.
#![cfg_attr(not(test), no_std)]

use nbus_frame::{ChannelId, Direction, FrameId};

pub const NBUS_SWITCH_MAX_CHANNELS: usize = 256;
pub const NBUS_SWITCH_MAX_PORTS: usize = 4;
pub const NBUS_SWITCH_IQ_SIZE: usize = 128;
pub const NBUS_SWITCH_MAX_LIFETIME: u32 = 10;

pub type PortId = u8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ChannelRecord {
    channel_id: ChannelId,
    direction: Direction,
    port: PortId,
    frames: u32,
    last_access: u32,
}

/// Where a classified frame should go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Forward {
    /// Send only to this one port (the learned opposing-direction port).
    Unicast(PortId),
    /// Flood to every port except the one named here (the ingress port).
    FloodExcept(PortId),
}

fn opposing(direction: Direction) -> Direction {
    match direction {
        Direction::Request => Direction::Response,
        Direction::Response => Direction::Request,
        Direction::Publish => Direction::Subscribe,
        Direction::Subscribe => Direction::Publish,
    }
}

/// The switch's learned channel-record table and per-port drop counters.
/// Frame transport (the actual send/receive on each port) is left to the
/// caller; this type only learns and classifies, per spec.md §4.6.
pub struct Switch<const MAX_CHANNELS: usize = NBUS_SWITCH_MAX_CHANNELS, const MAX_PORTS: usize = NBUS_SWITCH_MAX_PORTS> {
    records: heapless::Vec<ChannelRecord, MAX_CHANNELS>,
    rx_dropped: [u32; MAX_PORTS],
    tick: u32,
}

impl<const MAX_CHANNELS: usize, const MAX_PORTS: usize> Default for Switch<MAX_CHANNELS, MAX_PORTS> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const MAX_CHANNELS: usize, const MAX_PORTS: usize> Switch<MAX_CHANNELS, MAX_PORTS> {
    pub fn new() -> Self {
        Switch { records: heapless::Vec::new(), rx_dropped: [0u32; MAX_PORTS], tick: 0 }
    }

    pub fn rx_dropped(&self, port: PortId) -> u32 {
        self.rx_dropped.get(port as usize).copied().unwrap_or(0)
    }

    /// Called by the per-port receive task when its bounded input queue is
    /// full (spec.md §4.6 "Back-pressure"): never blocks the receive path.
    pub fn note_dropped(&mut self, port: PortId) {
        if let Some(slot) = self.rx_dropped.get_mut(port as usize) {
            *slot += 1;
            log::warn!("nbus-switch: dropped frame on port {port}, input queue full");
        }
    }

    fn find(&self, channel_id: ChannelId, direction: Direction) -> Option<usize> {
        self.records.iter().position(|r| r.channel_id == channel_id && r.direction == direction)
    }

    fn learn(&mut self, channel_id: ChannelId, direction: Direction, port: PortId) {
        match self.find(channel_id, direction) {
            Some(i) => {
                let r = &mut self.records[i];
                r.port = port;
                r.frames += 1;
                r.last_access = self.tick;
            }
            None => {
                let _ = self.records.push(ChannelRecord { channel_id, direction, port, frames: 1, last_access: self.tick });
            }
        }
    }

    /// Learns from one frame arriving on `port` and decides where to send
    /// it (spec.md §4.6 "Forwarding decision").
    pub fn process(&mut self, port: PortId, frame: FrameId) -> Forward {
        self.learn(frame.channel, frame.direction, port);
        match self.find(frame.channel, opposing(frame.direction)) {
            Some(i) => Forward::Unicast(self.records[i].port),
            None => Forward::FloodExcept(port),
        }
    }

    /// One housekeeping tick (1 Hz): ages every record and evicts ones
    /// untouched for `NBUS_SWITCH_MAX_LIFETIME` ticks.
    pub fn housekeeping_tick(&mut self) {
        self.tick = self.tick.wrapping_add(1);
        let tick = self.tick;
        let mut survivors: heapless::Vec<ChannelRecord, MAX_CHANNELS> = heapless::Vec::new();
        for r in self.records.iter() {
            if tick.wrapping_sub(r.last_access) <= NBUS_SWITCH_MAX_LIFETIME {
                let _ = survivors.push(*r);
            }
        }
        self.records = survivors;
    }

    pub fn channel_count(&self) -> usize {
        self.records.len()
    }
}
