//! Core of a Digital Command Control (DCC) command station for model-railway
//! layouts.
//!
//! The station drives an H-bridge pin pair carrying both power and a
//! bit-serial command stream to the decoders on the track. This crate
//! covers the hardware-independent core: the packet model and builders
//! ([packet]), the scheduler collections with the duplicate-collapse rule
//! ([queue]), the timer-driven waveform generator ([waveform]), the
//! persistent per-decoder state table ([state]) and the orchestrating
//! façade with the host command surface ([station]).
//!
//! Physical output drive and the periodic timer are abstracted behind the
//! [TrackPins]/[BitClock] seams, persistence behind [NonvolatileMemory],
//! so the whole engine runs deterministically on a host for testing. See
//! [station] for the wiring example.
#![no_std]

#[cfg(test)]
extern crate std;

pub mod packet;
pub mod queue;
pub mod standard;
pub mod state;
pub mod station;
pub mod waveform;

#[cfg(test)]
pub(crate) mod test_support;

pub use packet::{Acknowledge, HexPacket, Packet, PacketInfo, PacketParseError};
pub use queue::{FreeList, MergeKind, PacketArena, PacketQueue, QUEUE_DEPTH, SlotId};
pub use state::{NonvolatileMemory, STATE_CAPACITY, StateKeeper};
pub use station::{CommandStation, Config, Response};
pub use waveform::{
    BitClock, PacketFeed, TrackOutput, TrackPins, TxFrame, TxHandle, WaveformGenerator,
};
