//! The command station façade: owns the packet arena, the transmit queue,
//! the persistent state keeper and the waveform generator, and wires the
//! host command surface to all of them.
//!
//! The engine state is shared between the main context (command ingestion,
//! refresh pump) and the timer interrupt (waveform generation), so it lives
//! behind a [critical_section::Mutex]. Every method takes `&self` and may
//! be called from either context; [CommandStation::on_timer_interrupt] is
//! the interrupt body.
//!
//! ```ignore
//! use dcc_station::{CommandStation, Config, TrackOutput};
//!
//! let (pin_a, pin_b, timer, eeprom) = board_resources();
//! let station = CommandStation::new(
//!     TrackOutput::new(pin_a, pin_b),
//!     timer,
//!     eeprom,
//!     Config::default(),
//! );
//! station.begin();
//! station.handle_text_command("m52r2");
//! loop {
//!     station.service();
//!     // the timer interrupt handler calls station.on_timer_interrupt()
//! }
//! ```

use core::cell::RefCell;

use critical_section::Mutex;

use crate::packet::{Packet, PacketParseError, text_flag};
use crate::queue::{FreeList, PacketArena, PacketQueue, SlotId};
use crate::state::{NonvolatileMemory, StateKeeper};
use crate::waveform::{
    BitClock, PREAMBLE_BITS_DEFAULT, PacketFeed, TrackPins, TxFrame, TxHandle, WaveformGenerator,
};

/// Station configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Config {
    /// Preamble bits per frame; values below the S-9.2 minimum of 14 are
    /// clamped up.
    pub preamble_bits: u8,
    /// Base address of the state table in the nonvolatile store.
    pub state_base: u16,
}

impl Config {
    pub fn preamble_bits(mut self, preamble_bits: u8) -> Self {
        self.preamble_bits = preamble_bits;
        self
    }

    pub fn state_base(mut self, state_base: u16) -> Self {
        self.state_base = state_base;
        self
    }
}

impl Default for Config {
    fn default() -> Config {
        Config {
            preamble_bits: PREAMBLE_BITS_DEFAULT,
            state_base: 0,
        }
    }
}

/// Reply to one host command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Response {
    /// Control command executed.
    Acknowledge,
    /// Packet accepted and scheduled.
    Queued,
    /// Out of packet slots; nothing was changed.
    Error,
    /// Malformed or unrecognized command.
    Unknown,
}

impl Response {
    /// The literal reply line for the serial host link.
    pub const fn as_str(self) -> &'static str {
        match self {
            Response::Acknowledge => "Acknowledge",
            Response::Queued => "Queued",
            Response::Error => "ERROR",
            Response::Unknown => "UNKNOWN",
        }
    }
}

struct Inner<P: TrackPins, C: BitClock, M: NonvolatileMemory> {
    arena: PacketArena,
    queue: PacketQueue,
    free: FreeList,
    keeper: StateKeeper<M>,
    generator: WaveformGenerator<P, C>,
}

/// One complete command-station engine bound to one physical output pair.
/// Independent instances are fully isolated.
pub struct CommandStation<P: TrackPins, C: BitClock, M: NonvolatileMemory> {
    inner: Mutex<RefCell<Inner<P, C, M>>>,
}

impl<P: TrackPins, C: BitClock, M: NonvolatileMemory> CommandStation<P, C, M> {
    pub fn new(pins: P, clock: C, memory: M, config: Config) -> Self {
        let mut arena = PacketArena::new();
        let free = FreeList::over(&mut arena);
        CommandStation {
            inner: Mutex::new(RefCell::new(Inner {
                arena,
                queue: PacketQueue::new(),
                free,
                keeper: StateKeeper::new(memory, config.state_base),
                generator: WaveformGenerator::new(pins, clock, config.preamble_bits),
            })),
        }
    }

    /// Loads the persistent state table and powers the track on.
    pub fn begin(&self) {
        critical_section::with(|cs| {
            let mut inner = self.inner.borrow(cs).borrow_mut();
            inner.keeper.begin();
            inner.power(true);
        })
    }

    /// The cooperative main-loop body: when the queue has drained, inject
    /// the next round of refresh packets from the state keeper.
    pub fn service(&self) {
        critical_section::with(|cs| {
            let mut inner = self.inner.borrow(cs).borrow_mut();
            if !inner.queue.is_empty() {
                return;
            }
            let Inner {
                keeper,
                arena,
                queue,
                free,
                ..
            } = &mut *inner;
            keeper.read_next_state(arena, queue, free);
        })
    }

    pub fn power(&self, on: bool) {
        critical_section::with(|cs| self.inner.borrow(cs).borrow_mut().power(on))
    }

    pub fn is_powered(&self) -> bool {
        critical_section::with(|cs| self.inner.borrow(cs).borrow().generator.is_powered())
    }

    /// Builds a packet in a fresh slot and schedules it: the state keeper
    /// captures it, then it either collapses into queued packets of the
    /// same kind or is appended to the queue. [Response::Error] when the
    /// free list is exhausted.
    pub fn send(&self, build: impl FnOnce(&mut Packet)) -> Response {
        critical_section::with(|cs| {
            self.inner.borrow(cs).borrow_mut().submit(|packet| {
                build(packet);
                Ok(())
            })
        })
    }

    /// Executes one host command line and returns the reply to print.
    ///
    /// `P0`/`P1` switch track power, `RA`/`RQ`/`RS` reset everything, the
    /// queue, or the stored speeds, `H…` schedules a raw hex packet and
    /// `m…`/`M…`/`B…`/`E…` schedule text-form packets.
    pub fn handle_text_command(&self, command: &str) -> Response {
        critical_section::with(|cs| self.inner.borrow(cs).borrow_mut().handle(command))
    }

    pub fn queue_len(&self) -> usize {
        critical_section::with(|cs| {
            let inner = self.inner.borrow(cs).borrow();
            inner.queue.len(&inner.arena)
        })
    }

    /// The timer interrupt body; emits the next waveform half-cell.
    pub fn on_timer_interrupt(&self) {
        critical_section::with(|cs| self.inner.borrow(cs).borrow_mut().tick())
    }
}

impl<P: TrackPins, C: BitClock, M: NonvolatileMemory> Inner<P, C, M> {
    fn tick(&mut self) {
        let Inner {
            generator,
            arena,
            queue,
            free,
            ..
        } = self;
        let mut feed = SchedulerFeed { arena, queue, free };
        generator.on_timer_tick(&mut feed);
    }

    fn power(&mut self, on: bool) {
        if on {
            self.generator.power_on();
        } else {
            let Inner {
                generator,
                arena,
                queue,
                free,
                ..
            } = self;
            let mut feed = SchedulerFeed { arena, queue, free };
            generator.power_off(&mut feed);
        }
    }

    fn handle(&mut self, command: &str) -> Response {
        let bytes = command.as_bytes();
        match bytes.first() {
            Some(b'P') => {
                self.power(bytes.get(1).copied().is_some_and(text_flag));
                Response::Acknowledge
            }
            Some(b'R') => match bytes.get(1) {
                Some(b'A') => {
                    self.reset_all();
                    Response::Acknowledge
                }
                Some(b'Q') => {
                    self.reset_queue();
                    Response::Acknowledge
                }
                Some(b'S') => {
                    self.keeper.reset_speed();
                    Response::Acknowledge
                }
                _ => Response::Unknown,
            },
            Some(b'H') => self.submit(|packet| packet.parse_hex(&command[1..]).map(|_| ())),
            Some(b'm' | b'M' | b'B' | b'E') => {
                self.submit(|packet| packet.parse_text(command).map(|_| ()))
            }
            _ => Response::Unknown,
        }
    }

    fn submit(
        &mut self,
        fill: impl FnOnce(&mut Packet) -> Result<(), PacketParseError>,
    ) -> Response {
        let Some(id) = self.free.take(&mut self.arena) else {
            return Response::Error;
        };
        if fill(self.arena.packet_mut(id)).is_err() {
            self.free.give(&mut self.arena, id);
            return Response::Unknown;
        }
        self.send(id);
        Response::Queued
    }

    /// State capture, then merge-or-enqueue. A successful merge recycles
    /// the new packet's slot; the rewritten entries keep their remaining
    /// repeats.
    fn send(&mut self, id: SlotId) {
        self.keeper.save_state(self.arena.packet(id));
        if self.queue.merge_replace(&mut self.arena, id, false) {
            self.free.give(&mut self.arena, id);
        } else {
            self.queue.push_back(&mut self.arena, id);
        }
    }

    fn reset_queue(&mut self) {
        while let Some(id) = self.queue.pop_front(&mut self.arena) {
            self.free.give(&mut self.arena, id);
        }
    }

    fn reset_all(&mut self) {
        self.power(false);
        self.reset_queue();
        self.keeper.reset_all();
        self.power(true);
    }
}

/// The scheduler side of the generator's frame-boundary callback.
struct SchedulerFeed<'a> {
    arena: &'a mut PacketArena,
    queue: &'a mut PacketQueue,
    free: &'a mut FreeList,
}

impl PacketFeed for SchedulerFeed<'_> {
    fn next_to_send(&mut self, sent: TxHandle) -> TxFrame {
        if let TxHandle::Slot(id) = sent {
            // A repeat count of N means N further transmissions, back to
            // back, before the next packet is pulled.
            let packet = self.arena.packet_mut(id);
            if packet.repeat() > 0 {
                packet.decrement_repeat();
                return TxFrame::of(self.arena.packet(id), sent);
            }
            self.free.give(self.arena, id);
        }
        match self.queue.pop_front(self.arena) {
            Some(id) => TxFrame::of(self.arena.packet(id), TxHandle::Slot(id)),
            None => TxFrame::idle(),
        }
    }

    fn return_back(&mut self, handle: TxHandle) {
        if let TxHandle::Slot(id) = handle {
            self.queue.push_front(self.arena, id);
        }
    }
}

//==================================================================================================
// Tests
//==================================================================================================
