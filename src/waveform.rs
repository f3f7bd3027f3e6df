//! Timer-driven generator for the DCC track waveform.
//!
//! The generator drives a differential pin pair and one programmable
//! interval timer. Every timer interrupt emits one half-cell edge: the pins
//! swap polarity between the two half-cells of a bit and the programmed
//! interval encodes the bit value (58 µs halves for `1`, 100 µs halves for
//! `0`). After a packet that requests an acknowledgement, both drivers are
//! pulled low for the RailCom cutout window.
//!
//! Packets are pulled through the [PacketFeed] callback at the preamble
//! boundary, so the generator can be exercised deterministically against a
//! scripted feed and a fake clock.

use embedded_hal::digital::OutputPin;
use fugit::MicrosDurationU32;

use crate::packet::{Acknowledge, Packet};
use crate::queue::SlotId;
use crate::standard::DATA_SIZE_MAX;

/// Half-cell time of a `1` bit (S-9.2).
pub const HALF_CELL_ONE: MicrosDurationU32 = MicrosDurationU32::micros(58);
/// Half-cell time of a `0` bit.
pub const HALF_CELL_ZERO: MicrosDurationU32 = MicrosDurationU32::micros(100);
/// Pad from the last bit edge to the start of the cutout.
pub const CUTOUT_LEAD: MicrosDurationU32 = MicrosDurationU32::micros(28);
/// Cutout window for a one-byte decoder reply.
pub const CUTOUT_SHORT: MicrosDurationU32 = MicrosDurationU32::micros(196);
/// Cutout window for a two-byte decoder reply.
pub const CUTOUT_LONG: MicrosDurationU32 = MicrosDurationU32::micros(420);

/// S-9.2 requires at least 14 preamble bits.
pub const PREAMBLE_BITS_MIN: u8 = 14;
pub const PREAMBLE_BITS_DEFAULT: u8 = 15;

//==================================================================================================
// Hardware seams
//==================================================================================================

/// Differential driver for the track pin pair.
pub trait TrackPins {
    /// Drive the pair to the given polarity (`true`: A high, B low).
    fn set_polarity(&mut self, positive: bool);
    /// Pull both drivers low (cutout window and power off).
    fn cut_power(&mut self);
}

/// One-shot compare timer in count-up-then-reload mode. Each interrupt runs
/// [WaveformGenerator::on_timer_tick], which programs the delay until the
/// next one.
pub trait BitClock {
    /// Begin ticking; the first interrupt fires after `first`.
    fn start(&mut self, first: MicrosDurationU32);
    /// Program the delay between the current interrupt and the next one.
    fn set_interval(&mut self, interval: MicrosDurationU32);
    /// Halt the clock; no further interrupts fire.
    fn stop(&mut self);
}

/// [TrackPins] over any two push-pull output pins.
pub struct TrackOutput<A, B> {
    pin_a: A,
    pin_b: B,
}

impl<A: OutputPin, B: OutputPin> TrackOutput<A, B> {
    pub fn new(pin_a: A, pin_b: B) -> Self {
        TrackOutput { pin_a, pin_b }
    }

    pub fn release(self) -> (A, B) {
        (self.pin_a, self.pin_b)
    }
}

impl<A: OutputPin, B: OutputPin> TrackPins for TrackOutput<A, B> {
    fn set_polarity(&mut self, positive: bool) {
        if positive {
            self.pin_a.set_high().ok();
            self.pin_b.set_low().ok();
        } else {
            self.pin_a.set_low().ok();
            self.pin_b.set_high().ok();
        }
    }

    fn cut_power(&mut self) {
        self.pin_a.set_low().ok();
        self.pin_b.set_low().ok();
    }
}

//==================================================================================================
// Packet feed
//==================================================================================================

/// Identity of a frame handed to the generator: a scheduler slot, or the
/// shared idle packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TxHandle {
    Idle,
    Slot(SlotId),
}

/// Snapshot of the frame being transmitted. The bytes are copied out of the
/// scheduler at fetch time so the interrupt never reads shared packet
/// storage mid-frame.
#[derive(Debug, Clone, Copy)]
pub struct TxFrame {
    pub handle: TxHandle,
    pub data: [u8; DATA_SIZE_MAX],
    pub size: u8,
    pub acknowledge: Acknowledge,
}

impl TxFrame {
    /// The static idle frame emitted whenever nothing is pending.
    pub const fn idle() -> Self {
        TxFrame {
            handle: TxHandle::Idle,
            data: [0xFF, 0x00, 0xFF, 0x00, 0x00, 0x00],
            size: 3,
            acknowledge: Acknowledge::None,
        }
    }

    /// Snapshot of a scheduled packet.
    pub fn of(packet: &Packet, handle: TxHandle) -> Self {
        TxFrame {
            handle,
            data: *packet.raw_data(),
            size: packet.size() as u8,
            acknowledge: packet.acknowledge(),
        }
    }
}

/// Scheduler callback used by the generator at frame boundaries.
pub trait PacketFeed {
    /// Hand back the frame that just finished and fetch the next one.
    fn next_to_send(&mut self, sent: TxHandle) -> TxFrame;
    /// Return an unprocessed frame on power-down.
    fn return_back(&mut self, handle: TxHandle);
}

//==================================================================================================
// Generator
//==================================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum TxState {
    PowerOff,
    Preamble,
    ByteStartBit,
    SendByte,
    PacketEndBit,
    CutoutWait,
    CutoutRun,
}

/// The waveform state machine. One instance owns one physical output pair;
/// independent instances are fully isolated.
pub struct WaveformGenerator<P: TrackPins, C: BitClock> {
    pins: P,
    clock: C,
    preamble_bits: u8,
    state: TxState,
    /// Polarity of the half-cell that starts at the next tick.
    positive: bool,
    preamble_left: u8,
    frame: TxFrame,
    byte_index: u8,
    bit_mask: u8,
}

impl<P: TrackPins, C: BitClock> WaveformGenerator<P, C> {
    /// `preamble_bits` below the S-9.2 minimum of 14 is clamped up.
    pub fn new(pins: P, clock: C, preamble_bits: u8) -> Self {
        WaveformGenerator {
            pins,
            clock,
            preamble_bits: preamble_bits.max(PREAMBLE_BITS_MIN),
            state: TxState::PowerOff,
            positive: true,
            preamble_left: 0,
            frame: TxFrame::idle(),
            byte_index: 0,
            bit_mask: 0,
        }
    }

    #[inline]
    pub fn is_powered(&self) -> bool {
        self.state != TxState::PowerOff
    }

    /// Starts emission; the next preamble begins immediately.
    pub fn power_on(&mut self) {
        if self.state != TxState::PowerOff {
            return;
        }
        self.state = TxState::CutoutRun;
        self.positive = true;
        self.clock.start(HALF_CELL_ONE);
    }

    /// Stops the clock, drives both pins low and hands the in-flight frame
    /// back so transmission resumes with it after the next power up.
    pub fn power_off(&mut self, feed: &mut impl PacketFeed) {
        self.clock.stop();
        self.state = TxState::PowerOff;
        self.pins.cut_power();
        feed.return_back(self.frame.handle);
        self.frame = TxFrame::idle();
    }

    /// The timer interrupt body. Must complete well inside the 58 µs
    /// half-cell of a `1` bit.
    pub fn on_timer_tick(&mut self, feed: &mut impl PacketFeed) {
        if self.state == TxState::CutoutWait {
            self.pins.cut_power();
            self.state = TxState::CutoutRun;
            self.clock.set_interval(if self.frame.acknowledge == Acknowledge::Short {
                CUTOUT_SHORT
            } else {
                CUTOUT_LONG
            });
            // Guarantees the next tick falls through to the state switch.
            self.positive = true;
            return;
        }

        self.pins.set_polarity(self.positive);
        self.positive = !self.positive;
        if self.positive {
            // First half-cell done; the second runs with the same interval.
            return;
        }

        match self.state {
            TxState::Preamble => {
                self.preamble_left -= 1;
                if self.preamble_left > 0 {
                    return;
                }
                self.frame = feed.next_to_send(self.frame.handle);
                self.byte_index = 0;
                self.state = TxState::ByteStartBit;
                self.clock.set_interval(HALF_CELL_ZERO);
            }
            TxState::ByteStartBit => {
                self.bit_mask = 0x80;
                self.state = TxState::SendByte;
                self.data_bit();
            }
            TxState::SendByte => self.data_bit(),
            TxState::PacketEndBit => {
                if matches!(self.frame.acknowledge, Acknowledge::Short | Acknowledge::Long) {
                    self.state = TxState::CutoutWait;
                    self.clock.set_interval(CUTOUT_LEAD);
                } else {
                    self.begin_preamble();
                }
            }
            TxState::CutoutRun => self.begin_preamble(),
            TxState::PowerOff | TxState::CutoutWait => {}
        }
    }

    fn data_bit(&mut self) {
        if self.bit_mask != 0 {
            let one = self.frame.data[self.byte_index as usize] & self.bit_mask != 0;
            self.clock.set_interval(if one { HALF_CELL_ONE } else { HALF_CELL_ZERO });
            self.bit_mask >>= 1;
            return;
        }
        self.byte_index += 1;
        if self.byte_index == self.frame.size {
            self.state = TxState::PacketEndBit;
            self.clock.set_interval(HALF_CELL_ONE);
        } else {
            self.state = TxState::ByteStartBit;
            self.clock.set_interval(HALF_CELL_ZERO);
        }
    }

    fn begin_preamble(&mut self) {
        self.preamble_left = self.preamble_bits;
        self.state = TxState::Preamble;
        self.clock.set_interval(HALF_CELL_ONE);
    }
}

//==================================================================================================
// Tests
//==================================================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::SlotId;
    use crate::test_support::{Drive, TestClock, TestTrack};
    use std::collections::VecDeque;
    use std::vec::Vec;

    struct ScriptFeed {
        pending: VecDeque<TxFrame>,
        sent: Vec<TxHandle>,
        returned: Vec<TxHandle>,
    }

    impl ScriptFeed {
        fn new(frames: &[TxFrame]) -> Self {
            ScriptFeed {
                pending: frames.iter().copied().collect(),
                sent: Vec::new(),
                returned: Vec::new(),
            }
        }
    }

    impl PacketFeed for ScriptFeed {
        fn next_to_send(&mut self, sent: TxHandle) -> TxFrame {
            self.sent.push(sent);
            self.pending.pop_front().unwrap_or(TxFrame::idle())
        }

        fn return_back(&mut self, handle: TxHandle) {
            self.returned.push(handle);
        }
    }

    struct Bench {
        generator: WaveformGenerator<TestTrack, TestClock>,
        feed: ScriptFeed,
        track: TestTrack,
        clock: TestClock,
    }

    fn bench(frames: &[TxFrame]) -> Bench {
        let track = TestTrack::new();
        let clock = TestClock::new();
        let mut generator = WaveformGenerator::new(track.clone(), clock.clone(), 15);
        generator.power_on();
        Bench {
            generator,
            feed: ScriptFeed::new(frames),
            track,
            clock,
        }
    }

    fn frame(build: impl FnOnce(&mut Packet), slot: u8) -> TxFrame {
        let mut packet = Packet::new();
        build(&mut packet);
        TxFrame::of(&packet, TxHandle::Slot(SlotId::new(slot)))
    }

    impl Bench {
        fn tick(&mut self) -> (Drive, u32) {
            self.generator.on_timer_tick(&mut self.feed);
            (self.track.drive(), self.clock.interval_us())
        }

        /// Steps both half-cells of one bit and checks duration and the
        /// differential polarity flip.
        #[track_caller]
        fn expect_bit(&mut self, value: bool) {
            let wanted = if value { 58 } else { 100 };
            let (first_drive, first_interval) = self.tick();
            let (second_drive, second_interval) = self.tick();
            assert_ne!(first_drive, Drive::Off);
            assert_ne!(second_drive, Drive::Off);
            assert_ne!(first_drive, second_drive);
            assert_eq!(first_interval, wanted);
            assert_eq!(second_interval, wanted);
        }

        #[track_caller]
        fn expect_cutout(&mut self, length: u32) {
            let (lead_drive, lead_interval) = self.tick();
            assert_ne!(lead_drive, Drive::Off);
            assert_eq!(lead_interval, 28);
            let (cut_drive, cut_interval) = self.tick();
            assert_eq!(cut_drive, Drive::Off);
            assert_eq!(cut_interval, length);
        }

        #[track_caller]
        fn expect_frame(&mut self, data: &[u8]) {
            for _ in 0..15 {
                self.expect_bit(true);
            }
            for byte in data {
                self.expect_bit(false);
                for shift in (0..8).rev() {
                    self.expect_bit(byte & (1 << shift) != 0);
                }
            }
            self.expect_bit(true);
        }
    }

    #[test]
    fn idle_frame_on_empty_feed() {
        let mut bench = bench(&[]);
        bench.expect_frame(&[0xFF, 0x00, 0xFF]);
        // Straight into the next preamble.
        bench.expect_bit(true);
        assert_eq!(bench.feed.sent, [TxHandle::Idle]);
    }

    #[test]
    fn frames_of_every_size_are_emitted_bit_exact() {
        for data in [
            &[0x12, 0x34, 0x26][..],
            &[0x12, 0x34, 0x56, 0x70][..],
            &[0x12, 0x34, 0x56, 0x78, 0x08][..],
            &[0x12, 0x34, 0x56, 0x78, 0x9A, 0x92][..],
        ] {
            let mut packet = Packet::new();
            packet
                .parse_hex(frame_hex(data).as_str())
                .unwrap();
            let script = TxFrame::of(&packet, TxHandle::Slot(SlotId::new(0)));
            let mut bench = bench(&[script]);
            bench.expect_frame(data);
            bench.expect_bit(true);
        }
    }

    /// Hex command for an arbitrary payload (info byte with matching size).
    fn frame_hex(data: &[u8]) -> std::string::String {
        use std::fmt::Write;
        let mut text = std::string::String::new();
        write!(text, "{:02X}", ((data.len() - 3) as u8) << 6).unwrap();
        for byte in &data[..data.len() - 1] {
            write!(text, "{byte:02X}").unwrap();
        }
        text
    }

    #[test]
    fn short_acknowledge_opens_one_byte_cutout() {
        let mut script = frame(
            |p| {
                p.mf_address_short(0x12).speed28(true, 10);
            },
            3,
        );
        script.acknowledge = Acknowledge::Short;
        let data = [script.data[0], script.data[1], script.data[2]];

        let mut bench = bench(&[script]);
        bench.expect_frame(&data);
        bench.expect_cutout(196);
        bench.expect_bit(true);
    }

    #[test]
    fn long_acknowledge_opens_two_byte_cutout() {
        let mut script = frame(
            |p| {
                p.mf_address_short(0x12).speed28(true, 10);
            },
            3,
        );
        script.acknowledge = Acknowledge::Long;
        let data = [script.data[0], script.data[1], script.data[2]];

        let mut bench = bench(&[script]);
        bench.expect_frame(&data);
        bench.expect_cutout(420);
        bench.expect_bit(true);
    }

    #[test]
    fn finished_frame_is_handed_back_at_the_next_fetch() {
        let first = frame(
            |p| {
                p.mf_address_short(1).speed28(true, 10);
            },
            0,
        );
        let second = frame(
            |p| {
                p.mf_address_short(2).speed28(true, 10);
            },
            1,
        );
        let mut bench = bench(&[first, second]);
        bench.expect_frame(&first.data[..3]);
        bench.expect_frame(&second.data[..3]);
        assert_eq!(
            bench.feed.sent,
            [TxHandle::Idle, TxHandle::Slot(SlotId::new(0))]
        );
    }

    #[test]
    fn power_off_returns_the_packet_and_silences_the_track() {
        let script = frame(
            |p| {
                p.mf_address_short(1).speed28(true, 10);
            },
            7,
        );
        let mut bench = bench(&[script]);
        // Interrupt the frame somewhere inside the first data byte.
        for _ in 0..40 {
            bench.tick();
        }
        bench.generator.power_off(&mut bench.feed);
        assert!(!bench.generator.is_powered());
        assert_eq!(bench.track.drive(), Drive::Off);
        assert!(!bench.clock.is_running());
        assert_eq!(bench.feed.returned, [TxHandle::Slot(SlotId::new(7))]);

        // Power-up resumes with a fresh preamble and a fresh fetch.
        bench.generator.power_on();
        assert!(bench.clock.is_running());
        bench.expect_frame(&[0xFF, 0x00, 0xFF]);
        assert_eq!(*bench.feed.sent.last().unwrap(), TxHandle::Idle);
    }

    #[test]
    fn preamble_length_is_clamped_to_the_standard_minimum() {
        let track = TestTrack::new();
        let clock = TestClock::new();
        let mut generator = WaveformGenerator::new(track.clone(), clock.clone(), 8);
        generator.power_on();
        let mut bench = Bench {
            generator,
            feed: ScriptFeed::new(&[]),
            track,
            clock,
        };
        for _ in 0..14 {
            bench.expect_bit(true);
        }
        // Bit 15 is already the start bit of the idle packet.
        bench.expect_bit(false);
    }
}
