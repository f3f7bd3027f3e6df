//! Persistent per-decoder state: a bounded table in nonvolatile storage
//! remembering speed and function state per address, with LRU eviction and
//! a round-robin refresh iterator.
//!
//! Decoders that lose track power briefly recover their last operating
//! point because the commander re-injects refresh packets generated from
//! this table whenever the transmit queue runs empty. The table survives
//! command-station power cycles in the [NonvolatileMemory] it is given.
//!
//! Layout at the configured base address: one count byte, one generation
//! byte, then one 6-byte record per slot (address pair, access stamp, raw
//! speed byte, flag/F0-F4 byte, F5-F12 nibbles).

use arbitrary_int::u5;
use static_assertions::const_assert;

use crate::packet::Packet;
use crate::queue::{FreeList, PacketArena, PacketQueue};
use crate::standard::{
    MF_FUNCTION_F0_F4_MASK, MF_FUNCTION_F5_F8_MASK, MF_FUNCTION_F9_F12_MASK,
    MF_KIND3_ADVANCED_OPERATION, MF_KIND3_CONTROL, MF_KIND3_F0_F4, MF_KIND3_F5_F12,
    MF_KIND3_FORWARD_OPERATION, MF_KIND3_MASK, MF_KIND3_REVERSE_OPERATION, MF_KIND4_F5_F8,
    MF_KIND4_MASK, MF_KIND8_SPEED_128, MF_DECODER_HARD_RESET, MF_DECODER_SOFT_RESET,
    MF_SPEED_28_STOP, MF_SPEED_128_DIRECTION_MASK,
};

/// Number of per-address slots in the persistent table.
pub const STATE_CAPACITY: usize = 40;

/// Access stamps roll over together with the slot count window.
const GENERATION_WRAP: u8 = STATE_CAPACITY as u8;

const_assert!(STATE_CAPACITY <= u8::MAX as usize);

const HEADER_SIZE: u16 = 2;
const SLOT_SIZE: u16 = 6;

const OFFSET_ADDRESS_0: u16 = 0;
const OFFSET_ADDRESS_1: u16 = 1;
const OFFSET_ACCESSED: u16 = 2;
const OFFSET_SPEED: u16 = 3;
const OFFSET_FLAGS: u16 = 4;
const OFFSET_F5_F12: u16 = 5;

const F5_F8_SHIFT: u8 = 4;

/// Byte-addressable nonvolatile store backing the state table.
pub trait NonvolatileMemory {
    fn read(&mut self, address: u16) -> u8;
    fn write(&mut self, address: u16, value: u8);
}

/// The flag byte of a slot record. The low five bits double as the stored
/// F0-F4 state.
#[bitbybit::bitfield(u8, default = 0x0)]
#[derive(Debug, PartialEq, Eq)]
struct SlotFlags {
    /// Stored speed byte uses the 128-step format.
    #[bit(7, rw)]
    speed_128: bool,
    #[bit(6, rw)]
    f5_f8_active: bool,
    #[bit(5, rw)]
    f9_f12_active: bool,
    #[bits(0..=4, rw)]
    f0_f4: u5,
}

/// What a captured multi-function instruction does to a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StateKind {
    Speed28,
    Speed128,
    F0F4,
    F5F8,
    F9F12,
    ResetSpeed,
    ResetState,
}

impl StateKind {
    fn of(packet: &Packet) -> Option<StateKind> {
        let command = packet.data_byte(if packet.is_address_short() { 1 } else { 2 });
        match command & MF_KIND3_MASK {
            MF_KIND3_CONTROL => match command {
                MF_DECODER_SOFT_RESET => Some(StateKind::ResetSpeed),
                MF_DECODER_HARD_RESET => Some(StateKind::ResetState),
                _ => None,
            },
            MF_KIND3_ADVANCED_OPERATION => {
                (command == MF_KIND8_SPEED_128).then_some(StateKind::Speed128)
            }
            MF_KIND3_REVERSE_OPERATION | MF_KIND3_FORWARD_OPERATION => Some(StateKind::Speed28),
            MF_KIND3_F0_F4 => Some(StateKind::F0F4),
            MF_KIND3_F5_F12 => Some(if command & MF_KIND4_MASK == MF_KIND4_F5_F8 {
                StateKind::F5F8
            } else {
                StateKind::F9F12
            }),
            _ => None,
        }
    }
}

/// The persistent state table.
pub struct StateKeeper<M: NonvolatileMemory> {
    memory: M,
    base: u16,
    count: u8,
    generation: u8,
    /// Round-robin refresh position.
    cursor: u8,
}

impl<M: NonvolatileMemory> StateKeeper<M> {
    /// The table starts at `base` in the given store; call [begin] before
    /// use.
    ///
    /// [begin]: Self::begin
    pub fn new(memory: M, base: u16) -> Self {
        StateKeeper {
            memory,
            base,
            count: 0,
            generation: 0,
            cursor: 0,
        }
    }

    /// Loads the header. A header outside its valid range (power loss
    /// mid-write, first boot) silently resets the table.
    pub fn begin(&mut self) {
        self.cursor = 0;
        self.count = self.memory.read(self.base);
        self.generation = self.memory.read(self.base + 1);
        if self.count > STATE_CAPACITY as u8 || self.generation >= GENERATION_WRAP {
            self.reset_all();
        }
    }

    /// Empties the table. Stale slot bytes are left behind; only the header
    /// makes them reachable.
    pub fn reset_all(&mut self) {
        self.cursor = 0;
        self.count = 0;
        self.generation = 0;
        self.memory.write(self.base, 0);
        self.memory.write(self.base + 1, 0);
    }

    /// Clears the non-direction speed bits of every slot, as a broadcast
    /// soft reset would.
    pub fn reset_speed(&mut self) {
        for index in (0..self.count).rev() {
            let slot = self.slot_address(index);
            self.reset_slot_speed(slot);
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.count as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Captures the state carried by an outgoing packet. Broadcast
    /// instructions mutate every slot; unicast instructions find or
    /// allocate the slot for their address and stamp it with the current
    /// generation. Anything that is not a state-bearing multi-function
    /// instruction is ignored.
    pub fn save_state(&mut self, packet: &Packet) {
        if !packet.is_multi_function() || packet.is_idle() {
            return;
        }
        let Some(kind) = StateKind::of(packet) else {
            return;
        };
        if packet.is_multi_function_broadcast() {
            for index in (0..self.count).rev() {
                let slot = self.slot_address(index);
                self.apply(slot, kind, packet);
            }
            return;
        }
        let slot = self.find_slot(packet);
        self.apply(slot, kind, packet);
        self.memory.write(slot + OFFSET_ACCESSED, self.generation);
    }

    /// Emits the refresh packets for the slot under the round-robin cursor:
    /// one speed packet in the stored format, F0-F4, and F5-F8/F9-F12 when
    /// those groups have been seen. Packet objects come from the free list;
    /// when it runs dry the tail of the refresh is dropped and goes out one
    /// full cycle later.
    pub fn read_next_state(
        &mut self,
        arena: &mut PacketArena,
        queue: &mut PacketQueue,
        free: &mut FreeList,
    ) {
        if self.count == 0 {
            return;
        }
        let slot = self.slot_address(self.cursor);
        let address0 = self.memory.read(slot + OFFSET_ADDRESS_0);
        let address1 = self.memory.read(slot + OFFSET_ADDRESS_1);
        let speed = self.memory.read(slot + OFFSET_SPEED);
        let flags = self.flags(slot);
        let speed_128 = flags.speed_128();
        let f0_f4 = flags.f0_f4().value();
        let f5_f12 = self.memory.read(slot + OFFSET_F5_F12);

        let _ = emit(arena, queue, free, |packet| {
            packet.mf_address_bytes(address0, address1);
            if speed_128 {
                packet.speed128_bits(speed);
            } else {
                packet.speed28_bits(speed);
            }
        }) && emit(arena, queue, free, |packet| {
            packet
                .mf_address_bytes(address0, address1)
                .function_f0_f4_bits(f0_f4);
        }) && (!flags.f5_f8_active()
            || emit(arena, queue, free, |packet| {
                packet
                    .mf_address_bytes(address0, address1)
                    .function_f5_f8_bits(f5_f12 >> F5_F8_SHIFT);
            }))
            && (!flags.f9_f12_active()
                || emit(arena, queue, free, |packet| {
                    packet
                        .mf_address_bytes(address0, address1)
                        .function_f9_f12_bits(f5_f12 & MF_FUNCTION_F9_F12_MASK);
                }));

        self.cursor = (self.cursor + 1) % self.count;
    }

    #[inline]
    fn slot_address(&self, index: u8) -> u16 {
        self.base + HEADER_SIZE + index as u16 * SLOT_SIZE
    }

    fn flags(&mut self, slot: u16) -> SlotFlags {
        SlotFlags::new_with_raw_value(self.memory.read(slot + OFFSET_FLAGS))
    }

    fn set_flags(&mut self, slot: u16, flags: SlotFlags) {
        self.memory.write(slot + OFFSET_FLAGS, flags.raw_value());
    }

    /// Finds the slot for the packet's address, or allocates one: append
    /// while capacity lasts, else reuse the least recently stamped slot.
    fn find_slot(&mut self, packet: &Packet) -> u16 {
        let address0 = packet.data_byte(0);
        let address1 = if packet.is_address_short() {
            0
        } else {
            packet.data_byte(1)
        };

        let mut oldest_rank = u16::MAX;
        let mut oldest = 0;
        for index in (0..self.count).rev() {
            let slot = self.slot_address(index);
            if self.memory.read(slot + OFFSET_ADDRESS_0) == address0
                && self.memory.read(slot + OFFSET_ADDRESS_1) == address1
            {
                return slot;
            }
            // Stamps are compared inside a wrap window anchored at the
            // current generation; stamps at or below it count as one wrap
            // older.
            let stamp = self.memory.read(slot + OFFSET_ACCESSED);
            let mut rank = stamp as u16;
            if stamp <= self.generation {
                rank += GENERATION_WRAP as u16;
            }
            if rank <= oldest_rank {
                oldest_rank = rank;
                oldest = index;
            }
        }

        if self.count < STATE_CAPACITY as u8 {
            return self.append(packet);
        }
        let slot = self.slot_address(oldest);
        self.reset_address(slot, packet);
        slot
    }

    fn append(&mut self, packet: &Packet) -> u16 {
        let slot = self.slot_address(self.count);
        self.reset_address(slot, packet);
        self.count += 1;
        self.memory.write(self.base, self.count);
        slot
    }

    /// Claims a slot for a new address: advances the generation, writes the
    /// address pair and restores the power-up state.
    fn reset_address(&mut self, slot: u16, packet: &Packet) {
        self.generation = (self.generation + 1) % GENERATION_WRAP;
        self.memory.write(self.base + 1, self.generation);
        self.memory.write(slot + OFFSET_ADDRESS_0, packet.data_byte(0));
        let address1 = if packet.is_address_short() {
            0
        } else {
            packet.data_byte(1)
        };
        self.memory.write(slot + OFFSET_ADDRESS_1, address1);
        self.reset_slot_state(slot);
    }

    fn apply(&mut self, slot: u16, kind: StateKind, packet: &Packet) {
        match kind {
            StateKind::Speed28 => self.update_speed28(slot, packet),
            StateKind::Speed128 => self.update_speed128(slot, packet),
            StateKind::F0F4 => self.update_f0_f4(slot, packet),
            StateKind::F5F8 => self.update_f5_f8(slot, packet),
            StateKind::F9F12 => self.update_f9_f12(slot, packet),
            StateKind::ResetSpeed => self.reset_slot_speed(slot),
            StateKind::ResetState => self.reset_slot_state(slot),
        }
    }

    fn command_byte(packet: &Packet, second: bool) -> u8 {
        let base = if packet.is_address_short() { 1 } else { 2 };
        packet.data_byte(base + second as usize)
    }

    fn update_speed28(&mut self, slot: u16, packet: &Packet) {
        let flags = self.flags(slot).with_speed_128(false);
        self.set_flags(slot, flags);
        self.memory
            .write(slot + OFFSET_SPEED, Self::command_byte(packet, false));
    }

    fn update_speed128(&mut self, slot: u16, packet: &Packet) {
        let flags = self.flags(slot).with_speed_128(true);
        self.set_flags(slot, flags);
        self.memory
            .write(slot + OFFSET_SPEED, Self::command_byte(packet, true));
    }

    fn update_f0_f4(&mut self, slot: u16, packet: &Packet) {
        let bits = Self::command_byte(packet, false) & MF_FUNCTION_F0_F4_MASK;
        let flags = self.flags(slot).with_f0_f4(u5::new(bits));
        self.set_flags(slot, flags);
    }

    fn update_f5_f8(&mut self, slot: u16, packet: &Packet) {
        let flags = self.flags(slot).with_f5_f8_active(true);
        self.set_flags(slot, flags);
        let kept = self.memory.read(slot + OFFSET_F5_F12) & MF_FUNCTION_F9_F12_MASK;
        let bits = Self::command_byte(packet, false) & MF_FUNCTION_F5_F8_MASK;
        self.memory
            .write(slot + OFFSET_F5_F12, kept | (bits << F5_F8_SHIFT));
    }

    fn update_f9_f12(&mut self, slot: u16, packet: &Packet) {
        let flags = self.flags(slot).with_f9_f12_active(true);
        self.set_flags(slot, flags);
        let kept = self.memory.read(slot + OFFSET_F5_F12) & (MF_FUNCTION_F5_F8_MASK << F5_F8_SHIFT);
        let bits = Self::command_byte(packet, false) & MF_FUNCTION_F9_F12_MASK;
        self.memory.write(slot + OFFSET_F5_F12, kept | bits);
    }

    /// Keeps the direction, zeroes the speed bits in the stored format.
    fn reset_slot_speed(&mut self, slot: u16) {
        let speed = self.memory.read(slot + OFFSET_SPEED);
        let kept = if self.flags(slot).speed_128() {
            speed & MF_SPEED_128_DIRECTION_MASK
        } else {
            speed & MF_KIND3_MASK
        };
        self.memory.write(slot + OFFSET_SPEED, kept);
    }

    /// Power-up state: forward stop, every function off.
    fn reset_slot_state(&mut self, slot: u16) {
        self.set_flags(slot, SlotFlags::new_with_raw_value(0));
        self.memory.write(
            slot + OFFSET_SPEED,
            MF_KIND3_FORWARD_OPERATION | MF_SPEED_28_STOP,
        );
        self.memory.write(slot + OFFSET_F5_F12, 0);
    }
}

/// Builds one refresh packet in a fresh slot and queues it. False when the
/// free list is exhausted.
fn emit(
    arena: &mut PacketArena,
    queue: &mut PacketQueue,
    free: &mut FreeList,
    fill: impl FnOnce(&mut Packet),
) -> bool {
    let Some(id) = free.take(arena) else {
        return false;
    };
    fill(arena.packet_mut(id));
    queue.push_back(arena, id);
    true
}

//==================================================================================================
// Tests
//==================================================================================================
