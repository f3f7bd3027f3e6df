//! Packet scheduling collections: a fixed arena of packet slots, the
//! transmit FIFO and the free list, plus the duplicate-collapse rule that
//! rewrites queued packets of the same kind.
//!
//! Storage is owned by [PacketArena]; [PacketQueue] and [FreeList] are two
//! disjoint chains of [SlotId] handles into it, and a slot is on at most one
//! chain at any moment. The queue is drained by the waveform interrupt while
//! the main context appends, so the link updates are ordered such that a
//! `pop_front` observing any intermediate state still sees a consistent
//! chain.

use static_assertions::const_assert;

use crate::packet::Packet;
use crate::standard::{BA_ADDRESS_MASK_2, BA_PAIR_MASK};
use crate::standard::{
    MF_KIND3_ADVANCED_OPERATION, MF_KIND3_F0_F4, MF_KIND3_F5_F12, MF_KIND3_FORWARD_OPERATION,
    MF_KIND3_FUTURE_EXPANSION, MF_KIND3_MASK, MF_KIND3_REVERSE_OPERATION, MF_KIND4_F5_F8,
    MF_KIND4_MASK, MF_KIND8_F13_F20, MF_KIND8_F21_F28, MF_KIND8_SPEED_128,
};

/// Number of packet slots in the arena.
pub const QUEUE_DEPTH: usize = 20;

const_assert!(QUEUE_DEPTH <= u8::MAX as usize);

/// Handle of one arena slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SlotId(u8);

impl SlotId {
    #[inline]
    fn index(self) -> usize {
        self.0 as usize
    }

    #[cfg(test)]
    pub(crate) const fn new(value: u8) -> SlotId {
        SlotId(value)
    }
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    packet: Packet,
    next: Option<SlotId>,
}

impl Slot {
    const EMPTY: Slot = Slot {
        packet: Packet::new(),
        next: None,
    };
}

/// Owns the storage for every schedulable packet.
#[derive(Debug)]
pub struct PacketArena {
    slots: [Slot; QUEUE_DEPTH],
}

impl Default for PacketArena {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketArena {
    pub const fn new() -> Self {
        PacketArena {
            slots: [Slot::EMPTY; QUEUE_DEPTH],
        }
    }

    #[inline]
    pub fn packet(&self, id: SlotId) -> &Packet {
        &self.slots[id.index()].packet
    }

    #[inline]
    pub fn packet_mut(&mut self, id: SlotId) -> &mut Packet {
        &mut self.slots[id.index()].packet
    }

    #[inline]
    fn next_of(&self, id: SlotId) -> Option<SlotId> {
        self.slots[id.index()].next
    }

    #[inline]
    fn set_next(&mut self, id: SlotId, next: Option<SlotId>) {
        self.slots[id.index()].next = next;
    }
}

//==================================================================================================
// Free list
//==================================================================================================

/// Stack of reusable packet slots.
#[derive(Debug)]
pub struct FreeList {
    top: Option<SlotId>,
}

impl FreeList {
    /// Builds the free list over the whole arena, linking every slot.
    pub fn over(arena: &mut PacketArena) -> Self {
        for index in 0..QUEUE_DEPTH - 1 {
            arena.set_next(SlotId(index as u8), Some(SlotId(index as u8 + 1)));
        }
        arena.set_next(SlotId(QUEUE_DEPTH as u8 - 1), None);
        FreeList {
            top: Some(SlotId(0)),
        }
    }

    pub fn take(&mut self, arena: &mut PacketArena) -> Option<SlotId> {
        let id = self.top?;
        self.top = arena.next_of(id);
        Some(id)
    }

    pub fn give(&mut self, arena: &mut PacketArena, id: SlotId) {
        arena.set_next(id, self.top);
        self.top = Some(id);
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.top.is_none()
    }

    pub fn len(&self, arena: &PacketArena) -> usize {
        let mut count = 0;
        let mut cursor = self.top;
        while let Some(id) = cursor {
            count += 1;
            cursor = arena.next_of(id);
        }
        count
    }
}

//==================================================================================================
// Transmit queue
//==================================================================================================

/// FIFO of pending packets, drained by the waveform interrupt.
#[derive(Debug)]
pub struct PacketQueue {
    first: Option<SlotId>,
    last: Option<SlotId>,
}

impl Default for PacketQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketQueue {
    pub const fn new() -> Self {
        PacketQueue {
            first: None,
            last: None,
        }
    }

    /// Appends a packet. A concurrent `pop_front` from the interrupt may run
    /// between any two writes here, so the new slot is terminated before it
    /// becomes reachable through the old tail.
    pub fn push_back(&mut self, arena: &mut PacketArena, id: SlotId) {
        arena.set_next(id, None);
        let last = self.last;
        if let Some(last) = last {
            arena.set_next(last, Some(id));
        }
        self.last = Some(id);
        if self.first.is_none() {
            self.first = self.last;
        }
    }

    /// Prepends a packet; used to hand an interrupted transmission back.
    pub fn push_front(&mut self, arena: &mut PacketArena, id: SlotId) {
        arena.set_next(id, self.first);
        self.first = Some(id);
        if self.last.is_none() {
            self.last = self.first;
        }
    }

    pub fn pop_front(&mut self, arena: &mut PacketArena) -> Option<SlotId> {
        let id = self.first?;
        self.first = arena.next_of(id);
        if self.last == Some(id) {
            self.last = None;
        }
        Some(id)
    }

    #[inline]
    pub fn first(&self) -> Option<SlotId> {
        self.first
    }

    #[inline]
    pub fn last(&self) -> Option<SlotId> {
        self.last
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.first.is_none()
    }

    /// Linear count; only used outside the interrupt context.
    pub fn len(&self, arena: &PacketArena) -> usize {
        let mut count = 0;
        let mut cursor = self.first;
        while let Some(id) = cursor {
            count += 1;
            cursor = arena.next_of(id);
        }
        count
    }
}

//==================================================================================================
// Merge-replace
//==================================================================================================

/// Semantic category used by the duplicate-collapse rule. Packets outside
/// these categories (CV access, decoder control, reserved space) never
/// merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MergeKind {
    /// 14- and 28-step speed, both instruction types `010`/`011`.
    Speed28,
    Speed128,
    F0F4,
    F5F8,
    F9F12,
    F13F20,
    F21F28,
    /// Basic accessory output packet (3 bytes).
    BasicOutput,
    /// Extended accessory aspect packet (4 bytes).
    ExtendedOutput,
}

impl MergeKind {
    /// Classifies a packet, reading the instruction-type nibble and, where
    /// needed, the full sub-instruction byte.
    pub fn of(packet: &Packet) -> Option<MergeKind> {
        if packet.is_multi_function() {
            let command = packet.data_byte(if packet.is_address_short() { 1 } else { 2 });
            match command & MF_KIND3_MASK {
                MF_KIND3_ADVANCED_OPERATION => {
                    (command == MF_KIND8_SPEED_128).then_some(MergeKind::Speed128)
                }
                MF_KIND3_REVERSE_OPERATION | MF_KIND3_FORWARD_OPERATION => Some(MergeKind::Speed28),
                MF_KIND3_F0_F4 => Some(MergeKind::F0F4),
                MF_KIND3_F5_F12 => Some(if command & MF_KIND4_MASK == MF_KIND4_F5_F8 {
                    MergeKind::F5F8
                } else {
                    MergeKind::F9F12
                }),
                MF_KIND3_FUTURE_EXPANSION => match command {
                    MF_KIND8_F13_F20 => Some(MergeKind::F13F20),
                    MF_KIND8_F21_F28 => Some(MergeKind::F21F28),
                    _ => None,
                },
                _ => None,
            }
        } else if packet.is_basic_accessory() {
            (packet.size() == 3).then_some(MergeKind::BasicOutput)
        } else if packet.is_extended_accessory() {
            (packet.size() == 4).then_some(MergeKind::ExtendedOutput)
        } else {
            None
        }
    }
}

impl PacketQueue {
    /// Rewrites every queued packet of the same kind and address as the
    /// given one with its instruction bytes, recomputing the error byte.
    /// Broadcasts match every address of their family; basic-accessory
    /// broadcasts match on the output-pair bits only. Returns whether
    /// anything was rewritten; the caller decides whether the new packet
    /// still needs to be enqueued.
    pub fn merge_replace(&self, arena: &mut PacketArena, packet: SlotId, reset_repeat: bool) -> bool {
        let new = *arena.packet(packet);
        let Some(kind) = MergeKind::of(&new) else {
            return false;
        };
        let new_short = new.is_address_short();
        let broadcast = new.is_broadcast();

        let mut changed = false;
        let mut cursor = self.first;
        while let Some(id) = cursor {
            cursor = arena.next_of(id);
            let queued = arena.packet_mut(id);
            if !broadcast && queued.data_byte(0) != new.data_byte(0) {
                continue;
            }
            let queued_short = queued.is_address_short();
            if MergeKind::of(queued) != Some(kind) {
                continue;
            }
            match kind {
                MergeKind::Speed28 | MergeKind::F0F4 | MergeKind::F5F8 | MergeKind::F9F12 => {
                    // The broadcast address is itself short.
                    if !new_short && queued.data_byte(1) != new.data_byte(1) {
                        continue;
                    }
                    let value = new.data_byte(if new_short { 1 } else { 2 });
                    queued.set_data_byte(if queued_short { 1 } else { 2 }, value);
                }
                MergeKind::Speed128 | MergeKind::F13F20 | MergeKind::F21F28 => {
                    if !new_short && queued.data_byte(1) != new.data_byte(1) {
                        continue;
                    }
                    let value = new.data_byte(if new_short { 2 } else { 3 });
                    queued.set_data_byte(if queued_short { 2 } else { 3 }, value);
                }
                MergeKind::BasicOutput => {
                    if broadcast {
                        if (queued.data_byte(1) ^ new.data_byte(1)) & BA_PAIR_MASK != 0 {
                            continue;
                        }
                        let value = (queued.data_byte(1) & BA_ADDRESS_MASK_2)
                            | (new.data_byte(1) & !BA_ADDRESS_MASK_2);
                        queued.set_data_byte(1, value);
                    } else {
                        if (queued.data_byte(1) ^ new.data_byte(1))
                            & (BA_ADDRESS_MASK_2 | BA_PAIR_MASK)
                            != 0
                        {
                            continue;
                        }
                        queued.set_data_byte(1, new.data_byte(1));
                    }
                }
                MergeKind::ExtendedOutput => {
                    if !broadcast && queued.data_byte(1) != new.data_byte(1) {
                        continue;
                    }
                    queued.set_data_byte(2, new.data_byte(2));
                }
            }
            queued.update_error_byte();
            if reset_repeat {
                queued.reset_repeat();
            }
            changed = true;
        }
        changed
    }
}

//==================================================================================================
// Tests
//==================================================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{REPEAT_FUNCTION, REPEAT_SPEED};

    fn setup() -> (PacketArena, PacketQueue, FreeList) {
        let mut arena = PacketArena::new();
        let free = FreeList::over(&mut arena);
        (arena, PacketQueue::new(), free)
    }

    fn enqueue(
        arena: &mut PacketArena,
        queue: &mut PacketQueue,
        free: &mut FreeList,
        build: impl FnOnce(&mut Packet),
    ) -> SlotId {
        let id = free.take(arena).unwrap();
        build(arena.packet_mut(id));
        queue.push_back(arena, id);
        id
    }

    fn fresh(
        arena: &mut PacketArena,
        free: &mut FreeList,
        build: impl FnOnce(&mut Packet),
    ) -> SlotId {
        let id = free.take(arena).unwrap();
        build(arena.packet_mut(id));
        id
    }

    #[test]
    fn free_list_hands_out_every_slot_once() {
        let (mut arena, _, mut free) = setup();
        assert_eq!(free.len(&arena), QUEUE_DEPTH);

        let mut taken = std::vec::Vec::new();
        while let Some(id) = free.take(&mut arena) {
            assert!(!taken.contains(&id));
            taken.push(id);
        }
        assert_eq!(taken.len(), QUEUE_DEPTH);
        assert!(free.is_empty());
        assert!(free.take(&mut arena).is_none());

        for id in taken {
            free.give(&mut arena, id);
        }
        assert_eq!(free.len(&arena), QUEUE_DEPTH);
    }

    #[test]
    fn queue_is_first_in_first_out() {
        let (mut arena, mut queue, mut free) = setup();
        assert!(queue.is_empty());
        assert_eq!(queue.len(&arena), 0);

        let a = enqueue(&mut arena, &mut queue, &mut free, |p| {
            p.mf_address_short(1).speed28(true, 5);
        });
        let b = enqueue(&mut arena, &mut queue, &mut free, |p| {
            p.mf_address_short(2).speed28(true, 5);
        });
        let c = enqueue(&mut arena, &mut queue, &mut free, |p| {
            p.mf_address_short(3).speed28(true, 5);
        });
        assert_eq!(queue.len(&arena), 3);
        assert_eq!(queue.first(), Some(a));
        assert_eq!(queue.last(), Some(c));

        assert_eq!(queue.pop_front(&mut arena), Some(a));
        assert_eq!(queue.pop_front(&mut arena), Some(b));
        assert_eq!(queue.first(), Some(c));
        assert_eq!(queue.last(), Some(c));
        assert_eq!(queue.pop_front(&mut arena), Some(c));
        assert!(queue.is_empty());
        assert_eq!(queue.first(), None);
        assert_eq!(queue.last(), None);
        assert_eq!(queue.pop_front(&mut arena), None);
    }

    #[test]
    fn push_front_prepends_and_restores_tail() {
        let (mut arena, mut queue, mut free) = setup();
        let a = fresh(&mut arena, &mut free, |p| {
            p.mf_address_short(1).speed28(true, 5);
        });
        let b = fresh(&mut arena, &mut free, |p| {
            p.mf_address_short(2).speed28(true, 5);
        });

        queue.push_front(&mut arena, a);
        assert_eq!(queue.first(), Some(a));
        assert_eq!(queue.last(), Some(a));

        queue.push_front(&mut arena, b);
        assert_eq!(queue.first(), Some(b));
        assert_eq!(queue.last(), Some(a));
        assert_eq!(queue.pop_front(&mut arena), Some(b));
        assert_eq!(queue.pop_front(&mut arena), Some(a));
    }

    #[test]
    fn merge_rewrites_speed_kinds_in_place() {
        let (mut arena, mut queue, mut free) = setup();
        let short = enqueue(&mut arena, &mut queue, &mut free, |p| {
            p.mf_address_short(0x23).speed14(true, 0xA);
        });
        let long = enqueue(&mut arena, &mut queue, &mut free, |p| {
            p.mf_address_long(0x23).speed128(true, 0xA);
        });

        let new = fresh(&mut arena, &mut free, |p| {
            p.mf_address_long(0x23).speed128(true, 0xB);
        });
        assert!(queue.merge_replace(&mut arena, new, true));
        assert_eq!(queue.len(&arena), 2);
        assert_eq!(arena.packet(short).repeat(), REPEAT_SPEED);
        assert_eq!(arena.packet(short).data(), &[0x23, 0x6A, 0x49]);
        assert_eq!(arena.packet(long).repeat(), 0);
        assert_eq!(arena.packet(long).data(), &[0xC0, 0x23, 0x3F, 0x8B, 0x57]);

        let new = fresh(&mut arena, &mut free, |p| {
            p.mf_address_short(0x23).speed14(false, 0xC);
        });
        assert!(queue.merge_replace(&mut arena, new, false));
        assert_eq!(arena.packet(short).repeat(), REPEAT_SPEED);
        assert_eq!(arena.packet(short).data(), &[0x23, 0x4C, 0x6F]);
        assert_eq!(arena.packet(long).data(), &[0xC0, 0x23, 0x3F, 0x8B, 0x57]);

        // Broadcast speed packets rewrite every address of the same kind.
        let new = fresh(&mut arena, &mut free, |p| {
            p.mf_broadcast().speed28(true, 0xD);
        });
        assert!(queue.merge_replace(&mut arena, new, true));
        let new = fresh(&mut arena, &mut free, |p| {
            p.mf_broadcast().speed128(true, 0xE);
        });
        assert!(queue.merge_replace(&mut arena, new, true));

        assert_eq!(arena.packet(short).repeat(), 0);
        assert_eq!(arena.packet(short).data(), &[0x23, 0x76, 0x55]);
        assert_eq!(arena.packet(long).repeat(), 0);
        assert_eq!(arena.packet(long).data(), &[0xC0, 0x23, 0x3F, 0x8E, 0x52]);
    }

    #[test]
    fn merge_rewrites_function_kinds_independently() {
        let (mut arena, mut queue, mut free) = setup();
        let p1 = enqueue(&mut arena, &mut queue, &mut free, |p| {
            p.mf_address_short(0x23).function_f0_f4_bits(0x1A);
        });
        let p2 = enqueue(&mut arena, &mut queue, &mut free, |p| {
            p.mf_address_long(0x23).function_f5_f8_bits(0x0B);
        });
        let p3 = enqueue(&mut arena, &mut queue, &mut free, |p| {
            p.mf_address_short(0x23).function_f9_f12_bits(0x0C);
        });
        let p4 = enqueue(&mut arena, &mut queue, &mut free, |p| {
            p.mf_address_long(0x23).function_f13_f20_bits(0xDE);
        });
        let p5 = enqueue(&mut arena, &mut queue, &mut free, |p| {
            p.mf_address_short(0x23).function_f21_f28_bits(0xF0);
        });

        let new = fresh(&mut arena, &mut free, |p| {
            p.mf_address_short(0x23).function_f0_f4_bits(0x01);
        });
        assert!(queue.merge_replace(&mut arena, new, true));
        let new = fresh(&mut arena, &mut free, |p| {
            p.mf_address_long(0x23).function_f5_f8_bits(0x02);
        });
        assert!(queue.merge_replace(&mut arena, new, true));
        let new = fresh(&mut arena, &mut free, |p| {
            p.mf_address_short(0x23).function_f9_f12_bits(0x03);
        });
        assert!(queue.merge_replace(&mut arena, new, false));
        let new = fresh(&mut arena, &mut free, |p| {
            p.mf_address_long(0x23).function_f13_f20_bits(0x45);
        });
        assert!(queue.merge_replace(&mut arena, new, false));
        let new = fresh(&mut arena, &mut free, |p| {
            p.mf_address_short(0x23).function_f21_f28_bits(0x67);
        });
        assert!(queue.merge_replace(&mut arena, new, true));

        assert_eq!(queue.len(&arena), 5);
        assert_eq!(arena.packet(p1).repeat(), 0);
        assert_eq!(arena.packet(p1).data(), &[0x23, 0x81, 0xA2]);
        assert_eq!(arena.packet(p2).repeat(), 0);
        assert_eq!(arena.packet(p2).data(), &[0xC0, 0x23, 0xB2, 0x51]);
        assert_eq!(arena.packet(p3).repeat(), REPEAT_FUNCTION);
        assert_eq!(arena.packet(p3).data(), &[0x23, 0xA3, 0x80]);
        assert_eq!(arena.packet(p4).repeat(), REPEAT_FUNCTION);
        assert_eq!(arena.packet(p4).data(), &[0xC0, 0x23, 0xDE, 0x45, 0x78]);
        assert_eq!(arena.packet(p5).repeat(), 0);
        assert_eq!(arena.packet(p5).data(), &[0x23, 0xDF, 0x67, 0x9B]);
    }

    #[test]
    fn merge_rewrites_accessory_outputs() {
        let (mut arena, mut queue, mut free) = setup();
        let ba = enqueue(&mut arena, &mut queue, &mut free, |p| {
            p.ba_address(0x123, 3, 1).activate(true);
        });
        let ea = enqueue(&mut arena, &mut queue, &mut free, |p| {
            p.ea_address(0x789).state(0x1F);
        });

        // Unicast match requires the same address complement and pair bits.
        let new = fresh(&mut arena, &mut free, |p| {
            p.ba_address(0x123, 3, 0).activate(false);
        });
        assert!(queue.merge_replace(&mut arena, new, false));
        assert_eq!(arena.packet(ba).data(), &[0xA3, 0xB6, 0x15]);

        let other_port = fresh(&mut arena, &mut free, |p| {
            p.ba_address(0x123, 1, 0).activate(true);
        });
        assert!(!queue.merge_replace(&mut arena, other_port, false));

        // A broadcast matches on the pair bits only.
        let new = fresh(&mut arena, &mut free, |p| {
            p.ba_broadcast(3, 1).activate(true);
        });
        assert!(queue.merge_replace(&mut arena, new, false));
        assert_eq!(arena.packet(ba).data(), &[0xA3, 0xBF, 0x1C]);

        let new = fresh(&mut arena, &mut free, |p| {
            p.ea_address(0x789).state(0x02);
        });
        assert!(queue.merge_replace(&mut arena, new, false));
        assert_eq!(arena.packet(ea).data(), &[0x89, 0x17, 0x02, 0x9C]);

        let other_address = fresh(&mut arena, &mut free, |p| {
            p.ea_address(0x788).state(0x01);
        });
        assert!(!queue.merge_replace(&mut arena, other_address, false));
    }

    #[test]
    fn merge_skips_other_addresses_and_unknown_kinds() {
        let (mut arena, mut queue, mut free) = setup();
        enqueue(&mut arena, &mut queue, &mut free, |p| {
            p.mf_address_long(100).speed128(true, 10);
        });

        let other = fresh(&mut arena, &mut free, |p| {
            p.mf_address_long(101).speed128(true, 11);
        });
        assert!(!queue.merge_replace(&mut arena, other, true));

        // CV access is outside the merge categories.
        let unknown = fresh(&mut arena, &mut free, |p| {
            p.parse_hex("4003EC0A").unwrap();
        });
        assert_eq!(MergeKind::of(arena.packet(unknown)), None);
        assert!(!queue.merge_replace(&mut arena, unknown, true));

        let idle = fresh(&mut arena, &mut free, |p| {
            p.idle();
        });
        assert!(!queue.merge_replace(&mut arena, idle, true));
    }

    #[test]
    fn merge_is_idempotent_and_preserves_kind() {
        let (mut arena, mut queue, mut free) = setup();
        let queued = enqueue(&mut arena, &mut queue, &mut free, |p| {
            p.mf_address_short(52).speed28(true, 5);
        });
        let kind_before = MergeKind::of(arena.packet(queued));

        let new = fresh(&mut arena, &mut free, |p| {
            p.mf_address_short(52).speed28(true, 10);
        });
        assert!(queue.merge_replace(&mut arena, new, true));
        let once = *arena.packet(queued);

        assert!(queue.merge_replace(&mut arena, new, true));
        assert_eq!(*arena.packet(queued), once);
        assert_eq!(MergeKind::of(arena.packet(queued)), kind_before);
    }
}
