//! Bit-field constants from NMRA S-9.2 (baseline packets) and RP-9.2.1
//! (extended packet formats).
//!
//! Values are kept byte-aligned with the wire layout so builders and
//! classifiers can combine them with plain masking. Instruction space the
//! core only passes through (consist control, CV access, binary state
//! control) is listed as well, since raw hex commands may legitimately carry
//! it.

//==================================================================================================
// Packet geometry
//==================================================================================================

/// Baseline packets carry 3 data bytes, extended packets up to 6.
pub const DATA_SIZE_MIN: usize = 3;
pub const DATA_SIZE_MAX: usize = 6;

//==================================================================================================
// Primary address partitions (RP-9.2.1 section A)
//==================================================================================================

pub const ADDRESS_BROADCAST: u8 = 0x00;
pub const ADDRESS_IDLE: u8 = 0xFF;

pub const ADDRESS_SHORT_MASK: u8 = 0x7F;
pub const ADDRESS_SHORT_MIN: u8 = 0x01;
pub const ADDRESS_SHORT_MAX: u8 = 0x7F;

/// First byte of every accessory packet: `10AAAAAA`.
pub const ADDRESS_ACCESSORY_MIN: u8 = 0x80;
pub const ADDRESS_ACCESSORY_MAX: u8 = 0xBF;
pub const ADDRESS_ACCESSORY_BROADCAST: u8 = 0xBF;

/// 14-bit addresses span two bytes; the first is `11AAAAAA` below 0xE8.
pub const ADDRESS_LONG_MASK: u8 = 0x3F;
pub const ADDRESS_LONG_MIN: u8 = 0xC0;
pub const ADDRESS_LONG_MAX: u8 = 0xE7;

pub const ADDRESS_RESERVED_MIN: u8 = 0xE8;
pub const ADDRESS_RESERVED_MAX: u8 = 0xFE;

//==================================================================================================
// Multi-function instruction type field (RP-9.2.1 section C)
//==================================================================================================

pub const MF_KIND2_MASK: u8 = 0xC0;
pub const MF_KIND3_MASK: u8 = 0xE0;
pub const MF_KIND4_MASK: u8 = 0xF0;
pub const MF_KIND8_MASK: u8 = 0xFF;

/// Both speed-and-direction instruction types share bit 6.
pub const MF_KIND2_SPEED_OPERATION: u8 = 0x40;

pub const MF_KIND3_CONTROL: u8 = 0x00;
pub const MF_KIND3_ADVANCED_OPERATION: u8 = 0x20;
pub const MF_KIND3_REVERSE_OPERATION: u8 = 0x40;
pub const MF_KIND3_FORWARD_OPERATION: u8 = 0x60;
pub const MF_KIND3_F0_F4: u8 = 0x80;
pub const MF_KIND3_F5_F12: u8 = 0xA0;
pub const MF_KIND3_FUTURE_EXPANSION: u8 = 0xC0;
pub const MF_KIND3_CONFIG_VARIABLE_ACCESS: u8 = 0xE0;

//==================================================================================================
// Decoder and consist control (instruction type 000)
//==================================================================================================

pub const MF_KIND4_DECODER_CONTROL: u8 = 0x00;
pub const MF_DECODER_CONTROL_MASK: u8 = 0x0F;

/// `0000 0000`: erase volatile state, return to the power-up operating point.
pub const MF_DECODER_SOFT_RESET: u8 = 0x00;
/// `0000 0001`: factory-reset CV 29/31/32 and consist address, then soft reset.
pub const MF_DECODER_HARD_RESET: u8 = 0x01;
pub const MF_DECODER_FACTORY_TEST: u8 = 0x02;
pub const MF_DECODER_SET_FLAGS: u8 = 0x07;
pub const MF_DECODER_SET_SHORT_ADDRESS: u8 = 0x0A;
pub const MF_DECODER_SET_LONG_ADDRESS: u8 = 0x0B;
pub const MF_DECODER_ACKNOWLEDGMENT: u8 = 0x0F;

pub const MF_KIND4_CONSIST_CONTROL: u8 = 0x10;
pub const MF_CONSIST_CONTROL_MASK: u8 = 0x0F;
pub const MF_CONSIST_SET_ADDRESS_NORMAL: u8 = 0x02;
pub const MF_CONSIST_SET_ADDRESS_REVERSE: u8 = 0x03;
pub const MF_CONSIST_ADDRESS_MASK: u8 = 0x7F;

//==================================================================================================
// Advanced operations (instruction type 001)
//==================================================================================================

/// `001 11111`: 128-step speed control, speed byte follows.
pub const MF_KIND8_SPEED_128: u8 = 0x3F;
/// `001 11110`: restricted speed step instruction.
pub const MF_KIND8_SPEED_LIMIT: u8 = 0x3E;

pub const MF_SPEED_128_MASK: u8 = 0x7F;
pub const MF_SPEED_128_STOP: u8 = 0x00;
pub const MF_SPEED_128_EMERGENCY_STOP: u8 = 0x01;
pub const MF_SPEED_128_MIN: u8 = 0x02;
pub const MF_SPEED_128_MAX: u8 = 0x7F;
pub const MF_SPEED_128_DIRECTION_MASK: u8 = 0x80;
pub const MF_SPEED_128_FORWARD: u8 = 0x80;
pub const MF_SPEED_128_REVERSE: u8 = 0x00;

//==================================================================================================
// Speed and direction (instruction types 010 and 011)
//==================================================================================================

pub const MF_SPEED_14_MASK: u8 = 0x0F;
pub const MF_SPEED_14_STOP: u8 = 0x00;
pub const MF_SPEED_14_EMERGENCY_STOP: u8 = 0x01;
pub const MF_SPEED_14_MIN: u8 = 0x02;
pub const MF_SPEED_14_MAX: u8 = 0x0F;

/// 28-step speed values interleave the intermediate-step bit: the four high
/// bits land in bits 3..0 and the least significant bit lands in bit 4.
pub const MF_SPEED_28_MASK: u8 = 0x1F;
pub const MF_SPEED_28_STOP: u8 = 0x00;
pub const MF_SPEED_28_EMERGENCY_STOP: u8 = 0x02;
pub const MF_SPEED_28_MIN: u8 = 0x04;
pub const MF_SPEED_28_MAX: u8 = 0x1F;

pub const MF_SPEED_28_HBIT_MASK: u8 = 0x0F;
pub const MF_SPEED_28_HBIT_SHIFT: u8 = 1;
pub const MF_SPEED_28_LBIT_MASK: u8 = 0x10;
pub const MF_SPEED_28_LBIT_SHIFT: u8 = 4;

//==================================================================================================
// Function groups (instruction types 100, 101 and 110 sub-instructions)
//==================================================================================================

pub const MF_FUNCTION_F0_F4_MASK: u8 = 0x1F;
pub const MF_FUNCTION_F0: u8 = 0x10;
pub const MF_FUNCTION_F1: u8 = 0x01;
pub const MF_FUNCTION_F2: u8 = 0x02;
pub const MF_FUNCTION_F3: u8 = 0x04;
pub const MF_FUNCTION_F4: u8 = 0x08;

/// Function group two selects F5-F8 or F9-F12 with bit 4.
pub const MF_KIND4_F5_F8: u8 = 0xB0;
pub const MF_KIND4_F9_F12: u8 = 0xA0;
pub const MF_FUNCTION_F5_F8_MASK: u8 = 0x0F;
pub const MF_FUNCTION_F9_F12_MASK: u8 = 0x0F;

/// Feature expansion sub-instructions carrying one extra data byte.
pub const MF_KIND8_LONG_STATE_CONTROL: u8 = 0xC0;
pub const MF_KIND8_SHORT_STATE_CONTROL: u8 = 0xDD;
pub const MF_KIND8_F13_F20: u8 = 0xDE;
pub const MF_KIND8_F21_F28: u8 = 0xDF;

//==================================================================================================
// Configuration variable access (instruction type 111)
//==================================================================================================

pub const MF_KIND4_CV_SHORT_ACCESS: u8 = 0xF0;
pub const MF_CV_SHORT_MASK: u8 = 0x0F;
pub const MF_CV_SHORT_ACCELERATION: u8 = 0x02;
pub const MF_CV_SHORT_DECELERATION: u8 = 0x03;

pub const MF_KIND4_CV_LONG_ACCESS: u8 = 0xE0;
pub const CV_LONG_OP_MASK: u8 = 0x0C;
pub const CV_VERIFY: u8 = 0x04;
pub const CV_WRITE: u8 = 0x0C;
pub const CV_BIT_OP: u8 = 0x08;

//==================================================================================================
// Accessory decoders (RP-9.2.1 section D)
//==================================================================================================

/// Bit 7 of the second byte separates basic (`1AAACDDD`) from extended
/// (`0AAA0AA1`) accessory packets.
pub const ACCESSORY_KIND_MASK: u8 = 0x80;
pub const ACCESSORY_KIND_BASIC: u8 = 0x80;
pub const ACCESSORY_KIND_EXTENDED: u8 = 0x00;
/// Constant low bit of the extended accessory second byte.
pub const ACCESSORY_EXTENDED_FLAG: u8 = 0x01;

pub const BA_ADDRESS_MASK_1: u8 = 0x3F;
/// High address bits of the 9-bit address, stored ones-complemented.
pub const BA_ADDRESS_MASK_2: u8 = 0x70;
pub const BA_ADDRESS_SHIFT: u8 = 2;

pub const BA_PAIR_MASK: u8 = 0x06;
pub const BA_PAIR_SHIFT: u8 = 1;
pub const BA_OUTPUT_MASK: u8 = 0x01;

pub const BA_ACTIVATE_MASK: u8 = 0x08;
pub const BA_ACTIVATE: u8 = 0x08;
pub const BA_DEACTIVATE: u8 = 0x00;

pub const BA_ADDRESS_BROADCAST: u16 = 0x1FF;

pub const EA_ADDRESS_MASK_1: u8 = 0x3F;
/// Middle address bits of the 11-bit address, stored ones-complemented.
pub const EA_ADDRESS_MASK_2: u8 = 0x70;
pub const EA_ADDRESS_MASK_3: u8 = 0x06;
pub const EA_ADDRESS_SHIFT_2: u8 = 2;
pub const EA_ADDRESS_SHIFT_3: u8 = 8;

pub const EA_STATE_MASK: u8 = 0x1F;
/// Aspect 0 is the absolute stop aspect.
pub const EA_STATE_STOP: u8 = 0x00;
pub const EA_STATE_MAX: u8 = 0x1F;

pub const EA_ADDRESS_BROADCAST: u16 = 0x7FF;
