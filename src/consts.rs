//! Constants used across the DCC signal-generation core.
//!
//! This module defines protocol-wide constants used for bit timing,
//! packet framing, transmission-slot partitioning, and buffer sizing.
//!
//! The values follow NMRA S-9.2 and its companion standards, adapted for
//! embedded use in constrained environments.
//!
//! ## Key Concepts
//!
//! - **Bit timing**: a DCC `1` is two 58 µs half-periods, a `0` two
//!   101.5 µs half-periods. Both are integer multiples of the 14.5 µs
//!   interrupt tick the generator runs on.
//! - **Preamble / Postamble**: leading and trailing runs of 1-bits framing
//!   every packet. Service-mode (programming) packets use a longer preamble
//!   and, when a decoder reply must fit in the following window, a much
//!   longer postamble.
//! - **Slot partition**: the transmission ring is divided by role so that
//!   accessory, mobile and programming traffic never compete for the same
//!   slots.
//! - **Buffer sizing**: derived from the worst-case run-length expansion of
//!   the largest permitted packet.
//!
//! These values should be used wherever framing or buffer logic is
//! implemented to ensure consistent packet boundaries and timing.

/// Nominal interrupt tick period driving the signal generator, in
/// microseconds. Four ticks make one half of a `1` bit, seven ticks one
/// half of a `0` bit.
pub const DCC_TICK_US: f32 = 14.5;

/// Interrupt ticks per half of a `1` bit (4 × 14.5 µs = 58 µs).
pub const ONE_HALF_TICKS: u8 = 4;

/// Interrupt ticks per half of a `0` bit (7 × 14.5 µs = 101.5 µs).
pub const ZERO_HALF_TICKS: u8 = 7;

/// Number of `1` bits preceding an operations-track packet.
///
/// The standard requires a minimum of 14; one extra is transmitted to give
/// marginal decoders a little slack.
pub const DCC_SHORT_PREAMBLE: u8 = 15;

/// Number of `1` bits preceding a service-mode (programming) packet, per
/// the standard's long-preamble requirement.
pub const DCC_LONG_PREAMBLE: u8 = 20;

/// Number of `1` bits following an ordinary packet (the packet end bit
/// itself is accounted separately by the encoder).
pub const DCC_STANDARD_POSTAMBLE: u8 = 1;

/// Postamble length used after service-mode commands that expect a decoder
/// acknowledgment: 52 one-bits is roughly a 6 ms quiet window at
/// 116 µs/bit, long enough for the ~6 ms acknowledgment pulse to land.
pub const CONFIRMATION_PAUSE: u8 = 52;

/// Number of accessory (transient) transmission slots at the base of the
/// slot table.
pub const ACCESSORY_SLOTS: usize = 4;

/// Number of mobile (persistent) transmission slots following the
/// accessory partition.
pub const MOBILE_SLOTS: usize = 8;

/// Number of programming-track transmission slots at the top of the table.
/// Service-mode sequences are strictly ordered, so one is sufficient.
pub const PROGRAMMING_SLOTS: usize = 1;

/// Index of the first accessory slot.
pub const ACCESSORY_BASE: usize = 0;

/// Index of the first mobile slot.
pub const MOBILE_BASE: usize = ACCESSORY_SLOTS;

/// Index of the programming slot.
pub const PROGRAMMING_BASE: usize = ACCESSORY_SLOTS + MOBILE_SLOTS;

/// Total number of transmission slots in the ring.
pub const TRANSMISSION_SLOTS: usize = ACCESSORY_SLOTS + MOBILE_SLOTS + PROGRAMMING_SLOTS;

/// Maximum number of payload bytes in a DCC packet before the parity byte
/// is appended.
pub const MAX_PAYLOAD_BYTES: usize = 5;

/// Maximum number of bytes on the wire (payload plus parity).
pub const MAX_WIRE_BYTES: usize = MAX_PAYLOAD_BYTES + 1;

/// Size of a slot's run-length bit buffer, in cells.
///
/// Worst case is fully alternating data (0x55/0xAA): one cell for the
/// preamble, nine cells per wire byte, two cells for the end bit and
/// postamble, plus the terminator — 58 cells for the largest packet.
/// Rounded up for headroom.
pub const BIT_BUFFER_CELLS: usize = 64;

/// Largest value a single run-length cell can carry. A run that would
/// exceed this fails translation.
pub const MAX_RUN_LENGTH: u8 = u8::MAX;

/// Number of packet records in the pending pool shared by all slots.
pub const PENDING_POOL_SIZE: usize = 16;

/// Capacity of a reply template, in bytes.
pub const REPLY_LENGTH: usize = 24;

/// Placeholder character in a reply template substituted with the
/// service-mode confirmation outcome (`1` seen, `0` not seen).
pub const CONFIRMATION_PLACEHOLDER: char = '#';

/// Depth of the outbound reply queue drained by the host layer.
pub const REPLY_QUEUE: usize = 8;

/// Depth of the outbound event queue drained by the host layer.
pub const EVENT_QUEUE: usize = 8;

/// Highest mobile decoder address encodable in the short (one byte) form.
pub const MAX_SHORT_ADDRESS: u16 = 127;

/// Highest mobile decoder address encodable in the long (two byte) form.
pub const MAX_LONG_ADDRESS: u16 = 10239;

/// Highest external accessory address. External addresses are 1-based and
/// map onto a 9-bit decoder address plus a 2-bit sub-address.
pub const MAX_ACCESSORY_ADDRESS: u16 = 2048;

/// Highest user-visible configuration variable number. CVs are transmitted
/// as the 10-bit value `cv - 1`.
pub const MAX_CV_NUMBER: u16 = 1024;

/// Highest mobile decoder function number (F0..=F28).
pub const MAX_FUNCTION: u8 = 28;

/// Highest speed step in 128-speed-step mode.
pub const MAX_SPEED: i16 = 126;

/// Speed value submitted for an emergency stop.
pub const EMERGENCY_STOP: i16 = -1;

/// First byte of the 128-speed-step advanced operations instruction.
pub const SPEED_128_OPCODE: u8 = 0b0011_1111;

/// Flag bits marking the first byte of a long-form mobile address.
pub const LONG_ADDRESS_FLAG: u8 = 0b1100_0000;

/// Flag bit marking the first byte of a basic accessory packet.
pub const ACCESSORY_FLAG: u8 = 0b1000_0000;

/// First byte of a service-mode direct instruction before the operation
/// bits and the top of the CV address are merged in.
pub const SERVICE_MODE_FLAG: u8 = 0b0111_0000;

/// Pre-encoded bit stream of the DCC idle packet (`0xFF 0x00` plus
/// parity), emitted whenever a slot has nothing valid to transmit so the
/// carrier never goes silent. The closing run is the parity byte's eight
/// 1 bits plus the end bit, which the postamble rides on.
pub const IDLE_BITS: [u8; 6] = [DCC_SHORT_PREAMBLE, 1, 8, 10, 9, 0];

/// Pre-encoded filler stream: a bare run of 1 bits, emitted while a
/// programming slot is waiting for its next packet so that a stray idle
/// frame cannot break a service-mode sequence.
pub const FILLER_BITS: [u8; 2] = [DCC_LONG_PREAMBLE, 0];

/// ADC full-scale reading for the district current-sense inputs.
pub const ADC_FULL_SCALE: u16 = 1023;

/// District load in milliamps corresponding to a full-scale ADC reading
/// (2 A shield drivers).
pub const FULL_SCALE_MILLIAMPS: u16 = 2000;
