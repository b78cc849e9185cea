//! DCC packet payload composition.
//!
//! Builders for every byte-level packet the core transmits: mobile
//! speed-and-direction (128 speed steps), basic accessory, the five
//! function groups, service-mode direct instructions, and the fixed reset
//! and idle packets.
//!
//! Builders validate their arguments against the ranges the standard
//! permits and return typed [`ErrorCode`]s, so the host-command layer can
//! relay a precise failure. The XOR parity byte is *not* part of these
//! payloads — the pending pool appends it on copy-in — but [`parity`] is
//! provided for the pool and for tests.

use crate::consts::{
    ACCESSORY_FLAG, EMERGENCY_STOP, LONG_ADDRESS_FLAG, MAX_ACCESSORY_ADDRESS, MAX_CV_NUMBER,
    MAX_FUNCTION, MAX_LONG_ADDRESS, MAX_PAYLOAD_BYTES, MAX_SHORT_ADDRESS, MAX_SPEED,
    SERVICE_MODE_FLAG, SPEED_128_OPCODE,
};
use crate::errors::ErrorCode;

use heapless::Vec;

/// A composed DCC payload, parity not yet appended.
pub type Payload = Vec<u8, MAX_PAYLOAD_BYTES>;

/// Direction of travel carried in a speed-and-direction instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Direction {
    /// Reverse running (direction bit clear).
    Reverse,
    /// Forward running (direction bit set).
    #[default]
    Forward,
}

impl Direction {
    /// Map a host-layer `0`/`1` argument onto a direction.
    pub fn from_arg(arg: u8) -> Result<Self, ErrorCode> {
        match arg {
            0 => Ok(Self::Reverse),
            1 => Ok(Self::Forward),
            _ => Err(ErrorCode::InvalidDirection),
        }
    }
}

/// The standard function groups, each covered by one non-idempotent
/// group instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FunctionGroup {
    /// F0..=F4.
    One,
    /// F5..=F8.
    Two,
    /// F9..=F12.
    Three,
    /// F13..=F20.
    Four,
    /// F21..=F28.
    Five,
}

impl FunctionGroup {
    /// The group whose instruction carries the given function number.
    pub fn containing(function: u8) -> Result<Self, ErrorCode> {
        match function {
            0..=4 => Ok(Self::One),
            5..=8 => Ok(Self::Two),
            9..=12 => Ok(Self::Three),
            13..=20 => Ok(Self::Four),
            21..=28 => Ok(Self::Five),
            _ => Err(ErrorCode::InvalidFunctionNumber),
        }
    }
}

/// Service-mode direct operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ServiceOp {
    /// Write a whole CV byte.
    WriteByte {
        /// Value to store.
        value: u8,
    },
    /// Compare a whole CV byte, acknowledged on match.
    VerifyByte {
        /// Value to compare against.
        value: u8,
    },
    /// Write a single CV bit.
    WriteBit {
        /// Bit index 0..=7.
        bit: u8,
        /// Bit value.
        value: bool,
    },
    /// Compare a single CV bit, acknowledged on match.
    VerifyBit {
        /// Bit index 0..=7.
        bit: u8,
        /// Bit value to compare against.
        value: bool,
    },
}

/// XOR of all payload bytes: the DCC error-detection byte transmitted
/// last in every packet.
pub fn parity(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, b| acc ^ b)
}

fn push(payload: &mut Payload, byte: u8) {
    // Payload capacity is sized for the largest packet composed here.
    let _ = payload.push(byte);
}

/// Validate a mobile decoder address without composing anything.
pub fn check_mobile_address(target: u16) -> Result<(), ErrorCode> {
    if target == 0 || target > MAX_LONG_ADDRESS {
        Err(ErrorCode::InvalidAddress)
    } else {
        Ok(())
    }
}

/// Append the one- or two-byte form of a mobile decoder address.
fn mobile_address(target: u16, payload: &mut Payload) -> Result<(), ErrorCode> {
    match target {
        1..=MAX_SHORT_ADDRESS => {
            push(payload, target as u8);
            Ok(())
        }
        addr if addr <= MAX_LONG_ADDRESS => {
            push(payload, LONG_ADDRESS_FLAG | (addr >> 8) as u8);
            push(payload, addr as u8);
            Ok(())
        }
        _ => Err(ErrorCode::InvalidAddress),
    }
}

/// Compose a 128-step speed-and-direction packet.
///
/// `speed` is `0` for stop, [`EMERGENCY_STOP`] for an emergency stop, or
/// `1..=126`; on the wire stop is `0`, emergency stop is `1`, and running
/// speeds shift up by one.
pub fn speed_and_direction(
    target: u16,
    speed: i16,
    direction: Direction,
) -> Result<Payload, ErrorCode> {
    let encoded = match speed {
        0 => 0u8,
        EMERGENCY_STOP => 1,
        s if s > 0 && s <= MAX_SPEED => (s + 1) as u8,
        _ => return Err(ErrorCode::InvalidSpeed),
    };
    let mut payload = Payload::new();
    mobile_address(target, &mut payload)?;
    push(&mut payload, SPEED_128_OPCODE);
    let dir_bit = match direction {
        Direction::Forward => 0x80,
        Direction::Reverse => 0x00,
    };
    push(&mut payload, dir_bit | encoded);
    Ok(payload)
}

/// Compose a basic accessory packet for an external address `1..=2048`.
///
/// The external address maps to a 9-bit decoder address and 2-bit
/// sub-address; the decoder address's top three bits travel bit-inverted
/// in the second byte per the standard.
pub fn accessory(address: u16, state: bool) -> Result<Payload, ErrorCode> {
    if address == 0 || address > MAX_ACCESSORY_ADDRESS {
        return Err(ErrorCode::InvalidAddress);
    }
    let decoder = (address - 1) >> 2;
    let sub = ((address - 1) & 0x03) as u8;
    let mut payload = Payload::new();
    push(&mut payload, ACCESSORY_FLAG | (decoder & 0x3f) as u8);
    let inverted_high = (!(decoder >> 6) & 0x07) as u8;
    push(
        &mut payload,
        0x88 | (inverted_high << 4) | (sub << 1) | state as u8,
    );
    Ok(payload)
}

/// Compose a function-group packet from the full cached function state.
///
/// `state` holds all 29 function bits (`F0` at bit 0 through `F28` at
/// bit 28). The whole group is always transmitted because group
/// instructions replace every bit they cover.
pub fn function_group(target: u16, group: FunctionGroup, state: u32) -> Result<Payload, ErrorCode> {
    let mut payload = Payload::new();
    mobile_address(target, &mut payload)?;
    let bit = |f: u8| (state >> f) & 1 != 0;
    let pack = |from: u8| {
        let mut data = 0u8;
        for i in 0..8 {
            if bit(from + i) {
                data |= 1 << i;
            }
        }
        data
    };
    match group {
        FunctionGroup::One => {
            let mut instruction = 0b1000_0000;
            if bit(0) {
                instruction |= 0x10;
            }
            for f in 1..=4u8 {
                if bit(f) {
                    instruction |= 1 << (f - 1);
                }
            }
            push(&mut payload, instruction);
        }
        FunctionGroup::Two => {
            let mut instruction = 0b1011_0000;
            for f in 5..=8u8 {
                if bit(f) {
                    instruction |= 1 << (f - 5);
                }
            }
            push(&mut payload, instruction);
        }
        FunctionGroup::Three => {
            let mut instruction = 0b1010_0000;
            for f in 9..=12u8 {
                if bit(f) {
                    instruction |= 1 << (f - 9);
                }
            }
            push(&mut payload, instruction);
        }
        FunctionGroup::Four => {
            push(&mut payload, 0b1101_1110);
            push(&mut payload, pack(13));
        }
        FunctionGroup::Five => {
            push(&mut payload, 0b1101_1111);
            push(&mut payload, pack(21));
        }
    }
    Ok(payload)
}

/// Validate a function number against the supported range.
pub fn check_function(function: u8) -> Result<(), ErrorCode> {
    if function > MAX_FUNCTION {
        Err(ErrorCode::InvalidFunctionNumber)
    } else {
        Ok(())
    }
}

/// Compose a service-mode direct instruction for the given CV.
///
/// The CV number `1..=1024` is transmitted as the 10-bit value `cv - 1`
/// split across the first two bytes; the third byte is the data byte, or
/// the `111CDBBB` bit-manipulation byte for bit operations.
pub fn service_mode(cv: u16, op: ServiceOp) -> Result<Payload, ErrorCode> {
    if cv == 0 || cv > MAX_CV_NUMBER {
        return Err(ErrorCode::InvalidCvNumber);
    }
    let address = cv - 1;
    let mut first = SERVICE_MODE_FLAG | (address >> 8) as u8;
    let data = match op {
        ServiceOp::WriteByte { value } => {
            first |= 0b0000_1100;
            value
        }
        ServiceOp::VerifyByte { value } => {
            first |= 0b0000_0100;
            value
        }
        ServiceOp::WriteBit { bit, value } => {
            if bit > 7 {
                return Err(ErrorCode::InvalidBitNumber);
            }
            first |= 0b0000_1000;
            0b1111_0000 | ((value as u8) << 3) | bit
        }
        ServiceOp::VerifyBit { bit, value } => {
            if bit > 7 {
                return Err(ErrorCode::InvalidBitNumber);
            }
            first |= 0b0000_1000;
            0b1110_0000 | ((value as u8) << 3) | bit
        }
    };
    let mut payload = Payload::new();
    push(&mut payload, first);
    push(&mut payload, address as u8);
    push(&mut payload, data);
    Ok(payload)
}

/// The service-mode reset packet framing every programming sequence.
pub fn reset() -> Payload {
    let mut payload = Payload::new();
    push(&mut payload, 0x00);
    push(&mut payload, 0x00);
    payload
}

/// The DCC idle packet.
pub fn idle() -> Payload {
    let mut payload = Payload::new();
    push(&mut payload, 0xff);
    push(&mut payload, 0x00);
    payload
}
