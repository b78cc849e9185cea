//! Transmission slots and the active ring.
//!
//! Each slot carries one live run-length bit stream, a FIFO of pending
//! packets awaiting translation, and a reply descriptor. The slot `state`
//! byte is the hand-off token of the whole pipeline: it names which
//! context — host, packet manager, or signal-generator interrupt — owns
//! the slot's content at this instant, so no further locking is needed.
//!
//! ```text
//! EMPTY ──host──▶ LOAD ──manager──▶ RUN ──isr──▶ LOAD ─▶ …
//!                   ▲                 │
//!                   └────isr──── RELOAD ◀──host (supersede in flight)
//! ```
//!
//! Slots are partitioned by role — accessory-transient, mobile-persistent,
//! programming — and their `next` indices form the ring the interrupt
//! walks. Only the slots of the active power mode are linked into the
//! ring.

use crate::consts::{
    ACCESSORY_BASE, ACCESSORY_SLOTS, BIT_BUFFER_CELLS, CONFIRMATION_PLACEHOLDER, MOBILE_BASE,
    MOBILE_SLOTS, PROGRAMMING_BASE, PROGRAMMING_SLOTS, REPLY_LENGTH,
};

use heapless::String;

/// Ownership state of a transmission slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SlotState {
    /// Available for reuse; owned by the host command path.
    #[default]
    Empty,
    /// Pending data needs translation; owned by the packet manager.
    Load,
    /// Bit stream live on the rail; owned by the interrupt.
    Run,
    /// Host asked the interrupt to drop the current stream and hand the
    /// slot back to the manager at the next packet boundary.
    Reload,
}

/// When a slot's reply is emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ReplyMode {
    /// No reply owed.
    #[default]
    None,
    /// Reply as the final pending packet is loaded for transmission.
    OnSend,
    /// Reply when the slot drains, with the confirmation outcome
    /// substituted into the template.
    OnConfirm,
}

/// Reply text handed back to the host layer.
pub type Reply = String<REPLY_LENGTH>;

/// The roles the slot table is partitioned into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SlotRole {
    /// Transient accessory commands.
    Accessory,
    /// Persistent mobile (locomotive) commands.
    Mobile,
    /// Service-mode programming sequences.
    Programming,
}

impl SlotRole {
    /// First slot index of this role's partition.
    pub const fn base(self) -> usize {
        match self {
            Self::Accessory => ACCESSORY_BASE,
            Self::Mobile => MOBILE_BASE,
            Self::Programming => PROGRAMMING_BASE,
        }
    }

    /// Number of slots in this role's partition.
    pub const fn count(self) -> usize {
        match self {
            Self::Accessory => ACCESSORY_SLOTS,
            Self::Mobile => MOBILE_SLOTS,
            Self::Programming => PROGRAMMING_SLOTS,
        }
    }
}

/// One transmission slot.
#[derive(Debug)]
pub struct Slot {
    /// Hand-off token; see the module documentation.
    pub state: SlotState,
    /// Target the live stream and pending FIFO belong to.
    pub target: i16,
    /// Remaining transmissions of the live stream; zero repeats forever.
    pub duration: u8,
    /// Zero-terminated run-length stream the interrupt consumes.
    pub bits: [u8; BIT_BUFFER_CELLS],
    /// Head of the pending-packet FIFO (pool index).
    pub pending: Option<u8>,
    /// When to emit the reply.
    pub reply_mode: ReplyMode,
    /// Reply template, possibly holding the confirmation placeholder.
    pub reply: Reply,
    /// Next slot in the active ring.
    pub next: u8,
}

impl Slot {
    /// A fresh, empty slot linked to itself.
    pub fn new(index: u8) -> Self {
        Self {
            state: SlotState::Empty,
            target: 0,
            duration: 0,
            bits: [0; BIT_BUFFER_CELLS],
            pending: None,
            reply_mode: ReplyMode::None,
            reply: Reply::new(),
            next: index,
        }
    }

    /// Reset everything but the ring link.
    pub fn clear(&mut self) {
        self.state = SlotState::Empty;
        self.target = 0;
        self.duration = 0;
        self.bits[0] = 0;
        self.pending = None;
        self.reply_mode = ReplyMode::None;
        self.reply.clear();
    }
}

/// Pick a slot for a submission within a role partition.
///
/// An occupied slot already addressing `target` is preferred, so repeated
/// commands to the same decoder coalesce onto one slot; otherwise the
/// first empty slot wins. `None` means the partition is fully busy with
/// other targets.
pub fn find_slot(slots: &[Slot], role: SlotRole, target: i16) -> Option<usize> {
    let base = role.base();
    let count = role.count();
    let mut empty = None;
    for index in base..base + count {
        let slot = &slots[index];
        if slot.state != SlotState::Empty && slot.target == target {
            return Some(index);
        }
        if empty.is_none() && slot.state == SlotState::Empty {
            empty = Some(index);
        }
    }
    empty
}

/// Count the empty slots of a role partition.
pub fn free_slots(slots: &[Slot], role: SlotRole) -> usize {
    let base = role.base();
    slots[base..base + role.count()]
        .iter()
        .filter(|slot| slot.state == SlotState::Empty)
        .count()
}

/// Resolve a reply template against the confirmation outcome.
///
/// Every [`CONFIRMATION_PLACEHOLDER`] is replaced with `1` or `0`. A
/// template without a placeholder is only emitted when a confirmation was
/// actually seen; otherwise the reply is suppressed and `None` returned.
pub fn resolve_reply(template: &Reply, confirmed: bool) -> Option<Reply> {
    if !template.chars().any(|c| c == CONFIRMATION_PLACEHOLDER) {
        return confirmed.then(|| template.clone());
    }
    let mut resolved = Reply::new();
    for c in template.chars() {
        let out = if c == CONFIRMATION_PLACEHOLDER {
            if confirmed {
                '1'
            } else {
                '0'
            }
        } else {
            c
        };
        let _ = resolved.push(out);
    }
    Some(resolved)
}
