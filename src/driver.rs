//! DCC waveform driver for H-bridge rail outputs.
//!
//! This module provides the [`DccDriver`] struct, the hub of the signal
//! generation core. It owns the transmission slots, the pending packet
//! pool, the per-district power monitor, and the signal-generator state
//! machine, and exposes the submission API the host-command layer calls.
//!
//! The driver is platform independent: it only requires that
//! [`tick()`](DccDriver::tick) is called on every 14.5 µs timer interrupt
//! and that the cooperative entry points run from the main loop.
//!
//! ## Execution contexts
//!
//! Three contexts touch the driver, and the slot state byte says which one
//! owns a slot's content at any instant:
//!
//! - **Timer interrupt** — [`tick()`](DccDriver::tick): flips the rail
//!   polarity, consumes run-length cells, walks the slot ring, and inserts
//!   idle or filler packets so the waveform never stops being valid DCC.
//! - **ADC interrupt** — [`adc`](DccDriver::adc): latches district current
//!   readings and schedules the next conversion.
//! - **Main loop** — [`manage()`](DccDriver::manage),
//!   [`poll_adc()`](DccDriver::poll_adc), [`periodic()`](DccDriver::periodic)
//!   and the `submit_*` family: everything that is allowed to take its
//!   time.
//!
//! When the `timer-isr` feature drives the interrupts, the whole driver
//! lives behind a `critical_section` mutex (see [`crate::timer`]), so each
//! entry point runs with the others excluded.
//!
//! ## Example
//!
//! ```rust
//! # use embedded_hal_mock::eh1::digital::{Mock as Pin, State as PinState, Transaction as PinTransaction};
//! use dccgen::config::Constants;
//! use dccgen::driver::{DccDriver, PowerMode};
//! use dccgen::monitor::District;
//!
//! # let enable = Pin::new(&[PinTransaction::set(PinState::High)]);
//! # let direction = Pin::new(&[]);
//! let districts = [District::new(enable, direction, false)];
//! let mut driver: DccDriver<Pin, Pin, 1> = DccDriver::new(districts, Constants::default());
//!
//! driver.set_power(PowerMode::Main, 0).unwrap();
//! driver.submit_mobile(3, 10, 1, None).unwrap();
//! loop {
//!     driver.manage();       // main loop, one slot per pass
//!     driver.poll_adc(0);    // consume any ADC reading
//!     // driver.tick() runs from the 14.5 µs timer interrupt
//!     # break;
//! }
//! # driver.power.district_mut(0).enable.done();
//! # driver.power.district_mut(0).direction.done();
//! ```

use crate::config::Constants;
use crate::consts::{
    ADC_FULL_SCALE, CONFIRMATION_PAUSE, DCC_LONG_PREAMBLE, DCC_SHORT_PREAMBLE,
    DCC_STANDARD_POSTAMBLE, EVENT_QUEUE, FILLER_BITS, FULL_SCALE_MILLIAMPS, IDLE_BITS,
    ONE_HALF_TICKS, PROGRAMMING_BASE, REPLY_LENGTH, REPLY_QUEUE, TRANSMISSION_SLOTS,
    ZERO_HALF_TICKS,
};
use crate::encoding;
use crate::errors::{ErrorCode, ErrorLog};
use crate::funcs::{FunctionCache, FunctionState};
use crate::logging::{dcc_info, dcc_warn};
use crate::monitor::{mul_div, AdcRotation, District, PowerFault, PowerMonitor};
use crate::packet::{self, Direction, FunctionGroup, ServiceOp};
use crate::pending::PendingPool;
use crate::slots::{self, find_slot, Reply, ReplyMode, Slot, SlotRole, SlotState};

use embedded_hal::digital::OutputPin;
use heapless::Deque;

/// Global power mode of the command station.
///
/// Transitions between the two powered modes must pass through
/// [`Off`](PowerMode::Off); a direct change is rejected so a layout is
/// never left with stale traffic from the previous mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PowerMode {
    /// All districts disabled; the generator idles.
    #[default]
    Off,
    /// Operations track live: accessory and mobile slots are in the ring.
    Main,
    /// Programming track live: only the programming slot is in the ring.
    Prog,
}

/// Asynchronous notification for the host layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event<const D: usize> {
    /// The global power mode changed.
    Power(PowerMode),
    /// Per-district status codes changed (disabled 0, enabled 1,
    /// flipped 2, blocked 3, off 4).
    Districts([u8; D]),
    /// Periodic highest-load report.
    Load {
        /// District that produced the reading.
        district: u8,
        /// Scaled load in milliamps.
        milliamps: u16,
    },
}

/// Where the generator is currently reading run-length cells from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BitSource {
    /// The current slot's bit buffer.
    Slot,
    /// The constant idle packet.
    Idle,
    /// The constant service filler run.
    Filler,
}

/// The DCC signal-generation core.
///
/// ## Type parameters
///
/// - `EN`: district enable pin, [`embedded_hal::digital::OutputPin`]
/// - `DIR`: district direction (polarity) pin, same trait
/// - `D`: number of districts
///
/// See the [module documentation](self) for the execution model and an
/// example.
#[derive(Debug)]
pub struct DccDriver<EN, DIR, const D: usize>
where
    EN: OutputPin,
    DIR: OutputPin,
{
    /// Current global power mode.
    pub mode: PowerMode,
    /// Per-district power supervision.
    pub power: PowerMonitor<EN, DIR, D>,
    /// ADC reading latch and mux rotation.
    pub adc: AdcRotation<D>,
    /// Mobile decoder function-state cache.
    pub functions: FunctionCache,
    /// Tunable operating constants.
    pub constants: Constants,
    /// Bounded error cache drained by the host layer.
    pub errors: ErrorLog,

    slots: [Slot; TRANSMISSION_SLOTS],
    pool: PendingPool,
    replies: Deque<Reply, REPLY_QUEUE>,
    events: Deque<Event<D>, EVENT_QUEUE>,

    // Signal-generator state. Owned by the timer interrupt except where
    // `relink` rewrites it with interrupts excluded.
    side: bool,
    second: bool,
    one: bool,
    remaining: u8,
    reload: u8,
    left: u8,
    cursor: usize,
    source: BitSource,
    current: u8,
    manage_at: u8,
    last_periodic: u32,
}

impl<EN, DIR, const D: usize> DccDriver<EN, DIR, D>
where
    EN: OutputPin,
    DIR: OutputPin,
{
    /// Create a driver over the given districts.
    ///
    /// Power starts [`Off`](PowerMode::Off) with every district disabled;
    /// the generator produces a continuous idle waveform from the very
    /// first tick so enabling power never meets a silent rail.
    pub fn new(districts: [District<EN, DIR>; D], constants: Constants) -> Self {
        Self {
            mode: PowerMode::Off,
            power: PowerMonitor::new(districts),
            adc: AdcRotation::new(),
            functions: FunctionCache::new(),
            constants,
            errors: ErrorLog::new(),
            slots: core::array::from_fn(|i| Slot::new(i as u8)),
            pool: PendingPool::new(),
            replies: Deque::new(),
            events: Deque::new(),
            side: false,
            second: false,
            one: true,
            remaining: ONE_HALF_TICKS,
            reload: ONE_HALF_TICKS,
            left: IDLE_BITS[0],
            cursor: 0,
            source: BitSource::Idle,
            current: 0,
            manage_at: 0,
            last_periodic: 0,
        }
    }

    /// Advance the signal generator by one 14.5 µs tick.
    ///
    /// Must be called from the timer interrupt with deterministic latency.
    /// The polarity write happens at the same point of every invocation,
    /// whichever branch runs afterwards, so the rail edge jitter stays
    /// bounded by the interrupt entry jitter alone.
    pub fn tick(&mut self) {
        self.remaining = self.remaining.saturating_sub(1);
        if self.remaining != 0 {
            self.power.write_outputs(self.side);
            return;
        }

        // Half-period complete: this tick carries the edge.
        self.side = !self.side;
        self.power.write_outputs(self.side);

        if !self.second {
            // First half of the bit done, mirror it.
            self.second = true;
            self.remaining = self.reload;
            return;
        }
        self.second = false;

        self.left = self.left.saturating_sub(1);
        if self.left != 0 {
            // More bits of the current run.
            self.remaining = self.reload;
            return;
        }

        // Run exhausted: the next cell counts the opposite bit value.
        let next = self.cell(self.cursor + 1);
        if next != 0 {
            self.cursor += 1;
            self.one = !self.one;
            self.left = next;
        } else {
            self.advance_slot();
        }
        self.reload = if self.one {
            ONE_HALF_TICKS
        } else {
            ZERO_HALF_TICKS
        };
        self.remaining = self.reload;
    }

    /// Read a run-length cell of the stream currently on the rail.
    fn cell(&self, index: usize) -> u8 {
        let cells: &[u8] = match self.source {
            BitSource::Slot => &self.slots[self.current as usize].bits,
            BitSource::Idle => &IDLE_BITS,
            BitSource::Filler => &FILLER_BITS,
        };
        cells.get(index).copied().unwrap_or(0)
    }

    /// End-of-stream bookkeeping: settle the finished slot, step the ring,
    /// and choose what the next visit transmits.
    fn advance_slot(&mut self) {
        if self.source == BitSource::Slot {
            let slot = &mut self.slots[self.current as usize];
            if slot.state == SlotState::Run && slot.duration > 0 {
                slot.duration -= 1;
                if slot.duration == 0 {
                    slot.state = SlotState::Load;
                }
            }
        }

        self.current = self.slots[self.current as usize].next;
        let slot = &mut self.slots[self.current as usize];
        self.source = match slot.state {
            SlotState::Run => BitSource::Slot,
            SlotState::Reload => {
                // Drop the superseded stream; the manager reloads it.
                slot.state = SlotState::Load;
                BitSource::Idle
            }
            // A slot mid-sequence gets filler rather than an idle frame,
            // which would abort a decoder's service-mode reception.
            SlotState::Load if slot.pending.is_some() => BitSource::Filler,
            _ => BitSource::Idle,
        };
        self.cursor = 0;
        self.one = true;
        self.left = self.cell(0);
    }

    /// Run one pass of the packet manager.
    ///
    /// Called on every main-loop iteration; visits a single slot per call
    /// so the per-iteration work stays bounded, and round-robins so no
    /// slot starves. Only slots in the LOAD state get any work.
    pub fn manage(&mut self) {
        if self.errors.halted() {
            return;
        }
        let index = self.manage_at as usize;
        self.manage_at = ((index + 1) % TRANSMISSION_SLOTS) as u8;
        if self.slots[index].state != SlotState::Load {
            return;
        }
        match self.slots[index].pending {
            Some(head) => self.load_slot(index, head),
            None => self.retire_slot(index),
        }
    }

    /// Translate the head pending packet into the slot's bit buffer and
    /// hand the slot to the interrupt.
    fn load_slot(&mut self, index: usize, head: u8) {
        let (bytes, target, duration, preamble, postamble) = {
            let packet = self.pool.get(head);
            (
                packet.bytes.clone(),
                packet.target,
                packet.duration,
                packet.preamble,
                packet.postamble,
            )
        };
        match encoding::encode_packet(&bytes, preamble, postamble, &mut self.slots[index].bits) {
            Ok(_) => {
                let confirmation = postamble >= CONFIRMATION_PAUSE;
                let mut send = None;
                {
                    let slot = &mut self.slots[index];
                    slot.target = target;
                    slot.duration = duration;
                    slot.pending = self.pool.free_one(head);
                    if slot.pending.is_none() && slot.reply_mode == ReplyMode::OnSend {
                        send = Some(slot.reply.clone());
                        slot.reply_mode = ReplyMode::None;
                        slot.reply.clear();
                    }
                    slot.state = SlotState::Run;
                }
                if confirmation {
                    // A decoder may answer in this packet's long postamble.
                    self.power.set_confirmation_window(true);
                }
                if let Some(text) = send {
                    self.emit_reply(text);
                }
            }
            Err(_) => {
                dcc_warn!("bit translation overflow for target {}", target);
                self.errors
                    .log(ErrorCode::BitTranslationOverflow, target as u16);
                self.pool.free_all(&mut self.slots[index].pending);
                self.slots[index].clear();
            }
        }
    }

    /// A LOAD slot with nothing pending: settle its reply and free it.
    fn retire_slot(&mut self, index: usize) {
        let mut send = None;
        if self.slots[index].reply_mode == ReplyMode::OnConfirm {
            let confirmed = self.power.take_confirmed();
            send = slots::resolve_reply(&self.slots[index].reply, confirmed);
            self.power.set_confirmation_window(false);
        }
        self.slots[index].clear();
        if let Some(text) = send {
            self.emit_reply(text);
        }
    }

    /// Change the global power mode.
    ///
    /// Powered modes are only reachable from [`Off`](PowerMode::Off);
    /// entering a mode powers the matching districts, drops every queued
    /// packet, and re-links the slot ring to the mode's partition. The
    /// ring rewrite must not interleave with [`tick()`](DccDriver::tick) —
    /// under the `timer-isr` feature the surrounding critical section
    /// guarantees that.
    pub fn set_power(&mut self, mode: PowerMode, now: u32) -> Result<(), ErrorCode> {
        self.check_running()?;
        if mode == self.mode {
            return Ok(());
        }
        if mode != PowerMode::Off && self.mode != PowerMode::Off {
            return Err(self.fail(ErrorCode::PowerNotOff, mode as u16));
        }
        match mode {
            PowerMode::Off => {
                self.power.shut_down();
                self.clear_slots();
                self.relink(0..0);
            }
            PowerMode::Main => {
                self.power.engage(false, now, &self.constants);
                self.relink(0..PROGRAMMING_BASE);
            }
            PowerMode::Prog => {
                if cfg!(not(feature = "prog-track")) || !self.power.has_programming() {
                    return Err(self.fail(ErrorCode::NoProgrammingTrack, 0));
                }
                self.power.engage(true, now, &self.constants);
                self.relink(PROGRAMMING_BASE..TRANSMISSION_SLOTS);
            }
        }
        self.mode = mode;
        dcc_info!("power mode {}", mode as u8);
        let districts = self.power.district_status();
        self.emit_event(Event::Power(mode));
        self.emit_event(Event::Districts(districts));
        Ok(())
    }

    /// Re-link the ring over a slot range (or make it trivial when the
    /// range is empty) and point the generator at idle. The in-flight
    /// half-period completes on its original schedule, so the rail only
    /// ever sees well-formed edges across the rewrite.
    fn relink(&mut self, range: core::ops::Range<usize>) {
        if range.is_empty() {
            for index in 0..TRANSMISSION_SLOTS {
                self.slots[index].next = index as u8;
            }
            self.current = 0;
        } else {
            for index in range.clone() {
                let next = if index + 1 == range.end {
                    range.start
                } else {
                    index + 1
                };
                self.slots[index].next = next as u8;
            }
            self.current = range.start as u8;
        }
        self.source = BitSource::Idle;
    }

    fn clear_slots(&mut self) {
        for index in 0..TRANSMISSION_SLOTS {
            self.pool.free_all(&mut self.slots[index].pending);
            self.slots[index].clear();
        }
    }

    /// Submit a mobile decoder speed-and-direction command.
    ///
    /// `speed` is `0` for stop, `-1` for emergency stop, or `1..=126`;
    /// `direction` is `0` (reverse) or `1` (forward). Running speeds
    /// repeat until superseded; stop commands repeat a finite number of
    /// times. Repeated commands for one decoder coalesce onto the same
    /// slot, superseding whatever it was transmitting.
    pub fn submit_mobile(
        &mut self,
        target: u16,
        speed: i16,
        direction: u8,
        reply: Option<&str>,
    ) -> Result<(), ErrorCode> {
        self.check_running()?;
        if self.mode != PowerMode::Main {
            return Err(self.fail(ErrorCode::InvalidState, self.mode as u16));
        }
        let direction = match Direction::from_arg(direction) {
            Ok(direction) => direction,
            Err(code) => return Err(self.fail(code, direction as u16)),
        };
        let payload = match packet::speed_and_direction(target, speed, direction) {
            Ok(payload) => payload,
            Err(code) => return Err(self.fail(code, target)),
        };
        let duration = if speed > 0 {
            0
        } else {
            self.constants.transient_command_repeats
        };
        let index = match find_slot(&self.slots, SlotRole::Mobile, target as i16) {
            Some(index) => index,
            None => return Err(self.fail(ErrorCode::TransmissionBusy, target)),
        };
        // Whatever was queued for this decoder is stale now.
        self.pool.free_all(&mut self.slots[index].pending);
        let packet_index = match self.pool.alloc(
            target as i16,
            duration,
            DCC_SHORT_PREAMBLE,
            DCC_STANDARD_POSTAMBLE,
            &payload,
        ) {
            Ok(packet_index) => packet_index,
            Err(code) => return Err(self.fail(code, target)),
        };
        self.set_reply(index, ReplyMode::OnSend, reply);
        self.queue_on_slot(index, packet_index, true);
        Ok(())
    }

    /// Submit a basic accessory command for external address `1..=2048`.
    pub fn submit_accessory(
        &mut self,
        address: u16,
        state: u8,
        reply: Option<&str>,
    ) -> Result<(), ErrorCode> {
        self.check_running()?;
        if self.mode != PowerMode::Main {
            return Err(self.fail(ErrorCode::InvalidState, self.mode as u16));
        }
        if state > 1 {
            return Err(self.fail(ErrorCode::InvalidState, state as u16));
        }
        let payload = match packet::accessory(address, state == 1) {
            Ok(payload) => payload,
            Err(code) => return Err(self.fail(code, address)),
        };
        let target = -(address as i16);
        let index = match find_slot(&self.slots, SlotRole::Accessory, target) {
            Some(index) => index,
            None => return Err(self.fail(ErrorCode::TransmissionBusy, address)),
        };
        self.pool.free_all(&mut self.slots[index].pending);
        let packet_index = match self.pool.alloc(
            target,
            self.constants.transient_command_repeats,
            DCC_SHORT_PREAMBLE,
            DCC_STANDARD_POSTAMBLE,
            &payload,
        ) {
            Ok(packet_index) => packet_index,
            Err(code) => return Err(self.fail(code, address)),
        };
        self.set_reply(index, ReplyMode::OnSend, reply);
        self.queue_on_slot(index, packet_index, true);
        Ok(())
    }

    /// Submit a mobile decoder function change.
    ///
    /// Returns `Ok(true)` when a packet was queued; `Ok(false)` when the
    /// cached state already matched and nothing needed transmitting (any
    /// requested reply is emitted immediately in that case). A toggle
    /// queues the ON and OFF group packets back to back on one slot.
    ///
    /// Function packets are transient and travel in the accessory slot
    /// partition, so a decoder's persistent speed slot is never disturbed.
    pub fn submit_function(
        &mut self,
        target: u16,
        function: u8,
        state: FunctionState,
        reply: Option<&str>,
    ) -> Result<bool, ErrorCode> {
        self.check_running()?;
        if self.mode != PowerMode::Main {
            return Err(self.fail(ErrorCode::InvalidState, self.mode as u16));
        }
        if let Err(code) = packet::check_mobile_address(target) {
            return Err(self.fail(code, target));
        }
        if let Err(code) = packet::check_function(function) {
            return Err(self.fail(code, function as u16));
        }
        let group = match FunctionGroup::containing(function) {
            Ok(group) => group,
            Err(code) => return Err(self.fail(code, function as u16)),
        };
        let index = match find_slot(&self.slots, SlotRole::Accessory, target as i16) {
            Some(index) => index,
            None => return Err(self.fail(ErrorCode::TransmissionBusy, target)),
        };
        let repeats = self.constants.transient_command_repeats;
        let wanted = match state {
            FunctionState::Toggle => {
                if self.pool.available() < 2 {
                    return Err(self.fail(ErrorCode::CommandQueueFull, target));
                }
                for on in [true, false] {
                    let (_, bits) = self.functions.update(target, function, on);
                    let payload = match packet::function_group(target, group, bits) {
                        Ok(payload) => payload,
                        Err(code) => return Err(self.fail(code, target)),
                    };
                    match self.pool.alloc(
                        target as i16,
                        repeats,
                        DCC_SHORT_PREAMBLE,
                        DCC_STANDARD_POSTAMBLE,
                        &payload,
                    ) {
                        Ok(packet_index) => self.queue_on_slot(index, packet_index, false),
                        Err(code) => return Err(self.fail(code, target)),
                    }
                }
                self.set_reply(index, ReplyMode::OnSend, reply);
                return Ok(true);
            }
            FunctionState::On => true,
            FunctionState::Off => false,
        };
        if self.pool.available() == 0 {
            return Err(self.fail(ErrorCode::CommandQueueFull, target));
        }
        let (changed, bits) = self.functions.update(target, function, wanted);
        if !changed {
            // Nothing to transmit; the continuous idle stream keeps the
            // rail occupied. Settle the reply right away.
            if let Some(text) = reply {
                let mut resolved = Reply::new();
                for c in text.chars().take(REPLY_LENGTH) {
                    let _ = resolved.push(c);
                }
                self.emit_reply(resolved);
            }
            return Ok(false);
        }
        let payload = match packet::function_group(target, group, bits) {
            Ok(payload) => payload,
            Err(code) => return Err(self.fail(code, target)),
        };
        match self.pool.alloc(
            target as i16,
            repeats,
            DCC_SHORT_PREAMBLE,
            DCC_STANDARD_POSTAMBLE,
            &payload,
        ) {
            Ok(packet_index) => {
                self.set_reply(index, ReplyMode::OnSend, reply);
                self.queue_on_slot(index, packet_index, false);
                Ok(true)
            }
            Err(code) => Err(self.fail(code, target)),
        }
    }

    /// Write a whole CV byte on the programming track.
    pub fn submit_cv_write(
        &mut self,
        cv: u16,
        value: u8,
        reply: Option<&str>,
    ) -> Result<(), ErrorCode> {
        self.submit_service(cv, ServiceOp::WriteByte { value }, reply)
    }

    /// Verify a whole CV byte on the programming track.
    pub fn submit_cv_verify(
        &mut self,
        cv: u16,
        value: u8,
        reply: Option<&str>,
    ) -> Result<(), ErrorCode> {
        self.submit_service(cv, ServiceOp::VerifyByte { value }, reply)
    }

    /// Write a single CV bit on the programming track.
    pub fn submit_cv_write_bit(
        &mut self,
        cv: u16,
        bit: u8,
        value: u8,
        reply: Option<&str>,
    ) -> Result<(), ErrorCode> {
        let value = match value {
            0 => false,
            1 => true,
            _ => return Err(self.fail(ErrorCode::InvalidBitValue, value as u16)),
        };
        self.submit_service(cv, ServiceOp::WriteBit { bit, value }, reply)
    }

    /// Verify a single CV bit on the programming track.
    pub fn submit_cv_verify_bit(
        &mut self,
        cv: u16,
        bit: u8,
        value: u8,
        reply: Option<&str>,
    ) -> Result<(), ErrorCode> {
        let value = match value {
            0 => false,
            1 => true,
            _ => return Err(self.fail(ErrorCode::InvalidBitValue, value as u16)),
        };
        self.submit_service(cv, ServiceOp::VerifyBit { bit, value }, reply)
    }

    /// Queue a full service-mode sequence on the programming slot:
    /// reset, the command twice, reset. Decoders are fussy about seeing
    /// two intact copies of a service-mode command before acting, so the
    /// duplication stays.
    fn submit_service(
        &mut self,
        cv: u16,
        op: ServiceOp,
        reply: Option<&str>,
    ) -> Result<(), ErrorCode> {
        self.check_running()?;
        if cfg!(not(feature = "prog-track")) {
            return Err(self.fail(ErrorCode::NoProgrammingTrack, cv));
        }
        if self.mode != PowerMode::Prog {
            return Err(self.fail(ErrorCode::InvalidState, self.mode as u16));
        }
        let payload = match packet::service_mode(cv, op) {
            Ok(payload) => payload,
            Err(code) => return Err(self.fail(code, cv)),
        };
        if self.pool.available() < 4 {
            return Err(self.fail(ErrorCode::CommandQueueFull, cv));
        }
        let index = match find_slot(&self.slots, SlotRole::Programming, 0) {
            Some(index) => index,
            None => return Err(self.fail(ErrorCode::TransmissionBusy, cv)),
        };
        if self.slots[index].state != SlotState::Empty {
            // Service sequences are strictly ordered; never interleave.
            return Err(self.fail(ErrorCode::TransmissionBusy, cv));
        }

        let reset = packet::reset();
        let resets = self.constants.service_mode_reset_repeats;
        let commands = self.constants.service_mode_command_repeats;
        let sequence: [(&[u8], u8, u8); 4] = [
            (&reset, resets, DCC_STANDARD_POSTAMBLE),
            (&payload, commands, CONFIRMATION_PAUSE),
            (&payload, commands, CONFIRMATION_PAUSE),
            (&reset, resets, DCC_STANDARD_POSTAMBLE),
        ];
        for (bytes, duration, postamble) in sequence {
            match self
                .pool
                .alloc(0, duration, DCC_LONG_PREAMBLE, postamble, bytes)
            {
                Ok(packet_index) => {
                    self.pool
                        .append(&mut self.slots[index].pending, packet_index);
                }
                Err(code) => return Err(self.fail(code, cv)),
            }
        }
        // Drop any stale acknowledgment before the new window arms.
        let _ = self.power.take_confirmed();
        self.set_reply(index, ReplyMode::OnConfirm, reply);
        self.slots[index].state = SlotState::Load;
        Ok(())
    }

    /// Consume a latched ADC reading, if any, and run the district
    /// monitor on it.
    pub fn poll_adc(&mut self, now: u32) {
        if let Ok((district, reading)) = self.adc.take() {
            self.feed_load(district, reading, now);
        }
    }

    /// Feed one district current reading to the power monitor and relay
    /// whatever it decides to the host layer.
    pub fn feed_load(&mut self, district: u8, reading: u16, now: u32) {
        if (district as usize) >= D {
            return;
        }
        if !self.power.lock_consistent() {
            // The phase-lock invariant is load-bearing; a violation means
            // the monitor state is corrupt and supervision cannot be
            // trusted.
            self.errors.log_terminate(district as u16);
            return;
        }
        let report = self
            .power
            .sample(district as usize, reading, now, &self.constants);
        if let Some(fault) = report.fault {
            let code = match fault {
                PowerFault::Spike => ErrorCode::PowerSpike,
                PowerFault::Overload => ErrorCode::PowerOverload,
            };
            self.errors.log(code, district as u16);
        }
        if report.changed {
            let districts = self.power.district_status();
            self.emit_event(Event::Districts(districts));
        }
    }

    /// Timed reporting: every `periodic_interval` milliseconds, emit the
    /// highest district load seen since the previous report and re-emit
    /// the district status tuple.
    pub fn periodic(&mut self, now: u32) {
        if now.wrapping_sub(self.last_periodic) < self.constants.periodic_interval as u32 {
            return;
        }
        self.last_periodic = now;
        let (district, raw) = self.power.take_peak();
        let milliamps = mul_div(
            raw as u32,
            FULL_SCALE_MILLIAMPS as u32,
            ADC_FULL_SCALE as u32,
        ) as u16;
        let districts = self.power.district_status();
        self.emit_event(Event::Load {
            district,
            milliamps,
        });
        self.emit_event(Event::Districts(districts));
    }

    /// Take the next queued reply for the host layer.
    pub fn next_reply(&mut self) -> Option<Reply> {
        self.replies.pop_front()
    }

    /// Take the next queued event for the host layer.
    pub fn next_event(&mut self) -> Option<Event<D>> {
        self.events.pop_front()
    }

    /// Number of empty transmission slots in a role partition.
    pub fn free_slots(&self, role: SlotRole) -> usize {
        slots::free_slots(&self.slots, role)
    }

    /// Per-district status codes.
    pub fn district_status(&self) -> [u8; D] {
        self.power.district_status()
    }

    fn check_running(&self) -> Result<(), ErrorCode> {
        if self.errors.halted() {
            Err(ErrorCode::AssertionFailed)
        } else {
            Ok(())
        }
    }

    fn fail(&mut self, code: ErrorCode, arg: u16) -> ErrorCode {
        self.errors.log(code, arg);
        code
    }

    fn set_reply(&mut self, index: usize, mode: ReplyMode, template: Option<&str>) {
        let slot = &mut self.slots[index];
        slot.reply.clear();
        match template {
            Some(text) => {
                slot.reply_mode = mode;
                for c in text.chars().take(REPLY_LENGTH) {
                    let _ = slot.reply.push(c);
                }
            }
            None => slot.reply_mode = ReplyMode::None,
        }
    }

    /// Append a packet to a slot's FIFO and nudge the slot state: an
    /// empty slot becomes LOAD for the manager; a running slot is told to
    /// RELOAD when the new packet supersedes the stream in flight.
    fn queue_on_slot(&mut self, index: usize, packet_index: u8, supersede: bool) {
        self.pool
            .append(&mut self.slots[index].pending, packet_index);
        let slot = &mut self.slots[index];
        match slot.state {
            SlotState::Empty => slot.state = SlotState::Load,
            SlotState::Run if supersede => slot.state = SlotState::Reload,
            _ => {}
        }
    }

    fn emit_reply(&mut self, text: Reply) {
        if self.replies.push_back(text).is_err() {
            self.errors.log(ErrorCode::ReportFail, 0);
        }
    }

    fn emit_event(&mut self, event: Event<D>) {
        if self.events.push_back(event).is_err() {
            self.errors.log(ErrorCode::ReportFail, 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::{BIT_BUFFER_CELLS, MOBILE_BASE, MOBILE_SLOTS};
    use embedded_hal_mock::eh1::digital::{
        Mock as PinMock, State as PinState, Transaction as PinTransaction,
    };
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::vec::Vec;

    /// Output pin that records every level written, so full waveforms can
    /// be decoded back into bits.
    #[derive(Debug)]
    struct RecordingPin {
        levels: Rc<RefCell<Vec<bool>>>,
    }

    impl embedded_hal::digital::ErrorType for RecordingPin {
        type Error = core::convert::Infallible;
    }

    impl OutputPin for RecordingPin {
        fn set_low(&mut self) -> Result<(), Self::Error> {
            self.levels.borrow_mut().push(false);
            Ok(())
        }

        fn set_high(&mut self) -> Result<(), Self::Error> {
            self.levels.borrow_mut().push(true);
            Ok(())
        }
    }

    /// Two-district driver (main + programming) with mock pins for tests
    /// that never tick the generator.
    fn control_driver(
        enable_main: &[PinTransaction],
        enable_prog: &[PinTransaction],
    ) -> DccDriver<PinMock, PinMock, 2> {
        let districts = [
            District::new(PinMock::new(enable_main), PinMock::new(&[]), false),
            District::new(PinMock::new(enable_prog), PinMock::new(&[]), true),
        ];
        DccDriver::new(districts, Constants::default())
    }

    fn finish(mut driver: DccDriver<PinMock, PinMock, 2>) {
        for index in 0..2 {
            let district = driver.power.district_mut(index);
            district.enable.done();
            district.direction.done();
        }
    }

    /// Single-district driver whose direction pin records the waveform.
    fn rail_driver() -> (DccDriver<PinMock, RecordingPin, 1>, Rc<RefCell<Vec<bool>>>) {
        let levels = Rc::new(RefCell::new(Vec::new()));
        let district = District::new(
            PinMock::new(&[PinTransaction::set(PinState::High)]),
            RecordingPin {
                levels: levels.clone(),
            },
            false,
        );
        let mut driver = DccDriver::new([district], Constants::default());
        driver.set_power(PowerMode::Main, 0).unwrap();
        (driver, levels)
    }

    fn finish_rail(mut driver: DccDriver<PinMock, RecordingPin, 1>) {
        driver.power.district_mut(0).enable.done();
    }

    /// Decode recorded polarity levels back into DCC bits: one write per
    /// tick, so runs of equal level are half-periods (4 ticks for a `1`,
    /// 7 for a `0`), and consecutive equal halves pair into bits.
    fn decode_rail(levels: &[bool]) -> Vec<bool> {
        let mut runs: Vec<usize> = Vec::new();
        let mut last = None;
        let mut count = 0usize;
        for &level in levels {
            match last {
                Some(prev) if prev == level => count += 1,
                Some(_) => {
                    runs.push(count);
                    count = 1;
                    last = Some(level);
                }
                None => {
                    count = 1;
                    last = Some(level);
                }
            }
        }
        // Drop the (possibly unfinished) final run; the first run is one
        // write short because the pin's pre-start level was never written.
        let _ = runs.pop();
        let mut halves = Vec::new();
        for (index, &ticks) in runs.iter().enumerate() {
            let adjusted = if index == 0 { ticks + 1 } else { ticks };
            assert!(
                adjusted == 4 || adjusted == 7,
                "half-period of {} ticks at run {}",
                adjusted,
                index
            );
            halves.push(adjusted == 4);
        }
        let mut bits = Vec::new();
        for pair in halves.chunks(2) {
            if let [first, second] = pair {
                assert_eq!(first, second, "mismatched bit halves");
                bits.push(*first);
            }
        }
        bits
    }

    fn contains(haystack: &[bool], needle: &[bool]) -> bool {
        haystack.windows(needle.len()).any(|w| w == needle)
    }

    fn packet_bits(bytes: &[u8], preamble: u8, postamble: u8) -> Vec<bool> {
        let mut cells = [0u8; BIT_BUFFER_CELLS];
        let n = encoding::encode_packet(bytes, preamble, postamble, &mut cells).unwrap();
        let mut bits = [false; 512];
        let m = encoding::decode_cells(&cells[..n], &mut bits).unwrap();
        bits[..m].to_vec()
    }

    #[test]
    fn test_rail_carries_idle_packets_from_power_on() {
        let (mut driver, levels) = rail_driver();
        for _ in 0..2000 {
            driver.tick();
        }
        let bits = decode_rail(&levels.borrow());
        let idle = packet_bits(&[0xff, 0x00, 0xff], DCC_SHORT_PREAMBLE, 1);
        assert!(contains(&bits, &idle));
        finish_rail(driver);
    }

    #[test]
    fn test_submitted_speed_packet_reaches_the_rail() {
        let (mut driver, levels) = rail_driver();
        driver.submit_mobile(3, 10, 1, None).unwrap();
        for _ in 0..TRANSMISSION_SLOTS {
            driver.manage();
        }
        for _ in 0..6000 {
            driver.tick();
        }
        let bits = decode_rail(&levels.borrow());
        let speed = packet_bits(&[0x03, 0x3f, 0x8b, 0xb7], DCC_SHORT_PREAMBLE, 1);
        assert!(contains(&bits, &speed));
        finish_rail(driver);
    }

    #[test]
    fn test_reload_hands_a_running_slot_back() {
        let (mut driver, _levels) = rail_driver();
        driver.submit_mobile(3, 10, 1, None).unwrap();
        for _ in 0..TRANSMISSION_SLOTS {
            driver.manage();
        }
        assert_eq!(driver.slots[MOBILE_BASE].state, SlotState::Run);
        for _ in 0..1000 {
            driver.tick();
        }
        // Supersede the infinite stream in flight.
        driver.submit_mobile(3, 126, 1, None).unwrap();
        assert_eq!(driver.slots[MOBILE_BASE].state, SlotState::Reload);
        let mut guard = 0;
        while driver.slots[MOBILE_BASE].state != SlotState::Load {
            driver.tick();
            guard += 1;
            assert!(guard < 20_000, "interrupt never honoured the reload");
        }
        for _ in 0..TRANSMISSION_SLOTS {
            driver.manage();
        }
        assert_eq!(driver.slots[MOBILE_BASE].state, SlotState::Run);
        // The live bits now encode speed 126 (wire value 127).
        let bits = {
            let mut decoded = [false; 512];
            let n =
                encoding::decode_cells(&driver.slots[MOBILE_BASE].bits, &mut decoded).unwrap();
            decoded[..n].to_vec()
        };
        let expected = packet_bits(
            &[0x03, 0x3f, 0xff, 0xc3],
            DCC_SHORT_PREAMBLE,
            DCC_STANDARD_POSTAMBLE,
        );
        assert_eq!(bits, expected);
        finish_rail(driver);
    }

    #[test]
    fn test_mobile_resubmission_coalesces_and_supersedes() {
        let mut driver = control_driver(
            &[PinTransaction::set(PinState::High)],
            &[PinTransaction::set(PinState::Low)],
        );
        driver.set_power(PowerMode::Main, 0).unwrap();

        driver.submit_mobile(3, 10, 1, None).unwrap();
        assert_eq!(driver.slots[MOBILE_BASE].state, SlotState::Load);
        for _ in 0..TRANSMISSION_SLOTS {
            driver.manage();
        }
        assert_eq!(driver.slots[MOBILE_BASE].state, SlotState::Run);
        assert_eq!(driver.slots[MOBILE_BASE].duration, 0);
        assert!(driver.slots[MOBILE_BASE].pending.is_none());

        driver.submit_mobile(3, 20, 1, None).unwrap();
        assert_eq!(driver.slots[MOBILE_BASE].state, SlotState::Reload);
        assert!(driver.slots[MOBILE_BASE].pending.is_some());

        driver.submit_mobile(4, 10, 1, None).unwrap();
        assert_eq!(driver.slots[MOBILE_BASE + 1].state, SlotState::Load);
        assert_eq!(driver.slots[MOBILE_BASE + 1].target, 4);
        finish(driver);
    }

    #[test]
    fn test_powered_mode_changes_must_pass_through_off() {
        let mut driver = control_driver(
            &[
                PinTransaction::set(PinState::High),
                PinTransaction::set(PinState::Low),
                PinTransaction::set(PinState::Low),
            ],
            &[
                PinTransaction::set(PinState::Low),
                PinTransaction::set(PinState::Low),
                PinTransaction::set(PinState::High),
            ],
        );
        driver.set_power(PowerMode::Main, 0).unwrap();
        assert_eq!(driver.next_event(), Some(Event::Power(PowerMode::Main)));
        assert_eq!(driver.next_event(), Some(Event::Districts([1, 0])));

        // Direct MAIN → PROG is refused and changes nothing.
        assert_eq!(
            driver.set_power(PowerMode::Prog, 1),
            Err(ErrorCode::PowerNotOff)
        );
        assert_eq!(driver.mode, PowerMode::Main);
        assert!(driver.next_event().is_none());

        driver.set_power(PowerMode::Off, 2).unwrap();
        driver.set_power(PowerMode::Prog, 3).unwrap();
        assert_eq!(driver.mode, PowerMode::Prog);
        finish(driver);
    }

    #[test]
    fn test_prog_mode_needs_a_programming_track() {
        let district = District::new(
            PinMock::new(&[]),
            PinMock::new(&[]),
            false,
        );
        let mut driver: DccDriver<PinMock, PinMock, 1> =
            DccDriver::new([district], Constants::default());
        assert_eq!(
            driver.set_power(PowerMode::Prog, 0),
            Err(ErrorCode::NoProgrammingTrack)
        );
        let district = driver.power.district_mut(0);
        district.enable.done();
        district.direction.done();
    }

    #[test]
    fn test_cv_write_queues_the_service_sequence() {
        let mut driver = control_driver(
            &[PinTransaction::set(PinState::Low)],
            &[PinTransaction::set(PinState::High)],
        );
        driver.set_power(PowerMode::Prog, 0).unwrap();
        driver.submit_cv_write(1, 42, Some("cv 1 = #")).unwrap();

        let slot = &driver.slots[PROGRAMMING_BASE];
        assert_eq!(slot.state, SlotState::Load);
        assert_eq!(slot.reply_mode, ReplyMode::OnConfirm);

        let mut chain = Vec::new();
        let mut at = slot.pending;
        while let Some(index) = at {
            let packet = driver.pool.get(index);
            chain.push((
                packet.bytes.clone(),
                packet.duration,
                packet.preamble,
                packet.postamble,
            ));
            at = driver.pool.next_of(index);
        }
        type Wire = heapless::Vec<u8, { crate::consts::MAX_WIRE_BYTES }>;
        let reset = (
            Wire::from_slice(&[0x00, 0x00, 0x00]).unwrap(),
            20u8,
            DCC_LONG_PREAMBLE,
            DCC_STANDARD_POSTAMBLE,
        );
        let write = (
            Wire::from_slice(&[0x7c, 0x00, 0x2a, 0x56]).unwrap(),
            10u8,
            DCC_LONG_PREAMBLE,
            CONFIRMATION_PAUSE,
        );
        assert_eq!(chain, vec![reset.clone(), write.clone(), write, reset]);
        finish(driver);
    }

    #[test]
    fn test_cv_write_rejected_outside_prog_mode() {
        let mut driver = control_driver(
            &[PinTransaction::set(PinState::High)],
            &[PinTransaction::set(PinState::Low)],
        );
        driver.set_power(PowerMode::Main, 0).unwrap();
        assert_eq!(
            driver.submit_cv_write(1, 42, None),
            Err(ErrorCode::InvalidState)
        );
        assert_eq!(driver.pool.available(), crate::consts::PENDING_POOL_SIZE);
        finish(driver);
    }

    #[test]
    fn test_cv_confirmation_reply_without_ack() {
        let mut driver = control_driver(
            &[PinTransaction::set(PinState::Low)],
            &[PinTransaction::set(PinState::High)],
        );
        driver.set_power(PowerMode::Prog, 0).unwrap();
        driver.submit_cv_write(1, 42, Some("cv 1 = #")).unwrap();

        // Mock the interrupt: whenever the manager arms the slot, declare
        // the transmission complete so the next packet loads.
        let mut guard = 0;
        while driver.slots[PROGRAMMING_BASE].state != SlotState::Empty {
            driver.manage();
            if driver.slots[PROGRAMMING_BASE].state == SlotState::Run {
                driver.slots[PROGRAMMING_BASE].state = SlotState::Load;
            }
            guard += 1;
            assert!(guard < 200);
        }
        assert_eq!(driver.next_reply().unwrap().as_str(), "cv 1 = 0");
        finish(driver);
    }

    #[test]
    fn test_cv_confirmation_reply_with_ack() {
        let mut driver = control_driver(
            &[PinTransaction::set(PinState::Low)],
            &[PinTransaction::set(PinState::High)],
        );
        driver.set_power(PowerMode::Prog, 0).unwrap();
        driver.submit_cv_write(1, 42, Some("cv 1 = #")).unwrap();

        // Settle the programming district's baseline well past the grace
        // period, then drain the sequence with an acknowledgment pulse in
        // every listening window.
        for _ in 0..30 {
            driver.feed_load(1, 10, 2000);
        }
        let mut guard = 0;
        while driver.slots[PROGRAMMING_BASE].state != SlotState::Empty {
            driver.manage();
            if driver.slots[PROGRAMMING_BASE].state == SlotState::Run {
                for _ in 0..4 {
                    driver.feed_load(1, 200, 2001);
                }
                driver.slots[PROGRAMMING_BASE].state = SlotState::Load;
            }
            guard += 1;
            assert!(guard < 200);
        }
        assert_eq!(driver.next_reply().unwrap().as_str(), "cv 1 = 1");
        finish(driver);
    }

    #[test]
    fn test_toggle_queues_on_then_off() {
        let mut driver = control_driver(
            &[PinTransaction::set(PinState::High)],
            &[PinTransaction::set(PinState::Low)],
        );
        driver.set_power(PowerMode::Main, 0).unwrap();
        assert!(driver
            .submit_function(3, 0, FunctionState::Toggle, None)
            .unwrap());

        // Function packets are transient: they ride the accessory
        // partition, not the decoder's persistent mobile slot.
        let slot = &driver.slots[crate::consts::ACCESSORY_BASE];
        assert_eq!(slot.state, SlotState::Load);
        assert_eq!(slot.target, 3);
        let first = slot.pending.unwrap();
        let second = driver.pool.next_of(first).unwrap();
        assert_eq!(&driver.pool.get(first).bytes[..], &[0x03, 0x90, 0x93]);
        assert_eq!(&driver.pool.get(second).bytes[..], &[0x03, 0x80, 0x83]);
        finish(driver);
    }

    #[test]
    fn test_unchanged_function_transmits_nothing() {
        let mut driver = control_driver(
            &[PinTransaction::set(PinState::High)],
            &[PinTransaction::set(PinState::Low)],
        );
        driver.set_power(PowerMode::Main, 0).unwrap();
        assert!(driver
            .submit_function(3, 1, FunctionState::On, None)
            .unwrap());
        let queued = driver.pool.available();

        // Same state again: no packet, and the reply settles immediately.
        assert!(!driver
            .submit_function(3, 1, FunctionState::On, Some("f1 on"))
            .unwrap());
        assert_eq!(driver.pool.available(), queued);
        assert_eq!(driver.next_reply().unwrap().as_str(), "f1 on");
        finish(driver);
    }

    #[test]
    fn test_stop_commands_are_finite() {
        let mut driver = control_driver(
            &[PinTransaction::set(PinState::High)],
            &[PinTransaction::set(PinState::Low)],
        );
        driver.set_power(PowerMode::Main, 0).unwrap();
        driver.submit_mobile(3, crate::consts::EMERGENCY_STOP, 1, None).unwrap();
        let head = driver.slots[MOBILE_BASE].pending.unwrap();
        let packet = driver.pool.get(head);
        assert_eq!(
            packet.duration,
            Constants::default().transient_command_repeats
        );
        assert_eq!(packet.bytes[2], 0x81);
        finish(driver);
    }

    #[test]
    fn test_periodic_load_report() {
        let mut driver = control_driver(
            &[PinTransaction::set(PinState::High)],
            &[PinTransaction::set(PinState::Low)],
        );
        driver.set_power(PowerMode::Main, 0).unwrap();
        let _ = driver.next_event();
        let _ = driver.next_event();

        driver.feed_load(0, 600, 1);
        driver.periodic(999);
        assert!(driver.next_event().is_none());

        driver.periodic(1500);
        // One reading of 600 leaves the short average at 300; scaled to
        // the 2 A full range that is 586 mA.
        assert_eq!(
            driver.next_event(),
            Some(Event::Load {
                district: 0,
                milliamps: 586
            })
        );
        assert!(matches!(driver.next_event(), Some(Event::Districts(_))));
        finish(driver);
    }

    #[test]
    fn test_free_slot_reporting() {
        let mut driver = control_driver(
            &[PinTransaction::set(PinState::High)],
            &[PinTransaction::set(PinState::Low)],
        );
        driver.set_power(PowerMode::Main, 0).unwrap();
        assert_eq!(driver.free_slots(SlotRole::Mobile), MOBILE_SLOTS);
        driver.submit_mobile(3, 10, 1, None).unwrap();
        assert_eq!(driver.free_slots(SlotRole::Mobile), MOBILE_SLOTS - 1);
        assert_eq!(
            driver.free_slots(SlotRole::Accessory),
            crate::consts::ACCESSORY_SLOTS
        );
        finish(driver);
    }

    #[test]
    fn test_assertion_failure_halts_the_pipeline() {
        let mut driver = control_driver(
            &[PinTransaction::set(PinState::High)],
            &[PinTransaction::set(PinState::Low)],
        );
        driver.set_power(PowerMode::Main, 0).unwrap();
        driver.submit_mobile(3, 10, 1, None).unwrap();

        driver.errors.log_terminate(7);
        assert_eq!(
            driver.submit_mobile(4, 10, 1, None),
            Err(ErrorCode::AssertionFailed)
        );
        // The manager refuses to touch anything once halted.
        for _ in 0..TRANSMISSION_SLOTS {
            driver.manage();
        }
        assert_eq!(driver.slots[MOBILE_BASE].state, SlotState::Load);
        finish(driver);
    }
}
