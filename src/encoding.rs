//! Run-length bit-stream encoding and decoding for DCC packet framing.
//!
//! The signal-generator interrupt cannot afford to walk bytes and shift
//! masks while it is holding a 14.5 µs deadline, so packets are translated
//! ahead of time into the cheapest form the interrupt can consume: a
//! zero-terminated sequence of run-length cells, alternating between runs
//! of `1` bits and runs of `0` bits, always starting with a `1` run (the
//! preamble).
//!
//! ## Stream layout
//!
//! ```text
//! [preamble 1s] 0 [byte₀ MSB..LSB] 0 [byte₁ …] … 1 [postamble 1s] 0
//!  └─ cell 0    └─ cells folding each framing/data bit ─┘       └─ terminator
//! ```
//!
//! A data bit equal to the accumulating run extends it; a differing bit
//! flushes the run into the next cell and starts counting the opposite
//! value. The inter-byte `0` marker and the closing `1` marker go through
//! the same flush-or-extend logic, so, for example, a byte ending in `1`
//! merges straight into a postamble run.
//!
//! ## Functions
//!
//! - [`encode_packet`]: byte payload + framing counts → run-length cells
//! - [`decode_cells`]: run-length cells → individual bits, for tests and
//!   diagnostics
//!
//! A run longer than 255 cannot be represented in a cell and a packet
//! whose expansion does not fit the destination buffer cannot be
//! transmitted; both fail the translation, and the packet manager responds
//! by dropping the offending packet.

/// Error raised when a packet cannot be represented as run-length cells,
/// either because a run outgrew a cell or because the destination buffer
/// is too small.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Overflow;

struct RunWriter<'a> {
    cells: &'a mut [u8],
    at: usize,
    one: bool,
    count: u16,
}

impl<'a> RunWriter<'a> {
    fn new(cells: &'a mut [u8], preamble: u8) -> Self {
        Self {
            cells,
            at: 0,
            one: true,
            count: preamble as u16,
        }
    }

    fn flush(&mut self) -> Result<(), Overflow> {
        if self.count == 0 || self.count > crate::consts::MAX_RUN_LENGTH as u16 {
            return Err(Overflow);
        }
        if self.at >= self.cells.len() {
            return Err(Overflow);
        }
        self.cells[self.at] = self.count as u8;
        self.at += 1;
        Ok(())
    }

    fn push(&mut self, bit: bool) -> Result<(), Overflow> {
        if bit == self.one {
            self.count += 1;
            if self.count > crate::consts::MAX_RUN_LENGTH as u16 {
                return Err(Overflow);
            }
        } else {
            self.flush()?;
            self.one = bit;
            self.count = 1;
        }
        Ok(())
    }

    fn extend(&mut self, bits: u8) -> Result<(), Overflow> {
        self.count += bits as u16;
        if self.count > crate::consts::MAX_RUN_LENGTH as u16 {
            return Err(Overflow);
        }
        Ok(())
    }

    fn finish(mut self) -> Result<usize, Overflow> {
        self.flush()?;
        if self.at >= self.cells.len() {
            return Err(Overflow);
        }
        self.cells[self.at] = 0;
        Ok(self.at + 1)
    }
}

/// Translate a framed DCC packet into run-length cells.
///
/// `bytes` is the full wire content (payload plus parity), `preamble` and
/// `postamble` are the framing 1-bit counts, and `cells` receives the
/// zero-terminated stream. On success the number of cells written
/// (terminator included) is returned.
///
/// # Errors
///
/// [`Overflow`] when a run outgrows a cell or the stream outgrows `cells`;
/// nothing useful is left in the buffer in that case.
pub fn encode_packet(
    bytes: &[u8],
    preamble: u8,
    postamble: u8,
    cells: &mut [u8],
) -> Result<usize, Overflow> {
    let mut writer = RunWriter::new(cells, preamble);
    for byte in bytes {
        // Inter-byte marker: a single 0 ahead of every data byte.
        writer.push(false)?;
        for shift in (0..8).rev() {
            writer.push(byte & (1 << shift) != 0)?;
        }
    }
    // Packet end bit, then the postamble rides the same 1 run.
    writer.push(true)?;
    writer.extend(postamble.saturating_sub(1))?;
    writer.finish()
}

/// Expand run-length cells back into individual bits.
///
/// The inverse of [`encode_packet`], used to verify streams in tests and
/// diagnostics. `bits` receives one `bool` per transmitted bit; the number
/// written is returned, or `None` when `bits` is too small or a zero cell
/// appears anywhere but the terminator position.
pub fn decode_cells(cells: &[u8], bits: &mut [bool]) -> Option<usize> {
    let mut one = true;
    let mut at = 0;
    for &cell in cells {
        if cell == 0 {
            return Some(at);
        }
        for _ in 0..cell {
            if at >= bits.len() {
                return None;
            }
            bits[at] = one;
            at += 1;
        }
        one = !one;
    }
    // Ran off the end without a terminator.
    None
}
