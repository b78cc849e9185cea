//! Tunable operating constants and their non-volatile representation.
//!
//! Values that might need tuning in the field, without recompiling the
//! firmware, live in a single [`Constants`] struct. The struct serialises
//! to a fixed-layout blob with a 16-bit checksum trailer; the board-support
//! layer stores and retrieves that blob from whatever non-volatile memory
//! it has (EEPROM, flash page, NVS), which keeps all storage I/O out of
//! this crate.
//!
//! On boot, [`Constants::restore`] validates the stored blob and falls back
//! to compiled-in defaults when the checksum does not hold, telling the
//! caller so the corrected blob can be written back.

/// Serialised size of [`Constants`]: eight words, four bytes, and the
/// 16-bit checksum trailer.
pub const CONSTANTS_BLOB: usize = 8 * 2 + 4 + 2;

/// The tunable constants of the core.
///
/// All periods are in milliseconds; current limits are raw ADC readings
/// (0..=1023); repeat counts are packet transmission counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Constants {
    /// Short-window current reading above which a spike is declared.
    pub instant_current_limit: u16,
    /// Long-window current reading above which an overload is declared.
    pub average_current_limit: u16,
    /// Period after powering a district during which power conditions are
    /// ignored.
    pub power_grace_period: u16,
    /// Interval between periodic load reports.
    pub periodic_interval: u16,
    /// Interval between full display refreshes (consumed by the display
    /// collaborator; carried here so one blob holds every tunable).
    pub lcd_update_interval: u16,
    /// Pause between sequential display line updates.
    pub line_refresh_interval: u16,
    /// How long a district stays off after a power exception before a
    /// restart is attempted.
    pub driver_reset_period: u16,
    /// How long a flipped district is given to prove the new phase before
    /// the flip is abandoned.
    pub driver_phase_period: u16,
    /// Minimum short-minus-long average delta recognised as a decoder
    /// acknowledgment pulse.
    pub minimum_delta_amps: u8,
    /// Transmission count for transient (accessory, stop, function)
    /// commands.
    pub transient_command_repeats: u8,
    /// Transmission count for the service-mode reset packets framing a
    /// programming sequence.
    pub service_mode_reset_repeats: u8,
    /// Transmission count for service-mode action packets.
    pub service_mode_command_repeats: u8,
}

impl Default for Constants {
    fn default() -> Self {
        Self {
            instant_current_limit: 850,
            average_current_limit: 750,
            power_grace_period: 1000,
            periodic_interval: 1000,
            lcd_update_interval: 1000,
            line_refresh_interval: 200,
            driver_reset_period: 10_000,
            driver_phase_period: 100,
            minimum_delta_amps: 18,
            transient_command_repeats: 8,
            service_mode_reset_repeats: 20,
            service_mode_command_repeats: 10,
        }
    }
}

/// Rotate-and-XOR checksum over the value bytes of the blob.
///
/// Seeded 0xFFFF; each byte rotates the sum left three bits and folds the
/// byte in, so reordered or zeroed content does not verify.
fn checksum(bytes: &[u8]) -> u16 {
    let mut sum: u16 = 0xffff;
    for b in bytes {
        sum = sum.rotate_left(3) ^ (*b as u16);
    }
    sum
}

impl Constants {
    /// Serialise to the checksummed non-volatile blob.
    pub fn to_blob(&self) -> [u8; CONSTANTS_BLOB] {
        let mut blob = [0u8; CONSTANTS_BLOB];
        let words = [
            self.instant_current_limit,
            self.average_current_limit,
            self.power_grace_period,
            self.periodic_interval,
            self.lcd_update_interval,
            self.line_refresh_interval,
            self.driver_reset_period,
            self.driver_phase_period,
        ];
        let mut at = 0;
        for w in words {
            blob[at..at + 2].copy_from_slice(&w.to_le_bytes());
            at += 2;
        }
        for b in [
            self.minimum_delta_amps,
            self.transient_command_repeats,
            self.service_mode_reset_repeats,
            self.service_mode_command_repeats,
        ] {
            blob[at] = b;
            at += 1;
        }
        let sum = checksum(&blob[..at]);
        blob[at..at + 2].copy_from_slice(&sum.to_le_bytes());
        blob
    }

    /// Deserialise a blob, returning `None` when the checksum trailer does
    /// not match the content.
    pub fn from_blob(blob: &[u8; CONSTANTS_BLOB]) -> Option<Self> {
        let body = CONSTANTS_BLOB - 2;
        let stored = u16::from_le_bytes([blob[body], blob[body + 1]]);
        if checksum(&blob[..body]) != stored {
            return None;
        }
        let word = |i: usize| u16::from_le_bytes([blob[i * 2], blob[i * 2 + 1]]);
        Some(Self {
            instant_current_limit: word(0),
            average_current_limit: word(1),
            power_grace_period: word(2),
            periodic_interval: word(3),
            lcd_update_interval: word(4),
            line_refresh_interval: word(5),
            driver_reset_period: word(6),
            driver_phase_period: word(7),
            minimum_delta_amps: blob[16],
            transient_command_repeats: blob[17],
            service_mode_reset_repeats: blob[18],
            service_mode_command_repeats: blob[19],
        })
    }

    /// Load constants from a stored blob, resetting to defaults when the
    /// content does not verify.
    ///
    /// Returns the constants and `true` when the blob was rejected, in
    /// which case the caller should rewrite its store from
    /// [`to_blob`](Constants::to_blob).
    pub fn restore(blob: &[u8; CONSTANTS_BLOB]) -> (Self, bool) {
        match Self::from_blob(blob) {
            Some(constants) => (constants, false),
            None => (Self::default(), true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_round_trip_is_byte_equal() {
        let constants = Constants {
            instant_current_limit: 900,
            minimum_delta_amps: 25,
            ..Constants::default()
        };
        let blob = constants.to_blob();
        let reloaded = Constants::from_blob(&blob).unwrap();
        assert_eq!(reloaded, constants);
        // Saving the reloaded values reproduces the identical blob.
        assert_eq!(reloaded.to_blob(), blob);
    }

    #[test]
    fn test_corrupt_blob_resets_to_defaults() {
        let mut blob = Constants::default().to_blob();
        blob[3] ^= 0x40;
        assert!(Constants::from_blob(&blob).is_none());
        let (constants, reset) = Constants::restore(&blob);
        assert!(reset);
        assert_eq!(constants, Constants::default());
    }

    #[test]
    fn test_blank_store_resets_to_defaults() {
        let blob = [0xff; CONSTANTS_BLOB];
        let (constants, reset) = Constants::restore(&blob);
        assert!(reset);
        assert_eq!(constants, Constants::default());
    }

    #[test]
    fn test_checksum_depends_on_byte_order() {
        let a = checksum(&[1, 2, 3]);
        let b = checksum(&[3, 2, 1]);
        assert_ne!(a, b);
    }
}
