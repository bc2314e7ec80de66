//! This module defines the protocol-level types shared by both module families:
//! status tokens, polarity, and the status words read back from the hardware.
//!
//! The status words are a wire contract, so each one is a bitfield whose layout
//! matches the device bit-for-bit.

use modular_bitfield::prelude::*;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString};

/// The two supported hardware lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumIter, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Family {
    /// Char-echo protocol: every command character is echoed before the next is sent.
    #[strum(serialize = "family A")]
    FamilyA,
    /// Line-addressed SCPI-like protocol with `(@n)` channel suffixes.
    #[strum(serialize = "family B")]
    FamilyB,
}

/// Operational status of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumIter, Serialize)]
pub enum ChannelStatus {
    #[default]
    Off,
    On,
    RampUp,
    RampDown,
    Tripped,
}

impl ChannelStatus {
    /// True while the output is moving toward a target.
    pub fn is_ramping(self) -> bool {
        matches!(self, ChannelStatus::RampUp | ChannelStatus::RampDown)
    }
}

/// Output polarity of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString, Serialize)]
pub enum Polarity {
    /// `p` on the family B wire.
    #[strum(serialize = "p")]
    Positive,
    /// `n` on the family B wire.
    #[strum(serialize = "n")]
    Negative,
    #[default]
    #[strum(serialize = "?")]
    Unknown,
}

impl Polarity {
    /// Apply the polarity sign to a voltage magnitude.
    pub fn apply(self, magnitude: f64) -> f64 {
        match self {
            Polarity::Negative => -magnitude.abs(),
            _ => magnitude.abs(),
        }
    }
}

/// Status tokens replied by family A modules to `S<ch>` and `G<ch>`.
///
/// The reply has the form `S1=L2H`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, EnumIter)]
pub enum StatusToken {
    /// HV on, output at set-point.
    #[strum(serialize = "ON")]
    On,
    /// HV switch off.
    #[strum(serialize = "OFF")]
    Off,
    /// Ramping low to high.
    #[strum(serialize = "L2H")]
    LowToHigh,
    /// Ramping high to low.
    #[strum(serialize = "H2L")]
    HighToLow,
    /// Current trip was active. Reading it acknowledges the trip.
    #[strum(serialize = "TRP")]
    Trip,
    /// Hardware inhibit active.
    #[strum(serialize = "INH")]
    Inhibit,
    /// Front panel control.
    #[strum(serialize = "MAN")]
    Manual,
    /// Vmax or Imax exceeded.
    #[strum(serialize = "ERR")]
    Error,
}

impl StatusToken {
    /// The channel status this token reports, if it names one.
    pub fn channel_status(self) -> Option<ChannelStatus> {
        match self {
            StatusToken::On => Some(ChannelStatus::On),
            StatusToken::Off => Some(ChannelStatus::Off),
            StatusToken::LowToHigh => Some(ChannelStatus::RampUp),
            StatusToken::HighToLow => Some(ChannelStatus::RampDown),
            StatusToken::Trip => Some(ChannelStatus::Tripped),
            StatusToken::Inhibit | StatusToken::Manual | StatusToken::Error => None,
        }
    }
}

/// Family A module status byte, read with `T<ch>` as a decimal integer.
#[bitfield]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleStatusByte {
    /// Bit 0: delay time constant elapsed.
    pub dtc: bool,
    /// Bit 1: front panel control.
    pub manual: bool,
    /// Bit 2: polarity set to positive.
    pub positive: bool,
    /// Bit 3: HV switch in the OFF position.
    pub hv_switch_off: bool,
    /// Bit 4: kill function enabled.
    pub kill_enable: bool,
    /// Bit 5: inhibit is or was active.
    pub inhibit: bool,
    /// Bit 6: Vmax or Imax is or was exceeded.
    pub error: bool,
    /// Bit 7: output voltage quality not given.
    pub quality: bool,
}

impl From<u8> for ModuleStatusByte {
    fn from(value: u8) -> Self {
        Self::from_bytes([value])
    }
}

impl From<ModuleStatusByte> for u8 {
    fn from(value: ModuleStatusByte) -> Self {
        value.into_bytes()[0]
    }
}

/// Family B channel status word, read with `:READ:CHAN:STAT?`.
#[bitfield(bits = 32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelStatusWord {
    pub positive: bool,
    pub arc: bool,
    pub input_error: bool,
    pub on: bool,
    pub ramping: bool,
    pub emergency_off: bool,
    pub constant_current: bool,
    pub constant_voltage: bool,
    pub low_current_range: bool,
    pub current_bound: bool,
    pub voltage_bound: bool,
    pub external_inhibit: bool,
    pub trip: bool,
    pub current_limit_exceeded: bool,
    pub voltage_limit_exceeded: bool,
    #[skip]
    __: B17,
}

impl From<u32> for ChannelStatusWord {
    fn from(value: u32) -> Self {
        Self::from_bytes(value.to_le_bytes())
    }
}

impl From<ChannelStatusWord> for u32 {
    fn from(value: ChannelStatusWord) -> Self {
        u32::from_le_bytes(value.into_bytes())
    }
}

/// Family B channel event status word, read with `:READ:CHAN:EV:STAT?` and
/// cleared with `:EV CLEAR`.
#[bitfield(bits = 32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventStatusWord {
    #[skip]
    __: B2,
    pub input_error: bool,
    pub on_to_off: bool,
    pub end_of_ramp: bool,
    pub emergency_off: bool,
    pub constant_current: bool,
    pub constant_voltage: bool,
    #[skip]
    __: B1,
    pub current_bound: bool,
    pub voltage_bound: bool,
    pub external_inhibit: bool,
    pub trip: bool,
    pub current_limit: bool,
    pub voltage_limit: bool,
    #[skip]
    __: B17,
}

impl From<u32> for EventStatusWord {
    fn from(value: u32) -> Self {
        Self::from_bytes(value.to_le_bytes())
    }
}

impl From<EventStatusWord> for u32 {
    fn from(value: EventStatusWord) -> Self {
        u32::from_le_bytes(value.into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn status_token_round_trips_through_wire_text() {
        for token in StatusToken::iter() {
            let text = token.to_string();
            assert_eq!(text.parse::<StatusToken>().unwrap(), token);
        }
        assert!("XYZ".parse::<StatusToken>().is_err());
    }

    #[test]
    fn module_status_byte_layout() {
        let status = ModuleStatusByte::from(0b0010_0100);
        assert!(status.positive());
        assert!(status.inhibit());
        assert!(!status.manual());
        assert!(!status.quality());

        let built = ModuleStatusByte::new().with_hv_switch_off(true).with_error(true);
        assert_eq!(u8::from(built), 0b0100_1000);
    }

    #[test]
    fn channel_status_word_layout() {
        let word = ChannelStatusWord::from(0x0000_1019);
        assert!(word.positive());
        assert!(word.on());
        assert!(word.ramping());
        assert!(word.trip());
        assert!(!word.emergency_off());

        let built = ChannelStatusWord::new().with_emergency_off(true).with_external_inhibit(true);
        assert_eq!(u32::from(built), (1 << 5) | (1 << 11));
    }

    #[test]
    fn event_status_word_layout() {
        let word = EventStatusWord::from((1 << 12) | (1 << 5));
        assert!(word.trip());
        assert!(word.emergency_off());
        assert!(!word.end_of_ramp());

        let built = EventStatusWord::new().with_end_of_ramp(true).with_voltage_limit(true);
        assert_eq!(u32::from(built), (1 << 4) | (1 << 14));
    }

    #[test]
    fn reserved_bits_are_dropped() {
        // Bits above 14 carry nothing we model.
        let word = EventStatusWord::from(0xFFFF_0000 | (1 << 12));
        assert!(word.trip());
    }

    #[test]
    fn polarity_wire_names() {
        assert_eq!(Polarity::Positive.to_string(), "p");
        assert_eq!("n".parse::<Polarity>().unwrap(), Polarity::Negative);
        assert!("x".parse::<Polarity>().is_err());
        assert_eq!(Polarity::Negative.apply(500.0), -500.0);
        assert_eq!(Polarity::Unknown.apply(-5.0), 5.0);
    }
}
