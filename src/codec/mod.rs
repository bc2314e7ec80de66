//! Wire protocol codecs for the two module families.
//!
//! Both codecs own an interface implementing [embedded_io::Read] & [embedded_io::Write]
//! and expose the same channel-level call surface through [`HvCodec`], so the
//! channel state machine and polling worker never see the framing.
//!
//! Naming convention: "set" changes a configuration value, "get" reads one back,
//! and "read" returns a measured value.

pub mod char_echo;
pub mod scpi;

pub use char_echo::CharEchoCodec;
pub use scpi::ScpiCodec;

use embedded_io::Read;

use crate::{
    error::{Error, Result},
    register::{ChannelStatus, Family, Polarity},
};

/// Longest reply line either family produces.
pub(crate) const MAX_LINE: usize = 128;

/// Upper bound on bytes dropped by one resync, so a babbling device cannot
/// hold the line forever.
const MAX_DISCARD: usize = 4096;

/// Static device metadata read once at connection time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceInfo {
    pub model: String,
    pub serial_number: String,
    pub firmware: String,
    /// Voltage rating in volts, when the identity reply carries it.
    pub voltage_rating: Option<f64>,
    /// Current rating in amps, when the identity reply carries it.
    pub current_rating: Option<f64>,
}

/// Decoded channel status, merged from whatever status replies the family offers.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StatusReport {
    /// Status named explicitly by the device (family A status tokens).
    pub reported: Option<ChannelStatus>,
    pub hv_on: bool,
    pub ramping: bool,
    pub polarity: Polarity,
    pub tripped: bool,
    pub inhibit: bool,
    pub emergency_off: bool,
    pub manual: bool,
    pub error: bool,
}

/// The call surface a channel needs from a module's protocol.
///
/// Channels are addressed zero-based; each codec maps the index onto its wire
/// addressing.
pub trait HvCodec: Send {
    fn family(&self) -> Family;

    /// Query the device identity.
    fn identify(&mut self) -> Result<DeviceInfo>;

    /// Return the measured output voltage in volts, signed by polarity.
    fn read_voltage(&mut self, channel: u8) -> Result<f64>;

    /// Return the measured output current in amps.
    fn read_current(&mut self, channel: u8) -> Result<f64>;

    fn get_voltage_limit(&mut self, channel: u8) -> Result<f64>;

    fn get_current_limit(&mut self, channel: u8) -> Result<f64>;

    /// Get the voltage set-point in volts.
    fn get_set_voltage(&mut self, channel: u8) -> Result<f64>;

    /// Set the voltage set-point in volts. Whether this starts a ramp is family specific.
    fn set_voltage(&mut self, channel: u8, volts: f64) -> Result<()>;

    /// Get the ramp rate in volts per second.
    fn get_ramp_rate(&mut self, channel: u8) -> Result<f64>;

    fn set_ramp_rate(&mut self, channel: u8, volts_per_second: f64) -> Result<()>;

    /// Get the trip current in amps.
    fn get_trip_current(&mut self, channel: u8) -> Result<f64>;

    fn read_status(&mut self, channel: u8) -> Result<StatusReport>;

    /// `None` when the family has no auto-start setting.
    fn get_auto_start(&mut self, channel: u8) -> Result<Option<bool>>;

    /// Ask the device to move toward the set-point. Returns the status the
    /// device reports, if it reports one.
    fn start_ramp(&mut self, channel: u8) -> Result<Option<ChannelStatus>>;

    /// Enable or disable the output. Disabling ramps down to zero.
    fn set_hv(&mut self, channel: u8, on: bool) -> Result<()>;

    /// Immediate, ramp-free zeroing.
    fn emergency_off(&mut self, channel: u8) -> Result<()>;

    /// Acknowledge trip and emergency-off flags.
    fn clear_events(&mut self, channel: u8) -> Result<()>;

    fn set_polarity(&mut self, channel: u8, polarity: Polarity) -> Result<()>;

    /// Drop whatever is still waiting in the input, e.g. a reply that showed up
    /// after its read timed out. Returns the number of bytes dropped.
    fn discard_input(&mut self) -> usize;
}

pub(crate) fn read_byte<S: Read>(interface: &mut S) -> Result<u8> {
    let mut byte = [0u8; 1];
    match interface.read(&mut byte) {
        Ok(0) => Err(Error::Timeout),
        Ok(_) => Ok(byte[0]),
        Err(e) => Err(Error::serial(e)),
    }
}

/// Read until the interface times out or reports an error.
pub(crate) fn discard_pending<S: Read>(interface: &mut S) -> usize {
    let mut scratch = [0u8; MAX_LINE];
    let mut total = 0;
    while total < MAX_DISCARD {
        match interface.read(&mut scratch) {
            Ok(0) | Err(_) => break,
            Ok(n) => total += n,
        }
    }
    total
}

/// Read one reply line up to `terminator`. A trailing CR is stripped.
pub(crate) fn read_line<S: Read>(interface: &mut S, terminator: u8) -> Result<String> {
    let mut line: heapless::Vec<u8, MAX_LINE> = heapless::Vec::new();
    loop {
        let byte = read_byte(interface)?;
        if byte == terminator {
            break;
        }
        if line.push(byte).is_err() {
            return Err(Error::InvalidResponse(
                String::from_utf8_lossy(&line).into_owned(),
            ));
        }
    }
    let text = core::str::from_utf8(&line)
        .map_err(|_| Error::InvalidResponse(String::from_utf8_lossy(&line).into_owned()))?;
    Ok(text.trim_end_matches('\r').to_string())
}

pub(crate) fn parse_number(reply: &str) -> Result<f64> {
    reply
        .trim()
        .parse::<f64>()
        .map_err(|_| Error::InvalidResponse(reply.to_string()))
}

/// Parse the leading numeric part of a reply carrying a unit suffix, e.g. `0.5E3V`.
pub(crate) fn parse_with_unit(reply: &str) -> Result<f64> {
    let reply = reply.trim();
    let end = reply
        .find(|c: char| !(c.is_ascii_digit() || matches!(c, '+' | '-' | '.' | 'e' | 'E')))
        .unwrap_or(reply.len());
    // A bare exponent marker before the unit ("5E" + "V") is not part of the number.
    let numeric = reply[..end].trim_end_matches(['e', 'E']);
    parse_number(numeric).map_err(|_| Error::InvalidResponse(reply.to_string()))
}
