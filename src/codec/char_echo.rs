//! Family A codec: char-echo framing.
//!
//! Every command is terminated with CR-LF and sent one character at a time; the
//! device echoes each character before the next may be sent. The reply line that
//! follows the echo is terminated by CR. Replies starting with `?` are device errors.
//!
//! Currents travel as mantissa and exponent, `12345-09` => `12345 × 10^-9` A.

use embedded_io::{Read, Write};
use tracing::{debug, trace};

use super::{
    DeviceInfo, HvCodec, StatusReport, discard_pending, parse_number, parse_with_unit, read_byte,
    read_line,
};
use crate::{
    error::{Error, Result},
    register::{ChannelStatus, Family, ModuleStatusByte, Polarity, StatusToken},
};

/// `A<ch>` reply bit meaning auto-start is enabled.
const AUTO_START_BIT: u32 = 8;

/// You can create a family A codec using any interface which implements
/// [embedded_io::Read] & [embedded_io::Write].
pub struct CharEchoCodec<S: Read + Write> {
    interface: S,
}

impl<S: Read + Write> CharEchoCodec<S> {
    pub fn new(interface: S) -> Self {
        Self { interface }
    }

    /// Wire address of a zero-based channel index.
    fn address(channel: u8) -> Result<u8> {
        channel.checked_add(1).ok_or(Error::InvalidChannel(channel))
    }

    /// Send one command character by character and return the reply line.
    pub fn exchange(&mut self, command: &str) -> Result<String> {
        trace!(command, "family A exchange");
        for &byte in command.as_bytes().iter().chain(b"\r\n") {
            self.interface.write_all(&[byte]).map_err(Error::serial)?;
            self.interface.flush().map_err(Error::serial)?;
            let echoed = read_byte(&mut self.interface)?;
            if echoed != byte {
                return Err(Error::EchoMismatch {
                    sent: (byte as char).to_string(),
                    received: (echoed as char).to_string(),
                });
            }
        }

        let reply = read_line(&mut self.interface, b'\r')?;
        if reply.starts_with('?') {
            debug!(command, reply = %reply, "family A device error");
            return Err(Error::DeviceRejected(reply));
        }
        Ok(reply)
    }

    /// Exchange a write command, which the device answers with an empty line.
    fn write_command(&mut self, command: &str) -> Result<()> {
        let reply = self.exchange(command)?;
        if reply.trim().is_empty() {
            Ok(())
        } else {
            Err(Error::InvalidResponse(reply))
        }
    }

    fn query_number(&mut self, command: &str) -> Result<f64> {
        let reply = self.exchange(command)?;
        parse_number(&reply)
    }

    fn query_mantissa_exponent(&mut self, command: &str) -> Result<f64> {
        let reply = self.exchange(command)?;
        parse_mantissa_exponent(&reply)
    }

    /// Exchange a command answered by `S<ch>=<token>`.
    fn query_token(&mut self, command: &str, address: u8) -> Result<StatusToken> {
        let reply = self.exchange(command)?;
        let prefix = format!("S{address}=");
        reply
            .strip_prefix(&prefix)
            .and_then(|token| token.trim().parse::<StatusToken>().ok())
            .ok_or(Error::InvalidResponse(reply))
    }

    /// Read the module status byte.
    pub fn get_module_status(&mut self, channel: u8) -> Result<ModuleStatusByte> {
        let address = Self::address(channel)?;
        let reply = self.exchange(&format!("T{address}"))?;
        let raw: u8 = reply
            .trim()
            .parse()
            .map_err(|_| Error::InvalidResponse(reply.clone()))?;
        Ok(ModuleStatusByte::from(raw))
    }
}

impl<S: Read + Write + Send> HvCodec for CharEchoCodec<S> {
    fn family(&self) -> Family {
        Family::FamilyA
    }

    fn identify(&mut self) -> Result<DeviceInfo> {
        let reply = self.exchange("#")?;
        let fields: Vec<&str> = reply.split(';').map(str::trim).collect();
        let [serial, firmware, voltage, current] = fields.as_slice() else {
            return Err(Error::InvalidResponse(reply.clone()));
        };
        Ok(DeviceInfo {
            model: String::new(),
            serial_number: serial.to_string(),
            firmware: firmware.to_string(),
            voltage_rating: Some(parse_with_unit(voltage)?),
            current_rating: Some(parse_current_rating(current)?),
        })
    }

    fn read_voltage(&mut self, channel: u8) -> Result<f64> {
        let address = Self::address(channel)?;
        self.query_number(&format!("U{address}"))
    }

    fn read_current(&mut self, channel: u8) -> Result<f64> {
        let address = Self::address(channel)?;
        self.query_mantissa_exponent(&format!("I{address}"))
    }

    fn get_voltage_limit(&mut self, channel: u8) -> Result<f64> {
        let address = Self::address(channel)?;
        self.query_number(&format!("M{address}"))
    }

    fn get_current_limit(&mut self, channel: u8) -> Result<f64> {
        let address = Self::address(channel)?;
        self.query_mantissa_exponent(&format!("N{address}"))
    }

    fn get_set_voltage(&mut self, channel: u8) -> Result<f64> {
        let address = Self::address(channel)?;
        self.query_number(&format!("D{address}"))
    }

    /// Family A takes the set-point as a magnitude; polarity is a hardware switch.
    fn set_voltage(&mut self, channel: u8, volts: f64) -> Result<()> {
        let address = Self::address(channel)?;
        self.write_command(&format!("D{address}={:.0}", volts.abs()))
    }

    fn get_ramp_rate(&mut self, channel: u8) -> Result<f64> {
        let address = Self::address(channel)?;
        self.query_number(&format!("V{address}"))
    }

    fn set_ramp_rate(&mut self, channel: u8, volts_per_second: f64) -> Result<()> {
        let address = Self::address(channel)?;
        self.write_command(&format!("V{address}={:.0}", volts_per_second.abs()))
    }

    fn get_trip_current(&mut self, channel: u8) -> Result<f64> {
        let address = Self::address(channel)?;
        self.query_mantissa_exponent(&format!("L{address}"))
    }

    /// Reads `S<ch>` then `T<ch>`. Reading `S<ch>` acknowledges a pending trip.
    fn read_status(&mut self, channel: u8) -> Result<StatusReport> {
        let address = Self::address(channel)?;
        let token = self.query_token(&format!("S{address}"), address)?;
        let bits = self.get_module_status(channel)?;
        let reported = token.channel_status();
        Ok(StatusReport {
            reported,
            hv_on: !bits.hv_switch_off(),
            ramping: reported.is_some_and(ChannelStatus::is_ramping),
            polarity: if bits.positive() {
                Polarity::Positive
            } else {
                Polarity::Negative
            },
            tripped: token == StatusToken::Trip,
            inhibit: bits.inhibit() || token == StatusToken::Inhibit,
            emergency_off: false,
            manual: bits.manual() || token == StatusToken::Manual,
            error: bits.error() || token == StatusToken::Error,
        })
    }

    fn get_auto_start(&mut self, channel: u8) -> Result<Option<bool>> {
        let address = Self::address(channel)?;
        let reply = self.exchange(&format!("A{address}"))?;
        let raw: u32 = reply
            .trim()
            .parse()
            .map_err(|_| Error::InvalidResponse(reply.clone()))?;
        Ok(Some(raw & AUTO_START_BIT != 0))
    }

    /// `G<ch>`: the device compares set-point and output and replies with the new status.
    fn start_ramp(&mut self, channel: u8) -> Result<Option<ChannelStatus>> {
        let address = Self::address(channel)?;
        let token = self.query_token(&format!("G{address}"), address)?;
        Ok(token.channel_status())
    }

    /// There is no remote HV enable on family A: "off" ramps to a zero set-point
    /// and "on" ramps to whatever set-point is loaded.
    fn set_hv(&mut self, channel: u8, on: bool) -> Result<()> {
        if !on {
            self.set_voltage(channel, 0.0)?;
        }
        self.start_ramp(channel)?;
        Ok(())
    }

    fn emergency_off(&mut self, _channel: u8) -> Result<()> {
        Err(Error::Unsupported {
            family: Family::FamilyA,
            operation: "emergency off",
        })
    }

    /// A status read is the trip acknowledgement on family A.
    fn clear_events(&mut self, channel: u8) -> Result<()> {
        let address = Self::address(channel)?;
        self.query_token(&format!("S{address}"), address)?;
        Ok(())
    }

    fn set_polarity(&mut self, _channel: u8, _polarity: Polarity) -> Result<()> {
        Err(Error::Unsupported {
            family: Family::FamilyA,
            operation: "polarity change",
        })
    }

    fn discard_input(&mut self) -> usize {
        discard_pending(&mut self.interface)
    }
}

/// Parse a `mantissa-exponent` reply. Plain numbers are accepted as-is.
pub fn parse_mantissa_exponent(reply: &str) -> Result<f64> {
    let reply = reply.trim();
    let split = reply.get(1..).and_then(|rest| rest.rfind('-')).map(|i| i + 1);
    let Some(position) = split else {
        return parse_number(reply);
    };
    let mantissa = parse_number(&reply[..position])?;
    let exponent: i32 = reply[position + 1..]
        .parse()
        .map_err(|_| Error::InvalidResponse(reply.to_string()))?;
    Ok(mantissa * 10f64.powi(-exponent))
}

/// Encode a current as a four digit mantissa and an exponent.
pub fn format_mantissa_exponent(value: f64) -> String {
    let value = value.abs();
    if value == 0.0 {
        return "0000-00".to_string();
    }
    let mut exponent = 3 - value.log10().floor() as i32;
    if exponent < 0 {
        return format!("{:04}-00", value.round() as u64);
    }
    let mut mantissa = (value * 10f64.powi(exponent)).round();
    if mantissa >= 10_000.0 {
        mantissa = (mantissa / 10.0).round();
        exponent -= 1;
    }
    format!("{:04}-{:02}", mantissa as u64, exponent)
}

/// Parse an identity current rating such as `3mA`.
fn parse_current_rating(text: &str) -> Result<f64> {
    let value = parse_with_unit(text)?;
    let scale = if text.ends_with("mA") {
        1e-3
    } else if text.ends_with("uA") {
        1e-6
    } else {
        1.0
    };
    Ok(value * scale)
}
