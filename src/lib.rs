//! This crate supervises the high-voltage supply modules of a detector cryostat.
//!
//! Two families of HV modules are supported, each with its own serial protocol:
//! * Family A: char-echo framing, every command character is echoed before the next is sent.
//! * Family B: SCPI-like lines addressed with a `(@n)` suffix, echoed once per line.
//!
//! On top of the codecs sit the per-channel ramp/trip state machine, the module
//! occupancy discipline shared by the background poller and operator commands,
//! and two fail-safes: an interlock on an external sensor, and a heartbeat to a
//! separate watchdog process (`hv-watchdog`) that raises an alarm when the
//! supervisor hangs.
//!
//! The serial ports should be configured like so:
//! * Baud rate: 9600 unless the module is configured otherwise
//! * Data bits: 8
//! * Stop bits: 1
//! * Parity: None

pub mod channel;
pub mod codec;
pub mod config;
pub mod error;
pub mod events;
pub mod heartbeat;
pub mod interlock;
pub mod module;
pub mod notify;
pub mod poller;
pub mod register;
pub mod shutdown;
pub mod sim;
pub mod transport;
pub mod watchdog;

#[cfg(test)]
mod mock_serial;
