//! A library for commanding and regulating a bidirectional charger/inverter over CAN.
//!
//! The device speaks a request/response register protocol: every request carries a
//! 16-bit register code and an optional 2-byte value, every reply echoes the code
//! followed by the register's current value. On top of that this crate offers:
//!
//! 1.  **Low-Level Register Access**: [`client::Client`] frames requests over any
//!     [`bus::Bus`] and provides typed accessors for all telemetry, charge curve and
//!     status registers. See [`protocol`] and [`bitfield`] for the register codec.
//!
//! 2.  **Closed-Loop Control**: [`device::Device`] runs the EEPROM startup guard at
//!     construction, sequences mode transitions ([`sequencer`]) and, on every
//!     [`device::Device::update`] tick, steers the charge curve so that the battery
//!     power tracks a desired value ([`regulator`]).
//!
//! ## Features
//!
//! - **Strongly-Typed Registers**: bitfield registers are small structs with explicit
//!   pack/unpack, scalar registers carry their scale and write limits.
//! - **Typed Errors**: every protocol operation returns [`Result`]; the controller
//!   absorbs failures per tick instead of aborting.
//! - **SocketCAN Transport** (feature `socketcan-bus`, Linux only).
//! - **Thread-Safe Device** (feature `safe-client`): [`safe_device::SafeDevice`].
//! - **Serde Support** (feature `serde`) for configuration and reports.
//!
//! ## Quick Start
//!
//! ```no_run
//! # #[cfg(all(target_os = "linux", feature = "socketcan-bus"))]
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use chinv_lib::{client::Client, protocol::Address, socketcan_bus::SocketCanBus};
//!
//! let bus = SocketCanBus::open("can1")?;
//! let mut client = Client::new(bus, Address::default());
//!
//! let measurements = client.read_measurements()?;
//! println!("{}", measurements);
//! # Ok(())
//! # }
//! # #[cfg(not(all(target_os = "linux", feature = "socketcan-bus")))]
//! # fn main() {}
//! ```

pub mod bitfield;
pub mod bus;
pub mod client;
pub mod device;
mod error;
pub mod protocol;
pub mod regulator;
pub mod sequencer;
pub mod startup;

pub use error::{Error, Result};

#[cfg_attr(
    docsrs,
    doc(cfg(all(target_os = "linux", feature = "socketcan-bus")))
)]
#[cfg(all(target_os = "linux", feature = "socketcan-bus"))]
pub mod socketcan_bus;

#[cfg_attr(docsrs, doc(cfg(feature = "safe-client")))]
#[cfg(feature = "safe-client")]
pub mod safe_device;

#[cfg(test)]
mod mock_bus;
