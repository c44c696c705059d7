//! A charger/inverter under closed-loop control.
//!
//! [`Device`] owns the protocol client and the controller state: the last
//! requested [`Mode`], the desired battery power and the latest status snapshots.
//! An external loop calls [`Device::update`] at about 1 Hz; each tick reads the
//! battery, runs the power regulator while charging and refreshes the [`Report`].
//!
//! ```no_run
//! # #[cfg(all(target_os = "linux", feature = "socketcan-bus"))]
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use chinv_lib::{
//!     device::{Device, DeviceConfig},
//!     protocol::Mode,
//!     socketcan_bus::SocketCanBus,
//! };
//!
//! let bus = SocketCanBus::open("can1")?;
//! let mut device = Device::new(bus, DeviceConfig::default())?;
//! device.set_desired_power(1500.0);
//! device.request_mode(Mode::Charge)?;
//! for _ in 0..60 {
//!     device.update();
//!     println!("{}", device.report());
//!     std::thread::sleep(std::time::Duration::from_secs(1));
//! }
//! device.shutdown()?;
//! # Ok(())
//! # }
//! # #[cfg(not(all(target_os = "linux", feature = "socketcan-bus")))]
//! # fn main() {}
//! ```

use crate::{
    bitfield::{Bitfield, ChargeStatus, FaultStatus, InverterStatus},
    bus::Bus,
    client::Client,
    protocol::{Address, Mode, DEFAULT_DESIRED_POWER},
    regulator::{self, Correction},
    sequencer,
    startup::{self, EepromPreset},
    Result,
};
use log::{debug, info, warn};
use std::fmt;
use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Delays used by the protocol client, the startup guard and the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct Timing {
    /// How long a read waits for the reply.
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde"))]
    pub response_timeout: Duration,
    /// Pause after every read before the next transaction.
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde"))]
    pub read_settle: Duration,
    /// Pause between the two steps of a mode transition.
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde"))]
    pub mode_settle: Duration,
    /// Pause after each EEPROM write flag toggle.
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde"))]
    pub eeprom_settle: Duration,
    /// Minimum time between two charge curve corrections.
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde"))]
    pub setpoint_cooldown: Duration,
}

impl Timing {
    /// No waiting at all, for simulated buses.
    pub const ZERO: Self = Self {
        response_timeout: Duration::ZERO,
        read_settle: Duration::ZERO,
        mode_settle: Duration::ZERO,
        eeprom_settle: Duration::ZERO,
        setpoint_cooldown: Duration::ZERO,
    };
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(1),
            read_settle: Duration::from_millis(100),
            mode_settle: Duration::from_millis(200),
            eeprom_settle: Duration::from_millis(100),
            setpoint_cooldown: Duration::from_secs(5),
        }
    }
}

/// Everything needed to bring up one device.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct DeviceConfig {
    pub address: Address,
    pub timing: Timing,
    pub preset: EepromPreset,
    /// Desired charge power in W until the operator sets another.
    pub desired_power: f64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            address: Address::default(),
            timing: Timing::default(),
            preset: EepromPreset::default(),
            desired_power: DEFAULT_DESIRED_POWER,
        }
    }
}

/// Last computed telemetry for external consumption.
///
/// Values that could not be read keep their previous value; `None` means the value
/// was never read successfully.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct Report {
    pub mode: Mode,
    pub battery_voltage: Option<f64>,
    pub battery_current: Option<f64>,
    pub battery_power: Option<f64>,
    /// Commanded power; `0` unless charging.
    pub desired_power: f64,
    /// Relative power error; `0` unless charging.
    pub error: f64,
    /// Correction made in the last tick.
    #[cfg_attr(feature = "serde", serde(skip))]
    pub correction: Option<Correction>,
    pub charge_status: Option<ChargeStatus>,
    pub inverter_status: Option<InverterStatus>,
    pub fault_status: Option<FaultStatus>,
}

impl Report {
    /// The report as a flat list of named numbers.
    pub fn entries(&self) -> Vec<(String, f64)> {
        let mut entries = vec![("mode".to_string(), self.mode as u8 as f64)];
        let values = [
            ("vbat", self.battery_voltage),
            ("ibat", self.battery_current),
            ("pbat", self.battery_power),
        ];
        entries.extend(
            values
                .into_iter()
                .filter_map(|(name, value)| Some((name.to_string(), value?))),
        );
        entries.push(("desired".to_string(), self.desired_power));
        entries.push(("error".to_string(), self.error));

        let mut status = Vec::new();
        if let Some(charge) = &self.charge_status {
            status.extend(charge.fields());
        }
        if let Some(inverter) = &self.inverter_status {
            status.extend(inverter.fields());
        }
        if let Some(faults) = &self.fault_status {
            status.extend(faults.fields());
        }
        entries.extend(
            status
                .into_iter()
                .map(|(name, value)| (name.to_string(), value as f64)),
        );
        entries
    }
}

fn fmt_value(value: Option<f64>, unit: &str) -> String {
    value.map_or_else(|| "-".to_string(), |value| format!("{value:.2} {unit}"))
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {}, {}, {}",
            self.mode,
            fmt_value(self.battery_voltage, "V"),
            fmt_value(self.battery_current, "A"),
            fmt_value(self.battery_power, "W"),
        )?;
        if self.mode == Mode::Charge {
            write!(
                f,
                ", target {:.0} W, error {:+.1} %",
                self.desired_power,
                self.error * 100.0
            )?;
        }
        if let Some(status) = &self.charge_status {
            let regime = if status.full {
                "full"
            } else if status.constant_voltage {
                "CV"
            } else if status.constant_current {
                "CC"
            } else if status.float_voltage {
                "float"
            } else {
                "idle"
            };
            write!(f, ", charger {regime}")?;
        }
        if self.fault_status.is_some_and(|faults| faults.any()) {
            write!(f, ", FAULT")?;
        }
        Ok(())
    }
}

/// Logs a failed read and turns it into `None`.
fn absorb<T>(what: &str, result: Result<T>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(err) if err.is_transient() => {
            warn!("Reading {what} failed, keeping last value: {err}");
            None
        }
        Err(err) => {
            warn!("Invalid {what} reply, keeping last value: {err}");
            None
        }
    }
}

/// A charger/inverter with its controller state.
///
/// All methods take `&mut self`: a device has exactly one outstanding request at a
/// time. Use [`crate::safe_device::SafeDevice`] to share it between threads.
pub struct Device<B: Bus> {
    client: Client<B>,
    timing: Timing,
    mode: Mode,
    desired_power: f64,
    report: Report,
}

impl<B: Bus> Device<B> {
    /// Brings up the device on `bus`.
    ///
    /// Runs the EEPROM startup guard, prepares the charge curve for
    /// `config.desired_power` and switches the device off.
    ///
    /// # Errors
    ///
    /// Fails if any of these steps fails; no EEPROM commit is made after a failed read.
    pub fn new(bus: B, config: DeviceConfig) -> Result<Self> {
        let mut client = Client::new(bus, config.address);
        client.set_timeout(config.timing.response_timeout);
        client.set_settle(config.timing.read_settle);

        let outcome = startup::apply_eeprom_preset(&mut client, &config.preset, &config.timing)?;
        info!("Startup guard for device {}: {outcome:?}", config.address);
        startup::prepare_charge_curve(&mut client, config.desired_power)?;
        sequencer::transition(&mut client, Mode::Off, &config.timing)?;

        Ok(Self {
            client,
            timing: config.timing,
            mode: Mode::Off,
            desired_power: config.desired_power,
            report: Report::default(),
        })
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn desired_power(&self) -> f64 {
        self.desired_power
    }

    /// Sets the battery power in W the regulator steers towards while charging.
    pub fn set_desired_power(&mut self, watts: f64) {
        if !watts.is_finite() {
            warn!("Ignoring desired power {watts}");
            return;
        }
        debug!("Desired power set to {watts} W");
        self.desired_power = watts;
    }

    /// Runs the mode sequencer; the stored mode only changes if every step succeeded.
    pub fn request_mode(&mut self, mode: Mode) -> Result<()> {
        sequencer::transition(&mut self.client, mode, &self.timing)?;
        self.mode = mode;
        self.report.mode = mode;
        Ok(())
    }

    /// The report computed by the last [`Device::update`].
    pub fn report(&self) -> &Report {
        &self.report
    }

    pub fn client(&self) -> &Client<B> {
        &self.client
    }

    /// Direct register access. Writes made here bypass the controller state.
    pub fn client_mut(&mut self) -> &mut Client<B> {
        &mut self.client
    }

    /// Runs one control tick.
    ///
    /// Never fails: a failed read keeps the previous report value, and the regulator
    /// only acts on a tick where battery voltage, current and charge status were all
    /// read successfully. After a setpoint write the call blocks for the setpoint
    /// cooldown.
    pub fn update(&mut self) {
        let voltage = absorb("battery voltage", self.client.read_battery_voltage());
        let current = absorb("battery current", self.client.read_battery_current());
        let charge_status = absorb("charge status", self.client.read_charge_status());
        let inverter_status = absorb("inverter status", self.client.read_inverter_status());
        let fault_status = absorb("fault status", self.client.read_fault_status());

        let report = &mut self.report;
        report.mode = self.mode;
        report.correction = None;
        if voltage.is_some() {
            report.battery_voltage = voltage;
        }
        if current.is_some() {
            report.battery_current = current;
        }
        if let (Some(voltage), Some(current)) = (report.battery_voltage, report.battery_current) {
            report.battery_power = Some(voltage * current);
        }
        if charge_status.is_some() {
            report.charge_status = charge_status;
        }
        if inverter_status.is_some() {
            report.inverter_status = inverter_status;
        }
        if let Some(faults) = fault_status {
            if faults.any() && report.fault_status != Some(faults) {
                warn!("Device {} reports faults: {faults:?}", self.client.address());
            }
            report.fault_status = Some(faults);
        }

        if self.mode != Mode::Charge {
            report.desired_power = 0.0;
            report.error = 0.0;
            return;
        }
        report.desired_power = self.desired_power;
        if let Some(power) = report.battery_power {
            report.error = regulator::power_error(self.desired_power, power);
        }

        let (Some(voltage), Some(current), Some(status)) = (voltage, current, charge_status)
        else {
            debug!("Skipping regulation without a fresh sample");
            return;
        };
        let correction = regulator::plan(self.desired_power, voltage, current, &status);
        report.correction = Some(correction);
        let written = match correction {
            Correction::None => return,
            Correction::Voltage(volts) => self.client.set_curve_cv(volts),
            Correction::Current(amps) => self.client.set_curve_cc(amps),
        };
        match written {
            Ok(()) => info!("Charge curve correction: {correction}"),
            Err(err) => warn!("Charge curve correction {correction} not written: {err}"),
        }
        std::thread::sleep(self.timing.setpoint_cooldown);
    }

    /// Switches the device off and releases the bus.
    ///
    /// The bus is released even if the OFF transition fails; the first error is returned.
    pub fn shutdown(mut self) -> Result<()> {
        let off = self.request_mode(Mode::Off);
        if let Err(err) = &off {
            warn!("Could not switch device {} off: {err}", self.client.address());
        }
        let released = self.client.shutdown();
        off.and(released)
    }
}

impl<B: Bus> fmt::Debug for Device<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("address", &self.client.address())
            .field("mode", &self.mode)
            .field("desired_power", &self.desired_power)
            .finish()
    }
}
