//! Synchronous register client for the charger/inverter.
//!
//! [`Client`] frames register requests, transmits them over a [`Bus`] and matches
//! replies. Requests are not sequence numbered: a reply is simply the first frame
//! received after the request, followed by a fixed settle pause before the next
//! transaction. The client therefore requires exactly one outstanding request at
//! a time; share it between threads only behind a lock (see
//! [`crate::safe_device::SafeDevice`]).
//!
//! Writes are not acknowledged by the device, so [`Client::set`] returns as soon
//! as the frame has been handed to the bus.

use crate::{
    bitfield::{
        Bitfield, ChargeCurveConfig, ChargeStatus, FaultStatus, InverterConfig,
        InverterOperation, InverterStatus, SystemConfig, Writable,
    },
    bus::Bus,
    protocol::{self as proto, Address, Frame, Response, Scalar},
    Error, Result,
};
use log::{debug, warn};
use std::fmt;
use std::time::Duration;

/// Default time to wait for a reply.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);
/// Default pause after every read; the device answers with the wrong code without it.
pub const DEFAULT_SETTLE: Duration = Duration::from_millis(100);

/// Upper bound on frames dropped before a request, so a busy bus cannot stall a read.
const MAX_DISCARDED_FRAMES: usize = 64;

/// Synchronous client for one charger/inverter on an exclusively owned bus.
pub struct Client<B: Bus> {
    bus: B,
    address: Address,
    timeout: Duration,
    settle: Duration,
}

impl<B: Bus> Client<B> {
    /// Creates a new client for the device at `address`.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # #[cfg(all(target_os = "linux", feature = "socketcan-bus"))]
    /// # fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// use chinv_lib::{client::Client, protocol::Address, socketcan_bus::SocketCanBus};
    ///
    /// let bus = SocketCanBus::open("can1")?;
    /// let mut client = Client::new(bus, Address::default());
    /// println!("Battery voltage: {:.2} V", client.read_battery_voltage()?);
    /// # Ok(())
    /// # }
    /// # #[cfg(not(all(target_os = "linux", feature = "socketcan-bus")))]
    /// # fn main() {}
    /// ```
    pub fn new(bus: B, address: Address) -> Self {
        Self {
            bus,
            address,
            timeout: DEFAULT_TIMEOUT,
            settle: DEFAULT_SETTLE,
        }
    }

    /// Sets how long [`Client::get`] waits for a reply.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Sets the pause inserted after every read.
    pub fn set_settle(&mut self, settle: Duration) {
        self.settle = settle;
    }

    pub fn settle(&self) -> Duration {
        self.settle
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    /// Releases the bus handle.
    pub fn shutdown(&mut self) -> Result<()> {
        debug!("Releasing bus for device {}", self.address);
        Ok(self.bus.shutdown()?)
    }

    /// Sends a request for register `code` with an optional 2-byte payload.
    ///
    /// A transmit failure is logged and returned; it is never retried.
    pub fn send(&mut self, code: u16, payload: &[u8]) -> Result<()> {
        let frame = Frame::request(self.address, code, payload);
        debug!("TX {:#x} {:02X?}", frame.id, frame.data);
        self.bus.send(&frame).map_err(|err| {
            warn!("Message for register {code:#06x} not sent: {err}");
            Error::from(err)
        })
    }

    /// Waits up to `timeout` for the next frame and splits it into code and payload.
    ///
    /// Returns `Ok(None)` on timeout.
    pub fn receive(&mut self, timeout: Duration) -> Result<Option<Response>> {
        let frame = match self.bus.receive(timeout) {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(None),
            Err(err) => {
                warn!("Message not received: {err}");
                return Err(err.into());
            }
        };
        debug!("RX {:#x} {:02X?}", frame.id, frame.data);
        Response::from_frame(self.address, &frame)
            .map(Some)
            .ok_or(Error::MalformedFrame {
                id: frame.id,
                len: frame.data.len(),
            })
    }

    /// Drops frames already queued on the bus, such as a reply that arrived after its
    /// request timed out. Returns the number of frames dropped.
    pub fn discard_pending(&mut self) -> Result<usize> {
        let mut dropped = 0;
        while dropped < MAX_DISCARDED_FRAMES {
            match self.bus.receive(Duration::ZERO) {
                Ok(Some(frame)) => {
                    warn!("Dropping stale frame {:#x} {:02X?}", frame.id, frame.data);
                    dropped += 1;
                }
                Ok(None) => return Ok(dropped),
                Err(err) => {
                    warn!("Message not received: {err}");
                    return Err(err.into());
                }
            }
        }
        debug!("Stopped discarding after {dropped} frames");
        Ok(dropped)
    }

    /// Reads the raw payload of register `code`.
    ///
    /// Frames queued before the request are dropped first, so the reply is the first
    /// frame received after the request. A reply carrying a different code or a
    /// foreign identifier is logged but its payload is still returned.
    ///
    /// # Errors
    ///
    /// * [`Error::Timeout`] if no frame arrived within the timeout.
    /// * [`Error::Transport`] if the bus failed.
    /// * [`Error::MalformedFrame`] if the reply was too short to carry a code.
    pub fn get(&mut self, code: u16) -> Result<Vec<u8>> {
        self.discard_pending()?;
        self.send(code, &[])?;
        let response = self.receive(self.timeout);
        std::thread::sleep(self.settle);

        let response = response?.ok_or_else(|| {
            warn!("No response for register {code:#06x}");
            Error::Timeout { code }
        })?;
        if response.offset != 0 {
            warn!(
                "Response for register {code:#06x} came from identifier offset {}",
                response.offset
            );
        }
        if response.code != code {
            warn!(
                "Command check failed: requested {code:#06x}, received {:#06x}",
                response.code
            );
        }
        Ok(response.payload)
    }

    /// Clamps `value` into the register's range and writes it.
    ///
    /// If the value cannot be encoded the send is skipped and the register is logged.
    pub fn set(&mut self, register: Scalar, value: f64) -> Result<()> {
        let bytes = register.encode(value).inspect_err(|err| {
            warn!("Invalid entry for register {:#06x}: {err}", register.code);
        })?;
        self.send(register.code, &bytes)
    }

    /// Reads and scales a scalar register.
    pub fn read_scalar(&mut self, register: Scalar) -> Result<f64> {
        let payload = self.get(register.code)?;
        register.decode(&payload)
    }

    /// Reads and decodes a bitfield register.
    pub fn read_bitfield<T: Bitfield>(&mut self) -> Result<T> {
        let payload = self.get(T::CODE)?;
        T::decode(&payload)
    }

    /// Writes a complete bitfield register value.
    pub fn write_bitfield<T: Writable>(&mut self, value: &T) -> Result<()> {
        self.send(T::CODE, &value.pack())
    }

    /// Read-modify-write of a configuration register.
    ///
    /// The register is read, `update` applies its overrides to the decoded value and
    /// the merged value is written back, so fields `update` does not touch keep their
    /// current value. Nothing is written if the read fails.
    pub fn modify<T: Writable>(&mut self, update: impl FnOnce(&mut T)) -> Result<T> {
        let mut value = self.read_bitfield::<T>()?;
        update(&mut value);
        self.write_bitfield(&value)?;
        Ok(value)
    }

    fn read_pair(&mut self, hi: Scalar, lo: Scalar) -> Result<f64> {
        let hi_bytes = proto::value_bytes(hi.code, &self.get(hi.code)?)?;
        let lo_bytes = proto::value_bytes(lo.code, &self.get(lo.code)?)?;
        Ok(proto::decode_pair(hi_bytes, lo_bytes, hi.factor))
    }

    /// AC input voltage in V.
    pub fn read_input_voltage(&mut self) -> Result<f64> {
        self.read_scalar(proto::AC_INPUT_VOLTAGE)
    }

    /// AC input current in A.
    pub fn read_input_current(&mut self) -> Result<f64> {
        self.read_scalar(proto::AC_INPUT_CURRENT)
    }

    /// AC input frequency in Hz.
    pub fn read_input_frequency(&mut self) -> Result<f64> {
        self.read_scalar(proto::AC_INPUT_FREQUENCY)
    }

    /// AC output voltage in V.
    pub fn read_output_voltage(&mut self) -> Result<f64> {
        self.read_scalar(proto::AC_OUTPUT_VOLTAGE)
    }

    /// AC output current in A.
    pub fn read_output_current(&mut self) -> Result<f64> {
        self.read_scalar(proto::AC_OUTPUT_CURRENT)
    }

    /// AC output frequency in Hz.
    pub fn read_output_frequency(&mut self) -> Result<f64> {
        self.read_scalar(proto::AC_OUTPUT_FREQUENCY)
    }

    /// AC output load in percent of rated power.
    pub fn read_output_load(&mut self) -> Result<f64> {
        self.read_scalar(proto::AC_OUTPUT_LOAD_PERCENT)
    }

    /// AC output real power in W.
    pub fn read_output_power(&mut self) -> Result<f64> {
        self.read_pair(proto::AC_OUTPUT_WATT_HI, proto::AC_OUTPUT_WATT_LO)
    }

    /// AC output apparent power in VA.
    pub fn read_output_apparent_power(&mut self) -> Result<f64> {
        self.read_pair(proto::AC_OUTPUT_VA_HI, proto::AC_OUTPUT_VA_LO)
    }

    /// Battery voltage in V.
    pub fn read_battery_voltage(&mut self) -> Result<f64> {
        self.read_scalar(proto::BATTERY_VOLTAGE)
    }

    /// Battery current in A, positive while charging.
    pub fn read_battery_current(&mut self) -> Result<f64> {
        self.read_scalar(proto::BATTERY_CURRENT)
    }

    /// Internal temperature in °C.
    pub fn read_temperature(&mut self) -> Result<f64> {
        self.read_scalar(proto::INTERNAL_TEMPERATURE)
    }

    pub fn read_curve_cc(&mut self) -> Result<f64> {
        self.read_scalar(proto::CURVE_CC)
    }

    /// Sets the constant current setpoint (14-70 A).
    pub fn set_curve_cc(&mut self, amps: f64) -> Result<()> {
        self.set(proto::CURVE_CC, amps)
    }

    pub fn read_curve_cv(&mut self) -> Result<f64> {
        self.read_scalar(proto::CURVE_CV)
    }

    /// Sets the constant voltage setpoint (48-56 V).
    pub fn set_curve_cv(&mut self, volts: f64) -> Result<()> {
        self.set(proto::CURVE_CV, volts)
    }

    pub fn read_curve_fv(&mut self) -> Result<f64> {
        self.read_scalar(proto::CURVE_FV)
    }

    /// Sets the float voltage setpoint (40-60 V).
    pub fn set_curve_fv(&mut self, volts: f64) -> Result<()> {
        self.set(proto::CURVE_FV, volts)
    }

    pub fn read_curve_tc(&mut self) -> Result<f64> {
        self.read_scalar(proto::CURVE_TC)
    }

    /// Sets the float crossover (taper) current (1.4-21 A).
    pub fn set_curve_tc(&mut self, amps: f64) -> Result<()> {
        self.set(proto::CURVE_TC, amps)
    }

    /// Charge stage timeouts in minutes as `(cc, cv, fv)`.
    pub fn read_curve_timeouts(&mut self) -> Result<(f64, f64, f64)> {
        Ok((
            self.read_scalar(proto::CURVE_CC_TIMEOUT)?,
            self.read_scalar(proto::CURVE_CV_TIMEOUT)?,
            self.read_scalar(proto::CURVE_FV_TIMEOUT)?,
        ))
    }

    pub fn read_battery_alarm_voltage(&mut self) -> Result<f64> {
        self.read_scalar(proto::BAT_ALARM_VOLTAGE)
    }

    pub fn set_battery_alarm_voltage(&mut self, volts: f64) -> Result<()> {
        self.set(proto::BAT_ALARM_VOLTAGE, volts)
    }

    pub fn read_battery_shutdown_voltage(&mut self) -> Result<f64> {
        self.read_scalar(proto::BAT_SHUTDOWN_VOLTAGE)
    }

    pub fn set_battery_shutdown_voltage(&mut self, volts: f64) -> Result<()> {
        self.set(proto::BAT_SHUTDOWN_VOLTAGE, volts)
    }

    pub fn read_battery_recharge_voltage(&mut self) -> Result<f64> {
        self.read_scalar(proto::BAT_RECHARGE_VOLTAGE)
    }

    pub fn set_battery_recharge_voltage(&mut self, volts: f64) -> Result<()> {
        self.set(proto::BAT_RECHARGE_VOLTAGE, volts)
    }

    pub fn read_charge_curve_config(&mut self) -> Result<ChargeCurveConfig> {
        self.read_bitfield()
    }

    pub fn read_system_config(&mut self) -> Result<SystemConfig> {
        self.read_bitfield()
    }

    pub fn read_inverter_operation(&mut self) -> Result<InverterOperation> {
        self.read_bitfield()
    }

    pub fn read_inverter_config(&mut self) -> Result<InverterConfig> {
        self.read_bitfield()
    }

    pub fn read_charge_status(&mut self) -> Result<ChargeStatus> {
        self.read_bitfield()
    }

    pub fn read_inverter_status(&mut self) -> Result<InverterStatus> {
        self.read_bitfield()
    }

    pub fn read_fault_status(&mut self) -> Result<FaultStatus> {
        self.read_bitfield()
    }

    /// Reads all telemetry registers.
    pub fn read_measurements(&mut self) -> Result<Measurements> {
        Ok(Measurements {
            input_voltage: self.read_input_voltage()?,
            input_current: self.read_input_current()?,
            input_frequency: self.read_input_frequency()?,
            output_voltage: self.read_output_voltage()?,
            output_current: self.read_output_current()?,
            output_frequency: self.read_output_frequency()?,
            output_load: self.read_output_load()?,
            output_power: self.read_output_power()?,
            output_apparent_power: self.read_output_apparent_power()?,
            battery_voltage: self.read_battery_voltage()?,
            battery_current: self.read_battery_current()?,
            temperature: self.read_temperature()?,
        })
    }

    /// Reads all charge curve and battery threshold settings.
    pub fn read_charge_curve(&mut self) -> Result<ChargeCurve> {
        let (cc_timeout, cv_timeout, fv_timeout) = self.read_curve_timeouts()?;
        Ok(ChargeCurve {
            constant_current: self.read_curve_cc()?,
            constant_voltage: self.read_curve_cv()?,
            float_voltage: self.read_curve_fv()?,
            taper_current: self.read_curve_tc()?,
            cc_timeout,
            cv_timeout,
            fv_timeout,
            alarm_voltage: self.read_battery_alarm_voltage()?,
            shutdown_voltage: self.read_battery_shutdown_voltage()?,
            recharge_voltage: self.read_battery_recharge_voltage()?,
        })
    }
}

/// Snapshot of all telemetry registers.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Measurements {
    pub input_voltage: f64,
    pub input_current: f64,
    pub input_frequency: f64,
    pub output_voltage: f64,
    pub output_current: f64,
    pub output_frequency: f64,
    pub output_load: f64,
    pub output_power: f64,
    pub output_apparent_power: f64,
    pub battery_voltage: f64,
    pub battery_current: f64,
    pub temperature: f64,
}

impl fmt::Display for Measurements {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "AC input:  {:.1} V, {:.1} A, {:.2} Hz",
            self.input_voltage, self.input_current, self.input_frequency
        )?;
        writeln!(
            f,
            "AC output: {:.1} V, {:.1} A, {:.2} Hz, {:.0} % load, {:.1} W, {:.1} VA",
            self.output_voltage,
            self.output_current,
            self.output_frequency,
            self.output_load,
            self.output_power,
            self.output_apparent_power
        )?;
        writeln!(
            f,
            "Battery:   {:.2} V, {:.2} A, {:.1} W",
            self.battery_voltage,
            self.battery_current,
            self.battery_voltage * self.battery_current
        )?;
        write!(f, "Internal temperature: {:.1} °C", self.temperature)
    }
}

/// Charge curve and battery threshold settings.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ChargeCurve {
    pub constant_current: f64,
    pub constant_voltage: f64,
    pub float_voltage: f64,
    pub taper_current: f64,
    /// Minutes.
    pub cc_timeout: f64,
    /// Minutes.
    pub cv_timeout: f64,
    /// Minutes.
    pub fv_timeout: f64,
    pub alarm_voltage: f64,
    pub shutdown_voltage: f64,
    pub recharge_voltage: f64,
}

impl fmt::Display for ChargeCurve {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "CC {:.2} A, CV {:.2} V, FV {:.2} V, taper {:.2} A",
            self.constant_current, self.constant_voltage, self.float_voltage, self.taper_current
        )?;
        writeln!(
            f,
            "Timeouts (min): CC {}, CV {}, FV {}",
            self.cc_timeout, self.cv_timeout, self.fv_timeout
        )?;
        write!(
            f,
            "Battery: alarm {:.2} V, shutdown {:.2} V, recharge {:.2} V",
            self.alarm_voltage, self.shutdown_voltage, self.recharge_voltage
        )
    }
}
