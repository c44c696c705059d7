//! One-shot initialization run when a device is constructed.
//!
//! The charge curve and battery threshold registers are backed by EEPROM with a
//! limited write budget. [`apply_eeprom_preset`] compares the persisted values
//! with an [`EepromPreset`] and performs at most one commit cycle; it is a
//! convergence check, not a retry loop.

use crate::{
    bitfield::{ChargeCurveConfig, SystemConfig},
    bus::Bus,
    client::Client,
    device::Timing,
    protocol::{self as proto, Scalar},
    Result,
};
use log::{info, warn};
use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Long-term configuration persisted in the device EEPROM.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct EepromPreset {
    /// Float voltage setpoint in V.
    pub float_voltage: f64,
    /// Taper current in A at which the charger changes to float.
    pub taper_current: f64,
    /// Battery low voltage alarm in V.
    pub alarm_voltage: f64,
    /// Battery low voltage shutdown in V.
    pub shutdown_voltage: f64,
    /// Voltage at which charging restarts after shutdown, in V.
    pub recharge_voltage: f64,
}

impl Default for EepromPreset {
    fn default() -> Self {
        Self {
            float_voltage: 54.6,
            taper_current: 7.0,
            alarm_voltage: 50.0,
            shutdown_voltage: 48.0,
            recharge_voltage: 50.0,
        }
    }
}

impl EepromPreset {
    /// The preset as `(name, register, value)` triples in write order.
    pub fn entries(&self) -> [(&'static str, Scalar, f64); 5] {
        [
            ("float voltage", proto::CURVE_FV, self.float_voltage),
            ("taper current", proto::CURVE_TC, self.taper_current),
            ("alarm voltage", proto::BAT_ALARM_VOLTAGE, self.alarm_voltage),
            ("shutdown voltage", proto::BAT_SHUTDOWN_VOLTAGE, self.shutdown_voltage),
            ("recharge voltage", proto::BAT_RECHARGE_VOLTAGE, self.recharge_voltage),
        ]
    }
}

/// A persisted register whose value differs from the preset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PresetMismatch {
    pub name: &'static str,
    pub code: u16,
    pub current: f64,
    /// The value the register will hold after a write of the preset.
    pub desired: f64,
}

impl fmt::Display for PresetMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({:#06x}): {:.2} instead of {:.2}",
            self.name, self.code, self.current, self.desired
        )
    }
}

/// Result of [`apply_eeprom_preset`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EepromOutcome {
    /// All registers already held the preset; nothing was written.
    AlreadySet,
    /// The preset was written and committed once.
    Committed,
}

/// Lists the preset registers that differ from `preset` without writing anything.
///
/// Values are compared in their encoded register form, so a preset value that is
/// not a multiple of the register step still counts as set.
pub fn check_eeprom_preset<B: Bus>(
    client: &mut Client<B>,
    preset: &EepromPreset,
) -> Result<Vec<PresetMismatch>> {
    let mut mismatches = Vec::new();
    for (name, register, value) in preset.entries() {
        let desired = register.encode(value)?;
        let current = proto::value_bytes(register.code, &client.get(register.code)?)?;
        if current != desired {
            mismatches.push(PresetMismatch {
                name,
                code: register.code,
                current: proto::decode_scalar(current, register.factor, register.signed),
                desired: proto::decode_scalar(desired, register.factor, register.signed),
            });
        }
    }
    Ok(mismatches)
}

/// Makes sure the device EEPROM holds `preset`, committing at most once.
///
/// EEPROM pass-through is disabled with immediate save first, so setpoint writes
/// made later in the session stay volatile. If any preset register differs, all
/// five are written and the EEPROM write flag is toggled on and off again.
///
/// Any failed read aborts before an EEPROM commit is attempted.
pub fn apply_eeprom_preset<B: Bus>(
    client: &mut Client<B>,
    preset: &EepromPreset,
    timing: &Timing,
) -> Result<EepromOutcome> {
    let mut config = client.modify::<SystemConfig>(|config| {
        config.eeprom_disabled = true;
        config.eeprom_write_delay = 0;
    })?;

    let mismatches = check_eeprom_preset(client, preset)?;
    if mismatches.is_empty() {
        info!("EEPROM preset already set");
        return Ok(EepromOutcome::AlreadySet);
    }
    for mismatch in &mismatches {
        info!("EEPROM preset differs: {mismatch}");
    }

    for (_, register, value) in preset.entries() {
        client.set(register, value)?;
    }

    config.eeprom_disabled = false;
    client.write_bitfield(&config)?;
    std::thread::sleep(timing.eeprom_settle);
    config.eeprom_disabled = true;
    client.write_bitfield(&config)?;
    std::thread::sleep(timing.eeprom_settle);

    warn!("EEPROM preset committed; repeating this wears out the device EEPROM");
    Ok(EepromOutcome::Committed)
}

/// Selects two-stage charging and derives the initial CC/CV setpoints from `desired_power`.
///
/// Runs after [`apply_eeprom_preset`], so these writes are not persisted.
pub fn prepare_charge_curve<B: Bus>(client: &mut Client<B>, desired_power: f64) -> Result<()> {
    client.modify::<ChargeCurveConfig>(|config| config.two_stage = true)?;
    client.set_curve_cc(desired_power / proto::NOMINAL_CV_VOLTAGE)?;
    client.set_curve_cv(proto::NOMINAL_CV_VOLTAGE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{bitfield::Bitfield, mock_bus::MockBus, protocol::Address, Error};
    use assert_matches::assert_matches;

    fn client() -> Client<MockBus> {
        let mut client = Client::new(MockBus::new(), Address::default());
        client.set_settle(std::time::Duration::ZERO);
        client
    }

    fn commit_cycles(client: &Client<MockBus>) -> usize {
        client
            .bus()
            .writes_to(SystemConfig::CODE)
            .iter()
            .filter(|bytes| !SystemConfig::unpack(bytes[0], bytes[1]).eeprom_disabled)
            .count()
    }

    #[test]
    fn fresh_device_commits_preset() {
        let mut client = client();
        let preset = EepromPreset::default();
        assert_eq!(check_eeprom_preset(&mut client, &preset).unwrap().len(), 5);

        let outcome = apply_eeprom_preset(&mut client, &preset, &Timing::ZERO).unwrap();
        assert_eq!(outcome, EepromOutcome::Committed);
        assert!((client.bus().scalar(proto::CURVE_FV) - 54.6).abs() < 1e-9);
        assert!((client.bus().scalar(proto::CURVE_TC) - 7.0).abs() < 1e-9);
        assert!((client.bus().scalar(proto::BAT_SHUTDOWN_VOLTAGE) - 48.0).abs() < 1e-9);
        assert_eq!(commit_cycles(&client), 1);

        // Pass-through ends disabled with immediate save.
        let config: SystemConfig = client.bus().bitfield();
        assert!(config.eeprom_disabled);
        assert_eq!(config.eeprom_write_delay, 0);
    }

    #[test]
    fn repeated_guard_commits_once() {
        let mut client = client();
        let preset = EepromPreset::default();
        apply_eeprom_preset(&mut client, &preset, &Timing::ZERO).unwrap();
        let outcome = apply_eeprom_preset(&mut client, &preset, &Timing::ZERO).unwrap();
        assert_eq!(outcome, EepromOutcome::AlreadySet);
        assert_eq!(commit_cycles(&client), 1);
    }

    #[test]
    fn matching_device_writes_no_preset() {
        let mut client = client();
        let preset = EepromPreset::default();
        for (_, register, value) in preset.entries() {
            client.bus_mut().set_scalar(register, value);
        }
        let outcome = apply_eeprom_preset(&mut client, &preset, &Timing::ZERO).unwrap();
        assert_eq!(outcome, EepromOutcome::AlreadySet);
        // Only the pass-through disable is written.
        assert_eq!(client.bus().writes().len(), 1);
        assert_eq!(commit_cycles(&client), 0);
    }

    #[test]
    fn single_mismatch_is_reported() {
        let mut client = client();
        let preset = EepromPreset::default();
        for (_, register, value) in preset.entries() {
            client.bus_mut().set_scalar(register, value);
        }
        client.bus_mut().set_scalar(proto::BAT_RECHARGE_VOLTAGE, 52.0);
        let mismatches = check_eeprom_preset(&mut client, &preset).unwrap();
        assert_eq!(mismatches.len(), 1);
        assert_eq!(mismatches[0].code, 0x00BB);
        assert!((mismatches[0].current - 52.0).abs() < 1e-9);
        assert!(client.bus().writes().is_empty());
    }

    #[test]
    fn failed_read_prevents_commit() {
        let mut client = client();
        client.bus_mut().set_silent(proto::BAT_ALARM_VOLTAGE.code, true);
        assert_matches!(
            apply_eeprom_preset(&mut client, &EepromPreset::default(), &Timing::ZERO),
            Err(Error::Timeout { code: 0x00B9 })
        );
        assert_eq!(commit_cycles(&client), 0);
        assert!(client.bus().writes_to(proto::CURVE_FV.code).is_empty());
    }

    #[test]
    fn charge_curve_preparation() {
        let mut client = client();
        prepare_charge_curve(&mut client, 1000.0).unwrap();
        let config: ChargeCurveConfig = client.bus().bitfield();
        assert!(config.two_stage);
        // 1000 W / 56 V = 17.857 A, truncated to the register step.
        assert_eq!(client.bus().writes_to(proto::CURVE_CC.code), vec![1785u16.to_le_bytes()]);
        assert_eq!(client.bus().writes_to(proto::CURVE_CV.code), vec![5600u16.to_le_bytes()]);
    }
}
