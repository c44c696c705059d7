//! Bitfield registers.
//!
//! Each register is a two-byte value (`lo`, `hi`) subdivided into named flags and
//! narrow integers at fixed bit offsets. Every register type implements [`Bitfield`]
//! with an explicit unpack/pack pair. Registers that may be written additionally
//! implement [`Writable`]; writes always go through a read-modify-write so that
//! fields the caller does not touch keep their current value.

use crate::{protocol::value_bytes, Result};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Reads a single bit from a byte.
macro_rules! read_bit {
    ($byte:expr, $position:expr) => {
        ($byte >> $position) & 1 != 0
    };
}

/// Reads a masked field from a byte.
macro_rules! read_bits {
    ($byte:expr, $mask:expr, $shift:expr) => {
        ($byte & $mask) >> $shift
    };
}

/// A register whose value is a set of named fields.
pub trait Bitfield: Sized + Copy + std::fmt::Debug {
    /// Register code.
    const CODE: u16;

    fn unpack(lo: u8, hi: u8) -> Self;

    fn pack(&self) -> [u8; 2];

    /// Every named field with its numeric value, in register order.
    fn fields(&self) -> Vec<(&'static str, u8)>;

    /// Decodes a response payload.
    fn decode(payload: &[u8]) -> Result<Self> {
        let [lo, hi] = value_bytes(Self::CODE, payload)?;
        Ok(Self::unpack(lo, hi))
    }
}

/// Marker for configuration registers the device accepts writes to.
pub trait Writable: Bitfield {}

/// Decodes all named fields of `T` from a register value.
pub fn decode_bitfield<T: Bitfield>(bytes: [u8; 2]) -> T {
    T::unpack(bytes[0], bytes[1])
}

/// Packs all named fields of `value` into a register value.
pub fn encode_bitfield<T: Bitfield>(value: &T) -> [u8; 2] {
    value.pack()
}

/// Charge curve configuration (`0x00B4`).
///
/// ```text
/// HI  [  0  |  0  |  0  |  0  |  0  |FVTOE|CVTOE|CCTOE]
/// LO  [  0  | STGS|  0  |  0  |    TCS    |    CUVS   ]
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ChargeCurveConfig {
    /// Charge curve preset (CUVS, 0-3).
    pub curve_preset: u8,
    /// Temperature compensation setting (TCS, 0-3).
    pub temperature_compensation: u8,
    /// Two stage instead of three stage charging (STGS).
    pub two_stage: bool,
    pub cc_timeout_enable: bool,
    pub cv_timeout_enable: bool,
    pub fv_timeout_enable: bool,
}

impl Bitfield for ChargeCurveConfig {
    const CODE: u16 = 0x00B4;

    fn unpack(lo: u8, hi: u8) -> Self {
        Self {
            curve_preset: read_bits!(lo, 0b0000_0011, 0),
            temperature_compensation: read_bits!(lo, 0b0000_1100, 2),
            two_stage: read_bit!(lo, 6),
            cc_timeout_enable: read_bit!(hi, 0),
            cv_timeout_enable: read_bit!(hi, 1),
            fv_timeout_enable: read_bit!(hi, 2),
        }
    }

    fn pack(&self) -> [u8; 2] {
        let lo = (self.curve_preset & 0b11)
            | (self.temperature_compensation & 0b11) << 2
            | (self.two_stage as u8) << 6;
        let hi = self.cc_timeout_enable as u8
            | (self.cv_timeout_enable as u8) << 1
            | (self.fv_timeout_enable as u8) << 2;
        [lo, hi]
    }

    fn fields(&self) -> Vec<(&'static str, u8)> {
        vec![
            ("CUVS", self.curve_preset),
            ("TCS", self.temperature_compensation),
            ("STGS", self.two_stage as u8),
            ("CCTOE", self.cc_timeout_enable as u8),
            ("CVTOE", self.cv_timeout_enable as u8),
            ("FVTOE", self.fv_timeout_enable as u8),
        ]
    }
}

impl Writable for ChargeCurveConfig {}

/// System configuration (`0x00C2`), controls EEPROM pass-through.
///
/// ```text
/// HI  [  0  |  0  |  0  |  0  |  0  |EEP_OFF| EEP_CONFIG]
/// LO  [  0  |  0  |  0  |  0  |  0  |   0   |  0  |  0  ]
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SystemConfig {
    /// EEPROM write delay (EEP_CONFIG); `0` saves immediately.
    pub eeprom_write_delay: u8,
    /// EEPROM writes disabled (EEP_OFF).
    pub eeprom_disabled: bool,
}

impl Bitfield for SystemConfig {
    const CODE: u16 = 0x00C2;

    fn unpack(_lo: u8, hi: u8) -> Self {
        Self {
            eeprom_write_delay: read_bits!(hi, 0b0000_0011, 0),
            eeprom_disabled: read_bit!(hi, 2),
        }
    }

    fn pack(&self) -> [u8; 2] {
        [
            0,
            (self.eeprom_write_delay & 0b11) | (self.eeprom_disabled as u8) << 2,
        ]
    }

    fn fields(&self) -> Vec<(&'static str, u8)> {
        vec![
            ("EEP_CONFIG", self.eeprom_write_delay),
            ("EEP_OFF", self.eeprom_disabled as u8),
        ]
    }
}

impl Writable for SystemConfig {}

/// Inverter operation (`0x0100`), the register the mode sequencer drives.
///
/// ```text
/// HI  [  0  |  0  |  0  |  0  |  0  |   0   |  0  |   0   ]
/// LO  [  0  |  0  |  0  |  0  |  0  | CHG_EN|OP_EN|OP_CTRL]
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct InverterOperation {
    /// Output on (OP_CTRL). Only honoured while `output_enable` is set.
    pub output_control: bool,
    /// Output control enabled (OP_EN).
    pub output_enable: bool,
    /// Charger enabled (CHG_EN).
    pub charge_enable: bool,
}

impl Bitfield for InverterOperation {
    const CODE: u16 = 0x0100;

    fn unpack(lo: u8, _hi: u8) -> Self {
        Self {
            output_control: read_bit!(lo, 0),
            output_enable: read_bit!(lo, 1),
            charge_enable: read_bit!(lo, 2),
        }
    }

    fn pack(&self) -> [u8; 2] {
        [
            self.output_control as u8
                | (self.output_enable as u8) << 1
                | (self.charge_enable as u8) << 2,
            0,
        ]
    }

    fn fields(&self) -> Vec<(&'static str, u8)> {
        vec![
            ("OP_CTRL", self.output_control as u8),
            ("OP_EN", self.output_enable as u8),
            ("CHG_EN", self.charge_enable as u8),
        ]
    }
}

impl Writable for InverterOperation {}

/// Inverter configuration (`0x0101`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct InverterConfig {
    /// Inverter priority / energy saving mode (INV_PRIO, 0-3).
    pub priority: u8,
}

impl Bitfield for InverterConfig {
    const CODE: u16 = 0x0101;

    fn unpack(lo: u8, _hi: u8) -> Self {
        Self {
            priority: read_bits!(lo, 0b0000_0011, 0),
        }
    }

    fn pack(&self) -> [u8; 2] {
        [self.priority & 0b11, 0]
    }

    fn fields(&self) -> Vec<(&'static str, u8)> {
        vec![("INV_PRIO", self.priority)]
    }
}

impl Writable for InverterConfig {}

/// Charge status (`0x00B8`), read only.
///
/// ```text
/// HI  [FVTOF|CVTOF|CCTOF|  0  |  0  |NTCER|  0  |  0  ]
/// LO  [  0  |  0  |  0  |  0  | FVM | CVM | CCM |FULLM]
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ChargeStatus {
    /// Battery full (FULLM).
    pub full: bool,
    /// Constant current regime (CCM).
    pub constant_current: bool,
    /// Constant voltage regime (CVM).
    pub constant_voltage: bool,
    /// Float voltage regime (FVM).
    pub float_voltage: bool,
    /// Temperature compensation sensor error (NTCER).
    pub ntc_error: bool,
    pub cc_timeout: bool,
    pub cv_timeout: bool,
    pub fv_timeout: bool,
}

impl Bitfield for ChargeStatus {
    const CODE: u16 = 0x00B8;

    fn unpack(lo: u8, hi: u8) -> Self {
        Self {
            full: read_bit!(lo, 0),
            constant_current: read_bit!(lo, 1),
            constant_voltage: read_bit!(lo, 2),
            float_voltage: read_bit!(lo, 3),
            ntc_error: read_bit!(hi, 2),
            cc_timeout: read_bit!(hi, 5),
            cv_timeout: read_bit!(hi, 6),
            fv_timeout: read_bit!(hi, 7),
        }
    }

    fn pack(&self) -> [u8; 2] {
        let lo = self.full as u8
            | (self.constant_current as u8) << 1
            | (self.constant_voltage as u8) << 2
            | (self.float_voltage as u8) << 3;
        let hi = (self.ntc_error as u8) << 2
            | (self.cc_timeout as u8) << 5
            | (self.cv_timeout as u8) << 6
            | (self.fv_timeout as u8) << 7;
        [lo, hi]
    }

    fn fields(&self) -> Vec<(&'static str, u8)> {
        vec![
            ("FULLM", self.full as u8),
            ("CCM", self.constant_current as u8),
            ("CVM", self.constant_voltage as u8),
            ("FVM", self.float_voltage as u8),
            ("NTCER", self.ntc_error as u8),
            ("CCTOF", self.cc_timeout as u8),
            ("CVTOF", self.cv_timeout as u8),
            ("FVTOF", self.fv_timeout as u8),
        ]
    }
}

/// Inverter status (`0x011D`), read only.
///
/// ```text
/// HI  [  0  |     0     |   0   |    0    |   0   |   0   | INV_PHASE ]
/// LO  [  0  |Bat_Low_ALM| SAVING| SOLAR_EN| CHG_ON| UTI_OK| BYP | INV ]
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct InverterStatus {
    pub inverter: bool,
    pub bypass: bool,
    pub utility_ok: bool,
    pub charger_on: bool,
    pub solar_enabled: bool,
    pub energy_saving: bool,
    pub battery_low: bool,
    pub phase: u8,
}

impl Bitfield for InverterStatus {
    const CODE: u16 = 0x011D;

    fn unpack(lo: u8, hi: u8) -> Self {
        Self {
            inverter: read_bit!(lo, 0),
            bypass: read_bit!(lo, 1),
            utility_ok: read_bit!(lo, 2),
            charger_on: read_bit!(lo, 3),
            solar_enabled: read_bit!(lo, 4),
            energy_saving: read_bit!(lo, 5),
            battery_low: read_bit!(lo, 6),
            phase: read_bits!(hi, 0b0000_0011, 0),
        }
    }

    fn pack(&self) -> [u8; 2] {
        let lo = self.inverter as u8
            | (self.bypass as u8) << 1
            | (self.utility_ok as u8) << 2
            | (self.charger_on as u8) << 3
            | (self.solar_enabled as u8) << 4
            | (self.energy_saving as u8) << 5
            | (self.battery_low as u8) << 6;
        [lo, self.phase & 0b11]
    }

    fn fields(&self) -> Vec<(&'static str, u8)> {
        vec![
            ("INV", self.inverter as u8),
            ("BYP", self.bypass as u8),
            ("UTI_OK", self.utility_ok as u8),
            ("CHG_ON", self.charger_on as u8),
            ("SOLAR_EN", self.solar_enabled as u8),
            ("SAVING", self.energy_saving as u8),
            ("BAT_LOW_ALM", self.battery_low as u8),
            ("INV_PHASE", self.phase),
        ]
    }
}

/// Fault register (`0x011E`), read only.
///
/// ```text
/// HI  [   0   |  0  |   0   |INV_Fault|Bat_OVP|Bat_UVP|FAN_FAIL|  SHDN  ]
/// LO  [EEP_Err| SCP |INV_OVP| INV_UVP |  OTP  |OLP_150| OLP_115| OLP_100]
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FaultStatus {
    /// Output power above 100 %.
    pub overload_100: bool,
    /// Output power above 115 %.
    pub overload_115: bool,
    /// Output power above 150 %.
    pub overload_150: bool,
    pub over_temperature: bool,
    pub inverter_under_voltage: bool,
    pub inverter_over_voltage: bool,
    pub short_circuit: bool,
    pub eeprom_error: bool,
    pub shutdown: bool,
    pub fan_failure: bool,
    pub battery_under_voltage: bool,
    pub battery_over_voltage: bool,
    pub inverter_fault: bool,
}

impl FaultStatus {
    /// Returns `true` if any fault flag is raised.
    pub fn any(&self) -> bool {
        self.pack() != [0, 0]
    }
}

impl Bitfield for FaultStatus {
    const CODE: u16 = 0x011E;

    fn unpack(lo: u8, hi: u8) -> Self {
        Self {
            overload_100: read_bit!(lo, 0),
            overload_115: read_bit!(lo, 1),
            overload_150: read_bit!(lo, 2),
            over_temperature: read_bit!(lo, 3),
            inverter_under_voltage: read_bit!(lo, 4),
            inverter_over_voltage: read_bit!(lo, 5),
            short_circuit: read_bit!(lo, 6),
            eeprom_error: read_bit!(lo, 7),
            shutdown: read_bit!(hi, 0),
            fan_failure: read_bit!(hi, 1),
            battery_under_voltage: read_bit!(hi, 2),
            battery_over_voltage: read_bit!(hi, 3),
            inverter_fault: read_bit!(hi, 4),
        }
    }

    fn pack(&self) -> [u8; 2] {
        let lo = self.overload_100 as u8
            | (self.overload_115 as u8) << 1
            | (self.overload_150 as u8) << 2
            | (self.over_temperature as u8) << 3
            | (self.inverter_under_voltage as u8) << 4
            | (self.inverter_over_voltage as u8) << 5
            | (self.short_circuit as u8) << 6
            | (self.eeprom_error as u8) << 7;
        let hi = self.shutdown as u8
            | (self.fan_failure as u8) << 1
            | (self.battery_under_voltage as u8) << 2
            | (self.battery_over_voltage as u8) << 3
            | (self.inverter_fault as u8) << 4;
        [lo, hi]
    }

    fn fields(&self) -> Vec<(&'static str, u8)> {
        vec![
            ("OLP_100", self.overload_100 as u8),
            ("OLP_115", self.overload_115 as u8),
            ("OLP_150", self.overload_150 as u8),
            ("OTP", self.over_temperature as u8),
            ("INV_UVP", self.inverter_under_voltage as u8),
            ("INV_OVP", self.inverter_over_voltage as u8),
            ("SCP", self.short_circuit as u8),
            ("EEP_ERR", self.eeprom_error as u8),
            ("SHDN", self.shutdown as u8),
            ("FAN_FAIL", self.fan_failure as u8),
            ("BAT_UVP", self.battery_under_voltage as u8),
            ("BAT_OVP", self.battery_over_voltage as u8),
            ("INV_FAULT", self.inverter_fault as u8),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use assert_matches::assert_matches;

    #[test]
    fn charge_curve_config_layout() {
        let config: ChargeCurveConfig = decode_bitfield([0b0100_1110, 0b0000_0101]);
        assert_eq!(config.curve_preset, 2);
        assert_eq!(config.temperature_compensation, 3);
        assert!(config.two_stage);
        assert!(config.cc_timeout_enable);
        assert!(!config.cv_timeout_enable);
        assert!(config.fv_timeout_enable);
        assert_eq!(encode_bitfield(&config), [0b0100_1110, 0b0000_0101]);
    }

    #[test]
    fn system_config_ignores_low_byte() {
        let config: SystemConfig = decode_bitfield([0xFF, 0b0000_0110]);
        assert_eq!(config.eeprom_write_delay, 2);
        assert!(config.eeprom_disabled);
        assert_eq!(config.pack(), [0, 0b0000_0110]);
    }

    #[test]
    fn inverter_operation_bits() {
        let op = InverterOperation {
            output_control: false,
            output_enable: true,
            charge_enable: false,
        };
        assert_eq!(op.pack(), [0b010, 0]);
        let op: InverterOperation = decode_bitfield([0b101, 0]);
        assert!(op.output_control);
        assert!(!op.output_enable);
        assert!(op.charge_enable);
    }

    #[test]
    fn override_preserves_untouched_fields() {
        let before: ChargeCurveConfig = decode_bitfield([0b0000_1101, 0b0000_0011]);
        let mut after = before;
        after.two_stage = true;
        let after: ChargeCurveConfig = decode_bitfield(after.pack());
        assert!(after.two_stage);
        assert_eq!(after.curve_preset, before.curve_preset);
        assert_eq!(after.temperature_compensation, before.temperature_compensation);
        assert_eq!(after.cc_timeout_enable, before.cc_timeout_enable);
        assert_eq!(after.cv_timeout_enable, before.cv_timeout_enable);
        assert_eq!(after.fv_timeout_enable, before.fv_timeout_enable);
    }

    #[test]
    fn charge_status_flags() {
        let status = ChargeStatus::decode(&[0b0000_0110, 0b1000_0000]).unwrap();
        assert!(!status.full);
        assert!(status.constant_current);
        assert!(status.constant_voltage);
        assert!(status.fv_timeout);
        assert!(!status.cc_timeout);
        assert_eq!(status.fields()[1], ("CCM", 1));
        assert_eq!(status.fields().len(), 8);
    }

    #[test]
    fn inverter_status_phase() {
        let status: InverterStatus = decode_bitfield([0b0100_1010, 0b0000_0010]);
        assert!(status.bypass);
        assert!(status.charger_on);
        assert!(status.battery_low);
        assert!(!status.inverter);
        assert_eq!(status.phase, 2);
    }

    #[test]
    fn fault_status_any() {
        assert!(!FaultStatus::default().any());
        let faults: FaultStatus = decode_bitfield([0, 0b0000_0010]);
        assert!(faults.fan_failure);
        assert!(faults.any());
        let faults: FaultStatus = decode_bitfield([0b1000_0000, 0]);
        assert!(faults.eeprom_error);
    }

    #[test]
    fn short_payload_is_rejected() {
        assert_matches!(
            InverterOperation::decode(&[0x02]),
            Err(Error::MalformedPayload { code: 0x0100, len: 1 })
        );
    }
}
