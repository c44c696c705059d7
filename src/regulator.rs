//! Closed-loop power regulation while charging.
//!
//! The charger has no power setpoint. Instead, the regulator steers whichever
//! charge curve setpoint currently limits charging: the CV setpoint in the constant
//! voltage regime, the CC setpoint in the constant current regime. This module is
//! pure; [`crate::device::Device::update`] performs the reads and writes.

use crate::bitfield::ChargeStatus;
use crate::protocol::FALLBACK_CV_VOLTAGE;
use log::warn;
use std::fmt;

/// Relative power error below which no correction is made.
pub const ERROR_THRESHOLD: f64 = 0.01;

/// Relative error of `measured` against `desired`; `0` when nothing is desired.
pub fn power_error(desired: f64, measured: f64) -> f64 {
    if desired == 0.0 {
        0.0
    } else {
        (desired - measured) / desired
    }
}

/// Rounds a setpoint to two decimals.
pub fn round_setpoint(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// A setpoint change decided for one control tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Correction {
    None,
    /// New constant voltage setpoint in V, before register clamping.
    Voltage(f64),
    /// New constant current setpoint in A, before register clamping.
    Current(f64),
}

impl fmt::Display for Correction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Correction::None => write!(f, "none"),
            Correction::Voltage(volts) => write!(f, "CV {volts:.2} V"),
            Correction::Current(amps) => write!(f, "CC {amps:.2} A"),
        }
    }
}

/// Decides the correction for one tick from a fresh battery sample and charge status.
///
/// `current` is positive while charging. No correction is made while the relative
/// error is within [`ERROR_THRESHOLD`] or the battery reports full.
pub fn plan(desired: f64, voltage: f64, current: f64, status: &ChargeStatus) -> Correction {
    let error = power_error(desired, voltage * current);
    if error.abs() <= ERROR_THRESHOLD || status.full {
        return Correction::None;
    }
    if status.constant_voltage {
        let target = if current != 0.0 {
            desired / current
        } else {
            FALLBACK_CV_VOLTAGE
        };
        Correction::Voltage(round_setpoint(target))
    } else if status.constant_current {
        if voltage == 0.0 {
            warn!("Battery voltage reads zero, skipping current correction");
            return Correction::None;
        }
        Correction::Current(round_setpoint(desired / voltage))
    } else {
        Correction::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(full: bool, cc: bool, cv: bool) -> ChargeStatus {
        ChargeStatus {
            full,
            constant_current: cc,
            constant_voltage: cv,
            ..Default::default()
        }
    }

    #[test]
    fn relative_error() {
        assert!((power_error(1000.0, 900.0) - 0.1).abs() < 1e-12);
        assert!((power_error(1000.0, 1100.0) + 0.1).abs() < 1e-12);
        assert_eq!(power_error(0.0, 900.0), 0.0);
    }

    #[test]
    fn constant_current_scenario() {
        let correction = plan(1000.0, 50.0, 18.0, &status(false, true, false));
        assert_eq!(correction, Correction::Current(20.0));
    }

    #[test]
    fn constant_voltage_target() {
        let correction = plan(1000.0, 50.0, 18.0, &status(false, false, true));
        assert_eq!(correction, Correction::Voltage(55.56));
    }

    #[test]
    fn zero_current_uses_fallback_voltage() {
        let correction = plan(1000.0, 50.0, 0.0, &status(false, false, true));
        assert_eq!(correction, Correction::Voltage(FALLBACK_CV_VOLTAGE));
    }

    #[test]
    fn zero_voltage_skips_current_correction() {
        assert_eq!(
            plan(1000.0, 0.0, 18.0, &status(false, true, false)),
            Correction::None
        );
    }

    #[test]
    fn small_error_is_ignored() {
        // 50 V × 19.9 A = 995 W, 0.5 % below target.
        assert_eq!(
            plan(1000.0, 50.0, 19.9, &status(false, true, false)),
            Correction::None
        );
        assert_eq!(
            plan(1000.0, 50.0, 20.1, &status(false, false, true)),
            Correction::None
        );
    }

    #[test]
    fn full_battery_is_not_corrected() {
        assert_eq!(
            plan(1000.0, 50.0, 2.0, &status(true, false, true)),
            Correction::None
        );
    }

    #[test]
    fn no_regime_no_correction() {
        assert_eq!(
            plan(1000.0, 50.0, 2.0, &status(false, false, false)),
            Correction::None
        );
    }

    #[test]
    fn setpoint_rounding() {
        assert_eq!(round_setpoint(17.857142), 17.86);
        assert_eq!(round_setpoint(20.0), 20.0);
    }
}
