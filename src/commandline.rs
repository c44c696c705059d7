use chinv_lib::protocol::{self as proto, Mode};
use clap::{Parser, Subcommand};
use clap_verbosity_flag::{Verbosity, WarnLevel};
use std::path::PathBuf;
use std::time::Duration;

fn parse_address(s: &str) -> Result<proto::Address, String> {
    let address_val =
        clap_num::maybe_hex::<u8>(s).map_err(|e| format!("Invalid address format: {e}"))?;
    Ok(proto::Address::from(address_val))
}

fn parse_power(s: &str) -> Result<f64, String> {
    let watts = s
        .parse::<f64>()
        .map_err(|e| format!("Invalid power value format: {e}"))?;
    if !(0.0..=proto::CHARGE_POWER_MAX).contains(&watts) {
        return Err(format!(
            "Power must be between 0 and {} W",
            proto::CHARGE_POWER_MAX
        ));
    }
    Ok(watts)
}

/// True for a non-zero power the charger cannot deliver.
///
/// Checked after logging is up, value parsers run before it.
pub fn power_below_minimum(watts: f64) -> bool {
    watts != 0.0 && watts < proto::CHARGE_POWER_MIN
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Bring up the device and run the power regulator until Ctrl-C.
    /// Construction checks the EEPROM preset and switches the device OFF,
    /// then the requested mode is entered and a report is printed every poll interval.
    /// On Ctrl-C the device is switched OFF and the bus released.
    #[clap(verbatim_doc_comment)]
    Daemon {
        /// Operating mode to run in: off, charge or discharge.
        #[arg(short, long, default_value_t = Mode::Charge)]
        mode: Mode,

        /// Desired battery charge power in watts (0 to 4200).
        #[arg(short, long, value_parser = parse_power)]
        power: Option<f64>,

        /// Interval between control ticks (e.g., "1s", "500ms").
        #[arg(value_parser = humantime::parse_duration, long, verbatim_doc_comment)]
        poll_interval: Option<Duration>,
    },

    /// Read and display AC input/output, battery and temperature measurements.
    Read,

    /// Read and display the charge curve and battery threshold settings.
    ReadCurve,

    /// Read and display the charge, inverter and fault status registers.
    ReadStatus,

    /// Read and display all of the above.
    ReadAll,

    /// Switch the device into a mode without running the regulator.
    SetMode {
        /// off, charge or discharge.
        mode: Mode,
    },

    /// Verify the EEPROM preset and write it if it differs.
    /// **Warning:** Every commit wears the device EEPROM.
    #[clap(verbatim_doc_comment)]
    Eeprom {
        /// Only list the registers that differ, never write.
        #[arg(long)]
        check: bool,

        /// Commit without asking for confirmation.
        #[arg(short, long)]
        yes: bool,
    },
}

const fn about_text() -> &'static str {
    "Charger/inverter CLI - Monitor and regulate a bidirectional charger/inverter over CAN."
}

#[derive(Parser, Debug)]
#[command(name="chinv", author, version, about=about_text(), long_about = None, propagate_version = true)]
pub struct CliArgs {
    /// Configure verbosity of logging output.
    /// -v for info, -vv for debug, -vvv for trace. Default is warn.
    #[command(flatten)]
    pub verbose: Verbosity<WarnLevel>,

    /// YAML configuration file with interface, device and timing settings.
    #[arg(global = true, short, long)]
    pub config: Option<PathBuf>,

    /// CAN interface the device is connected to, overrides the config file.
    /// Example: "can1".
    #[arg(global = true, short, long, verbatim_doc_comment)]
    pub interface: Option<String>,

    /// Device base address, overrides the config file.
    /// Can be specified in decimal or hexadecimal (e.g., "0x00").
    #[arg(global = true, short, long, value_parser = parse_address, verbatim_doc_comment)]
    pub address: Option<proto::Address>,

    /// Time to wait for a register reply, overrides the config file.
    /// Examples: "1s", "500ms".
    #[arg(global = true, long, value_parser = humantime::parse_duration, verbatim_doc_comment)]
    pub timeout: Option<Duration>,

    #[command(subcommand)]
    pub command: CliCommands,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        CliArgs::command().debug_assert();
    }

    #[test]
    fn parse_daemon() {
        let args = CliArgs::try_parse_from([
            "chinv", "-i", "can0", "-a", "0x02", "daemon", "--power", "1500", "--poll-interval", "2s",
        ])
        .unwrap();
        assert_eq!(args.interface.as_deref(), Some("can0"));
        assert_eq!(args.address, Some(proto::Address::new(2)));
        assert_eq!(
            args.command,
            CliCommands::Daemon {
                mode: Mode::Charge,
                power: Some(1500.0),
                poll_interval: Some(Duration::from_secs(2)),
            }
        );
    }

    #[test]
    fn parse_set_mode() {
        let args = CliArgs::try_parse_from(["chinv", "set-mode", "discharge"]).unwrap();
        assert_eq!(args.command, CliCommands::SetMode { mode: Mode::Discharge });
        assert!(CliArgs::try_parse_from(["chinv", "set-mode", "boost"]).is_err());
    }

    #[test]
    fn power_range() {
        assert_eq!(parse_power("0"), Ok(0.0));
        assert_eq!(parse_power("4200"), Ok(4200.0));
        assert!(parse_power("4200.5").is_err());
        assert!(parse_power("-1").is_err());
        assert!(parse_power("lots").is_err());
    }

    #[test]
    fn low_power_is_accepted_but_flagged() {
        assert_eq!(parse_power("500"), Ok(500.0));
        assert!(power_below_minimum(500.0));
        assert!(!power_below_minimum(0.0));
        assert!(!power_below_minimum(proto::CHARGE_POWER_MIN));
        assert!(!power_below_minimum(1500.0));
    }
}
