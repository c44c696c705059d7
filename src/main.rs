//! Charger/Inverter CLI
//!
//! A command-line interface (CLI) application for monitoring and regulating a
//! bidirectional charger/inverter over a SocketCAN interface.
//!
//! This tool allows users to:
//! - Read AC input/output, battery and temperature measurements.
//! - Read the charge curve, battery thresholds and status registers.
//! - Switch the device between OFF, CHARGE and DISCHARGE.
//! - Verify and, after confirmation, commit the EEPROM preset.
//! - Run in a continuous daemon mode that regulates the battery charge power
//!   and prints a report every poll interval.
//!
//! The CLI leverages the `chinv_lib` crate for protocol definitions and client operations.

use anyhow::{Context, Result};
use chinv_lib::{
    bitfield::Bitfield,
    bus::Bus,
    client::Client,
    device::Device,
    protocol::{Mode, CHARGE_POWER_MIN},
    sequencer, startup,
};
use clap::Parser;
use dialoguer::Confirm;
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use std::panic;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

mod commandline;
mod config;

type BoxedBus = Box<dyn Bus + Send>;

fn logging_init(loglevel: LevelFilter) -> Result<LoggerHandle> {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .context("Invalid log specification")?
        .start()
        .context("Cannot start logging")?;

    // The device keeps its last mode when the process dies.
    panic::set_hook(Box::new(|panic_info| {
        let location = panic_info
            .location()
            .map_or_else(|| "<unknown location>".to_string(), |loc| loc.to_string());
        let payload = panic_info.payload();
        let cause = payload
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
            .unwrap_or("<unknown cause>");

        error!(
            target: "panic",
            "Thread '{}' panicked at {location}: {cause}. The device may still be charging or discharging, run `chinv set-mode off`.",
            std::thread::current().name().unwrap_or("<unnamed>"),
        );
    }));
    Ok(log_handle)
}

#[cfg(target_os = "linux")]
fn open_bus(interface: &str) -> Result<BoxedBus> {
    let bus = chinv_lib::socketcan_bus::SocketCanBus::open(interface)
        .with_context(|| format!("Cannot open CAN interface {interface}"))?;
    Ok(Box::new(bus))
}

#[cfg(not(target_os = "linux"))]
fn open_bus(interface: &str) -> Result<BoxedBus> {
    anyhow::bail!("Cannot open CAN interface {interface}: SocketCAN is only available on Linux")
}

macro_rules! print_measurements {
    ($client:expr) => {
        let measurements = $client
            .read_measurements()
            .with_context(|| "Cannot read measurements")?;
        println!("{}", measurements);
    };
}

macro_rules! print_charge_curve {
    ($client:expr) => {
        let curve = $client
            .read_charge_curve()
            .with_context(|| "Cannot read charge curve")?;
        let config = $client
            .read_charge_curve_config()
            .with_context(|| "Cannot read charge curve configuration")?;
        println!("{}", curve);
        println!("Curve config: {}", format_fields(&config));
    };
}

macro_rules! print_status {
    ($client:expr) => {
        let operation = $client
            .read_inverter_operation()
            .with_context(|| "Cannot read inverter operation")?;
        let mode = sequencer::mode_of(&operation)
            .map_or_else(|| "undefined".to_string(), |mode| mode.to_string());
        println!("Mode: {mode} ({})", format_fields(&operation));
        let charge = $client
            .read_charge_status()
            .with_context(|| "Cannot read charge status")?;
        println!("Charge status: {}", format_fields(&charge));
        let inverter = $client
            .read_inverter_status()
            .with_context(|| "Cannot read inverter status")?;
        println!("Inverter status: {}", format_fields(&inverter));
        let faults = $client
            .read_fault_status()
            .with_context(|| "Cannot read fault status")?;
        if faults.any() {
            println!("Faults: {}", format_fields(&faults));
        } else {
            println!("Faults: none");
        }
    };
}

fn format_fields<T: Bitfield>(value: &T) -> String {
    value
        .fields()
        .iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Verifies the EEPROM preset and commits it after confirmation.
fn handle_eeprom(
    client: &mut Client<BoxedBus>,
    config: &config::Config,
    check_only: bool,
    assume_yes: bool,
) -> Result<()> {
    let preset = &config.device.preset;
    let mismatches = startup::check_eeprom_preset(client, preset)
        .with_context(|| "Cannot read EEPROM preset registers")?;
    if mismatches.is_empty() {
        println!("EEPROM preset already set.");
        return Ok(());
    }
    println!("EEPROM preset differs:");
    for mismatch in &mismatches {
        println!("  {mismatch}");
    }
    if check_only {
        return Ok(());
    }

    println!("WARNING: Every commit uses up EEPROM write cycles of the device.");
    if !assume_yes
        && !Confirm::new()
            .with_prompt("Do you want to commit the preset to the EEPROM?")
            .default(false)
            .show_default(true)
            .interact()
            .context("Failed to get user confirmation.")?
    {
        info!("EEPROM commit aborted by user.");
        return Ok(());
    }
    let outcome = startup::apply_eeprom_preset(client, preset, &config.device.timing)
        .with_context(|| "Cannot commit EEPROM preset")?;
    println!("EEPROM preset: {outcome:?}");
    Ok(())
}

/// Runs the control loop until Ctrl-C, then switches the device off.
fn run_daemon(
    bus: BoxedBus,
    config: &config::Config,
    mode: Mode,
    power: Option<f64>,
) -> Result<()> {
    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        ctrlc::set_handler(move || running.store(false, Ordering::SeqCst))
            .context("Cannot install Ctrl-C handler")?;
    }

    let mut device_config = config.device;
    if let Some(power) = power {
        device_config.desired_power = power;
    }
    if commandline::power_below_minimum(device_config.desired_power) {
        warn!(
            "{} W is below the lowest charge power of {} W, the charger will not reach it",
            device_config.desired_power,
            CHARGE_POWER_MIN
        );
    }
    let mut device =
        Device::new(bus, device_config).with_context(|| "Cannot initialize device")?;
    if let Err(error) = device.request_mode(mode) {
        device.shutdown().ok();
        return Err(error).with_context(|| format!("Cannot switch device to {mode}"));
    }
    info!(
        "Starting daemon mode: mode={mode}, power={} W, interval={:?}",
        device.desired_power(),
        config.poll_interval
    );

    while running.load(Ordering::SeqCst) {
        device.update();
        println!("{}", device.report());
        std::thread::sleep(config.poll_interval);
    }

    info!("Stopping daemon, switching device off");
    device
        .shutdown()
        .with_context(|| "Cannot shut down device cleanly")
}

fn main() -> Result<()> {
    let args = commandline::CliArgs::parse();

    // 1. Initialize logging as early as possible
    let _log_handle = logging_init(args.verbose.log_level_filter())?;
    info!(
        "Charger/inverter CLI started. Log level: {}",
        args.verbose.log_level_filter()
    );

    // 2. Merge config file and command line
    let mut config = config::Config::load(args.config.as_deref())
        .with_context(|| format!("Cannot load config file {:?}", args.config))?;
    if let Some(interface) = &args.interface {
        config.interface = interface.clone();
    }
    if let Some(address) = args.address {
        config.device.address = address;
    }
    if let Some(timeout) = args.timeout {
        config.device.timing.response_timeout = timeout;
    }
    if let commandline::CliCommands::Daemon {
        poll_interval: Some(poll_interval),
        ..
    } = &args.command
    {
        config.poll_interval = *poll_interval;
    }

    // 3. Open the bus
    info!(
        "Attempting to open CAN interface {} (Address: {})...",
        config.interface, config.device.address
    );
    let bus = open_bus(&config.interface)?;

    // 4. Execute the command
    if let commandline::CliCommands::Daemon { mode, power, .. } = &args.command {
        return run_daemon(bus, &config, *mode, *power);
    }

    let mut client = Client::new(bus, config.device.address);
    client.set_timeout(config.device.timing.response_timeout);
    client.set_settle(config.device.timing.read_settle);

    match &args.command {
        commandline::CliCommands::Daemon { .. } => unreachable!("Daemon is handled earlier."),
        commandline::CliCommands::Read => {
            info!("Executing: Read Measurements");
            print_measurements!(&mut client);
        }
        commandline::CliCommands::ReadCurve => {
            info!("Executing: Read Charge Curve");
            print_charge_curve!(&mut client);
        }
        commandline::CliCommands::ReadStatus => {
            info!("Executing: Read Status");
            print_status!(&mut client);
        }
        commandline::CliCommands::ReadAll => {
            info!("Executing: Read All Device Values");
            print_measurements!(&mut client);
            print_charge_curve!(&mut client);
            print_status!(&mut client);
        }
        commandline::CliCommands::SetMode { mode } => {
            info!("Executing: Set Mode to {mode}");
            sequencer::transition(&mut client, *mode, &config.device.timing)
                .with_context(|| format!("Failed to switch device to {mode}"))?;
            println!("Device switched to {mode}.");
        }
        commandline::CliCommands::Eeprom { check, yes } => {
            info!("Executing: EEPROM Preset");
            handle_eeprom(&mut client, &config, *check, *yes)?;
        }
    }

    client.shutdown().with_context(|| "Cannot release CAN interface")?;
    Ok(())
}
