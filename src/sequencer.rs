//! Mode transitions on the inverter operation register.
//!
//! The hardware rejects enabling the charger and the output routing in the same
//! transient, so each transition clears the other function first, waits for the
//! internal interlock to settle, and only then asserts the new one. `OFF` is a
//! single write and reachable from any state.
//!
//! Every step is a read-modify-write of [`InverterOperation`]; bits a step does
//! not name keep their current value.

use crate::{
    bitfield::InverterOperation,
    bus::Bus,
    client::Client,
    device::Timing,
    protocol::Mode,
    Result,
};
use log::{debug, info};

/// Drives the device into `mode`.
///
/// If a step fails the device is left in the intermediate state written so far,
/// which is never one with both charger and output routing enabled.
pub fn transition<B: Bus>(client: &mut Client<B>, mode: Mode, timing: &Timing) -> Result<()> {
    info!("Switching device {} to {mode}", client.address());
    match mode {
        Mode::Off => {
            client.modify::<InverterOperation>(|op| {
                op.charge_enable = false;
                op.output_enable = true;
                op.output_control = false;
            })?;
        }
        Mode::Charge => {
            client.modify::<InverterOperation>(|op| {
                op.output_enable = true;
                op.output_control = false;
            })?;
            std::thread::sleep(timing.mode_settle);
            client.modify::<InverterOperation>(|op| op.charge_enable = true)?;
        }
        Mode::Discharge => {
            client.modify::<InverterOperation>(|op| op.charge_enable = false)?;
            std::thread::sleep(timing.mode_settle);
            client.modify::<InverterOperation>(|op| {
                op.output_enable = true;
                op.output_control = true;
            })?;
        }
    }
    debug!("Device {} is in {mode}", client.address());
    Ok(())
}

/// The mode an operation register value corresponds to, if any.
pub fn mode_of(op: &InverterOperation) -> Option<Mode> {
    match (op.charge_enable, op.output_enable, op.output_control) {
        (false, true, false) => Some(Mode::Off),
        (true, true, false) => Some(Mode::Charge),
        (false, true, true) => Some(Mode::Discharge),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{bitfield::Bitfield, mock_bus::MockBus, protocol::Address};

    const OFF: InverterOperation = InverterOperation {
        output_control: false,
        output_enable: true,
        charge_enable: false,
    };

    fn client_in(op: InverterOperation) -> Client<MockBus> {
        let mut client = Client::new(MockBus::new(), Address::default());
        client.set_settle(std::time::Duration::ZERO);
        client.bus_mut().set_bitfield(op);
        client
    }

    fn written(client: &Client<MockBus>) -> Vec<InverterOperation> {
        client
            .bus()
            .writes_to(InverterOperation::CODE)
            .iter()
            .map(|bytes| InverterOperation::unpack(bytes[0], bytes[1]))
            .collect()
    }

    #[test]
    fn off_is_reachable_from_every_state() {
        for start in 0..8u8 {
            let mut client = client_in(InverterOperation::unpack(start, 0));
            transition(&mut client, Mode::Off, &Timing::ZERO).unwrap();
            assert_eq!(written(&client), vec![OFF]);
            assert_eq!(client.bus().bitfield::<InverterOperation>(), OFF);
        }
    }

    #[test]
    fn charge_enables_output_before_charger() {
        let discharging = InverterOperation {
            output_control: true,
            output_enable: true,
            charge_enable: false,
        };
        let mut client = client_in(discharging);
        transition(&mut client, Mode::Charge, &Timing::ZERO).unwrap();

        let steps = written(&client);
        assert_eq!(steps.len(), 2);
        assert!(steps[0].output_enable);
        assert!(!steps[0].output_control);
        assert!(!steps[0].charge_enable);
        assert!(steps[1].output_enable);
        assert!(steps[1].charge_enable);
        assert_eq!(mode_of(&steps[1]), Some(Mode::Charge));
    }

    #[test]
    fn discharge_disables_charger_before_output() {
        let charging = InverterOperation {
            output_control: false,
            output_enable: true,
            charge_enable: true,
        };
        let mut client = client_in(charging);
        transition(&mut client, Mode::Discharge, &Timing::ZERO).unwrap();

        let steps = written(&client);
        assert_eq!(steps.len(), 2);
        assert!(!steps[0].charge_enable);
        assert!(!steps[0].output_control);
        assert!(!steps[1].charge_enable);
        assert!(steps[1].output_enable && steps[1].output_control);
        assert_eq!(mode_of(&steps[1]), Some(Mode::Discharge));
    }

    #[test]
    fn never_charges_with_output_on() {
        let mut client = client_in(OFF);
        for mode in [Mode::Charge, Mode::Discharge, Mode::Charge, Mode::Off, Mode::Discharge] {
            transition(&mut client, mode, &Timing::ZERO).unwrap();
        }
        for op in written(&client) {
            assert!(!(op.charge_enable && op.output_control), "{op:?}");
        }
    }

    #[test]
    fn failed_read_writes_nothing() {
        let mut client = client_in(OFF);
        client.bus_mut().set_silent(InverterOperation::CODE, true);
        assert!(transition(&mut client, Mode::Charge, &Timing::ZERO).is_err());
        assert!(written(&client).is_empty());
    }

    #[test]
    fn mode_from_register() {
        assert_eq!(mode_of(&OFF), Some(Mode::Off));
        assert_eq!(mode_of(&InverterOperation::default()), None);
    }
}
