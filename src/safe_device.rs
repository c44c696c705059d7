//! Thread-safe handle to a [`Device`].
//!
//! The register protocol matches replies by recency, so two requests in flight at
//! the same time would steal each other's replies. `SafeDevice` puts the device
//! behind a mutex: every method holds the lock for the whole operation, which
//! makes "one outstanding request" a property of the type rather than of the
//! caller's loop.
//!
//! ## Example
//!
//! ```no_run
//! # #[cfg(all(target_os = "linux", feature = "socketcan-bus"))]
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use chinv_lib::{
//!     device::{Device, DeviceConfig},
//!     protocol::Mode,
//!     safe_device::SafeDevice,
//!     socketcan_bus::SocketCanBus,
//! };
//!
//! let bus = SocketCanBus::open("can1")?;
//! let device = SafeDevice::new(Device::new(bus, DeviceConfig::default())?);
//!
//! let control = device.clone();
//! std::thread::spawn(move || loop {
//!     control.update();
//!     std::thread::sleep(std::time::Duration::from_secs(1));
//! });
//!
//! device.set_desired_power(2000.0);
//! device.request_mode(Mode::Charge)?;
//! # Ok(())
//! # }
//! # #[cfg(not(all(target_os = "linux", feature = "socketcan-bus")))]
//! # fn main() {}
//! ```

use crate::{
    bus::Bus,
    client::Client,
    device::{Device, Report},
    protocol::Mode,
    Result,
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A [`Device`] shared between threads.
#[derive(Debug)]
pub struct SafeDevice<B: Bus> {
    device: Arc<Mutex<Device<B>>>,
}

impl<B: Bus> Clone for SafeDevice<B> {
    fn clone(&self) -> Self {
        Self {
            device: self.device.clone(),
        }
    }
}

impl<B: Bus> SafeDevice<B> {
    /// Wraps a constructed device.
    pub fn new(device: Device<B>) -> Self {
        Self {
            device: Arc::new(Mutex::new(device)),
        }
    }

    /// Creates a new `SafeDevice` from an already shared device.
    pub fn from_shared(device: Arc<Mutex<Device<B>>>) -> Self {
        Self { device }
    }

    /// Clones the shared device.
    pub fn clone_shared(&self) -> Arc<Mutex<Device<B>>> {
        self.device.clone()
    }

    /// Locks the device, ignoring poisoning.
    fn lock(&self) -> MutexGuard<'_, Device<B>> {
        self.device.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// See [`Device::update`].
    pub fn update(&self) {
        self.lock().update();
    }

    /// Returns a copy of the last report.
    pub fn report(&self) -> Report {
        *self.lock().report()
    }

    pub fn mode(&self) -> Mode {
        self.lock().mode()
    }

    pub fn desired_power(&self) -> f64 {
        self.lock().desired_power()
    }

    /// See [`Device::set_desired_power`].
    pub fn set_desired_power(&self, watts: f64) {
        self.lock().set_desired_power(watts);
    }

    /// See [`Device::request_mode`].
    pub fn request_mode(&self, mode: Mode) -> Result<()> {
        self.lock().request_mode(mode)
    }

    /// Runs `f` with exclusive access to the protocol client.
    pub fn with_client<T>(&self, f: impl FnOnce(&mut Client<B>) -> T) -> T {
        f(self.lock().client_mut())
    }

    /// Switches the device off and releases the bus.
    ///
    /// If other handles still exist, the device is switched off and the bus released
    /// through the lock; later calls through those handles fail at the bus.
    pub fn shutdown(self) -> Result<()> {
        match Arc::try_unwrap(self.device) {
            Ok(device) => device
                .into_inner()
                .unwrap_or_else(PoisonError::into_inner)
                .shutdown(),
            Err(shared) => {
                let mut device = shared.lock().unwrap_or_else(PoisonError::into_inner);
                let off = device.request_mode(Mode::Off);
                let released = device.client_mut().shutdown();
                off.and(released)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        device::{DeviceConfig, Timing},
        mock_bus::MockBus,
        protocol as proto,
    };

    fn safe_device() -> SafeDevice<MockBus> {
        let config = DeviceConfig {
            timing: Timing::ZERO,
            ..Default::default()
        };
        SafeDevice::new(Device::new(MockBus::new(), config).unwrap())
    }

    #[test]
    fn shared_between_threads() {
        let device = safe_device();
        device.with_client(|client| {
            client.bus_mut().set_scalar(proto::BATTERY_VOLTAGE, 50.0);
            client.bus_mut().set_scalar(proto::BATTERY_CURRENT, 20.0);
        });
        device.request_mode(Mode::Charge).unwrap();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let device = device.clone();
                std::thread::spawn(move || {
                    for _ in 0..5 {
                        device.update();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        // Every read got its own reply.
        let report = device.report();
        assert_eq!(report.mode, Mode::Charge);
        assert!((report.battery_power.unwrap() - 1000.0).abs() < 1e-6);
        assert!(report.error.abs() < 1e-9);
    }

    #[test]
    fn shutdown_with_other_handles() {
        let device = safe_device();
        let other = device.clone();
        device.shutdown().unwrap();
        assert!(other.with_client(|client| client.bus().is_shut_down()));
        assert_eq!(other.mode(), Mode::Off);
    }
}
