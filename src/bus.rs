//! The bus handle consumed by the protocol client.
//!
//! Any transport that can send a frame and block for the next received frame can
//! carry the register protocol. The Linux SocketCAN implementation lives in
//! [`crate::socketcan_bus`]; tests use a simulated device.

use crate::protocol::Frame;
use std::time::Duration;

/// Default CAN interface the charger/inverter is wired to.
pub const DEFAULT_INTERFACE: &str = "can1";

/// A blocking, exclusively owned bus handle.
pub trait Bus {
    /// Transmits one frame.
    fn send(&mut self, frame: &Frame) -> std::io::Result<()>;

    /// Waits up to `timeout` for the next frame; `Ok(None)` when none arrived.
    /// A zero timeout polls without blocking.
    fn receive(&mut self, timeout: Duration) -> std::io::Result<Option<Frame>>;

    /// Releases the underlying handle. Further calls may fail.
    fn shutdown(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<B: Bus + ?Sized> Bus for Box<B> {
    fn send(&mut self, frame: &Frame) -> std::io::Result<()> {
        (**self).send(frame)
    }

    fn receive(&mut self, timeout: Duration) -> std::io::Result<Option<Frame>> {
        (**self).receive(timeout)
    }

    fn shutdown(&mut self) -> std::io::Result<()> {
        (**self).shutdown()
    }
}

impl<B: Bus + ?Sized> Bus for &mut B {
    fn send(&mut self, frame: &Frame) -> std::io::Result<()> {
        (**self).send(frame)
    }

    fn receive(&mut self, timeout: Duration) -> std::io::Result<Option<Frame>> {
        (**self).receive(timeout)
    }

    fn shutdown(&mut self) -> std::io::Result<()> {
        (**self).shutdown()
    }
}
