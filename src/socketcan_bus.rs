//! Linux SocketCAN transport.
//!
//! The interface must already be up with the right bitrate (250 kbit/s for the
//! charger/inverter), e.g. `ip link set can1 up type can bitrate 250000`.

use crate::{bus::Bus, protocol::Frame};
use log::{debug, warn};
use socketcan::{CanFrame, CanSocket, EmbeddedFrame, ExtendedId, Id, Socket};
use std::io;
use std::time::Duration;

/// A [`Bus`] backed by a raw SocketCAN socket.
pub struct SocketCanBus {
    interface: String,
    socket: Option<CanSocket>,
}

impl SocketCanBus {
    /// Opens the raw CAN socket on `interface`.
    pub fn open(interface: &str) -> io::Result<Self> {
        debug!("Opening CAN interface: {interface}");
        let socket = CanSocket::open(interface)?;
        Ok(Self {
            interface: interface.to_string(),
            socket: Some(socket),
        })
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    fn socket(&self) -> io::Result<&CanSocket> {
        self.socket.as_ref().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotConnected,
                format!("CAN interface {} already released", self.interface),
            )
        })
    }
}

fn raw_id(id: Id) -> u32 {
    match id {
        Id::Standard(id) => id.as_raw() as u32,
        Id::Extended(id) => id.as_raw(),
    }
}

impl Bus for SocketCanBus {
    fn send(&mut self, frame: &Frame) -> io::Result<()> {
        let id = ExtendedId::new(frame.id).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Identifier {:#x} exceeds 29 bits", frame.id),
            )
        })?;
        let can_frame = CanFrame::new(id, &frame.data).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Frame body of {} bytes exceeds 8 bytes", frame.data.len()),
            )
        })?;
        self.socket()?.write_frame(&can_frame)
    }

    fn receive(&mut self, timeout: Duration) -> io::Result<Option<Frame>> {
        match self.socket()?.read_frame_timeout(timeout) {
            Ok(CanFrame::Error(error)) => {
                warn!("CAN error frame on {}: {error:?}", self.interface);
                Ok(None)
            }
            Ok(can_frame) => Ok(Some(Frame::new(
                raw_id(can_frame.id()),
                can_frame.data(),
            ))),
            Err(err) if matches!(err.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => {
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    fn shutdown(&mut self) -> io::Result<()> {
        if self.socket.take().is_some() {
            debug!("Closed CAN interface: {}", self.interface);
        }
        Ok(())
    }
}
