//! We use this mocking module in unit tests to emulate a charger/inverter on the bus.
//!
//! The mock keeps a register image, answers every read request with the echoed
//! code and the current value, applies every write request to the image, and
//! records all frames in the order they were sent.

use crate::{
    bitfield::Bitfield,
    bus::Bus,
    protocol::{Address, Frame, Scalar, CODE_LENGTH, VALUE_LENGTH},
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

/// Our mock type used to emulate the device end of the bus.
pub struct MockBus {
    address: Address,
    /// Current register image
    registers: HashMap<u16, [u8; 2]>,
    /// Frames waiting to be received
    pending: VecDeque<Frame>,
    /// Frames that arrive after the next read request, ahead of its reply
    interleaved: VecDeque<Frame>,
    /// Every frame passed to `send`, including failed ones
    sent: Vec<Frame>,
    /// Registers that never answer
    silent: HashSet<u16>,
    /// Registers that answer without a value
    truncated: HashSet<u16>,
    /// Code used for the next reply instead of the requested one
    next_reply_code: Option<u16>,
    /// Flag to simulate transmit errors
    should_error_on_send: bool,
    shut_down: bool,
}

impl MockBus {
    pub fn new() -> Self {
        Self::with_address(Address::default())
    }

    pub fn with_address(address: Address) -> Self {
        Self {
            address,
            registers: HashMap::new(),
            pending: VecDeque::new(),
            interleaved: VecDeque::new(),
            sent: Vec::new(),
            silent: HashSet::new(),
            truncated: HashSet::new(),
            next_reply_code: None,
            should_error_on_send: false,
            shut_down: false,
        }
    }

    pub fn set_raw(&mut self, code: u16, bytes: [u8; 2]) {
        self.registers.insert(code, bytes);
    }

    pub fn raw(&self, code: u16) -> [u8; 2] {
        self.registers.get(&code).copied().unwrap_or_default()
    }

    pub fn set_scalar(&mut self, register: Scalar, value: f64) {
        let bytes = crate::protocol::encode_scalar(
            value,
            register.factor,
            f64::NEG_INFINITY,
            f64::INFINITY,
        )
        .expect("value fits register");
        self.set_raw(register.code, bytes);
    }

    pub fn scalar(&self, register: Scalar) -> f64 {
        crate::protocol::decode_scalar(self.raw(register.code), register.factor, register.signed)
    }

    pub fn set_bitfield<T: Bitfield>(&mut self, value: T) {
        self.set_raw(T::CODE, value.pack());
    }

    pub fn bitfield<T: Bitfield>(&self) -> T {
        let [lo, hi] = self.raw(T::CODE);
        T::unpack(lo, hi)
    }

    /// Makes reads of `code` time out.
    pub fn set_silent(&mut self, code: u16, silent: bool) {
        if silent {
            self.silent.insert(code);
        } else {
            self.silent.remove(&code);
        }
    }

    /// Makes reads of `code` answer with the code only.
    pub fn set_truncated(&mut self, code: u16) {
        self.truncated.insert(code);
    }

    /// Answers the next read with `code` instead of the requested code.
    pub fn reply_next_with_code(&mut self, code: u16) {
        self.next_reply_code = Some(code);
    }

    /// Queues a frame that is already waiting on the bus, like a late reply.
    pub fn push_frame(&mut self, frame: Frame) {
        self.pending.push_back(frame);
    }

    /// Queues a frame that arrives after the next read request but before its reply.
    pub fn push_frame_after_request(&mut self, frame: Frame) {
        self.interleaved.push_back(frame);
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn set_send_error(&mut self, should_error: bool) {
        self.should_error_on_send = should_error;
    }

    pub fn sent(&self) -> &[Frame] {
        &self.sent
    }

    pub fn clear_sent(&mut self) {
        self.sent.clear();
    }

    /// All register writes in the order they were sent.
    pub fn writes(&self) -> Vec<(u16, [u8; 2])> {
        self.sent
            .iter()
            .filter(|frame| frame.data.len() == CODE_LENGTH + VALUE_LENGTH)
            .map(|frame| {
                (
                    u16::from_le_bytes([frame.data[0], frame.data[1]]),
                    [frame.data[2], frame.data[3]],
                )
            })
            .collect()
    }

    /// Values written to `code` in the order they were sent.
    pub fn writes_to(&self, code: u16) -> Vec<[u8; 2]> {
        self.writes()
            .into_iter()
            .filter(|(written, _)| *written == code)
            .map(|(_, bytes)| bytes)
            .collect()
    }

    /// Codes of all read requests in the order they were sent.
    pub fn reads(&self) -> Vec<u16> {
        self.sent
            .iter()
            .filter(|frame| frame.data.len() == CODE_LENGTH)
            .map(|frame| u16::from_le_bytes([frame.data[0], frame.data[1]]))
            .collect()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }
}

impl Bus for MockBus {
    fn send(&mut self, frame: &Frame) -> std::io::Result<()> {
        self.sent.push(frame.clone());
        if self.should_error_on_send {
            return Err(std::io::Error::other("simulated transmit error"));
        }
        assert_eq!(frame.id, self.address.request_id(), "request to foreign id");

        let code = u16::from_le_bytes([frame.data[0], frame.data[1]]);
        match frame.data.len() {
            CODE_LENGTH => {
                self.pending.extend(self.interleaved.drain(..));
                if self.silent.contains(&code) {
                    return Ok(());
                }
                let reply_code = self.next_reply_code.take().unwrap_or(code);
                let mut data = reply_code.to_le_bytes().to_vec();
                if !self.truncated.contains(&code) {
                    data.extend_from_slice(&self.raw(code));
                }
                self.pending
                    .push_back(Frame::new(self.address.response_id(), data));
            }
            4 => {
                self.registers.insert(code, [frame.data[2], frame.data[3]]);
            }
            len => panic!("unexpected request length {len}"),
        }
        Ok(())
    }

    fn receive(&mut self, _timeout: Duration) -> std::io::Result<Option<Frame>> {
        Ok(self.pending.pop_front())
    }

    fn shutdown(&mut self) -> std::io::Result<()> {
        self.shut_down = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::BATTERY_VOLTAGE;

    #[test]
    fn answers_reads_from_register_image() {
        let mut bus = MockBus::new();
        bus.set_scalar(BATTERY_VOLTAGE, 50.0);
        bus.send(&Frame::request(Address::default(), 0x011A, &[]))
            .unwrap();
        let reply = bus.receive(Duration::ZERO).unwrap().unwrap();
        assert_eq!(reply.id, Address::default().response_id());
        assert_eq!(reply.data, vec![0x1A, 0x01, 0x88, 0x13]);
        assert!(bus.receive(Duration::ZERO).unwrap().is_none());
    }

    #[test]
    fn applies_writes() {
        let mut bus = MockBus::new();
        bus.send(&Frame::request(Address::default(), 0x00B1, &[0x50, 0x14]))
            .unwrap();
        assert_eq!(bus.raw(0x00B1), [0x50, 0x14]);
        assert_eq!(bus.writes(), vec![(0x00B1, [0x50, 0x14])]);
        assert!(bus.reads().is_empty());
    }

    #[test]
    fn silent_and_mismatched_replies() {
        let mut bus = MockBus::new();
        bus.set_silent(0x00B8, true);
        bus.send(&Frame::request(Address::default(), 0x00B8, &[]))
            .unwrap();
        assert!(bus.receive(Duration::ZERO).unwrap().is_none());

        bus.reply_next_with_code(0x00B9);
        bus.send(&Frame::request(Address::default(), 0x011A, &[]))
            .unwrap();
        let reply = bus.receive(Duration::ZERO).unwrap().unwrap();
        assert_eq!(&reply.data[..2], &[0xB9, 0x00]);
    }

    #[test]
    fn send_error_simulation() {
        let mut bus = MockBus::new();
        bus.set_send_error(true);
        assert!(bus
            .send(&Frame::request(Address::default(), 0x011A, &[]))
            .is_err());
        assert!(bus.receive(Duration::ZERO).unwrap().is_none());
    }
}
