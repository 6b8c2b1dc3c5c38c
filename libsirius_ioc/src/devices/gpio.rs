//! General purpose I/O of an undulator: the enable, halt-release, start and
//! reset signals of each drive pair.
//!
//! Frames on the wire are
//!
//! | op (1) | variable (1) | length (2, big endian) | payload | checksum (1) |
//!
//! where the checksum makes the byte sum of the whole frame zero modulo 256.
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::Mutex;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use super::Axis;
use crate::error::GpioError;

pub const OP_READ: u8 = 0x10;
pub const OP_READ_REPLY: u8 = 0x11;
pub const OP_WRITE: u8 = 0x20;
pub const OP_OK: u8 = 0xE0;

const MAX_PAYLOAD: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    Enable,
    HaltRelease,
    Start,
    Reset,
}

fn variable_id(axis: Axis, signal: Signal) -> u8 {
    let base = match axis {
        Axis::Gap => 0x01,
        Axis::Phase => 0x05,
    };
    base + match signal {
        Signal::Enable => 0,
        Signal::HaltRelease => 1,
        Signal::Start => 2,
        Signal::Reset => 3,
    }
}

/// Negated byte sum
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes
        .iter()
        .fold(0u8, |acc, b| acc.wrapping_add(*b))
        .wrapping_neg()
}

pub fn encode_frame(op: u8, variable: u8, payload: &[u8]) -> Result<Vec<u8>, GpioError> {
    if payload.len() > MAX_PAYLOAD {
        return Err(GpioError::PayloadTooLong(payload.len()));
    }
    let mut frame = Vec::with_capacity(payload.len() + 5);
    frame.write_u8(op)?;
    frame.write_u8(variable)?;
    frame.write_u16::<BigEndian>(payload.len() as u16)?;
    frame.extend_from_slice(payload);
    frame.push(checksum(&frame));
    Ok(frame)
}

/// Read one frame, returning op, variable and payload
pub fn decode_frame<R: Read>(reader: &mut R) -> Result<(u8, u8, Vec<u8>), GpioError> {
    let op = reader.read_u8()?;
    let variable = reader.read_u8()?;
    let length = reader.read_u16::<BigEndian>()? as usize;
    if length > MAX_PAYLOAD {
        return Err(GpioError::PayloadTooLong(length));
    }
    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload)?;
    let found = reader.read_u8()?;

    let mut header = vec![op, variable];
    header.extend_from_slice(&(length as u16).to_be_bytes());
    header.extend_from_slice(&payload);
    let expected = checksum(&header);
    if expected != found {
        return Err(GpioError::BadChecksum(expected, found));
    }
    Ok((op, variable, payload))
}

/// Digital signals of the drive pairs
pub trait IoBus: Send + Sync {
    fn set_enable(&self, axis: Axis, on: bool) -> Result<(), GpioError>;
    fn enabled(&self, axis: Axis) -> Result<bool, GpioError>;
    fn set_halt_release(&self, axis: Axis, on: bool) -> Result<(), GpioError>;
    fn halt_released(&self, axis: Axis) -> Result<bool, GpioError>;
    /// Pulse the start signal
    fn start(&self, axis: Axis) -> Result<(), GpioError>;
    /// Pulse the reset signal
    fn reset(&self, axis: Axis) -> Result<(), GpioError>;
}

/// [`IoBus`] over a framed byte link
#[derive(Debug)]
pub struct GpioBus<L> {
    link: Mutex<L>,
}

impl GpioBus<TcpStream> {
    pub fn connect(address: &str, timeout: Duration) -> Result<Self, GpioError> {
        let addr = address.to_socket_addrs()?.next().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, address.to_string())
        })?;
        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream))
    }
}

impl<L: Read + Write + Send> GpioBus<L> {
    pub fn new(link: L) -> Self {
        Self {
            link: Mutex::new(link),
        }
    }

    fn request(&self, op: u8, variable: u8, payload: &[u8]) -> Result<Vec<u8>, GpioError> {
        let frame = encode_frame(op, variable, payload)?;
        let mut link = self.link.lock();
        link.write_all(&frame)?;
        link.flush()?;
        let (reply_op, _, reply) = decode_frame(&mut *link)?;
        match (op, reply_op) {
            (OP_READ, OP_READ_REPLY) | (OP_WRITE, OP_OK) => Ok(reply),
            (_, code) if code > OP_OK && code <= 0xEF => Err(GpioError::DeviceError(code)),
            (_, code) => Err(GpioError::UnexpectedOp(code)),
        }
    }

    fn write_signal(&self, axis: Axis, signal: Signal, on: bool) -> Result<(), GpioError> {
        self.request(OP_WRITE, variable_id(axis, signal), &[on as u8])
            .map(|_| ())
    }

    fn read_signal(&self, axis: Axis, signal: Signal) -> Result<bool, GpioError> {
        let variable = variable_id(axis, signal);
        let reply = self.request(OP_READ, variable, &[])?;
        reply
            .first()
            .map(|b| *b != 0)
            .ok_or(GpioError::EmptyPayload(variable))
    }

    fn pulse(&self, axis: Axis, signal: Signal) -> Result<(), GpioError> {
        self.write_signal(axis, signal, true)?;
        self.write_signal(axis, signal, false)
    }
}

impl<L: Read + Write + Send> IoBus for GpioBus<L> {
    fn set_enable(&self, axis: Axis, on: bool) -> Result<(), GpioError> {
        self.write_signal(axis, Signal::Enable, on)
    }

    fn enabled(&self, axis: Axis) -> Result<bool, GpioError> {
        self.read_signal(axis, Signal::Enable)
    }

    fn set_halt_release(&self, axis: Axis, on: bool) -> Result<(), GpioError> {
        self.write_signal(axis, Signal::HaltRelease, on)
    }

    fn halt_released(&self, axis: Axis) -> Result<bool, GpioError> {
        self.read_signal(axis, Signal::HaltRelease)
    }

    fn start(&self, axis: Axis) -> Result<(), GpioError> {
        self.pulse(axis, Signal::Start)
    }

    fn reset(&self, axis: Axis) -> Result<(), GpioError> {
        self.pulse(axis, Signal::Reset)
    }
}
