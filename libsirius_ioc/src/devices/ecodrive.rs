//! Motion drives speaking an EcoDrive-style ASCII protocol.
//!
//! Several drives share one serial line. A drive is selected with
//! `BCD:<n>\r` and answers with the prompt `Ann:>`. Parameters are read with
//! `<idn>,7,R\r` and written with `<idn>,7,W,<value>\r`; the drive echoes the
//! command, prints the value (for reads) and the prompt. Replies starting with
//! `#` carry a device error code.
use parking_lot::Mutex;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use crate::error::DriveError;

/// Diagnostic shown by a drive that may be enabled
pub const READY_TO_ENABLE: &str = "A012";
/// Diagnostic shown by an enabled drive that may be released and moved
pub const READY_TO_MOVE: &str = "A211";

/// Attempts of one exchange, re-addressing the drive between attempts
pub const MAX_ATTEMPTS: usize = 3;

const MAX_REPLY_LEN: usize = 256;

const ENCODER_POSITION: &str = "S-0-0053";
const RESOLVER_POSITION: &str = "S-0-0051";
const TARGET_POSITION: &str = "P-0-4006";
const MAX_VELOCITY: &str = "S-0-0091";
const TARGET_VELOCITY: &str = "P-0-4007";
const DIAGNOSTIC_CODE: &str = "S-0-0390";
const HALTEN_STATUS: &str = "P-0-4060";
const CLEAR_ERROR: &str = "S-0-0099";

/// Canonical form of a diagnostic code: trimmed, upper case
pub fn normalize_diagnostic(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}

/// Class 1 diagnostics (`Fxxx`) are errors a `clear_error` may reset
pub fn is_clearable_fault(code: &str) -> bool {
    normalize_diagnostic(code).starts_with('F')
}

/// The operations the motion coordinator needs from one drive
pub trait Drive: Send + Sync {
    fn address(&self) -> u8;
    fn get_encoder_position(&self) -> Result<f64, DriveError>;
    fn get_resolver_position(&self) -> Result<f64, DriveError>;
    fn get_target_position(&self) -> Result<f64, DriveError>;
    fn set_target_position(&self, position: f64) -> Result<(), DriveError>;
    fn get_max_velocity(&self) -> Result<f64, DriveError>;
    fn get_target_velocity(&self) -> Result<f64, DriveError>;
    fn set_target_velocity(&self, velocity: f64) -> Result<(), DriveError>;
    fn get_diagnostic_code(&self) -> Result<String, DriveError>;
    fn get_halten_status(&self) -> Result<bool, DriveError>;
    fn clear_error(&self) -> Result<(), DriveError>;
}

#[derive(Debug)]
struct LineState<L> {
    link: L,
    selected: Option<u8>,
}

/// A serial line shared by several drives
#[derive(Debug)]
pub struct EcoDriveLine<L> {
    state: Mutex<LineState<L>>,
}

impl EcoDriveLine<TcpStream> {
    /// Open the line through a serial-to-ethernet bridge
    pub fn connect(address: &str, timeout: Duration) -> Result<Self, DriveError> {
        let addr = address.to_socket_addrs()?.next().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, address.to_string())
        })?;
        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        Ok(Self::new(stream))
    }
}

impl<L: Read + Write + Send> EcoDriveLine<L> {
    pub fn new(link: L) -> Self {
        Self {
            state: Mutex::new(LineState {
                link,
                selected: None,
            }),
        }
    }

    /// Run one command on the drive at `address`. Protocol failures are retried
    /// after re-addressing; device errors are not.
    pub fn exchange(&self, address: u8, command: &str) -> Result<String, DriveError> {
        let mut state = self.state.lock();
        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 || state.selected != Some(address) {
                state.selected = None;
                if let Err(e) = transact(&mut state.link, address, &format!("BCD:{address}")) {
                    spdlog::debug!("Addressing drive {address} failed (attempt {}): {e}", attempt + 1);
                    continue;
                }
                state.selected = Some(address);
            }
            match transact(&mut state.link, address, command) {
                Ok(value) => return Ok(value),
                Err(e @ DriveError::DeviceError(_, _)) => return Err(e),
                Err(e) => {
                    spdlog::debug!("Drive {address} exchange {command:?} failed (attempt {}): {e}", attempt + 1);
                    state.selected = None;
                }
            }
        }
        Err(DriveError::Unresponsive(address, MAX_ATTEMPTS))
    }

    pub fn read_parameter(&self, address: u8, idn: &str) -> Result<String, DriveError> {
        self.exchange(address, &format!("{idn},7,R"))
    }

    pub fn write_parameter(&self, address: u8, idn: &str, value: &str) -> Result<(), DriveError> {
        self.exchange(address, &format!("{idn},7,W,{value}")).map(|_| ())
    }
}

fn prompt(address: u8) -> String {
    format!("A{address:02}:>")
}

/// Send one command and collect the reply up to the prompt
fn transact<L: Read + Write>(link: &mut L, address: u8, command: &str) -> Result<String, DriveError> {
    link.write_all(format!("{command}\r").as_bytes())?;
    link.flush()?;

    let mut reply: Vec<u8> = Vec::new();
    let mut byte = [0u8; 1];
    while !reply.ends_with(b":>") {
        link.read_exact(&mut byte)?;
        reply.push(byte[0]);
        if reply.len() > MAX_REPLY_LEN {
            return Err(DriveError::Protocol(
                address,
                String::from_utf8_lossy(&reply).to_string(),
            ));
        }
    }
    parse_reply(address, command, &String::from_utf8_lossy(&reply))
}

/// Split a reply into echo, value and prompt
fn parse_reply(address: u8, command: &str, reply: &str) -> Result<String, DriveError> {
    let lines: Vec<&str> = reply
        .split(['\r', '\n'])
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    if let Some(code) = lines.iter().find(|l| l.starts_with('#')) {
        return Err(DriveError::DeviceError(address, code.to_string()));
    }
    match lines.as_slice() {
        [echo, rest @ .., last] if *echo == command && *last == prompt(address) => {
            Ok(rest.join(" "))
        }
        _ => Err(DriveError::Protocol(address, reply.to_string())),
    }
}

fn parse_number(address: u8, text: &str) -> Result<f64, DriveError> {
    text.split_whitespace()
        .next()
        .and_then(|t| t.parse().ok())
        .ok_or_else(|| DriveError::Protocol(address, text.to_string()))
}

/// One drive on an [`EcoDriveLine`]
#[derive(Debug)]
pub struct EcoDrive<L> {
    line: Arc<EcoDriveLine<L>>,
    address: u8,
}

impl<L> EcoDrive<L> {
    pub fn new(line: Arc<EcoDriveLine<L>>, address: u8) -> Self {
        Self { line, address }
    }
}

impl<L: Read + Write + Send> EcoDrive<L> {
    fn read_number(&self, idn: &str) -> Result<f64, DriveError> {
        parse_number(self.address, &self.line.read_parameter(self.address, idn)?)
    }
}

impl<L: Read + Write + Send> Drive for EcoDrive<L> {
    fn address(&self) -> u8 {
        self.address
    }

    fn get_encoder_position(&self) -> Result<f64, DriveError> {
        self.read_number(ENCODER_POSITION)
    }

    fn get_resolver_position(&self) -> Result<f64, DriveError> {
        self.read_number(RESOLVER_POSITION)
    }

    fn get_target_position(&self) -> Result<f64, DriveError> {
        self.read_number(TARGET_POSITION)
    }

    fn set_target_position(&self, position: f64) -> Result<(), DriveError> {
        self.line
            .write_parameter(self.address, TARGET_POSITION, &format!("{position:.4}"))
    }

    fn get_max_velocity(&self) -> Result<f64, DriveError> {
        self.read_number(MAX_VELOCITY)
    }

    fn get_target_velocity(&self) -> Result<f64, DriveError> {
        self.read_number(TARGET_VELOCITY)
    }

    fn set_target_velocity(&self, velocity: f64) -> Result<(), DriveError> {
        self.line
            .write_parameter(self.address, TARGET_VELOCITY, &format!("{velocity:.4}"))
    }

    fn get_diagnostic_code(&self) -> Result<String, DriveError> {
        let code = self.line.read_parameter(self.address, DIAGNOSTIC_CODE)?;
        Ok(normalize_diagnostic(&code))
    }

    fn get_halten_status(&self) -> Result<bool, DriveError> {
        Ok(self.read_number(HALTEN_STATUS)? != 0.0)
    }

    fn clear_error(&self) -> Result<(), DriveError> {
        self.line.write_parameter(self.address, CLEAR_ERROR, "1")
    }
}

//Unit tests
#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io::{Error, ErrorKind};

    /// A scripted drive: answers each `\r` terminated command through `respond`
    struct ScriptedLine {
        input: Vec<u8>,
        output: VecDeque<u8>,
        selected: u8,
        target: f64,
        /// Number of commands to ignore, to exercise the retry
        drop_next: usize,
        commands: Vec<String>,
    }

    impl ScriptedLine {
        fn new() -> Self {
            Self {
                input: Vec::new(),
                output: VecDeque::new(),
                selected: 0,
                target: 22.0,
                drop_next: 0,
                commands: Vec::new(),
            }
        }

        fn respond(&mut self, command: &str) {
            self.commands.push(command.to_string());
            if self.drop_next > 0 {
                self.drop_next -= 1;
                return;
            }
            let mut reply = format!("{command}\r\n");
            if let Some(n) = command.strip_prefix("BCD:") {
                self.selected = n.parse().unwrap();
            } else if command == format!("{TARGET_POSITION},7,R") {
                reply.push_str(&format!("{:.4} mm\r\n", self.target));
            } else if let Some(v) = command.strip_prefix(&format!("{TARGET_POSITION},7,W,")) {
                self.target = v.parse().unwrap();
            } else if command == format!("{DIAGNOSTIC_CODE},7,R") {
                reply.push_str(" a211\r\n");
            } else {
                reply.push_str("#07004\r\n");
            }
            reply.push_str(&format!("A{:02}:>", self.selected));
            self.output.extend(reply.as_bytes());
        }
    }

    impl Write for ScriptedLine {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            for b in buf {
                if *b == b'\r' {
                    let command = String::from_utf8(std::mem::take(&mut self.input)).unwrap();
                    self.respond(&command);
                } else {
                    self.input.push(*b);
                }
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Read for ScriptedLine {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            match self.output.pop_front() {
                Some(b) => {
                    buf[0] = b;
                    Ok(1)
                }
                None => Err(Error::new(ErrorKind::TimedOut, "no reply")),
            }
        }
    }

    #[test]
    fn test_read_and_write_target() {
        let line = Arc::new(EcoDriveLine::new(ScriptedLine::new()));
        let drive = EcoDrive::new(line.clone(), 1);
        assert_eq!(drive.get_target_position().unwrap(), 22.0);
        drive.set_target_position(42.0).unwrap();
        assert_eq!(drive.get_target_position().unwrap(), 42.0);
        assert_eq!(drive.get_diagnostic_code().unwrap(), READY_TO_MOVE);
        // Addressed only once while the same drive is used
        let state = line.state.lock();
        let selections = state
            .link
            .commands
            .iter()
            .filter(|c| c.starts_with("BCD:"))
            .count();
        assert_eq!(selections, 1);
    }

    #[test]
    fn test_lost_reply_is_retried_after_readdressing() {
        let mut scripted = ScriptedLine::new();
        scripted.drop_next = 2;
        let line = Arc::new(EcoDriveLine::new(scripted));
        let drive = EcoDrive::new(line.clone(), 2);
        assert_eq!(drive.get_target_position().unwrap(), 22.0);
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let mut scripted = ScriptedLine::new();
        scripted.drop_next = 100;
        let drive = EcoDrive::new(Arc::new(EcoDriveLine::new(scripted)), 3);
        assert!(matches!(
            drive.get_target_position(),
            Err(DriveError::Unresponsive(3, MAX_ATTEMPTS))
        ));
    }

    #[test]
    fn test_device_error_is_not_retried() {
        let line = Arc::new(EcoDriveLine::new(ScriptedLine::new()));
        let drive = EcoDrive::new(line.clone(), 1);
        assert!(matches!(
            drive.get_encoder_position(),
            Err(DriveError::DeviceError(1, _))
        ));
        let state = line.state.lock();
        assert_eq!(state.link.commands.len(), 2);
    }

    #[test]
    fn test_diagnostic_normalization() {
        assert_eq!(normalize_diagnostic(" a211 "), "A211");
        assert!(is_clearable_fault("f2026"));
        assert!(!is_clearable_fault("A012"));
    }
}
