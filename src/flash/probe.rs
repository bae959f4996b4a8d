//! Serial halt/probe
//!
//! Interrupting the running program and leaving raw mode makes the firmware
//! print its banner, which carries the build date right before
//! [`config::serial::BANNER_MARKER`].

use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

use chrono::NaiveDate;

use crate::config::serial;
use crate::error::Result;
use crate::firmware::parse_version_date;
use crate::{log_debug, log_info, log_warn};

const MODULE: &str = "flash::probe";

/// Opens serial devices; swapped out in tests
pub trait PortOpener: Send + Sync + 'static {
    type Port: Read + Write;

    fn open(&self, device: &str, baud: u32, timeout: Duration) -> Result<Self::Port>;
}

/// Real serial ports via `serialport`
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemPorts;

impl PortOpener for SystemPorts {
    type Port = Box<dyn serialport::SerialPort>;

    fn open(&self, device: &str, baud: u32, timeout: Duration) -> Result<Self::Port> {
        Ok(serialport::new(device, baud).timeout(timeout).open()?)
    }
}

/// Halt the board and capture what it prints
///
/// The open/write/read cycle is tried up to [`serial::PROBE_ATTEMPTS`]
/// times. `None` means the board could not be talked to at all.
pub fn halt_and_probe<O: PortOpener>(
    opener: &O,
    device: &str,
    retry_delay: Duration,
) -> Option<Vec<u8>> {
    for attempt in 1..=serial::PROBE_ATTEMPTS {
        match probe_once(opener, device) {
            Ok(buffer) => {
                log_debug!(
                    MODULE,
                    "Captured {} bytes from {} (attempt {})",
                    buffer.len(),
                    device,
                    attempt
                );
                return Some(buffer);
            }
            Err(e) => {
                log_warn!(
                    MODULE,
                    "Probe of {} failed (attempt {}/{}): {}",
                    device,
                    attempt,
                    serial::PROBE_ATTEMPTS,
                    e
                );
                if attempt < serial::PROBE_ATTEMPTS {
                    std::thread::sleep(retry_delay);
                }
            }
        }
    }

    log_info!(MODULE, "Giving up on {}", device);
    None
}

fn probe_once<O: PortOpener>(opener: &O, device: &str) -> Result<Vec<u8>> {
    let mut port = opener.open(device, serial::PROBE_BAUD, serial::READ_POLL)?;

    port.write_all(&[serial::INTERRUPT])?;
    port.flush()?;
    std::thread::sleep(serial::WRITE_DELAY);
    port.write_all(&[serial::EXIT_RAW])?;
    port.flush()?;
    std::thread::sleep(serial::WRITE_DELAY);

    let mut buffer = Vec::new();
    let mut chunk = [0u8; 64];
    let started = Instant::now();

    while started.elapsed() < serial::READ_WINDOW {
        match port.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > serial::PROBE_BUFFER_CAP {
                    buffer.drain(..buffer.len() - serial::PROBE_BUFFER_KEEP);
                }
            }
            // quiet line: the board has said everything it will say
            Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => {
                break
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(buffer)
}

/// Build date from a probe capture, if it holds a recognizable banner
///
/// Works on arbitrary bytes; anything unrecognizable yields `None`.
pub fn extract_board_version(buffer: &[u8]) -> Option<NaiveDate> {
    let text = String::from_utf8_lossy(buffer);
    let index = text.find(serial::BANNER_MARKER)?;

    let mut tail: Vec<char> = text[..index]
        .chars()
        .rev()
        .take(serial::VERSION_LEN)
        .collect();
    if tail.len() < serial::VERSION_LEN {
        return None;
    }
    tail.reverse();
    let version: String = tail.into_iter().collect();

    match parse_version_date(&version) {
        Ok(date) => Some(date),
        Err(e) => {
            log_warn!(MODULE, "Banner found but {}", e);
            None
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// One scripted port: bytes to hand out in reads, then time out
    pub(crate) struct FakePort {
        reads: VecDeque<Vec<u8>>,
        pub(crate) written: Arc<Mutex<Vec<u8>>>,
    }

    impl Read for FakePort {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.reads.pop_front() {
                Some(data) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    if n < data.len() {
                        self.reads.push_front(data[n..].to_vec());
                    }
                    Ok(n)
                }
                None => Err(io::ErrorKind::TimedOut.into()),
            }
        }
    }

    impl Write for FakePort {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Fails the first `failures` opens, then serves `output`
    pub(crate) struct FakePorts {
        failures: Mutex<u32>,
        output: Vec<Vec<u8>>,
        pub(crate) opens: Mutex<u32>,
        pub(crate) written: Arc<Mutex<Vec<u8>>>,
    }

    impl FakePorts {
        pub(crate) fn new(failures: u32, output: Vec<Vec<u8>>) -> Self {
            Self {
                failures: Mutex::new(failures),
                output,
                opens: Mutex::new(0),
                written: Arc::new(Mutex::new(Vec::new())),
            }
        }

        pub(crate) fn banner(date: &str) -> Vec<Vec<u8>> {
            vec![format!("\r\nMicroPython {}{} wio terminal\r\n>>> ", date, serial::BANNER_MARKER)
                .into_bytes()]
        }
    }

    impl PortOpener for FakePorts {
        type Port = FakePort;

        fn open(&self, device: &str, baud: u32, _timeout: Duration) -> Result<FakePort> {
            assert_eq!(baud, serial::PROBE_BAUD);
            *self.opens.lock().unwrap() += 1;
            let mut failures = self.failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(io::Error::new(io::ErrorKind::NotFound, device.to_string()).into());
            }
            Ok(FakePort {
                reads: self.output.iter().cloned().collect(),
                written: Arc::clone(&self.written),
            })
        }
    }

    #[test]
    fn test_probe_reads_banner() {
        let ports = FakePorts::new(0, FakePorts::banner("2023-01-01"));
        let buffer = halt_and_probe(&ports, "/dev/ttyACM0", Duration::ZERO).unwrap();
        assert_eq!(
            extract_board_version(&buffer),
            parse_version_date("2023-01-01").ok()
        );
        assert_eq!(*ports.written.lock().unwrap(), vec![0x03, 0x02]);
    }

    #[test]
    fn test_probe_retries_then_gives_up() {
        let ports = FakePorts::new(5, Vec::new());
        assert!(halt_and_probe(&ports, "/dev/ttyACM0", Duration::ZERO).is_none());
        assert_eq!(*ports.opens.lock().unwrap(), serial::PROBE_ATTEMPTS);

        let ports = FakePorts::new(2, FakePorts::banner("2023-01-01"));
        assert!(halt_and_probe(&ports, "/dev/ttyACM0", Duration::ZERO).is_some());
        assert_eq!(*ports.opens.lock().unwrap(), 3);
    }

    #[test]
    fn test_probe_buffer_is_capped() {
        let noise = vec![b'x'; 250];
        let ports = FakePorts::new(0, vec![noise.clone(), noise]);
        let buffer = halt_and_probe(&ports, "COM3", Duration::ZERO).unwrap();
        assert!(buffer.len() <= serial::PROBE_BUFFER_CAP);
    }

    #[test]
    fn test_extract_board_version() {
        let text = format!("boot 2023-01-01{}, 2023", serial::BANNER_MARKER);
        assert_eq!(
            extract_board_version(text.as_bytes()),
            parse_version_date("2023-01-01").ok()
        );
    }

    #[test]
    fn test_extract_never_panics_on_garbage() {
        assert_eq!(extract_board_version(b""), None);
        assert_eq!(extract_board_version(&[0xff, 0xfe, 0x00, 0x80]), None);
        assert_eq!(extract_board_version(b"MicroPython v1.12 on 2020"), None);
        // marker with too little in front of it
        let short = format!("01-01{}", serial::BANNER_MARKER);
        assert_eq!(extract_board_version(short.as_bytes()), None);
        // multi-byte characters right before the marker
        let wide = format!("ééééééééééé{}", serial::BANNER_MARKER);
        assert_eq!(extract_board_version(wide.as_bytes()), None);
        // marker preceded by garbage bytes
        let mut bytes = vec![0xffu8; 12];
        bytes.extend_from_slice(serial::BANNER_MARKER.as_bytes());
        assert_eq!(extract_board_version(&bytes), None);
    }
}
