//! Host platform detection
//!
//! The bundled flashing tool and the serial reset command both differ
//! between macOS, other POSIX systems and Windows.

use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Darwin,
    Posix,
    Windows,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(target_os = "macos") {
            Platform::Darwin
        } else if cfg!(windows) {
            Platform::Windows
        } else {
            Platform::Posix
        }
    }

    /// Subdirectory of the resources directory holding the bundled tools
    pub fn tools_dir(self, resources_dir: &Path) -> PathBuf {
        let child = match self {
            Platform::Darwin => "tools-darwin",
            Platform::Posix => "tools-linux",
            Platform::Windows => "tools-win",
        };
        resources_dir.join(child)
    }

    /// Name the flashing tool expects for `--port`
    ///
    /// POSIX device paths are reduced to their last component
    /// (`/dev/ttyACM0` -> `ttyACM0`); Windows port names are used as-is.
    pub fn short_device_name(self, device: &str) -> &str {
        match self {
            Platform::Windows => device,
            Platform::Darwin | Platform::Posix => device
                .rsplit_once('/')
                .map(|(_, name)| name)
                .unwrap_or(device),
        }
    }

    /// Shell command that sets the device's baud rate
    pub fn baud_command(self, device: &str, baud: u32) -> String {
        match self {
            Platform::Darwin => format!("stty -f {} {}", device, baud),
            Platform::Posix => format!("stty -F {} {}", device, baud),
            Platform::Windows => format!("MODE {}:BAUD={} PARITY=N DATA=8", device, baud),
        }
    }

    /// Program and flag used to run a command line through the shell
    pub fn shell(self) -> (&'static str, &'static str) {
        match self {
            Platform::Windows => ("cmd", "/C"),
            Platform::Darwin | Platform::Posix => ("sh", "-c"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_device_name() {
        assert_eq!(Platform::Posix.short_device_name("/dev/ttyACM0"), "ttyACM0");
        assert_eq!(
            Platform::Darwin.short_device_name("/dev/cu.usbmodem1411"),
            "cu.usbmodem1411"
        );
        assert_eq!(Platform::Posix.short_device_name("ttyACM0"), "ttyACM0");
        assert_eq!(Platform::Windows.short_device_name("COM7"), "COM7");
    }

    #[test]
    fn test_baud_command() {
        assert_eq!(
            Platform::Posix.baud_command("/dev/ttyACM0", 1200),
            "stty -F /dev/ttyACM0 1200"
        );
        assert_eq!(
            Platform::Darwin.baud_command("/dev/cu.usbmodem1", 1200),
            "stty -f /dev/cu.usbmodem1 1200"
        );
        assert_eq!(
            Platform::Windows.baud_command("COM3", 1200),
            "MODE COM3:BAUD=1200 PARITY=N DATA=8"
        );
    }

    #[test]
    fn test_tools_dir() {
        let res = Path::new("/res");
        assert_eq!(Platform::Posix.tools_dir(res), PathBuf::from("/res/tools-linux"));
        assert_eq!(Platform::Windows.tools_dir(res), PathBuf::from("/res/tools-win"));
    }
}
