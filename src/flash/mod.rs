//! Board operations
//!
//! Flashing is delegated to the bundled `bossac` tool run through the
//! platform shell. Entering the bootloader uses the 1200 baud touch and
//! reading the running firmware's version uses the serial halt/probe.

mod command;
mod probe;

pub use command::{build_command, substitute};
pub use probe::{extract_board_version, halt_and_probe, PortOpener, SystemPorts};

#[cfg(test)]
pub(crate) use probe::tests::FakePorts;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;

use crate::config::{self, Settings};
use crate::error::{Error, Result};
use crate::utils::Platform;
use crate::{log_debug, log_error, log_info, log_warn};

const MODULE: &str = "flash";

/// What the coordinator needs from the hardware side
pub trait BoardOps: Send + Sync {
    /// Halt the board and capture its banner; `None` if it could not be reached
    fn probe(&self, device: &str) -> impl Future<Output = Option<Vec<u8>>> + Send;

    /// Reboot a running board into its bootloader
    fn enter_bootloader(&self, device: &str) -> impl Future<Output = Result<()>> + Send;

    /// Write `firmware` to a board sitting in its bootloader
    fn flash(
        &self,
        template: &str,
        device: &str,
        firmware: &Path,
    ) -> impl Future<Output = Result<()>> + Send;
}

pub struct Flasher<O = SystemPorts> {
    resources_dir: PathBuf,
    platform: Platform,
    timeout: Option<Duration>,
    probe_retry_delay: Duration,
    opener: Arc<O>,
}

impl Flasher<SystemPorts> {
    pub fn new(settings: &Settings) -> Self {
        Self::with_opener(settings, SystemPorts)
    }
}

impl<O: PortOpener> Flasher<O> {
    pub fn with_opener(settings: &Settings, opener: O) -> Self {
        Self {
            resources_dir: settings.resources_dir.clone(),
            platform: Platform::current(),
            timeout: settings.flash_timeout(),
            probe_retry_delay: settings.probe_retry_delay(),
            opener: Arc::new(opener),
        }
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn command_for(&self, template: &str, device: &str, firmware: &Path) -> String {
        build_command(self.platform, &self.resources_dir, template, device, firmware)
    }

    /// Run a command line through the platform shell and wait for it
    async fn run_shell(&self, line: &str, timeout: Option<Duration>) -> Result<()> {
        let (shell, flag) = self.platform.shell();
        log_debug!(MODULE, "Running: {} {} {}", shell, flag, line);

        let mut command = Command::new(shell);
        command.arg(flag);
        #[cfg(windows)]
        command.raw_arg(line);
        #[cfg(not(windows))]
        command.arg(line);

        let mut child = command
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Process(format!("failed to start {}: {}", shell, e)))?;

        let status = match timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(status) => status?,
                Err(_) => {
                    if let Err(e) = child.kill().await {
                        log_warn!(MODULE, "Failed to kill timed out command: {}", e);
                    }
                    return Err(Error::Process(format!(
                        "no exit after {} s",
                        limit.as_secs()
                    )));
                }
            },
            None => child.wait().await?,
        };

        if status.success() {
            Ok(())
        } else {
            Err(Error::Process(format!("exited with {}", status)))
        }
    }
}

impl<O: PortOpener> BoardOps for Flasher<O> {
    async fn probe(&self, device: &str) -> Option<Vec<u8>> {
        let opener = Arc::clone(&self.opener);
        let device = device.to_string();
        let retry_delay = self.probe_retry_delay;

        match tokio::task::spawn_blocking(move || halt_and_probe(&*opener, &device, retry_delay))
            .await
        {
            Ok(buffer) => buffer,
            Err(e) => {
                log_error!(MODULE, "Probe task failed: {}", e);
                None
            }
        }
    }

    async fn enter_bootloader(&self, device: &str) -> Result<()> {
        let line = self
            .platform
            .baud_command(device, config::serial::BOOTLOADER_BAUD);
        log_info!(MODULE, "Resetting {} into bootloader", device);
        self.run_shell(&line, None).await
    }

    async fn flash(&self, template: &str, device: &str, firmware: &Path) -> Result<()> {
        let line = self.command_for(template, device, firmware);
        log_info!(MODULE, "Flashing {} -> {}", firmware.display(), device);

        match self.run_shell(&line, self.timeout).await {
            Ok(()) => {
                log_info!(MODULE, "Flash complete");
                Ok(())
            }
            Err(e) => {
                log_error!(MODULE, "Flash failed: {}", e);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(dir: &Path) -> Settings {
        Settings {
            resources_dir: dir.to_path_buf(),
            probe_retry_delay_ms: 0,
            ..Settings::default()
        }
    }

    #[tokio::test]
    async fn test_probe_runs_off_the_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let flasher = Flasher::with_opener(
            &settings(dir.path()),
            FakePorts::new(1, FakePorts::banner("2021-03-04")),
        );
        let buffer = flasher.probe("/dev/ttyACM0").await.unwrap();
        assert_eq!(
            extract_board_version(&buffer),
            crate::firmware::parse_version_date("2021-03-04").ok()
        );
    }

    #[test]
    fn test_command_uses_catalog_template() {
        let dir = tempfile::tempdir().unwrap();
        let flasher = Flasher::with_opener(&settings(dir.path()), FakePorts::new(0, Vec::new()));
        let line = flasher.command_for("--port=%s '%s'", "/dev/ttyACM1", Path::new("fw.bin"));
        assert!(line.contains(config::flash::TOOL_NAME));
        assert!(line.ends_with("'fw.bin'"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_status_decides_success() {
        let dir = tempfile::tempdir().unwrap();
        let flasher = Flasher::with_opener(&settings(dir.path()), FakePorts::new(0, Vec::new()));
        assert!(flasher.run_shell("true", None).await.is_ok());
        assert!(matches!(
            flasher.run_shell("exit 3", None).await,
            Err(Error::Process(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_optional_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let flasher = Flasher::with_opener(&settings(dir.path()), FakePorts::new(0, Vec::new()));
        let result = flasher
            .run_shell("sleep 5", Some(Duration::from_millis(100)))
            .await;
        assert!(matches!(result, Err(Error::Process(_))));
    }
}
