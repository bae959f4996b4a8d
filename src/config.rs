//! Application configuration
//!
//! Compile-time constants live in the nested modules; the runtime
//! [`Settings`] are read from a JSON file and fall back to defaults for
//! anything missing.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{log_debug, log_info, log_warn};

const MODULE: &str = "config";

pub mod app {
    pub const NAME: &str = "ardupy-updater";
    pub const USER_AGENT: &str = concat!("ArduPy-Updater/", env!("CARGO_PKG_VERSION"));
    /// Environment variable that points at an alternative settings file
    pub const SETTINGS_ENV: &str = "ARDUPY_UPDATER_SETTINGS";
}

pub mod urls {
    pub const CATALOG_BASE: &str = "https://seeed-studio.github.io/ArduPy/";
    pub const CATALOG_FILE: &str = "info.json";
    /// Remote library manifest (the published name is misspelled)
    pub const LIBRARY_MANIFEST_FILE: &str = "libaray.json";

    /// `config-<board type>.json`
    pub fn board_config_file(board_type: &str) -> String {
        format!("config-{}.json", board_type)
    }

    /// Join a file name onto a base URL, tolerating a missing trailing slash
    pub fn join(base: &str, name: &str) -> String {
        if base.ends_with('/') {
            format!("{}{}", base, name)
        } else {
            format!("{}/{}", base, name)
        }
    }
}

pub mod download {
    use std::time::Duration;

    /// Read size used for archive extraction
    pub const CHUNK_SIZE: usize = 16 * 1024;
    pub const ARCHIVE_BUFFER_SIZE: usize = 64 * 1024;
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
    /// Per-board config files get a shorter request timer
    pub const CONFIG_REQUEST_TIMEOUT: Duration = Duration::from_secs(3);
    pub const MAX_ATTEMPTS: u32 = 3;
    pub const BACKUP_SUFFIX: &str = "bak";
}

pub mod serial {
    use std::time::Duration;

    pub const PROBE_BAUD: u32 = 115_200;
    /// Opening the port at 1200 baud makes the board reboot into its bootloader
    pub const BOOTLOADER_BAUD: u32 = 1200;
    /// Ctrl-C: interrupt whatever the REPL is running
    pub const INTERRUPT: u8 = 0x03;
    /// Ctrl-B: leave raw REPL, which prints the firmware banner
    pub const EXIT_RAW: u8 = 0x02;
    pub const WRITE_DELAY: Duration = Duration::from_millis(50);
    pub const READ_POLL: Duration = Duration::from_millis(200);
    pub const READ_WINDOW: Duration = Duration::from_secs(1);
    pub const PROBE_ATTEMPTS: u32 = 3;
    pub const PROBE_BUFFER_CAP: usize = 300;
    pub const PROBE_BUFFER_KEEP: usize = 200;
    pub const BANNER_MARKER: &str = "; Ardupy with seeed";
    pub const VERSION_LEN: usize = 10;
}

pub mod flash {
    pub const TOOL_NAME: &str = "bossac";
    /// Used when the catalog does not ship a template of its own
    pub const DEFAULT_TEMPLATE: &str = r#"-i -d --port=%s -U true -i -e -w -v "%s" -R"#;
}

pub mod logging {
    /// Log download progress every N MB
    pub const DOWNLOAD_LOG_INTERVAL_MB: u64 = 1;
}

pub mod status {
    use std::time::Duration;

    pub const SHORT: Duration = Duration::from_secs(5);
    /// "Always" in practice: until the next status replaces it
    pub const PERSISTENT: Duration = Duration::from_secs(1000 * 1000);
}

/// Runtime settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Catalog, library manifest, board configs, firmware and bundled tools
    pub resources_dir: PathBuf,
    /// Where libraries are unpacked for the user
    pub workspace_dir: PathBuf,
    pub catalog_base_url: String,
    pub request_timeout_ms: u64,
    /// 0 disables the stall watchdog
    pub stall_timeout_ms: u64,
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    pub port_scan_interval_ms: u64,
    pub probe_retry_delay_ms: u64,
    /// Unset means wait for the flashing tool indefinitely
    pub flash_timeout_secs: Option<u64>,
    pub developer_mode: bool,
}

impl Default for Settings {
    fn default() -> Self {
        let data_dir = dirs::data_dir().unwrap_or_else(std::env::temp_dir);
        let home_dir = dirs::home_dir().unwrap_or_else(|| data_dir.clone());
        Self {
            resources_dir: data_dir.join(app::NAME).join("seeed"),
            workspace_dir: home_dir.join("mu_code"),
            catalog_base_url: urls::CATALOG_BASE.to_string(),
            request_timeout_ms: download::REQUEST_TIMEOUT.as_millis() as u64,
            stall_timeout_ms: 0,
            max_attempts: download::MAX_ATTEMPTS,
            retry_delay_ms: 0,
            port_scan_interval_ms: 1000,
            probe_retry_delay_ms: 5000,
            flash_timeout_secs: None,
            developer_mode: false,
        }
    }
}

impl Settings {
    /// Default settings file location (`<config dir>/ardupy-updater/settings.json`)
    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var(app::SETTINGS_ENV) {
            return PathBuf::from(path);
        }
        dirs::config_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(app::NAME)
            .join("settings.json")
    }

    /// Load settings, falling back to defaults if the file is missing or bad
    pub fn load(path: &Path) -> Self {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                log_info!(
                    MODULE,
                    "No settings at {} ({}), using defaults",
                    path.display(),
                    e
                );
                return Self::default();
            }
        };

        match serde_json::from_str::<Settings>(&content) {
            Ok(settings) => {
                log_debug!(MODULE, "Loaded settings from {}", path.display());
                settings
            }
            Err(e) => {
                log_warn!(
                    MODULE,
                    "Malformed settings file {}: {}. Using defaults.",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn stall_timeout(&self) -> Option<Duration> {
        (self.stall_timeout_ms > 0).then(|| Duration::from_millis(self.stall_timeout_ms))
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn port_scan_interval(&self) -> Duration {
        Duration::from_millis(self.port_scan_interval_ms)
    }

    pub fn probe_retry_delay(&self) -> Duration {
        Duration::from_millis(self.probe_retry_delay_ms)
    }

    pub fn flash_timeout(&self) -> Option<Duration> {
        self.flash_timeout_secs.map(Duration::from_secs)
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.resources_dir.join(urls::CATALOG_FILE)
    }

    pub fn library_manifest_path(&self) -> PathBuf {
        self.resources_dir.join(urls::LIBRARY_MANIFEST_FILE)
    }

    pub fn catalog_url(&self) -> String {
        urls::join(&self.catalog_base_url, urls::CATALOG_FILE)
    }

    pub fn library_manifest_url(&self) -> String {
        urls::join(&self.catalog_base_url, urls::LIBRARY_MANIFEST_FILE)
    }
}
