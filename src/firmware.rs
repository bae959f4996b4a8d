//! Per-board firmware descriptor
//!
//! `config-<type>.json` names the latest firmware for a board type: its
//! version date, download URL and local file name.

use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::config::{self, Settings};
use crate::error::{Error, Result};
use crate::utils::is_plain_file_name;
use crate::{log_debug, log_warn};

const MODULE: &str = "firmware";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareInfo {
    /// `YYYY-MM-DD`
    pub version: String,
    /// Download URL
    pub path: String,
    /// Local file name
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FirmwareConfig {
    firmware: FirmwareInfo,
}

/// Parse a `YYYY-MM-DD` version date
pub fn parse_version_date(value: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .map_err(|_| Error::InvalidVersion(value.to_string()))
}

/// True when the catalog firmware is strictly newer than the board's
pub fn needs_update(catalog_version: NaiveDate, board_version: NaiveDate) -> bool {
    catalog_version > board_version
}

#[derive(Debug, Clone)]
pub struct FirmwareDescriptor {
    pub board_config_file_name: String,
    pub local_config_path: PathBuf,
    pub remote_config_url: String,
    resources_dir: PathBuf,
    info: Option<FirmwareInfo>,
}

impl FirmwareDescriptor {
    /// Descriptor for `config_name`; the local cache is read if present
    pub fn new(config_name: &str, resources_dir: &Path, base_url: &str) -> Self {
        let mut descriptor = Self {
            board_config_file_name: config_name.to_string(),
            local_config_path: resources_dir.join(config_name),
            remote_config_url: config::urls::join(base_url, config_name),
            resources_dir: resources_dir.to_path_buf(),
            info: None,
        };
        if descriptor.local_config_path.exists() {
            descriptor.reload();
        }
        descriptor
    }

    pub fn for_board_type(board_type: &str, settings: &Settings) -> Self {
        Self::new(
            &config::urls::board_config_file(board_type),
            &settings.resources_dir,
            &settings.catalog_base_url,
        )
    }

    /// Re-read the local config. Anything unreadable leaves no data, and so
    /// does a firmware name that is not a plain file name.
    pub fn reload(&mut self) {
        self.info = match std::fs::read_to_string(&self.local_config_path)
            .map_err(Error::from)
            .and_then(|content| Ok(serde_json::from_str::<FirmwareConfig>(&content)?))
        {
            Ok(config) if !is_plain_file_name(&config.firmware.name) => {
                log_warn!(
                    MODULE,
                    "{}: refusing firmware name {:?}",
                    self.board_config_file_name,
                    config.firmware.name
                );
                None
            }
            Ok(config) => {
                log_debug!(
                    MODULE,
                    "{}: firmware {} ({})",
                    self.board_config_file_name,
                    config.firmware.name,
                    config.firmware.version
                );
                Some(config.firmware)
            }
            Err(e) => {
                log_warn!(
                    MODULE,
                    "Unusable {}: {}",
                    self.local_config_path.display(),
                    e
                );
                None
            }
        };
    }

    pub fn info(&self) -> Option<&FirmwareInfo> {
        self.info.as_ref()
    }

    /// Catalog firmware version; `None` if there is no data or it is malformed
    pub fn version(&self) -> Option<NaiveDate> {
        let info = self.info.as_ref()?;
        match parse_version_date(&info.version) {
            Ok(date) => Some(date),
            Err(e) => {
                log_warn!(MODULE, "{}: {}", self.board_config_file_name, e);
                None
            }
        }
    }

    pub fn firmware_name(&self) -> Option<&str> {
        self.info.as_ref().map(|info| info.name.as_str())
    }

    pub fn remote_firmware_url(&self) -> Option<&str> {
        self.info.as_ref().map(|info| info.path.as_str())
    }

    pub fn local_firmware(&self) -> Option<PathBuf> {
        self.firmware_name().map(|name| self.resources_dir.join(name))
    }

    pub fn exists_firmware(&self) -> bool {
        self.local_firmware().is_some_and(|path| path.exists())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"{"firmware": {"version": "2023-06-01",
        "path": "https://host/ardupy_wio.bin", "name": "ardupy_wio.bin"}}"#;

    #[test]
    fn test_version_comparison() {
        let catalog = parse_version_date("2022-12-31").unwrap();
        let board = parse_version_date("2023-01-01").unwrap();
        assert!(!needs_update(catalog, board));
        assert!(needs_update(parse_version_date("2023-06-01").unwrap(), board));
        assert!(!needs_update(board, board));
        // same inputs, same answer
        assert_eq!(needs_update(catalog, board), needs_update(catalog, board));
    }

    #[test]
    fn test_parse_version_date_rejects_garbage() {
        assert!(parse_version_date("2023-13-01").is_err());
        assert!(parse_version_date("v1.2").is_err());
        assert!(parse_version_date("").is_err());
    }

    #[test]
    fn test_descriptor_without_cache() {
        let dir = tempfile::tempdir().unwrap();
        let descriptor = FirmwareDescriptor::new("config-wio.json", dir.path(), "https://host/");
        assert_eq!(descriptor.remote_config_url, "https://host/config-wio.json");
        assert!(descriptor.info().is_none());
        assert!(descriptor.version().is_none());
        assert!(!descriptor.exists_firmware());
    }

    #[test]
    fn test_reload_after_download() {
        let dir = tempfile::tempdir().unwrap();
        let mut descriptor = FirmwareDescriptor::new("config-wio.json", dir.path(), "https://host");
        std::fs::write(&descriptor.local_config_path, CONFIG).unwrap();
        descriptor.reload();

        assert_eq!(descriptor.version(), parse_version_date("2023-06-01").ok());
        assert_eq!(descriptor.firmware_name(), Some("ardupy_wio.bin"));
        assert!(!descriptor.exists_firmware());

        std::fs::write(dir.path().join("ardupy_wio.bin"), b"\x00\x01").unwrap();
        assert!(descriptor.exists_firmware());
    }

    #[test]
    fn test_malformed_config_is_no_data() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config-wio.json"), r#"{"firmware": 3}"#).unwrap();
        let descriptor = FirmwareDescriptor::new("config-wio.json", dir.path(), "https://host/");
        assert!(descriptor.info().is_none());
        assert!(descriptor.local_firmware().is_none());
    }

    #[test]
    fn test_firmware_name_outside_resources_is_no_data() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["../../.bashrc", "/etc/passwd", "nested/fw.bin", ""] {
            let config = serde_json::json!({
                "firmware": {"version": "2023-06-01", "path": "https://host/fw.bin", "name": name}
            });
            std::fs::write(dir.path().join("config-wio.json"), config.to_string()).unwrap();
            let descriptor =
                FirmwareDescriptor::new("config-wio.json", dir.path(), "https://host/");
            assert!(descriptor.info().is_none(), "{:?} was accepted", name);
            assert!(descriptor.local_firmware().is_none());
            assert!(!descriptor.exists_firmware());
        }
    }
}
