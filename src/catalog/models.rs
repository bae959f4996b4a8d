//! Catalog data models
//!
//! Shapes of `info.json` and the remote library manifest.

use std::fmt;

use serde::{Deserialize, Serialize};

/// USB vendor/product pair identifying a board in one of its modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BoardId {
    pub vendor_id: u16,
    pub product_id: u16,
}

impl BoardId {
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
        }
    }
}

impl fmt::Display for BoardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.vendor_id, self.product_id)
    }
}

/// A known board as described by the catalog
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardDescriptor {
    pub id: BoardId,
    pub board_type: String,
    pub is_bootloader_variant: bool,
    pub flash_template: Option<String>,
}

/// Raw `boot` / `normal` entry of `info.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardEntry {
    #[serde(rename = "type")]
    pub board_type: String,
    /// Hex strings, vendor first (`["0x2886", "0x0018"]`)
    pub pvid: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flash_param: Option<String>,
}

/// A library bundle: name doubles as the archive file name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryEntry {
    pub name: String,
    /// `YYYY-MM-DD`
    pub version: String,
    /// Download URL of the archive
    pub path: String,
}

/// Raw `info.json`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogFile {
    #[serde(default)]
    pub boot: Vec<BoardEntry>,
    #[serde(default)]
    pub normal: Vec<BoardEntry>,
    #[serde(default)]
    pub lib: Vec<LibraryEntry>,
    /// Fallback flash parameter template
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flash_param: Option<String>,
}
