//! Board catalog
//!
//! Parses `info.json` into lookup tables: which VID/PID pairs are known
//! boards (in normal or bootloader mode), which config file describes each
//! board, which flash parameters to use, and which libraries are installed.

mod models;

pub use models::{BoardDescriptor, BoardEntry, BoardId, CatalogFile, LibraryEntry};

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use crate::config;
use crate::error::{Error, Result};
use crate::utils::is_plain_file_name;
use crate::{log_debug, log_info, log_warn};

const MODULE: &str = "catalog";

/// Parse a hex id as written in the catalog (`"0x2886"` or `"2886"`)
fn parse_hex_id(value: &str) -> Option<u16> {
    let value = value.trim();
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    u16::from_str_radix(digits, 16).ok()
}

/// Flash templates are stored with single quotes so they fit in JSON strings
fn normalize_template(template: &str) -> String {
    template.replace('\'', "\"")
}

#[derive(Debug, Clone)]
pub struct Catalog {
    normal: HashMap<BoardId, BoardDescriptor>,
    boot: HashMap<BoardId, BoardDescriptor>,
    config_names: HashMap<BoardId, String>,
    flash_templates: HashMap<BoardId, String>,
    default_template: String,
    libraries: BTreeMap<String, String>,
}

impl Default for Catalog {
    fn default() -> Self {
        Self {
            normal: HashMap::new(),
            boot: HashMap::new(),
            config_names: HashMap::new(),
            flash_templates: HashMap::new(),
            default_template: config::flash::DEFAULT_TEMPLATE.to_string(),
            libraries: BTreeMap::new(),
        }
    }
}

impl Catalog {
    pub fn parse(json: &str) -> Result<Self> {
        let file: CatalogFile = serde_json::from_str(json)?;
        Ok(Self::from_file(file))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let catalog = Self::parse(&content)?;
        log_info!(
            MODULE,
            "Loaded {}: {} normal, {} bootloader, {} libraries",
            path.display(),
            catalog.normal.len(),
            catalog.boot.len(),
            catalog.libraries.len()
        );
        Ok(catalog)
    }

    /// Build the tables. Bootloader entries are registered first, and for
    /// every table the first registration of a VID/PID pair wins.
    pub fn from_file(file: CatalogFile) -> Self {
        let mut catalog = Catalog::default();

        if let Some(ref template) = file.flash_param {
            catalog.default_template = normalize_template(template);
        }

        for entry in &file.boot {
            catalog.register(entry, true);
        }
        for entry in &file.normal {
            catalog.register(entry, false);
        }
        for lib in file.lib {
            catalog.libraries.entry(lib.name).or_insert(lib.version);
        }

        catalog
    }

    fn register(&mut self, entry: &BoardEntry, bootloader: bool) {
        let id = match entry.pvid.as_slice() {
            [vid, pid] => match (parse_hex_id(vid), parse_hex_id(pid)) {
                (Some(vid), Some(pid)) => BoardId::new(vid, pid),
                _ => {
                    log_warn!(
                        MODULE,
                        "Skipping {} with malformed pvid {:?}",
                        entry.board_type,
                        entry.pvid
                    );
                    return;
                }
            },
            _ => {
                log_warn!(
                    MODULE,
                    "Skipping {}: pvid must hold two ids, got {:?}",
                    entry.board_type,
                    entry.pvid
                );
                return;
            }
        };

        let config_name = config::urls::board_config_file(&entry.board_type);
        if !is_plain_file_name(&config_name) {
            log_warn!(
                MODULE,
                "Skipping board with unsafe type {:?}",
                entry.board_type
            );
            return;
        }

        let template = entry.flash_param.as_deref().map(normalize_template);
        let descriptor = BoardDescriptor {
            id,
            board_type: entry.board_type.clone(),
            is_bootloader_variant: bootloader,
            flash_template: template.clone(),
        };

        self.config_names.entry(id).or_insert(config_name);
        if let Some(template) = template {
            self.flash_templates.entry(id).or_insert(template);
        }

        let table = if bootloader {
            &mut self.boot
        } else {
            &mut self.normal
        };
        table.entry(id).or_insert(descriptor);
    }

    /// Look a board up, normal-mode table first
    pub fn resolve(&self, id: BoardId) -> Option<&BoardDescriptor> {
        self.normal.get(&id).or_else(|| self.boot.get(&id))
    }

    pub fn is_normal(&self, id: BoardId) -> bool {
        self.normal.contains_key(&id)
    }

    pub fn is_bootloader(&self, id: BoardId) -> bool {
        self.boot.contains_key(&id)
    }

    /// `config-<type>.json` for the board
    pub fn config_name(&self, id: BoardId) -> Option<&str> {
        self.config_names.get(&id).map(String::as_str)
    }

    /// Board type as used in the config file name
    pub fn board_type(&self, id: BoardId) -> Option<&str> {
        self.config_name(id)
            .and_then(|name| name.strip_prefix("config-"))
            .and_then(|name| name.strip_suffix(".json"))
    }

    /// Flash parameters for the board, or the catalog default
    pub fn flash_template(&self, id: BoardId) -> &str {
        self.flash_templates
            .get(&id)
            .map(String::as_str)
            .unwrap_or(&self.default_template)
    }

    pub fn installed_libraries(&self) -> &BTreeMap<String, String> {
        &self.libraries
    }

    pub fn installed_version(&self, name: &str) -> Option<&str> {
        self.libraries.get(name).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.normal.is_empty() && self.boot.is_empty()
    }
}

/// The catalog as shared between the detector and the coordinator
///
/// Readers take a cheap snapshot; a reload swaps the whole catalog at once.
#[derive(Debug, Clone)]
pub struct SharedCatalog {
    path: PathBuf,
    current: Arc<RwLock<Arc<Catalog>>>,
}

impl SharedCatalog {
    /// Load from `path`; a missing or malformed file gives an empty catalog
    pub fn open(path: &Path) -> Self {
        let catalog = match Catalog::load(path) {
            Ok(catalog) => catalog,
            Err(e) => {
                log_warn!(
                    MODULE,
                    "No usable catalog at {} ({}), starting empty",
                    path.display(),
                    e
                );
                Catalog::default()
            }
        };
        Self::with_catalog(path, catalog)
    }

    pub fn with_catalog(path: &Path, catalog: Catalog) -> Self {
        Self {
            path: path.to_path_buf(),
            current: Arc::new(RwLock::new(Arc::new(catalog))),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> Arc<Catalog> {
        let guard = self.current.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    /// Re-read the file. On error the previous catalog stays in place.
    pub fn reload(&self) -> Result<()> {
        let catalog = Catalog::load(&self.path)?;
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        *guard = Arc::new(catalog);
        Ok(())
    }

    /// Library table of the file on disk, as this host recorded it
    ///
    /// A missing or unreadable file gives an empty table.
    pub fn local_libraries(&self) -> Vec<LibraryEntry> {
        match read_library_table(&self.path) {
            Ok((_, libs)) => libs,
            Err(e) => {
                log_debug!(
                    MODULE,
                    "No library table in {}: {}",
                    self.path.display(),
                    e
                );
                Vec::new()
            }
        }
    }

    /// Record freshly installed libraries in `info.json` and reload
    ///
    /// Entries replace those with the same name; every other key of the file
    /// is written back untouched.
    pub fn record_libraries(&self, installed: &[LibraryEntry]) -> Result<()> {
        self.rewrite_libraries(|libs| {
            for entry in installed {
                match libs.iter_mut().find(|lib| lib.name == entry.name) {
                    Some(existing) => *existing = entry.clone(),
                    None => libs.push(entry.clone()),
                }
            }
        })?;
        log_debug!(
            MODULE,
            "Recorded {} library update(s) in {}",
            installed.len(),
            self.path.display()
        );
        self.reload()
    }

    /// Put a previously read library table back into `info.json` and reload
    ///
    /// Used after the file was replaced by a downloaded copy, whose `lib`
    /// table describes the server rather than this host.
    pub fn restore_libraries(&self, libs: &[LibraryEntry]) -> Result<()> {
        self.rewrite_libraries(|table| *table = libs.to_vec())?;
        log_debug!(
            MODULE,
            "Restored {} installed library record(s) in {}",
            libs.len(),
            self.path.display()
        );
        self.reload()
    }

    fn rewrite_libraries(&self, update: impl FnOnce(&mut Vec<LibraryEntry>)) -> Result<()> {
        let (mut root, mut libs) = match read_library_table(&self.path) {
            Ok(table) => table,
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                (serde_json::json!({}), Vec::new())
            }
            Err(e) => return Err(e),
        };

        update(&mut libs);

        if let Some(object) = root.as_object_mut() {
            object.insert("lib".to_string(), serde_json::to_value(&libs)?);
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(&root)?)?;
        Ok(())
    }
}

/// The whole file as JSON plus its parsed `lib` table
fn read_library_table(path: &Path) -> Result<(serde_json::Value, Vec<LibraryEntry>)> {
    let root: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(path)?)?;
    let libs = root
        .get("lib")
        .cloned()
        .map(serde_json::from_value)
        .transpose()?
        .unwrap_or_default();
    Ok((root, libs))
}
