//! Library bundles
//!
//! The remote manifest lists every library bundle with its version date.
//! Planning compares it against what the catalog records as installed and
//! what is actually cached in the resources directory.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::catalog::LibraryEntry;
use crate::error::Result;
use crate::firmware::parse_version_date;
use crate::utils::{is_plain_file_name, strip_archive_ext};
use crate::{log_debug, log_warn};

const MODULE: &str = "library";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LibraryAction {
    /// Not recorded locally
    Install,
    /// Remote version date is strictly newer
    Update,
    /// Recorded, but the archive is gone from the resources directory
    Restore,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedUpdate {
    pub entry: LibraryEntry,
    pub action: LibraryAction,
}

impl PlannedUpdate {
    /// Status line shown while the bundle is fetched
    pub fn status(&self) -> String {
        match self.action {
            LibraryAction::Update => {
                format!("updating {}, please wait patiently", self.entry.name)
            }
            LibraryAction::Install | LibraryAction::Restore => {
                format!("downloading {}, please wait patiently", self.entry.name)
            }
        }
    }
}

/// Read the downloaded manifest (a JSON array of library entries)
pub fn load_manifest(path: &Path) -> Result<Vec<LibraryEntry>> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

/// Local cache path of a bundle archive
pub fn archive_path(resources_dir: &Path, entry: &LibraryEntry) -> PathBuf {
    resources_dir.join(&entry.name)
}

/// Workspace directory a bundle unpacks into
pub fn workspace_target(workspace_dir: &Path, entry: &LibraryEntry) -> PathBuf {
    workspace_dir.join(strip_archive_ext(&entry.name))
}

/// Decide which manifest entries need fetching, in manifest order
///
/// Entries whose name is not a plain file name are skipped: the name is
/// joined onto both the resources and the workspace directory.
pub fn plan_updates(
    manifest: &[LibraryEntry],
    installed: &BTreeMap<String, String>,
    resources_dir: &Path,
) -> Vec<PlannedUpdate> {
    let mut planned = Vec::new();

    for entry in manifest {
        if !is_plain_file_name(&entry.name) {
            log_warn!(MODULE, "Skipping library with unsafe name {:?}", entry.name);
            continue;
        }
        let remote = match parse_version_date(&entry.version) {
            Ok(date) => date,
            Err(e) => {
                log_warn!(MODULE, "Skipping {}: {}", entry.name, e);
                continue;
            }
        };

        let action = match installed.get(&entry.name) {
            None => Some(LibraryAction::Install),
            Some(local) => match parse_version_date(local) {
                Ok(local) if remote > local => Some(LibraryAction::Update),
                Ok(_) if !archive_path(resources_dir, entry).exists() => {
                    Some(LibraryAction::Restore)
                }
                Ok(_) => None,
                Err(_) => {
                    log_warn!(
                        MODULE,
                        "{} has unreadable local version {:?}, refreshing",
                        entry.name,
                        local
                    );
                    Some(LibraryAction::Update)
                }
            },
        };

        match action {
            Some(action) => {
                log_debug!(MODULE, "{}: {:?}", entry.name, action);
                planned.push(PlannedUpdate {
                    entry: entry.clone(),
                    action,
                });
            }
            None => log_debug!(MODULE, "{} is up to date", entry.name),
        }
    }

    planned
}
