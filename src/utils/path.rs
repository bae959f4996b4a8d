//! Path utility functions

use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};

/// Archive extensions recognised for library bundles, longest first
const ARCHIVE_EXTS: &[&str] = &[".tar.gz", ".tgz", ".zip"];

/// Strip the archive extension from a library file name
///
/// `seeed_lib.zip` unpacks into `seeed_lib`; names without a known
/// extension are returned unchanged.
pub fn strip_archive_ext(filename: &str) -> &str {
    for ext in ARCHIVE_EXTS {
        if let Some(stripped) = filename.strip_suffix(ext) {
            return stripped;
        }
    }
    filename
}

/// True for a bare file name that stays inside the directory it is joined to
///
/// Names from remote catalogs must be a single normal component, must not
/// carry a separator of either platform, and must keep a non-empty stem
/// once the archive extension is stripped (`.zip` alone would name the
/// parent directory).
pub fn is_plain_file_name(name: &str) -> bool {
    if name.contains(['/', '\\']) || strip_archive_ext(name).is_empty() {
        return false;
    }
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

/// `<path>.<suffix>` next to `path` (e.g. `info.json` -> `info.json.bak`)
pub fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.file_name().map(OsString::from).unwrap_or_default();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}
