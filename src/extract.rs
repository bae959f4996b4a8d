//! Archive extraction
//!
//! Unpacks library bundles (zip, or gzip'd tar) into the workspace. Files
//! are unpacked into a staging directory first, which replaces the target
//! only once every entry was written.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use flate2::read::GzDecoder;
use zip::ZipArchive;

use crate::config;
use crate::error::{Error, Result};
use crate::utils::sibling_with_suffix;
use crate::{log_debug, log_info, log_warn};

const MODULE: &str = "extract";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    TarGz,
}

impl ArchiveKind {
    pub fn detect(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?.to_lowercase();
        if name.ends_with(".zip") {
            Some(ArchiveKind::Zip)
        } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(ArchiveKind::TarGz)
        } else {
            None
        }
    }
}

/// Extract `archive` into `target`, replacing whatever was there
///
/// On error nothing is left behind: the staging directory is removed and
/// `target` is untouched.
pub fn extract_archive(archive: &Path, target: &Path) -> Result<()> {
    let kind = ArchiveKind::detect(archive)
        .ok_or_else(|| Error::UnsupportedArchive(archive.display().to_string()))?;

    let staging = sibling_with_suffix(target, "extracting");
    if staging.exists() {
        std::fs::remove_dir_all(&staging)?;
    }
    std::fs::create_dir_all(&staging)?;

    log_info!(
        MODULE,
        "Extracting {} ({:?}) -> {}",
        archive.display(),
        kind,
        target.display()
    );

    let result = match kind {
        ArchiveKind::Zip => extract_zip(archive, &staging),
        ArchiveKind::TarGz => extract_tar_gz(archive, &staging),
    };

    if let Err(e) = result {
        log_warn!(MODULE, "Extraction of {} failed: {}", archive.display(), e);
        if let Err(cleanup) = std::fs::remove_dir_all(&staging) {
            log_warn!(
                MODULE,
                "Failed to remove {}: {}",
                staging.display(),
                cleanup
            );
        }
        return Err(e);
    }

    if target.exists() {
        std::fs::remove_dir_all(target)?;
    }
    std::fs::rename(&staging, target)?;
    log_info!(MODULE, "Extraction complete: {}", target.display());
    Ok(())
}

fn extract_zip(archive: &Path, dest: &Path) -> Result<()> {
    let file = File::open(archive)?;
    let reader = BufReader::with_capacity(config::download::ARCHIVE_BUFFER_SIZE, file);
    let mut zip = ZipArchive::new(reader)?;

    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        // Entries escaping the destination are rejected by enclosed_name
        let Some(relative) = entry.enclosed_name() else {
            log_warn!(MODULE, "Skipping unsafe entry {}", entry.name());
            continue;
        };
        let out_path = dest.join(relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        copy_entry(&mut entry, &out_path)?;
        log_debug!(MODULE, "  {}", out_path.display());
    }

    Ok(())
}

fn extract_tar_gz(archive: &Path, dest: &Path) -> Result<()> {
    let file = File::open(archive)?;
    let reader = BufReader::with_capacity(config::download::ARCHIVE_BUFFER_SIZE, file);
    let mut tar = tar::Archive::new(GzDecoder::new(reader));
    // unpack() refuses entries with `..` or absolute paths
    tar.unpack(dest)?;
    Ok(())
}

fn copy_entry<R: Read>(reader: &mut R, out_path: &Path) -> Result<()> {
    let out = File::create(out_path)?;
    let mut writer = BufWriter::with_capacity(config::download::ARCHIVE_BUFFER_SIZE, out);
    let mut buffer = vec![0u8; config::download::CHUNK_SIZE];

    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        writer.write_all(&buffer[..read])?;
    }

    writer.flush()?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use zip::write::SimpleFileOptions;

    pub(crate) fn write_zip(path: &Path, files: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        for (name, content) in files {
            zip.start_file(*name, SimpleFileOptions::default()).unwrap();
            zip.write_all(content).unwrap();
        }
        zip.finish().unwrap();
    }

    #[test]
    fn test_detect_kind() {
        assert_eq!(ArchiveKind::detect(Path::new("a/lib.zip")), Some(ArchiveKind::Zip));
        assert_eq!(ArchiveKind::detect(Path::new("lib.tar.gz")), Some(ArchiveKind::TarGz));
        assert_eq!(ArchiveKind::detect(Path::new("lib.TGZ")), Some(ArchiveKind::TarGz));
        assert_eq!(ArchiveKind::detect(Path::new("lib.rar")), None);
    }

    #[test]
    fn test_extract_zip_replaces_target() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("seeed_lib.zip");
        write_zip(&archive, &[("main.py", b"print(1)"), ("drivers/lcd.py", b"lcd")]);

        let target = dir.path().join("workspace").join("seeed_lib");
        std::fs::create_dir_all(&target).unwrap();
        std::fs::write(target.join("stale.py"), b"old").unwrap();

        extract_archive(&archive, &target).unwrap();
        assert_eq!(std::fs::read(target.join("main.py")).unwrap(), b"print(1)");
        assert_eq!(std::fs::read(target.join("drivers/lcd.py")).unwrap(), b"lcd");
        assert!(!target.join("stale.py").exists());
        assert!(!sibling_with_suffix(&target, "extracting").exists());
    }

    #[test]
    fn test_corrupt_archive_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("broken.zip");
        std::fs::write(&archive, b"this is not a zip file").unwrap();

        let target = dir.path().join("broken");
        assert!(extract_archive(&archive, &target).is_err());
        assert!(!target.exists());
        assert!(!sibling_with_suffix(&target, "extracting").exists());
    }

    #[test]
    fn test_unsupported_archive() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("lib.rar");
        std::fs::write(&archive, b"x").unwrap();
        assert!(matches!(
            extract_archive(&archive, &dir.path().join("lib")),
            Err(Error::UnsupportedArchive(_))
        ));
    }
}
