//! Host/device file reconciliation
//!
//! The workspace tree on the host, and the checks made before a file is
//! copied onto the board. The transfer itself belongs to a
//! [`DeviceFileManager`] provided by the host application.

use std::future::Future;
use std::path::{Component, Path, PathBuf};

use tokio_util::sync::CancellationToken;

use crate::catalog::Catalog;
use crate::error::{Error, Result};
use crate::events::UiHandle;
use crate::utils::{format_size, strip_archive_ext};
use crate::{log_info, log_warn};

const MODULE: &str = "files";

/// Python run on the board to report free space on its root filesystem
pub const STATVFS_COMMANDS: [&str; 2] = ["import os", "print(os.statvfs('/'), end='')"];

/// File transfer to and from the board's filesystem
pub trait DeviceFileManager: Send + Sync {
    /// Names of the files on the device
    fn ls(&self) -> impl Future<Output = Result<Vec<String>>> + Send;

    fn put(&self, local: &Path) -> impl Future<Output = Result<()>> + Send;

    fn get(&self, name: &str, local: &Path) -> impl Future<Output = Result<()>> + Send;

    fn delete(&self, name: &str) -> impl Future<Output = Result<()>> + Send;

    /// Run Python statements in the REPL and return what they printed
    fn execute(&self, commands: &[&str]) -> impl Future<Output = Result<String>> + Send;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalEntry {
    pub name: String,
    pub path: PathBuf,
    pub is_file: bool,
    pub children: Vec<LocalEntry>,
}

/// Recursive listing of `home`: directories first, then files, each by name
pub fn local_tree(home: &Path) -> Result<Vec<LocalEntry>> {
    let mut dirs = Vec::new();
    let mut files = Vec::new();

    for entry in std::fs::read_dir(home)? {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        if entry.file_type()?.is_dir() {
            dirs.push(LocalEntry {
                children: local_tree(&path)?,
                name,
                path,
                is_file: false,
            });
        } else {
            files.push(LocalEntry {
                name,
                path,
                is_file: true,
                children: Vec::new(),
            });
        }
    }

    dirs.sort_by(|a, b| a.name.cmp(&b.name));
    files.sort_by(|a, b| a.name.cmp(&b.name));
    dirs.extend(files);
    Ok(dirs)
}

/// True if the top-level entry of `relative` is an installed library
pub fn is_protected(relative: &Path, catalog: &Catalog) -> bool {
    let Some(Component::Normal(top)) = relative.components().next() else {
        return false;
    };
    let top = top.to_string_lossy();
    catalog
        .installed_libraries()
        .keys()
        .any(|name| strip_archive_ext(name) == top)
}

/// Delete a workspace file or directory unless it belongs to a library
///
/// `relative` must be made of plain components only.
pub fn delete_local(home: &Path, relative: &Path, catalog: &Catalog) -> Result<()> {
    let mut components = relative.components().peekable();
    if components.peek().is_none()
        || !components.all(|component| matches!(component, Component::Normal(_)))
    {
        return Err(Error::OutsideWorkspace(relative.display().to_string()));
    }
    if is_protected(relative, catalog) {
        return Err(Error::Protected(relative.display().to_string()));
    }

    let path = home.join(relative);
    if path.is_dir() {
        std::fs::remove_dir_all(&path)?;
    } else {
        std::fs::remove_file(&path)?;
    }
    log_info!(MODULE, "'{}' deleted from local machine", relative.display());
    Ok(())
}

/// Available bytes from a printed `os.statvfs` tuple (`f_frsize * f_bavail`)
pub fn parse_statvfs(output: &str) -> Result<u64> {
    let fields: Vec<u64> = output
        .trim()
        .trim_start_matches('(')
        .trim_end_matches(')')
        .split(',')
        .map(|field| field.trim().parse::<u64>())
        .collect::<std::result::Result<_, _>>()
        .map_err(|_| Error::DeviceOutput(output.to_string()))?;

    match (fields.get(1), fields.get(4)) {
        (Some(frsize), Some(bavail)) => Ok(frsize.saturating_mul(*bavail)),
        _ => Err(Error::DeviceOutput(output.to_string())),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutCheck {
    /// Go ahead; the file is this many bytes
    Ready(u64),
    /// The user chose not to overwrite
    Declined,
}

/// Checks before copying `local` to the device
pub async fn prepare_put<D: DeviceFileManager>(
    device: &D,
    local: &Path,
    ui: &UiHandle,
    cancel: &CancellationToken,
) -> Result<PutCheck> {
    let metadata = std::fs::metadata(local)?;
    if !metadata.is_file() {
        return Err(Error::NotAFile(local.display().to_string()));
    }
    let size = metadata.len();
    let name = local
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    if device.ls().await?.contains(&name) {
        let prompt = format!("'{}' already exists on the board. Overwrite it?", name);
        if ui.confirm(&prompt, cancel).await != Some(true) {
            return Ok(PutCheck::Declined);
        }
    }

    let available = parse_statvfs(&device.execute(&STATVFS_COMMANDS).await?)?;
    if available > size {
        Ok(PutCheck::Ready(size))
    } else {
        Err(Error::InsufficientSpace {
            needed: size,
            available,
        })
    }
}

/// Copy a workspace file onto the board, reporting through the UI
pub async fn copy_to_device<D: DeviceFileManager>(
    device: &D,
    local: &Path,
    ui: &UiHandle,
    cancel: &CancellationToken,
) -> bool {
    let name = local
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    let size = match prepare_put(device, local, ui, cancel).await {
        Ok(PutCheck::Ready(size)) => size,
        Ok(PutCheck::Declined) => return false,
        Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            ui.message_box(format!(
                "Sorry, {} does not exist in the current folder, please reopen the file panel.",
                name
            ));
            return false;
        }
        Err(Error::NotAFile(_)) => {
            ui.message_box("Only files can be copied to the board.");
            return false;
        }
        Err(Error::InsufficientSpace { .. }) => {
            ui.message_box("Fail! target device doesn't have enough space.");
            return false;
        }
        Err(e) => {
            log_warn!(MODULE, "Checking the board for {} failed: {}", name, e);
            ui.message_box("Fail! serial error.");
            return false;
        }
    };

    ui.set_controls(false);
    ui.message_box(format!("Copying '{}' ({}) to the board.", name, format_size(size)));
    let copied = match device.put(local).await {
        Ok(()) => {
            ui.message_box(format!("'{}' successfully copied to the board.", name));
            true
        }
        Err(e) => {
            log_warn!(MODULE, "Copying {} failed: {}", name, e);
            ui.message_box(format!("Could not copy '{}' to the board.", name));
            false
        }
    };
    ui.set_controls(true);
    copied
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::SAMPLE;
    use crate::events::UiEvent;
    use std::sync::Mutex;

    struct FakeDevice {
        files: Vec<String>,
        statvfs: String,
        put: Mutex<Vec<PathBuf>>,
    }

    impl FakeDevice {
        fn new(files: &[&str], statvfs: &str) -> Self {
            Self {
                files: files.iter().map(|f| f.to_string()).collect(),
                statvfs: statvfs.to_string(),
                put: Mutex::new(Vec::new()),
            }
        }
    }

    impl DeviceFileManager for FakeDevice {
        async fn ls(&self) -> Result<Vec<String>> {
            Ok(self.files.clone())
        }

        async fn put(&self, local: &Path) -> Result<()> {
            self.put.lock().unwrap().push(local.to_path_buf());
            Ok(())
        }

        async fn get(&self, _name: &str, _local: &Path) -> Result<()> {
            Ok(())
        }

        async fn delete(&self, _name: &str) -> Result<()> {
            Ok(())
        }

        async fn execute(&self, commands: &[&str]) -> Result<String> {
            assert_eq!(commands, STATVFS_COMMANDS);
            Ok(self.statvfs.clone())
        }
    }

    #[test]
    fn test_local_tree_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("zlib")).unwrap();
        std::fs::create_dir_all(dir.path().join("alib/sub")).unwrap();
        std::fs::write(dir.path().join("b.py"), b"").unwrap();
        std::fs::write(dir.path().join("a.py"), b"").unwrap();
        std::fs::write(dir.path().join("alib/x.py"), b"").unwrap();

        let tree = local_tree(dir.path()).unwrap();
        let names: Vec<_> = tree.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["alib", "zlib", "a.py", "b.py"]);
        let alib: Vec<_> = tree[0].children.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(alib, vec!["sub", "x.py"]);
        assert!(tree[2].is_file && !tree[0].is_file);
    }

    #[test]
    fn test_library_entries_are_protected() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::parse(SAMPLE).unwrap();
        std::fs::create_dir_all(dir.path().join("seeed_lib")).unwrap();
        std::fs::write(dir.path().join("seeed_lib/lcd.py"), b"").unwrap();
        std::fs::write(dir.path().join("main.py"), b"").unwrap();

        assert!(is_protected(Path::new("seeed_lib"), &catalog));
        assert!(is_protected(Path::new("seeed_lib/lcd.py"), &catalog));
        assert!(!is_protected(Path::new("main.py"), &catalog));

        assert!(matches!(
            delete_local(dir.path(), Path::new("seeed_lib/lcd.py"), &catalog),
            Err(Error::Protected(_))
        ));
        assert!(dir.path().join("seeed_lib/lcd.py").exists());

        delete_local(dir.path(), Path::new("main.py"), &catalog).unwrap();
        assert!(!dir.path().join("main.py").exists());
    }

    #[test]
    fn test_delete_stays_inside_workspace() {
        let root = tempfile::tempdir().unwrap();
        let home = root.path().join("mu_code");
        std::fs::create_dir_all(home.join("seeed_lib")).unwrap();
        std::fs::write(home.join("seeed_lib/lcd.py"), b"").unwrap();
        std::fs::write(root.path().join("outside.txt"), b"").unwrap();
        let catalog = Catalog::parse(SAMPLE).unwrap();

        let outside = root.path().join("outside.txt");
        for relative in [
            Path::new("../outside.txt"),
            outside.as_path(),
            Path::new("./seeed_lib/../../outside.txt"),
            Path::new("sub/../seeed_lib"),
            Path::new(""),
        ] {
            assert!(
                matches!(
                    delete_local(&home, relative, &catalog),
                    Err(Error::OutsideWorkspace(_))
                ),
                "{} was accepted",
                relative.display()
            );
        }
        assert!(outside.exists());
        assert!(home.join("seeed_lib/lcd.py").exists());
    }

    #[test]
    fn test_parse_statvfs() {
        assert_eq!(
            parse_statvfs("(4096, 4096, 100, 50, 40, 0, 0, 0, 0, 255)").unwrap(),
            4096 * 40
        );
        assert!(parse_statvfs("Traceback (most recent call last)").is_err());
        assert!(parse_statvfs("(1, 2)").is_err());
        assert!(parse_statvfs("").is_err());
    }

    #[tokio::test]
    async fn test_prepare_put() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("main.py");
        std::fs::write(&file, vec![b'x'; 100]).unwrap();
        let (ui, _rx) = UiHandle::channel();
        let cancel = CancellationToken::new();

        let roomy = FakeDevice::new(&[], "(512, 512, 10, 10, 1, 0, 0, 0, 0, 255)");
        assert_eq!(
            prepare_put(&roomy, &file, &ui, &cancel).await.unwrap(),
            PutCheck::Ready(100)
        );

        // exactly as much space as the file needs is not enough
        let tight = FakeDevice::new(&[], "(1, 100, 10, 10, 1, 0, 0, 0, 0, 255)");
        assert!(matches!(
            prepare_put(&tight, &file, &ui, &cancel).await,
            Err(Error::InsufficientSpace { needed: 100, available: 100 })
        ));

        assert!(matches!(
            prepare_put(&roomy, dir.path(), &ui, &cancel).await,
            Err(Error::NotAFile(_))
        ));
        assert!(matches!(
            prepare_put(&roomy, &dir.path().join("gone.py"), &ui, &cancel).await,
            Err(Error::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_overwrite_needs_confirmation() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("main.py");
        std::fs::write(&file, b"print(1)").unwrap();
        let (ui, mut rx) = UiHandle::channel();
        let cancel = CancellationToken::new();

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let UiEvent::Confirm(request) = event {
                    request.resolve(false);
                }
            }
        });

        let device = FakeDevice::new(&["main.py"], "(512, 512, 10, 10, 10, 0, 0, 0, 0, 255)");
        assert!(!copy_to_device(&device, &file, &ui, &cancel).await);
        assert!(device.put.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_copy_to_device() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("main.py");
        std::fs::write(&file, b"print(1)").unwrap();
        let (ui, mut rx) = UiHandle::channel();
        let cancel = CancellationToken::new();

        let device = FakeDevice::new(&[], "(512, 512, 10, 10, 10, 0, 0, 0, 0, 255)");
        assert!(copy_to_device(&device, &file, &ui, &cancel).await);
        assert_eq!(*device.put.lock().unwrap(), vec![file.clone()]);

        let mut messages = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let UiEvent::MessageBox(text) = event {
                messages.push(text);
            }
        }
        assert_eq!(
            messages.last().map(String::as_str),
            Some("'main.py' successfully copied to the board.")
        );
    }
}
