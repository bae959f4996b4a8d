//! Update coordinator
//!
//! One long-lived task: refresh the catalog and the library bundles once,
//! then handle board detections one at a time. Every failure inside a cycle
//! ends up as a status line; nothing escapes the loop.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::catalog::{BoardId, LibraryEntry, SharedCatalog};
use crate::config::{self, Settings};
use crate::devices::Detection;
use crate::download::{DownloadOptions, Downloader, Fetch};
use crate::events::{UiEvent, UiHandle};
use crate::extract::extract_archive;
use crate::firmware::{needs_update, FirmwareDescriptor};
use crate::flash::{extract_board_version, BoardOps};
use crate::library;
use crate::utils::format_version;
use crate::{log_debug, log_error, log_info, log_warn};

const MODULE: &str = "coordinator";

const OFFLINE_PROMPT: &str =
    "Network connection timeout. Work offline? Choose no to try again.";
const PROMPT_NEW_FIRMWARE: &str =
    "there is a new available firmware, would you like to update it to your board?";
const PROMPT_BOOTLOADER: &str =
    "your board is in bootloader mode, would you like to flash a firmware?";
const PROMPT_NO_FIRMWARE: &str =
    "there is no firmware on your board, would you like to flash a firmware?";
const HINT_FLASHING: &str = "Flashing...";
const HINT_FLASHING_SUCCESS: &str = "Flashing success.";
const HINT_FLASHING_FAIL: &str = "Flashing fail.";
const HINT_LIBRARY_NETWORK: &str = "library update failure, please check your network.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Idle,
    RefreshingCatalog,
    RefreshingLibraries,
    AwaitingDetection,
    CheckingFirmware,
    Flashing,
    /// Waiting for detections with downloads switched off
    OfflineDegraded,
}

/// What the coordinator knows about the board it is handling
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BoardRuntimeState {
    pub board_id: Option<BoardId>,
    /// Serial device path
    pub board_name: Option<String>,
    pub in_bootloader: bool,
    pub detected: bool,
    pub has_firmware: bool,
}

pub struct UpdateCoordinator<F, B> {
    settings: Settings,
    catalog: SharedCatalog,
    downloader: Downloader<F>,
    board: B,
    ui: UiHandle,
    detections: watch::Receiver<Option<Detection>>,
    state: watch::Sender<CoordinatorState>,
    offline: AtomicBool,
    /// Cleared after a normal-mode board was sent to its bootloader, so the
    /// re-enumerated board is flashed without asking twice
    need_confirm: bool,
    /// Firmware descriptor that passed its check, for the last board type
    firmware: Option<FirmwareDescriptor>,
    runtime: BoardRuntimeState,
}

impl<F: Fetch, B: BoardOps> UpdateCoordinator<F, B> {
    pub fn new(
        settings: Settings,
        catalog: SharedCatalog,
        downloader: Downloader<F>,
        board: B,
        ui: UiHandle,
        detections: watch::Receiver<Option<Detection>>,
    ) -> Self {
        let (state, _) = watch::channel(CoordinatorState::Idle);
        Self {
            settings,
            catalog,
            downloader,
            board,
            ui,
            detections,
            state,
            offline: AtomicBool::new(false),
            need_confirm: true,
            firmware: None,
            runtime: BoardRuntimeState::default(),
        }
    }

    pub fn states(&self) -> watch::Receiver<CoordinatorState> {
        self.state.subscribe()
    }

    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::SeqCst)
    }

    pub fn runtime(&self) -> &BoardRuntimeState {
        &self.runtime
    }

    fn set_state(&self, state: CoordinatorState) {
        log_debug!(MODULE, "State: {:?}", state);
        self.state.send_replace(state);
        self.ui.send(UiEvent::State(state));
    }

    fn waiting_state(&self) -> CoordinatorState {
        if self.is_offline() {
            CoordinatorState::OfflineDegraded
        } else {
            CoordinatorState::AwaitingDetection
        }
    }

    /// Run until cancelled or until the detector goes away
    pub async fn run(mut self, cancel: CancellationToken) {
        log_info!(MODULE, "Update coordinator started");
        self.ui.set_controls(false);

        self.refresh_catalog(&cancel).await;
        if !cancel.is_cancelled() {
            self.refresh_libraries(&cancel).await;
        }

        while !cancel.is_cancelled() {
            self.set_state(self.waiting_state());

            let detection = tokio::select! {
                _ = cancel.cancelled() => break,
                detection = next_detection(&mut self.detections) => detection,
            };
            let Some(detection) = detection else {
                log_info!(MODULE, "Detector gone, stopping");
                break;
            };

            self.handle_detection(&detection, &cancel).await;
        }

        self.set_state(CoordinatorState::Idle);
        log_info!(MODULE, "Update coordinator stopped");
    }

    /// Download until it works, the user opts for offline mode, or cancel
    ///
    /// Declining the offline prompt retries the whole download.
    pub async fn confirm_download(
        &self,
        destination: &Path,
        source: &str,
        options: &DownloadOptions,
        cancel: &CancellationToken,
    ) -> bool {
        loop {
            if self.is_offline() {
                log_debug!(MODULE, "Offline, not fetching {}", source);
                return false;
            }

            if self
                .downloader
                .fetch_with(destination, source, options, cancel)
                .await
            {
                return true;
            }
            if cancel.is_cancelled() {
                return false;
            }

            match self.ui.confirm(OFFLINE_PROMPT, cancel).await {
                Some(true) => {
                    log_warn!(MODULE, "Offline mode enabled for this session");
                    self.offline.store(true, Ordering::SeqCst);
                    self.set_state(CoordinatorState::OfflineDegraded);
                    return false;
                }
                Some(false) => log_info!(MODULE, "Retrying {}", source),
                None => return false,
            }
        }
    }

    pub async fn refresh_catalog(&self, cancel: &CancellationToken) {
        self.set_state(CoordinatorState::RefreshingCatalog);
        let url = self.settings.catalog_url();
        let options = self.downloader.options().clone();
        // The download replaces the whole file, installed libraries included
        let installed = self.catalog.local_libraries();

        if !self
            .confirm_download(self.catalog.path(), &url, &options, cancel)
            .await
        {
            log_info!(MODULE, "Using the cached catalog");
            return;
        }

        if let Err(e) = self.catalog.restore_libraries(&installed) {
            log_error!(MODULE, "Downloaded catalog is unusable: {}", e);
            self.ui.status_short(format!("catalog update failure: {}", e));
        }
    }

    /// Fetch and unpack every library bundle that is new, newer or missing
    ///
    /// A failed download stops the refresh; a failed extraction only skips
    /// that bundle. Bundles that made it are recorded in the catalog.
    pub async fn refresh_libraries(&self, cancel: &CancellationToken) {
        self.set_state(CoordinatorState::RefreshingLibraries);
        let manifest_path = self.settings.library_manifest_path();
        let options = self.downloader.options().clone();

        if !self
            .confirm_download(
                &manifest_path,
                &self.settings.library_manifest_url(),
                &options,
                cancel,
            )
            .await
        {
            log_info!(MODULE, "Library check skipped");
            return;
        }

        let manifest = match library::load_manifest(&manifest_path) {
            Ok(manifest) => manifest,
            Err(e) => {
                log_error!(MODULE, "Unusable library manifest: {}", e);
                return;
            }
        };

        let planned = library::plan_updates(
            &manifest,
            self.catalog.snapshot().installed_libraries(),
            &self.settings.resources_dir,
        );
        if planned.is_empty() {
            log_info!(MODULE, "Libraries are up to date");
            return;
        }

        let mut installed: Vec<LibraryEntry> = Vec::new();
        let mut complete = true;

        for update in planned {
            let entry = update.entry.clone();
            let archive = library::archive_path(&self.settings.resources_dir, &entry);
            self.ui.status_always(update.status());

            if !self.downloader.fetch(&archive, &entry.path, cancel).await {
                self.ui.status_short(HINT_LIBRARY_NETWORK);
                complete = false;
                break;
            }

            self.ui.status_always(format!("extracting {}...", entry.name));
            let target = library::workspace_target(&self.settings.workspace_dir, &entry);
            let extracted =
                tokio::task::spawn_blocking(move || extract_archive(&archive, &target)).await;

            match extracted {
                Ok(Ok(())) => installed.push(entry),
                Ok(Err(e)) => {
                    log_warn!(MODULE, "{}: {}", entry.name, e);
                    self.ui.status_short(format!("{} extract failure", entry.name));
                    complete = false;
                }
                Err(e) => {
                    log_error!(MODULE, "Extraction task for {} failed: {}", entry.name, e);
                    complete = false;
                }
            }
        }

        if installed.is_empty() {
            return;
        }
        if let Err(e) = self.catalog.record_libraries(&installed) {
            log_error!(MODULE, "Failed to record installed libraries: {}", e);
            return;
        }
        if complete {
            self.ui.status_short("library update successfully!");
        }
    }

    async fn handle_detection(&mut self, detection: &Detection, cancel: &CancellationToken) {
        log_info!(
            MODULE,
            "Handling {} on {}",
            detection.board_type,
            detection.port
        );
        self.runtime = BoardRuntimeState {
            board_id: Some(detection.board_id),
            board_name: Some(detection.port.clone()),
            in_bootloader: detection.in_bootloader,
            detected: true,
            has_firmware: false,
        };

        let config_name = config::urls::board_config_file(&detection.board_type);
        let cached = self
            .firmware
            .as_ref()
            .is_some_and(|firmware| firmware.board_config_file_name == config_name);

        if !cached {
            self.set_state(CoordinatorState::CheckingFirmware);
            self.firmware = self.check_firmware(&detection.board_type, cancel).await;
        }

        match self.firmware.take() {
            Some(firmware) => {
                self.update(detection, &firmware, cancel).await;
                self.firmware = Some(firmware);
            }
            None => {
                log_warn!(
                    MODULE,
                    "No firmware available for {}, skipping update",
                    detection.board_type
                );
                if !detection.in_bootloader {
                    self.ui.set_controls(true);
                }
            }
        }

        self.runtime.detected = false;
    }

    /// Make sure the board's config and firmware image are cached locally
    async fn check_firmware(
        &self,
        board_type: &str,
        cancel: &CancellationToken,
    ) -> Option<FirmwareDescriptor> {
        let mut descriptor = FirmwareDescriptor::for_board_type(board_type, &self.settings);
        self.ui
            .status_always(format!("check {}...", descriptor.board_config_file_name));

        let options = self
            .downloader
            .options()
            .clone()
            .with_request_timeout(config::download::CONFIG_REQUEST_TIMEOUT);

        if !self
            .confirm_download(
                &descriptor.local_config_path,
                &descriptor.remote_config_url,
                &options,
                cancel,
            )
            .await
        {
            // An earlier session may have left everything needed
            descriptor.reload();
            if descriptor.version().is_some() && descriptor.exists_firmware() {
                log_info!(MODULE, "Using cached {}", descriptor.board_config_file_name);
                self.ui.status_short("");
                return Some(descriptor);
            }
            self.ui.status_short(format!(
                "{} is not available offline",
                descriptor.board_config_file_name
            ));
            return None;
        }

        descriptor.reload();
        let (Some(name), Some(url), Some(local)) = (
            descriptor.firmware_name().map(str::to_string),
            descriptor.remote_firmware_url().map(str::to_string),
            descriptor.local_firmware(),
        ) else {
            self.ui.status_short(format!(
                "{} is unusable",
                descriptor.board_config_file_name
            ));
            return None;
        };

        if descriptor.exists_firmware() {
            self.ui.status_short("");
            return Some(descriptor);
        }

        self.ui.status_always(format!("download {}...", name));
        if self
            .downloader
            .fetch_with(&local, &url, &options, cancel)
            .await
        {
            self.ui.status_short(format!("{} download successfully", name));
            Some(descriptor)
        } else {
            self.ui.status_short(format!("{} download failure", name));
            None
        }
    }

    /// Decide whether the board gets flashed
    async fn update(
        &mut self,
        detection: &Detection,
        firmware: &FirmwareDescriptor,
        cancel: &CancellationToken,
    ) {
        if detection.in_bootloader {
            self.download_to_board(detection, firmware, false, cancel)
                .await;
            return;
        }

        let buffer = self.board.probe(&detection.port).await;
        let Some(board_version) = buffer.as_deref().and_then(extract_board_version) else {
            log_info!(MODULE, "No recognizable firmware on {}", detection.port);
            self.download_to_board(detection, firmware, false, cancel)
                .await;
            return;
        };

        log_info!(MODULE, "Board reports firmware {}", board_version);
        self.runtime.has_firmware = true;
        self.ui.set_controls(true);

        match firmware.version() {
            Some(latest) if needs_update(latest, board_version) => {
                self.download_to_board(detection, firmware, true, cancel)
                    .await;
            }
            Some(_) => log_info!(MODULE, "Board has the latest firmware"),
            None => log_warn!(MODULE, "Catalog firmware version unknown, not updating"),
        }
    }

    async fn download_to_board(
        &mut self,
        detection: &Detection,
        firmware: &FirmwareDescriptor,
        has_seeed_firmware: bool,
        cancel: &CancellationToken,
    ) {
        if self.need_confirm {
            let prompt = if has_seeed_firmware {
                PROMPT_NEW_FIRMWARE
            } else if detection.in_bootloader {
                PROMPT_BOOTLOADER
            } else {
                PROMPT_NO_FIRMWARE
            };
            if self.ui.confirm(prompt, cancel).await != Some(true) {
                log_info!(MODULE, "Update declined");
                return;
            }
        } else if !detection.in_bootloader {
            // The bootloader reset did not take; ask again next time
            self.need_confirm = true;
            self.ui.set_controls(true);
            return;
        } else {
            self.need_confirm = true;
        }

        self.ui.set_controls(false);

        if !detection.in_bootloader {
            log_info!(MODULE, "Sending {} to its bootloader", detection.port);
            match self.board.enter_bootloader(&detection.port).await {
                Ok(()) => self.need_confirm = false,
                Err(e) => {
                    log_error!(MODULE, "Bootloader reset failed: {}", e);
                    self.ui.status_short(HINT_FLASHING_FAIL);
                    self.ui.set_controls(true);
                }
            }
            return;
        }

        let Some(image) = firmware.local_firmware() else {
            self.ui.status_always(HINT_FLASHING_FAIL);
            self.ui.set_controls(true);
            return;
        };

        self.set_state(CoordinatorState::Flashing);
        self.ui.status_always(HINT_FLASHING);
        let template = self
            .catalog
            .snapshot()
            .flash_template(detection.board_id)
            .to_string();

        match self.board.flash(&template, &detection.port, &image).await {
            Ok(()) => {
                if let Some(version) = firmware.version() {
                    self.ui.message_box(format!(
                        "your board update to version {} successfully!",
                        format_version(version)
                    ));
                }
                self.ui.status_short(HINT_FLASHING_SUCCESS);
                self.runtime.has_firmware = true;
            }
            Err(e) => {
                log_error!(MODULE, "Flashing {} failed: {}", detection.port, e);
                self.ui.status_always(HINT_FLASHING_FAIL);
            }
        }
        self.ui.set_controls(true);
    }
}

/// Wait for the next unseen detection; `None` once the detector is gone
async fn next_detection(rx: &mut watch::Receiver<Option<Detection>>) -> Option<Detection> {
    loop {
        rx.changed().await.ok()?;
        if let Some(detection) = rx.borrow_and_update().clone() {
            return Some(detection);
        }
    }
}
