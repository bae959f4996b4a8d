//! ArduPy Updater - headless agent
//!
//! Runs the update engine against real serial ports and the network, with
//! a console standing in for the editor: status lines go to stdout and
//! questions are answered with y/n on stdin.

use std::io::BufRead;

use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio_util::sync::CancellationToken;

use ardupy_updater::catalog::SharedCatalog;
use ardupy_updater::config::{self, Settings};
use ardupy_updater::coordinator::UpdateCoordinator;
use ardupy_updater::devices::{DeviceDetector, PortWatcher};
use ardupy_updater::download::{recover_interrupted, DownloadOptions, Downloader, HttpFetch};
use ardupy_updater::events::{ConfirmationRequest, UiEvent, UiHandle};
use ardupy_updater::flash::Flasher;
use ardupy_updater::{log_debug, log_error, log_info, log_warn, logging};

const MODULE: &str = "main";

/// Console lines, read on a plain thread so a pending read never holds up
/// runtime shutdown
fn stdin_lines() -> UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            match line {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    log_warn!(MODULE, "Failed to read answer: {}", e);
                    break;
                }
            }
        }
    });
    rx
}

/// Print a question and wait for a y/n line; anything else declines
async fn ask(
    request: ConfirmationRequest,
    answers: &mut UnboundedReceiver<String>,
    cancel: &CancellationToken,
) {
    println!("{} [y/N]", request.prompt);
    let line = tokio::select! {
        _ = cancel.cancelled() => return,
        line = answers.recv() => line,
    };

    let accepted = line.is_some_and(|answer| matches!(answer.trim(), "y" | "Y" | "yes"));
    request.resolve(accepted);
}

/// Render engine events until cancelled
async fn console(mut events: UnboundedReceiver<UiEvent>, cancel: CancellationToken) {
    let mut answers = stdin_lines();

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match event {
            UiEvent::Status { text, .. } if text.is_empty() => {}
            UiEvent::Status { text, .. } => println!("[status] {}", text),
            UiEvent::MessageBox(text) => println!("[hint] {}", text),
            UiEvent::Controls(enabled) => {
                log_debug!(MODULE, "Editor controls enabled: {}", enabled)
            }
            UiEvent::Confirm(request) => ask(request, &mut answers, &cancel).await,
            UiEvent::SessionTeardown { port, board_type } => {
                println!("[device] {} on {} disconnected", board_type, port)
            }
            UiEvent::State(state) => log_debug!(MODULE, "Coordinator: {:?}", state),
        }
    }
}

#[tokio::main]
async fn main() {
    logging::init();

    let settings_path = Settings::default_path();
    let settings = Settings::load(&settings_path);
    logging::set_log_level(settings.developer_mode);

    log_info!(MODULE, "=== ArduPy Updater Starting ===");
    log_info!(MODULE, "Version: {}", env!("CARGO_PKG_VERSION"));
    log_info!(
        MODULE,
        "OS: {} {}",
        std::env::consts::OS,
        std::env::consts::ARCH
    );
    log_info!(MODULE, "Settings: {}", settings_path.display());
    log_info!(MODULE, "  - Catalog: {}", settings.catalog_url());
    log_info!(MODULE, "  - Resources: {}", settings.resources_dir.display());
    log_info!(MODULE, "  - Workspace: {}", settings.workspace_dir.display());

    for dir in [&settings.resources_dir, &settings.workspace_dir] {
        if let Err(e) = std::fs::create_dir_all(dir) {
            log_error!(MODULE, "Failed to create {}: {}", dir.display(), e);
            std::process::exit(1);
        }
    }

    // Put back anything a crash left half-downloaded
    let recovered = recover_interrupted(&settings.resources_dir);
    if recovered > 0 {
        log_info!(MODULE, "Recovered {} interrupted download(s)", recovered);
    }

    let fetch = match HttpFetch::new() {
        Ok(fetch) => fetch,
        Err(e) => {
            log_error!(MODULE, "Failed to set up HTTP client: {}", e);
            std::process::exit(1);
        }
    };

    let cancel = CancellationToken::new();
    let catalog = SharedCatalog::open(&settings.catalog_path());
    let (ui, events) = UiHandle::channel();

    let detector = DeviceDetector::new(catalog.clone(), ui.clone());
    let coordinator = UpdateCoordinator::new(
        settings.clone(),
        catalog,
        Downloader::new(fetch, DownloadOptions::from_settings(&settings)),
        Flasher::new(&settings),
        ui,
        detector.subscribe(),
    );

    let watcher = PortWatcher::new(detector, settings.port_scan_interval());
    let watcher = tokio::spawn(watcher.run(cancel.clone()));
    let worker = tokio::spawn(coordinator.run(cancel.clone()));
    tokio::spawn(console(events, cancel.clone()));

    match tokio::signal::ctrl_c().await {
        Ok(()) => log_info!(MODULE, "Interrupted, shutting down"),
        Err(e) => log_error!(MODULE, "Failed to listen for Ctrl-C: {}", e),
    }
    cancel.cancel();

    for (name, task) in [("coordinator", worker), ("port watcher", watcher)] {
        if let Err(e) = task.await {
            log_warn!(MODULE, "{} ended abnormally: {}", name, e);
        }
    }
    log_info!(MODULE, "=== {} stopped ===", config::app::NAME);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_ask_reads_answer_from_channel() {
        let (tx, mut answers) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        tx.send(" y ".to_string()).unwrap();
        let (request, reply) = ConfirmationRequest::new("flash?");
        ask(request, &mut answers, &cancel).await;
        assert!(reply.await.unwrap());

        tx.send("later".to_string()).unwrap();
        let (request, reply) = ConfirmationRequest::new("flash?");
        ask(request, &mut answers, &cancel).await;
        assert!(!reply.await.unwrap());
    }

    #[tokio::test]
    async fn test_cancel_ends_pending_question() {
        // nobody ever types an answer
        let (_tx, mut answers) = mpsc::unbounded_channel::<String>();
        let cancel = CancellationToken::new();
        let (request, reply) = ConfirmationRequest::new("flash?");

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), ask(request, &mut answers, &cancel))
            .await
            .unwrap();
        assert!(reply.await.is_err());
    }
}
