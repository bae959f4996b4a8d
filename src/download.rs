//! Download module
//!
//! Fetches the catalog, board configs, firmware and library archives with a
//! bounded number of attempts. Each attempt runs under a request watchdog
//! (nothing received yet) and a stall watchdog (gap between chunks). The
//! destination is moved aside before the first attempt and either replaced
//! by the new content or restored, never left half written.

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use reqwest::Client;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::config::{self, Settings};
use crate::error::{Error, Result};
use crate::utils::{format_size, sibling_with_suffix, ProgressTracker};
use crate::{log_debug, log_error, log_info, log_warn};

const MODULE: &str = "download";

pub type ChunkStream = BoxStream<'static, Result<Vec<u8>>>;

/// An opened response: optional advertised length plus the body chunks
pub struct Body {
    pub total: Option<u64>,
    pub chunks: ChunkStream,
}

/// Transport used by the [`Downloader`]
pub trait Fetch: Send + Sync {
    /// Issue one request. Resolves once the response headers arrived.
    fn open(&self, url: &str) -> impl Future<Output = Result<Body>> + Send;
}

/// Plain HTTP GET through `reqwest`
pub struct HttpFetch {
    client: Client,
}

impl HttpFetch {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .user_agent(config::app::USER_AGENT)
            .build()?;
        Ok(Self { client })
    }
}

impl Fetch for HttpFetch {
    async fn open(&self, url: &str) -> Result<Body> {
        let response = self.client.get(url).send().await?;

        if !response.status().is_success() {
            log_warn!(MODULE, "{} answered with status {}", url, response.status());
            return Err(Error::Status(response.status().as_u16()));
        }

        let total = response.content_length();
        let chunks = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(Error::from))
            .boxed();
        Ok(Body { total, chunks })
    }
}

#[derive(Debug, Clone)]
pub struct DownloadOptions {
    pub request_timeout: Duration,
    /// `None` disables the stall watchdog
    pub stall_timeout: Option<Duration>,
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            request_timeout: config::download::REQUEST_TIMEOUT,
            stall_timeout: None,
            max_attempts: config::download::MAX_ATTEMPTS,
            retry_delay: Duration::ZERO,
        }
    }
}

impl DownloadOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            request_timeout: settings.request_timeout(),
            stall_timeout: settings.stall_timeout(),
            max_attempts: settings.max_attempts,
            retry_delay: settings.retry_delay(),
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Requesting,
    Streaming,
    Succeeded,
    Failed,
}

/// Bookkeeping for one in-flight download
#[derive(Debug)]
pub struct DownloadState {
    pub destination: PathBuf,
    pub source: String,
    pub attempts_remaining: u32,
    pub request_timeout: Duration,
    pub stall_timeout: Option<Duration>,
    pub accumulated_bytes: u64,
    pub phase: Phase,
}

impl DownloadState {
    fn new(destination: &Path, source: &str, options: &DownloadOptions) -> Self {
        Self {
            destination: destination.to_path_buf(),
            source: source.to_string(),
            attempts_remaining: options.max_attempts,
            request_timeout: options.request_timeout,
            stall_timeout: options.stall_timeout,
            accumulated_bytes: 0,
            phase: Phase::Requesting,
        }
    }
}

/// The destination's previous content, parked in a `.bak` sibling
struct Backup {
    destination: PathBuf,
    backup: PathBuf,
    had_original: bool,
}

impl Backup {
    fn take(destination: &Path) -> io::Result<Self> {
        let backup = sibling_with_suffix(destination, config::download::BACKUP_SUFFIX);
        let had_original = destination.exists();

        if had_original {
            if backup.exists() {
                std::fs::remove_file(&backup)?;
            }
            std::fs::rename(destination, &backup)?;
            log_debug!(MODULE, "Moved {} aside", destination.display());
        }

        Ok(Self {
            destination: destination.to_path_buf(),
            backup,
            had_original,
        })
    }

    fn commit(self) {
        if self.had_original {
            if let Err(e) = std::fs::remove_file(&self.backup) {
                log_warn!(MODULE, "Failed to remove {}: {}", self.backup.display(), e);
            }
        }
    }

    fn restore(self) {
        if self.destination.exists() {
            if let Err(e) = std::fs::remove_file(&self.destination) {
                log_error!(
                    MODULE,
                    "Failed to remove partial {}: {}",
                    self.destination.display(),
                    e
                );
            }
        }

        if self.had_original {
            match std::fs::rename(&self.backup, &self.destination) {
                Ok(()) => log_info!(MODULE, "Restored {}", self.destination.display()),
                Err(e) => log_error!(
                    MODULE,
                    "Failed to restore {}: {}",
                    self.destination.display(),
                    e
                ),
            }
        }
    }
}

pub struct Downloader<F> {
    fetch: F,
    options: DownloadOptions,
}

impl<F: Fetch> Downloader<F> {
    pub fn new(fetch: F, options: DownloadOptions) -> Self {
        Self { fetch, options }
    }

    pub fn options(&self) -> &DownloadOptions {
        &self.options
    }

    pub fn transport(&self) -> &F {
        &self.fetch
    }

    /// Fetch `source` into `destination` with the default options
    pub async fn fetch(&self, destination: &Path, source: &str, cancel: &CancellationToken) -> bool {
        self.fetch_with(destination, source, &self.options, cancel)
            .await
    }

    /// Fetch `source` into `destination`.
    ///
    /// Returns `true` when `destination` holds the new content. On `false`
    /// it holds exactly what it held before the call (or does not exist).
    pub async fn fetch_with(
        &self,
        destination: &Path,
        source: &str,
        options: &DownloadOptions,
        cancel: &CancellationToken,
    ) -> bool {
        log_info!(
            MODULE,
            "Download requested: {} -> {}",
            source,
            destination.display()
        );

        if let Some(parent) = destination.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                log_error!(MODULE, "Failed to create {}: {}", parent.display(), e);
                return false;
            }
        }

        let backup = match Backup::take(destination) {
            Ok(backup) => backup,
            Err(e) => {
                log_error!(
                    MODULE,
                    "Failed to back up {}: {}",
                    destination.display(),
                    e
                );
                return false;
            }
        };

        let mut state = DownloadState::new(destination, source, options);
        match self.run_attempts(&mut state, options, cancel).await {
            Ok(()) => {
                state.phase = Phase::Succeeded;
                backup.commit();
                log_info!(
                    MODULE,
                    "Finished {} ({})",
                    destination.display(),
                    format_size(state.accumulated_bytes)
                );
                true
            }
            Err(e) => {
                state.phase = Phase::Failed;
                backup.restore();
                log_error!(MODULE, "Download of {} failed: {}", source, e);
                log_debug!(MODULE, "Final state: {:?}", state);
                false
            }
        }
    }

    async fn run_attempts(
        &self,
        state: &mut DownloadState,
        options: &DownloadOptions,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut last_error = Error::EmptyResponse;

        while state.attempts_remaining > 0 {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            state.attempts_remaining -= 1;
            state.phase = Phase::Requesting;
            state.accumulated_bytes = 0;
            let attempt = options.max_attempts - state.attempts_remaining;
            log_debug!(
                MODULE,
                "Attempt {}/{} for {}",
                attempt,
                options.max_attempts,
                state.source
            );

            let result = tokio::select! {
                _ = cancel.cancelled() => Err(Error::Cancelled),
                result = self.attempt(state) => result,
            };

            match result {
                Ok(()) => return Ok(()),
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    log_warn!(
                        MODULE,
                        "Attempt {}/{} for {} failed: {}",
                        attempt,
                        options.max_attempts,
                        state.source,
                        e
                    );
                    truncate(&state.destination);
                    last_error = e;
                }
            }

            if state.attempts_remaining > 0 && !options.retry_delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    _ = tokio::time::sleep(options.retry_delay) => {}
                }
            }
        }

        Err(last_error)
    }

    /// One request. The request timer runs until the first byte arrives,
    /// after that each chunk must arrive within the stall timeout.
    async fn attempt(&self, state: &mut DownloadState) -> Result<()> {
        let request_ms = state.request_timeout.as_millis() as u64;
        let deadline = tokio::time::Instant::now() + state.request_timeout;

        let body = tokio::time::timeout_at(deadline, self.fetch.open(&state.source))
            .await
            .map_err(|_| Error::RequestTimeout(request_ms))??;

        let mut file = tokio::fs::File::create(&state.destination).await?;
        let label = state
            .destination
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| state.source.clone());
        let mut tracker = ProgressTracker::new(
            &label,
            MODULE,
            body.total.unwrap_or(0),
            config::logging::DOWNLOAD_LOG_INTERVAL_MB,
        );
        let mut chunks = body.chunks;

        loop {
            let next = match (state.phase, state.stall_timeout) {
                (Phase::Requesting, _) => tokio::time::timeout_at(deadline, chunks.next())
                    .await
                    .map_err(|_| Error::RequestTimeout(request_ms))?,
                (_, Some(stall)) => tokio::time::timeout(stall, chunks.next())
                    .await
                    .map_err(|_| Error::Stalled(stall.as_millis() as u64))?,
                (_, None) => chunks.next().await,
            };

            let Some(chunk) = next else {
                break;
            };
            let chunk = chunk?;
            if chunk.is_empty() {
                continue;
            }

            state.phase = Phase::Streaming;
            file.write_all(&chunk).await?;
            state.accumulated_bytes += chunk.len() as u64;
            tracker.update(chunk.len() as u64);
        }

        file.flush().await?;

        if state.accumulated_bytes == 0 {
            return Err(Error::EmptyResponse);
        }

        tracker.finish();
        Ok(())
    }
}

/// Drop whatever a failed attempt wrote
fn truncate(path: &Path) {
    if path.exists() {
        if let Err(e) = std::fs::File::create(path) {
            log_warn!(MODULE, "Failed to truncate {}: {}", path.display(), e);
        }
    }
}

/// Put back any `.bak` file left behind by a download that never finished
///
/// Returns the number of files restored.
pub fn recover_interrupted(dir: &Path) -> usize {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };

    let suffix = format!(".{}", config::download::BACKUP_SUFFIX);
    let mut restored = 0;

    for entry in entries.flatten() {
        let backup = entry.path();
        if !backup.is_file() {
            continue;
        }
        let Some(original_name) = backup
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_suffix(suffix.as_str()))
            .map(str::to_owned)
        else {
            continue;
        };

        let original = backup.with_file_name(original_name);
        if original.exists() {
            let _ = std::fs::remove_file(&original);
        }
        match std::fs::rename(&backup, &original) {
            Ok(()) => {
                log_info!(
                    MODULE,
                    "Recovered {} from an interrupted download",
                    original.display()
                );
                restored += 1;
            }
            Err(e) => log_warn!(MODULE, "Failed to recover {}: {}", original.display(), e),
        }
    }

    restored
}
