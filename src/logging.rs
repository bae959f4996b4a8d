//! Logging setup
//!
//! Every subsystem logs through the `log_*!` macros with its module name as
//! the first argument. The records go through the `log` facade to
//! `env_logger`.

use log::LevelFilter;

/// Install the global logger.
///
/// The backend accepts DEBUG records, but the global gate starts at INFO so
/// `set_log_level` can open it later without reinstalling anything.
/// `RUST_LOG` wins over both when present.
pub fn init() {
    let env_filter = std::env::var("RUST_LOG").ok();

    let mut builder = env_logger::Builder::new();
    builder
        .filter_level(LevelFilter::Debug)
        .format_timestamp_millis()
        .format_target(true);

    if let Some(ref spec) = env_filter {
        builder.parse_filters(spec);
    }

    if builder.try_init().is_err() {
        // Already installed (tests, or a host embedding the library)
        return;
    }

    if env_filter.is_none() {
        log::set_max_level(LevelFilter::Info);
    }
}

/// Switch between INFO (default) and DEBUG (developer mode)
pub fn set_log_level(developer_mode: bool) {
    let level = if developer_mode {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    log::set_max_level(level);
    log::info!(target: "logging", "Log level set to {}", level);
}

#[macro_export]
macro_rules! log_info {
    ($module:expr, $($arg:tt)+) => {{
        let target: &str = $module;
        ::log::info!(target: target, $($arg)+)
    }};
}

#[macro_export]
macro_rules! log_warn {
    ($module:expr, $($arg:tt)+) => {{
        let target: &str = $module;
        ::log::warn!(target: target, $($arg)+)
    }};
}

#[macro_export]
macro_rules! log_error {
    ($module:expr, $($arg:tt)+) => {{
        let target: &str = $module;
        ::log::error!(target: target, $($arg)+)
    }};
}

#[macro_export]
macro_rules! log_debug {
    ($module:expr, $($arg:tt)+) => {{
        let target: &str = $module;
        ::log::debug!(target: target, $($arg)+)
    }};
}
