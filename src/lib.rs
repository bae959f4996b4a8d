//! ArduPy Updater - keep USB-attached ArduPy boards and their libraries current
//!
//! Detects boards as they are plugged in, fetches board configs, firmware
//! images and library bundles from the ArduPy catalog, and drives the
//! bundled flashing tool. The front-end is reached only through
//! [`events::UiEvent`]s.

pub mod logging;

pub mod catalog;
pub mod config;
pub mod coordinator;
pub mod devices;
pub mod download;
pub mod error;
pub mod events;
pub mod extract;
pub mod files;
pub mod firmware;
pub mod flash;
pub mod library;
pub mod utils;

pub use error::{Error, Result};
