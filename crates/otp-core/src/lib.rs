//! Core domain + application logic for the OTP rental bot.
//!
//! This crate is intentionally framework-agnostic. Telegram and the number
//! rental vendor live behind ports (traits) implemented in adapter crates.

pub mod config;
pub mod domain;
pub mod errors;
pub mod formatting;
pub mod logging;
pub mod messaging;
pub mod orders;
pub mod ports;
pub mod watcher;

pub use errors::{Error, Result};
