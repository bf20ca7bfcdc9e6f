//! BLEAM Scanner (BLESc) node logic.
//!
//! The scanner listens for BLEAMs, collects RSSI samples from their
//! advertisements, connects, proves it holds the shared application key
//! and uploads health and RSSI records. Everything here is hardware
//! independent and runs on the host:
//!
//! - [`scheduler::Scanner`] drives the Idle / Scanning / Connecting cycle
//! - [`ble`] holds the peer cache, advertisement parsing, fallback
//!   discovery, authentication and the send pipeline
//! - [`platform`] is the boundary the firmware implements
//!
//! Usage: `cargo test` on the host.
//!
//! Note: The embedded binary (`src/main.rs`, `embedded` feature) adapts
//! these modules to the SoftDevice and Embassy.

#![cfg_attr(not(test), no_std)]

// Must come first so the logging macros are visible everywhere below.
#[macro_use]
mod fmt;

pub mod ble;
pub mod clock;
pub mod config;
pub mod error;
pub mod health;
pub mod platform;
pub mod power_logic;
pub mod ring;
pub mod scheduler;

pub use config::{NodeConfig, SchedulerConfig};
pub use error::{Error, StorageError, TransportError};
pub use platform::{Event, Platform};
pub use scheduler::{ScanState, Scanner};
