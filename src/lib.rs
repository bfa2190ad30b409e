#![cfg_attr(docsrs, feature(doc_cfg))]
//! # jkpylon_lib
//!
//! This crate turns the serial status stream of a JK BMS (Jikong Battery
//! Management System) into the CAN frame set a Pylontech compatible
//! inverter expects. The [`bridge::Bridge`] type holds the whole pipeline:
//! frame reception and validation, field decoding, cell statistics,
//! voltage based SOC estimation, alarm tracking, CAN encoding and the
//! managed charge current limit.
//!
//! ## Features
//!
//! This crate uses a feature-based system to keep dependencies minimal.
//!
//! - `default`: Enables `bin-dependencies`, which is intended for compiling
//!   the `jkpylon` command-line tool and pulls in `serialport`, `socketcan`
//!   and `serde`.
//!
//! ### I/O Features
//! - `serialport`: Enables the synchronous BMS client using the
//!   `serialport` crate.
//! - `socketcan`: Enables the SocketCAN transmitter for the encoded frames.
//!
//! ### Utility Features
//! - `serde`: Enables `serde` support for serializing/deserializing data
//!   structures.
//! - `bin-dependencies`: Enables all features required by the `jkpylon`
//!   binary executable.

/// Contains error types for the library.
mod error;
/// Alarm bit tracking and display.
pub mod alarm;
/// The complete serial-to-CAN pipeline.
pub mod bridge;
/// Per-cell voltage aggregation and balancing statistics.
pub mod cells;
/// Managed CCCV charge current limiting.
pub mod charge;
/// Values derived from a decoded reply, with change tracking.
pub mod compute;
/// Defines the serial communication protocol of the JK BMS.
pub mod protocol;
/// Pylontech compatible CAN frame encoding.
pub mod pylontech;
/// Voltage based state of charge estimation.
pub mod soc;

pub use error::Error;

/// Synchronous serial client for the JK BMS.
#[cfg_attr(docsrs, doc(cfg(feature = "serialport")))]
#[cfg(feature = "serialport")]
pub mod serialport;

/// SocketCAN frame transmitter.
#[cfg_attr(docsrs, doc(cfg(feature = "socketcan")))]
#[cfg(feature = "socketcan")]
pub mod can;
