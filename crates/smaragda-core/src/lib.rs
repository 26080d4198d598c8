//! Core data model of the Smaragda knowledge kernel: identifiers,
//! timestamps, tessella kinds with typed payloads, schema definition types,
//! cron expressions, and the in-memory filetree.
//!
//! This crate is pure data, no storage and no I/O.

pub mod cron;
pub mod defs;
pub mod filetree;
pub mod id;
mod macros;
pub mod tessella;
mod timestamp;

pub use self::id::ResId;
pub use self::tessella::{Tessella, TessellaContent, TessellaId};
pub use self::timestamp::{Timestamp, TimestampParseError};
