//! Pcapmap - memory-mapped packet capture file storage
//!
//! Captured packets are appended to (or read back from) a pcap file through
//! a shared memory mapping that grows on demand and is truncated to the
//! exact bytes used on close.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::cargo)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss,
    clippy::multiple_crate_versions
)]

pub mod config;
pub mod error;
pub mod registry;
pub mod spinlock;
pub mod storage;

pub use error::{PcapMapError, Result};
