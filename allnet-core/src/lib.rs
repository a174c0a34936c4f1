#![forbid(unsafe_code)]

//! Core packet router and peer fabric for the AllNet overlay.
//!
//! This crate implements the five hard, shared pieces of the overlay: the
//! inter-module pipe framing (`pipe`), the duplicate-suppression bloom cache
//! (`bloom`), the per-source rate tracker (`rate`), the fd-bounded peer
//! table and listener (`peer`), and the central forwarder (`forwarder`) that
//! ties them together. Everything else (local gateway, IP gateway, interface
//! broadcaster, supervisor) is built from these pieces.

pub mod bloom;
pub mod cache;
pub mod config;
pub mod error;
pub mod forwarder;
pub mod gateway;
pub mod iface;
pub mod keys;
pub mod metrics;
pub mod packet;
pub mod peer;
pub mod pipe;
pub mod rate;
pub mod supervisor;
pub mod telemetry;

pub use error::{CoreError, Result};
