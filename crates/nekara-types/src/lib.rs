//! Core types for the Nekara node protocol.
//!
//! This crate defines the configuration and identity service shared by the
//! wire crate and its transports. It contains no protocol logic.

pub mod config;
pub mod ids;
