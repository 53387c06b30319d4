//! Destination policy for vibedom.
//!
//! This module provides the TOML-based configuration system ([`config`]),
//! the domain whitelist and its matcher ([`whitelist`]), and hot reload of
//! whitelist and pattern catalog ([`reload`]).

pub mod config;
pub mod reload;
pub mod whitelist;
