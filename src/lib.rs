//! Core library for bench-instrument automation.
//!
//! Drivers for oscilloscopes, power supplies and multimeters share one
//! line-oriented [`instrument::Connection`] over serial or TCP (or, for the
//! Analog Discovery, a register-level SDK handle) and expose the capability
//! traits [`instrument::Psu`], [`instrument::Dmm`] and [`instrument::Scope`].
//! Scope captures come back as [`data::Capture`], ready for plotting.

pub mod acquisition;
pub mod adapters;
pub mod config;
pub mod data;
pub mod error;
pub mod hardware;
pub mod instrument;
pub mod instruments;
pub mod logging;
pub mod units;
