//! Instrument communication: the shared connection, identification and the
//! capability traits every driver implements.

pub mod capabilities;
pub mod connection;
pub mod identity;

pub use capabilities::{
    Chan, Coupling, Dmm, DmmSetup, EngUnit, OutputReading, Psu, SampleMode, Scope, Slope,
    TimeSettings,
};
pub use connection::{
    find_serial_port, is_serial_address, to_clean_string, Connection, ConnectionOptions, Eol,
};
pub use identity::Identity;
