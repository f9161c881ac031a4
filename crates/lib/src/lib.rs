//! Tether core library — conversation correlation over an encrypted relay
//! channel, shared by the Tether CLI.

pub mod assembler;
pub mod client;
pub mod config;
pub mod correlator;
pub mod crypto;
pub mod delivery;
pub mod events;
pub mod protocol;
pub mod queue;
pub mod transport;
