//! Datagram format spoken on storlets bus endpoints
//!
//! A datagram is one command plus an ordered list of open file descriptors,
//! each described by a small metadata record. This crate only knows how to
//! validate and serialize those pieces; moving descriptors between processes
//! is left to the transport.

#[cfg(not(unix))]
compile_error!("storlets only works on unix");

#[macro_use] extern crate serde;


pub mod codec;

mod command;
mod datagram;
mod error;
mod fdtype;
mod params;
mod response;

pub use command::Command;
pub use datagram::{Datagram, Params, SBusFile, EXECUTE_FD_TYPES};
pub use error::ProtocolError;
pub use fdtype::{FdMetadata, FdType};
pub use params::StartDaemonParams;
pub use response::ServiceResponse;

/// Largest encoded datagram accepted by a receiver
pub const MAX_MESSAGE_LEN: usize = 64 * 1024;

/// Largest number of descriptors carried by one datagram
pub const MAX_FDS: usize = 32;
