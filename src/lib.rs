//! A TFTP (RFC 1350) server on top of smoltcp.
//!
//! The packet codec in [`packet`] builds without `std`. Everything that
//! touches files, sockets and the event loop needs the `std` feature.
#![cfg_attr(not(any(test, feature = "std")), no_std)]

#[macro_use]
mod macros;

pub mod error;
pub mod packet;

#[cfg(feature = "std")]
pub mod config;
#[cfg(all(feature = "std", unix))]
pub mod device;
#[cfg(feature = "std")]
pub mod registry;
#[cfg(feature = "std")]
pub mod server;
#[cfg(feature = "std")]
pub mod session;
#[cfg(feature = "std")]
pub mod socket;
#[cfg(feature = "std")]
pub mod transfer;
