//! Core of a secure serial bootloader for resource-constrained MCUs.
//!
//! Three tightly-coupled subsystems:
//! - a framed, CRC-protected packet link with retransmit/ACK ([`comms`])
//! - the update-handshake state machine ([`bootloader`])
//! - an AES-128 CBC-MAC image verifier ([`image`], [`aes`])
//!
//! The crate is hardware-agnostic: outbound serial is any
//! [`embedded_io::Write`], program memory is any
//! [`embedded_storage::nor_flash::NorFlash`], and time comes from a
//! [`time::Clock`]. The platform crate owns register programming, the RX
//! interrupt handler (which feeds a [`ring::Ring`]), linker layout, and
//! the final vector jump or reset.

#![no_std]

#[cfg(test)]
extern crate std;

// macros must come first
mod fmt;

pub mod aes;
pub mod bootloader;
pub mod comms;
pub mod crc;
pub mod flash;
pub mod image;
pub mod ring;
pub mod time;

#[cfg(test)]
pub(crate) mod mock;

pub use bootloader::{Boot, Bootloader, Config};
