//! Test doubles for the hardware seams: a serial sink, a NOR flash array,
//! and a manually-advanced clock.

use core::cell::Cell;
use core::convert::Infallible;

use embedded_storage::nor_flash::{
    ErrorType, NorFlash, NorFlashError, NorFlashErrorKind, ReadNorFlash,
};
use std::vec::Vec;

use crate::comms::{Packet, PACKET_DATA_SIZE, PACKET_WIRE_SIZE};
use crate::time::Clock;

/// Outbound serial endpoint that records every byte written.
pub struct MockSerial {
    pub tx: Vec<u8>,
}

impl MockSerial {
    pub fn new() -> Self {
        Self { tx: Vec::new() }
    }
}

impl embedded_io::ErrorType for MockSerial {
    type Error = Infallible;
}

impl embedded_io::Write for MockSerial {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        self.tx.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// Split a captured TX byte stream into 18-byte frames.
pub fn frames(bytes: &[u8]) -> Vec<Packet> {
    assert_eq!(bytes.len() % PACKET_WIRE_SIZE, 0, "partial frame in TX capture");
    bytes
        .chunks(PACKET_WIRE_SIZE)
        .map(|chunk| {
            let mut data = [0u8; PACKET_DATA_SIZE];
            data.copy_from_slice(&chunk[1..1 + PACKET_DATA_SIZE]);
            Packet {
                length: chunk[0],
                data,
                crc: chunk[PACKET_WIRE_SIZE - 1],
            }
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockFlashError(pub NorFlashErrorKind);

impl NorFlashError for MockFlashError {
    fn kind(&self) -> NorFlashErrorKind {
        self.0
    }
}

/// In-memory NOR flash: erase sets 0xFF, programming ANDs bytes in, and
/// erase/program calls are counted so tests can assert "no flash writes".
pub struct MockFlash<const SIZE: usize> {
    pub mem: [u8; SIZE],
    pub erase_count: usize,
    pub program_count: usize,
}

impl<const SIZE: usize> MockFlash<SIZE> {
    pub const SECTOR_SIZE: usize = 1024;

    pub fn new() -> Self {
        Self {
            mem: [0xFF; SIZE],
            erase_count: 0,
            program_count: 0,
        }
    }
}

impl<const SIZE: usize> ErrorType for MockFlash<SIZE> {
    type Error = MockFlashError;
}

impl<const SIZE: usize> ReadNorFlash for MockFlash<SIZE> {
    const READ_SIZE: usize = 1;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        let offset = offset as usize;
        if offset + bytes.len() > SIZE {
            return Err(MockFlashError(NorFlashErrorKind::OutOfBounds));
        }
        bytes.copy_from_slice(&self.mem[offset..offset + bytes.len()]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        SIZE
    }
}

impl<const SIZE: usize> NorFlash for MockFlash<SIZE> {
    const WRITE_SIZE: usize = 1;
    const ERASE_SIZE: usize = Self::SECTOR_SIZE;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        let (from, to) = (from as usize, to as usize);
        if from > to || to > SIZE {
            return Err(MockFlashError(NorFlashErrorKind::OutOfBounds));
        }
        self.mem[from..to].fill(0xFF);
        self.erase_count += 1;
        Ok(())
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        let offset = offset as usize;
        if offset + bytes.len() > SIZE {
            return Err(MockFlashError(NorFlashErrorKind::OutOfBounds));
        }
        for (cell, &byte) in self.mem[offset..offset + bytes.len()].iter_mut().zip(bytes) {
            *cell &= byte;
        }
        self.program_count += 1;
        Ok(())
    }
}

/// Manually advanced millisecond clock.
pub struct TestClock {
    now: Cell<u64>,
}

impl TestClock {
    pub fn new() -> Self {
        Self { now: Cell::new(0) }
    }

    pub fn advance(&self, ms: u64) {
        self.now.set(self.now.get() + ms);
    }
}

impl Clock for TestClock {
    fn now(&self) -> u64 {
        self.now.get()
    }
}
