//! Application-region flash programming.
//!
//! Wraps the platform's NOR flash driver with the bounds of the updateable
//! region, directly after the bootloader. Erase covers the whole region at
//! once (the driver decomposes it into sector erases and may block for
//! seconds); programming is byte-ranged and never allowed to leave the
//! region. Erase-before-program discipline is the caller's job.

use embedded_storage::nor_flash::{NorFlash, NorFlashError, ReadNorFlash};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The access would leave the application region.
    OutOfBounds,
    /// Driver-reported failure.
    Flash(embedded_storage::nor_flash::NorFlashErrorKind),
}

#[cfg(feature = "defmt")]
impl defmt::Format for Error {
    fn format(&self, f: defmt::Formatter) {
        match self {
            Error::OutOfBounds => defmt::write!(f, "OutOfBounds"),
            Error::Flash(kind) => defmt::write!(f, "Flash({})", defmt::Debug2Format(kind)),
        }
    }
}

/// The application region of the program flash.
pub struct AppRegion<F> {
    flash: F,
    base: u32,
    capacity: u32,
}

impl<F> AppRegion<F> {
    /// `base` is the region's offset from the flash start (the bootloader
    /// size), `capacity` the region size in bytes.
    pub fn new(flash: F, base: u32, capacity: u32) -> Self {
        Self { flash, base, capacity }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    fn check_range(&self, offset: u32, len: usize) -> Result<(), Error> {
        let end = offset.checked_add(len as u32).ok_or(Error::OutOfBounds)?;
        if end > self.capacity {
            return Err(Error::OutOfBounds);
        }
        Ok(())
    }
}

impl<F: NorFlash> AppRegion<F> {
    /// Erase the whole application region. Blocking; may take seconds.
    pub fn erase(&mut self) -> Result<(), Error> {
        self.flash
            .erase(self.base, self.base + self.capacity)
            .map_err(|e| Error::Flash(e.kind()))
    }

    /// Program `bytes` at `offset` within the region. The target range
    /// must have been erased since it was last programmed.
    pub fn program(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Error> {
        self.check_range(offset, bytes.len())?;
        self.flash
            .write(self.base + offset, bytes)
            .map_err(|e| Error::Flash(e.kind()))
    }
}

impl<F: ReadNorFlash> AppRegion<F> {
    pub fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Error> {
        self.check_range(offset, bytes.len())?;
        self.flash
            .read(self.base + offset, bytes)
            .map_err(|e| Error::Flash(e.kind()))
    }
}
