//! Firmware image layout and integrity verification.
//!
//! An installed image starts at the application base with the chip's
//! vector table, then a 16-byte info header, then a 16-byte signature
//! block, then the application itself. `length` counts the whole image,
//! header and signature included. The signature is the AES-128 CBC-MAC of
//! the image with the header block fed first and the header+signature
//! blocks themselves skipped.

use embedded_storage::nor_flash::ReadNorFlash;
use static_assertions::const_assert_eq;

use crate::aes::{Block, CbcMac, BLOCK_SIZE, KEY_SIZE};
use crate::flash::AppRegion;

/// Marks a populated firmware-info header.
pub const SENTINEL: u32 = 0xDEAD_C0DE;

/// Info header size: exactly one cipher block.
pub const INFO_SIZE: usize = BLOCK_SIZE;
/// Signature block size: one cipher block of raw MAC bytes.
pub const SIGNATURE_SIZE: usize = BLOCK_SIZE;

const_assert_eq!(INFO_SIZE, 16);

/// The firmware-info header, little-endian on flash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FirmwareInfo {
    pub sentinel: u32,
    pub device_id: u32,
    pub version: u32,
    /// Total image size in bytes, header and signature included.
    pub length: u32,
}

impl FirmwareInfo {
    pub fn from_bytes(block: &[u8; INFO_SIZE]) -> Self {
        let word = |i: usize| u32::from_le_bytes(block[4 * i..4 * i + 4].try_into().unwrap());
        Self {
            sentinel: word(0),
            device_id: word(1),
            version: word(2),
            length: word(3),
        }
    }

    pub fn to_bytes(&self) -> [u8; INFO_SIZE] {
        let mut block = [0u8; INFO_SIZE];
        for (i, field) in [self.sentinel, self.device_id, self.version, self.length]
            .into_iter()
            .enumerate()
        {
            block[4 * i..4 * i + 4].copy_from_slice(&field.to_le_bytes());
        }
        block
    }
}

/// Where the info header sits inside the application region: directly
/// after the chip's vector table, 16-byte aligned (the linker guarantees
/// the alignment at build time).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ImageLayout {
    pub vector_table_size: u32,
}

impl ImageLayout {
    pub fn new(vector_table_size: u32) -> Self {
        debug_assert!(vector_table_size % BLOCK_SIZE as u32 == 0);
        Self { vector_table_size }
    }

    pub fn info_offset(&self) -> u32 {
        self.vector_table_size
    }

    pub fn signature_offset(&self) -> u32 {
        self.vector_table_size + INFO_SIZE as u32
    }
}

impl Default for ImageLayout {
    fn default() -> Self {
        // Cortex-M4-class vector table, rounded up to block alignment
        Self::new(0x1B0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ImageError {
    /// Header sentinel missing: no image installed, or the header was
    /// clobbered.
    BadSentinel,
    /// The image was built for a different device.
    WrongDeviceId,
    /// Declared length exceeds the application region.
    BadLength,
    /// Computed MAC differs from the signature block.
    BadSignature,
    /// Flash read failed while verifying.
    Flash,
}

impl From<crate::flash::Error> for ImageError {
    fn from(_: crate::flash::Error) -> Self {
        ImageError::Flash
    }
}

/// Check the installed image: sentinel, device id, declared length, and
/// the CBC-MAC against the signature block. Read-only; never touches
/// flash contents.
pub fn validate_image<F: ReadNorFlash>(
    region: &mut AppRegion<F>,
    layout: &ImageLayout,
    device_id: u32,
    key: &[u8; KEY_SIZE],
) -> Result<FirmwareInfo, ImageError> {
    let mut block: Block = [0u8; BLOCK_SIZE];
    region.read(layout.info_offset(), &mut block)?;
    let info = FirmwareInfo::from_bytes(&block);

    if info.sentinel != SENTINEL {
        return Err(ImageError::BadSentinel);
    }
    if info.device_id != device_id {
        return Err(ImageError::WrongDeviceId);
    }
    if info.length > region.capacity() {
        return Err(ImageError::BadLength);
    }

    let mut signature = [0u8; SIGNATURE_SIZE];
    region.read(layout.signature_offset(), &mut signature)?;

    let mut mac = CbcMac::new(key);
    // the header block chains first, against the zero IV
    mac.update(&block);

    let length = info.length;
    let remainder = length % BLOCK_SIZE as u32;
    let pad = (BLOCK_SIZE as u32 - remainder) as u8;

    let mut offset = 0u32;
    while offset < length {
        if offset == layout.info_offset() {
            // header and signature blocks are not part of the MAC input
            offset += (INFO_SIZE + SIGNATURE_SIZE) as u32;
            continue;
        }

        let remaining = length - offset;
        if remaining >= BLOCK_SIZE as u32 {
            region.read(offset, &mut block)?;
        } else {
            // final partial block, PKCS#7 tail
            block = [pad; BLOCK_SIZE];
            region.read(offset, &mut block[..remaining as usize])?;
        }
        mac.update(&block);
        offset += BLOCK_SIZE as u32;
    }
    if remainder == 0 {
        mac.update(&[BLOCK_SIZE as u8; BLOCK_SIZE]);
    }

    if mac.finalize() != signature {
        return Err(ImageError::BadSignature);
    }
    Ok(info)
}
