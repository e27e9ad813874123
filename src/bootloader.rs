//! Bootloader update state machine.
//!
//! A strictly linear handshake: synchronize, negotiate device id and
//! firmware length, erase, stream data into flash, then hand off. One
//! timer bounds every step; any timeout or unexpected packet sends NACK
//! and abandons the update. After the loop the installed image is
//! verified and the caller is told whether to launch it or reset.

use embedded_io::Write;
use embedded_storage::nor_flash::{NorFlash, ReadNorFlash};

use crate::comms::{control, Comms, Packet, PacketKind};
use crate::flash::AppRegion;
use crate::image::{self, FirmwareInfo, ImageLayout};
use crate::ring::{Ring, RX_RING_CAPACITY};
use crate::time::{Clock, SimpleTimer};

/// Unframed four-byte preamble that opens a session.
pub const SYNC_SEQ: [u8; 4] = [0xC4, 0x55, 0x7E, 0x10];

/// Per-step timeout.
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;
/// Flash reserved for the bootloader itself, in front of the application
/// region.
pub const DEFAULT_BOOTLOADER_SIZE: u32 = 0x8000;
/// Application region size on the default 512 KiB part.
pub const DEFAULT_MAX_FW_LENGTH: u32 = 512 * 1024 - DEFAULT_BOOTLOADER_SIZE;
/// Default device identifier, one byte with room to grow.
pub const DEFAULT_DEVICE_ID: u8 = 0x42;

/// Handshake steps, in protocol order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum State {
    Sync,
    WaitForUpdateReq,
    DeviceIdReq,
    DeviceIdRes,
    FwLengthReq,
    FwLengthRes,
    EraseApplication,
    ReceiveFirmware,
    Done,
}

/// What the platform should do once the bootloader is finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Boot {
    /// Image verified: branch to the application's reset vector (the
    /// second word at the application base).
    Launch(FirmwareInfo),
    /// Verification failed: issue a processor reset, which lands back in
    /// the bootloader.
    Reset,
}

/// Build-time parameters of the bootloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    pub device_id: u8,
    /// Offset of the application region from the flash start.
    pub app_offset: u32,
    /// Application region size; also the firmware length ceiling.
    pub max_fw_length: u32,
    pub timeout_ms: u64,
    pub key: [u8; 16],
    pub layout: ImageLayout,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_id: DEFAULT_DEVICE_ID,
            app_offset: DEFAULT_BOOTLOADER_SIZE,
            max_fw_length: DEFAULT_MAX_FW_LENGTH,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            key: [0u8; 16],
            layout: ImageLayout::default(),
        }
    }
}

/// The bootloader core. Owns the packet link and the application region;
/// borrows the RX byte ring (shared with the serial ISR) and the clock.
pub struct Bootloader<'r, W, F, C, const RX: usize = RX_RING_CAPACITY>
where
    W: Write,
    F: NorFlash + ReadNorFlash,
    C: Clock,
{
    config: Config,
    state: State,
    fw_length: u32,
    bytes_written: u32,
    sync_window: [u8; 4],
    comms: Comms<W>,
    timer: SimpleTimer,
    flash: AppRegion<F>,
    rx: &'r Ring<u8, RX>,
    clock: &'r C,
}

impl<'r, W, F, C, const RX: usize> Bootloader<'r, W, F, C, RX>
where
    W: Write,
    F: NorFlash + ReadNorFlash,
    C: Clock,
{
    pub fn new(config: Config, serial: W, flash: F, rx: &'r Ring<u8, RX>, clock: &'r C) -> Self {
        let timer = SimpleTimer::new(clock, config.timeout_ms, false);
        let flash = AppRegion::new(flash, config.app_offset, config.max_fw_length);
        Self {
            config,
            state: State::Sync,
            fw_length: 0,
            bytes_written: 0,
            sync_window: [0u8; 4],
            comms: Comms::new(serial),
            timer,
            flash,
            rx,
            clock,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn bytes_written(&self) -> u32 {
        self.bytes_written
    }

    /// Drive the handshake to completion, then verify the installed image
    /// and report the boot decision.
    pub fn run(&mut self) -> Result<Boot, W::Error> {
        while !self.poll()? {}
        self.finish()
    }

    /// One main-loop iteration. Returns `Ok(true)` once the machine is
    /// `Done`.
    pub fn poll(&mut self) -> Result<bool, W::Error> {
        match self.state {
            State::Done => return Ok(true),
            // While synchronizing, bytes bypass the frame parser: match
            // the preamble in a sliding window straight off the ring.
            State::Sync => {
                if let Some(byte) = self.rx.pop() {
                    self.sync_window.copy_within(1.., 0);
                    self.sync_window[3] = byte;
                    if self.sync_window == SYNC_SEQ {
                        debug!("sync observed");
                        self.respond(control::SYNC_OBSERVED)?;
                        self.timer.reset(self.clock);
                        self.state = State::WaitForUpdateReq;
                    } else {
                        self.check_timeout()?;
                    }
                } else {
                    self.check_timeout()?;
                }
                return Ok(false);
            }
            _ => {}
        }

        self.comms.update(self.rx)?;

        match self.state {
            State::Sync | State::Done => unreachable!("handled above"),

            State::WaitForUpdateReq => {
                if let Some(packet) = self.comms.read() {
                    if packet.kind() == PacketKind::FwUpdateReq {
                        self.timer.reset(self.clock);
                        self.respond(control::FW_UPDATE_RES)?;
                        self.state = State::DeviceIdReq;
                    } else {
                        self.fail("expected update request")?;
                    }
                } else {
                    self.check_timeout()?;
                }
            }

            State::DeviceIdReq => {
                self.timer.reset(self.clock);
                self.respond(control::DEVICE_ID_REQ)?;
                self.state = State::DeviceIdRes;
            }

            State::DeviceIdRes => {
                if let Some(packet) = self.comms.read() {
                    match packet.kind() {
                        PacketKind::DeviceIdRes { device_id } if device_id == self.config.device_id => {
                            self.timer.reset(self.clock);
                            self.state = State::FwLengthReq;
                        }
                        _ => self.fail("device id mismatch")?,
                    }
                } else {
                    self.check_timeout()?;
                }
            }

            State::FwLengthReq => {
                self.timer.reset(self.clock);
                self.respond(control::FW_LENGTH_REQ)?;
                self.state = State::FwLengthRes;
            }

            State::FwLengthRes => {
                if let Some(packet) = self.comms.read() {
                    match packet.kind() {
                        PacketKind::FwLengthRes { length } if length <= self.config.max_fw_length => {
                            debug!("firmware length {}", length);
                            self.fw_length = length;
                            self.timer.reset(self.clock);
                            self.state = State::EraseApplication;
                        }
                        _ => self.fail("bad firmware length")?,
                    }
                } else {
                    self.check_timeout()?;
                }
            }

            State::EraseApplication => {
                info!("erasing application region");
                if let Err(e) = self.flash.erase() {
                    // surfaces later through image verification
                    warn!("erase failed: {}", e);
                }
                self.respond(control::READY_FOR_DATA)?;
                // erase and the response transmit both block for a while
                self.timer.reset(self.clock);
                self.state = State::ReceiveFirmware;
            }

            State::ReceiveFirmware => {
                if let Some(packet) = self.comms.read() {
                    if packet.kind() == PacketKind::Data {
                        let count = packet.data_len();
                        if let Err(e) = self.flash.program(self.bytes_written, &packet.data[..count]) {
                            warn!("program failed: {}", e);
                        }
                        self.bytes_written += count as u32;
                        self.timer.reset(self.clock);

                        if self.bytes_written >= self.fw_length {
                            info!("received {} bytes, update complete", self.bytes_written);
                            self.respond(control::UPDATE_SUCCESSFUL)?;
                            self.state = State::Done;
                        } else {
                            self.respond(control::READY_FOR_DATA)?;
                        }
                    } else {
                        self.fail("control packet during data transfer")?;
                    }
                } else {
                    self.check_timeout()?;
                }
            }
        }

        Ok(self.state == State::Done)
    }

    /// Post-loop wrap-up: drain the transmitter so the host sees the last
    /// frame, then verify the installed image. The platform tears down the
    /// serial peripheral and GPIOs afterwards, in reverse order of setup.
    pub fn finish(&mut self) -> Result<Boot, W::Error> {
        self.comms.flush()?;

        match image::validate_image(
            &mut self.flash,
            &self.config.layout,
            u32::from(self.config.device_id),
            &self.config.key,
        ) {
            Ok(info) => {
                info!("image valid, version {}", info.version);
                Ok(Boot::Launch(info))
            }
            Err(e) => {
                warn!("image rejected: {}", e);
                Ok(Boot::Reset)
            }
        }
    }

    fn respond(&mut self, byte: u8) -> Result<(), W::Error> {
        self.comms.write(&Packet::single_byte(byte))
    }

    fn fail(&mut self, reason: &'static str) -> Result<(), W::Error> {
        warn!("update failed: {}", reason);
        self.respond(control::NACK)?;
        self.state = State::Done;
        Ok(())
    }

    fn check_timeout(&mut self) -> Result<(), W::Error> {
        if self.timer.has_elapsed(self.clock) {
            self.fail("step timed out")?;
        }
        Ok(())
    }
}
