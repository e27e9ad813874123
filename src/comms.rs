//! Framed packet link over a byte-oriented serial stream.
//!
//! Frames are a fixed 18 bytes: `length | data[16] | crc8`. The CRC covers
//! `length | data`. Corrupt frames are answered with a retransmit request;
//! every accepted non-control frame is acknowledged. The inbound parser
//! pulls bytes from the RX ring, the outbound path writes synchronously to
//! the serial transmitter and keeps a copy of the last frame for
//! retransmission.

use embedded_io::Write;

use crate::crc::crc8;
use crate::ring::{Ring, PACKET_RING_CAPACITY};

/// Payload bytes carried by every frame.
pub const PACKET_DATA_SIZE: usize = 16;
/// On-wire frame size: length byte, data, CRC byte.
pub const PACKET_WIRE_SIZE: usize = PACKET_DATA_SIZE + 2;

/// Filler for unused payload tail bytes. Control-packet predicates reject
/// frames whose tail differs.
pub const PACKET_PADDING: u8 = 0xFF;

/// Control packet discriminants, carried in `data[0]` of short packets.
pub mod control {
    pub const ACK: u8 = 0x15;
    pub const RETX: u8 = 0x19;
    pub const SYNC_OBSERVED: u8 = 0x20;
    pub const FW_UPDATE_REQ: u8 = 0x31;
    pub const FW_UPDATE_RES: u8 = 0x37;
    pub const DEVICE_ID_REQ: u8 = 0x3C;
    pub const DEVICE_ID_RES: u8 = 0x3F;
    pub const FW_LENGTH_REQ: u8 = 0x42;
    pub const FW_LENGTH_RES: u8 = 0x45;
    pub const READY_FOR_DATA: u8 = 0x48;
    pub const UPDATE_SUCCESSFUL: u8 = 0x54;
    pub const NACK: u8 = 0x59;
}

/// One 18-byte frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Packet {
    pub length: u8,
    pub data: [u8; PACKET_DATA_SIZE],
    pub crc: u8,
}

/// Meaning of a CRC-valid frame, classified by shape.
///
/// Extended responses carry their discriminant in `data[0]` and parameters
/// after it; anything that matches no control shape is firmware data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PacketKind {
    Ack,
    Retx,
    SyncObserved,
    FwUpdateReq,
    FwUpdateRes,
    DeviceIdReq,
    DeviceIdRes { device_id: u8 },
    FwLengthReq,
    FwLengthRes { length: u32 },
    ReadyForData,
    UpdateSuccessful,
    Nack,
    Data,
}

impl Packet {
    /// Build a frame from 1..=16 payload bytes; the tail is padded and the
    /// CRC filled in.
    pub fn new(payload: &[u8]) -> Self {
        debug_assert!(!payload.is_empty() && payload.len() <= PACKET_DATA_SIZE);

        let mut data = [PACKET_PADDING; PACKET_DATA_SIZE];
        data[..payload.len()].copy_from_slice(payload);
        let mut packet = Self {
            length: payload.len() as u8,
            data,
            crc: 0,
        };
        packet.crc = packet.compute_crc();
        packet
    }

    /// A control frame: one meaningful byte, padded tail.
    pub fn single_byte(byte: u8) -> Self {
        Self::new(&[byte])
    }

    /// CRC-8 over the serialized `length | data` prefix.
    pub fn compute_crc(&self) -> u8 {
        let bytes = self.to_bytes();
        crc8(&bytes[..PACKET_WIRE_SIZE - 1])
    }

    pub fn to_bytes(&self) -> [u8; PACKET_WIRE_SIZE] {
        let mut bytes = [0u8; PACKET_WIRE_SIZE];
        bytes[0] = self.length;
        bytes[1..1 + PACKET_DATA_SIZE].copy_from_slice(&self.data);
        bytes[PACKET_WIRE_SIZE - 1] = self.crc;
        bytes
    }

    /// Strict single-byte shape test: length 1, `data[0] == byte`, padded
    /// tail. Assumes the CRC already checked out.
    pub fn is_single_byte(&self, byte: u8) -> bool {
        self.length == 1 && self.data[0] == byte && self.padded_from(1)
    }

    /// Payload byte count of a firmware-data frame: the low nibble encodes
    /// 1..=16 as `n - 1`.
    pub fn data_len(&self) -> usize {
        usize::from(self.length & 0x0F) + 1
    }

    fn padded_from(&self, index: usize) -> bool {
        self.data[index..].iter().all(|&b| b == PACKET_PADDING)
    }

    pub fn kind(&self) -> PacketKind {
        if self.length == 1 && self.padded_from(1) {
            match self.data[0] {
                control::ACK => return PacketKind::Ack,
                control::RETX => return PacketKind::Retx,
                control::SYNC_OBSERVED => return PacketKind::SyncObserved,
                control::FW_UPDATE_REQ => return PacketKind::FwUpdateReq,
                control::FW_UPDATE_RES => return PacketKind::FwUpdateRes,
                control::DEVICE_ID_REQ => return PacketKind::DeviceIdReq,
                control::FW_LENGTH_REQ => return PacketKind::FwLengthReq,
                control::READY_FOR_DATA => return PacketKind::ReadyForData,
                control::UPDATE_SUCCESSFUL => return PacketKind::UpdateSuccessful,
                control::NACK => return PacketKind::Nack,
                _ => {}
            }
        }
        if self.length == 2 && self.data[0] == control::DEVICE_ID_RES && self.padded_from(2) {
            return PacketKind::DeviceIdRes {
                device_id: self.data[1],
            };
        }
        if self.length == 5 && self.data[0] == control::FW_LENGTH_RES && self.padded_from(5) {
            let length = u32::from_le_bytes([self.data[1], self.data[2], self.data[3], self.data[4]]);
            return PacketKind::FwLengthRes { length };
        }
        PacketKind::Data
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RxState {
    Length,
    Data,
    Crc,
}

/// Packet link endpoint over a blocking serial transmitter.
pub struct Comms<W: Write> {
    serial: W,
    rx_state: RxState,
    rx_count: usize,
    rx_scratch: Packet,
    packets: Ring<Packet, PACKET_RING_CAPACITY>,
    last_transmitted: Option<Packet>,
    ack: Packet,
    retx: Packet,
}

impl<W: Write> Comms<W> {
    pub fn new(serial: W) -> Self {
        Self {
            serial,
            rx_state: RxState::Length,
            rx_count: 0,
            rx_scratch: Packet::new(&[0]),
            packets: Ring::new(),
            last_transmitted: None,
            ack: Packet::single_byte(control::ACK),
            retx: Packet::single_byte(control::RETX),
        }
    }

    /// Drain the RX byte ring through the frame parser, acknowledging,
    /// requesting retransmits, and buffering complete packets.
    pub fn update<const N: usize>(&mut self, rx: &Ring<u8, N>) -> Result<(), W::Error> {
        while let Some(byte) = rx.pop() {
            match self.rx_state {
                RxState::Length => {
                    self.rx_scratch.length = byte;
                    self.rx_state = RxState::Data;
                }
                RxState::Data => {
                    self.rx_scratch.data[self.rx_count] = byte;
                    self.rx_count += 1;
                    if self.rx_count == PACKET_DATA_SIZE {
                        self.rx_count = 0;
                        self.rx_state = RxState::Crc;
                    }
                }
                RxState::Crc => {
                    self.rx_scratch.crc = byte;
                    self.rx_state = RxState::Length;

                    if self.rx_scratch.crc != self.rx_scratch.compute_crc() {
                        trace!("bad frame crc, requesting retransmit");
                        let retx = self.retx;
                        self.transmit(&retx)?;
                        continue;
                    }

                    if self.rx_scratch.is_single_byte(control::RETX) {
                        if let Some(last) = self.last_transmitted {
                            self.transmit(&last)?;
                        }
                        continue;
                    }

                    if self.rx_scratch.is_single_byte(control::ACK) {
                        continue;
                    }

                    if !self.packets.push(self.rx_scratch) {
                        // both ends of the packet ring live on the main
                        // loop, so overflow is a sizing bug
                        debug_assert!(false, "packet ring overflow");
                    }
                    let ack = self.ack;
                    self.transmit(&ack)?;
                }
            }
        }
        Ok(())
    }

    pub fn packets_available(&self) -> bool {
        !self.packets.is_empty()
    }

    /// Next buffered inbound packet, FIFO.
    pub fn read(&mut self) -> Option<Packet> {
        self.packets.pop()
    }

    /// Send a frame and remember it for retransmission. ACK and RETX are
    /// never themselves retransmitted, so they don't replace the copy.
    pub fn write(&mut self, packet: &Packet) -> Result<(), W::Error> {
        self.transmit(packet)?;
        if !packet.is_single_byte(control::ACK) && !packet.is_single_byte(control::RETX) {
            self.last_transmitted = Some(*packet);
        }
        Ok(())
    }

    /// Block until the transmitter has drained.
    pub fn flush(&mut self) -> Result<(), W::Error> {
        self.serial.flush()
    }

    fn transmit(&mut self, packet: &Packet) -> Result<(), W::Error> {
        self.serial.write_all(&packet.to_bytes())
    }
}

#[cfg(test)]
mod tests {
    use std::vec::Vec;

    use super::*;
    use crate::mock::{frames, MockSerial};
    use crate::ring::RX_RING_CAPACITY;

    fn feed(rx: &Ring<u8, RX_RING_CAPACITY>, bytes: &[u8]) {
        for &b in bytes {
            assert!(rx.push(b));
        }
    }

    #[test]
    fn single_byte_packet_round_trip() {
        for byte in [control::ACK, control::SYNC_OBSERVED, 0x00, 0xAB] {
            let packet = Packet::single_byte(byte);
            assert_eq!(packet.length, 1);
            assert_eq!(packet.crc, packet.compute_crc());
            assert!(packet.is_single_byte(byte));
            assert!(!packet.is_single_byte(byte.wrapping_add(1)));
        }
    }

    #[test]
    fn single_byte_shape_is_strict() {
        let mut packet = Packet::single_byte(control::ACK);
        packet.data[9] = 0x00; // corrupt the padding
        assert!(!packet.is_single_byte(control::ACK));

        let mut packet = Packet::single_byte(control::ACK);
        packet.length = 2;
        assert!(!packet.is_single_byte(control::ACK));
    }

    #[test]
    fn kind_classification() {
        assert_eq!(Packet::single_byte(control::FW_UPDATE_REQ).kind(), PacketKind::FwUpdateReq);
        assert_eq!(Packet::single_byte(control::NACK).kind(), PacketKind::Nack);

        let id = Packet::new(&[control::DEVICE_ID_RES, 0x42]);
        assert_eq!(id.kind(), PacketKind::DeviceIdRes { device_id: 0x42 });

        let length = Packet::new(&[control::FW_LENGTH_RES, 0x30, 0x00, 0x01, 0x00]);
        assert_eq!(length.kind(), PacketKind::FwLengthRes { length: 0x0001_0030 });

        // 16 payload bytes, length nibble 0x0F
        let mut data = Packet::new(&[0u8; 1]);
        data.length = 0x0F;
        data.data = [0x5A; PACKET_DATA_SIZE];
        data.crc = data.compute_crc();
        assert_eq!(data.kind(), PacketKind::Data);
        assert_eq!(data.data_len(), 16);
    }

    #[test]
    fn parser_accepts_valid_frame_and_acks() {
        let rx: Ring<u8, RX_RING_CAPACITY> = Ring::new();
        let mut comms = Comms::new(MockSerial::new());

        let packet = Packet::new(&[control::FW_UPDATE_REQ]);
        feed(&rx, &packet.to_bytes());
        comms.update(&rx).unwrap();

        assert!(comms.packets_available());
        assert_eq!(comms.read(), Some(packet));
        assert_eq!(comms.read(), None);

        let sent = frames(&comms.serial.tx);
        assert_eq!(sent.len(), 1);
        assert!(sent[0].is_single_byte(control::ACK));
    }

    #[test]
    fn parser_requests_retransmit_on_bad_crc() {
        let rx: Ring<u8, RX_RING_CAPACITY> = Ring::new();
        let mut comms = Comms::new(MockSerial::new());

        let mut bytes = Packet::new(&[control::FW_UPDATE_REQ]).to_bytes();
        bytes[PACKET_WIRE_SIZE - 1] ^= 0xFF;
        feed(&rx, &bytes);
        comms.update(&rx).unwrap();

        assert!(!comms.packets_available());
        let sent = frames(&comms.serial.tx);
        assert_eq!(sent.len(), 1);
        assert!(sent[0].is_single_byte(control::RETX));
    }

    #[test]
    fn inbound_retx_resends_last_written_packet() {
        let rx: Ring<u8, RX_RING_CAPACITY> = Ring::new();
        let mut comms = Comms::new(MockSerial::new());

        let response = Packet::single_byte(control::FW_UPDATE_RES);
        comms.write(&response).unwrap();
        feed(&rx, &Packet::single_byte(control::RETX).to_bytes());
        comms.update(&rx).unwrap();

        let sent = frames(&comms.serial.tx);
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1], response);
        // the retransmit request itself is not buffered
        assert!(!comms.packets_available());
    }

    #[test]
    fn ack_and_retx_do_not_replace_last_transmitted() {
        let rx: Ring<u8, RX_RING_CAPACITY> = Ring::new();
        let mut comms = Comms::new(MockSerial::new());

        let response = Packet::single_byte(control::READY_FOR_DATA);
        comms.write(&response).unwrap();
        comms.write(&Packet::single_byte(control::ACK)).unwrap();

        feed(&rx, &Packet::single_byte(control::RETX).to_bytes());
        comms.update(&rx).unwrap();

        let sent = frames(&comms.serial.tx);
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[2], response);
    }

    #[test]
    fn inbound_ack_is_discarded() {
        let rx: Ring<u8, RX_RING_CAPACITY> = Ring::new();
        let mut comms = Comms::new(MockSerial::new());

        feed(&rx, &Packet::single_byte(control::ACK).to_bytes());
        comms.update(&rx).unwrap();

        assert!(!comms.packets_available());
        assert!(comms.serial.tx.is_empty());
    }

    #[test]
    fn mixed_stream_counts_match() {
        // invariant: buffered packets == valid non-control frames,
        // ACKs emitted == that count, RETX emitted == corrupt frames
        let rx: Ring<u8, RX_RING_CAPACITY> = Ring::new();
        let mut comms = Comms::new(MockSerial::new());

        let mut stream = Vec::new();
        let good: [Packet; 3] = [
            Packet::new(&[control::FW_UPDATE_REQ]),
            Packet::new(&[control::DEVICE_ID_RES, 0x42]),
            Packet::new(&[1, 2, 3, 4, 5, 6]),
        ];
        stream.extend_from_slice(&good[0].to_bytes());
        let mut corrupt = good[1].to_bytes();
        corrupt[3] ^= 0x10;
        stream.extend_from_slice(&corrupt);
        stream.extend_from_slice(&good[1].to_bytes());
        stream.extend_from_slice(&Packet::single_byte(control::ACK).to_bytes());
        stream.extend_from_slice(&good[2].to_bytes());

        let mut buffered = 0;
        for chunk in stream.chunks(16) {
            feed(&rx, chunk);
            comms.update(&rx).unwrap();
            while comms.read().is_some() {
                buffered += 1;
            }
        }
        assert_eq!(buffered, 3);

        let sent = frames(&comms.serial.tx);
        let acks = sent.iter().filter(|p| p.is_single_byte(control::ACK)).count();
        let retxs = sent.iter().filter(|p| p.is_single_byte(control::RETX)).count();
        assert_eq!(acks, 3);
        assert_eq!(retxs, 1);
    }
}
