//! Wire frame layout and typed accessors.
//!
//! A frame is a 16 byte header followed by up to 236 payload bytes,
//! stored in one 4-byte-aligned pool slot. All multi-byte fields are
//! little-endian, matching the on-air byte order:
//!
//! | offset | width | field             |
//! |--------|-------|-------------------|
//! | 0      | 2     | crc               |
//! | 2      | 1     | version           |
//! | 3      | 1     | serial_flags      |
//! | 4      | 8     | device_identifier |
//! | 12     | 1     | size              |
//! | 13     | 1     | service_number    |
//! | 14     | 1     | service_command   |
//! | 15     | 1     | service_flags     |
//! | 16     | size  | payload           |
//!
//! The CRC covers everything from the `version` byte through the last
//! declared payload byte; the CRC field itself and any slot padding
//! beyond `size` are excluded.

use crate::crc::crc16;
use crate::pool::PacketBox;

/// Bytes in the fixed frame header.
pub const HEADER_BYTES: usize = 16;
/// Maximum payload bytes in one frame.
pub const MAX_PAYLOAD: usize = 236;
/// Bytes in a maximum-size frame, and in every pool slot.
pub const FRAME_BYTES: usize = HEADER_BYTES + MAX_PAYLOAD;
/// Protocol version carried in every frame.
pub const VERSION: u8 = 1;

/// `serial_flags` bit: `device_identifier` names the recipient of the
/// frame rather than its source.
pub const FLAG_ID_IS_RECIPIENT: u8 = 0x01;

const CRC_OFF: usize = 0;
const VERSION_OFF: usize = 2;
const SERIAL_FLAGS_OFF: usize = 3;
const DEVICE_ID_OFF: usize = 4;
const SIZE_OFF: usize = 12;
const SERVICE_NUMBER_OFF: usize = 13;
const SERVICE_COMMAND_OFF: usize = 14;
const SERVICE_FLAGS_OFF: usize = 15;

/// Why a received frame was rejected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub(crate) enum RxFault {
    Version,
    Oversize,
    Crc,
}

/// Validate a freshly received slot: version, declared size, CRC.
///
/// Returns the declared payload size on success.
pub(crate) fn validate(raw: &[u8]) -> Result<usize, RxFault> {
    if raw[VERSION_OFF] != VERSION {
        return Err(RxFault::Version);
    }
    let size = raw[SIZE_OFF] as usize;
    if size > MAX_PAYLOAD {
        return Err(RxFault::Oversize);
    }
    let sent = u16::from_le_bytes([raw[CRC_OFF], raw[CRC_OFF + 1]]);
    let computed = crc16(&raw[VERSION_OFF..HEADER_BYTES + size]);
    if sent != computed {
        return Err(RxFault::Crc);
    }
    Ok(size)
}

/// Addressing and service routing fields of an outgoing frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub struct Header {
    /// Source or destination identity, per `serial_flags` bit 0.
    pub device_identifier: u64,
    /// Transport flags, see [FLAG_ID_IS_RECIPIENT].
    pub serial_flags: u8,
    /// Index into the addressed device's services, `0..=15`.
    pub service_number: u8,
    /// Service-defined opcode.
    pub service_command: u8,
    /// Service-defined flags.
    pub service_flags: u8,
}

/// One owned wire frame.
///
/// Wraps a [PacketBox] whose view always covers exactly
/// `header + declared payload` bytes.
pub struct Packet {
    pb: PacketBox,
}

impl Packet {
    /// Turn a free slot into an empty frame: zeroed header, current
    /// protocol version, no payload.
    pub fn new(mut pb: PacketBox) -> Self {
        pb.set_len(HEADER_BYTES);
        let hdr = &mut pb[..HEADER_BYTES];
        hdr.fill(0);
        hdr[VERSION_OFF] = VERSION;
        Packet { pb }
    }

    /// Wrap a slot whose contents and length were already set by the
    /// receive path.
    pub(crate) fn from_raw(pb: PacketBox) -> Self {
        Packet { pb }
    }

    /// Give the backing slot up, e.g. to hand it to the transfer engine.
    pub fn into_inner(self) -> PacketBox {
        self.pb
    }

    /// The transmitted CRC.
    pub fn crc(&self) -> u16 {
        u16::from_le_bytes([self.pb[CRC_OFF], self.pb[CRC_OFF + 1]])
    }

    /// Overwrite the CRC field.
    pub fn set_crc(&mut self, crc: u16) {
        self.pb[CRC_OFF..CRC_OFF + 2].copy_from_slice(&crc.to_le_bytes());
    }

    /// The protocol version byte.
    pub fn version(&self) -> u8 {
        self.pb[VERSION_OFF]
    }

    /// Transport flags.
    pub fn serial_flags(&self) -> u8 {
        self.pb[SERIAL_FLAGS_OFF]
    }

    /// Set the transport flags.
    pub fn set_serial_flags(&mut self, flags: u8) {
        self.pb[SERIAL_FLAGS_OFF] = flags;
    }

    /// Source or destination identity, per `serial_flags` bit 0.
    pub fn device_identifier(&self) -> u64 {
        u64::from_le_bytes(
            self.pb[DEVICE_ID_OFF..DEVICE_ID_OFF + 8]
                .try_into()
                .unwrap(),
        )
    }

    /// Set the device identity.
    pub fn set_device_identifier(&mut self, id: u64) {
        self.pb[DEVICE_ID_OFF..DEVICE_ID_OFF + 8].copy_from_slice(&id.to_le_bytes());
    }

    /// Declared payload length in bytes.
    pub fn size(&self) -> u8 {
        self.pb[SIZE_OFF]
    }

    /// Service index in the addressed device.
    pub fn service_number(&self) -> u8 {
        self.pb[SERVICE_NUMBER_OFF]
    }

    /// Set the service index.
    pub fn set_service_number(&mut self, number: u8) {
        self.pb[SERVICE_NUMBER_OFF] = number;
    }

    /// Service-defined opcode.
    pub fn service_command(&self) -> u8 {
        self.pb[SERVICE_COMMAND_OFF]
    }

    /// Set the service opcode.
    pub fn set_service_command(&mut self, command: u8) {
        self.pb[SERVICE_COMMAND_OFF] = command;
    }

    /// Service-defined flags.
    pub fn service_flags(&self) -> u8 {
        self.pb[SERVICE_FLAGS_OFF]
    }

    /// Set the service flags.
    pub fn set_service_flags(&mut self, flags: u8) {
        self.pb[SERVICE_FLAGS_OFF] = flags;
    }

    /// Copy all header routing fields in one go.
    pub fn set_header(&mut self, hdr: &Header) {
        self.set_device_identifier(hdr.device_identifier);
        self.set_serial_flags(hdr.serial_flags);
        self.set_service_number(hdr.service_number);
        self.set_service_command(hdr.service_command);
        self.set_service_flags(hdr.service_flags);
    }

    /// Borrow the payload.
    pub fn payload(&self) -> &[u8] {
        &self.pb[HEADER_BYTES..]
    }

    /// Mutably borrow the payload.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.pb[HEADER_BYTES..]
    }

    /// Replace the payload, adjusting the declared size.
    ///
    /// ## Panics
    ///
    /// `data` must fit in [MAX_PAYLOAD] bytes or this function will panic
    pub fn set_payload(&mut self, data: &[u8]) {
        if data.len() > MAX_PAYLOAD {
            unreachable!()
        }
        self.pb[SIZE_OFF] = data.len() as u8;
        self.pb.set_len(HEADER_BYTES + data.len());
        self.payload_mut().copy_from_slice(data);
    }

    /// Bytes that actually go on the air: header plus declared payload.
    pub fn wire_len(&self) -> usize {
        HEADER_BYTES + self.size() as usize
    }

    /// CRC over `[version .. end of payload)`.
    pub fn compute_crc(&self) -> u16 {
        crc16(&self.pb[VERSION_OFF..self.wire_len()])
    }

    /// Compute and store the CRC for the current contents.
    pub fn apply_crc(&mut self) {
        let crc = self.compute_crc();
        self.set_crc(crc);
    }

    /// Does the stored CRC match the contents?
    pub fn verify_crc(&self) -> bool {
        self.crc() == self.compute_crc()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{PacketStorage, RawPacketSlice};

    fn fresh_pool() -> RawPacketSlice {
        let storage: &'static PacketStorage<4> = Box::leak(Box::new(PacketStorage::new()));
        storage.take().unwrap()
    }

    fn sample(pool: &mut RawPacketSlice) -> Packet {
        let mut pkt = Packet::new(pool.allocate_raw().unwrap());
        pkt.set_header(&Header {
            device_identifier: 0x1122334455667788,
            serial_flags: FLAG_ID_IS_RECIPIENT,
            service_number: 1,
            service_command: 7,
            service_flags: 0,
        });
        pkt.set_payload(&[0x01, 0x02, 0x03]);
        pkt.apply_crc();
        pkt
    }

    #[test]
    fn wire_layout_is_little_endian() {
        let mut pool = fresh_pool();
        let pkt = sample(&mut pool);
        let raw = pkt.into_inner();

        assert_eq!(raw[2], VERSION);
        assert_eq!(raw[3], FLAG_ID_IS_RECIPIENT);
        // device identifier, least significant byte first
        assert_eq!(&raw[4..12], &[0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]);
        assert_eq!(raw[12], 3);
        assert_eq!(raw[13], 1);
        assert_eq!(raw[14], 7);
        assert_eq!(&raw[16..19], &[0x01, 0x02, 0x03]);
        assert_eq!(raw.len(), 19);
    }

    #[test]
    fn crc_round_trip() {
        let mut pool = fresh_pool();
        let pkt = sample(&mut pool);
        assert!(pkt.verify_crc());

        let mut raw = [0u8; FRAME_BYTES];
        let view = pkt.into_inner();
        raw[..view.len()].copy_from_slice(&view);
        assert_eq!(validate(&raw), Ok(3));
    }

    #[test]
    fn crc_covers_payload() {
        let mut pool = fresh_pool();
        let mut pkt = sample(&mut pool);
        pkt.payload_mut()[0] ^= 0x01;
        assert!(!pkt.verify_crc());
    }

    #[test]
    fn empty_payload_is_valid() {
        let mut pool = fresh_pool();
        let mut pkt = Packet::new(pool.allocate_raw().unwrap());
        pkt.apply_crc();
        assert_eq!(pkt.size(), 0);
        assert_eq!(pkt.wire_len(), HEADER_BYTES);
        assert!(pkt.verify_crc());
    }

    #[test]
    fn validate_rejects_bad_version() {
        let mut raw = [0u8; FRAME_BYTES];
        raw[2] = 2;
        assert_eq!(validate(&raw), Err(RxFault::Version));
    }

    #[test]
    fn validate_rejects_oversize() {
        let mut raw = [0u8; FRAME_BYTES];
        raw[2] = VERSION;
        raw[12] = (MAX_PAYLOAD + 1) as u8;
        assert_eq!(validate(&raw), Err(RxFault::Oversize));
    }

    #[test]
    fn validate_rejects_bad_crc() {
        let mut pool = fresh_pool();
        let pkt = sample(&mut pool);
        let view = pkt.into_inner();
        let mut raw = [0u8; FRAME_BYTES];
        raw[..view.len()].copy_from_slice(&view);
        raw[16] ^= 0x01;
        assert_eq!(validate(&raw), Err(RxFault::Crc));
    }

    #[test]
    fn max_payload_round_trips() {
        let mut pool = fresh_pool();
        let mut pkt = Packet::new(pool.allocate_raw().unwrap());
        let data = [0xA5u8; MAX_PAYLOAD];
        pkt.set_payload(&data);
        pkt.apply_crc();
        assert_eq!(pkt.wire_len(), FRAME_BYTES);
        assert!(pkt.verify_crc());
        assert_eq!(pkt.payload(), &data[..]);
    }
}
