//! Wire format: framing sentinels, the flag bitfield and the checksum.
//!
//! A frame on the wire is
//!
//! ```text
//! AA 55 | FLAG ADDR [PAYLEN SRV SUBSRV PAYLOAD…] | CRC_HI CRC_LO | CC 33
//! ```
//!
//! The bracketed section exists only when the service flag is set. The CRC
//! covers the logical bytes between the sentinels and travels big-endian.

use arrayvec::ArrayVec;
use bilge::prelude::*;

use crate::config::MAX_PAYLOAD;

pub const START1: u8 = 0xAA;
pub const START2: u8 = 0x55;
pub const STOP1: u8 = 0xCC;
pub const STOP2: u8 = 0x33;

/// Address a master puts in the source position. Never a valid target.
pub const MASTER_PSEUDO_ADDRESS: u8 = 0xFF;

/// Service number reserved for the engine's own traffic.
pub const SYSTEM_SERVICE: u8 = 0xFF;
/// System subservice: ask a slave to prove it is alive.
pub const SYSTEM_QUERY_ALIVE: u8 = 0x00;
/// System subservice: carries no meaning beyond the commit-receive echo
/// it solicits. Used by the scavenger to re-probe ignored nodes.
pub const SYSTEM_IGNORE: u8 = 0x01;

/// Longest possible logical section: flag, address, payload size, service,
/// subservice, payload.
pub const LOGICAL_MAX: usize = 5 + MAX_PAYLOAD;

/// Frame flag byte. `direction` is 0 for master to slave, 1 for slave to
/// master. The low nibble is reserved and transmitted as zero.
#[bitsize(8)]
#[derive(Copy, Clone, FromBits, DebugBits, PartialEq)]
pub struct FrameFlags {
    pub reserved: u4,
    pub commit_receive: bool,
    pub push: bool,
    pub service: bool,
    pub direction: bool,
}

impl FrameFlags {
    pub fn build(direction: bool, service: bool, push: bool, commit_receive: bool) -> Self {
        let mut flags = Self::from(0u8);
        flags.set_direction(direction);
        flags.set_service(service);
        flags.set_push(push);
        flags.set_commit_receive(commit_receive);
        flags
    }
}

pub type Payload = ArrayVec<u8, MAX_PAYLOAD>;

/// Service-dependent part of a frame. Absent on frames whose service flag
/// is clear, which consist of exactly flag and address.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceSection {
    pub service: u8,
    pub subservice: u8,
    pub payload: Payload,
}

/// A frame in logical form, before framing or after validation.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub flags: FrameFlags,
    pub address: u8,
    pub service: Option<ServiceSection>,
}

impl Frame {
    /// The bytes the CRC covers, in wire order.
    pub fn logical_bytes(&self) -> ArrayVec<u8, LOGICAL_MAX> {
        let mut buf = ArrayVec::new();
        buf.push(u8::from(self.flags));
        buf.push(self.address);
        if let Some(section) = &self.service {
            buf.push(section.payload.len() as u8);
            buf.push(section.service);
            buf.push(section.subservice);
            buf.try_extend_from_slice(&section.payload)
                .expect("BUG: logical buffer too small");
        }
        buf
    }

    pub fn crc(&self) -> u16 {
        crc16_ccitt(&self.logical_bytes())
    }
}

/// CRC-16/CCITT-FALSE: polynomial 0x1021, initial value 0xFFFF, no
/// reflection, no final XOR.
pub fn crc16_ccitt(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc_check_value() {
        // Standard check input for CRC-16/CCITT-FALSE.
        assert_eq!(crc16_ccitt(b"123456789"), 0x29B1);
        assert_eq!(crc16_ccitt(&[]), 0xFFFF);
    }

    #[test]
    fn flag_bit_positions() {
        let flags = FrameFlags::build(false, true, false, false);
        assert_eq!(u8::from(flags), 0x40);
        let flags = FrameFlags::build(false, true, false, true);
        assert_eq!(u8::from(flags), 0x50);
        let flags = FrameFlags::build(true, true, true, true);
        assert_eq!(u8::from(flags), 0xF0);

        let parsed = FrameFlags::from(0xA0);
        assert!(parsed.direction());
        assert!(!parsed.service());
        assert!(parsed.push());
        assert!(!parsed.commit_receive());
    }

    #[test]
    fn logical_layout_with_service() {
        let mut payload = Payload::new();
        payload.try_extend_from_slice(&[0xDE, 0xAD]).unwrap();
        let frame = Frame {
            flags: FrameFlags::build(false, true, false, false),
            address: 0x05,
            service: Some(ServiceSection {
                service: 0x10,
                subservice: 0x01,
                payload,
            }),
        };
        assert_eq!(
            frame.logical_bytes().as_slice(),
            &[0x40, 0x05, 0x02, 0x10, 0x01, 0xDE, 0xAD]
        );
        assert_eq!(frame.crc(), crc16_ccitt(&[0x40, 0x05, 0x02, 0x10, 0x01, 0xDE, 0xAD]));
    }

    #[test]
    fn logical_layout_without_service() {
        let frame = Frame {
            flags: FrameFlags::build(true, false, false, false),
            address: 0x03,
            service: None,
        };
        assert_eq!(frame.logical_bytes().as_slice(), &[0x80, 0x03]);
    }
}
