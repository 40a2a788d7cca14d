//! Byte-by-byte receive state machine.
//!
//! The parser consumes one byte at a time and walks an explicit state
//! enum; [`FrameParser::push_byte`] is the single transition function and
//! reports when a validated frame is ready. Corruption anywhere inside a
//! frame resynchronizes on the next start sentinel, and a partial frame
//! that stalls longer than the frame timeout is discarded by
//! [`FrameParser::check_timeout`].

use crate::config::MAX_PAYLOAD;
use crate::frame::{Frame, FrameFlags, Payload, ServiceSection, START1, START2, STOP1, STOP2};

/// Why the parser discarded input.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// The byte after a start sentinel wasn't the second sentinel.
    BadStart2,
    /// The byte where the first stop sentinel belongs wasn't one.
    BadStop1,
    /// The byte where the second stop sentinel belongs wasn't one.
    BadStop2,
    /// The declared payload size exceeds the receive buffer.
    OversizedPayload,
    /// The frame arrived intact but its checksum didn't match.
    CrcMismatch,
    /// A partial frame outlived the frame timeout.
    Timeout,
}

/// Outcome of feeding one byte to the parser.
#[derive(Debug)]
pub enum RxStep {
    /// Byte absorbed, frame still incomplete.
    Consumed,
    /// The frame under assembly was discarded.
    Dropped(DropReason),
    /// A checksum-valid frame is ready.
    Complete(ReceivedFrame),
}

/// A validated frame together with its wire CRC (needed for the
/// commit-receive echo) and the time its start sentinels were seen.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedFrame {
    pub frame: Frame,
    pub crc: u16,
    pub started_at: u32,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum RxState {
    Idle,
    Start2,
    Flag,
    Address,
    PayloadSize,
    Service,
    Subservice,
    Payload,
    CrcHigh,
    CrcLow,
    Stop1,
    Stop2,
}

#[derive(Debug)]
pub struct FrameParser {
    state: RxState,
    flags: FrameFlags,
    address: u8,
    payload_size: u8,
    service: u8,
    subservice: u8,
    payload: Payload,
    crc: u16,
    started_at: u32,
}

impl FrameParser {
    pub fn new() -> Self {
        FrameParser {
            state: RxState::Idle,
            flags: FrameFlags::from(0u8),
            address: 0,
            payload_size: 0,
            service: 0,
            subservice: 0,
            payload: Payload::new(),
            crc: 0,
            started_at: 0,
        }
    }

    pub fn reset(&mut self) {
        self.state = RxState::Idle;
        self.payload.clear();
        self.crc = 0;
    }

    /// True once both start sentinels have been seen.
    fn in_frame(&self) -> bool {
        !matches!(self.state, RxState::Idle | RxState::Start2)
    }

    /// Discards a partial frame that has been under assembly for longer
    /// than `timeout_ms`. Run this before draining new input.
    pub fn check_timeout(&mut self, now: u32, timeout_ms: u32) -> bool {
        if self.in_frame() && now.wrapping_sub(self.started_at) > timeout_ms {
            self.reset();
            true
        } else {
            false
        }
    }

    /// A mismatched byte resets the machine; if the byte is itself a start
    /// sentinel the machine restarts one position in.
    fn resync(&mut self, byte: u8) {
        self.reset();
        if byte == START1 {
            self.state = RxState::Start2;
        }
    }

    pub fn push_byte(&mut self, byte: u8, now: u32) -> RxStep {
        match self.state {
            RxState::Idle => {
                if byte == START1 {
                    self.reset();
                    self.state = RxState::Start2;
                }
                RxStep::Consumed
            }
            RxState::Start2 => {
                if byte == START2 {
                    self.started_at = now;
                    self.state = RxState::Flag;
                    RxStep::Consumed
                } else {
                    self.resync(byte);
                    RxStep::Dropped(DropReason::BadStart2)
                }
            }
            RxState::Flag => {
                self.flags = FrameFlags::from(byte);
                self.state = RxState::Address;
                RxStep::Consumed
            }
            RxState::Address => {
                self.address = byte;
                self.state = if self.flags.service() {
                    RxState::PayloadSize
                } else {
                    RxState::CrcHigh
                };
                RxStep::Consumed
            }
            RxState::PayloadSize => {
                if byte as usize > MAX_PAYLOAD {
                    self.resync(byte);
                    return RxStep::Dropped(DropReason::OversizedPayload);
                }
                self.payload_size = byte;
                self.state = RxState::Service;
                RxStep::Consumed
            }
            RxState::Service => {
                self.service = byte;
                self.state = RxState::Subservice;
                RxStep::Consumed
            }
            RxState::Subservice => {
                self.subservice = byte;
                self.state = if self.payload_size == 0 {
                    RxState::CrcHigh
                } else {
                    RxState::Payload
                };
                RxStep::Consumed
            }
            RxState::Payload => {
                self.payload.push(byte);
                if self.payload.len() == self.payload_size as usize {
                    self.state = RxState::CrcHigh;
                }
                RxStep::Consumed
            }
            RxState::CrcHigh => {
                self.crc = (byte as u16) << 8;
                self.state = RxState::CrcLow;
                RxStep::Consumed
            }
            RxState::CrcLow => {
                self.crc |= byte as u16;
                self.state = RxState::Stop1;
                RxStep::Consumed
            }
            RxState::Stop1 => {
                if byte == STOP1 {
                    self.state = RxState::Stop2;
                    RxStep::Consumed
                } else {
                    self.resync(byte);
                    RxStep::Dropped(DropReason::BadStop1)
                }
            }
            RxState::Stop2 => {
                if byte != STOP2 {
                    self.resync(byte);
                    return RxStep::Dropped(DropReason::BadStop2);
                }
                self.finish()
            }
        }
    }

    fn finish(&mut self) -> RxStep {
        let frame = Frame {
            flags: self.flags,
            address: self.address,
            service: if self.flags.service() {
                Some(ServiceSection {
                    service: self.service,
                    subservice: self.subservice,
                    payload: self.payload.clone(),
                })
            } else {
                None
            },
        };
        let received_crc = self.crc;
        let started_at = self.started_at;
        self.reset();

        if frame.crc() != received_crc {
            return RxStep::Dropped(DropReason::CrcMismatch);
        }
        RxStep::Complete(ReceivedFrame {
            frame,
            crc: received_crc,
            started_at,
        })
    }
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new()
    }
}
