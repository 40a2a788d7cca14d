//! Structured diagnostics.
//!
//! The engine reports protocol activity as [`Event`] values to an optional
//! [`EventSink`]; without an attached sink nothing is recorded. [`LogSink`]
//! forwards events to the [`log`] facade for hosts that already carry a
//! logger.

use crate::parser::DropReason;

/// One observable protocol event.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Event {
    /// A checksum-valid frame passed all receive filters.
    FrameAccepted {
        address: u8,
        service: bool,
        push: bool,
        commit_receive: bool,
    },
    /// Input was discarded before a frame could complete.
    FrameDropped { reason: DropReason },
    /// A valid frame was addressed to a different node.
    NotForUs { address: u8 },
    /// A slave saw slave-to-master traffic on its own address.
    DuplicateAddress { address: u8 },
    /// No handler and no catch-all for this service number.
    ServiceNotAttached { service: u8 },
    /// A system-service subservice this role doesn't implement.
    SystemServiceUnknown { subservice: u8 },
    CommitReceiveOk { address: u8 },
    CommitReceiveInvalid { address: u8 },
    CommitReceiveTimeout { address: u8 },
    CommitReceiveRetry { address: u8 },
    /// Send suppressed because the target is marked ignored.
    SendSuppressed { address: u8 },
    PushQueued { service: u8, subservice: u8 },
    PushQueueFull,
    /// A clearance was answered with a queued entry.
    ClearanceServed { more: bool },
    /// A clearance arrived with nothing queued; the nothing-reply went out.
    ClearanceEmpty,
    /// The clearance window had already elapsed; no answer was sent.
    ClearanceExpired,
    /// A failed commit-receive delivery put the entry back in the queue.
    PushRequeued,
    /// The scavenger probed an ignored node.
    ScavengerProbe { address: u8, revived: bool },
}

/// Receiver for engine diagnostics. Implementations must be quick; events
/// fire from inside the receive and transmit paths.
pub trait EventSink {
    fn record(&mut self, event: Event);
}

/// Sink that forwards events to the `log` crate. Drops and communication
/// errors go out at debug level, suspected wiring problems at warn, the
/// rest at trace.
#[derive(Debug, Default)]
pub struct LogSink;

impl EventSink for LogSink {
    fn record(&mut self, event: Event) {
        use Event::*;
        match event {
            FrameDropped { reason } => log::debug!("frame dropped: {:?}", reason),
            DuplicateAddress { address } => {
                log::warn!("duplicate address detected: 0x{:02X}", address)
            }
            PushQueueFull => log::warn!("push queue out of space"),
            ServiceNotAttached { service } => {
                log::debug!("service 0x{:02X} not attached", service)
            }
            SystemServiceUnknown { subservice } => {
                log::debug!("system subservice 0x{:02X} not implemented", subservice)
            }
            CommitReceiveInvalid { address } => {
                log::debug!("commit-receive mismatch from 0x{:02X}", address)
            }
            CommitReceiveTimeout { address } => {
                log::debug!("commit-receive timeout from 0x{:02X}", address)
            }
            other => log::trace!("{:?}", other),
        }
    }
}
