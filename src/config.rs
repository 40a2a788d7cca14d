//! Protocol tuning constants.
//!
//! These values size the engine's fixed buffers and set its timing budget.
//! They must match on every node sharing a bus: a node with a larger
//! `MAX_PAYLOAD` will emit frames its peers refuse to parse.

use crate::types::BlockingMode;

/// Blocking behaviour used until [`set_blocking_mode`] is called.
///
/// [`set_blocking_mode`]: crate::Msup::set_blocking_mode
pub const DEFAULT_BLOCKING: BlockingMode = BlockingMode::NearlyAsynchronous;

/// Baud rate used by [`begin_default`](crate::Msup::begin_default).
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Upper bound for the payload of a single frame, in bytes. Sizes the
/// receive buffer and every push-queue slot.
pub const MAX_PAYLOAD: usize = 8;

/// The frame timeout is this many times the ideal frame duration. A factor
/// of 1 is the theoretical minimum and drops frames on any processing
/// delay between two bytes; 30 is safe even with a busy debug sink on a
/// 115200 baud bus.
pub const FRAME_LENGTH_TIMEOUT_FACTOR: u32 = 30;

/// How long an undelivered push message stays claimable in the queue.
pub const PUSH_QUEUE_TIMEOUT_MS: u32 = 20_000;

/// Depth of the slave push queue. Each entry costs roughly
/// `8 + MAX_PAYLOAD` bytes. Must stay below 255.
pub const MAX_PUSH_ENTRIES: usize = 10;

/// Capacity of the service handler registry.
pub const MAX_SERVICES: usize = 10;

/// Window for a slave to answer a push request, measured from the start
/// bytes of the request. Includes the slave's time to process a payloaded
/// frame preceding the clearance.
pub const PUSH_TIMEOUT_MS: u32 = 50;

/// Highest valid slave address. Limits the liveness bitmaps.
pub const MAX_SLAVE_ADDRESS: u8 = 0x1F;

/// Period after which ignored nodes become eligible for a rescan probe.
pub const SCAVENGING_INACTIVE_INTERVAL_MS: u32 = 10_000;

/// Settling delay between asserting the RS-485 driver-enable line and the
/// first byte on the wire. Most transceivers need none.
pub const DE_ENABLE_WAIT_US: u32 = 0;
