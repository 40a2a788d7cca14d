//! Master/slave protocol engine for half-duplex serial buses (RS-485).
//!
//! One master coordinates up to [`MAX_SLAVE_ADDRESS`](config::MAX_SLAVE_ADDRESS)` + 1`
//! slaves over a shared wire; slaves speak only when addressed or when
//! granted a push clearance. The engine provides addressed
//! request/response with registered service handlers, unsolicited
//! slave-to-master delivery through a polled push queue, optional per-frame
//! delivery confirmation (a two-byte CRC echo), and suppression of dead
//! nodes with periodic rediscovery.
//!
//! The engine is single-threaded and cooperative: construct it with a
//! [`SerialPort`](transport::SerialPort), a [`Clock`](transport::Clock)
//! and the transceiver's [`DriverEnable`](transport::DriverEnable) line,
//! call [`Msup::begin`], then call [`Msup::tick`] from the host loop.
//! Depending on the [`BlockingMode`], some operations re-enter `tick`
//! internally until the bus catches up.
//!
//! ```no_run
//! use msup_proto::transport::{Clock, DriverEnable, SerialPort};
//! use msup_proto::{LinkLayer, Msup, Role, SendOptions};
//!
//! # struct Uart;
//! # impl SerialPort for Uart {
//! #     fn begin(&mut self, _baud: u32) {}
//! #     fn available(&mut self) -> usize { 0 }
//! #     fn read(&mut self) -> Option<u8> { None }
//! #     fn write(&mut self, _byte: u8) {}
//! #     fn flush(&mut self) {}
//! #     fn read_with_timeout(&mut self, _buf: &mut [u8], _ms: u32) -> usize { 0 }
//! # }
//! # struct Wall(std::time::Instant);
//! # impl Clock for Wall {
//! #     fn now_ms(&mut self) -> u32 { self.0.elapsed().as_millis() as u32 }
//! #     fn sleep_us(&mut self, us: u32) {
//! #         std::thread::sleep(std::time::Duration::from_micros(us.into()))
//! #     }
//! # }
//! # struct DePin;
//! # impl DriverEnable for DePin {
//! #     fn set_high(&mut self) {}
//! #     fn set_low(&mut self) {}
//! # }
//! # fn main() -> Result<(), msup_proto::Error> {
//! let clock = Wall(std::time::Instant::now());
//! let mut bus = Msup::new(Uart, clock, LinkLayer::Rs485, DePin, Role::Master);
//! bus.begin(19_200, msup_proto::frame::MASTER_PSEUDO_ADDRESS)?;
//!
//! // Ask slave 0x05, service 0x10, for something; confirm delivery.
//! let delivered = bus.send(
//!     0x05,
//!     0x10,
//!     0x01,
//!     &[0xDE, 0xAD],
//!     SendOptions { commit_receive: true, ..SendOptions::default() },
//! );
//!
//! for _ in 0..100 {
//!     bus.tick();
//! }
//! # let _ = delivered;
//! # Ok(())
//! # }
//! ```

pub mod config;
mod engine;
pub mod frame;
mod liveness;
mod parser;
mod queue;
pub mod trace;
pub mod transport;
mod types;

pub use engine::{
    CatchAllHandler, Msup, PollOptions, SendOptions, ServiceHandler, ServiceRequest,
};
pub use frame::MASTER_PSEUDO_ADDRESS;
pub use parser::DropReason;
pub use types::{BlockingMode, ComError, ComErrorKind, Error, LinkLayer, Role};
