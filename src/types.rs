use snafu::Snafu;

/// Error type for engine setup operations.
#[derive(Debug, Snafu, PartialEq, Eq)]
#[snafu(visibility(pub))]
#[non_exhaustive]
pub enum Error {
    /// The address given to `begin` doesn't fit the configured role.
    #[snafu(display("Address not valid for the configured role"))]
    InvalidAddress,
    /// The baud rate given to `begin` was zero.
    #[snafu(display("Baud rate must be non-zero"))]
    InvalidBaudRate,
    /// `begin` has not run successfully yet.
    #[snafu(display("Engine not initialized"))]
    NotInitialized,
    /// Service number 0xFF belongs to the system service.
    #[snafu(display("Service number 0xFF is reserved"))]
    ReservedService,
    /// A handler is already registered for this service number.
    #[snafu(display("Service already attached"))]
    ServiceAttached,
    /// The fixed-capacity service registry is full.
    #[snafu(display("Service registry is full"))]
    RegistryFull,
}

/// Bus role. Exactly one master per bus; slaves speak only when addressed
/// or cleared.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Role {
    Master,
    Slave,
}

/// How much the engine blocks on behalf of the caller.
///
/// * `Synchronous` waits for every reply and for push delivery.
/// * `NearlyAsynchronous` waits except for the very last poll of a batch.
/// * `FullyAsynchronous` never waits; operations that would have to block
///   fail instead.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BlockingMode {
    Synchronous,
    NearlyAsynchronous,
    FullyAsynchronous,
}

/// Physical layer of the shared wire.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum LinkLayer {
    Rs485,
}

/// What went wrong in the last commit-receive round trip.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ComErrorKind {
    /// No confirmation arrived within the window.
    CrTimeout,
    /// Two bytes arrived but didn't match the sent CRC.
    CrInvalid,
}

/// Communication error with the address it occurred against. Read it with
/// [`last_com_error`](crate::Msup::last_com_error), which clears the slot.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ComError {
    pub kind: ComErrorKind,
    pub address: u8,
}
