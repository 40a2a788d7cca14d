//! The protocol engine.
//!
//! One [`Msup`] instance owns the serial port, the clock and the RS-485
//! driver-enable pin, and runs either the master or the slave side of the
//! bus. The host calls [`tick`](Msup::tick) from its main loop; all
//! receive, dispatch and scavenging work happens there. Depending on the
//! blocking mode, operations that need a peer's reaction re-enter `tick`
//! internally until the bus catches up.
//!
//! Service handlers are plain function pointers and may re-enter the
//! engine freely: every per-frame value is copied out of the receive path
//! before a handler runs.

use snafu::ensure;

use crate::config::{
    DEFAULT_BLOCKING, DEFAULT_BAUD_RATE, DE_ENABLE_WAIT_US, FRAME_LENGTH_TIMEOUT_FACTOR,
    MAX_PAYLOAD, MAX_SERVICES, MAX_SLAVE_ADDRESS, PUSH_TIMEOUT_MS,
    SCAVENGING_INACTIVE_INTERVAL_MS,
};
use crate::frame::{
    crc16_ccitt, Frame, FrameFlags, Payload, ServiceSection, MASTER_PSEUDO_ADDRESS, START1,
    START2, STOP1, STOP2, SYSTEM_IGNORE, SYSTEM_QUERY_ALIVE, SYSTEM_SERVICE,
};
use crate::liveness::Liveness;
use crate::parser::{DropReason, FrameParser, ReceivedFrame, RxStep};
use crate::queue::PushQueue;
use crate::trace::{Event, EventSink};
use crate::transport::{Clock, DriverEnable, SerialPort};
use crate::types::{
    BlockingMode, ComError, ComErrorKind, Error, InvalidAddressSnafu, InvalidBaudRateSnafu,
    LinkLayer, NotInitializedSnafu, RegistryFullSnafu, ReservedServiceSnafu, Role,
    ServiceAttachedSnafu,
};

use arrayvec::ArrayVec;

/// A dispatched service call, handed to the registered handler.
#[derive(Debug)]
pub struct ServiceRequest<'a> {
    pub subservice: u8,
    pub payload: &'a [u8],
    /// Address of the node that sent the frame; `0xFF` when it came from
    /// the master.
    pub source: u8,
}

/// Handler for one service number.
pub type ServiceHandler<S, C, D> = fn(&mut Msup<S, C, D>, ServiceRequest<'_>);

/// Fallback handler; receives the service number as well.
pub type CatchAllHandler<S, C, D> = fn(&mut Msup<S, C, D>, u8, ServiceRequest<'_>);

/// Options for [`Msup::send`]. The default sends a plain frame: no push
/// clearance, no delivery confirmation.
#[derive(Debug, Copy, Clone, Default)]
pub struct SendOptions {
    /// Also grant the target a push clearance.
    pub push: bool,
    /// Request the two-byte CRC echo confirming receipt.
    pub commit_receive: bool,
    /// Retry once if the confirmation fails or times out.
    pub retry_on_cr_failure: bool,
}

/// Options for [`Msup::poll`] and [`Msup::poll_range`].
#[derive(Debug, Copy, Clone)]
pub struct PollOptions {
    /// Clearances granted per slave before moving on. At least 1.
    pub max_messages_per_slave: u8,
    pub commit_receive: bool,
    pub retry_on_cr_failure: bool,
}

impl Default for PollOptions {
    fn default() -> Self {
        PollOptions {
            max_messages_per_slave: 1,
            commit_receive: false,
            retry_on_cr_failure: false,
        }
    }
}

struct ServiceSlot<S: SerialPort, C: Clock, D: DriverEnable> {
    number: u8,
    handler: ServiceHandler<S, C, D>,
}

/// Everything `send_frame` needs to emit one frame.
struct TxFrame<'a> {
    address: u8,
    service: u8,
    subservice: u8,
    service_flag: bool,
    push_flag: bool,
    commit_receive: bool,
    payload: &'a [u8],
}

/// Master/slave protocol engine for a shared half-duplex serial bus.
pub struct Msup<S: SerialPort, C: Clock, D: DriverEnable> {
    serial: S,
    clock: C,
    de_pin: D,
    role: Role,
    address: u8,
    initialized: bool,
    blocking_mode: BlockingMode,
    frame_timeout_ms: u32,
    parser: FrameParser,
    services: ArrayVec<ServiceSlot<S, C, D>, MAX_SERVICES>,
    catch_all: Option<CatchAllHandler<S, C, D>>,
    push_queue: PushQueue,
    push_blocking_since: Option<u32>,
    additional_push_available: bool,
    liveness: Liveness,
    ignore_inactive_nodes: bool,
    scavenger_cursor: u8,
    scavenger_last_run: u32,
    last_com_error: Option<ComError>,
    debug: Option<Box<dyn EventSink>>,
}

impl<S: SerialPort, C: Clock, D: DriverEnable> Msup<S, C, D> {
    /// Create an engine for the given role. Nothing touches the hardware
    /// until [`begin`](Self::begin).
    pub fn new(serial: S, clock: C, link: LinkLayer, de_pin: D, role: Role) -> Self {
        match link {
            LinkLayer::Rs485 => {}
        }
        Msup {
            serial,
            clock,
            de_pin,
            role,
            address: match role {
                Role::Master => MASTER_PSEUDO_ADDRESS,
                Role::Slave => 0,
            },
            initialized: false,
            blocking_mode: DEFAULT_BLOCKING,
            frame_timeout_ms: 0,
            parser: FrameParser::new(),
            services: ArrayVec::new(),
            catch_all: None,
            push_queue: PushQueue::new(),
            push_blocking_since: None,
            additional_push_available: false,
            liveness: Liveness::new(),
            ignore_inactive_nodes: false,
            scavenger_cursor: 0,
            scavenger_last_run: 0,
            last_com_error: None,
            debug: None,
        }
    }

    /// Validate the role/address pair, bring up the serial port and arm
    /// the engine. A master must use the pseudo-address `0xFF`, a slave
    /// any address below `0xF0`.
    pub fn begin(&mut self, baud: u32, address: u8) -> Result<(), Error> {
        let valid = match self.role {
            Role::Master => address == MASTER_PSEUDO_ADDRESS,
            Role::Slave => address < 0xF0,
        };
        ensure!(valid, InvalidAddressSnafu);
        ensure!(baud > 0, InvalidBaudRateSnafu);

        self.address = address;
        self.serial.begin(baud);
        self.de_pin.set_low();

        // Worst-case frame duration (10-bit UART symbols, microseconds per
        // byte) times the safety factor, rounded up to milliseconds.
        self.frame_timeout_ms = ((10 + MAX_PAYLOAD as u32)
            * FRAME_LENGTH_TIMEOUT_FACTOR
            * (10_000_000 / baud)
            + 501)
            / 1000;

        self.liveness.clear();
        self.parser.reset();
        self.initialized = true;
        Ok(())
    }

    /// [`begin`](Self::begin) with the default baud rate and the master
    /// pseudo-address. Master convenience; fails for a slave.
    pub fn begin_default(&mut self) -> Result<(), Error> {
        self.begin(DEFAULT_BAUD_RATE, MASTER_PSEUDO_ADDRESS)
    }

    /// Drive the engine. Call this from the host loop, frequently; frame
    /// reception, dispatch and the scavenger all run here. Handlers fire
    /// from inside this call.
    pub fn tick(&mut self) {
        if !self.initialized {
            return;
        }
        if let Some(received) = self.read_input() {
            self.process_frame(&received);
        }
        if self.role == Role::Master {
            self.scavenge_inactive();
        }
    }

    /// Register a handler for a service number. Requires [`begin`]; the
    /// number `0xFF` is reserved and each number can be attached once.
    ///
    /// [`begin`]: Self::begin
    pub fn attach_service(
        &mut self,
        service: u8,
        handler: ServiceHandler<S, C, D>,
    ) -> Result<(), Error> {
        ensure!(self.initialized, NotInitializedSnafu);
        ensure!(service != SYSTEM_SERVICE, ReservedServiceSnafu);
        ensure!(
            self.services.iter().all(|slot| slot.number != service),
            ServiceAttachedSnafu
        );
        ensure!(!self.services.is_full(), RegistryFullSnafu);
        self.services.push(ServiceSlot {
            number: service,
            handler,
        });
        Ok(())
    }

    /// Register the fallback handler for unattached services, replacing
    /// any previous one.
    pub fn attach_catch_all(&mut self, handler: CatchAllHandler<S, C, D>) {
        self.catch_all = Some(handler);
    }

    /// Attach a diagnostic sink. Works before `begin`.
    pub fn attach_debug(&mut self, sink: Box<dyn EventSink>) {
        self.debug = Some(sink);
    }

    pub fn set_blocking_mode(&mut self, mode: BlockingMode) {
        self.blocking_mode = mode;
    }

    pub fn blocking_mode(&self) -> BlockingMode {
        self.blocking_mode
    }

    /// Enable or disable suppression of traffic to dead nodes. Master
    /// only; a slave ignores nobody.
    pub fn set_ignore_inactive_nodes(&mut self, enabled: bool) {
        self.ignore_inactive_nodes = enabled;
    }

    pub fn ignore_inactive_nodes(&self) -> bool {
        self.ignore_inactive_nodes
    }

    /// The last commit-receive failure, if any. Reading clears the slot.
    pub fn last_com_error(&mut self) -> Option<ComError> {
        self.last_com_error.take()
    }

    /// True while a push clearance is outstanding and its answer window
    /// has not elapsed.
    pub fn push_blocking_active(&mut self) -> bool {
        match self.push_blocking_since {
            Some(since) => self.clock.now_ms().wrapping_sub(since) < PUSH_TIMEOUT_MS,
            None => false,
        }
    }

    /// Send a service frame to a slave. Master only; `address` must not
    /// exceed [`MAX_SLAVE_ADDRESS`] and the payload must fit
    /// [`MAX_PAYLOAD`]. Returns false without emitting when the target is
    /// currently ignored.
    pub fn send(
        &mut self,
        address: u8,
        service: u8,
        subservice: u8,
        payload: &[u8],
        options: SendOptions,
    ) -> bool {
        if self.role != Role::Master || !self.initialized {
            return false;
        }
        if address > MAX_SLAVE_ADDRESS || payload.len() > MAX_PAYLOAD {
            return false;
        }
        if self.push_blocking_active() {
            if self.blocking_mode == BlockingMode::FullyAsynchronous {
                return false;
            }
            self.wait_push_blocking_release();
        }

        let wait_for_push_answer = self.blocking_mode == BlockingMode::Synchronous;
        self.send_frame(
            &TxFrame {
                address,
                service,
                subservice,
                service_flag: true,
                push_flag: options.push,
                commit_receive: options.commit_receive,
                payload,
            },
            wait_for_push_answer,
            options.retry_on_cr_failure,
        )
    }

    /// Poll a single slave for pending push messages.
    pub fn poll(&mut self, address: u8, options: PollOptions) -> bool {
        self.poll_range(address, address, options)
    }

    /// Poll every address in `[begin, end]` for pending push messages,
    /// granting up to `max_messages_per_slave` clearances each. Master
    /// only. FullyAsynchronous mode allows single-address polls only.
    /// Returns true iff every push request went out.
    pub fn poll_range(&mut self, begin: u8, end: u8, options: PollOptions) -> bool {
        if self.role != Role::Master || !self.initialized {
            return false;
        }
        if end > MAX_SLAVE_ADDRESS || options.max_messages_per_slave < 1 {
            return false;
        }
        if self.blocking_mode == BlockingMode::FullyAsynchronous && begin != end {
            return false;
        }
        if self.push_blocking_active() {
            if self.blocking_mode == BlockingMode::FullyAsynchronous {
                return false;
            }
            self.wait_push_blocking_release();
        }

        let mut all_sent = true;
        for address in begin..=end {
            let mut remaining = options.max_messages_per_slave;
            while remaining > 0 {
                let wait_for_push_answer = match self.blocking_mode {
                    BlockingMode::FullyAsynchronous => false,
                    // Don't wait on the very last request of the batch.
                    BlockingMode::NearlyAsynchronous => !(address == end && remaining <= 1),
                    BlockingMode::Synchronous => true,
                };

                self.additional_push_available = false;
                let sent = self.send_frame(
                    &TxFrame {
                        address,
                        service: 0,
                        subservice: 0,
                        service_flag: false,
                        push_flag: true,
                        commit_receive: options.commit_receive,
                        payload: &[],
                    },
                    wait_for_push_answer,
                    options.retry_on_cr_failure,
                );
                if !sent {
                    all_sent = false;
                }
                if !self.additional_push_available {
                    break;
                }
                remaining -= 1;
            }
        }
        all_sent
    }

    /// Queue an unsolicited message for delivery on the master's next push
    /// clearance. Slave only. Under FullyAsynchronous a full queue fails
    /// immediately; NearlyAsynchronous waits for a slot; Synchronous
    /// additionally waits until this message has left the queue.
    pub fn push(
        &mut self,
        service: u8,
        subservice: u8,
        payload: &[u8],
        commit_receive: bool,
    ) -> bool {
        if self.role != Role::Slave || !self.initialized {
            return false;
        }
        if payload.len() > MAX_PAYLOAD {
            return false;
        }

        let slot = loop {
            let now = self.clock.now_ms();
            match self.push_queue.next_free(now) {
                Some(slot) => break slot,
                None => {
                    if self.blocking_mode == BlockingMode::FullyAsynchronous {
                        self.trace(Event::PushQueueFull);
                        return false;
                    }
                    // Wait for the master to drain a slot, or for aging.
                    self.tick();
                }
            }
        };

        let now = self.clock.now_ms();
        self.push_queue
            .store(slot, service, subservice, payload, commit_receive, now);
        self.trace(Event::PushQueued {
            service,
            subservice,
        });

        if self.blocking_mode == BlockingMode::Synchronous {
            // Delivered (or aged out) once the slot is reusable.
            loop {
                let now = self.clock.now_ms();
                if self.push_queue.reusable(slot, now) {
                    break;
                }
                self.tick();
            }
        }
        true
    }

    // ---- receive path ----------------------------------------------------

    fn read_input(&mut self) -> Option<ReceivedFrame> {
        let now = self.clock.now_ms();
        if self.parser.check_timeout(now, self.frame_timeout_ms) {
            self.trace(Event::FrameDropped {
                reason: DropReason::Timeout,
            });
        }

        while self.serial.available() > 0 {
            let byte = match self.serial.read() {
                Some(byte) => byte,
                None => break,
            };
            let now = self.clock.now_ms();
            match self.parser.push_byte(byte, now) {
                RxStep::Consumed => {}
                RxStep::Dropped(reason) => self.trace(Event::FrameDropped { reason }),
                RxStep::Complete(received) => {
                    if self.accept_frame(&received) {
                        return Some(received);
                    }
                }
            }
        }
        None
    }

    /// Receive filters and the commit-receive echo. The checksum has
    /// already been verified by the parser.
    fn accept_frame(&mut self, received: &ReceivedFrame) -> bool {
        let flags = received.frame.flags;
        let address = received.frame.address;

        // Any valid frame proves the slave in its address field is alive.
        self.liveness.mark_active(address);

        if self.role == Role::Slave {
            if address != self.address {
                self.trace(Event::NotForUs { address });
                return false;
            }
            if flags.direction() {
                // Slave-to-master traffic on our own address: some other
                // node shares it.
                self.trace(Event::DuplicateAddress { address });
                return false;
            }
        }

        if flags.commit_receive() {
            self.de_pin.set_high();
            self.clock.sleep_us(DE_ENABLE_WAIT_US);
            self.serial.write_all(&received.crc.to_be_bytes());
            self.serial.flush();
            self.de_pin.set_low();
        }

        self.trace(Event::FrameAccepted {
            address,
            service: flags.service(),
            push: flags.push(),
            commit_receive: flags.commit_receive(),
        });
        true
    }

    fn process_frame(&mut self, received: &ReceivedFrame) {
        let flags = received.frame.flags;
        let mut push_flag = flags.push();

        if let Some(section) = &received.frame.service {
            if section.service == SYSTEM_SERVICE {
                push_flag =
                    self.handle_system_service(section.subservice, flags.commit_receive(), push_flag);
            } else {
                let source = if flags.direction() {
                    received.frame.address
                } else {
                    MASTER_PSEUDO_ADDRESS
                };
                let request = ServiceRequest {
                    subservice: section.subservice,
                    payload: &section.payload,
                    source,
                };
                let handler = self
                    .services
                    .iter()
                    .find(|slot| slot.number == section.service)
                    .map(|slot| slot.handler);
                match handler {
                    Some(handler) => handler(self, request),
                    None => match self.catch_all {
                        Some(handler) => handler(self, section.service, request),
                        None => self.trace(Event::ServiceNotAttached {
                            service: section.service,
                        }),
                    },
                }
            }
        }

        if self.role == Role::Master {
            // The reply we were blocking on has arrived; remember whether
            // the slave announced more queued messages.
            self.push_blocking_since = None;
            self.additional_push_available = push_flag;
        } else if push_flag {
            self.answer_push_clearance(received.started_at);
        }
    }

    /// System service (0xFF). Returns the push flag the dispatcher should
    /// continue with; answering subservices consume it.
    fn handle_system_service(&mut self, subservice: u8, commit_receive: bool, push_flag: bool) -> bool {
        match (self.role, subservice) {
            (_, SYSTEM_IGNORE) => push_flag,
            (Role::Slave, SYSTEM_QUERY_ALIVE) => {
                let now = self.clock.now_ms();
                let more = self.push_queue.next_to_send(now).is_some();
                self.send_frame(
                    &TxFrame {
                        address: self.address,
                        service: SYSTEM_SERVICE,
                        subservice: SYSTEM_QUERY_ALIVE,
                        service_flag: true,
                        push_flag: more,
                        commit_receive,
                        payload: &[],
                    },
                    false,
                    false,
                );
                false
            }
            _ => {
                self.trace(Event::SystemServiceUnknown { subservice });
                push_flag
            }
        }
    }

    /// The master granted us a clearance: emit the oldest queued message,
    /// or a bare nothing-reply if the queue is empty.
    fn answer_push_clearance(&mut self, frame_started_at: u32) {
        let now = self.clock.now_ms();
        if now.wrapping_sub(frame_started_at) > PUSH_TIMEOUT_MS {
            // The master stopped listening while a handler ran.
            self.trace(Event::ClearanceExpired);
            return;
        }

        match self.push_queue.next_to_send(now) {
            Some(slot) => {
                self.push_queue.set_pending(slot, false);
                // Announce further messages based on what remains after
                // this one is taken.
                let more = self.push_queue.next_to_send(now).is_some();
                let entry = self.push_queue.entry(slot).clone();
                self.trace(Event::ClearanceServed { more });

                let sent = self.send_frame(
                    &TxFrame {
                        address: self.address,
                        service: entry.service,
                        subservice: entry.subservice,
                        service_flag: true,
                        push_flag: more,
                        commit_receive: entry.commit_receive,
                        payload: &entry.payload,
                    },
                    false,
                    false,
                );
                if !sent && entry.commit_receive {
                    // Confirmed delivery failed; offer it again on the
                    // next clearance.
                    self.trace(Event::PushRequeued);
                    self.push_queue.set_pending(slot, true);
                }
            }
            None => {
                self.trace(Event::ClearanceEmpty);
                self.send_frame(
                    &TxFrame {
                        address: self.address,
                        service: 0,
                        subservice: 0,
                        service_flag: false,
                        push_flag: false,
                        commit_receive: false,
                        payload: &[],
                    },
                    false,
                    false,
                );
            }
        }
    }

    // ---- transmit path ---------------------------------------------------

    fn is_ignored(&self, address: u8) -> bool {
        if self.role == Role::Slave || !self.ignore_inactive_nodes {
            false
        } else {
            self.liveness.is_ignored(address)
        }
    }

    fn send_frame(
        &mut self,
        tx: &TxFrame<'_>,
        wait_for_push_answer: bool,
        retry_on_cr_failure: bool,
    ) -> bool {
        if self.is_ignored(tx.address) {
            self.trace(Event::SendSuppressed {
                address: tx.address,
            });
            return false;
        }

        let frame = Frame {
            flags: FrameFlags::build(
                self.role == Role::Slave,
                tx.service_flag,
                tx.push_flag,
                tx.commit_receive,
            ),
            address: tx.address,
            service: if tx.service_flag {
                let mut payload = Payload::new();
                payload
                    .try_extend_from_slice(tx.payload)
                    .expect("BUG: payload bounds checked by callers");
                Some(ServiceSection {
                    service: tx.service,
                    subservice: tx.subservice,
                    payload,
                })
            } else {
                None
            },
        };
        let logical = frame.logical_bytes();
        let crc = crc16_ccitt(&logical);

        self.de_pin.set_high();
        self.clock.sleep_us(DE_ENABLE_WAIT_US);

        self.serial.write(START1);
        self.serial.write(START2);

        // From the start bytes on, any reply counts against the window.
        if self.role == Role::Master && tx.push_flag {
            self.push_blocking_since = Some(self.clock.now_ms());
        }

        self.serial.write_all(&logical);
        self.serial.write_all(&crc.to_be_bytes());
        self.serial.write(STOP1);
        self.serial.write(STOP2);
        self.serial.flush();
        self.de_pin.set_low();

        if tx.commit_receive {
            let mut echo = [0u8; 2];
            // The confirmation window is frame_timeout_ms * 4 / 10, in
            // whole milliseconds.
            let window = self.frame_timeout_ms * 4 / 10;
            if self.serial.read_with_timeout(&mut echo, window) == 2 {
                if echo == crc.to_be_bytes() {
                    self.trace(Event::CommitReceiveOk {
                        address: tx.address,
                    });
                    self.liveness.mark_active(tx.address);
                } else {
                    self.trace(Event::CommitReceiveInvalid {
                        address: tx.address,
                    });
                    self.last_com_error = Some(ComError {
                        kind: ComErrorKind::CrInvalid,
                        address: tx.address,
                    });
                    if retry_on_cr_failure && self.role == Role::Master {
                        self.trace(Event::CommitReceiveRetry {
                            address: tx.address,
                        });
                        return self.send_frame(tx, wait_for_push_answer, false);
                    }
                    return false;
                }
            } else {
                self.trace(Event::CommitReceiveTimeout {
                    address: tx.address,
                });
                self.last_com_error = Some(ComError {
                    kind: ComErrorKind::CrTimeout,
                    address: tx.address,
                });
                if retry_on_cr_failure && self.role == Role::Master {
                    self.trace(Event::CommitReceiveRetry {
                        address: tx.address,
                    });
                    return self.send_frame(tx, wait_for_push_answer, false);
                }
                self.liveness.mark_ignore(tx.address);
                return false;
            }
        }

        if self.role == Role::Master && tx.push_flag && wait_for_push_answer {
            self.wait_push_blocking_release();
        }

        true
    }

    fn wait_push_blocking_release(&mut self) {
        while self.push_blocking_active() {
            self.tick();
        }
    }

    // ---- scavenger -------------------------------------------------------

    /// Periodically forget what we know: every known-active node drops back
    /// to unknown so that only live traffic keeps it active, and one
    /// ignored node per interval gets probed for signs of life.
    fn scavenge_inactive(&mut self) {
        if !self.ignore_inactive_nodes {
            return;
        }
        let now = self.clock.now_ms();
        if now.wrapping_sub(self.scavenger_last_run) < SCAVENGING_INACTIVE_INTERVAL_MS {
            return;
        }
        self.scavenger_last_run = now;

        let start = self.scavenger_cursor;
        let mut address = start;
        loop {
            if self.liveness.is_active(address) {
                self.liveness.reset(address);
            } else if self.liveness.is_ignored(address) {
                self.liveness.reset(address);

                // Probe diagnostics must not clobber a user-visible error.
                let saved_error = self.last_com_error.take();
                let revived = self.send_frame(
                    &TxFrame {
                        address,
                        service: SYSTEM_SERVICE,
                        subservice: SYSTEM_IGNORE,
                        service_flag: true,
                        push_flag: false,
                        commit_receive: true,
                        payload: &[],
                    },
                    false,
                    false,
                );
                if revived {
                    self.liveness.mark_active(address);
                } else {
                    self.liveness.mark_ignore(address);
                }
                self.last_com_error = saved_error;
                self.trace(Event::ScavengerProbe { address, revived });

                address = Self::next_address(address);
                break;
            }

            address = Self::next_address(address);
            if address == start {
                break;
            }
        }
        self.scavenger_cursor = address;
    }

    fn next_address(address: u8) -> u8 {
        if address >= MAX_SLAVE_ADDRESS {
            0
        } else {
            address + 1
        }
    }

    fn trace(&mut self, event: Event) {
        if let Some(sink) = self.debug.as_mut() {
            sink.record(event);
        }
    }
}
