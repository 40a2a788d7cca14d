#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use msup_proto::frame::{crc16_ccitt, START1, START2, STOP1, STOP2};
use msup_proto::trace::{Event, EventSink};
use msup_proto::transport::{Clock, DriverEnable, SerialPort};
use msup_proto::{LinkLayer, Msup, Role};

pub type TestBus = Msup<SerialHandle, SimClock, PinHandle>;

/// Scripted serial interface. Tests feed inbound bytes into `rx`, inspect
/// what the engine wrote in `tx`, and can script commit-receive replies
/// separately so they are served by `read_with_timeout` instead of being
/// drained as frame input.
pub struct SerialInterface {
    pub rx: VecDeque<u8>,
    pub tx: Vec<u8>,
    pub cr_replies: VecDeque<Vec<u8>>,
    pub baud: Option<u32>,
    pub flushes: u32,
}

impl SerialInterface {
    pub fn new() -> Rc<RefCell<SerialInterface>> {
        Rc::new(RefCell::new(SerialInterface {
            rx: VecDeque::new(),
            tx: Vec::new(),
            cr_replies: VecDeque::new(),
            baud: None,
            flushes: 0,
        }))
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.rx.extend(bytes.iter().copied());
    }

    /// Next commit-receive read gets exactly these bytes; an empty script
    /// models a timeout.
    pub fn script_cr_reply(&mut self, bytes: &[u8]) {
        self.cr_replies.push_back(bytes.to_vec());
    }

    pub fn take_tx(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.tx)
    }
}

pub struct SerialHandle(Rc<RefCell<SerialInterface>>);

impl SerialHandle {
    pub fn new(sim: &Rc<RefCell<SerialInterface>>) -> SerialHandle {
        SerialHandle(sim.clone())
    }
}

impl SerialPort for SerialHandle {
    fn begin(&mut self, baud: u32) {
        self.0.borrow_mut().baud = Some(baud);
    }

    fn available(&mut self) -> usize {
        self.0.borrow().rx.len()
    }

    fn read(&mut self) -> Option<u8> {
        self.0.borrow_mut().rx.pop_front()
    }

    fn write(&mut self, byte: u8) {
        self.0.borrow_mut().tx.push(byte);
    }

    fn flush(&mut self) {
        self.0.borrow_mut().flushes += 1;
    }

    fn read_with_timeout(&mut self, buf: &mut [u8], _timeout_ms: u32) -> usize {
        let mut sim = self.0.borrow_mut();
        if let Some(reply) = sim.cr_replies.pop_front() {
            let len = reply.len().min(buf.len());
            buf[..len].copy_from_slice(&reply[..len]);
            return len;
        }
        let mut len = 0;
        while len < buf.len() {
            match sim.rx.pop_front() {
                Some(byte) => {
                    buf[len] = byte;
                    len += 1;
                }
                None => break,
            }
        }
        len
    }
}

/// Manually driven clock. `auto_step` makes every `now_ms` read advance
/// time so the engine's internal spin loops terminate in tests.
#[derive(Clone)]
pub struct SimClock {
    now: Rc<Cell<u32>>,
    step: Rc<Cell<u32>>,
}

impl SimClock {
    pub fn new() -> SimClock {
        SimClock {
            now: Rc::new(Cell::new(0)),
            step: Rc::new(Cell::new(0)),
        }
    }

    pub fn set(&self, ms: u32) {
        self.now.set(ms);
    }

    pub fn advance(&self, ms: u32) {
        self.now.set(self.now.get().wrapping_add(ms));
    }

    pub fn auto_step(&self, ms: u32) {
        self.step.set(ms);
    }

    pub fn get(&self) -> u32 {
        self.now.get()
    }
}

impl Clock for SimClock {
    fn now_ms(&mut self) -> u32 {
        let now = self.now.get();
        self.now.set(now.wrapping_add(self.step.get()));
        now
    }

    fn sleep_us(&mut self, _micros: u32) {}
}

#[derive(Debug, Default)]
pub struct PinState {
    pub level: bool,
    pub rises: u32,
}

pub struct PinHandle(Rc<RefCell<PinState>>);

impl PinHandle {
    pub fn new(state: &Rc<RefCell<PinState>>) -> PinHandle {
        PinHandle(state.clone())
    }
}

impl DriverEnable for PinHandle {
    fn set_high(&mut self) {
        let mut pin = self.0.borrow_mut();
        pin.level = true;
        pin.rises += 1;
    }

    fn set_low(&mut self) {
        self.0.borrow_mut().level = false;
    }
}

/// Sink that appends every event to a shared vector.
pub struct RecordingSink(pub Rc<RefCell<Vec<Event>>>);

impl EventSink for RecordingSink {
    fn record(&mut self, event: Event) {
        self.0.borrow_mut().push(event);
    }
}

pub struct Fixture {
    pub bus: TestBus,
    pub serial: Rc<RefCell<SerialInterface>>,
    pub clock: SimClock,
    pub pin: Rc<RefCell<PinState>>,
    pub events: Rc<RefCell<Vec<Event>>>,
}

fn fixture_unbegun(role: Role) -> Fixture {
    let serial = SerialInterface::new();
    let clock = SimClock::new();
    let pin = Rc::new(RefCell::new(PinState::default()));
    let events = Rc::new(RefCell::new(Vec::new()));

    let mut bus = Msup::new(
        SerialHandle::new(&serial),
        clock.clone(),
        LinkLayer::Rs485,
        PinHandle::new(&pin),
        role,
    );
    bus.attach_debug(Box::new(RecordingSink(events.clone())));

    Fixture {
        bus,
        serial,
        clock,
        pin,
        events,
    }
}

fn fixture(role: Role, address: u8) -> Fixture {
    let mut fixture = fixture_unbegun(role);
    fixture
        .bus
        .begin(9600, address)
        .expect("begin should succeed");
    fixture
}

pub fn new_master() -> Fixture {
    fixture(Role::Master, msup_proto::MASTER_PSEUDO_ADDRESS)
}

pub fn new_slave(address: u8) -> Fixture {
    fixture(Role::Slave, address)
}

pub fn new_unbegun(role: Role) -> Fixture {
    fixture_unbegun(role)
}

/// Logical section of a frame: flag, address and the optional
/// `(service, subservice, payload)` triple.
pub fn logical_bytes(flags: u8, address: u8, service: Option<(u8, u8, &[u8])>) -> Vec<u8> {
    let mut logical = vec![flags, address];
    if let Some((srv, sub, payload)) = service {
        logical.push(payload.len() as u8);
        logical.push(srv);
        logical.push(sub);
        logical.extend_from_slice(payload);
    }
    logical
}

/// A complete frame as it appears on the wire.
pub fn wire_frame(flags: u8, address: u8, service: Option<(u8, u8, &[u8])>) -> Vec<u8> {
    let logical = logical_bytes(flags, address, service);
    let crc = crc16_ccitt(&logical);
    let mut wire = vec![START1, START2];
    wire.extend_from_slice(&logical);
    wire.extend_from_slice(&crc.to_be_bytes());
    wire.push(STOP1);
    wire.push(STOP2);
    wire
}
