//! Deterministic host-side simulation of the draht wire.
//!
//! Binds the `draht-phys` capability traits to a virtual open-drain
//! line shared by any number of [Link] instances, with a single
//! microsecond clock driving edges, frame delivery, one-shot timers,
//! and the periodic tick. Everything is Rc/RefCell plumbing on one
//! thread, so every run is exactly reproducible.
//!
//! Two simplifications against real copper:
//!
//! * Only deliberate pin drives (start pulses, test holds) pull the
//!   simulated line low; the serial bytes themselves do not generate
//!   edges or affect sampled levels.
//! * The virtual UART signals `DataReceived` when the frame on the
//!   wire ends, standing in for the break/idle detection a hardware
//!   engine would use to terminate a shorter-than-maximum DMA read.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use draht_phys::{
    BusPin, Link, LinkCfg, PacketBox, PacketStorage, PinPull, SerialDma, SerialMode, TickTimer,
    TimerTag, XferStatus, TICK_PERIOD_US,
};
use rand_chacha::{rand_core::SeedableRng, ChaCha8Rng};

/// Pool slots handed to every simulated node: both rings full, the
/// in-flight slots, and change.
const NODE_POOL_SLOTS: usize = 24;

/// One frame's trip over the wire, for test assertions.
#[derive(Clone, Copy, Debug)]
pub struct FrameRecord {
    /// Node index of the transmitter.
    pub sender: usize,
    /// Microsecond the first byte went out.
    pub start: u64,
    /// Microsecond the last byte finished.
    pub end: u64,
}

#[derive(Default)]
struct PinState {
    drive_low: bool,
    irq_armed: bool,
    pending_edge: bool,
}

struct Frame {
    bytes: Vec<u8>,
    ends_at: u64,
    sender: usize,
}

#[derive(Default)]
struct Wire {
    pins: Vec<PinState>,
    held_low: bool,
    frame: Option<Frame>,
    corrupt: Option<(usize, u8)>,
    log: Vec<FrameRecord>,
    collisions: u32,
}

impl Wire {
    fn level(&self) -> bool {
        !self.held_low && !self.pins.iter().any(|p| p.drive_low)
    }

    fn mark_edges(&mut self) {
        for pin in &mut self.pins {
            if pin.irq_armed {
                pin.pending_edge = true;
            }
        }
    }

    fn set_drive(&mut self, idx: usize, low: bool) {
        let was_high = self.level();
        self.pins[idx].drive_low = low;
        if was_high && !self.level() {
            self.mark_edges();
        }
    }

    fn set_held(&mut self, low: bool) {
        let was_high = self.level();
        self.held_low = low;
        if was_high && !self.level() {
            self.mark_edges();
        }
    }
}

struct UartState {
    mode: SerialMode,
    baud: u32,
    rx: Option<(PacketBox, usize)>,
    tx: Option<PacketBox>,
    done: Option<PacketBox>,
}

impl UartState {
    fn new() -> Self {
        Self {
            mode: SerialMode::Disconnected,
            baud: 1_000_000,
            rx: None,
            tx: None,
            done: None,
        }
    }
}

/// Virtual DMA single-wire UART of one node.
pub struct SimSerial {
    uart: Rc<RefCell<UartState>>,
    wire: Rc<RefCell<Wire>>,
    clock: Rc<Cell<u64>>,
    idx: usize,
}

impl SerialDma for SimSerial {
    fn set_baud(&mut self, baud: u32) {
        self.uart.borrow_mut().baud = baud;
    }

    fn set_mode(&mut self, mode: SerialMode) {
        self.uart.borrow_mut().mode = mode;
    }

    fn start_rx(&mut self, buf: PacketBox, max_len: usize) {
        self.uart.borrow_mut().rx = Some((buf, max_len));
    }

    fn start_tx(&mut self, buf: PacketBox, len: usize) {
        let mut uart = self.uart.borrow_mut();
        let now = self.clock.get();
        // ten bit times per 8N1 byte
        let byte_us = 10_000_000u64 / uart.baud as u64;
        let ends_at = now + len as u64 * byte_us;
        let mut wire = self.wire.borrow_mut();
        if wire.frame.is_some() {
            wire.collisions += 1;
        }
        wire.frame = Some(Frame {
            bytes: buf[..len].to_vec(),
            ends_at,
            sender: self.idx,
        });
        wire.log.push(FrameRecord {
            sender: self.idx,
            start: now,
            end: ends_at,
        });
        uart.tx = Some(buf);
    }

    fn abort(&mut self) -> Option<PacketBox> {
        let mut uart = self.uart.borrow_mut();
        uart.mode = SerialMode::Disconnected;
        if uart.tx.is_some() {
            let mut wire = self.wire.borrow_mut();
            if wire.frame.as_ref().map(|f| f.sender) == Some(self.idx) {
                wire.frame = None;
            }
        }
        uart.rx
            .take()
            .map(|(buf, _)| buf)
            .or_else(|| uart.tx.take())
            .or_else(|| uart.done.take())
    }

    fn take_buffer(&mut self) -> Option<PacketBox> {
        self.uart.borrow_mut().done.take()
    }
}

/// Virtual bus pin of one node.
pub struct SimPin {
    wire: Rc<RefCell<Wire>>,
    idx: usize,
}

impl BusPin for SimPin {
    fn set_output(&mut self, high: bool) {
        self.wire.borrow_mut().set_drive(self.idx, !high);
    }

    fn get_input(&mut self, _pull: PinPull) -> bool {
        let mut wire = self.wire.borrow_mut();
        wire.set_drive(self.idx, false);
        wire.level()
    }

    fn enable_edge_events(&mut self) {
        self.wire.borrow_mut().pins[self.idx].irq_armed = true;
    }

    fn disable_edge_events(&mut self) {
        let mut wire = self.wire.borrow_mut();
        let pin = &mut wire.pins[self.idx];
        pin.irq_armed = false;
        pin.pending_edge = false;
    }
}

/// Virtual microsecond timer of one node.
///
/// A busy wait advances the shared clock directly: inside the
/// simulation, spinning is what makes time pass.
pub struct SimTimer {
    clock: Rc<Cell<u64>>,
    queue: Rc<RefCell<Vec<(u64, TimerTag)>>>,
}

impl TickTimer for SimTimer {
    fn now_micros(&self) -> u64 {
        self.clock.get()
    }

    fn schedule_after(&mut self, us: u32, tag: TimerTag) {
        let due = self.clock.get() + us as u64;
        self.queue.borrow_mut().push((due, tag));
    }

    fn busy_wait(&self, us: u32) {
        self.clock.set(self.clock.get() + us as u64);
    }
}

/// Capability bundle of a simulated node.
pub struct SimCfg;

impl LinkCfg for SimCfg {
    type Serial = SimSerial;
    type Pin = SimPin;
    type Timer = SimTimer;
    type Rand = ChaCha8Rng;
}

struct Node {
    link: Link<SimCfg>,
    uart: Rc<RefCell<UartState>>,
    timers: Rc<RefCell<Vec<(u64, TimerTag)>>>,
}

/// The shared wire and every node attached to it.
pub struct SimBus {
    clock: Rc<Cell<u64>>,
    wire: Rc<RefCell<Wire>>,
    nodes: Vec<Node>,
    next_tick: u64,
}

impl SimBus {
    /// An empty bus at time zero.
    pub fn new() -> Self {
        Self {
            clock: Rc::new(Cell::new(0)),
            wire: Rc::new(RefCell::new(Wire::default())),
            nodes: Vec::new(),
            next_tick: TICK_PERIOD_US as u64,
        }
    }

    /// Attach a fresh, stopped node; returns its index.
    pub fn add_node(&mut self, id: u16) -> usize {
        let idx = self.nodes.len();
        self.wire.borrow_mut().pins.push(PinState::default());

        let uart = Rc::new(RefCell::new(UartState::new()));
        let timers = Rc::new(RefCell::new(Vec::new()));
        let storage: &'static PacketStorage<NODE_POOL_SLOTS> =
            Box::leak(Box::new(PacketStorage::new()));

        let link = Link::new(
            SimSerial {
                uart: uart.clone(),
                wire: self.wire.clone(),
                clock: self.clock.clone(),
                idx,
            },
            SimPin {
                wire: self.wire.clone(),
                idx,
            },
            SimTimer {
                clock: self.clock.clone(),
                queue: timers.clone(),
            },
            ChaCha8Rng::seed_from_u64(0xD1A7 + idx as u64),
            storage.take().unwrap(),
            id,
        );

        self.nodes.push(Node { link, uart, timers });
        idx
    }

    /// The layer instance of node `idx`.
    pub fn link(&mut self, idx: usize) -> &mut Link<SimCfg> {
        &mut self.nodes[idx].link
    }

    /// Current simulated time in microseconds.
    pub fn now(&self) -> u64 {
        self.clock.get()
    }

    /// Current line level, `true` is high.
    pub fn line_level(&self) -> bool {
        self.wire.borrow().level()
    }

    /// Is node `idx`'s engine free of armed or parked transfers?
    pub fn uart_idle(&self, idx: usize) -> bool {
        let uart = self.nodes[idx].uart.borrow();
        uart.rx.is_none() && uart.tx.is_none() && uart.done.is_none()
    }

    /// Every frame that has been put on the wire so far.
    pub fn frame_log(&self) -> Vec<FrameRecord> {
        self.wire.borrow().log.clone()
    }

    /// Transmissions that started while another was still in flight.
    pub fn collisions(&self) -> u32 {
        self.wire.borrow().collisions
    }

    /// XOR `mask` into byte `at` of the next frame delivered.
    pub fn corrupt_next_frame(&mut self, at: usize, mask: u8) {
        self.wire.borrow_mut().corrupt = Some((at, mask));
    }

    /// Pull the line low from outside any node, as a stuck device or a
    /// remote transmitter's pulse would.
    pub fn hold_line_low(&mut self) {
        self.wire.borrow_mut().set_held(true);
    }

    /// Release the external hold.
    pub fn release_line(&mut self) {
        self.wire.borrow_mut().set_held(false);
    }

    /// Hold the line low for `us` of simulated time, then release it.
    pub fn pulse_line_low(&mut self, us: u64) {
        self.hold_line_low();
        self.run_for(us);
        self.release_line();
    }

    /// Advance the simulation by `us` microseconds.
    pub fn run_for(&mut self, us: u64) {
        let target = self.clock.get() + us;
        while self.clock.get() < target {
            self.step();
        }
    }

    /// One event-processing pass at the current microsecond, then
    /// advance the clock by one.
    fn step(&mut self) {
        self.deliver_edges();
        self.deliver_finished_frame();
        self.fire_timers();
        self.fire_ticks();
        self.clock.set(self.clock.get() + 1);
    }

    fn deliver_edges(&mut self) {
        for idx in 0..self.nodes.len() {
            let fire = {
                let mut wire = self.wire.borrow_mut();
                let pin = &mut wire.pins[idx];
                let fire = pin.pending_edge && pin.irq_armed;
                pin.pending_edge = false;
                fire
            };
            if fire {
                self.nodes[idx].link.on_falling_edge();
            }
        }
    }

    fn deliver_finished_frame(&mut self) {
        let now = self.clock.get();
        let finished = {
            let mut wire = self.wire.borrow_mut();
            match &wire.frame {
                Some(frame) if frame.ends_at <= now => wire.frame.take(),
                _ => None,
            }
        };
        let Some(frame) = finished else {
            return;
        };
        let corrupt = self.wire.borrow_mut().corrupt.take();

        // the transmitter's write completes
        {
            let node = &mut self.nodes[frame.sender];
            let mut uart = node.uart.borrow_mut();
            uart.done = uart.tx.take();
        }
        self.nodes[frame.sender]
            .link
            .on_dma_complete(XferStatus::DataSent);

        // every armed listener hears the same bytes
        for idx in 0..self.nodes.len() {
            if idx == frame.sender {
                continue;
            }
            let fire = {
                let mut uart = self.nodes[idx].uart.borrow_mut();
                if uart.mode != SerialMode::Rx {
                    false
                } else if let Some((mut buf, max_len)) = uart.rx.take() {
                    let n = frame.bytes.len().min(max_len).min(buf.len());
                    buf[..n].copy_from_slice(&frame.bytes[..n]);
                    if let Some((at, mask)) = corrupt {
                        if at < n {
                            buf[at] ^= mask;
                        }
                    }
                    uart.done = Some(buf);
                    true
                } else {
                    false
                }
            };
            if fire {
                self.nodes[idx].link.on_dma_complete(XferStatus::DataReceived);
            }
        }
    }

    fn fire_timers(&mut self) {
        for idx in 0..self.nodes.len() {
            loop {
                let due = {
                    let now = self.clock.get();
                    let mut timers = self.nodes[idx].timers.borrow_mut();
                    let pos = timers
                        .iter()
                        .enumerate()
                        .filter(|(_, (at, _))| *at <= now)
                        .min_by_key(|(_, (at, _))| *at)
                        .map(|(pos, _)| pos);
                    pos.map(|pos| timers.remove(pos).1)
                };
                match due {
                    Some(tag) => self.nodes[idx].link.on_timer(tag),
                    None => break,
                }
            }
        }
    }

    fn fire_ticks(&mut self) {
        if self.clock.get() >= self.next_tick {
            for node in &mut self.nodes {
                node.link.on_tick();
            }
            self.next_tick += TICK_PERIOD_US as u64;
        }
    }
}

impl Default for SimBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_idles_high_and_holds_low() {
        let mut bus = SimBus::new();
        bus.add_node(1);
        assert!(bus.line_level());
        bus.hold_line_low();
        assert!(!bus.line_level());
        bus.release_line();
        assert!(bus.line_level());
    }

    #[test]
    fn held_line_marks_edges_for_armed_pins() {
        let mut bus = SimBus::new();
        let a = bus.add_node(1);
        bus.link(a).start();
        bus.hold_line_low();
        bus.run_for(2);
        // the node left listening and armed a receive
        assert!(!bus.uart_idle(a));
        bus.release_line();
    }

    #[test]
    fn clock_advances_with_run_for() {
        let mut bus = SimBus::new();
        bus.add_node(1);
        bus.run_for(123);
        assert_eq!(bus.now(), 123);
    }
}
