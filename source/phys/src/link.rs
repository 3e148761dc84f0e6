//! The bus state machine.
//!
//! [Link] coordinates the three asynchronous event sources (line edge,
//! DMA completion, scheduler tick) against the shared queues and the
//! current receive/transmit slots. It is the one place that decides
//! who owns the wire at any instant.

use heapless::Deque;
use rand_core::RngCore;

use crate::line::{LineController, START_PULSE_US};
use crate::packet::{validate, Header, Packet, RxFault, FRAME_BYTES, HEADER_BYTES, MAX_PAYLOAD};
use crate::pool::{PacketBox, RawPacketSlice};
use crate::queue::PacketQueue;
use crate::{
    random_below, status, BusPin, Event, EventCode, SendError, SerialDma, SerialMode, TickTimer,
    TimerTag, XferStatus, BUS_NORMALITY_PERIOD_US, DEFAULT_BAUD, MAX_INTERLODATA_SPACING_US,
    QUEUE_SLOTS, TICK_PERIOD_US, TX_MAX_BACKOFF_US, TX_PULSE_TO_DATA_US,
};

/// Capability bundle a [Link] is instantiated over.
pub trait LinkCfg {
    /// The DMA-driven single-wire UART.
    type Serial: SerialDma;
    /// The bus pin.
    type Pin: BusPin;
    /// Microsecond timer and one-shot scheduler.
    type Timer: TickTimer;
    /// Entropy for back-off jitter.
    type Rand: RngCore;
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum State {
    Off,
    Listening,
    Receiving,
    Transmitting,
    ErrorRecovery,
}

/// Externally visible bus condition, derived from the machine state
/// and a live line sample.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub enum BusState {
    /// A frame is being received.
    Receiving,
    /// A frame is being transmitted.
    Transmitting,
    /// Idle, line floating high.
    High,
    /// Idle, but something is pulling the line low.
    Low,
}

/// Running counters of everything the layer has seen.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub struct Diagnostics {
    /// Machine state transitions since start.
    pub bus_state: u32,
    /// Line held low with no data following.
    pub bus_lo_error: u32,
    /// Engine errors plus frames that failed validation.
    pub bus_uart_error: u32,
    /// Receive windows that expired.
    pub bus_timeout_error: u32,
    /// Frames fully written to the wire.
    pub packets_sent: u32,
    /// Validated frames handed to the receive ring.
    pub packets_received: u32,
    /// Frames lost to full rings or an exhausted pool.
    pub packets_dropped: u32,
}

const EVENT_QUEUE_DEPTH: usize = 8;

/// How many ticks a receive may take before it is declared dead.
///
/// 10 bits per 8N1 symbol, times a 10x margin over the theoretical
/// minimum so inter-byte gaps from slow senders and our own tick
/// jitter cannot cut off a frame mid-read, expressed in scheduler
/// ticks.
fn rx_tick_limit(baud: u32) -> u32 {
    let per_symbol_us = 1_000_000 / baud;
    (per_symbol_us * 100 * FRAME_BYTES as u32) / TICK_PERIOD_US
}

/// One instance of the physical layer, owning its pin, engine, timer,
/// entropy source, and packet pool.
pub struct Link<Cfg: LinkCfg> {
    serial: Cfg::Serial,
    line: LineController<Cfg::Pin>,
    timer: Cfg::Timer,
    rand: Cfg::Rand,
    pool: RawPacketSlice,
    id: u16,
    baud: u32,

    state: State,
    status: u16,
    rx_buf: Option<PacketBox>,
    tx_buf: Option<Packet>,
    rx_queue: PacketQueue<QUEUE_SLOTS>,
    tx_queue: PacketQueue<QUEUE_SLOTS>,
    events: Deque<Event, EVENT_QUEUE_DEPTH>,
    diags: Diagnostics,

    rx_ticks: u32,
    rx_tick_limit: u32,
    last_level: Option<bool>,
    low_since: Option<u64>,
    drain_due: Option<u64>,
    recover_at: Option<u64>,
}

impl<Cfg: LinkCfg> Link<Cfg> {
    /// Build a stopped layer over its capabilities. `pool` provides
    /// every frame buffer the instance will ever use; `id` is carried
    /// as the source of all published events.
    pub fn new(
        serial: Cfg::Serial,
        pin: Cfg::Pin,
        timer: Cfg::Timer,
        rand: Cfg::Rand,
        pool: RawPacketSlice,
        id: u16,
    ) -> Self {
        let mut serial = serial;
        serial.set_baud(DEFAULT_BAUD);
        serial.set_mode(SerialMode::Disconnected);
        Self {
            serial,
            line: LineController::new(pin),
            timer,
            rand,
            pool,
            id,
            baud: DEFAULT_BAUD,
            state: State::Off,
            status: 0,
            rx_buf: None,
            tx_buf: None,
            rx_queue: PacketQueue::new(),
            tx_queue: PacketQueue::new(),
            events: Deque::new(),
            diags: Diagnostics::default(),
            rx_ticks: 0,
            rx_tick_limit: 0,
            last_level: None,
            low_since: None,
            drain_due: None,
            recover_at: None,
        }
    }

    /// Begin listening for frames on the line.
    ///
    /// Idempotent. Error counters restart from zero; the packet
    /// counters are monotonic across restarts.
    pub fn start(&mut self) {
        if self.is_running() {
            return;
        }
        if self.rx_buf.is_none() {
            self.rx_buf = self.pool.allocate_raw();
        }
        self.diags.bus_state = 0;
        self.diags.bus_lo_error = 0;
        self.diags.bus_uart_error = 0;
        self.diags.bus_timeout_error = 0;
        self.last_level = None;
        self.low_since = None;
        self.status = status::RUNNING | status::TICK_ENABLED;
        self.set_state(State::Listening);
        self.line.listen();
        drt_info!("bus start");

        // the line already being low means a transfer is mid-flight;
        // join it as a receiver instead of waiting for an edge we
        // already missed
        if !self.line.read_level() {
            self.on_falling_edge();
        }

        if !self.tx_queue.is_empty() {
            self.drain();
        }
    }

    /// Stop listening, abort any transfer, and release every buffer.
    ///
    /// Idempotent. Pending timer callbacks may still fire afterwards;
    /// they are ignored.
    pub fn stop(&mut self) {
        if !self.is_running() {
            return;
        }
        self.line.ignore_edges();
        let _ = self.serial.abort();
        self.serial.set_mode(SerialMode::Disconnected);
        self.rx_buf = None;
        self.tx_buf = None;
        self.rx_queue.clear();
        self.tx_queue.clear();
        while self.events.pop_front().is_some() {}
        self.drain_due = None;
        self.recover_at = None;
        self.low_since = None;
        self.status = 0;
        self.set_state(State::Off);
        self.line.release();
        drt_info!("bus stop");
    }

    /// Has [start](Link::start) been called?
    pub fn is_running(&self) -> bool {
        self.status & status::RUNNING != 0
    }

    /// Is the bus believed to be alive? True once line activity has
    /// been observed and no stuck-low condition has been seen since.
    pub fn is_connected(&self) -> bool {
        self.is_running() && self.status & status::BUS_TOGGLED != 0
    }

    /// Reconfigure the line rate. Takes effect for subsequent
    /// transfers.
    pub fn set_baud(&mut self, baud: u32) {
        self.baud = baud;
        self.serial.set_baud(baud);
    }

    /// Dequeue one received packet, oldest first.
    pub fn get_packet(&mut self) -> Option<Packet> {
        self.rx_queue.pop()
    }

    /// Take a free pool slot for building an outgoing frame.
    pub fn alloc_packet(&mut self) -> Option<Packet> {
        self.pool.allocate_raw().map(Packet::new)
    }

    /// Queue a packet for transmission. With `compute_crc` the CRC
    /// field is filled in here; callers bridging already-sealed frames
    /// pass `false`.
    ///
    /// Ownership transfers on success. On overflow the packet is
    /// released and [SendError::NoResources] returned.
    pub fn send(&mut self, mut packet: Packet, compute_crc: bool) -> Result<(), SendError> {
        if packet.size() as usize > MAX_PAYLOAD {
            return Err(SendError::InvalidParameter);
        }
        if compute_crc {
            packet.apply_crc();
        }
        if let Err(packet) = self.tx_queue.push(packet) {
            drop(packet);
            self.diags.packets_dropped += 1;
            drt_warn!("tx queue full");
            return Err(SendError::NoResources);
        }
        if self.status & status::TX_DRAIN_ENABLE == 0 {
            self.drain();
        }
        Ok(())
    }

    /// Allocate, fill, seal, and queue a frame in one call.
    pub fn send_frame(&mut self, payload: &[u8], header: &Header) -> Result<(), SendError> {
        if payload.is_empty() || payload.len() > MAX_PAYLOAD {
            return Err(SendError::InvalidParameter);
        }
        let Some(slot) = self.pool.allocate_raw() else {
            return Err(SendError::NoResources);
        };
        let mut packet = Packet::new(slot);
        packet.set_header(header);
        packet.set_payload(payload);
        self.send(packet, true)
    }

    /// The current bus condition.
    pub fn get_state(&mut self) -> BusState {
        match self.state {
            State::Receiving => BusState::Receiving,
            State::Transmitting => BusState::Transmitting,
            _ => {
                if self.line.read_level() {
                    BusState::High
                } else {
                    BusState::Low
                }
            }
        }
    }

    /// The error bits of the status word.
    pub fn get_error_state(&self) -> u16 {
        self.status & status::ERROR_MASK
    }

    /// The whole status word.
    pub fn status_bits(&self) -> u16 {
        self.status
    }

    /// A copy of the running counters.
    pub fn get_diagnostics(&self) -> Diagnostics {
        self.diags
    }

    /// Dequeue one published event, oldest first.
    pub fn poll_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Falling edge seen on the line.
    ///
    /// Only honored while listening; edges caused by our own start
    /// pulse or arriving mid-receive are spurious and dropped.
    pub fn on_falling_edge(&mut self) {
        if self.state != State::Listening || !self.is_running() {
            return;
        }
        self.note_level(false);
        self.line.float_input();
        let Some(buf) = self.rx_buf.take().or_else(|| self.pool.allocate_raw()) else {
            // upstream is sitting on every slot; this frame is lost
            self.diags.packets_dropped += 1;
            self.line.listen();
            return;
        };
        self.status |= status::RECEIVING | status::RX_LO_PULSE;
        self.set_state(State::Receiving);
        self.rx_ticks = 0;
        self.rx_tick_limit = rx_tick_limit(self.baud);
        self.serial.set_mode(SerialMode::Rx);
        self.serial.start_rx(buf, FRAME_BYTES);
        drt_debug!("rx window open");
    }

    /// Completion callback from the transfer engine.
    pub fn on_dma_complete(&mut self, code: XferStatus) {
        match (self.state, code) {
            (State::Receiving, XferStatus::DataReceived) => self.finish_rx(),
            (State::Receiving, XferStatus::Error) => {
                drt_warn!("rx dma error");
                self.error_state(status::BUS_UART_ERROR);
            }
            (State::Transmitting, XferStatus::DataSent) => self.finish_tx(),
            (State::Transmitting, XferStatus::Error) => {
                drt_warn!("tx dma error");
                self.tx_buf = None;
                self.error_state(status::BUS_UART_ERROR);
            }
            // stale completion, e.g. raced with stop()
            _ => {}
        }
    }

    /// Periodic scheduler tick: receive deadline accounting, stuck-low
    /// surveillance, due drains, recovery expiry.
    pub fn on_tick(&mut self) {
        if self.status & status::TICK_ENABLED == 0 {
            return;
        }
        match self.state {
            State::Receiving => {
                self.rx_ticks += 1;
                if self.rx_ticks > self.rx_tick_limit {
                    drt_warn!("rx deadline exceeded");
                    self.emit(EventCode::RxTimeout);
                    self.error_state(status::BUS_TIMEOUT_ERROR);
                }
            }
            State::Listening => {
                let level = self.line.read_level();
                self.note_level(level);
                let now = self.timer.now_micros();
                if level {
                    self.low_since = None;
                } else {
                    let since = *self.low_since.get_or_insert(now);
                    if now.saturating_sub(since) > MAX_INTERLODATA_SPACING_US as u64 {
                        drt_warn!("line stuck low");
                        self.low_since = None;
                        self.error_state(status::BUS_LO_ERROR);
                        return;
                    }
                }
                self.run_due_drain();
            }
            State::ErrorRecovery => self.check_recovery(),
            _ => {}
        }
    }

    /// One-shot deadline from the timer capability.
    pub fn on_timer(&mut self, tag: TimerTag) {
        if !self.is_running() {
            return;
        }
        match tag {
            TimerTag::Drain => self.run_due_drain(),
            TimerTag::Normality => self.check_recovery(),
        }
    }

    fn set_state(&mut self, state: State) {
        if self.state != state {
            self.diags.bus_state = self.diags.bus_state.wrapping_add(1);
        }
        self.state = state;
    }

    fn emit(&mut self, code: EventCode) {
        let _ = self.events.push_back(Event {
            source: self.id,
            code,
        });
    }

    /// Record a line sample in the status word and track liveness.
    fn note_level(&mut self, level: bool) {
        if level {
            self.status |= status::BUS_STATE;
        } else {
            self.status &= !status::BUS_STATE;
        }
        if let Some(prev) = self.last_level {
            if prev != level {
                self.mark_alive();
            }
        }
        self.last_level = Some(level);
    }

    fn mark_alive(&mut self) {
        if self.status & status::BUS_TOGGLED == 0 {
            self.status |= status::BUS_TOGGLED;
            self.emit(EventCode::BusConnected);
        }
    }

    /// Return to listening: engine detached, pull-up on, edges armed,
    /// error bits retired to the diagnostics counters.
    fn to_listening(&mut self) {
        self.serial.set_mode(SerialMode::Disconnected);
        self.status &= !status::ERROR_MASK;
        self.low_since = None;
        self.set_state(State::Listening);
        self.line.listen();
    }

    fn finish_rx(&mut self) {
        self.status &= !(status::RECEIVING | status::RX_LO_PULSE);
        let Some(mut buf) = self.serial.take_buffer() else {
            self.error_state(status::BUS_UART_ERROR);
            return;
        };
        self.serial.set_mode(SerialMode::Disconnected);
        match validate(&buf) {
            Ok(size) => {
                buf.set_len(HEADER_BYTES + size);
                match self.rx_queue.push(Packet::from_raw(buf)) {
                    Ok(()) => {
                        self.diags.packets_received += 1;
                        self.emit(EventCode::DataReady);
                    }
                    Err(packet) => {
                        drop(packet);
                        self.diags.packets_dropped += 1;
                        drt_warn!("rx queue full, frame dropped");
                    }
                }
                if self.rx_buf.is_none() {
                    self.rx_buf = self.pool.allocate_raw();
                }
            }
            Err(fault) => {
                self.diags.bus_uart_error += 1;
                self.status |= status::BUS_UART_ERROR;
                self.emit(match fault {
                    RxFault::Crc => EventCode::CrcError,
                    _ => EventCode::BusError,
                });
                drt_warn!("rx frame rejected");
                // the slot never left us; reuse it for the next frame
                self.rx_buf = Some(buf);
            }
        }
        self.mark_alive();
        self.to_listening();
    }

    fn finish_tx(&mut self) {
        self.status &= !(status::TRANSMITTING | status::TX_LO_PULSE);
        if let Some(buf) = self.serial.take_buffer() {
            drop(buf);
        }
        self.diags.packets_sent += 1;
        self.mark_alive();
        self.to_listening();
        // a random gap before the next queued frame keeps one busy
        // sender from hogging the wire
        let jitter = random_below(&mut self.rand, TX_MAX_BACKOFF_US);
        self.schedule_drain(jitter);
    }

    /// Enter error recovery: count and flag the error, quiesce the
    /// line and engine, and relisten after the normality period.
    fn error_state(&mut self, kind: u16) {
        self.status &=
            !(status::RECEIVING | status::TRANSMITTING | status::RX_LO_PULSE | status::TX_LO_PULSE);
        self.status |= kind;
        match kind {
            status::BUS_LO_ERROR => self.diags.bus_lo_error += 1,
            status::BUS_TIMEOUT_ERROR => self.diags.bus_timeout_error += 1,
            _ => self.diags.bus_uart_error += 1,
        }

        let reclaimed = self.serial.abort();
        match self.state {
            // an aborted receive hands its slot straight back
            State::Receiving => {
                if self.rx_buf.is_none() {
                    self.rx_buf = reclaimed;
                }
            }
            _ => drop(reclaimed),
        }
        self.serial.set_mode(SerialMode::Disconnected);
        self.line.release();

        if kind == status::BUS_LO_ERROR && self.status & status::BUS_TOGGLED != 0 {
            self.status &= !status::BUS_TOGGLED;
            self.emit(EventCode::BusDisconnected);
        }
        self.emit(EventCode::BusError);
        self.set_state(State::ErrorRecovery);
        self.recover_at = Some(
            self.timer
                .now_micros()
                .saturating_add(BUS_NORMALITY_PERIOD_US as u64),
        );
        self.timer
            .schedule_after(BUS_NORMALITY_PERIOD_US, TimerTag::Normality);
    }

    fn check_recovery(&mut self) {
        if self.state != State::ErrorRecovery {
            return;
        }
        if let Some(at) = self.recover_at {
            if self.timer.now_micros() >= at {
                self.recover_at = None;
                self.to_listening();
                drt_info!("bus recovered");
            }
        }
    }

    fn run_due_drain(&mut self) {
        if let Some(at) = self.drain_due {
            if self.timer.now_micros() >= at {
                self.drain_due = None;
                self.drain();
            }
        }
    }

    fn schedule_drain(&mut self, us: u32) {
        self.drain_due = Some(self.timer.now_micros().saturating_add(us as u64));
        self.timer.schedule_after(us, TimerTag::Drain);
    }

    /// The TX drain sequence: service the transmit queue if the wire
    /// and the state machine allow it, otherwise reschedule.
    fn drain(&mut self) {
        self.status |= status::TX_DRAIN_ENABLE;

        // inbound traffic wins every race; try again after a jitter
        if self.state == State::Receiving {
            let jitter = random_below(&mut self.rand, TX_MAX_BACKOFF_US);
            self.schedule_drain(jitter);
            return;
        }

        // second half of a transmission: the start pulse is out and the
        // inter-lo-data gap has elapsed, so push the bytes
        if self.state == State::Transmitting {
            if let Some(packet) = self.tx_buf.take() {
                let len = packet.wire_len();
                self.status &= !status::TX_LO_PULSE;
                self.serial.set_mode(SerialMode::Tx);
                self.serial.start_tx(packet.into_inner(), len);
                drt_debug!("tx data start");
            }
            return;
        }

        if self.state != State::Listening {
            match self.state {
                State::ErrorRecovery => {
                    let jitter = random_below(&mut self.rand, TX_MAX_BACKOFF_US);
                    self.schedule_drain(jitter);
                }
                _ => self.status &= !status::TX_DRAIN_ENABLE,
            }
            return;
        }

        // somebody else pulsed first; fall into their frame as a
        // receiver and come back later
        if !self.line.read_level() {
            self.on_falling_edge();
            let jitter = random_below(&mut self.rand, TX_MAX_BACKOFF_US);
            self.schedule_drain(jitter);
            return;
        }

        let Some(packet) = self.tx_queue.pop() else {
            self.status &= !status::TX_DRAIN_ENABLE;
            return;
        };

        self.status |= status::TRANSMITTING | status::TX_LO_PULSE;
        self.set_state(State::Transmitting);
        self.line.ignore_edges();
        self.tx_buf = Some(packet);
        self.emit(EventCode::Drain);
        drt_debug!("tx pulse");
        self.line.drive_low_for(&self.timer, START_PULSE_US);
        self.schedule_drain(TX_PULSE_TO_DATA_US);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PacketStorage;
    use crate::PinPull;
    use core::cell::{Cell, RefCell};

    const POOL: usize = 16;

    struct SerialState {
        mode: SerialMode,
        held: Option<PacketBox>,
        done: Option<PacketBox>,
        rx_starts: usize,
        tx_starts: usize,
        last_tx_len: usize,
    }

    impl SerialState {
        fn new() -> Self {
            Self {
                mode: SerialMode::Disconnected,
                held: None,
                done: None,
                rx_starts: 0,
                tx_starts: 0,
                last_tx_len: 0,
            }
        }

        /// Pretend the in-flight transfer finished.
        fn complete(&mut self) {
            self.done = self.held.take();
        }
    }

    struct TestSerial(&'static RefCell<SerialState>);

    impl SerialDma for TestSerial {
        fn set_baud(&mut self, _baud: u32) {}
        fn set_mode(&mut self, mode: SerialMode) {
            self.0.borrow_mut().mode = mode;
        }
        fn start_rx(&mut self, buf: PacketBox, _max_len: usize) {
            let mut s = self.0.borrow_mut();
            s.held = Some(buf);
            s.rx_starts += 1;
        }
        fn start_tx(&mut self, buf: PacketBox, len: usize) {
            let mut s = self.0.borrow_mut();
            s.held = Some(buf);
            s.tx_starts += 1;
            s.last_tx_len = len;
        }
        fn abort(&mut self) -> Option<PacketBox> {
            let mut s = self.0.borrow_mut();
            s.mode = SerialMode::Disconnected;
            s.held.take().or_else(|| s.done.take())
        }
        fn take_buffer(&mut self) -> Option<PacketBox> {
            self.0.borrow_mut().done.take()
        }
    }

    struct PinState {
        level: Cell<bool>,
        armed: Cell<bool>,
        pulses: Cell<u32>,
    }

    struct TestPin(&'static PinState);

    impl BusPin for TestPin {
        fn set_output(&mut self, high: bool) {
            if !high {
                self.0.pulses.set(self.0.pulses.get() + 1);
            }
        }
        fn get_input(&mut self, _pull: PinPull) -> bool {
            self.0.level.get()
        }
        fn enable_edge_events(&mut self) {
            self.0.armed.set(true);
        }
        fn disable_edge_events(&mut self) {
            self.0.armed.set(false);
        }
    }

    struct TimerState {
        now: Cell<u64>,
        scheduled: RefCell<Vec<(u64, TimerTag)>>,
    }

    struct TestTimer(&'static TimerState);

    impl TickTimer for TestTimer {
        fn now_micros(&self) -> u64 {
            self.0.now.get()
        }
        fn schedule_after(&mut self, us: u32, tag: TimerTag) {
            let due = self.0.now.get() + us as u64;
            self.0.scheduled.borrow_mut().push((due, tag));
        }
        fn busy_wait(&self, us: u32) {
            self.0.now.set(self.0.now.get() + us as u64);
        }
    }

    struct TestRng(u32);

    impl RngCore for TestRng {
        fn next_u32(&mut self) -> u32 {
            let mut x = self.0;
            x ^= x << 13;
            x ^= x >> 17;
            x ^= x << 5;
            self.0 = x;
            x
        }
        fn next_u64(&mut self) -> u64 {
            (self.next_u32() as u64) << 32 | self.next_u32() as u64
        }
        fn fill_bytes(&mut self, dest: &mut [u8]) {
            for b in dest {
                *b = self.next_u32() as u8;
            }
        }
        fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
            self.fill_bytes(dest);
            Ok(())
        }
    }

    struct TestCfg;

    impl LinkCfg for TestCfg {
        type Serial = TestSerial;
        type Pin = TestPin;
        type Timer = TestTimer;
        type Rand = TestRng;
    }

    struct Rig {
        link: Link<TestCfg>,
        serial: &'static RefCell<SerialState>,
        pin: &'static PinState,
        timer: &'static TimerState,
    }

    fn rig() -> Rig {
        let serial: &'static RefCell<SerialState> =
            Box::leak(Box::new(RefCell::new(SerialState::new())));
        let pin: &'static PinState = Box::leak(Box::new(PinState {
            level: Cell::new(true),
            armed: Cell::new(false),
            pulses: Cell::new(0),
        }));
        let timer: &'static TimerState = Box::leak(Box::new(TimerState {
            now: Cell::new(0),
            scheduled: RefCell::new(Vec::new()),
        }));
        let storage: &'static PacketStorage<POOL> = Box::leak(Box::new(PacketStorage::new()));
        let link = Link::new(
            TestSerial(serial),
            TestPin(pin),
            TestTimer(timer),
            TestRng(0x1234_5678),
            storage.take().unwrap(),
            7,
        );
        Rig {
            link,
            serial,
            pin,
            timer,
        }
    }

    fn header() -> Header {
        Header {
            device_identifier: 0x1122334455667788,
            service_number: 1,
            ..Default::default()
        }
    }

    /// Write a valid frame into the buffer the engine is holding.
    fn inject_frame(serial: &RefCell<SerialState>, payload: &[u8]) {
        let mut s = serial.borrow_mut();
        let buf = s.held.as_mut().unwrap();
        buf[..HEADER_BYTES].fill(0);
        buf[2] = crate::packet::VERSION;
        buf[12] = payload.len() as u8;
        buf[13] = 1;
        buf[HEADER_BYTES..HEADER_BYTES + payload.len()].copy_from_slice(payload);
        let crc = crate::crc::crc16(&buf[2..HEADER_BYTES + payload.len()]);
        buf[..2].copy_from_slice(&crc.to_le_bytes());
    }

    fn drain_events(link: &mut Link<TestCfg>) -> Vec<EventCode> {
        let mut out = Vec::new();
        while let Some(ev) = link.poll_event() {
            assert_eq!(ev.source, 7);
            out.push(ev.code);
        }
        out
    }

    #[test]
    fn start_listens_and_is_idempotent() {
        let mut r = rig();
        assert!(!r.link.is_running());
        r.link.start();
        assert!(r.link.is_running());
        assert!(r.pin.armed.get());
        assert_eq!(r.link.get_state(), BusState::High);
        let transitions = r.link.get_diagnostics().bus_state;
        r.link.start();
        assert_eq!(r.link.get_diagnostics().bus_state, transitions);
    }

    #[test]
    fn edge_is_only_honored_while_listening() {
        let mut r = rig();
        r.link.on_falling_edge();
        assert_eq!(r.serial.borrow().rx_starts, 0);

        r.link.start();
        r.link.on_falling_edge();
        assert_eq!(r.serial.borrow().rx_starts, 1);
        assert_eq!(r.link.get_state(), BusState::Receiving);

        // a second edge mid-receive is spurious
        r.link.on_falling_edge();
        assert_eq!(r.serial.borrow().rx_starts, 1);
    }

    #[test]
    fn valid_frame_reaches_the_rx_queue() {
        let mut r = rig();
        r.link.start();
        r.link.on_falling_edge();
        inject_frame(r.serial, &[0xAA, 0xBB]);
        r.serial.borrow_mut().complete();
        r.link.on_dma_complete(XferStatus::DataReceived);

        let pkt = r.link.get_packet().unwrap();
        assert_eq!(pkt.payload(), &[0xAA, 0xBB]);
        assert_eq!(pkt.service_number(), 1);
        assert!(pkt.verify_crc());
        assert_eq!(r.link.get_diagnostics().packets_received, 1);
        assert!(drain_events(&mut r.link).contains(&EventCode::DataReady));
        assert_eq!(r.link.get_state(), BusState::High);
        assert_eq!(r.serial.borrow().mode, SerialMode::Disconnected);
        assert!(r.link.is_connected());
    }

    #[test]
    fn corrupt_frame_counts_as_uart_error() {
        let mut r = rig();
        r.link.start();
        r.link.on_falling_edge();
        inject_frame(r.serial, &[0xAA, 0xBB]);
        r.serial.borrow_mut().held.as_mut().unwrap()[HEADER_BYTES] ^= 0x01;
        r.serial.borrow_mut().complete();
        r.link.on_dma_complete(XferStatus::DataReceived);

        assert!(r.link.get_packet().is_none());
        assert_eq!(r.link.get_diagnostics().bus_uart_error, 1);
        let events = drain_events(&mut r.link);
        assert!(events.contains(&EventCode::CrcError));
        assert!(!events.contains(&EventCode::DataReady));
        // rejected frames do not cost a recovery period
        assert_eq!(r.link.get_state(), BusState::High);
    }

    #[test]
    fn rx_error_enters_recovery_and_heals() {
        let mut r = rig();
        r.link.start();
        r.link.on_falling_edge();
        r.link.on_dma_complete(XferStatus::Error);

        assert_eq!(r.link.get_error_state(), status::BUS_UART_ERROR);
        assert!(drain_events(&mut r.link).contains(&EventCode::BusError));
        // quiesced: no DMA held, edges ignored
        assert!(r.serial.borrow().held.is_none());
        assert!(!r.pin.armed.get());
        r.link.on_falling_edge();
        assert_eq!(r.serial.borrow().rx_starts, 1);

        r.timer
            .now
            .set(r.timer.now.get() + BUS_NORMALITY_PERIOD_US as u64);
        r.link.on_timer(TimerTag::Normality);
        assert!(r.pin.armed.get());
        r.link.on_falling_edge();
        assert_eq!(r.serial.borrow().rx_starts, 2);
    }

    #[test]
    fn rx_timeout_fires_after_deadline() {
        let mut r = rig();
        r.link.start();
        r.link.on_falling_edge();
        let limit = rx_tick_limit(DEFAULT_BAUD);
        for _ in 0..=limit {
            r.link.on_tick();
        }
        assert_eq!(r.link.get_diagnostics().bus_timeout_error, 1);
        let events = drain_events(&mut r.link);
        assert!(events.contains(&EventCode::RxTimeout));
        assert!(events.contains(&EventCode::BusError));
    }

    #[test]
    fn send_pulses_then_streams() {
        let mut r = rig();
        r.link.start();
        r.link.send_frame(&[1, 2, 3], &header()).unwrap();

        // the drain ran inline: pulse out, data pending the gap timer
        assert_eq!(r.pin.pulses.get(), 1);
        assert_eq!(r.link.get_state(), BusState::Transmitting);
        assert_eq!(r.serial.borrow().tx_starts, 0);

        r.timer
            .now
            .set(r.timer.now.get() + TX_PULSE_TO_DATA_US as u64);
        r.link.on_timer(TimerTag::Drain);
        assert_eq!(r.serial.borrow().tx_starts, 1);
        assert_eq!(r.serial.borrow().last_tx_len, HEADER_BYTES + 3);

        r.serial.borrow_mut().complete();
        r.link.on_dma_complete(XferStatus::DataSent);
        assert_eq!(r.link.get_diagnostics().packets_sent, 1);
        assert_eq!(r.link.get_state(), BusState::High);
    }

    #[test]
    fn send_while_receiving_is_deferred() {
        let mut r = rig();
        r.link.start();
        r.link.on_falling_edge();
        r.link.send_frame(&[9], &header()).unwrap();
        assert_eq!(r.pin.pulses.get(), 0);

        inject_frame(r.serial, &[0x42]);
        r.serial.borrow_mut().complete();
        r.link.on_dma_complete(XferStatus::DataReceived);

        // the rescheduled drain becomes due within the back-off bound
        r.timer
            .now
            .set(r.timer.now.get() + TX_MAX_BACKOFF_US as u64);
        r.link.on_timer(TimerTag::Drain);
        assert_eq!(r.pin.pulses.get(), 1);
    }

    #[test]
    fn tx_queue_overflow_reports_no_resources() {
        let mut r = rig();
        r.link.start();
        // park the layer in a receive so nothing drains
        r.link.on_falling_edge();
        for _ in 0..10 {
            r.link.send_frame(&[0], &header()).unwrap();
        }
        assert_eq!(
            r.link.send_frame(&[0], &header()),
            Err(SendError::NoResources)
        );
        assert_eq!(r.link.get_diagnostics().packets_dropped, 1);
    }

    #[test]
    fn zero_and_oversize_payloads_are_refused() {
        let mut r = rig();
        r.link.start();
        assert_eq!(
            r.link.send_frame(&[], &header()),
            Err(SendError::InvalidParameter)
        );
        let big = [0u8; MAX_PAYLOAD + 1];
        assert_eq!(
            r.link.send_frame(&big, &header()),
            Err(SendError::InvalidParameter)
        );
    }

    #[test]
    fn stop_releases_everything_and_is_idempotent() {
        let mut r = rig();
        r.link.start();
        r.link.on_falling_edge();
        for _ in 0..3 {
            r.link.send_frame(&[1], &header()).unwrap();
        }
        r.link.stop();
        assert!(!r.link.is_running());
        assert!(r.serial.borrow().held.is_none());
        assert_eq!(r.link.pool.count_allocatable(), POOL);
        r.link.stop();
        assert!(!r.link.is_running());

        // restart listens again with a fresh slot
        r.link.start();
        r.link.on_falling_edge();
        assert_eq!(r.serial.borrow().rx_starts, 2);
    }

    #[test]
    fn start_while_line_low_joins_the_frame() {
        let mut r = rig();
        r.pin.level.set(false);
        r.link.start();
        assert_eq!(r.serial.borrow().rx_starts, 1);
        assert_eq!(r.link.get_state(), BusState::Receiving);
    }

    #[test]
    fn stuck_low_line_is_a_lo_error() {
        let mut r = rig();
        r.link.start();
        r.pin.level.set(false);
        r.link.on_tick();
        r.timer
            .now
            .set(r.timer.now.get() + MAX_INTERLODATA_SPACING_US as u64 + TICK_PERIOD_US as u64);
        r.link.on_tick();
        assert_eq!(r.link.get_diagnostics().bus_lo_error, 1);
        assert_eq!(r.link.get_error_state(), status::BUS_LO_ERROR);
    }
}
