//! # Draht Phys
//!
//! This is the physical layer of the draht project: a half-duplex,
//! multi-drop packet bus running over one open-drain signal line shared
//! by independently clocked microcontrollers. The line idles high
//! through a pull-up; every device may both transmit and receive, and
//! nobody is permanently in charge of the medium.
//!
//! ## Framing
//!
//! Frames are carried as plain asynchronous serial (8N1) at a nominal
//! 1 Mbps, moved by DMA so the CPU only hears about a frame twice: when
//! it starts and when it ends. A frame is a fixed 16 byte header plus
//! up to 236 payload bytes, protected by a CRC-16/CCITT over everything
//! after the CRC field itself (see [packet]).
//!
//! Because two UARTs on a shared wire have no clock in common, a frame
//! is announced out-of-band: the transmitter briefly drives the line
//! low (the "start pulse", about 10 µs), releases it, waits out the
//! inter-lo-data gap, and only then streams the frame bytes. Receivers
//! keep a falling-edge interrupt armed while idle; the edge is the cue
//! to arm a DMA read before the first data byte arrives. The gap is
//! bounded on both sides (40..=240 µs) so a receiver can also tell a
//! stuck-low bus from a slow transmitter.
//!
//! ## Sharing the wire
//!
//! There is no arbitration beyond listening and luck. A device with
//! queued traffic samples the line first: if somebody else is mid-frame
//! it joins them as a receiver and retries later; after every
//! transmission it backs off for a random slice of up to 1 ms before
//! draining the next queued frame. Collisions are therefore unlikely
//! but not impossible, and the layer is explicitly best-effort: frames
//! can be lost to noise, congestion, or full queues, and it is the
//! upper layers' job to care.
//!
//! ## Event model
//!
//! The layer is driven entirely by three event sources, reflected in
//! the three entry points of [Link]:
//!
//! 1. [Link::on_falling_edge], the GPIO edge interrupt, only honored
//!    while listening
//! 2. [Link::on_dma_complete], the transfer engine finishing (or
//!    failing) a read or write
//! 3. [Link::on_tick] / [Link::on_timer], the periodic scheduler tick
//!    and one-shot deadlines derived from it
//!
//! Everything else (validation, queue handling, error recovery) runs
//! inside those calls. There is no executor and no blocking wait except
//! the deliberate 10 µs start pulse. Hardware is consumed through the
//! capability traits in this module ([SerialDma], [BusPin],
//! [TickTimer], plus [rand_core::RngCore] for back-off jitter), so the
//! same state machine runs against real peripherals or against the
//! deterministic wire simulator used by the tests.
//!
//! ## Storage
//!
//! All frame memory comes from a static [pool](pool::PacketStorage) of
//! fixed 256 byte slots, handed around as owning [PacketBox] handles;
//! nothing is allocated after init and dropping a box returns its slot
//! without taking a lock. Received frames and frames queued for
//! transmit sit in bounded rings ([queue::PacketQueue]) with their
//! index updates wrapped in interrupt-masking critical sections;
//! masking is the only mutual exclusion used anywhere, since the layer
//! must run on targets with no OS at all.

#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![warn(missing_docs)]

#[macro_use]
mod macros;

pub mod crc;
pub mod isr;
pub mod line;
mod link;
pub mod packet;
pub mod pool;
pub mod queue;

pub use crate::link::{BusState, Diagnostics, Link, LinkCfg};
pub use crate::packet::{Header, Packet, FRAME_BYTES, HEADER_BYTES, MAX_PAYLOAD};
pub use crate::pool::{PacketBox, PacketStorage, RawPacketSlice};

use rand_core::RngCore;

/// One 8N1 byte on the wire at the 125 kBaud reference rate, in µs.
pub const BYTE_AT_125KBAUD_US: u32 = 80;
/// Maximum permitted gap between two bytes of one frame.
pub const MAX_INTERBYTE_SPACING_US: u32 = 2 * BYTE_AT_125KBAUD_US;
/// Minimum idle-high gap between two successive frames.
pub const MIN_INTERFRAME_SPACING_US: u32 = 2 * BYTE_AT_125KBAUD_US;
/// Quiesce time after an error before the layer listens again.
pub const BUS_NORMALITY_PERIOD_US: u32 = 2 * BYTE_AT_125KBAUD_US;
/// Minimum delay between the start pulse and the first data byte.
pub const MIN_INTERLODATA_SPACING_US: u32 = 40;
/// Maximum delay between the start pulse and the first data byte.
pub const MAX_INTERLODATA_SPACING_US: u32 = 3 * BYTE_AT_125KBAUD_US;
/// Upper bound of the randomized transmit back-off window.
pub const TX_MAX_BACKOFF_US: u32 = 1000;
/// Gap a transmitter leaves between releasing the start pulse and
/// starting the DMA write.
pub const TX_PULSE_TO_DATA_US: u32 = 100;
/// Nominal line rate.
pub const DEFAULT_BAUD: u32 = 1_000_000;
/// Period of the scheduler tick feeding [Link::on_tick].
pub const TICK_PERIOD_US: u32 = 1000;

/// Slot count of the RX and TX rings. One slot stays empty, so ten
/// packets fit in each direction.
pub const QUEUE_SLOTS: usize = 11;

/// Bits of the shared status word.
pub mod status {
    /// A DMA read is in flight.
    pub const RECEIVING: u16 = 0x0001;
    /// A start pulse was sent and a DMA write is pending or in flight.
    pub const TRANSMITTING: u16 = 0x0004;
    /// Between a detected falling edge and the first received byte.
    pub const RX_LO_PULSE: u16 = 0x0008;
    /// Currently strobing our own start pulse.
    pub const TX_LO_PULSE: u16 = 0x0010;
    /// The line was held low past the inter-lo-data bound.
    pub const BUS_LO_ERROR: u16 = 0x0020;
    /// A receive did not finish within its deadline.
    pub const BUS_TIMEOUT_ERROR: u16 = 0x0040;
    /// The engine reported an error, or a frame failed validation.
    pub const BUS_UART_ERROR: u16 = 0x0080;
    /// All error bits.
    pub const ERROR_MASK: u16 = 0x00E0;
    /// Last sampled line level, high when set.
    pub const BUS_STATE: u16 = 0x0100;
    /// A line transition has been observed since start.
    pub const BUS_TOGGLED: u16 = 0x0200;
    /// A drain event is scheduled or running.
    pub const TX_DRAIN_ENABLE: u16 = 0x0400;
    /// The layer has been started.
    pub const RUNNING: u16 = 0x1000;
    /// The periodic tick is being consumed.
    pub const TICK_ENABLED: u16 = 0x2000;
}

/// Codes the layer publishes on its event queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
#[repr(u8)]
pub enum EventCode {
    /// A validated frame was queued for the upstream.
    DataReady = 1,
    /// Any bus error; details are in the status word and diagnostics.
    BusError = 2,
    /// A frame arrived intact but its CRC did not match.
    CrcError = 3,
    /// The transmit queue is being drained.
    Drain = 4,
    /// A receive window expired without a completed frame.
    RxTimeout = 5,
    /// First line activity since start.
    BusConnected = 6,
    /// The bus stopped looking alive.
    BusDisconnected = 7,
}

/// One published event: the emitting component and what happened.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub struct Event {
    /// Component id of the emitting layer instance.
    pub source: u16,
    /// What happened.
    pub code: EventCode,
}

/// Why `send` refused a packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
#[non_exhaustive]
pub enum SendError {
    /// The payload length is zero or past the frame maximum.
    InvalidParameter,
    /// The transmit ring, or the packet pool, is full.
    NoResources,
}

/// Mode of the transfer engine between and during transfers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub enum SerialMode {
    /// Wired up for a DMA read.
    Rx,
    /// Wired up for a DMA write.
    Tx,
    /// Detached from the line; the pin belongs to GPIO.
    Disconnected,
}

/// Completion code of one DMA transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub enum XferStatus {
    /// A read finished and the buffer holds a frame.
    DataReceived,
    /// A write finished and the wire is quiet again.
    DataSent,
    /// The transfer fell over.
    Error,
}

/// Pull applied while the bus pin is an input.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub enum PinPull {
    /// Floating input.
    None,
    /// Weak pull to the idle-high level.
    Up,
}

/// Tags for one-shot deadlines requested from the timer capability.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub enum TimerTag {
    /// Service the transmit queue.
    Drain,
    /// The post-error quiesce period may be over.
    Normality,
}

/// A DMA-driven single-wire UART.
///
/// Both start calls are non-blocking and park the buffer inside the
/// engine; completion is reported to the layer as an [XferStatus],
/// after which the buffer can be reclaimed with
/// [take_buffer](SerialDma::take_buffer).
pub trait SerialDma {
    /// Reconfigure the line rate. Only legal between transfers.
    fn set_baud(&mut self, baud: u32);

    /// Switch the engine between read, write, and detached.
    fn set_mode(&mut self, mode: SerialMode);

    /// Begin a DMA read of up to `max_len` bytes into `buf`.
    fn start_rx(&mut self, buf: PacketBox, max_len: usize);

    /// Begin a DMA write of the first `len` bytes of `buf`.
    fn start_tx(&mut self, buf: PacketBox, len: usize);

    /// Tear down any transfer in flight and detach. Idempotent; hands
    /// back the in-flight buffer if there was one.
    fn abort(&mut self) -> Option<PacketBox>;

    /// Reclaim the buffer of the transfer that just completed.
    fn take_buffer(&mut self) -> Option<PacketBox>;
}

/// The open-drain-capable bus pin.
///
/// Reconfiguring between input and output must never glitch the line
/// low, and sampling via [get_input](BusPin::get_input) must not
/// disturb the edge-event arming.
pub trait BusPin {
    /// Push-pull output at the given level.
    fn set_output(&mut self, high: bool);

    /// Input with the given pull; returns the sampled level,
    /// `true` for high.
    fn get_input(&mut self, pull: PinPull) -> bool;

    /// Arm the falling-edge event.
    fn enable_edge_events(&mut self);

    /// Disarm the falling-edge event.
    fn disable_edge_events(&mut self);
}

/// Microsecond-resolution time source and one-shot scheduler.
pub trait TickTimer {
    /// Monotonic microseconds since some epoch.
    fn now_micros(&self) -> u64;

    /// Request a one-shot [Link::on_timer] callback after `us`.
    ///
    /// A later request with the same tag supersedes the earlier one;
    /// stale callbacks are harmless and ignored by the layer.
    fn schedule_after(&mut self, us: u32, tag: TimerTag);

    /// Spin for `us` microseconds.
    fn busy_wait(&self, us: u32) {
        let end = self.now_micros().saturating_add(us as u64);
        while self.now_micros() < end {}
    }
}

/// Uniform jitter in `[0, bound)`, zero if `bound` is zero.
pub fn random_below<R: RngCore>(rand: &mut R, bound: u32) -> u32 {
    if bound == 0 {
        0
    } else {
        rand.next_u32() % bound
    }
}
