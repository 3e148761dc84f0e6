//! Open-drain line controller.
//!
//! Owns the bus pin: its direction, pull-up, and edge-event arming.
//! The line idles high through the pull-up; attention pulses are the
//! only time the pin is actively driven.

use crate::{BusPin, PinPull, TickTimer};

/// Length of the start pulse a transmitter strobes before its frame.
pub const START_PULSE_US: u32 = 10;

/// The bus pin and its current event configuration.
pub struct LineController<P: BusPin> {
    pin: P,
    events_on: bool,
}

impl<P: BusPin> LineController<P> {
    /// Wrap a pin, leaving the line released and events off.
    pub fn new(mut pin: P) -> Self {
        pin.disable_edge_events();
        pin.get_input(PinPull::Up);
        Self {
            pin,
            events_on: false,
        }
    }

    /// Input with pull-up, falling-edge events armed.
    pub fn listen(&mut self) {
        self.pin.get_input(PinPull::Up);
        self.pin.enable_edge_events();
        self.events_on = true;
    }

    /// Keep listening on the line but stop reporting edges.
    pub fn ignore_edges(&mut self) {
        self.pin.disable_edge_events();
        self.events_on = false;
    }

    /// Input without any pull, events off. Used while a remote
    /// transmitter owns the line, so our pull-up does not fight it.
    pub fn float_input(&mut self) {
        self.pin.disable_edge_events();
        self.pin.get_input(PinPull::None);
        self.events_on = false;
    }

    /// Input with pull-up, no events. The idle configuration.
    pub fn release(&mut self) {
        self.pin.disable_edge_events();
        self.pin.get_input(PinPull::Up);
        self.events_on = false;
    }

    /// Sample the line. `true` is idle-high.
    pub fn read_level(&mut self) -> bool {
        self.pin.get_input(PinPull::Up)
    }

    /// Are edge events currently armed?
    pub fn events_armed(&self) -> bool {
        self.events_on
    }

    /// Hold the line low for `us`, then let the pull-up float it high
    /// again. Blocks for the requested time; the line is released on
    /// return.
    pub fn drive_low_for<T: TickTimer>(&mut self, timer: &T, us: u32) {
        self.pin.set_output(false);
        timer.busy_wait(us);
        self.pin.get_input(PinPull::Up);
    }
}
