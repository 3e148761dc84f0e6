//! Process-wide interrupt dispatch.
//!
//! Raw interrupt handlers have nowhere to keep a reference, so the
//! layer is looked up through one process-wide slot: [install] it on
//! bring-up, [teardown] on shutdown, and point the GPIO, DMA, and
//! timer vectors at the free functions below. The slot holds a
//! relation to the layer, never ownership; the application keeps the
//! `'static` instance alive.
//!
//! Tests substitute a fake layer by installing one.

use core::cell::RefCell;

use critical_section::Mutex;

use crate::link::{Link, LinkCfg};
use crate::{TimerTag, XferStatus};

/// The interrupt-context entry points of a layer instance.
pub trait LinkIsr: Send {
    /// Falling edge seen on the bus pin.
    fn falling_edge(&mut self);
    /// Completion callback from the transfer engine.
    fn dma_complete(&mut self, code: XferStatus);
    /// A one-shot deadline expired.
    fn timer(&mut self, tag: TimerTag);
    /// Periodic scheduler tick.
    fn tick(&mut self);
}

impl<Cfg: LinkCfg> LinkIsr for Link<Cfg>
where
    Link<Cfg>: Send,
{
    fn falling_edge(&mut self) {
        self.on_falling_edge();
    }
    fn dma_complete(&mut self, code: XferStatus) {
        self.on_dma_complete(code);
    }
    fn timer(&mut self, tag: TimerTag) {
        self.on_timer(tag);
    }
    fn tick(&mut self) {
        self.on_tick();
    }
}

static SLOT: Mutex<RefCell<Option<&'static mut dyn LinkIsr>>> = Mutex::new(RefCell::new(None));

/// Point the interrupt trampolines at a layer instance.
pub fn install(layer: &'static mut dyn LinkIsr) {
    critical_section::with(|cs| {
        *SLOT.borrow_ref_mut(cs) = Some(layer);
    });
}

/// Detach the installed layer and hand it back.
pub fn teardown() -> Option<&'static mut dyn LinkIsr> {
    critical_section::with(|cs| SLOT.borrow_ref_mut(cs).take())
}

/// GPIO falling-edge vector.
pub fn falling_edge() {
    critical_section::with(|cs| {
        if let Some(layer) = SLOT.borrow_ref_mut(cs).as_mut() {
            layer.falling_edge();
        }
    });
}

/// DMA completion vector.
pub fn dma_complete(code: XferStatus) {
    critical_section::with(|cs| {
        if let Some(layer) = SLOT.borrow_ref_mut(cs).as_mut() {
            layer.dma_complete(code);
        }
    });
}

/// One-shot timer vector.
pub fn timer(tag: TimerTag) {
    critical_section::with(|cs| {
        if let Some(layer) = SLOT.borrow_ref_mut(cs).as_mut() {
            layer.timer(tag);
        }
    });
}

/// Periodic tick vector.
pub fn tick() {
    critical_section::with(|cs| {
        if let Some(layer) = SLOT.borrow_ref_mut(cs).as_mut() {
            layer.tick();
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicU32, Ordering};

    static EDGES: AtomicU32 = AtomicU32::new(0);
    static COMPLETIONS: AtomicU32 = AtomicU32::new(0);
    static TIMERS: AtomicU32 = AtomicU32::new(0);
    static TICKS: AtomicU32 = AtomicU32::new(0);

    struct FakeLayer;

    impl LinkIsr for FakeLayer {
        fn falling_edge(&mut self) {
            EDGES.fetch_add(1, Ordering::Relaxed);
        }
        fn dma_complete(&mut self, _code: XferStatus) {
            COMPLETIONS.fetch_add(1, Ordering::Relaxed);
        }
        fn timer(&mut self, _tag: TimerTag) {
            TIMERS.fetch_add(1, Ordering::Relaxed);
        }
        fn tick(&mut self) {
            TICKS.fetch_add(1, Ordering::Relaxed);
        }
    }

    // one test owns the whole slot lifecycle, since it is process-wide
    #[test]
    fn install_dispatch_teardown() {
        // empty slot: dispatch is a no-op
        falling_edge();
        tick();
        assert_eq!(EDGES.load(Ordering::Relaxed), 0);

        install(Box::leak(Box::new(FakeLayer)));

        falling_edge();
        falling_edge();
        dma_complete(XferStatus::DataSent);
        timer(TimerTag::Drain);
        tick();

        assert!(teardown().is_some());
        // dispatch after teardown goes nowhere
        falling_edge();
        assert!(teardown().is_none());

        assert_eq!(EDGES.load(Ordering::Relaxed), 2);
        assert_eq!(COMPLETIONS.load(Ordering::Relaxed), 1);
        assert_eq!(TIMERS.load(Ordering::Relaxed), 1);
        assert_eq!(TICKS.load(Ordering::Relaxed), 1);
    }
}
