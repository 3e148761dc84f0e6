#![allow(dead_code)]

use draht_phys::{EventCode, Header, Link};
use draht_sim::{SimBus, SimCfg};

/// Two started nodes on one wire.
pub fn two_node_bus() -> (SimBus, usize, usize) {
    let mut bus = SimBus::new();
    let a = bus.add_node(0xA);
    let b = bus.add_node(0xB);
    bus.link(a).start();
    bus.link(b).start();
    (bus, a, b)
}

pub fn header() -> Header {
    Header {
        device_identifier: 0x1122334455667788,
        serial_flags: 0,
        service_number: 1,
        service_command: 0x20,
        service_flags: 0,
    }
}

/// Pop every pending event code off a layer.
pub fn events_of(link: &mut Link<SimCfg>) -> Vec<EventCode> {
    let mut out = Vec::new();
    while let Some(ev) = link.poll_event() {
        out.push(ev.code);
    }
    out
}
