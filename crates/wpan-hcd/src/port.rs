//! Virtual root hub ports.
//!
//! Port state is split across two locks: the structural part ([`Port`], endpoint tables and the
//! peer handle) lives under the controller lock, while the hub-visible status word and presence
//! flags ([`PortStatus`]) have a lock of their own so hub requests never contend with URB traffic.

use bitflags::bitflags;

use crate::endpoint::Endpoint;
use crate::transport::PeerId;
use crate::usb::{Direction, NUM_ENDPOINTS};

pub const USB_PORT_STAT_CONNECTION: u32 = 0x0001;
pub const USB_PORT_STAT_ENABLE: u32 = 0x0002;
pub const USB_PORT_STAT_SUSPEND: u32 = 0x0004;
pub const USB_PORT_STAT_OVERCURRENT: u32 = 0x0008;
pub const USB_PORT_STAT_RESET: u32 = 0x0010;
pub const USB_PORT_STAT_POWER: u32 = 0x0100;
pub const USB_PORT_STAT_LOW_SPEED: u32 = 0x0200;
pub const USB_PORT_STAT_HIGH_SPEED: u32 = 0x0400;

// Change bits live in the upper half of the status word (`<< 16`).
pub const USB_PORT_STAT_C_CONNECTION: u32 = 0x0001;
pub const USB_PORT_STAT_C_ENABLE: u32 = 0x0002;
pub const USB_PORT_STAT_C_SUSPEND: u32 = 0x0004;
pub const USB_PORT_STAT_C_OVERCURRENT: u32 = 0x0008;
pub const USB_PORT_STAT_C_RESET: u32 = 0x0010;

/// Bus address of a port with no peer attached.
pub(crate) const UNASSIGNED_BUS_ADDR: u8 = 0xff;

bitflags! {
    #[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct PortFlags: u8 {
        const PRESENT = 1 << 0;
        const CHANGED = 1 << 1;
        const DYING = 1 << 2;
    }
}

/// Port lifecycle as seen from the hub.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PortPhase {
    Absent,
    Present,
    Addressed,
    Configured,
    Dying,
}

#[derive(Debug, Default)]
pub(crate) struct PortStatus {
    pub(crate) flags: PortFlags,
    /// Hub `wPortStatus` in the low half, `wPortChange` in the high half.
    pub(crate) status: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct InterfaceState {
    /// Bit `n` set for OUT endpoint `n`, bit `n + 16` for IN endpoint `n`.
    pub(crate) ep_mask: u32,
    pub(crate) alt: u8,
}

/// Peer confirmation that arrived while its request was still being handed to the transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum EarlyConfirm {
    Control {
        rcode: u8,
        data: Vec<u8>,
    },
    Descriptor {
        status: u8,
        data: Vec<u8>,
        offset: usize,
        total: usize,
    },
}

#[derive(Debug)]
pub(crate) struct Port {
    pub(crate) peer: Option<PeerId>,
    pub(crate) bus_addr: u8,
    pub(crate) next_req_id: u8,
    pub(crate) config_num: u8,
    pub(crate) interfaces: Vec<InterfaceState>,
    pub(crate) out_ep: [Option<Endpoint>; NUM_ENDPOINTS],
    pub(crate) in_ep: [Option<Endpoint>; NUM_ENDPOINTS],
    /// Endpoint numbers of the isochronous endpoints, visited by the heartbeat.
    pub(crate) isoc_out: Vec<u8>,
    pub(crate) isoc_in: Vec<u8>,
    /// Request ids currently inside `PeerTransport::send_*`.
    pub(crate) sending: Vec<u8>,
    pub(crate) early_confirms: Vec<(u8, EarlyConfirm)>,
}

impl Port {
    pub(crate) fn new() -> Self {
        Self {
            peer: None,
            bus_addr: UNASSIGNED_BUS_ADDR,
            next_req_id: 0,
            config_num: 0,
            interfaces: Vec::new(),
            out_ep: Default::default(),
            in_ep: Default::default(),
            isoc_out: Vec::new(),
            isoc_in: Vec::new(),
            sending: Vec::new(),
            early_confirms: Vec::new(),
        }
    }

    pub(crate) fn alloc_req_id(&mut self) -> u8 {
        let id = self.next_req_id;
        self.next_req_id = self.next_req_id.wrapping_add(1);
        id
    }

    /// Endpoint 0 is bidirectional and always lives in the OUT table.
    pub(crate) fn endpoint_mut(
        &mut self,
        number: u8,
        direction: Direction,
    ) -> Option<&mut Endpoint> {
        let slot = usize::from(number);
        match direction {
            Direction::In if number != 0 => self.in_ep.get_mut(slot)?.as_mut(),
            _ => self.out_ep.get_mut(slot)?.as_mut(),
        }
    }

    /// Installs `ep` for interface `if_ix`, returning whatever endpoint occupied the slot before.
    pub(crate) fn install_endpoint(&mut self, if_ix: usize, ep: Endpoint) -> Option<Endpoint> {
        let number = ep.number;
        let slot = usize::from(number);
        let (bit, isoc_list, table) = match ep.direction {
            Direction::In => (slot + NUM_ENDPOINTS, &mut self.isoc_in, &mut self.in_ep),
            Direction::Out => (slot, &mut self.isoc_out, &mut self.out_ep),
        };
        isoc_list.retain(|&n| n != number);
        if ep.is_isochronous() {
            isoc_list.push(number);
        }
        let previous = table[slot].replace(ep);
        if let Some(iface) = self.interfaces.get_mut(if_ix) {
            iface.ep_mask |= 1 << bit;
        }
        previous
    }

    /// Detaches the endpoint in the given slot and drops it from the isochronous lists.
    pub(crate) fn remove_endpoint(&mut self, number: u8, direction: Direction) -> Option<Endpoint> {
        let slot = usize::from(number);
        let (isoc_list, table) = match direction {
            Direction::In => (&mut self.isoc_in, &mut self.in_ep),
            Direction::Out => (&mut self.isoc_out, &mut self.out_ep),
        };
        let ep = table.get_mut(slot)?.take()?;
        isoc_list.retain(|&n| n != number);
        Some(ep)
    }

    pub(crate) fn take_early_confirm(&mut self, req_id: u8) -> Option<EarlyConfirm> {
        let pos = self.early_confirms.iter().position(|(id, _)| *id == req_id)?;
        Some(self.early_confirms.swap_remove(pos).1)
    }

    pub(crate) fn phase(&self, flags: PortFlags) -> PortPhase {
        if flags.contains(PortFlags::DYING) {
            PortPhase::Dying
        } else if !flags.contains(PortFlags::PRESENT) {
            PortPhase::Absent
        } else if self.config_num != 0 {
            PortPhase::Configured
        } else if self.bus_addr != 0 && self.bus_addr != UNASSIGNED_BUS_ADDR {
            PortPhase::Addressed
        } else {
            PortPhase::Present
        }
    }
}
