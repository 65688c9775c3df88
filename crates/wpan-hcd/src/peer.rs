//! Peer lifecycle and inbound data from the transport.

use crate::controller::{Controller, PortHandle, RunState};
use crate::endpoint::Endpoint;
use crate::error::HcdError;
use crate::port::{
    PortFlags, UNASSIGNED_BUS_ADDR, USB_PORT_STAT_CONNECTION, USB_PORT_STAT_C_CONNECTION,
    USB_PORT_STAT_C_RESET, USB_PORT_STAT_ENABLE, USB_PORT_STAT_RESET,
};
use crate::transport::PeerId;
use crate::usb::{Direction, TransferType, USB_ENDPOINT_NUMBER_MASK};

impl Controller {
    /// Binds a newly arrived peer to a free port and makes that port the connection port.
    ///
    /// Ports are handed out round robin starting after the previously assigned one. Returns `None`
    /// when every port is taken or another peer is still being enumerated.
    pub fn peer_attached(&self, peer: PeerId) -> Option<PortHandle> {
        let (port, suspended) = {
            let mut state = self.lock_state();
            if let Some(conn) = state.conn_port {
                tracing::debug!(?peer, conn, "peer refused: enumeration in progress");
                return None;
            }
            let count = state.ports.len();
            let port = (1..=count)
                .map(|step| (state.last_arrival + step) % count)
                .find(|&ix| !self.port_flags(ix).contains(PortFlags::PRESENT));
            let Some(ix) = port else {
                tracing::warn!(?peer, "peer refused: no free port");
                return None;
            };

            {
                let mut status = self.lock_port_status(ix);
                status.flags |= PortFlags::PRESENT | PortFlags::CHANGED;
                status.status |= USB_PORT_STAT_CONNECTION | (USB_PORT_STAT_C_CONNECTION << 16);
            }
            let port_state = &mut state.ports[ix];
            port_state.peer = Some(peer);
            port_state.bus_addr = 0;
            port_state.config_num = 0;
            port_state.interfaces.clear();
            port_state.isoc_out.clear();
            port_state.isoc_in.clear();
            port_state.out_ep[0] = Some(Endpoint::control(ix));
            state.conn_port = Some(ix);
            state.last_arrival = ix;
            (ix, state.run_state == RunState::Suspended)
        };

        tracing::debug!(?peer, port, "peer attached");
        if suspended {
            self.bus.resume_root_hub();
        }
        self.bus.poll_root_hub_status();
        Some(PortHandle(port))
    }

    /// Detaches the peer behind `port`.
    ///
    /// Every URB still queued for the port, or orphaned from it earlier, completes with `NoDevice`.
    pub fn peer_departed(&self, port: PortHandle) {
        let Some(ix) = self.port_index(port) else {
            return;
        };
        {
            let mut state = self.lock_state();
            if state.conn_port == Some(ix) {
                state.conn_port = None;
            }
            self.lock_port_status(ix).flags |= PortFlags::DYING;
        }

        self.clean_endpoints_for_config(ix);

        let (peer, orphans) = {
            let mut state = self.lock_state();
            let state = &mut *state;
            let port_state = &mut state.ports[ix];
            let peer = port_state.peer.take();
            port_state.bus_addr = UNASSIGNED_BUS_ADDR;
            port_state.config_num = 0;
            port_state.sending.clear();
            port_state.early_confirms.clear();
            {
                let mut status = self.lock_port_status(ix);
                status.flags.remove(PortFlags::PRESENT | PortFlags::DYING);
                status.flags |= PortFlags::CHANGED;
                status.status &= !(USB_PORT_STAT_CONNECTION | USB_PORT_STAT_ENABLE);
                status.status |= USB_PORT_STAT_C_CONNECTION << 16;
            }
            if let Some(ep0) = port_state.remove_endpoint(0, Direction::Out) {
                self.retire_endpoint(&mut state.orphanage, ep0);
            }
            (peer, state.orphanage.take_where(|link| link.port == ix))
        };

        tracing::debug!(?peer, port = ix, orphans = orphans.len(), "peer departed");
        self.complete_links(orphans, Err(HcdError::NoDevice));
        self.bus.poll_root_hub_status();
    }

    /// The peer reset itself: drop the active configuration and report a port reset to the hub.
    pub fn peer_reset(&self, peer: PeerId, port: PortHandle) {
        let Some(ix) = self.port_index(port) else {
            return;
        };
        {
            let mut status = self.lock_port_status(ix);
            status.flags |= PortFlags::CHANGED;
            status.status |= USB_PORT_STAT_RESET | (USB_PORT_STAT_C_RESET << 16);
        }
        tracing::debug!(?peer, port = ix, "peer reset");
        self.clean_endpoints_for_config(ix);
        self.bus.poll_root_hub_status();
    }

    /// Inbound data for IN endpoint `endpoint` of `port`.
    ///
    /// Interrupt and bulk data completes the oldest waiting URB directly, truncated to its buffer;
    /// with no URB waiting it is buffered (interrupt) or dropped (bulk). Isochronous data is always
    /// buffered and paced out by the heartbeat.
    pub fn data_indication(&self, port: PortHandle, endpoint: u8, data: &[u8]) {
        let Some(ix) = self.port_index(port) else {
            return;
        };
        let number = endpoint & USB_ENDPOINT_NUMBER_MASK;
        let waiting = {
            let mut state = self.lock_state();
            let Some(ep) = state.ports[ix].in_ep[usize::from(number)].as_mut() else {
                tracing::trace!(port = ix, endpoint, "data for unknown endpoint");
                return;
            };
            match ep.transfer_type {
                TransferType::Interrupt | TransferType::Bulk => match ep.urbs.pop_front() {
                    Some(link) => Some(link),
                    None => {
                        ep.buffer_data(data);
                        None
                    }
                },
                TransferType::Isochronous => {
                    ep.buffer_isoc_in(data);
                    None
                }
                TransferType::Control => None,
            }
        };

        let Some(mut link) = waiting else {
            return;
        };
        let urb = link.urb.take();
        self.pool.release(link);
        if let Some(urb) = urb {
            urb.lock().fill_from(data);
            self.complete_urb(&urb, Ok(()));
        }
    }
}
