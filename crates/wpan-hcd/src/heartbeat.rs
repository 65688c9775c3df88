//! Periodic per-port servicing driven by the transport.

use crate::controller::{Controller, PortHandle};
use crate::port::Port;
use crate::usb::Direction;

impl Controller {
    /// One heartbeat tick for `port`.
    ///
    /// Releases isochronous OUT URBs covered by accrued credit, completes isochronous IN URBs from
    /// buffered data and resends control requests that went unanswered for too long. Returns true
    /// while the port still needs heartbeats (isochronous endpoints exist or control requests are
    /// outstanding).
    pub fn heartbeat(&self, port: PortHandle) -> bool {
        let Some(ix) = self.port_index(port) else {
            return false;
        };
        let now_ns = self.clock.now_ns();
        let rounding_ns =
            u64::try_from(self.config.isoc_in_credit_rounding.as_nanos()).unwrap_or(u64::MAX);

        let (peer, released) = {
            let mut state = self.lock_state();
            let port_state = &mut state.ports[ix];
            let mut released = Vec::new();
            for number in port_state.isoc_out.clone() {
                if let Some(ep) = port_state.endpoint_mut(number, Direction::Out) {
                    ep.release_out_isoc(now_ns, &mut released);
                }
            }
            (port_state.peer, released)
        };
        for mut link in released {
            let urb = link.urb.take();
            let endpoint = link.endpoint;
            self.pool.release(link);
            let Some(urb) = urb else {
                continue;
            };
            {
                let mut inner = urb.lock();
                inner.error_count = 0;
                inner.start_frame = self.get_frame_number();
            }
            if let Some(peer) = peer {
                self.transport.send_isochronous(peer, endpoint, &urb);
            }
            self.complete_urb(&urb, Ok(()));
        }

        let (mut busy, filled) = {
            let mut state = self.lock_state();
            let port_state = &mut state.ports[ix];
            let mut filled = Vec::new();
            for number in port_state.isoc_in.clone() {
                if let Some(ep) = port_state.endpoint_mut(number, Direction::In) {
                    ep.service_in_isoc(now_ns, rounding_ns, &mut filled);
                }
            }
            (has_isoc(port_state), filled)
        };
        self.complete_links(filled, Ok(()));

        let threshold = self.config.ep0_resend_ticks();
        let expired = {
            let mut state = self.lock_state();
            match state.ports[ix].endpoint_mut(0, Direction::Out) {
                Some(ep0) => {
                    let expired = ep0.take_timed_out(threshold);
                    busy |= !ep0.urbs.is_empty();
                    expired
                }
                None => Vec::new(),
            }
        };
        for mut link in expired {
            let urb = link.urb.take();
            let req_id = link.req_id;
            self.pool.release(link);
            if let Some(urb) = urb {
                tracing::debug!(urb = urb.id(), port = ix, req_id, "resending control request");
                self.process_ep0_urb(&urb);
            }
        }
        busy
    }

    /// The transport reports that the control request `req_id` went on air, arming its resend
    /// counter.
    pub fn mark_urb_submitted(&self, port: PortHandle, endpoint: u8, req_id: u8) {
        let Some(ix) = self.port_index(port) else {
            return;
        };
        let mut state = self.lock_state();
        let Some(ep) = state.ports[ix].endpoint_mut(endpoint, Direction::Out) else {
            return;
        };
        match ep.urbs.iter_mut().find(|link| link.req_id == req_id) {
            Some(link) => link.submit_counter = 1,
            None => tracing::trace!(port = ix, endpoint, req_id, "submitted request not queued"),
        };
    }
}

fn has_isoc(port: &Port) -> bool {
    !port.isoc_out.is_empty() || !port.isoc_in.is_empty()
}
