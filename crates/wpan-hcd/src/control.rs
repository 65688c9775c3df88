//! Endpoint 0: standard request interception, forwarding to the peer and confirmation handling.

use crate::controller::{Controller, PortHandle};
use crate::dispatch::Enqueue;
use crate::endpoint::Endpoint;
use crate::error::{HcdError, HcdResult, UrbStatus};
use crate::pool::LinkQueue;
use crate::port::{EarlyConfirm, InterfaceState, PortFlags};
use crate::transport::{PeerId, PeerTransport};
use crate::urb::UrbHandle;
use crate::usb::{
    ConfigDescriptor, Direction, InterfaceAltSetting, TransferType, UsbDeviceTree, NUM_ENDPOINTS,
    USB_REQUEST_GET_CONFIGURATION, USB_REQUEST_GET_DESCRIPTOR, USB_REQUEST_GET_INTERFACE,
    USB_REQUEST_SET_ADDRESS, USB_REQUEST_SET_CONFIGURATION, USB_REQUEST_SET_INTERFACE,
};

impl Controller {
    /// Handles one control URB: answers it from cached state when possible, otherwise forwards it
    /// to the peer and parks it on endpoint 0 until the confirmation arrives.
    pub(crate) fn process_ep0_urb(&self, urb: &UrbHandle) {
        let Some(setup) = urb.setup() else {
            self.complete_urb(urb, Err(HcdError::InvalidRequest));
            return;
        };

        let mut state = self.lock_state();
        let Some(port) = state.port_from_addr(urb.pipe().device_address) else {
            drop(state);
            self.complete_urb(urb, Err(HcdError::BrokenPipe));
            return;
        };
        let flags = self.port_flags(port);
        if !flags.contains(PortFlags::PRESENT) || flags.contains(PortFlags::DYING) {
            drop(state);
            tracing::trace!(urb = urb.id(), port, "refusing control URB");
            self.complete_urb(urb, Err(HcdError::BrokenPipe));
            return;
        }
        urb.set_port_slot(port);

        let Some(peer) = state.ports[port].peer else {
            drop(state);
            self.complete_urb(urb, Err(HcdError::BrokenPipe));
            return;
        };
        let req_id = state.ports[port].alloc_req_id();

        let mut local: Option<UrbStatus> = None;
        if setup.is_standard() {
            match setup.request {
                USB_REQUEST_SET_ADDRESS => {
                    if let Some(conn) = state.conn_port.take() {
                        let addr = (setup.value & 0xff) as u8;
                        state.ports[conn].bus_addr = addr;
                        tracing::debug!(port = conn, addr, "port addressed");
                    }
                    local = Some(Ok(()));
                }
                USB_REQUEST_GET_CONFIGURATION => {
                    local = Some(reply_byte(urb, state.ports[port].config_num));
                }
                USB_REQUEST_GET_INTERFACE => {
                    let alt = state.ports[port]
                        .interfaces
                        .get(usize::from(setup.index & 0xff))
                        .map(|iface| iface.alt);
                    local = Some(match alt {
                        Some(alt) => reply_byte(urb, alt),
                        None => Err(HcdError::BrokenPipe),
                    });
                }
                _ => {}
            }
        }
        drop(state);

        if let Some(status) = local {
            self.complete_urb(urb, status);
            return;
        }

        if setup.is_standard()
            && setup.is_device_to_host()
            && setup.request == USB_REQUEST_GET_DESCRIPTOR
        {
            tracing::trace!(
                urb = urb.id(),
                port,
                req_id,
                value = setup.value,
                "requesting descriptor"
            );
            self.send_then_queue_ep0(port, peer, urb, req_id, |transport| {
                transport.send_get_descriptor(
                    peer,
                    req_id,
                    setup.request_type,
                    (setup.value >> 8) as u8,
                    (setup.value & 0xff) as u8,
                    setup.index,
                    0,
                    setup.length,
                )
            });
            return;
        }

        let data = if setup.is_device_to_host() {
            Vec::new()
        } else {
            let mut inner = urb.lock();
            let len = usize::from(setup.length).min(inner.buffer.len());
            inner.actual_length = len;
            inner.buffer[..len].to_vec()
        };
        tracing::trace!(
            urb = urb.id(),
            port,
            req_id,
            request = setup.request,
            "forwarding control request"
        );
        self.send_then_queue_ep0(port, peer, urb, req_id, |transport| {
            transport.send_control_request(peer, req_id, setup, &data)
        });
    }

    /// Sends a request for `urb` and then parks the URB on endpoint 0 under `req_id`.
    ///
    /// The send happens before queueing so the URB cannot be cancelled while the transport still
    /// reads its buffer. A confirmation that arrives while the send is in progress is stashed on
    /// the port and applied here.
    pub(crate) fn send_then_queue_ep0(
        &self,
        port: usize,
        peer: PeerId,
        urb: &UrbHandle,
        req_id: u8,
        send: impl FnOnce(&dyn PeerTransport) -> HcdResult<()>,
    ) {
        self.lock_state().ports[port].sending.push(req_id);
        let sent = send(self.transport.as_ref());

        let mut state = self.lock_state();
        let port_state = &mut state.ports[port];
        if let Some(pos) = port_state.sending.iter().position(|&id| id == req_id) {
            port_state.sending.swap_remove(pos);
        }
        let early = port_state.take_early_confirm(req_id);
        let same_peer = port_state.peer == Some(peer);
        let flags = self.port_flags(port);
        if !same_peer || !flags.contains(PortFlags::PRESENT) || flags.contains(PortFlags::DYING) {
            drop(state);
            tracing::debug!(port, req_id, ?peer, "peer left while request was being sent");
            self.complete_urb(urb, Err(HcdError::NoDevice));
            return;
        }

        if let Err(err) = sent {
            drop(state);
            tracing::warn!(port, req_id, %err, "control request send failed");
            self.complete_urb(urb, Err(HcdError::OutOfMemory));
            return;
        }
        if let Some(confirm) = early {
            drop(state);
            tracing::trace!(port, req_id, "confirmation arrived during send");
            self.apply_confirm(port, urb, req_id, confirm);
            return;
        }

        let outcome = self.enqueue_locked(&mut state, port, 0, Direction::Out, urb, req_id);
        drop(state);
        match outcome {
            Ok(Enqueue::Queued) => self.transport.request_heartbeat(peer),
            Ok(Enqueue::Complete(status)) => self.complete_urb(urb, status),
            Err(err) => self.complete_urb(urb, Err(err)),
        }
    }

    /// Detaches the endpoint 0 URB waiting for `req_id`. If the request is still inside the
    /// transport the confirmation is stashed instead.
    fn take_ep0_urb(
        &self,
        port: usize,
        req_id: u8,
        stash: impl FnOnce() -> EarlyConfirm,
    ) -> Option<UrbHandle> {
        let mut state = self.lock_state();
        let port_state = &mut state.ports[port];
        let link = port_state
            .endpoint_mut(0, Direction::Out)
            .and_then(|ep0| ep0.urbs.remove_where(|link| link.req_id == req_id));
        match link {
            Some(mut link) => {
                let urb = link.urb.take();
                drop(state);
                self.pool.release(link);
                urb
            }
            None if port_state.sending.contains(&req_id) => {
                port_state.early_confirms.push((req_id, stash()));
                None
            }
            None => {
                tracing::warn!(port, req_id, "confirmation for unknown request");
                None
            }
        }
    }

    /// Confirmation of a forwarded control request.
    ///
    /// A non-zero `rcode` means the peer stalled the request.
    pub fn control_confirm(&self, port: PortHandle, req_id: u8, rcode: u8, data: &[u8]) {
        let Some(port) = self.port_index(port) else {
            return;
        };
        let found = self.take_ep0_urb(port, req_id, || EarlyConfirm::Control {
            rcode,
            data: data.to_vec(),
        });
        if let Some(urb) = found {
            self.finish_control(port, &urb, rcode, data);
        }
    }

    /// Confirmation of a GET_DESCRIPTOR request, possibly one chunk of a larger descriptor.
    ///
    /// `data` lands at `offset` in the URB buffer. While less than `min(wLength, total)` bytes have
    /// arrived the remainder is requested again under the same request id.
    pub fn get_descriptor_confirm(
        &self,
        port: PortHandle,
        req_id: u8,
        status: u8,
        data: &[u8],
        offset: usize,
        total: usize,
    ) {
        let Some(port) = self.port_index(port) else {
            return;
        };
        let found = self.take_ep0_urb(port, req_id, || EarlyConfirm::Descriptor {
            status,
            data: data.to_vec(),
            offset,
            total,
        });
        if let Some(urb) = found {
            self.finish_descriptor(port, &urb, req_id, status, data, offset, total);
        }
    }

    fn apply_confirm(&self, port: usize, urb: &UrbHandle, req_id: u8, confirm: EarlyConfirm) {
        match confirm {
            EarlyConfirm::Control { rcode, data } => self.finish_control(port, urb, rcode, &data),
            EarlyConfirm::Descriptor {
                status,
                data,
                offset,
                total,
            } => self.finish_descriptor(port, urb, req_id, status, &data, offset, total),
        }
    }

    fn finish_control(&self, port: usize, urb: &UrbHandle, rcode: u8, data: &[u8]) {
        let Some(setup) = urb.setup() else {
            self.complete_urb(urb, Err(HcdError::InvalidRequest));
            return;
        };
        if rcode != 0 {
            tracing::debug!(port, rcode, request = setup.request, "peer rejected request");
            self.complete_urb(urb, Err(HcdError::BrokenPipe));
            return;
        }

        let status = if setup.is_standard() && setup.request == USB_REQUEST_SET_CONFIGURATION {
            self.complete_set_config(port, urb.device(), (setup.value & 0xff) as u8)
        } else if setup.is_standard() && setup.request == USB_REQUEST_SET_INTERFACE {
            self.complete_set_interface(
                port,
                urb.device(),
                (setup.index & 0xff) as u8,
                (setup.value & 0xff) as u8,
            )
        } else {
            if !data.is_empty() {
                urb.lock().fill_from(data);
            }
            Ok(())
        };
        self.complete_urb(urb, status);
    }

    #[allow(clippy::too_many_arguments)]
    fn finish_descriptor(
        &self,
        port: usize,
        urb: &UrbHandle,
        req_id: u8,
        status: u8,
        data: &[u8],
        offset: usize,
        total: usize,
    ) {
        if status != 0 {
            tracing::debug!(port, req_id, status, "descriptor request failed");
            self.complete_urb(urb, Err(HcdError::BrokenPipe));
            return;
        }

        let (required, received) = {
            let mut inner = urb.lock();
            let required = inner.transfer_buffer_length.min(inner.buffer.len()).min(total);
            let copy_len = required.saturating_sub(offset).min(data.len());
            if copy_len > 0 {
                inner.buffer[offset..offset + copy_len].copy_from_slice(&data[..copy_len]);
            }
            let received = offset.min(required) + copy_len;
            inner.actual_length = received;
            (required, received)
        };

        // A peer that stops making progress gets whatever has arrived so far.
        let progressed = received > offset;
        if received < required && progressed {
            let Some(setup) = urb.setup() else {
                self.complete_urb(urb, Err(HcdError::InvalidRequest));
                return;
            };
            let peer = self.lock_state().ports[port].peer;
            let Some(peer) = peer else {
                self.complete_urb(urb, Err(HcdError::NoDevice));
                return;
            };
            let next = u16::try_from(received).unwrap_or(u16::MAX);
            let remaining = u16::try_from(required - received).unwrap_or(u16::MAX);
            tracing::trace!(
                port,
                req_id,
                offset = next,
                remaining,
                "requesting descriptor remainder"
            );
            self.send_then_queue_ep0(port, peer, urb, req_id, |transport| {
                transport.send_get_descriptor(
                    peer,
                    req_id,
                    setup.request_type,
                    (setup.value >> 8) as u8,
                    (setup.value & 0xff) as u8,
                    setup.index,
                    next,
                    remaining,
                )
            });
            return;
        }
        self.complete_urb(urb, Ok(()));
    }

    /// Rebuilds the endpoint set after the peer accepted SET_CONFIGURATION.
    fn complete_set_config(
        &self,
        port: usize,
        device: &UsbDeviceTree,
        config_value: u8,
    ) -> UrbStatus {
        self.clean_endpoints_for_config(port);
        self.lock_state().ports[port].config_num = 0;
        if config_value == 0 {
            tracing::debug!(port, "port unconfigured");
            return Ok(());
        }
        let Some(config) = device.config(config_value) else {
            tracing::warn!(port, config_value, "unknown configuration");
            return Err(HcdError::OutOfMemory);
        };
        self.lock_state().ports[port].config_num = config_value;
        match self.build_endpoints_for_config(port, config) {
            Ok(()) => {
                tracing::debug!(port, config_value, "port configured");
                Ok(())
            }
            Err(err) => {
                self.lock_state().ports[port].config_num = 0;
                tracing::warn!(port, config_value, %err, "configuration build failed");
                Err(HcdError::OutOfMemory)
            }
        }
    }

    /// Swaps one interface's endpoints after the peer accepted SET_INTERFACE.
    fn complete_set_interface(
        &self,
        port: usize,
        device: &UsbDeviceTree,
        interface: u8,
        alt: u8,
    ) -> UrbStatus {
        let config_num = self.lock_state().ports[port].config_num;
        if config_num == 0 {
            return Err(HcdError::OutOfMemory);
        }
        self.clean_endpoints_for_interface(port, usize::from(interface));
        let setting = device
            .config(config_num)
            .and_then(|config| config.interface(interface))
            .and_then(|cache| cache.alt_setting(alt));
        if let Err(err) = self.build_endpoints_for_interface(port, setting) {
            tracing::warn!(port, interface, alt, %err, "interface build failed");
            return Err(HcdError::OutOfMemory);
        }
        if let Some(iface) = self.lock_state().ports[port]
            .interfaces
            .get_mut(usize::from(interface))
        {
            iface.alt = alt;
        }
        tracing::debug!(port, interface, alt, "alternate setting selected");
        Ok(())
    }

    /// Builds every interface of `config` at alternate setting 0. On failure everything built so
    /// far is torn down again and the port is left with no interfaces.
    fn build_endpoints_for_config(&self, port: usize, config: &ConfigDescriptor) -> HcdResult<()> {
        self.lock_state().ports[port].interfaces =
            vec![InterfaceState::default(); config.num_interfaces()];
        for cache in &config.interfaces {
            if let Err(err) = self.build_endpoints_for_interface(port, cache.alt_settings.first()) {
                self.clean_endpoints_for_config(port);
                return Err(err);
            }
        }
        Ok(())
    }

    fn build_endpoints_for_interface(
        &self,
        port: usize,
        setting: Option<&InterfaceAltSetting>,
    ) -> HcdResult<()> {
        let setting = setting.ok_or(HcdError::OutOfMemory)?;
        let if_ix = usize::from(setting.interface_number);
        let peer = {
            let state = self.lock_state();
            let port_state = &state.ports[port];
            if if_ix >= port_state.interfaces.len() {
                return Err(HcdError::OutOfMemory);
            }
            port_state.peer.ok_or(HcdError::OutOfMemory)?
        };

        let mut want_heartbeat = false;
        for desc in &setting.endpoints {
            let number = desc.number();
            if number == 0 || usize::from(number) >= NUM_ENDPOINTS {
                self.clean_endpoints_for_interface(port, if_ix);
                return Err(HcdError::OutOfMemory);
            }
            let isoc = desc.transfer_type() == TransferType::Isochronous;
            let in_dir = desc.direction().is_in();
            let max_units = if isoc && in_dir {
                self.transport.max_buffer_units(peer)
            } else {
                0
            };
            let has_stream = isoc && !in_dir && self.transport.create_stream(peer, number).is_ok();
            let ep = Endpoint::from_descriptor(port, desc, &self.config, max_units, has_stream);

            let replaced = {
                let mut state = self.lock_state();
                let previous = state.ports[port].install_endpoint(if_ix, ep);
                previous.map(|old| self.retire_endpoint(&mut state.orphanage, old))
            };
            if let Some(Some(stream)) = replaced {
                self.transport.delete_stream(peer, stream);
            }
            tracing::debug!(port, interface = if_ix, ep = desc.address, "endpoint built");
            want_heartbeat |= isoc;
        }
        if want_heartbeat {
            self.transport.request_heartbeat(peer);
        }
        Ok(())
    }

    /// Moves a torn-down endpoint's URBs to the orphanage. Returns the stream to release, if any.
    pub(crate) fn retire_endpoint(
        &self,
        orphanage: &mut LinkQueue,
        mut ep: Endpoint,
    ) -> Option<u8> {
        if !ep.urbs.is_empty() {
            tracing::debug!(ep = ep.address(), count = ep.urbs.len(), "orphaning URBs");
        }
        ep.urbs.move_all(orphanage);
        ep.has_stream.then_some(ep.number)
    }

    pub(crate) fn clean_endpoints_for_interface(&self, port: usize, if_ix: usize) {
        let (peer, streams) = {
            let mut state = self.lock_state();
            let state = &mut *state;
            let port_state = &mut state.ports[port];
            let Some(iface) = port_state.interfaces.get_mut(if_ix) else {
                return;
            };
            let mask = std::mem::take(&mut iface.ep_mask);
            let mut streams = Vec::new();
            for n in 0..NUM_ENDPOINTS {
                let number = n as u8;
                if mask & (1 << n) != 0 {
                    if let Some(ep) = port_state.remove_endpoint(number, Direction::Out) {
                        streams.extend(self.retire_endpoint(&mut state.orphanage, ep));
                    }
                }
                if mask & (1 << (n + NUM_ENDPOINTS)) != 0 {
                    if let Some(ep) = port_state.remove_endpoint(number, Direction::In) {
                        streams.extend(self.retire_endpoint(&mut state.orphanage, ep));
                    }
                }
            }
            (port_state.peer, streams)
        };
        tracing::trace!(port, interface = if_ix, "interface endpoints removed");
        if let Some(peer) = peer {
            for stream in streams {
                self.transport.delete_stream(peer, stream);
            }
        }
    }

    pub(crate) fn clean_endpoints_for_config(&self, port: usize) {
        let count = self.lock_state().ports[port].interfaces.len();
        for if_ix in 0..count {
            self.clean_endpoints_for_interface(port, if_ix);
        }
        self.lock_state().ports[port].interfaces.clear();
    }
}

/// Answers a one-byte GET_* request from cached state.
fn reply_byte(urb: &UrbHandle, value: u8) -> UrbStatus {
    let mut inner = urb.lock();
    if inner.transfer_buffer_length == 0 || inner.buffer.is_empty() {
        return Err(HcdError::BrokenPipe);
    }
    inner.buffer[0] = value;
    inner.actual_length = 1;
    Ok(())
}

