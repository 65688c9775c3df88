//! Outbound interface to the wireless protocol layer that actually talks to peer devices.

use crate::error::HcdResult;
use crate::urb::Urb;
use crate::usb::SetupPacket;

/// Opaque handle the transport uses to identify one attached peer device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u64);

/// Requests the controller issues towards a peer.
///
/// All methods are invoked without any controller lock held; implementations are free to call
/// back into the controller (for example delivering [`crate::Controller::control_confirm`] before
/// `send_control_request` returns).
pub trait PeerTransport: Send + Sync {
    /// Forwards a control request. `data` carries the OUT data stage and is empty for IN requests.
    fn send_control_request(
        &self,
        peer: PeerId,
        req_id: u8,
        setup: SetupPacket,
        data: &[u8],
    ) -> HcdResult<()>;

    /// Asks for (the remainder of) a descriptor starting at `offset`.
    #[allow(clippy::too_many_arguments)]
    fn send_get_descriptor(
        &self,
        peer: PeerId,
        req_id: u8,
        request_type: u8,
        descriptor_type: u8,
        descriptor_index: u8,
        index: u16,
        offset: u16,
        length: u16,
    ) -> HcdResult<()>;

    /// Sends one isochronous OUT URB worth of packets.
    fn send_isochronous(&self, peer: PeerId, endpoint: u8, urb: &Urb);

    /// Notifies the transport that the controller wants heartbeats for this peer.
    fn request_heartbeat(&self, peer: PeerId);

    /// Number of isochronous units the peer wants buffered before playback starts.
    fn max_buffer_units(&self, peer: PeerId) -> u8;

    fn create_stream(&self, peer: PeerId, endpoint: u8) -> HcdResult<()>;

    fn delete_stream(&self, peer: PeerId, endpoint: u8);

    /// Resets the peer device (hub SetPortFeature(PORT_RESET)).
    fn reset_device(&self, peer: PeerId);
}
