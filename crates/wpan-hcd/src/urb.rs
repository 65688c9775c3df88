//! USB request blocks as seen by the controller.
//!
//! URBs belong to the bus core: it allocates them, hands them to [`crate::Controller::submit`] and
//! gets them back through [`crate::BusCore::giveback_urb`]. The controller only ever holds shared
//! handles. The small amount of bus-core bookkeeping the controller has to consult (whether the
//! URB is linked to an endpoint, whether an unlink was requested, which port it was routed to)
//! lives in the URB itself, behind the same leaf lock as the transfer data.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{HcdError, HcdResult, UrbStatus};
use crate::lock;
use crate::usb::{endpoint_address, Direction, SetupPacket, TransferType, UsbDeviceTree};

pub type UrbHandle = Arc<Urb>;

static NEXT_URB_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Pipe {
    pub device_address: u8,
    pub endpoint: u8,
    pub direction: Direction,
    pub transfer_type: TransferType,
}

impl Pipe {
    pub fn endpoint_address(&self) -> u8 {
        endpoint_address(self.endpoint, self.direction)
    }

    pub fn is_isochronous(&self) -> bool {
        self.transfer_type == TransferType::Isochronous
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IsoPacket {
    pub offset: usize,
    pub length: usize,
    pub actual_length: usize,
    pub status: UrbStatus,
}

/// Mutable part of an URB.
#[derive(Debug)]
pub struct UrbInner {
    pub buffer: Vec<u8>,
    /// Bytes the transfer may move. Isochronous completions rewrite this to the actual length.
    pub transfer_buffer_length: usize,
    pub actual_length: usize,
    pub iso_packets: Vec<IsoPacket>,
    pub start_frame: u32,
    pub error_count: u32,

    linked: bool,
    unlinked: Option<HcdError>,
    port: Option<usize>,
    given_back: bool,
}

#[derive(Debug)]
pub struct Urb {
    id: u64,
    pipe: Pipe,
    setup: Option<SetupPacket>,
    device: Arc<UsbDeviceTree>,
    inner: Mutex<UrbInner>,
}

impl Urb {
    pub fn new(pipe: Pipe, buffer: Vec<u8>) -> Self {
        let transfer_buffer_length = buffer.len();
        Self {
            id: NEXT_URB_ID.fetch_add(1, Ordering::Relaxed),
            pipe,
            setup: None,
            device: Arc::new(UsbDeviceTree::default()),
            inner: Mutex::new(UrbInner {
                buffer,
                transfer_buffer_length,
                actual_length: 0,
                iso_packets: Vec::new(),
                start_frame: 0,
                error_count: 0,
                linked: false,
                unlinked: None,
                port: None,
                given_back: false,
            }),
        }
    }

    /// Control transfer on endpoint 0. IN requests get a zeroed buffer of `wLength` bytes when
    /// `data` is empty.
    pub fn control(device_address: u8, setup: SetupPacket, data: Vec<u8>) -> Self {
        let direction = if setup.is_device_to_host() {
            Direction::In
        } else {
            Direction::Out
        };
        let buffer = if data.is_empty() && setup.is_device_to_host() {
            vec![0; usize::from(setup.length)]
        } else {
            data
        };
        let mut urb = Self::new(
            Pipe {
                device_address,
                endpoint: 0,
                direction,
                transfer_type: TransferType::Control,
            },
            buffer,
        );
        urb.setup = Some(setup);
        urb
    }

    pub fn bulk(device_address: u8, endpoint: u8, direction: Direction, buffer: Vec<u8>) -> Self {
        Self::new(
            Pipe {
                device_address,
                endpoint,
                direction,
                transfer_type: TransferType::Bulk,
            },
            buffer,
        )
    }

    pub fn interrupt(
        device_address: u8,
        endpoint: u8,
        direction: Direction,
        buffer: Vec<u8>,
    ) -> Self {
        Self::new(
            Pipe {
                device_address,
                endpoint,
                direction,
                transfer_type: TransferType::Interrupt,
            },
            buffer,
        )
    }

    /// Isochronous transfer with one packet per entry of `packet_lengths`, laid out back to back.
    pub fn isochronous(
        device_address: u8,
        endpoint: u8,
        direction: Direction,
        packet_lengths: &[usize],
    ) -> Self {
        let total = packet_lengths.iter().sum();
        let urb = Self::new(
            Pipe {
                device_address,
                endpoint,
                direction,
                transfer_type: TransferType::Isochronous,
            },
            vec![0; total],
        );
        urb.with_iso_packets(packet_lengths)
    }

    pub fn with_iso_packets(self, packet_lengths: &[usize]) -> Self {
        {
            let mut inner = lock(&self.inner);
            let mut offset = 0;
            inner.iso_packets = packet_lengths
                .iter()
                .map(|&length| {
                    let packet = IsoPacket {
                        offset,
                        length,
                        actual_length: 0,
                        status: Ok(()),
                    };
                    offset += length;
                    packet
                })
                .collect();
        }
        self
    }

    pub fn with_device(mut self, device: Arc<UsbDeviceTree>) -> Self {
        self.device = device;
        self
    }

    pub fn into_handle(self) -> UrbHandle {
        Arc::new(self)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn pipe(&self) -> Pipe {
        self.pipe
    }

    pub fn setup(&self) -> Option<SetupPacket> {
        self.setup
    }

    pub fn device(&self) -> &Arc<UsbDeviceTree> {
        &self.device
    }

    pub fn lock(&self) -> MutexGuard<'_, UrbInner> {
        lock(&self.inner)
    }

    pub fn number_of_packets(&self) -> usize {
        self.lock().iso_packets.len()
    }

    pub fn actual_length(&self) -> usize {
        self.lock().actual_length
    }

    /// Copy of the bytes the transfer actually moved.
    pub fn actual_data(&self) -> Vec<u8> {
        let inner = self.lock();
        let len = inner.actual_length.min(inner.buffer.len());
        inner.buffer[..len].to_vec()
    }

    pub fn is_linked(&self) -> bool {
        self.lock().linked
    }

    pub fn is_unlinked(&self) -> bool {
        self.lock().unlinked.is_some()
    }

    pub fn unlink_status(&self) -> Option<HcdError> {
        self.lock().unlinked
    }

    pub fn is_given_back(&self) -> bool {
        self.lock().given_back
    }

    /// Bus-core bookkeeping: records that the URB is now owned by an endpoint of this controller.
    pub fn link_to_endpoint(&self) -> HcdResult<()> {
        let mut inner = self.lock();
        if inner.linked {
            return Err(HcdError::Busy);
        }
        inner.linked = true;
        inner.unlinked = None;
        inner.given_back = false;
        Ok(())
    }

    /// Bus-core bookkeeping: flags the URB for unlinking.
    ///
    /// Fails with `NotLinked` if the URB already left the endpoint (it completed) and with `Busy`
    /// if an unlink is already in progress.
    pub fn check_unlink(&self, status: HcdError) -> HcdResult<()> {
        let mut inner = self.lock();
        if !inner.linked {
            return Err(HcdError::NotLinked);
        }
        if inner.unlinked.is_some() {
            return Err(HcdError::Busy);
        }
        inner.unlinked = Some(status);
        Ok(())
    }

    pub fn unlink_from_endpoint(&self) {
        self.lock().linked = false;
    }

    pub(crate) fn port_slot(&self) -> Option<usize> {
        self.lock().port
    }

    pub(crate) fn set_port_slot(&self, port: usize) {
        self.lock().port = Some(port);
    }

    /// Returns false if the URB had already been given back.
    pub(crate) fn mark_given_back(&self) -> bool {
        let mut inner = self.lock();
        !std::mem::replace(&mut inner.given_back, true)
    }
}

impl UrbInner {
    pub(crate) fn clear_port_slot(&mut self) {
        self.port = None;
    }

    pub(crate) fn set_unlinked_from_endpoint(&mut self) {
        self.linked = false;
    }

    /// Copies `data` to the start of the buffer, truncated to the transfer length.
    pub(crate) fn fill_from(&mut self, data: &[u8]) -> usize {
        let len = data.len().min(self.transfer_buffer_length).min(self.buffer.len());
        self.buffer[..len].copy_from_slice(&data[..len]);
        self.actual_length = len;
        len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlink_bookkeeping_follows_bus_core_rules() {
        let urb = Urb::bulk(3, 1, Direction::Out, vec![1, 2, 3]).into_handle();
        assert_eq!(urb.check_unlink(HcdError::Cancelled), Err(HcdError::NotLinked));

        urb.link_to_endpoint().unwrap();
        assert_eq!(urb.link_to_endpoint(), Err(HcdError::Busy));
        assert_eq!(urb.check_unlink(HcdError::Cancelled), Ok(()));
        assert_eq!(urb.check_unlink(HcdError::Cancelled), Err(HcdError::Busy));
        assert!(urb.is_unlinked());

        urb.unlink_from_endpoint();
        assert!(!urb.is_linked());
    }

    #[test]
    fn isochronous_packets_are_laid_out_back_to_back() {
        let urb = Urb::isochronous(2, 4, Direction::In, &[10, 20, 30]);
        let inner = urb.lock();
        assert_eq!(inner.buffer.len(), 60);
        let offsets: Vec<usize> = inner.iso_packets.iter().map(|p| p.offset).collect();
        assert_eq!(offsets, vec![0, 10, 30]);
    }

    #[test]
    fn control_in_allocates_wlength_buffer() {
        let setup = SetupPacket {
            request_type: 0x80,
            request: 0x06,
            value: 0x0100,
            index: 0,
            length: 18,
        };
        let urb = Urb::control(0, setup, Vec::new());
        assert_eq!(urb.lock().buffer.len(), 18);
        assert_eq!(urb.pipe().direction, Direction::In);
    }
}
