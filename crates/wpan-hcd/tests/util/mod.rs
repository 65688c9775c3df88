#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use wpan_hcd::usb::{
    ConfigDescriptor, Direction, EndpointDescriptor, InterfaceAltSetting, InterfaceCache,
    SetupPacket, UsbDeviceTree,
};
use wpan_hcd::{
    BusCore, Controller, FakeHostClock, HcdConfig, HcdError, HcdResult, PeerId, PeerTransport,
    PollScheduler, PortHandle, Urb, UrbHandle, UrbStatus,
};

pub const CLOCK_START_NS: u64 = 1_000_000_000;

pub const ATTR_ISOC: u8 = 0x01;
pub const ATTR_BULK: u8 = 0x02;
pub const ATTR_INTERRUPT: u8 = 0x03;

#[derive(Default)]
pub struct RecordingBus {
    givebacks: Mutex<Vec<(UrbHandle, UrbStatus)>>,
    polls: AtomicUsize,
    resumes: AtomicUsize,
}

impl RecordingBus {
    pub fn giveback_count(&self) -> usize {
        self.givebacks.lock().unwrap().len()
    }

    pub fn statuses(&self) -> Vec<(u64, UrbStatus)> {
        self.givebacks
            .lock()
            .unwrap()
            .iter()
            .map(|(urb, status)| (urb.id(), *status))
            .collect()
    }

    /// Status of `urb`'s giveback. Panics if it was given back more than once.
    pub fn status_of(&self, urb: &UrbHandle) -> Option<UrbStatus> {
        let givebacks = self.givebacks.lock().unwrap();
        let mut matching = givebacks
            .iter()
            .filter(|(done, _)| Arc::ptr_eq(done, urb))
            .map(|(_, status)| *status);
        let first = matching.next();
        assert!(matching.next().is_none(), "URB {} given back twice", urb.id());
        first
    }

    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }

    pub fn resumes(&self) -> usize {
        self.resumes.load(Ordering::SeqCst)
    }
}

impl BusCore for RecordingBus {
    fn giveback_urb(&self, urb: UrbHandle, status: UrbStatus) {
        self.givebacks.lock().unwrap().push((urb, status));
    }

    fn poll_root_hub_status(&self) {
        self.polls.fetch_add(1, Ordering::SeqCst);
    }

    fn resume_root_hub(&self) {
        self.resumes.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Sent {
    Control {
        peer: PeerId,
        req_id: u8,
        setup: SetupPacket,
        data: Vec<u8>,
    },
    Descriptor {
        peer: PeerId,
        req_id: u8,
        descriptor_type: u8,
        offset: u16,
        length: u16,
    },
    Isochronous {
        peer: PeerId,
        endpoint: u8,
        urb: u64,
    },
}

/// Confirmation the transport delivers from inside `send_control_request`.
pub struct InlineConfirm {
    pub port: PortHandle,
    pub rcode: u8,
    pub data: Vec<u8>,
}

pub struct RecordingTransport {
    controller: OnceLock<Weak<Controller>>,
    sent: Mutex<Vec<Sent>>,
    inline_confirms: Mutex<VecDeque<InlineConfirm>>,
    depart_during_send: Mutex<Option<PortHandle>>,
    heartbeat_requests: AtomicUsize,
    streams_created: Mutex<Vec<u8>>,
    streams_deleted: Mutex<Vec<u8>>,
    resets: Mutex<Vec<PeerId>>,
    fail_sends: AtomicBool,
    max_units: AtomicU8,
}

impl Default for RecordingTransport {
    fn default() -> Self {
        Self {
            controller: OnceLock::new(),
            sent: Mutex::new(Vec::new()),
            inline_confirms: Mutex::new(VecDeque::new()),
            depart_during_send: Mutex::new(None),
            heartbeat_requests: AtomicUsize::new(0),
            streams_created: Mutex::new(Vec::new()),
            streams_deleted: Mutex::new(Vec::new()),
            resets: Mutex::new(Vec::new()),
            fail_sends: AtomicBool::new(false),
            max_units: AtomicU8::new(3),
        }
    }
}

impl RecordingTransport {
    pub fn attach_controller(&self, hcd: &Arc<Controller>) {
        let _ = self.controller.set(Arc::downgrade(hcd));
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    pub fn control_requests(&self) -> Vec<(u8, SetupPacket)> {
        self.sent()
            .into_iter()
            .filter_map(|sent| match sent {
                Sent::Control { req_id, setup, .. } => Some((req_id, setup)),
                _ => None,
            })
            .collect()
    }

    pub fn descriptor_requests(&self) -> Vec<(u8, u16, u16)> {
        self.sent()
            .into_iter()
            .filter_map(|sent| match sent {
                Sent::Descriptor {
                    req_id,
                    offset,
                    length,
                    ..
                } => Some((req_id, offset, length)),
                _ => None,
            })
            .collect()
    }

    pub fn isochronous_sends(&self) -> Vec<u64> {
        self.sent()
            .into_iter()
            .filter_map(|sent| match sent {
                Sent::Isochronous { urb, .. } => Some(urb),
                _ => None,
            })
            .collect()
    }

    /// Request id of the most recent control or descriptor request.
    pub fn last_req_id(&self) -> u8 {
        match self.sent.lock().unwrap().iter().rev().find_map(|sent| match sent {
            Sent::Control { req_id, .. } | Sent::Descriptor { req_id, .. } => Some(*req_id),
            Sent::Isochronous { .. } => None,
        }) {
            Some(req_id) => req_id,
            None => panic!("no request sent"),
        }
    }

    pub fn confirm_inline(&self, confirm: InlineConfirm) {
        self.inline_confirms.lock().unwrap().push_back(confirm);
    }

    /// The next control request send detaches the peer behind `port` before returning.
    pub fn depart_during_send(&self, port: PortHandle) {
        *self.depart_during_send.lock().unwrap() = Some(port);
    }

    pub fn heartbeat_requests(&self) -> usize {
        self.heartbeat_requests.load(Ordering::SeqCst)
    }

    pub fn streams_created(&self) -> Vec<u8> {
        self.streams_created.lock().unwrap().clone()
    }

    pub fn streams_deleted(&self) -> Vec<u8> {
        self.streams_deleted.lock().unwrap().clone()
    }

    pub fn resets(&self) -> Vec<PeerId> {
        self.resets.lock().unwrap().clone()
    }

    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn set_max_buffer_units(&self, units: u8) {
        self.max_units.store(units, Ordering::SeqCst);
    }

    fn check_send(&self) -> HcdResult<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            Err(HcdError::OutOfMemory)
        } else {
            Ok(())
        }
    }
}

impl PeerTransport for RecordingTransport {
    fn send_control_request(
        &self,
        peer: PeerId,
        req_id: u8,
        setup: SetupPacket,
        data: &[u8],
    ) -> HcdResult<()> {
        self.check_send()?;
        self.sent.lock().unwrap().push(Sent::Control {
            peer,
            req_id,
            setup,
            data: data.to_vec(),
        });
        let hcd = self.controller.get().and_then(Weak::upgrade);
        let inline = self.inline_confirms.lock().unwrap().pop_front();
        if let (Some(confirm), Some(hcd)) = (inline, &hcd) {
            hcd.control_confirm(confirm.port, req_id, confirm.rcode, &confirm.data);
        }
        let departing = self.depart_during_send.lock().unwrap().take();
        if let (Some(port), Some(hcd)) = (departing, &hcd) {
            hcd.peer_departed(port);
        }
        Ok(())
    }

    fn send_get_descriptor(
        &self,
        peer: PeerId,
        req_id: u8,
        _request_type: u8,
        descriptor_type: u8,
        _descriptor_index: u8,
        _index: u16,
        offset: u16,
        length: u16,
    ) -> HcdResult<()> {
        self.check_send()?;
        self.sent.lock().unwrap().push(Sent::Descriptor {
            peer,
            req_id,
            descriptor_type,
            offset,
            length,
        });
        Ok(())
    }

    fn send_isochronous(&self, peer: PeerId, endpoint: u8, urb: &Urb) {
        self.sent.lock().unwrap().push(Sent::Isochronous {
            peer,
            endpoint,
            urb: urb.id(),
        });
    }

    fn request_heartbeat(&self, _peer: PeerId) {
        self.heartbeat_requests.fetch_add(1, Ordering::SeqCst);
    }

    fn max_buffer_units(&self, _peer: PeerId) -> u8 {
        self.max_units.load(Ordering::SeqCst)
    }

    fn create_stream(&self, _peer: PeerId, endpoint: u8) -> HcdResult<()> {
        self.streams_created.lock().unwrap().push(endpoint);
        Ok(())
    }

    fn delete_stream(&self, _peer: PeerId, endpoint: u8) {
        self.streams_deleted.lock().unwrap().push(endpoint);
    }

    fn reset_device(&self, peer: PeerId) {
        self.resets.lock().unwrap().push(peer);
    }
}

pub struct Harness {
    pub hcd: Arc<Controller>,
    pub bus: Arc<RecordingBus>,
    pub transport: Arc<RecordingTransport>,
    pub clock: Arc<FakeHostClock>,
    pub scheduler: Arc<PollScheduler>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(HcdConfig::default())
    }

    /// A started controller on a fake clock.
    pub fn with_config(config: HcdConfig) -> Self {
        let bus = Arc::new(RecordingBus::default());
        let transport = Arc::new(RecordingTransport::default());
        let clock = Arc::new(FakeHostClock::new(CLOCK_START_NS));
        let scheduler = Arc::new(PollScheduler::default());
        let hcd = Arc::new(
            Controller::with_parts(
                config,
                bus.clone(),
                transport.clone(),
                clock.clone(),
                scheduler.clone(),
            )
            .unwrap(),
        );
        transport.attach_controller(&hcd);
        hcd.start();
        Self {
            hcd,
            bus,
            transport,
            clock,
            scheduler,
        }
    }

    pub fn attach(&self, peer: u64) -> PortHandle {
        self.hcd.peer_attached(PeerId(peer)).unwrap()
    }

    /// Submits `urb` and runs the deferred work it queued.
    pub fn submit(&self, urb: Urb) -> UrbHandle {
        let urb = urb.into_handle();
        self.hcd.submit(urb.clone()).unwrap();
        self.hcd.run_deferred();
        urb
    }

    pub fn advance_ms(&self, ms: u64) {
        self.clock.advance(Duration::from_millis(ms));
    }

    /// SET_ADDRESS on the connection port.
    pub fn set_address(&self, address: u8) {
        let urb = self.submit(Urb::control(
            0,
            setup(0x00, 0x05, u16::from(address), 0, 0),
            Vec::new(),
        ));
        assert_eq!(self.bus.status_of(&urb), Some(Ok(())));
    }

    /// SET_CONFIGURATION acknowledged by the peer. Returns the URB's completion status.
    pub fn set_configuration(
        &self,
        port: PortHandle,
        address: u8,
        device: &Arc<UsbDeviceTree>,
        value: u8,
    ) -> Option<UrbStatus> {
        let urb = self.submit(
            Urb::control(address, setup(0x00, 0x09, u16::from(value), 0, 0), Vec::new())
                .with_device(device.clone()),
        );
        self.hcd
            .control_confirm(port, self.transport.last_req_id(), 0, &[]);
        self.bus.status_of(&urb)
    }

    /// Attaches `peer`, addresses it and selects configuration 1 of `device`.
    pub fn enumerate(&self, peer: u64, address: u8, device: &Arc<UsbDeviceTree>) -> PortHandle {
        let port = self.attach(peer);
        self.set_address(address);
        assert_eq!(
            self.set_configuration(port, address, device, 1),
            Some(Ok(()))
        );
        port
    }
}

pub fn setup(request_type: u8, request: u8, value: u16, index: u16, length: u16) -> SetupPacket {
    SetupPacket {
        request_type,
        request,
        value,
        index,
        length,
    }
}

pub fn ep(address: u8, attributes: u8, max_packet_size: u16) -> EndpointDescriptor {
    EndpointDescriptor {
        address,
        attributes,
        max_packet_size,
        interval: 1,
    }
}

pub fn alt(
    interface_number: u8,
    alternate_setting: u8,
    endpoints: Vec<EndpointDescriptor>,
) -> InterfaceAltSetting {
    InterfaceAltSetting {
        interface_number,
        alternate_setting,
        endpoints,
    }
}

pub fn device(interfaces: Vec<Vec<InterfaceAltSetting>>) -> Arc<UsbDeviceTree> {
    Arc::new(UsbDeviceTree {
        configs: vec![ConfigDescriptor {
            configuration_value: 1,
            interfaces: interfaces
                .into_iter()
                .map(|alt_settings| InterfaceCache { alt_settings })
                .collect(),
        }],
    })
}

/// Interface 0: interrupt IN 0x81, bulk OUT 0x02, bulk IN 0x82.
/// Interface 1: no endpoints at alt 0; isochronous OUT 0x03 and IN 0x84 at alt 1.
pub fn sample_device() -> Arc<UsbDeviceTree> {
    device(vec![
        vec![alt(
            0,
            0,
            vec![
                ep(0x81, ATTR_INTERRUPT, 8),
                ep(0x02, ATTR_BULK, 64),
                ep(0x82, ATTR_BULK, 64),
            ],
        )],
        vec![
            alt(1, 0, Vec::new()),
            alt(1, 1, vec![ep(0x03, ATTR_ISOC, 192), ep(0x84, ATTR_ISOC, 192)]),
        ],
    ])
}

/// One interface with isochronous OUT 0x01 and isochronous IN 0x82 at alt 0.
pub fn isoc_device() -> Arc<UsbDeviceTree> {
    device(vec![vec![alt(
        0,
        0,
        vec![ep(0x01, ATTR_ISOC, 192), ep(0x82, ATTR_ISOC, 192)],
    )]])
}

pub fn bulk_out(address: u8, endpoint: u8, len: usize) -> Urb {
    Urb::bulk(address, endpoint, Direction::Out, vec![0xa5; len])
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::TRACE)
        .try_init();
}
