//! The host controller aggregate: ports, queues and the single completion path.
//!
//! Lock order is: controller state, then a port status lock, then the submission queues, then a
//! URB's own lock. The link pool lock is a leaf. The queues lock is never held while calling into
//! the bus core or the transport, because both may re-enter [`Controller::submit`].

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::bus::BusCore;
use crate::clock::{HostClock, StdHostClock};
use crate::config::{ConfigError, HcdConfig};
use crate::dispatch::{DeferredScheduler, DeferredWork, PollScheduler, Tasklet};
use crate::endpoint::Endpoint;
use crate::error::{HcdError, HcdResult, UrbStatus};
use crate::lock;
use crate::pool::{LinkBox, LinkLocation, LinkPool, LinkQueue};
use crate::port::{Port, PortFlags, PortPhase, PortStatus};
use crate::transport::PeerTransport;
use crate::urb::UrbHandle;
use crate::usb::{Direction, TransferType, NUM_ENDPOINTS, USB_ENDPOINT_NUMBER_MASK};

/// Identifies one root hub port. Handed to the transport when a peer arrives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PortHandle(pub(crate) usize);

impl PortHandle {
    /// Zero-based port index.
    pub fn index(self) -> usize {
        self.0
    }

    /// One-based port number as used in hub requests (`wIndex`).
    pub fn number(self) -> u16 {
        u16::try_from(self.0 + 1).unwrap_or(u16::MAX)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    Halted,
    Running,
    Suspended,
}

#[derive(Debug)]
pub(crate) struct ControllerState {
    pub(crate) run_state: RunState,
    pub(crate) ports: Vec<Port>,
    /// Links whose endpoint was torn down while they were queued.
    pub(crate) orphanage: LinkQueue,
    /// Port mid-enumeration (no bus address yet).
    pub(crate) conn_port: Option<usize>,
    /// Port picked by the previous arrival; the next search starts after it.
    pub(crate) last_arrival: usize,
}

impl ControllerState {
    /// Resolves a bus address to a port. Address 0 is the connection port.
    pub(crate) fn port_from_addr(&self, addr: u8) -> Option<usize> {
        if addr == 0 {
            return self.conn_port;
        }
        self.ports.iter().position(|port| port.bus_addr == addr)
    }
}

#[derive(Debug)]
pub(crate) struct Queues {
    pub(crate) pending: LinkQueue,
    pub(crate) cancel: LinkQueue,
}

pub struct Controller {
    pub(crate) config: HcdConfig,
    pub(crate) bus: Arc<dyn BusCore>,
    pub(crate) transport: Arc<dyn PeerTransport>,
    pub(crate) clock: Arc<dyn HostClock>,
    scheduler: Arc<dyn DeferredScheduler>,
    pub(crate) pool: LinkPool,
    queues: Mutex<Queues>,
    state: Mutex<ControllerState>,
    port_status: Vec<Mutex<PortStatus>>,
    frame_number: AtomicU32,
    pending_urbs: AtomicUsize,
    pub(crate) submit_tasklet: Tasklet,
    pub(crate) cancel_tasklet: Tasklet,
}

impl Controller {
    /// Creates a halted controller using the system clock and a [`PollScheduler`].
    pub fn new(
        config: HcdConfig,
        bus: Arc<dyn BusCore>,
        transport: Arc<dyn PeerTransport>,
    ) -> Result<Self, ConfigError> {
        Self::with_parts(
            config,
            bus,
            transport,
            Arc::new(StdHostClock::new()),
            Arc::new(PollScheduler::default()),
        )
    }

    pub fn with_parts(
        config: HcdConfig,
        bus: Arc<dyn BusCore>,
        transport: Arc<dyn PeerTransport>,
        clock: Arc<dyn HostClock>,
        scheduler: Arc<dyn DeferredScheduler>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let port_count = config.port_count;
        Ok(Self {
            pool: LinkPool::new(config.link_pool_capacity, config.max_outstanding_links),
            queues: Mutex::new(Queues {
                pending: LinkQueue::new(LinkLocation::Pending),
                cancel: LinkQueue::new(LinkLocation::Cancelling),
            }),
            state: Mutex::new(ControllerState {
                run_state: RunState::Halted,
                ports: (0..port_count).map(|_| Port::new()).collect(),
                orphanage: LinkQueue::new(LinkLocation::Orphaned),
                conn_port: None,
                last_arrival: port_count - 1,
            }),
            port_status: (0..port_count)
                .map(|_| Mutex::new(PortStatus::default()))
                .collect(),
            frame_number: AtomicU32::new(0),
            pending_urbs: AtomicUsize::new(0),
            submit_tasklet: Tasklet::new(),
            cancel_tasklet: Tasklet::new(),
            config,
            bus,
            transport,
            clock,
            scheduler,
        })
    }

    pub fn config(&self) -> &HcdConfig {
        &self.config
    }

    pub fn link_pool(&self) -> &LinkPool {
        &self.pool
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, ControllerState> {
        lock(&self.state)
    }

    pub(crate) fn lock_queues(&self) -> MutexGuard<'_, Queues> {
        lock(&self.queues)
    }

    pub(crate) fn lock_port_status(&self, port: usize) -> MutexGuard<'_, PortStatus> {
        lock(&self.port_status[port])
    }

    pub(crate) fn port_index(&self, port: PortHandle) -> Option<usize> {
        (port.0 < self.port_status.len()).then_some(port.0)
    }

    pub(crate) fn port_flags(&self, port: usize) -> PortFlags {
        self.lock_port_status(port).flags
    }

    pub(crate) fn schedule(&self, work: DeferredWork) {
        let tasklet = match work {
            DeferredWork::Submissions => &self.submit_tasklet,
            DeferredWork::Cancellations => &self.cancel_tasklet,
        };
        if tasklet.schedule() {
            self.scheduler.schedule(work);
        }
    }

    pub fn start(&self) {
        self.lock_state().run_state = RunState::Running;
        tracing::debug!("host controller running");
    }

    /// Halts the controller and fails every orphaned URB with `NoDevice`.
    pub fn stop(&self) {
        self.lock_state().run_state = RunState::Halted;
        tracing::debug!("host controller halted");
        self.clear_orphanage(HcdError::NoDevice);
    }

    pub fn bus_suspend(&self) {
        self.lock_state().run_state = RunState::Suspended;
        tracing::debug!("bus suspended");
    }

    pub fn bus_resume(&self) {
        self.lock_state().run_state = RunState::Running;
        tracing::debug!("bus resumed");
    }

    pub fn run_state(&self) -> RunState {
        self.lock_state().run_state
    }

    /// Accepts an URB for asynchronous processing.
    ///
    /// Fails synchronously (and never gives the URB back) when the controller is not running or
    /// no peer is present behind the addressed device. On success the URB is completed later,
    /// exactly once, through [`BusCore::giveback_urb`].
    pub fn submit(&self, urb: UrbHandle) -> HcdResult<()> {
        let pipe = urb.pipe();
        if usize::from(pipe.endpoint) >= NUM_ENDPOINTS {
            return Err(HcdError::InvalidRequest);
        }
        if pipe.transfer_type == TransferType::Control && urb.setup().is_none() {
            return Err(HcdError::InvalidRequest);
        }

        let port = {
            let state = self.lock_state();
            if state.run_state != RunState::Running {
                tracing::trace!(urb = urb.id(), "refused URB: controller not running");
                return Err(HcdError::NoDevice);
            }
            let Some(port) = state.port_from_addr(pipe.device_address) else {
                return Err(HcdError::NoDevice);
            };
            if !self.port_flags(port).contains(PortFlags::PRESENT) {
                tracing::trace!(urb = urb.id(), port, "refused URB: port not present");
                return Err(HcdError::NoDevice);
            }
            port
        };

        let mut link = self.pool.acquire()?;
        urb.set_port_slot(port);
        link.urb = Some(urb.clone());
        link.port = port;
        link.endpoint = pipe.endpoint_address();
        {
            let mut queues = self.lock_queues();
            if let Err(err) = urb.link_to_endpoint() {
                drop(queues);
                urb.lock().clear_port_slot();
                self.pool.release(link);
                return Err(err);
            }
            self.pending_urbs.fetch_add(1, Ordering::AcqRel);
            queues.pending.push_back(link);
        }
        tracing::trace!(urb = urb.id(), port, ep = pipe.endpoint_address(), "URB queued");
        self.schedule(DeferredWork::Submissions);
        Ok(())
    }

    /// Hands a finished URB back to the bus core. Every completion goes through here.
    ///
    /// Must be called with no controller lock held.
    pub(crate) fn complete_urb(&self, urb: &UrbHandle, status: UrbStatus) {
        let cancel_link = {
            let mut queues = self.lock_queues();
            {
                let mut inner = urb.lock();
                if urb.pipe().is_isochronous() {
                    match status {
                        Err(_) => {
                            inner.transfer_buffer_length = 0;
                            for packet in inner.iso_packets.iter_mut() {
                                packet.actual_length = 0;
                                packet.status = status;
                            }
                        }
                        Ok(()) => inner.transfer_buffer_length = inner.actual_length,
                    }
                }
                inner.set_unlinked_from_endpoint();
                // With the port slot cleared a racing cancel no longer queues a record.
                inner.clear_port_slot();
            }
            // A cancel record may still be waiting for the cancel tasklet.
            queues.cancel.remove_urb(urb)
        };

        if urb.mark_given_back() {
            let _ = self
                .pending_urbs
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
            tracing::trace!(urb = urb.id(), ?status, "URB given back");
            self.bus.giveback_urb(urb.clone(), status);
        } else {
            tracing::warn!(urb = urb.id(), "URB already given back");
        }

        if let Some(link) = cancel_link {
            self.pool.release(link);
        }
    }

    /// Completes the URBs carried by `links` and recycles the links.
    pub(crate) fn complete_links(&self, links: Vec<LinkBox>, status: UrbStatus) {
        for mut link in links {
            let urb = link.urb.take();
            self.pool.release(link);
            if let Some(urb) = urb {
                self.complete_urb(&urb, status);
            }
        }
    }

    /// Completes every orphaned URB with `status`.
    pub fn clear_orphanage(&self, status: HcdError) {
        let orphans = self.lock_state().orphanage.drain();
        if !orphans.is_empty() {
            tracing::debug!(count = orphans.len(), ?status, "clearing orphanage");
        }
        self.complete_links(orphans, Err(status));
    }

    /// Advances and returns the frame counter shared by every port.
    pub fn get_frame_number(&self) -> u32 {
        self.frame_number.fetch_add(1, Ordering::AcqRel).wrapping_add(1)
    }

    pub fn endpoint_disable(&self, device_address: u8, endpoint_address: u8) {
        tracing::trace!(device_address, endpoint_address, "endpoint disable");
    }

    pub fn endpoint_reset(&self, device_address: u8, endpoint_address: u8) {
        tracing::trace!(device_address, endpoint_address, "endpoint reset");
    }

    /// URBs accepted by [`Controller::submit`] and not yet given back.
    pub fn pending_urb_count(&self) -> usize {
        self.pending_urbs.load(Ordering::Acquire)
    }

    pub fn port_count(&self) -> usize {
        self.port_status.len()
    }

    pub fn orphan_count(&self) -> usize {
        self.lock_state().orphanage.len()
    }

    pub fn port_phase(&self, port: PortHandle) -> Option<PortPhase> {
        let ix = self.port_index(port)?;
        let state = self.lock_state();
        let flags = self.port_flags(ix);
        Some(state.ports[ix].phase(flags))
    }

    /// Hub status word of a port (status in the low half, change bits in the high half).
    pub fn port_status(&self, port: PortHandle) -> Option<u32> {
        let ix = self.port_index(port)?;
        Some(self.lock_port_status(ix).status)
    }

    pub fn port_bus_address(&self, port: PortHandle) -> Option<u8> {
        let ix = self.port_index(port)?;
        Some(self.lock_state().ports[ix].bus_addr)
    }

    pub fn port_configuration(&self, port: PortHandle) -> Option<u8> {
        let ix = self.port_index(port)?;
        Some(self.lock_state().ports[ix].config_num)
    }

    pub fn port_interface_count(&self, port: PortHandle) -> Option<usize> {
        let ix = self.port_index(port)?;
        Some(self.lock_state().ports[ix].interfaces.len())
    }

    /// Whether an endpoint exists for `endpoint_address` (bit 7 set for IN) on `port`.
    pub fn has_endpoint(&self, port: PortHandle, endpoint_address: u8) -> bool {
        self.with_endpoint(port, endpoint_address, |_| ()).is_some()
    }

    /// Number of data units buffered on an endpoint, if it exists.
    pub fn buffered_units(&self, port: PortHandle, endpoint_address: u8) -> Option<usize> {
        self.with_endpoint(port, endpoint_address, |ep| ep.buffered_units())
    }

    /// Number of URBs queued on an endpoint, if it exists.
    pub fn queued_urbs(&self, port: PortHandle, endpoint_address: u8) -> Option<usize> {
        self.with_endpoint(port, endpoint_address, |ep| ep.urbs.len())
    }

    fn with_endpoint<T>(
        &self,
        port: PortHandle,
        endpoint_address: u8,
        f: impl FnOnce(&Endpoint) -> T,
    ) -> Option<T> {
        let ix = self.port_index(port)?;
        let mut state = self.lock_state();
        let number = endpoint_address & USB_ENDPOINT_NUMBER_MASK;
        let direction = Direction::from_endpoint_address(endpoint_address);
        state.ports[ix]
            .endpoint_mut(number, direction)
            .map(|ep| f(ep))
    }
}
