//! Deferred submission processing.
//!
//! `submit` and `cancel` only queue links and raise a [`DeferredWork`] notification. The host runs
//! the queued work later through [`Controller::run_deferred`]; a [`Tasklet`] per queue keeps each
//! queue draining serially even when several threads call in at once.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::controller::{Controller, ControllerState};
use crate::error::{HcdError, HcdResult, UrbStatus};
use crate::port::PortFlags;
use crate::urb::UrbHandle;
use crate::usb::{Direction, TransferType, NUM_ENDPOINTS};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DeferredWork {
    Submissions,
    Cancellations,
}

/// Notification hook raised when deferred work becomes runnable.
///
/// Implementations must not run the work inline: they are called from `submit`/`cancel`, which
/// may themselves run inside a completion callback.
pub trait DeferredScheduler: Send + Sync {
    fn schedule(&self, work: DeferredWork);
}

/// Scheduler for hosts that poll [`Controller::run_deferred`]; it only counts notifications.
#[derive(Debug, Default)]
pub struct PollScheduler {
    notifications: AtomicUsize,
}

impl PollScheduler {
    pub fn notifications(&self) -> usize {
        self.notifications.load(Ordering::Acquire)
    }
}

impl DeferredScheduler for PollScheduler {
    fn schedule(&self, _work: DeferredWork) {
        self.notifications.fetch_add(1, Ordering::AcqRel);
    }
}

/// Run-at-most-once-concurrently work item.
///
/// `run` never blocks: if another thread is already running the body, the caller returns at once
/// and the running thread picks up the new request before it finishes.
#[derive(Debug, Default)]
pub struct Tasklet {
    scheduled: AtomicBool,
    running: AtomicBool,
}

impl Tasklet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the tasklet runnable. Returns false if it already was.
    pub fn schedule(&self) -> bool {
        !self.scheduled.swap(true, Ordering::AcqRel)
    }

    pub fn is_scheduled(&self) -> bool {
        self.scheduled.load(Ordering::Acquire)
    }

    pub fn run(&self, mut body: impl FnMut()) {
        loop {
            if self
                .running
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }
            while self.scheduled.swap(false, Ordering::AcqRel) {
                body();
            }
            self.running.store(false, Ordering::Release);
            // A schedule that landed after the last swap but before `running` was cleared.
            if !self.scheduled.load(Ordering::Acquire) {
                return;
            }
        }
    }
}

/// Result of queueing an URB on an endpoint while the controller lock is held.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Enqueue {
    Queued,
    /// The URB must be completed with this status once the controller lock is dropped.
    Complete(UrbStatus),
}

impl Controller {
    /// Runs whatever deferred work is scheduled. Safe to call from any thread at any time.
    pub fn run_deferred(&self) {
        self.submit_tasklet.run(|| self.run_submissions());
        self.cancel_tasklet.run(|| self.run_cancellations());
    }

    /// Drains the pending queue one link at a time.
    fn run_submissions(&self) {
        loop {
            let Some(mut link) = self.lock_queues().pending.pop_front() else {
                break;
            };
            let urb = link.urb.take();
            self.pool.release(link);
            let Some(urb) = urb else {
                continue;
            };
            if let Err(err) = self.process_urb(&urb) {
                tracing::trace!(urb = urb.id(), %err, "URB failed in dispatch");
                self.complete_urb(&urb, Err(err));
            }
        }
    }

    fn process_urb(&self, urb: &UrbHandle) -> HcdResult<()> {
        let port = urb.port_slot().ok_or(HcdError::NoDevice)?;
        if !self.port_flags(port).contains(PortFlags::PRESENT) {
            return Err(HcdError::NoDevice);
        }
        let pipe = urb.pipe();
        if pipe.endpoint == 0 {
            self.process_ep0_urb(urb);
            Ok(())
        } else {
            self.enqueue_ep_urb(port, pipe.endpoint, pipe.direction, urb, 0)
        }
    }

    /// Queues `urb` on one of `port`'s endpoints, completing it directly when it was unlinked in
    /// the meantime or when buffered interrupt data can satisfy it.
    pub(crate) fn enqueue_ep_urb(
        &self,
        port: usize,
        number: u8,
        direction: Direction,
        urb: &UrbHandle,
        req_id: u8,
    ) -> HcdResult<()> {
        let outcome = {
            let mut state = self.lock_state();
            self.enqueue_locked(&mut state, port, number, direction, urb, req_id)?
        };
        if let Enqueue::Complete(status) = outcome {
            self.complete_urb(urb, status);
        }
        Ok(())
    }

    pub(crate) fn enqueue_locked(
        &self,
        state: &mut ControllerState,
        port: usize,
        number: u8,
        direction: Direction,
        urb: &UrbHandle,
        req_id: u8,
    ) -> HcdResult<Enqueue> {
        if usize::from(number) >= NUM_ENDPOINTS {
            tracing::warn!(port, ep = number, "invalid endpoint number");
            return Err(HcdError::InvalidRequest);
        }
        let mut link = self.pool.acquire()?;

        if urb.is_unlinked() {
            self.pool.release(link);
            tracing::trace!(urb = urb.id(), "URB unlinked before queueing");
            return Ok(Enqueue::Complete(Err(HcdError::Cancelled)));
        }

        let now_ns = self.clock.now_ns();
        let port_state = &mut state.ports[port];
        let has_peer = port_state.peer.is_some();
        let Some(ep) = port_state.endpoint_mut(number, direction) else {
            self.pool.release(link);
            return Err(HcdError::NoSuchEndpoint);
        };

        if ep.transfer_type == TransferType::Interrupt && ep.complete_from_ring(urb) {
            self.pool.release(link);
            return Ok(Enqueue::Complete(Ok(())));
        }

        if !has_peer {
            self.pool.release(link);
            return Err(HcdError::BrokenPipe);
        }

        link.urb = Some(urb.clone());
        link.port = port;
        link.endpoint = ep.address();
        link.req_id = req_id;
        link.submit_counter = 0;
        ep.urbs.push_back(link);
        if ep.is_isochronous() && !direction.is_in() {
            ep.activate_out_credit(now_ns);
        }
        Ok(Enqueue::Queued)
    }
}
