//! URB cancellation.
//!
//! `cancel` only flags the URB and queues a record; the actual search and completion run later
//! from [`Controller::run_deferred`], because the URB may be sitting in any of several containers
//! whose locks the caller must not take.

use crate::controller::Controller;
use crate::dispatch::DeferredWork;
use crate::error::{HcdError, HcdResult};
use crate::urb::UrbHandle;
use crate::usb::{Direction, USB_ENDPOINT_NUMBER_MASK};

impl Controller {
    /// Requests cancellation of a submitted URB.
    ///
    /// `status` is recorded as the unlink reason for the bus core; the URB itself completes with
    /// `Cancelled`. Fails with `NotLinked` if the URB already completed and with `Busy` if a
    /// cancellation is already in progress.
    pub fn cancel(&self, urb: &UrbHandle, status: HcdError) -> HcdResult<()> {
        let mut link = self.pool.acquire()?;
        let (outcome, unused) = {
            let mut queues = self.lock_queues();
            let checked = urb.check_unlink(status);
            match (checked, urb.port_slot()) {
                (Ok(()), Some(port)) => {
                    link.urb = Some(urb.clone());
                    link.port = port;
                    link.endpoint = urb.pipe().endpoint_address();
                    queues.cancel.push_back(link);
                    (Ok(true), None)
                }
                (checked, _) => (checked.map(|()| false), Some(link)),
            }
        };
        if let Some(link) = unused {
            self.pool.release(link);
        }
        match outcome {
            Ok(true) => {
                tracing::trace!(urb = urb.id(), ?status, "cancel queued");
                self.schedule(DeferredWork::Cancellations);
                Ok(())
            }
            // Completion got there first; nothing left to cancel.
            Ok(false) => Ok(()),
            Err(err) => {
                tracing::trace!(urb = urb.id(), %err, "cancel refused");
                Err(err)
            }
        }
    }

    pub(crate) fn run_cancellations(&self) {
        loop {
            let Some(mut record) = self.lock_queues().cancel.pop_front() else {
                break;
            };
            let urb = record.urb.take();
            let (port, endpoint) = (record.port, record.endpoint);
            self.pool.release(record);
            if let Some(urb) = urb {
                if urb.is_unlinked() {
                    self.cancel_urb(port, endpoint, &urb);
                }
            }
        }
    }

    /// Finds `urb` and completes it with `Cancelled`. Looks at the cancel queue, the orphanage and
    /// finally the endpoint queue. Not finding it means it is already completing elsewhere.
    fn cancel_urb(&self, port: usize, endpoint_address: u8, urb: &UrbHandle) {
        let queued = self.lock_queues().cancel.remove_urb(urb);
        let found = queued.or_else(|| {
            let mut state = self.lock_state();
            if let Some(link) = state.orphanage.remove_urb(urb) {
                tracing::trace!(urb = urb.id(), "cancelled URB found in orphanage");
                return Some(link);
            }
            let number = endpoint_address & USB_ENDPOINT_NUMBER_MASK;
            let direction = Direction::from_endpoint_address(endpoint_address);
            state
                .ports
                .get_mut(port)?
                .endpoint_mut(number, direction)?
                .remove_urb(urb)
        });

        let Some(link) = found else {
            tracing::trace!(urb = urb.id(), "cancelled URB not found");
            return;
        };
        self.pool.release(link);
        urb.lock().actual_length = 0;
        self.complete_urb(urb, Err(HcdError::Cancelled));
    }
}
