//! The slice of the USB bus core the controller calls back into.

use crate::error::UrbStatus;
use crate::urb::UrbHandle;

/// Callbacks into the USB bus core that owns the URBs and the root hub device.
///
/// Implementations may re-enter [`crate::Controller::submit`] from `giveback_urb` (resubmitting a
/// finished interrupt URB is the common case), so the controller never calls them while holding
/// its submission queue lock.
pub trait BusCore: Send + Sync {
    /// Returns a finished URB to its owner. Called exactly once per submitted URB.
    fn giveback_urb(&self, urb: UrbHandle, status: UrbStatus);

    /// Asks the bus core to poll [`crate::Controller::hub_status_poll`] soon.
    fn poll_root_hub_status(&self);

    /// Asks the bus core to resume a suspended root hub.
    fn resume_root_hub(&self);
}
