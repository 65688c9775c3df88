//! Software USB host controller for peer devices reached over a wireless link.
//!
//! The [`Controller`] sits between a USB bus core ([`BusCore`]) and a wireless protocol layer
//! ([`PeerTransport`]). Each attached peer appears on a port of a virtual root hub; URBs submitted
//! for it are queued per endpoint, short-circuited locally (standard control requests the
//! controller can answer from cached state), forwarded to the peer, or paced against elapsed time
//! (isochronous streams driven by [`Controller::heartbeat`]).
//!
//! No threads are spawned. Submission and cancellation only queue work and notify a
//! [`DeferredScheduler`]; the host later calls [`Controller::run_deferred`] from whatever worker
//! context it has.

mod bus;
mod cancel;
mod clock;
mod config;
mod control;
mod controller;
mod dispatch;
mod endpoint;
mod error;
mod heartbeat;
mod hub;
mod peer;
mod pool;
mod port;
mod ring;
mod transport;
mod urb;
pub mod usb;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use bus::BusCore;
pub use clock::{FakeHostClock, HostClock, StdHostClock};
pub use config::{ConfigError, HcdConfig, MAX_PORT_COUNT};
pub use controller::{Controller, PortHandle, RunState};
pub use dispatch::{DeferredScheduler, DeferredWork, PollScheduler, Tasklet};
pub use error::{HcdError, HcdResult, UrbStatus};
pub use hub::{
    HubRequest, HUB_PORT_FEATURE_C_CONNECTION, HUB_PORT_FEATURE_C_ENABLE,
    HUB_PORT_FEATURE_C_OVER_CURRENT, HUB_PORT_FEATURE_C_RESET, HUB_PORT_FEATURE_C_SUSPEND,
    HUB_PORT_FEATURE_CONNECTION, HUB_PORT_FEATURE_ENABLE, HUB_PORT_FEATURE_INDICATOR,
    HUB_PORT_FEATURE_LOWSPEED, HUB_PORT_FEATURE_OVER_CURRENT, HUB_PORT_FEATURE_POWER,
    HUB_PORT_FEATURE_RESET, HUB_PORT_FEATURE_SUSPEND, HUB_PORT_FEATURE_TEST,
};
pub use pool::{LinkLocation, LinkPool, UrbLink};
pub use port::{
    PortFlags, PortPhase, USB_PORT_STAT_CONNECTION, USB_PORT_STAT_C_CONNECTION,
    USB_PORT_STAT_C_ENABLE, USB_PORT_STAT_C_OVERCURRENT, USB_PORT_STAT_C_RESET,
    USB_PORT_STAT_C_SUSPEND, USB_PORT_STAT_ENABLE, USB_PORT_STAT_HIGH_SPEED,
    USB_PORT_STAT_LOW_SPEED, USB_PORT_STAT_OVERCURRENT, USB_PORT_STAT_POWER,
    USB_PORT_STAT_RESET, USB_PORT_STAT_SUSPEND,
};
pub use ring::{DataRing, RingError};
pub use transport::{PeerId, PeerTransport};
pub use urb::{IsoPacket, Pipe, Urb, UrbHandle, UrbInner};

/// Locks `mutex`, recovering the guard if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
