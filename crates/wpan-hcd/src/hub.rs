//! Virtual root hub: status-change bitmap and hub class requests.

use crate::controller::Controller;
use crate::error::{HcdError, HcdResult};
use crate::port::{
    PortFlags, USB_PORT_STAT_C_CONNECTION, USB_PORT_STAT_C_ENABLE, USB_PORT_STAT_C_RESET,
    USB_PORT_STAT_ENABLE, USB_PORT_STAT_POWER, USB_PORT_STAT_RESET,
};
use crate::usb::USB_DESCRIPTOR_TYPE_HUB;

pub const HUB_PORT_FEATURE_CONNECTION: u16 = 0;
pub const HUB_PORT_FEATURE_ENABLE: u16 = 1;
pub const HUB_PORT_FEATURE_SUSPEND: u16 = 2;
pub const HUB_PORT_FEATURE_OVER_CURRENT: u16 = 3;
pub const HUB_PORT_FEATURE_RESET: u16 = 4;
pub const HUB_PORT_FEATURE_POWER: u16 = 8;
pub const HUB_PORT_FEATURE_LOWSPEED: u16 = 9;
pub const HUB_PORT_FEATURE_C_CONNECTION: u16 = 16;
pub const HUB_PORT_FEATURE_C_ENABLE: u16 = 17;
pub const HUB_PORT_FEATURE_C_SUSPEND: u16 = 18;
pub const HUB_PORT_FEATURE_C_OVER_CURRENT: u16 = 19;
pub const HUB_PORT_FEATURE_C_RESET: u16 = 20;
pub const HUB_PORT_FEATURE_TEST: u16 = 21;
pub const HUB_PORT_FEATURE_INDICATOR: u16 = 22;

/// Individual power switching, ganged over-current reporting.
const HUB_W_HUB_CHARACTERISTICS: u16 = 0x0001;
const HUB_DESCRIPTOR_LEN: usize = 9;

/// Hub class requests, encoded as `bmRequestType << 8 | bRequest`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HubRequest {
    ClearHubFeature,
    ClearPortFeature,
    GetHubDescriptor,
    GetHubStatus,
    GetPortStatus,
    SetHubFeature,
    SetPortFeature,
}

impl HubRequest {
    pub const fn type_request(self) -> u16 {
        match self {
            HubRequest::ClearHubFeature => 0x2001,
            HubRequest::ClearPortFeature => 0x2301,
            HubRequest::GetHubDescriptor => 0xa006,
            HubRequest::GetHubStatus => 0xa000,
            HubRequest::GetPortStatus => 0xa300,
            HubRequest::SetHubFeature => 0x2003,
            HubRequest::SetPortFeature => 0x2303,
        }
    }

    pub fn from_type_request(value: u16) -> Option<Self> {
        Some(match value {
            0x2001 => HubRequest::ClearHubFeature,
            0x2301 => HubRequest::ClearPortFeature,
            0xa006 => HubRequest::GetHubDescriptor,
            0xa000 => HubRequest::GetHubStatus,
            0xa300 => HubRequest::GetPortStatus,
            0x2003 => HubRequest::SetHubFeature,
            0x2303 => HubRequest::SetPortFeature,
            _ => return None,
        })
    }
}

impl Controller {
    /// Status-change bitmap of the root hub: bit `n` is set when port `n` (one-based) changed.
    /// Bit 0, the hub itself, never is.
    pub fn hub_status_poll(&self) -> u16 {
        let mut bitmap = 0u16;
        for ix in 0..self.port_count() {
            if self.port_flags(ix).contains(PortFlags::CHANGED) {
                bitmap |= 1 << (ix + 1);
            }
        }
        tracing::trace!(bitmap, "hub status");
        bitmap
    }

    /// Handles one hub class request. `request` is the combined type/request code (see
    /// [`HubRequest::type_request`]); `buf` receives the data stage of IN requests.
    ///
    /// Port requests with `index` outside `1..=port_count` fail with `NoDevice`. Requests and
    /// features the virtual hub has no state for are acknowledged.
    pub fn hub_control(
        &self,
        request: u16,
        value: u16,
        index: u16,
        buf: &mut [u8],
    ) -> HcdResult<()> {
        tracing::trace!(request, value, index, len = buf.len(), "hub control");
        let Some(request) = HubRequest::from_type_request(request) else {
            tracing::debug!(request, "unhandled hub request");
            return Ok(());
        };
        match request {
            HubRequest::ClearHubFeature | HubRequest::SetHubFeature => Ok(()),
            HubRequest::GetHubDescriptor => {
                let [c0, c1] = HUB_W_HUB_CHARACTERISTICS.to_le_bytes();
                let nports = u8::try_from(self.port_count()).unwrap_or(u8::MAX);
                let desc: [u8; HUB_DESCRIPTOR_LEN] =
                    [HUB_DESCRIPTOR_LEN as u8, USB_DESCRIPTOR_TYPE_HUB, nports, c0, c1, 0, 0, 0, 0];
                copy_out(buf, &desc);
                Ok(())
            }
            HubRequest::GetHubStatus => {
                copy_out(buf, &[0; 4]);
                Ok(())
            }
            HubRequest::GetPortStatus => {
                let ix = self.hub_port(index)?;
                let status = {
                    let mut port = self.lock_port_status(ix);
                    port.flags.remove(PortFlags::CHANGED);
                    port.status
                };
                tracing::trace!(port = ix, status, "port status");
                copy_out(buf, &status.to_le_bytes());
                Ok(())
            }
            HubRequest::SetPortFeature => self.set_port_feature(value, index),
            HubRequest::ClearPortFeature => self.clear_port_feature(value, index),
        }
    }

    fn hub_port(&self, index: u16) -> HcdResult<usize> {
        let number = usize::from(index & 0xff);
        if number == 0 || number > self.port_count() {
            return Err(HcdError::NoDevice);
        }
        Ok(number - 1)
    }

    fn set_port_feature(&self, feature: u16, index: u16) -> HcdResult<()> {
        let ix = self.hub_port(index)?;
        match feature {
            HUB_PORT_FEATURE_RESET => {
                let peer = {
                    let mut state = self.lock_state();
                    state.ports[ix].bus_addr = 0;
                    state.ports[ix].peer
                };
                {
                    let mut port = self.lock_port_status(ix);
                    port.status &= !USB_PORT_STAT_RESET;
                    port.status |= USB_PORT_STAT_ENABLE | (USB_PORT_STAT_C_RESET << 16);
                }
                tracing::debug!(port = ix, "port reset");
                if let Some(peer) = peer {
                    self.transport.reset_device(peer);
                }
            }
            HUB_PORT_FEATURE_POWER => {
                self.lock_port_status(ix).status |= USB_PORT_STAT_POWER;
            }
            _ => tracing::trace!(port = ix, feature, "set port feature ignored"),
        }
        Ok(())
    }

    fn clear_port_feature(&self, feature: u16, index: u16) -> HcdResult<()> {
        let ix = self.hub_port(index)?;
        let clear = match feature {
            HUB_PORT_FEATURE_ENABLE => USB_PORT_STAT_ENABLE,
            HUB_PORT_FEATURE_POWER => USB_PORT_STAT_POWER,
            HUB_PORT_FEATURE_C_CONNECTION => USB_PORT_STAT_C_CONNECTION << 16,
            HUB_PORT_FEATURE_C_ENABLE => USB_PORT_STAT_C_ENABLE << 16,
            HUB_PORT_FEATURE_C_RESET => USB_PORT_STAT_C_RESET << 16,
            _ => {
                tracing::trace!(port = ix, feature, "clear port feature ignored");
                return Ok(());
            }
        };
        self.lock_port_status(ix).status &= !clear;
        Ok(())
    }
}

fn copy_out(buf: &mut [u8], data: &[u8]) {
    let len = buf.len().min(data.len());
    buf[..len].copy_from_slice(&data[..len]);
}
