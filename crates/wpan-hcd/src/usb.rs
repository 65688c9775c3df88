//! USB protocol vocabulary shared by the controller: SETUP packets, endpoint addressing and the
//! descriptor tree the bus core hands us when a configuration or alternate setting is selected.

use serde::{Deserialize, Serialize};

pub const USB_DIR_IN: u8 = 0x80;
pub const USB_ENDPOINT_NUMBER_MASK: u8 = 0x0f;
pub const USB_ENDPOINT_XFERTYPE_MASK: u8 = 0x03;

/// Endpoint numbers per direction.
pub const NUM_ENDPOINTS: usize = 16;

pub const USB_TYPE_MASK: u8 = 0x60;
pub const USB_TYPE_STANDARD: u8 = 0x00;
pub const USB_TYPE_CLASS: u8 = 0x20;
pub const USB_TYPE_VENDOR: u8 = 0x40;

pub const USB_REQUEST_GET_STATUS: u8 = 0x00;
pub const USB_REQUEST_CLEAR_FEATURE: u8 = 0x01;
pub const USB_REQUEST_SET_FEATURE: u8 = 0x03;
pub const USB_REQUEST_SET_ADDRESS: u8 = 0x05;
pub const USB_REQUEST_GET_DESCRIPTOR: u8 = 0x06;
pub const USB_REQUEST_GET_CONFIGURATION: u8 = 0x08;
pub const USB_REQUEST_SET_CONFIGURATION: u8 = 0x09;
pub const USB_REQUEST_GET_INTERFACE: u8 = 0x0a;
pub const USB_REQUEST_SET_INTERFACE: u8 = 0x0b;

pub const USB_DESCRIPTOR_TYPE_DEVICE: u8 = 0x01;
pub const USB_DESCRIPTOR_TYPE_CONFIGURATION: u8 = 0x02;
pub const USB_DESCRIPTOR_TYPE_HUB: u8 = 0x29;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Out,
    In,
}

impl Direction {
    pub fn from_endpoint_address(address: u8) -> Self {
        if address & USB_DIR_IN != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    pub fn is_in(self) -> bool {
        self == Direction::In
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferType {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

impl TransferType {
    /// Decodes the transfer type from an endpoint descriptor's `bmAttributes`.
    pub fn from_attributes(attributes: u8) -> Self {
        match attributes & USB_ENDPOINT_XFERTYPE_MASK {
            0 => TransferType::Control,
            1 => TransferType::Isochronous,
            2 => TransferType::Bulk,
            _ => TransferType::Interrupt,
        }
    }
}

/// Packs an endpoint number and direction into the `bEndpointAddress` encoding.
pub fn endpoint_address(number: u8, direction: Direction) -> u8 {
    let number = number & USB_ENDPOINT_NUMBER_MASK;
    match direction {
        Direction::In => number | USB_DIR_IN,
        Direction::Out => number,
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SetupPacket {
    #[serde(rename = "bmRequestType")]
    pub request_type: u8,
    #[serde(rename = "bRequest")]
    pub request: u8,
    #[serde(rename = "wValue")]
    pub value: u16,
    #[serde(rename = "wIndex")]
    pub index: u16,
    #[serde(rename = "wLength")]
    pub length: u16,
}

impl SetupPacket {
    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Self {
            request_type: bytes[0],
            request: bytes[1],
            value: u16::from_le_bytes([bytes[2], bytes[3]]),
            index: u16::from_le_bytes([bytes[4], bytes[5]]),
            length: u16::from_le_bytes([bytes[6], bytes[7]]),
        }
    }

    pub fn to_bytes(self) -> [u8; 8] {
        let [v0, v1] = self.value.to_le_bytes();
        let [i0, i1] = self.index.to_le_bytes();
        let [l0, l1] = self.length.to_le_bytes();
        [self.request_type, self.request, v0, v1, i0, i1, l0, l1]
    }

    pub fn is_device_to_host(self) -> bool {
        self.request_type & USB_DIR_IN != 0
    }

    pub fn is_standard(self) -> bool {
        self.request_type & USB_TYPE_MASK == USB_TYPE_STANDARD
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    #[serde(rename = "bEndpointAddress")]
    pub address: u8,
    #[serde(rename = "bmAttributes")]
    pub attributes: u8,
    #[serde(rename = "wMaxPacketSize")]
    pub max_packet_size: u16,
    #[serde(rename = "bInterval")]
    pub interval: u8,
}

impl EndpointDescriptor {
    pub fn number(&self) -> u8 {
        self.address & USB_ENDPOINT_NUMBER_MASK
    }

    pub fn direction(&self) -> Direction {
        Direction::from_endpoint_address(self.address)
    }

    pub fn transfer_type(&self) -> TransferType {
        TransferType::from_attributes(self.attributes)
    }
}

/// One alternate setting of an interface.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceAltSetting {
    pub interface_number: u8,
    pub alternate_setting: u8,
    pub endpoints: Vec<EndpointDescriptor>,
}

/// All alternate settings known for one interface number.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceCache {
    pub alt_settings: Vec<InterfaceAltSetting>,
}

impl InterfaceCache {
    pub fn alt_setting(&self, alt: u8) -> Option<&InterfaceAltSetting> {
        self.alt_settings
            .iter()
            .find(|setting| setting.alternate_setting == alt)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigDescriptor {
    pub configuration_value: u8,
    pub interfaces: Vec<InterfaceCache>,
}

impl ConfigDescriptor {
    pub fn num_interfaces(&self) -> usize {
        self.interfaces.len()
    }

    pub fn interface(&self, number: u8) -> Option<&InterfaceCache> {
        self.interfaces.get(usize::from(number))
    }
}

/// Descriptor tree for an enumerated device, owned by the bus core.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsbDeviceTree {
    pub configs: Vec<ConfigDescriptor>,
}

impl UsbDeviceTree {
    /// Looks a configuration up by its `bConfigurationValue`.
    pub fn config(&self, value: u8) -> Option<&ConfigDescriptor> {
        self.configs
            .iter()
            .find(|config| config.configuration_value == value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_packet_byte_layout_is_little_endian() {
        let setup = SetupPacket {
            request_type: 0x80,
            request: USB_REQUEST_GET_DESCRIPTOR,
            value: 0x0200,
            index: 0x0409,
            length: 0x00ff,
        };
        let bytes = setup.to_bytes();
        assert_eq!(bytes, [0x80, 0x06, 0x00, 0x02, 0x09, 0x04, 0xff, 0x00]);
        assert_eq!(SetupPacket::from_bytes(bytes), setup);
        assert!(setup.is_device_to_host());
        assert!(setup.is_standard());
    }

    #[test]
    fn endpoint_descriptor_decodes_address_and_type() {
        let ep = EndpointDescriptor {
            address: 0x83,
            attributes: 0x01,
            max_packet_size: 192,
            interval: 1,
        };
        assert_eq!(ep.number(), 3);
        assert_eq!(ep.direction(), Direction::In);
        assert_eq!(ep.transfer_type(), TransferType::Isochronous);
        assert_eq!(endpoint_address(3, Direction::In), 0x83);
    }
}
