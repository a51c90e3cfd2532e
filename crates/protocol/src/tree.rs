//! Descriptor tree
//!
//! Device → Configuration[] → Interface[] → AlternateSetting[] → Endpoint[].
//!
//! A configuration is parsed from the single wTotalLength-byte fetch that
//! returns it together with all of its interface, endpoint and
//! class-specific descriptors. Keys are unique at every level.

use crate::bits::EndpointAddress;
use crate::descriptor::{
    ConfigurationDescriptor, DescriptorType, DeviceDescriptor, EndpointDescriptor,
    InterfaceDescriptor,
};
use crate::error::{ProtocolError, Result};
use std::collections::HashSet;

/// One alternate setting of an interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlternateSetting {
    pub descriptor: InterfaceDescriptor,
    pub endpoints: Vec<EndpointDescriptor>,
    /// Class-specific descriptors following the interface descriptor, verbatim
    pub extra: Vec<u8>,
}

impl AlternateSetting {
    pub fn number(&self) -> u8 {
        self.descriptor.alternate_setting
    }

    pub fn endpoint(&self, address: EndpointAddress) -> Option<&EndpointDescriptor> {
        self.endpoints.iter().find(|ep| ep.address == address)
    }
}

/// All alternate settings sharing an interface number
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    number: u8,
    settings: Vec<AlternateSetting>,
}

impl Interface {
    pub fn number(&self) -> u8 {
        self.number
    }

    pub fn settings(&self) -> &[AlternateSetting] {
        &self.settings
    }

    pub fn setting(&self, alternate: u8) -> Option<&AlternateSetting> {
        self.settings.iter().find(|s| s.number() == alternate)
    }
}

/// A parsed configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Configuration {
    descriptor: ConfigurationDescriptor,
    interfaces: Vec<Interface>,
    /// Descriptors between the header and the first interface (e.g. OTG)
    extra: Vec<u8>,
}

impl Configuration {
    /// Parse a full configuration fetch
    pub fn parse(data: &[u8]) -> Result<Self> {
        let descriptor = ConfigurationDescriptor::parse(data)?;
        let declared = descriptor.total_length() as usize;
        if declared != data.len() {
            return Err(ProtocolError::TotalLengthMismatch {
                declared,
                actual: data.len(),
            });
        }

        let mut settings: Vec<AlternateSetting> = Vec::new();
        let mut extra = Vec::new();
        let mut offset = data[0] as usize;

        while offset < data.len() {
            let length = data[offset];
            let end = offset + length as usize;
            if length < 2 || end > data.len() {
                return Err(ProtocolError::InvalidDescriptorLength { length, offset });
            }
            let chunk = &data[offset..end];

            match DescriptorType::from_code(chunk[1]) {
                DescriptorType::Interface => {
                    let interface = InterfaceDescriptor::parse(chunk)?;
                    if settings.iter().any(|s| s.descriptor.key() == interface.key()) {
                        return Err(ProtocolError::DuplicateKey {
                            kind: "interface setting",
                            key: format!("{}/{}", interface.number, interface.alternate_setting),
                        });
                    }
                    settings.push(AlternateSetting {
                        descriptor: interface,
                        endpoints: Vec::new(),
                        extra: Vec::new(),
                    });
                }
                DescriptorType::Endpoint => {
                    let endpoint = EndpointDescriptor::parse(chunk)?;
                    let setting = settings.last_mut().ok_or_else(|| {
                        ProtocolError::Violation(format!(
                            "endpoint {} precedes any interface descriptor",
                            endpoint.address
                        ))
                    })?;
                    if setting.endpoint(endpoint.address).is_some() {
                        return Err(ProtocolError::DuplicateKey {
                            kind: "endpoint",
                            key: endpoint.address.to_string(),
                        });
                    }
                    setting.endpoints.push(endpoint);
                }
                _ => match settings.last_mut() {
                    Some(setting) => setting.extra.extend_from_slice(chunk),
                    None => extra.extend_from_slice(chunk),
                },
            }
            offset = end;
        }

        for setting in &settings {
            let declared = setting.descriptor.num_endpoints as usize;
            if setting.endpoints.len() != declared {
                return Err(ProtocolError::ChildCountMismatch {
                    parent: "interface setting",
                    child: "endpoints",
                    declared,
                    actual: setting.endpoints.len(),
                });
            }
        }

        let mut interfaces: Vec<Interface> = Vec::new();
        for setting in settings {
            let number = setting.descriptor.number;
            match interfaces.iter_mut().find(|i| i.number == number) {
                Some(interface) => interface.settings.push(setting),
                None => interfaces.push(Interface {
                    number,
                    settings: vec![setting],
                }),
            }
        }

        let declared = descriptor.num_interfaces() as usize;
        if interfaces.len() != declared {
            return Err(ProtocolError::ChildCountMismatch {
                parent: "configuration",
                child: "interfaces",
                declared,
                actual: interfaces.len(),
            });
        }

        Ok(Self {
            descriptor,
            interfaces,
            extra,
        })
    }

    pub fn descriptor(&self) -> &ConfigurationDescriptor {
        &self.descriptor
    }

    pub fn value(&self) -> u8 {
        self.descriptor.value()
    }

    pub fn interfaces(&self) -> &[Interface] {
        &self.interfaces
    }

    pub fn interface(&self, number: u8) -> Option<&Interface> {
        self.interfaces.iter().find(|i| i.number == number)
    }

    pub fn extra(&self) -> &[u8] {
        &self.extra
    }
}

/// Device descriptor with every configuration it declares
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorTree {
    device: DeviceDescriptor,
    configurations: Vec<Configuration>,
}

impl DescriptorTree {
    /// The device's bNumConfigurations fixes the exact child count
    pub fn new(device: DeviceDescriptor, configurations: Vec<Configuration>) -> Result<Self> {
        let declared = device.num_configurations as usize;
        if configurations.len() != declared {
            return Err(ProtocolError::ChildCountMismatch {
                parent: "device",
                child: "configurations",
                declared,
                actual: configurations.len(),
            });
        }
        let mut seen = HashSet::new();
        for config in &configurations {
            if !seen.insert(config.value()) {
                return Err(ProtocolError::DuplicateKey {
                    kind: "configuration",
                    key: config.value().to_string(),
                });
            }
        }
        Ok(Self {
            device,
            configurations,
        })
    }

    pub fn device(&self) -> &DeviceDescriptor {
        &self.device
    }

    pub fn configurations(&self) -> &[Configuration] {
        &self.configurations
    }

    /// Look up by bConfigurationValue (0 never matches)
    pub fn configuration(&self, value: u8) -> Option<&Configuration> {
        self.configurations.iter().find(|c| c.value() == value)
    }

    pub fn contains_configuration(&self, value: u8) -> bool {
        self.configuration(value).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// One configuration, interface 0 with two alternate settings, a HID
    /// class descriptor and two endpoints on the second setting
    fn sample_config() -> Vec<u8> {
        let mut bytes = vec![
            0x09, 0x02, 0x00, 0x00, 0x01, 0x01, 0x00, 0x80, 0x32, // config
            0x09, 0x04, 0x00, 0x00, 0x00, 0x03, 0x00, 0x00, 0x00, // if 0 alt 0
            0x09, 0x04, 0x00, 0x01, 0x02, 0x03, 0x00, 0x00, 0x00, // if 0 alt 1
            0x09, 0x21, 0x11, 0x01, 0x00, 0x01, 0x22, 0x3F, 0x00, // HID
            0x07, 0x05, 0x81, 0x03, 0x08, 0x00, 0x0A, // ep 0x81 interrupt
            0x07, 0x05, 0x02, 0x03, 0x08, 0x00, 0x0A, // ep 0x02 interrupt
        ];
        let total = bytes.len() as u16;
        bytes[2..4].copy_from_slice(&total.to_le_bytes());
        bytes
    }

    #[test]
    fn test_parse_configuration_tree() {
        let config = Configuration::parse(&sample_config()).unwrap();
        assert_eq!(config.value(), 1);
        assert_eq!(config.interfaces().len(), 1);

        let interface = config.interface(0).unwrap();
        assert_eq!(interface.settings().len(), 2);
        assert!(interface.setting(0).unwrap().endpoints.is_empty());

        let alt1 = interface.setting(1).unwrap();
        assert_eq!(alt1.endpoints.len(), 2);
        assert_eq!(alt1.extra.len(), 9);
        assert!(alt1.endpoint(EndpointAddress::from_byte(0x81)).is_some());
        assert!(alt1.endpoint(EndpointAddress::from_byte(0x82)).is_none());
    }

    #[test]
    fn test_total_length_mismatch() {
        let mut bytes = sample_config();
        bytes.push(0x00);
        assert!(matches!(
            Configuration::parse(&bytes),
            Err(ProtocolError::TotalLengthMismatch { .. })
        ));
    }

    #[test]
    fn test_endpoint_count_mismatch() {
        let mut bytes = sample_config();
        bytes.truncate(bytes.len() - 7);
        let total = bytes.len() as u16;
        bytes[2..4].copy_from_slice(&total.to_le_bytes());
        assert!(matches!(
            Configuration::parse(&bytes),
            Err(ProtocolError::ChildCountMismatch {
                child: "endpoints",
                declared: 2,
                actual: 1,
                ..
            })
        ));
    }

    #[test]
    fn test_duplicate_interface_setting() {
        let mut bytes = sample_config();
        // Relabel alt 1 as alt 0
        bytes[21] = 0x00;
        assert!(matches!(
            Configuration::parse(&bytes),
            Err(ProtocolError::DuplicateKey { .. })
        ));
    }

    #[test]
    fn test_truncated_descriptor_in_walk() {
        let mut bytes = sample_config();
        let last = bytes.len() - 7;
        bytes[last] = 0x20;
        assert!(matches!(
            Configuration::parse(&bytes),
            Err(ProtocolError::InvalidDescriptorLength { .. })
        ));
    }

    #[test]
    fn test_tree_enforces_configuration_count() {
        let device = DeviceDescriptor {
            usb_version: crate::descriptor::BcdVersion(0x0200),
            class: 0,
            subclass: 0,
            protocol: 0,
            max_packet_size0: 64,
            vendor_id: 0x1234,
            product_id: 0x5678,
            device_version: crate::descriptor::BcdVersion(0x0100),
            manufacturer_index: 0,
            product_index: 0,
            serial_number_index: 0,
            num_configurations: 2,
        };
        let config = Configuration::parse(&sample_config()).unwrap();
        assert!(matches!(
            DescriptorTree::new(device, vec![config.clone()]),
            Err(ProtocolError::ChildCountMismatch { .. })
        ));
        assert!(matches!(
            DescriptorTree::new(device, vec![config.clone(), config.clone()]),
            Err(ProtocolError::DuplicateKey { .. })
        ));

        let single = DeviceDescriptor {
            num_configurations: 1,
            ..device
        };
        let tree = DescriptorTree::new(single, vec![config]).unwrap();
        assert!(tree.contains_configuration(1));
        assert!(!tree.contains_configuration(0));
    }
}
