//! rusb device backend
//!
//! Enumerates attached devices through a libusb context. A device qualifies
//! when its active configuration has a vendor-specific (class 0xFF) interface
//! with both a bulk IN and a bulk OUT endpoint.

use super::channel::RusbChannel;
use super::transfers::{is_in_endpoint, map_rusb_error};
use bulk::{
    AllowedDeviceId, AttachedDevice, BulkEndpoints, ChannelError, DeviceKey, DeviceStrings,
    UsbBackend,
};
use rusb::{Context, Device, DeviceHandle, TransferType, UsbContext};
use tracing::{debug, warn};

/// Interface class code for vendor-specific interfaces
const VENDOR_SPECIFIC_CLASS: u8 = 0xff;

/// Linux Foundation vendor ID used by root hubs
const ROOT_HUB_VENDOR_ID: u16 = 0x1d6b;

/// Hub device class
const HUB_CLASS: u8 = 9;

/// Endpoint fields needed to pick the bulk pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointInfo {
    pub address: u8,
    pub transfer_type: TransferType,
    pub max_packet_size: u16,
}

/// Pick the first bulk IN and first bulk OUT endpoint
pub fn pick_bulk_pair(endpoints: &[EndpointInfo]) -> Option<BulkEndpoints> {
    let bulk = endpoints
        .iter()
        .filter(|ep| ep.transfer_type == TransferType::Bulk);
    let ep_in = bulk.clone().find(|ep| is_in_endpoint(ep.address))?;
    let ep_out = bulk.clone().find(|ep| !is_in_endpoint(ep.address))?;

    Some(BulkEndpoints {
        in_address: ep_in.address,
        out_address: ep_out.address,
        max_packet_in: ep_in.max_packet_size,
        max_packet_out: ep_out.max_packet_size,
    })
}

/// Host USB stack accessed through libusb
pub struct RusbBackend {
    context: Context,
}

impl RusbBackend {
    /// Create a backend with its own libusb context
    pub fn new() -> common::Result<Self> {
        let context =
            Context::new().map_err(|e| common::Error::Usb(format!("libusb init failed: {}", e)))?;
        Ok(Self { context })
    }

    /// Find the bulk interface of a device
    fn bulk_interface(device: &Device<Context>) -> Option<(u8, BulkEndpoints)> {
        let config = match device.active_config_descriptor() {
            Ok(config) => config,
            Err(e) => {
                debug!(
                    "No active configuration on bus={}, addr={}: {}",
                    device.bus_number(),
                    device.address(),
                    e
                );
                return None;
            }
        };

        for interface in config.interfaces() {
            for desc in interface.descriptors() {
                if desc.class_code() != VENDOR_SPECIFIC_CLASS {
                    continue;
                }
                let endpoints: Vec<EndpointInfo> = desc
                    .endpoint_descriptors()
                    .map(|ep| EndpointInfo {
                        address: ep.address(),
                        transfer_type: ep.transfer_type(),
                        max_packet_size: ep.max_packet_size(),
                    })
                    .collect();
                if let Some(pair) = pick_bulk_pair(&endpoints) {
                    return Some((desc.interface_number(), pair));
                }
            }
        }
        None
    }

    /// Look up the live rusb device behind an attached device
    fn find_device(&self, key: DeviceKey) -> Result<Device<Context>, ChannelError> {
        let devices = self.context.devices().map_err(map_rusb_error)?;
        devices
            .iter()
            .find(|d| d.bus_number() == key.bus && d.address() == key.address)
            .ok_or(ChannelError::NoDevice)
    }

    fn open(&self, key: DeviceKey) -> Result<(Device<Context>, DeviceHandle<Context>), ChannelError> {
        let device = self.find_device(key)?;
        let handle = device.open().map_err(|e| {
            warn!(
                "Failed to open device bus={}, addr={}: {}",
                key.bus, key.address, e
            );
            map_rusb_error(e)
        })?;
        Ok((device, handle))
    }
}

impl UsbBackend for RusbBackend {
    type Channel = RusbChannel;

    fn scan(&self, allowed: &[AllowedDeviceId]) -> Result<Vec<AttachedDevice>, ChannelError> {
        let devices = self.context.devices().map_err(map_rusb_error)?;
        let mut found = Vec::new();

        for device in devices.iter() {
            let bus = device.bus_number();
            let address = device.address();
            let desc = match device.device_descriptor() {
                Ok(desc) => desc,
                Err(e) => {
                    debug!("Skipping bus={}, addr={}: {}", bus, address, e);
                    continue;
                }
            };

            if desc.vendor_id() == ROOT_HUB_VENDOR_ID && desc.class_code() == HUB_CLASS {
                continue;
            }

            let identity = AllowedDeviceId::new(desc.vendor_id(), desc.product_id());
            if !allowed.is_empty() && !allowed.contains(&identity) {
                continue;
            }

            let Some((interface, endpoints)) = Self::bulk_interface(&device) else {
                debug!(
                    "Device {} on bus={}, addr={} has no vendor bulk interface",
                    identity, bus, address
                );
                continue;
            };

            found.push(AttachedDevice {
                key: DeviceKey {
                    bus,
                    address,
                    interface,
                },
                vendor_id: desc.vendor_id(),
                product_id: desc.product_id(),
                endpoints,
            });
        }

        debug!("Scan found {} bulk device(s)", found.len());
        Ok(found)
    }

    fn strings(&self, device: &AttachedDevice) -> Result<DeviceStrings, ChannelError> {
        let (usb_device, handle) = self.open(device.key)?;
        let desc = usb_device.device_descriptor().map_err(map_rusb_error)?;

        let read = |index: Option<u8>| {
            index
                .and_then(|idx| handle.read_string_descriptor_ascii(idx).ok())
                .unwrap_or_default()
        };

        Ok(DeviceStrings {
            manufacturer: read(desc.manufacturer_string_index()),
            product: read(desc.product_string_index()),
            serial_number: read(desc.serial_number_string_index()),
        })
    }

    fn claim(&self, device: &AttachedDevice) -> Result<RusbChannel, ChannelError> {
        let (_, handle) = self.open(device.key)?;
        RusbChannel::claim(handle, device.key.interface, device.endpoints).map_err(map_rusb_error)
    }
}
