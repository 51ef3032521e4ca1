//! udev transport (Linux).
//!
//! Each watch runs a netlink monitor on its own thread. Devices are addressed
//! by their syspath; interfaces by their device node.

mod monitor;

use crate::{
  bridge::NotificationSink,
  class::{self, Bus, Criteria},
  device::{DeviceRecord, InterfaceRecord, PropertyKey, PropertyValue},
  error::{NativeError, PropertyError, ResolutionError},
  event::RawDevice,
  identity::Identity,
  transport::{PropertyResolver, Transport},
};
use std::{ffi::OsStr, path::Path};
use tokio_udev::{Device, Enumerator};

pub use monitor::UdevWatch;

trait UdevDeviceExt {
  fn hierarchy(&self) -> UdevHierarchy;
}

impl UdevDeviceExt for Device {
  fn hierarchy(&self) -> UdevHierarchy {
    UdevHierarchy(Some(self.clone()))
  }
}

/// The device itself, then each ancestor up to the root.
struct UdevHierarchy(Option<Device>);

impl Iterator for UdevHierarchy {
  type Item = Device;

  fn next(&mut self) -> Option<Self::Item> {
    match self.0.take() {
      None => None,
      Some(d) => {
        self.0 = d.parent();
        Some(d)
      }
    }
  }
}

fn text(value: Option<&OsStr>) -> Option<&str> {
  value.and_then(OsStr::to_str)
}

fn syspath(device: &Device) -> String {
  device.syspath().to_string_lossy().into_owned()
}

/// Copies everything needed later out of a udev device.
///
/// The interface identity is the device node when there is one, the syspath
/// otherwise. Devices without a subsystem are skipped.
fn raw_device(device: &Device) -> Option<RawDevice> {
  let subsystem = text(device.subsystem())?;
  let syspath = syspath(device);
  let identity = match device.devnode() {
    Some(devnode) => devnode.to_string_lossy().into_owned(),
    None => syspath.clone(),
  };

  let mut raw = RawDevice::new(identity)
    .with_class_id(subsystem)
    .with_property(RawDevice::SYSPATH, syspath);
  for property in device.properties() {
    if let (Some(name), Some(value)) = (property.name().to_str(), property.value().to_str()) {
      raw = raw.with_property(name, value);
    }
  }

  if let Some(driver) = text(device.driver()) {
    raw = raw.with_property(RawDevice::DRIVER, driver);
  }

  Some(raw)
}

fn bus_of(device: &Device) -> Bus {
  device
    .hierarchy()
    .find_map(|d| match text(d.subsystem()) {
      Some("usb") => Some(Bus::Usb),
      Some("bluetooth") => Some(Bus::Bluetooth),
      _ => None,
    })
    .unwrap_or(Bus::Unknown)
}

fn record(device: &Device) -> DeviceRecord {
  let class = class::classify_device(
    text(device.subsystem()),
    text(device.devtype()),
    text(device.driver()),
  );

  DeviceRecord::new(syspath(device), class, bus_of(device))
}

fn sysattr(key: PropertyKey) -> &'static str {
  match key {
    PropertyKey::BusNumber => "busnum",
    PropertyKey::Address => "devnum",
    PropertyKey::VendorId => "idVendor",
    PropertyKey::ProductId => "idProduct",
    PropertyKey::SerialNumber => "serial",
    PropertyKey::Manufacturer => "manufacturer",
    PropertyKey::Product => "product",
  }
}

/// Vendor or product id from a `HID_ID` property (`bus:vendor:product`),
/// for HID devices not sitting on a USB device.
fn hid_id(device: &Device, key: PropertyKey) -> Option<&str> {
  let mut parts = text(device.property_value("HID_ID"))?.split(':').skip(1);
  match key {
    PropertyKey::VendorId => parts.next(),
    PropertyKey::ProductId => parts.nth(1),
    _ => None,
  }
}

fn open(path: &str) -> Result<Device, NativeError> {
  Device::from_syspath(Path::new(path)).map_err(NativeError::io("udev_device_new_from_syspath"))
}

/// Transport on top of libudev.
#[derive(Debug, Clone, Copy)]
pub struct UdevTransport {
  _private: (),
}

impl UdevTransport {
  pub fn new() -> Result<Self, NativeError> {
    Enumerator::new().map_err(NativeError::io("udev_enumerate_new"))?;
    Ok(UdevTransport { _private: () })
  }
}

impl PropertyResolver for UdevTransport {
  fn property(&self, device: Identity, key: PropertyKey) -> Result<PropertyValue, PropertyError> {
    let device = open(device.as_str())?;
    let name = sysattr(key);
    for node in device.hierarchy() {
      if let Some(value) = text(node.attribute_value(name)) {
        return key.parse(value);
      }

      if let Some(value) = hid_id(&node, key) {
        return key.parse(value);
      }
    }

    Err(PropertyError::NotFound(key))
  }

  fn parent(&self, device: Identity) -> Result<DeviceRecord, PropertyError> {
    let device = open(device.as_str())?;
    device
      .parent()
      .map(|parent| record(&parent))
      .ok_or(PropertyError::NoParent)
  }
}

impl Transport for UdevTransport {
  type Watch = UdevWatch;

  fn register_watch(
    &self,
    criteria: &'static Criteria,
    sink: NotificationSink,
  ) -> Result<Self::Watch, NativeError> {
    UdevWatch::start(criteria, sink)
  }

  fn unregister_watch(&self, watch: Self::Watch) -> Result<(), NativeError> {
    watch.stop()
  }

  fn enumerate(&self, criteria: &Criteria) -> Result<Vec<RawDevice>, NativeError> {
    let mut enumerator = Enumerator::new().map_err(NativeError::io("udev_enumerate_new"))?;
    enumerator
      .match_subsystem(criteria.subsystem)
      .map_err(NativeError::io("udev_enumerate_add_match_subsystem"))?;
    if let Some(devtype) = criteria.devtype {
      enumerator
        .match_property(RawDevice::DEVTYPE, devtype)
        .map_err(NativeError::io("udev_enumerate_add_match_property"))?;
    }

    let devices = enumerator
      .scan_devices()
      .map_err(NativeError::io("udev_enumerate_scan_devices"))?;

    Ok(devices.filter_map(|device| raw_device(&device)).collect())
  }

  fn resolve(&self, raw: &RawDevice, criteria: &Criteria) -> Result<InterfaceRecord, ResolutionError> {
    let syspath = raw
      .property(RawDevice::SYSPATH)
      .ok_or_else(|| ResolutionError::MissingProperty {
        identity: raw.identity.clone(),
        name: RawDevice::SYSPATH,
      })?;

    let node = Device::from_syspath(Path::new(syspath))
      .map_err(|_| ResolutionError::Vanished(raw.identity.clone()))?;
    if !criteria.matches_node(text(node.subsystem()), text(node.devtype())) {
      return Err(ResolutionError::Mismatch(raw.identity.clone()));
    }

    let device = if criteria.interface_only {
      node
        .parent()
        .ok_or_else(|| ResolutionError::NoParent(raw.identity.clone()))?
    } else {
      node
    };

    if !criteria.matches_driver(text(device.driver())) {
      return Err(ResolutionError::Mismatch(raw.identity.clone()));
    }

    Ok(InterfaceRecord {
      path: Identity::new(&raw.identity),
      device: record(&device),
    })
  }
}
