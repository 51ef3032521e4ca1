use crate::{
  class::{Bus, DeviceClass, InterfaceClass},
  correlation::ArrivalWindow,
  error::{PropertyError, StateError},
  identity::Identity,
  transport::PropertyResolver,
};
use once_cell::sync::OnceCell;
use serde::Serialize;
use std::{
  collections::BTreeMap,
  fmt,
  sync::{Arc, Mutex, MutexGuard, PoisonError},
};

/// Derived device properties, resolved on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PropertyKey {
  BusNumber,
  Address,
  VendorId,
  ProductId,
  SerialNumber,
  Manufacturer,
  Product,
}

impl PropertyKey {
  pub fn name(self) -> &'static str {
    match self {
      PropertyKey::BusNumber => "bus-number",
      PropertyKey::Address => "address",
      PropertyKey::VendorId => "vendor-id",
      PropertyKey::ProductId => "product-id",
      PropertyKey::SerialNumber => "serial-number",
      PropertyKey::Manufacturer => "manufacturer",
      PropertyKey::Product => "product",
    }
  }

  /// Parses the textual native form of this property.
  ///
  /// Bus numbers and addresses are decimal, vendor and product ids are
  /// hexadecimal (with or without a `0x` prefix), everything else is text.
  pub fn parse(self, raw: &str) -> Result<PropertyValue, PropertyError> {
    let trimmed = raw.trim();
    let invalid = || PropertyError::Invalid {
      key: self,
      value: raw.into(),
    };

    match self {
      PropertyKey::BusNumber | PropertyKey::Address => trimmed
        .parse::<u32>()
        .map(PropertyValue::Number)
        .map_err(|_| invalid()),
      PropertyKey::VendorId | PropertyKey::ProductId => {
        let digits = trimmed
          .strip_prefix("0x")
          .or_else(|| trimmed.strip_prefix("0X"))
          .unwrap_or(trimmed);
        u16::from_str_radix(digits, 16)
          .map(PropertyValue::Id)
          .map_err(|_| invalid())
      }
      PropertyKey::SerialNumber | PropertyKey::Manufacturer | PropertyKey::Product => {
        if trimmed.is_empty() {
          Err(PropertyError::NotFound(self))
        } else {
          Ok(PropertyValue::Text(trimmed.into()))
        }
      }
    }
  }
}

impl fmt::Display for PropertyKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum PropertyValue {
  Number(u32),
  Id(u16),
  Text(String),
}

impl PropertyValue {
  pub fn into_number(self, key: PropertyKey) -> Result<u32, PropertyError> {
    match self {
      PropertyValue::Number(v) => Ok(v),
      _ => Err(PropertyError::TypeMismatch {
        key,
        expected: "number",
      }),
    }
  }

  pub fn into_id(self, key: PropertyKey) -> Result<u16, PropertyError> {
    match self {
      PropertyValue::Id(v) => Ok(v),
      _ => Err(PropertyError::TypeMismatch { key, expected: "id" }),
    }
  }

  pub fn into_text(self, key: PropertyKey) -> Result<String, PropertyError> {
    match self {
      PropertyValue::Text(v) => Ok(v),
      _ => Err(PropertyError::TypeMismatch {
        key,
        expected: "text",
      }),
    }
  }
}

/// What a transport knows about a device at resolution time.
///
/// `properties` may be pre-filled with values the transport already had at
/// hand; anything missing is fetched through the resolver later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
  pub identity: Identity,
  pub class: DeviceClass,
  pub bus: Bus,
  pub properties: BTreeMap<PropertyKey, PropertyValue>,
}

impl DeviceRecord {
  pub fn new(identity: impl Into<Identity>, class: DeviceClass, bus: Bus) -> Self {
    DeviceRecord {
      identity: identity.into(),
      class,
      bus,
      properties: BTreeMap::new(),
    }
  }

  pub fn with_property(mut self, key: PropertyKey, value: PropertyValue) -> Self {
    self.properties.insert(key, value);
    self
  }
}

/// A resolved interface: its path plus the device owning it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceRecord {
  pub path: Identity,
  pub device: DeviceRecord,
}

struct DeviceInner {
  identity: Identity,
  class: DeviceClass,
  bus: Bus,
  resolver: Arc<dyn PropertyResolver>,
  cache: Mutex<BTreeMap<PropertyKey, PropertyValue>>,
  parent: OnceCell<Device>,
}

/// A physical or logical device node.
///
/// Cheap to clone. Properties are fetched lazily through the transport that
/// produced the device and memoized; failed lookups are not cached.
#[derive(Clone)]
pub struct Device(Arc<DeviceInner>);

impl Device {
  pub fn new(record: DeviceRecord, resolver: Arc<dyn PropertyResolver>) -> Self {
    Device(Arc::new(DeviceInner {
      identity: record.identity,
      class: record.class,
      bus: record.bus,
      resolver,
      cache: Mutex::new(record.properties),
      parent: OnceCell::new(),
    }))
  }

  pub fn identity(&self) -> Identity {
    self.0.identity
  }

  pub fn path(&self) -> &str {
    self.0.identity.as_str()
  }

  pub fn class(&self) -> DeviceClass {
    self.0.class
  }

  pub fn bus(&self) -> Bus {
    self.0.bus
  }

  pub fn property(&self, key: PropertyKey) -> Result<PropertyValue, PropertyError> {
    if let Some(value) = self.cache().get(&key) {
      return Ok(value.clone());
    }

    // The lock is not held across the native lookup.
    let value = self.0.resolver.property(self.0.identity, key)?;
    self.cache().insert(key, value.clone());
    Ok(value)
  }

  pub fn bus_number(&self) -> Result<u32, PropertyError> {
    self
      .property(PropertyKey::BusNumber)?
      .into_number(PropertyKey::BusNumber)
  }

  pub fn address(&self) -> Result<u32, PropertyError> {
    self
      .property(PropertyKey::Address)?
      .into_number(PropertyKey::Address)
  }

  pub fn vendor_id(&self) -> Result<u16, PropertyError> {
    self
      .property(PropertyKey::VendorId)?
      .into_id(PropertyKey::VendorId)
  }

  pub fn product_id(&self) -> Result<u16, PropertyError> {
    self
      .property(PropertyKey::ProductId)?
      .into_id(PropertyKey::ProductId)
  }

  pub fn serial_number(&self) -> Result<String, PropertyError> {
    self
      .property(PropertyKey::SerialNumber)?
      .into_text(PropertyKey::SerialNumber)
  }

  pub fn parent(&self) -> Result<Device, PropertyError> {
    self
      .0
      .parent
      .get_or_try_init(|| {
        let record = self.0.resolver.parent(self.0.identity)?;
        Ok::<_, PropertyError>(Device::new(record, self.0.resolver.clone()))
      })
      .map(Clone::clone)
  }

  /// Nearest ancestor of the given class, not counting this device.
  pub fn up(&self, class: DeviceClass) -> Result<Device, PropertyError> {
    let no_ancestor = |e: PropertyError| match e {
      PropertyError::NoParent => PropertyError::NoAncestor(class),
      e => e,
    };

    let mut current = self.parent().map_err(no_ancestor)?;
    while current.class() != class {
      current = current.parent().map_err(no_ancestor)?;
    }

    Ok(current)
  }

  fn cache(&self) -> MutexGuard<'_, BTreeMap<PropertyKey, PropertyValue>> {
    self.0.cache.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

impl fmt::Debug for Device {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Device")
      .field("identity", &self.0.identity)
      .field("class", &self.0.class)
      .field("bus", &self.0.bus)
      .finish()
  }
}

impl PartialEq for Device {
  fn eq(&self, other: &Device) -> bool {
    self.0.identity == other.0.identity
  }
}

impl Eq for Device {}

struct InterfaceInner {
  path: Identity,
  class: InterfaceClass,
  device: Device,
  window: ArrivalWindow,
}

/// A way of accessing a device, as delivered to listener callbacks.
#[derive(Clone)]
pub struct DeviceInterface(Arc<InterfaceInner>);

impl DeviceInterface {
  /// Builds the interface handed to an arrival callback. Its detach window
  /// is open until the dispatcher closes it.
  pub(crate) fn arriving(
    record: InterfaceRecord,
    class: InterfaceClass,
    resolver: Arc<dyn PropertyResolver>,
  ) -> Self {
    DeviceInterface(Arc::new(InterfaceInner {
      path: record.path,
      class,
      device: Device::new(record.device, resolver),
      window: ArrivalWindow::open(),
    }))
  }

  pub fn identity(&self) -> Identity {
    self.0.path
  }

  pub fn path(&self) -> &str {
    self.0.path.as_str()
  }

  pub fn class(&self) -> InterfaceClass {
    self.0.class
  }

  pub fn device(&self) -> &Device {
    &self.0.device
  }

  /// Registers a callback to run when this interface departs.
  ///
  /// Only valid while the arrival callback that received this interface is
  /// running. Callbacks run on the pump thread, in registration order, before
  /// the listener callback sees the departure.
  pub fn on_detach<F>(&self, callback: F) -> Result<(), StateError>
  where
    F: FnOnce() + Send + 'static,
  {
    self.0.window.register(Box::new(callback))
  }

  pub(crate) fn window(&self) -> &ArrivalWindow {
    &self.0.window
  }
}

impl fmt::Debug for DeviceInterface {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("DeviceInterface")
      .field("path", &self.0.path)
      .field("class", &self.0.class)
      .field("device", &self.0.device)
      .finish()
  }
}
