//! Static class registry.
//!
//! Maps the logical device and interface classes onto the native criteria each
//! platform filters on. The tables are built once on first use and are never
//! mutated afterwards.

use crate::error::ConfigurationError;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, str::FromStr};

/// A way of accessing a device (a device file, a symbolic link, ...).
///
/// Listeners watch interface classes; one native watch is registered per class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InterfaceClass {
  Hid,
  Printer,
  UsbDevice,
  Unknown,
}

/// Semantic category of the hardware node behind an interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceClass {
  Hid,
  Printer,
  UsbDevice,
  UsbInterface,
  Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Bus {
  Usb,
  Bluetooth,
  Unknown,
}

macro_rules! class_names {
  ($ty:ident { $($case:ident => $name:literal),+ $(,)? }) => {
    impl $ty {
      pub const ALL: &'static [$ty] = &[$($ty::$case,)+];

      pub fn name(self) -> &'static str {
        match self {
          $($ty::$case => $name,)+
        }
      }
    }

    impl fmt::Display for $ty {
      fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
      }
    }

    impl FromStr for $ty {
      type Err = ConfigurationError;

      fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
          $($name => Ok($ty::$case),)+
          _ => Err(ConfigurationError::UnknownName {
            kind: stringify!($ty),
            name: s.into(),
          }),
        }
      }
    }
  };
}

class_names!(InterfaceClass {
  Hid => "hid",
  Printer => "printer",
  UsbDevice => "usb-device",
  Unknown => "unknown",
});

class_names!(DeviceClass {
  Hid => "hid",
  Printer => "printer",
  UsbDevice => "usb-device",
  UsbInterface => "usb-interface",
  Unknown => "unknown",
});

class_names!(Bus {
  Usb => "usb",
  Bluetooth => "bluetooth",
  Unknown => "unknown",
});

/// A Windows class GUID, stored as its 128-bit value.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClassGuid(u128);

impl ClassGuid {
  pub const fn from_u128(value: u128) -> Self {
    ClassGuid(value)
  }

  pub const fn to_u128(self) -> u128 {
    self.0
  }
}

impl fmt::Display for ClassGuid {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let v = self.0;
    write!(
      f,
      "{{{:08X}-{:04X}-{:04X}-{:04X}-{:012X}}}",
      (v >> 96) as u32,
      (v >> 80) as u16,
      (v >> 64) as u16,
      (v >> 48) as u16,
      v & 0xFFFF_FFFF_FFFF
    )
  }
}

impl fmt::Debug for ClassGuid {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    fmt::Display::fmt(self, f)
  }
}

impl FromStr for ClassGuid {
  type Err = ConfigurationError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let invalid = || ConfigurationError::InvalidGuid(s.into());
    let trimmed = s.trim_start_matches('{').trim_end_matches('}');
    let groups = trimmed.split('-').collect::<Vec<_>>();
    let widths = [8, 4, 4, 4, 12];
    if groups.len() != widths.len() {
      return Err(invalid());
    }

    let mut value = 0u128;
    for (group, width) in groups.iter().zip(widths.iter()) {
      if group.len() != *width || !group.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(invalid());
      }

      let part = u64::from_str_radix(group, 16).map_err(|_| invalid())?;
      value = (value << (width * 4)) | part as u128;
    }

    Ok(ClassGuid(value))
  }
}

/// Native matching criteria for one class.
///
/// Linux backends use the udev fields, Windows backends use `guid`. A field a
/// backend cannot use is simply ignored by it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Criteria {
  pub subsystem: &'static str,
  pub devtype: Option<&'static str>,
  pub driver: Option<&'static str>,

  /// The matched node is only an interface; its device is the parent node.
  pub interface_only: bool,

  pub guid: Option<ClassGuid>,
}

impl Criteria {
  const fn subsystem(subsystem: &'static str) -> Self {
    Criteria {
      subsystem,
      devtype: None,
      driver: None,
      interface_only: false,
      guid: None,
    }
  }

  const fn devtype(mut self, devtype: &'static str) -> Self {
    self.devtype = Some(devtype);
    self
  }

  const fn driver(mut self, driver: &'static str) -> Self {
    self.driver = Some(driver);
    self
  }

  const fn interface_only(mut self) -> Self {
    self.interface_only = true;
    self
  }

  const fn guid(mut self, guid: u128) -> Self {
    self.guid = Some(ClassGuid::from_u128(guid));
    self
  }

  /// Checks the node-level part of the criteria (subsystem and device type).
  ///
  /// Driver checks apply to the device node, which for interface-only classes
  /// is the parent; callers handle that half.
  pub fn matches_node(&self, subsystem: Option<&str>, devtype: Option<&str>) -> bool {
    if subsystem != Some(self.subsystem) {
      return false;
    }

    match self.devtype {
      None => true,
      Some(expected) => devtype == Some(expected),
    }
  }

  pub fn matches_driver(&self, driver: Option<&str>) -> bool {
    match self.driver {
      None => true,
      Some(expected) => driver == Some(expected),
    }
  }
}

// GUID_DEVINTERFACE_HID
const GUID_DEVINTERFACE_HID: u128 = 0x4D1E55B2_F16F_11CF_88CB_001111000030;
// GUID_DEVINTERFACE_USBPRINT
const GUID_DEVINTERFACE_PRINTER: u128 = 0x28D78FAD_5A12_11D1_AE5B_0000F803A8C2;
// GUID_DEVINTERFACE_USB_DEVICE
const GUID_DEVINTERFACE_USB_DEVICE: u128 = 0xA5DCBF10_6530_11D2_901F_00C04FB951ED;

const GUID_DEVCLASS_HIDCLASS: u128 = 0x745A17A0_74D3_11D0_B6FE_00A0C90F57DA;
const GUID_DEVCLASS_PRINTER: u128 = 0x4D36E979_E325_11CE_BFC1_08002BE10318;
const GUID_DEVCLASS_USB: u128 = 0x36FC9E60_C465_11CF_8056_444553540000;
const GUID_DEVCLASS_USBDEVICE: u128 = 0x88BAE032_5A81_49F0_BC3D_A4FF138216D6;

static INTERFACE_CLASSES: Lazy<BTreeMap<InterfaceClass, Criteria>> = Lazy::new(|| {
  let mut map = BTreeMap::new();
  map.insert(
    InterfaceClass::Hid,
    Criteria::subsystem("hidraw")
      .interface_only()
      .guid(GUID_DEVINTERFACE_HID),
  );
  map.insert(
    InterfaceClass::Printer,
    Criteria::subsystem("usbmisc")
      .driver("usblp")
      .interface_only()
      .guid(GUID_DEVINTERFACE_PRINTER),
  );
  map.insert(
    InterfaceClass::UsbDevice,
    Criteria::subsystem("usb")
      .devtype("usb_device")
      .guid(GUID_DEVINTERFACE_USB_DEVICE),
  );
  map
});

// Scanned in order, first match wins: printers are usb interfaces bound to usblp.
static DEVICE_CLASSES: Lazy<Vec<(DeviceClass, Criteria)>> = Lazy::new(|| {
  vec![
    (
      DeviceClass::Hid,
      Criteria::subsystem("hid").guid(GUID_DEVCLASS_HIDCLASS),
    ),
    (
      DeviceClass::UsbDevice,
      Criteria::subsystem("usb")
        .devtype("usb_device")
        .guid(GUID_DEVCLASS_USBDEVICE),
    ),
    (
      DeviceClass::Printer,
      Criteria::subsystem("usb")
        .devtype("usb_interface")
        .driver("usblp")
        .guid(GUID_DEVCLASS_PRINTER),
    ),
    (
      DeviceClass::UsbInterface,
      Criteria::subsystem("usb")
        .devtype("usb_interface")
        .guid(GUID_DEVCLASS_USB),
    ),
  ]
});

static INTERFACE_GUIDS: Lazy<BTreeMap<ClassGuid, InterfaceClass>> = Lazy::new(|| {
  INTERFACE_CLASSES
    .iter()
    .filter_map(|(class, criteria)| criteria.guid.map(|guid| (guid, *class)))
    .collect()
});

/// Looks up the native criteria for an interface class.
pub fn resolve(class: InterfaceClass) -> Result<&'static Criteria, ConfigurationError> {
  INTERFACE_CLASSES
    .get(&class)
    .ok_or(ConfigurationError::UnsupportedClass(class))
}

pub fn device_criteria(class: DeviceClass) -> Option<&'static Criteria> {
  DEVICE_CLASSES
    .iter()
    .find(|(c, _)| *c == class)
    .map(|(_, criteria)| criteria)
}

/// Classifies a device node by its udev-style attributes.
pub fn classify_device(
  subsystem: Option<&str>,
  devtype: Option<&str>,
  driver: Option<&str>,
) -> DeviceClass {
  DEVICE_CLASSES
    .iter()
    .find(|(_, c)| c.matches_node(subsystem, devtype) && c.matches_driver(driver))
    .map(|(class, _)| *class)
    .unwrap_or(DeviceClass::Unknown)
}

pub fn interface_class_for_guid(guid: ClassGuid) -> InterfaceClass {
  INTERFACE_GUIDS
    .get(&guid)
    .copied()
    .unwrap_or(InterfaceClass::Unknown)
}

pub fn device_class_for_guid(guid: ClassGuid) -> DeviceClass {
  DEVICE_CLASSES
    .iter()
    .find(|(_, c)| c.guid == Some(guid))
    .map(|(class, _)| *class)
    .unwrap_or(DeviceClass::Unknown)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn every_known_interface_class_is_mapped() {
    for class in InterfaceClass::ALL {
      match class {
        InterfaceClass::Unknown => assert!(resolve(*class).is_err()),
        _ => assert!(resolve(*class).is_ok(), "{} is unmapped", class),
      }
    }
  }

  #[test]
  fn unknown_class_is_a_configuration_error() {
    match resolve(InterfaceClass::Unknown) {
      Err(ConfigurationError::UnsupportedClass(InterfaceClass::Unknown)) => (),
      other => panic!("unexpected result: {:?}", other),
    }
  }

  #[test]
  fn classify_prefers_printer_over_plain_interface() {
    assert_eq!(
      classify_device(Some("usb"), Some("usb_interface"), Some("usblp")),
      DeviceClass::Printer
    );
    assert_eq!(
      classify_device(Some("usb"), Some("usb_interface"), Some("usbhid")),
      DeviceClass::UsbInterface
    );
    assert_eq!(classify_device(Some("hid"), None, None), DeviceClass::Hid);
    assert_eq!(
      classify_device(Some("block"), Some("disk"), None),
      DeviceClass::Unknown
    );
  }

  #[test]
  fn guid_text_form() {
    let guid = ClassGuid::from_u128(GUID_DEVINTERFACE_HID);
    assert_eq!(guid.to_string(), "{4D1E55B2-F16F-11CF-88CB-001111000030}");
    assert_eq!(guid.to_string().parse::<ClassGuid>().unwrap(), guid);
    assert_eq!(
      "4d1e55b2-f16f-11cf-88cb-001111000030".parse::<ClassGuid>().unwrap(),
      guid
    );
    assert!("4d1e55b2-f16f".parse::<ClassGuid>().is_err());
  }

  #[test]
  fn guid_groups_are_plain_hex() {
    assert!("{+D1E55B2-F16F-11CF-88CB-001111000030}"
      .parse::<ClassGuid>()
      .is_err());
    assert!("4D1E55B2-+16F-11CF-88CB-001111000030"
      .parse::<ClassGuid>()
      .is_err());
    assert!("4D1E55B2-F16F-11CF-88CB-00111100003G"
      .parse::<ClassGuid>()
      .is_err());
  }

  #[test]
  fn device_criteria_follow_the_classification_table() {
    let printer = device_criteria(DeviceClass::Printer).unwrap();
    assert_eq!(printer.subsystem, "usb");
    assert_eq!(printer.devtype, Some("usb_interface"));
    assert_eq!(printer.driver, Some("usblp"));
    assert_eq!(
      classify_device(Some(printer.subsystem), printer.devtype, printer.driver),
      DeviceClass::Printer
    );
    assert_eq!(
      device_criteria(DeviceClass::Hid).and_then(|c| c.guid),
      Some(ClassGuid::from_u128(GUID_DEVCLASS_HIDCLASS))
    );
    assert!(device_criteria(DeviceClass::Unknown).is_none());
  }

  #[test]
  fn guid_reverse_lookup() {
    let printer = resolve(InterfaceClass::Printer).unwrap().guid.unwrap();
    assert_eq!(interface_class_for_guid(printer), InterfaceClass::Printer);
    assert_eq!(
      interface_class_for_guid(ClassGuid::from_u128(0)),
      InterfaceClass::Unknown
    );
    assert_eq!(
      device_class_for_guid(ClassGuid::from_u128(GUID_DEVCLASS_HIDCLASS)),
      DeviceClass::Hid
    );
  }

  #[test]
  fn names_round_trip() {
    for class in DeviceClass::ALL {
      assert_eq!(class.name().parse::<DeviceClass>().unwrap(), *class);
    }
    assert!("floppy".parse::<Bus>().is_err());
  }
}
