use super::args::Output;
use hotplug::{Bus, DeviceClass, DeviceInterface, InterfaceClass};
use serde::Serialize;
use std::fmt;

/// One line of output for an arrival or departure.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
  pub event: &'static str,
  pub path: String,
  pub class: InterfaceClass,
  pub device: String,
  pub device_class: DeviceClass,
  pub bus: Bus,
  pub bus_number: Option<u32>,
  pub address: Option<u32>,
  pub vendor_id: Option<u16>,
  pub product_id: Option<u16>,
  pub serial_number: Option<String>,
}

impl Report {
  pub fn new(iface: &DeviceInterface, arrived: bool) -> Self {
    let device = iface.device();
    Report {
      event: if arrived { "arrive" } else { "depart" },
      path: iface.path().to_string(),
      class: iface.class(),
      device: device.path().to_string(),
      device_class: device.class(),
      bus: device.bus(),
      bus_number: device.bus_number().ok(),
      address: device.address().ok(),
      vendor_id: device.vendor_id().ok(),
      product_id: device.product_id().ok(),
      serial_number: device.serial_number().ok(),
    }
  }

  pub fn render(&self, output: Output) -> String {
    match output {
      Output::Text => self.to_string(),
      Output::Json => serde_json::to_string(self).unwrap_or_else(|_| self.to_string()),
    }
  }
}

struct Or<T>(Option<T>);

impl fmt::Display for Or<u32> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self.0 {
      Some(v) => write!(f, "{}", v),
      None => f.write_str("-"),
    }
  }
}

impl fmt::Display for Or<u16> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self.0 {
      Some(v) => write!(f, "{:04x}", v),
      None => f.write_str("-"),
    }
  }
}

impl fmt::Display for Report {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "{} bus={} address={} vid={} pid={} path={}",
      self.event,
      Or(self.bus_number),
      Or(self.address),
      Or(self.vendor_id),
      Or(self.product_id),
      self.path
    )
  }
}
