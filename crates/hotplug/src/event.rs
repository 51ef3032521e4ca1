use std::{collections::BTreeMap, fmt};

/// Native action attached to a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
  Add,
  Remove,
  Change,
  Bind,
  Unbind,
  Unknown,
}

impl Action {
  pub fn name(self) -> &'static str {
    match self {
      Action::Add => "add",
      Action::Remove => "remove",
      Action::Change => "change",
      Action::Bind => "bind",
      Action::Unbind => "unbind",
      Action::Unknown => "unknown",
    }
  }

  /// Turns a notification into a raw event, or `None` for actions the pump
  /// does not care about.
  pub fn classify(self, device: RawDevice) -> Option<RawEvent> {
    match self {
      Action::Add => Some(RawEvent::Arrive(device)),
      Action::Remove => Some(RawEvent::Depart(device)),
      Action::Change | Action::Bind | Action::Unbind | Action::Unknown => None,
    }
  }
}

impl fmt::Display for Action {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}

impl<'a> From<&'a str> for Action {
  fn from(action: &'a str) -> Self {
    match action {
      "add" => Action::Add,
      "remove" => Action::Remove,
      "change" => Action::Change,
      "bind" => Action::Bind,
      "unbind" => Action::Unbind,
      _ => Action::Unknown,
    }
  }
}

#[cfg(target_os = "linux")]
impl From<tokio_udev::EventType> for Action {
  fn from(event_type: tokio_udev::EventType) -> Self {
    match event_type {
      tokio_udev::EventType::Add => Action::Add,
      tokio_udev::EventType::Remove => Action::Remove,
      tokio_udev::EventType::Change => Action::Change,
      tokio_udev::EventType::Bind => Action::Bind,
      tokio_udev::EventType::Unbind => Action::Unbind,
      tokio_udev::EventType::Unknown => Action::Unknown,
    }
  }
}

/// Process-owned copy of what the native layer reported about one node.
///
/// `identity` is the interface path (a device node or a symbolic link),
/// `class_id` the class identifier embedded in the notification (a udev
/// subsystem or a Windows interface class GUID) and `properties` whatever
/// else the backend copied out of the native buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDevice {
  pub identity: String,
  pub class_id: Option<String>,
  pub properties: BTreeMap<String, String>,
}

impl RawDevice {
  pub const SYSPATH: &'static str = "SYSPATH";
  pub const SUBSYSTEM: &'static str = "SUBSYSTEM";
  pub const DEVTYPE: &'static str = "DEVTYPE";
  pub const DRIVER: &'static str = "DRIVER";
  pub const DEVNAME: &'static str = "DEVNAME";

  pub fn new(identity: impl Into<String>) -> Self {
    RawDevice {
      identity: identity.into(),
      class_id: None,
      properties: BTreeMap::new(),
    }
  }

  pub fn with_class_id(mut self, class_id: impl Into<String>) -> Self {
    self.class_id = Some(class_id.into());
    self
  }

  pub fn with_property(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.properties.insert(name.into(), value.into());
    self
  }

  pub fn property(&self, name: &str) -> Option<&str> {
    self.properties.get(name).map(String::as_str)
  }
}

/// An event as it travels through the queue, from bridge to pump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawEvent {
  Arrive(RawDevice),
  Depart(RawDevice),
}

impl RawEvent {
  pub fn device(&self) -> &RawDevice {
    match self {
      RawEvent::Arrive(device) | RawEvent::Depart(device) => device,
    }
  }

  pub fn identity(&self) -> &str {
    &self.device().identity
  }

  pub fn is_arrival(&self) -> bool {
    matches!(self, RawEvent::Arrive(_))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn only_add_and_remove_become_events() {
    let raw = RawDevice::new("/dev/hidraw3");
    assert!(matches!(
      Action::Add.classify(raw.clone()),
      Some(RawEvent::Arrive(_))
    ));
    assert!(matches!(
      Action::Remove.classify(raw.clone()),
      Some(RawEvent::Depart(_))
    ));
    for action in [Action::Change, Action::Bind, Action::Unbind, Action::Unknown].iter() {
      assert_eq!(action.classify(raw.clone()), None);
    }
  }

  #[test]
  fn action_from_native_name() {
    assert_eq!(Action::from("add"), Action::Add);
    assert_eq!(Action::from("remove"), Action::Remove);
    assert_eq!(Action::from("offline"), Action::Unknown);
  }
}
