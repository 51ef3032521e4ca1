//! Hotplug notifications for HID devices, printers and USB devices.
//!
//! A [`Listener`] registers one native watch per interface class and reports
//! arrivals and departures to a single callback, running on a dedicated pump
//! thread. Interfaces can attach detach callbacks while their arrival is being
//! reported; those run once, right before the matching departure.
//!
//! ```no_run
//! use hotplug::{InterfaceClass, Listener};
//!
//! let listener = Listener::new(vec![InterfaceClass::Hid], |iface, arrived| {
//!   if arrived {
//!     let path = iface.path().to_string();
//!     let _ = iface.on_detach(move || println!("gone: {}", path));
//!   }
//! })?;
//! listener.listen()?;
//! listener.enumerate()?;
//! # Ok::<(), hotplug::Error>(())
//! ```

mod bridge;
mod class;
mod correlation;
mod device;
mod error;
mod event;
mod identity;
mod listener;
mod pump;
pub mod transport;

pub use bridge::{Delivery, NotificationSink, QUEUE_CAPACITY};
pub use class::{
  classify_device, device_class_for_guid, device_criteria, interface_class_for_guid, resolve,
  Bus, ClassGuid, Criteria, DeviceClass, InterfaceClass,
};
pub use device::{Device, DeviceInterface, DeviceRecord, InterfaceRecord, PropertyKey, PropertyValue};
pub use error::{
  ConfigurationError, Error, NativeError, PropertyError, ResolutionError, StateError,
};
pub use event::{Action, RawDevice, RawEvent};
pub use identity::Identity;
pub use listener::{Filter, Listener, ListenerState};
pub use transport::{memory::MemoryTransport, PropertyResolver, Transport};
