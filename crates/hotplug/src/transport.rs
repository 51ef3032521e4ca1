//! Native transports.
//!
//! A transport owns everything platform specific: registering and removing
//! native watches, enumerating present devices, and turning raw native data
//! into device records. The listener only talks to the [`Transport`] trait.

use crate::{
  bridge::NotificationSink,
  class::Criteria,
  device::{DeviceRecord, InterfaceRecord, PropertyKey, PropertyValue},
  error::{NativeError, PropertyError, ResolutionError},
  event::RawDevice,
  identity::Identity,
};

pub mod memory;

#[cfg(target_os = "linux")]
pub mod udev;

#[cfg(windows)]
pub mod windows;

#[cfg(target_os = "linux")]
pub type PlatformTransport = udev::UdevTransport;

#[cfg(windows)]
pub type PlatformTransport = windows::WindowsTransport;

/// Lazy property lookups on devices produced by a transport.
pub trait PropertyResolver: Send + Sync + 'static {
  fn property(&self, device: Identity, key: PropertyKey) -> Result<PropertyValue, PropertyError>;

  fn parent(&self, device: Identity) -> Result<DeviceRecord, PropertyError>;
}

pub trait Transport: PropertyResolver + Sized {
  /// Handle of one registered native watch. Dropping it without
  /// [`unregister_watch`](Transport::unregister_watch) must still release the
  /// native registration.
  type Watch: Send + 'static;

  /// Starts delivering notifications matching `criteria` into `sink`.
  ///
  /// Delivery happens on a thread owned by the transport or the OS, never on
  /// the calling thread.
  fn register_watch(
    &self,
    criteria: &'static Criteria,
    sink: NotificationSink,
  ) -> Result<Self::Watch, NativeError>;

  /// Stops a watch. Blocks until any delivery in flight for it has finished;
  /// no notification is delivered for the watch afterwards.
  fn unregister_watch(&self, watch: Self::Watch) -> Result<(), NativeError>;

  /// Lists the interfaces matching `criteria` that are present right now.
  fn enumerate(&self, criteria: &Criteria) -> Result<Vec<RawDevice>, NativeError>;

  /// Resolves a raw arrival into an interface record.
  ///
  /// The record's `path` must equal `raw.identity`, which is what later
  /// departures of the interface carry.
  fn resolve(&self, raw: &RawDevice, criteria: &Criteria) -> Result<InterfaceRecord, ResolutionError>;
}
