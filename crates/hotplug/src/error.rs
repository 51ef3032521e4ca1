use crate::{
  class::{DeviceClass, InterfaceClass},
  device::PropertyKey,
  listener::ListenerState,
};
use std::io;
use thiserror::Error;

/// Errors returned by [`Listener`](crate::Listener) operations.
#[derive(Debug, Error)]
pub enum Error {
  #[error(transparent)]
  Configuration(#[from] ConfigurationError),

  #[error(transparent)]
  State(#[from] StateError),

  #[error("Failed to register native watch")]
  RegistrationFailed(#[source] NativeError),

  #[error("Failed to unregister native watch")]
  UnregisterFailed(#[source] NativeError),

  #[error("Failed to enumerate present devices")]
  EnumerationFailed(#[source] NativeError),

  #[error("Failed to initialize native transport")]
  TransportInit(#[source] NativeError),
}

impl Error {
  /// The native failure behind this error, if any.
  pub fn native(&self) -> Option<&NativeError> {
    match self {
      Error::RegistrationFailed(e)
      | Error::UnregisterFailed(e)
      | Error::EnumerationFailed(e)
      | Error::TransportInit(e) => Some(e),
      Error::Configuration(_) | Error::State(_) => None,
    }
  }
}

/// A class or filter that cannot be used. Detected before any native call.
#[derive(Debug, Error)]
pub enum ConfigurationError {
  #[error("Interface class {0} has no native mapping on this platform")]
  UnsupportedClass(InterfaceClass),

  #[error("Listener has no interface classes to watch")]
  NoClasses,

  #[error("Unknown {kind} name: {name:?}")]
  UnknownName { kind: &'static str, name: String },

  #[error("Invalid class GUID: {0:?}")]
  InvalidGuid(String),
}

/// An operation was attempted in a state that does not allow it.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateError {
  #[error("Listener is already listening")]
  AlreadyListening,

  #[error("Listener is not listening")]
  NotListening,

  #[error("Listener is busy starting or stopping")]
  Transitioning,

  #[error("Filters can only be changed while idle (listener is {0})")]
  FiltersLocked(ListenerState),

  #[error("Detach callbacks can only be registered during the arrival callback of their interface")]
  DetachOutsideArrival,

  #[error("Listener::{0} cannot be called from inside one of its own callbacks")]
  CalledFromCallback(&'static str),
}

/// Failure of a call into the native notification or enumeration API.
#[derive(Debug, Error)]
pub enum NativeError {
  #[error("{call} failed")]
  Io {
    call: &'static str,
    #[source]
    source: io::Error,
  },

  #[error("{call} failed (CONFIGRET 0x{status:X})")]
  ConfigRet { call: &'static str, status: u32 },

  #[error("{call} failed: {message}")]
  Rejected { call: &'static str, message: String },

  #[error("Native thread '{0}' exited unexpectedly")]
  ThreadLost(String),
}

impl NativeError {
  pub(crate) fn io(call: &'static str) -> impl FnOnce(io::Error) -> Self {
    move |source| NativeError::Io { call, source }
  }
}

/// A raw event or enumeration entry that could not be turned into a device.
///
/// Never surfaced to callers: the device may legitimately have disappeared
/// between notification and resolution.
#[derive(Debug, Error)]
pub enum ResolutionError {
  #[error("Device {0} no longer exists")]
  Vanished(String),

  #[error("Device {0} does not match the watched class")]
  Mismatch(String),

  #[error("Device {0} has no parent device")]
  NoParent(String),

  #[error("Device {identity} is missing raw property {name}")]
  MissingProperty {
    identity: String,
    name: &'static str,
  },

  #[error(transparent)]
  Unmapped(#[from] ConfigurationError),

  #[error(transparent)]
  Native(#[from] NativeError),
}

/// Failure resolving a derived device property.
#[derive(Debug, Error)]
pub enum PropertyError {
  #[error("Property {0} not found")]
  NotFound(PropertyKey),

  #[error("Property {key} has unexpected type (expected {expected})")]
  TypeMismatch {
    key: PropertyKey,
    expected: &'static str,
  },

  #[error("Property {key} has unparsable value {value:?}")]
  Invalid { key: PropertyKey, value: String },

  #[error("Device has no parent")]
  NoParent,

  #[error("Device has no ancestor of class {0}")]
  NoAncestor(DeviceClass),

  #[error(transparent)]
  Native(#[from] NativeError),
}
