//! Detach correlation.
//!
//! An arrival callback may subscribe to the departure of the interface it was
//! handed. Subscriptions are collected in the interface's [`ArrivalWindow`]
//! while the callback runs, then moved into the [`DetachTable`] keyed by the
//! interface identity. The next departure of that identity runs and removes
//! them.

use crate::{device::DeviceInterface, error::StateError, identity::Identity};
use smallvec::SmallVec;
use std::{
  collections::BTreeMap,
  fmt,
  sync::{Mutex, PoisonError},
};

pub(crate) type DetachCallback = Box<dyn FnOnce() + Send + 'static>;
pub(crate) type Registrations = SmallVec<[DetachCallback; 2]>;

/// Registration window of one arrival callback invocation.
pub(crate) struct ArrivalWindow(Mutex<Option<Registrations>>);

impl ArrivalWindow {
  pub(crate) fn open() -> Self {
    ArrivalWindow(Mutex::new(Some(SmallVec::new())))
  }

  pub(crate) fn register(&self, callback: DetachCallback) -> Result<(), StateError> {
    let mut guard = self.0.lock().unwrap_or_else(PoisonError::into_inner);
    match &mut *guard {
      Some(registrations) => {
        registrations.push(callback);
        Ok(())
      }
      None => Err(StateError::DetachOutsideArrival),
    }
  }

  /// Closes the window and hands over everything registered while it was
  /// open. Later registrations are rejected.
  pub(crate) fn close(&self) -> Registrations {
    self
      .0
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .take()
      .unwrap_or_default()
  }
}

struct Entry {
  interface: DeviceInterface,
  callbacks: Registrations,
}

/// Interfaces delivered as present, with the detach callbacks registered
/// during their most recent arrival.
#[derive(Default)]
pub(crate) struct DetachTable {
  entries: BTreeMap<Identity, Entry>,
}

impl DetachTable {
  /// Records a delivered arrival. Returns the number of callbacks discarded
  /// from an earlier arrival of the same identity.
  pub(crate) fn record(&mut self, interface: DeviceInterface, callbacks: Registrations) -> usize {
    let identity = interface.identity();
    self
      .entries
      .insert(
        identity,
        Entry {
          interface,
          callbacks,
        },
      )
      .map_or(0, |previous| previous.callbacks.len())
  }

  /// Runs and removes every callback registered for `identity`, in
  /// registration order. Returns the departed interface, or `None` if the
  /// identity was never delivered or already departed.
  pub(crate) fn fire(&mut self, identity: Identity) -> Option<DeviceInterface> {
    let entry = self.entries.remove(&identity)?;
    for callback in entry.callbacks {
      callback();
    }

    Some(entry.interface)
  }

  pub(crate) fn contains(&self, identity: Identity) -> bool {
    self.entries.contains_key(&identity)
  }

  /// Forgets every entry without running its callbacks.
  pub(crate) fn clear(&mut self) -> usize {
    let count = self.entries.len();
    self.entries.clear();
    count
  }

  #[cfg(test)]
  pub(crate) fn len(&self) -> usize {
    self.entries.len()
  }
}

impl fmt::Debug for DetachTable {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_map()
      .entries(
        self
          .entries
          .iter()
          .map(|(identity, entry)| (identity, entry.callbacks.len())),
      )
      .finish()
  }
}
