//! In-process transport.
//!
//! Keeps a table of "present" interfaces and a small device tree, and plays
//! the native notification thread when told to. Deliveries go through the
//! same [`NotificationSink`] bridge as the native backends, so a listener
//! driven by this transport behaves exactly like one driven by udev.

use crate::{
  bridge::{Delivery, NotificationSink},
  class::Criteria,
  device::{DeviceRecord, InterfaceRecord, PropertyKey, PropertyValue},
  error::{NativeError, PropertyError, ResolutionError},
  event::{Action, RawDevice},
  identity::Identity,
  transport::{PropertyResolver, Transport},
};
use std::{
  collections::{BTreeMap, BTreeSet},
  fmt,
  sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tracing::{event, Level};

struct Node {
  record: DeviceRecord,
  parent: Option<Identity>,
}

struct ActiveWatch {
  criteria: &'static Criteria,
  sink: NotificationSink,
}

#[derive(Default)]
struct State {
  present: BTreeMap<String, (RawDevice, InterfaceRecord)>,
  nodes: BTreeMap<Identity, Node>,
  watches: BTreeMap<u64, ActiveWatch>,
  next_watch: u64,
  registrations: usize,
  failing_subsystems: BTreeSet<&'static str>,
  unresolvable: BTreeSet<String>,
}

#[derive(Default)]
struct Inner {
  state: Mutex<State>,

  // Held for the whole of a delivery; unregistration waits on it.
  delivery: Mutex<()>,
}

/// Transport backed by process memory.
#[derive(Clone, Default)]
pub struct MemoryTransport(Arc<Inner>);

#[derive(Debug, PartialEq, Eq)]
pub struct MemoryWatch(u64);

impl MemoryTransport {
  pub fn new() -> Self {
    Self::default()
  }

  /// Adds a device node to the tree used for property and parent lookups.
  ///
  /// Properties in `record` are served through the resolver, not pre-filled.
  pub fn add_node(&self, record: DeviceRecord, parent: Option<Identity>) {
    let identity = record.identity;
    self.state().nodes.insert(identity, Node { record, parent });
  }

  /// Makes an interface present without notifying anyone.
  pub fn insert(&self, raw: RawDevice, interface: InterfaceRecord) {
    if !self.state().nodes.contains_key(&interface.device.identity) {
      self.add_node(interface.device.clone(), None);
    }

    self
      .state()
      .present
      .insert(raw.identity.clone(), (raw, interface));
  }

  /// Makes an interface present and delivers its arrival.
  pub fn plug(&self, raw: RawDevice, interface: InterfaceRecord) -> usize {
    self.insert(raw.clone(), interface);
    self.inject(Action::Add, raw)
  }

  /// Removes a present interface and delivers its departure. Returns `None`
  /// if nothing with that identity is present.
  pub fn unplug(&self, identity: &str) -> Option<usize> {
    let removed = self.state().present.remove(identity);
    removed.map(|(raw, _)| self.inject(Action::Remove, raw))
  }

  /// Delivers a notification to every active watch matching the raw device.
  /// Returns the number of watches it was queued for.
  ///
  /// Blocks while a listener's queue is full.
  pub fn inject(&self, action: Action, raw: RawDevice) -> usize {
    let _delivery = self.0.delivery.lock().unwrap_or_else(PoisonError::into_inner);
    let sinks = {
      let state = self.state();
      state
        .watches
        .values()
        .filter(|watch| Self::matches(watch.criteria, &raw))
        .map(|watch| watch.sink.clone())
        .collect::<Vec<_>>()
    };

    sinks
      .into_iter()
      .filter(|sink| sink.notify(action, raw.clone()) == Delivery::Queued)
      .count()
  }

  /// Makes the next registration for `subsystem` fail.
  pub fn fail_registration(&self, subsystem: &'static str) {
    self.state().failing_subsystems.insert(subsystem);
  }

  /// Makes every resolution of `identity` fail, as if the device vanished
  /// right after notifying.
  pub fn fail_resolution(&self, identity: impl Into<String>) {
    self.state().unresolvable.insert(identity.into());
  }

  pub fn active_watches(&self) -> usize {
    self.state().watches.len()
  }

  /// Number of successful watch registrations since creation.
  pub fn registrations(&self) -> usize {
    self.state().registrations
  }

  fn matches(criteria: &Criteria, raw: &RawDevice) -> bool {
    criteria.matches_node(raw.class_id.as_deref(), raw.property(RawDevice::DEVTYPE))
      && criteria.matches_driver(raw.property(RawDevice::DRIVER))
  }

  fn state(&self) -> MutexGuard<'_, State> {
    self.0.state.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

impl fmt::Debug for MemoryTransport {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let state = self.state();
    f.debug_struct("MemoryTransport")
      .field("present", &state.present.len())
      .field("watches", &state.watches.len())
      .finish()
  }
}

impl PropertyResolver for MemoryTransport {
  fn property(&self, device: Identity, key: PropertyKey) -> Result<PropertyValue, PropertyError> {
    self
      .state()
      .nodes
      .get(&device)
      .and_then(|node| node.record.properties.get(&key).cloned())
      .ok_or(PropertyError::NotFound(key))
  }

  fn parent(&self, device: Identity) -> Result<DeviceRecord, PropertyError> {
    let state = self.state();
    let parent = state
      .nodes
      .get(&device)
      .and_then(|node| node.parent)
      .ok_or(PropertyError::NoParent)?;

    state
      .nodes
      .get(&parent)
      .map(|node| DeviceRecord::new(node.record.identity, node.record.class, node.record.bus))
      .ok_or(PropertyError::NoParent)
  }
}

impl Transport for MemoryTransport {
  type Watch = MemoryWatch;

  fn register_watch(
    &self,
    criteria: &'static Criteria,
    sink: NotificationSink,
  ) -> Result<Self::Watch, NativeError> {
    let mut state = self.state();
    if state.failing_subsystems.remove(criteria.subsystem) {
      return Err(NativeError::Rejected {
        call: "register_watch",
        message: format!("registration for {} refused", criteria.subsystem),
      });
    }

    let id = state.next_watch;
    state.next_watch += 1;
    state.registrations += 1;
    state.watches.insert(id, ActiveWatch { criteria, sink });
    event!(
      target: "hotplug",
      Level::TRACE,
      watch.id = id,
      watch.subsystem = criteria.subsystem,
      "memory watch registered"
    );

    Ok(MemoryWatch(id))
  }

  fn unregister_watch(&self, watch: Self::Watch) -> Result<(), NativeError> {
    let _delivery = self.0.delivery.lock().unwrap_or_else(PoisonError::into_inner);
    match self.state().watches.remove(&watch.0) {
      Some(_) => Ok(()),
      None => Err(NativeError::Rejected {
        call: "unregister_watch",
        message: format!("unknown watch {}", watch.0),
      }),
    }
  }

  fn enumerate(&self, criteria: &Criteria) -> Result<Vec<RawDevice>, NativeError> {
    Ok(
      self
        .state()
        .present
        .values()
        .filter(|(raw, _)| Self::matches(criteria, raw))
        .map(|(raw, _)| raw.clone())
        .collect(),
    )
  }

  fn resolve(&self, raw: &RawDevice, criteria: &Criteria) -> Result<InterfaceRecord, ResolutionError> {
    let state = self.state();
    if state.unresolvable.contains(&raw.identity) {
      return Err(ResolutionError::Vanished(raw.identity.clone()));
    }

    let (_, interface) = state
      .present
      .get(&raw.identity)
      .ok_or_else(|| ResolutionError::Vanished(raw.identity.clone()))?;

    if !Self::matches(criteria, raw) {
      return Err(ResolutionError::Mismatch(raw.identity.clone()));
    }

    let mut interface = interface.clone();
    interface.device.properties.clear();
    Ok(interface)
  }
}
