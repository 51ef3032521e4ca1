use crate::{
  bridge::Message,
  class::{self, InterfaceClass},
  correlation::DetachTable,
  device::DeviceInterface,
  error::{NativeError, ResolutionError},
  event::{RawDevice, RawEvent},
  identity::Identity,
  listener::Filter,
  transport::Transport,
};
use std::{
  sync::{Arc, Mutex, MutexGuard, PoisonError},
  thread::{self, JoinHandle, ThreadId},
};
use tokio::sync::mpsc::Receiver;
use tracing::{event, Level};

pub(crate) type Callback = Box<dyn FnMut(&DeviceInterface, bool) + Send + 'static>;

const PUMP_THREAD_NAME: &str = "hotplug-event-pump";

/// Where a raw event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Origin {
  Notification,

  /// Synchronous enumeration on the caller's thread. With `skip_present`,
  /// interfaces already delivered and not yet departed are not reported again.
  Enumeration { skip_present: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
  Arrived,
  Departed,
  AlreadyPresent,
  Filtered,
  Unresolved,
  Unknown,
}

struct DispatchState {
  callback: Callback,
  table: DetachTable,
}

/// The resolve, filter and dispatch path shared by the pump and enumeration.
///
/// Dispatching is serialized by a single lock, which is what keeps callbacks
/// of one listener from ever running concurrently.
pub(crate) struct Dispatcher<T> {
  transport: Arc<T>,
  state: Mutex<DispatchState>,
  dispatching: Mutex<Option<ThreadId>>,
}

struct DispatchMarker<'a>(&'a Mutex<Option<ThreadId>>);

impl<'a> Drop for DispatchMarker<'a> {
  fn drop(&mut self) {
    *self.0.lock().unwrap_or_else(PoisonError::into_inner) = None;
  }
}

impl<T: Transport> Dispatcher<T> {
  pub(crate) fn new(transport: Arc<T>, callback: Callback) -> Self {
    Dispatcher {
      transport,
      state: Mutex::new(DispatchState {
        callback,
        table: DetachTable::default(),
      }),
      dispatching: Mutex::new(None),
    }
  }

  /// Whether the current thread is inside one of this dispatcher's callbacks.
  pub(crate) fn is_dispatching_here(&self) -> bool {
    *self.dispatching.lock().unwrap_or_else(PoisonError::into_inner) == Some(thread::current().id())
  }

  pub(crate) fn dispatch(
    &self,
    class: InterfaceClass,
    event: RawEvent,
    origin: Origin,
    filter: &Filter,
  ) -> Outcome {
    let mut state = self.lock();
    let _marker = self.mark();
    event!(
      target: "hotplug",
      Level::TRACE,
      event.class = %class,
      event.identity = %event.identity(),
      event.arrival = event.is_arrival(),
      ?origin,
      "dispatching event"
    );

    match event {
      RawEvent::Arrive(raw) => self.arrive(&mut state, class, raw, origin, filter),
      RawEvent::Depart(raw) => Self::depart(&mut state, raw),
    }
  }

  /// Forgets every delivered interface. Detach callbacks are dropped unrun.
  pub(crate) fn reset(&self) -> usize {
    self.lock().table.clear()
  }

  fn arrive(
    &self,
    state: &mut DispatchState,
    class: InterfaceClass,
    raw: RawDevice,
    origin: Origin,
    filter: &Filter,
  ) -> Outcome {
    if let Origin::Enumeration { skip_present: true } = origin {
      if Identity::lookup(&raw.identity).map_or(false, |id| state.table.contains(id)) {
        return Outcome::AlreadyPresent;
      }
    }

    let resolved = match class::resolve(class) {
      Ok(criteria) => self.transport.resolve(&raw, criteria),
      Err(e) => Err(ResolutionError::Unmapped(e)),
    };
    let record = match resolved {
      Ok(record) => record,
      Err(e) => {
        event!(
          target: "hotplug",
          Level::DEBUG,
          event.identity = %raw.identity,
          error = %e,
          "dropping arrival that could not be resolved"
        );
        return Outcome::Unresolved;
      }
    };

    let interface = DeviceInterface::arriving(record, class, self.transport.clone());
    if !filter.accepts(&interface) {
      event!(
        target: "hotplug",
        Level::DEBUG,
        interface.path = %interface.path(),
        device.class = %interface.device().class(),
        device.bus = %interface.device().bus(),
        "arrival filtered out"
      );
      return Outcome::Filtered;
    }

    (state.callback)(&interface, true);
    let callbacks = interface.window().close();
    let path = interface.identity();
    let discarded = state.table.record(interface, callbacks);
    if discarded > 0 {
      event!(
        target: "hotplug",
        Level::WARN,
        interface.path = %path,
        discarded,
        "repeated arrival replaced pending detach callbacks"
      );
    }

    Outcome::Arrived
  }

  fn depart(state: &mut DispatchState, raw: RawDevice) -> Outcome {
    // Identities that were never interned cannot be in the table.
    match Identity::lookup(&raw.identity).and_then(|id| state.table.fire(id)) {
      None => {
        event!(
          target: "hotplug",
          Level::DEBUG,
          event.identity = %raw.identity,
          "dropping departure of an interface that was never delivered"
        );
        Outcome::Unknown
      }
      Some(interface) => {
        (state.callback)(&interface, false);
        Outcome::Departed
      }
    }
  }

  fn lock(&self) -> MutexGuard<'_, DispatchState> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn mark(&self) -> DispatchMarker<'_> {
    *self.dispatching.lock().unwrap_or_else(PoisonError::into_inner) = Some(thread::current().id());
    DispatchMarker(&self.dispatching)
  }
}

/// Dedicated thread draining one listener's queue.
pub(crate) struct EventPump {
  handle: JoinHandle<()>,
}

impl EventPump {
  pub(crate) fn spawn<T: Transport>(
    dispatcher: Arc<Dispatcher<T>>,
    filter: Filter,
    receiver: Receiver<Message>,
  ) -> Result<Self, NativeError> {
    let handle = thread::Builder::new()
      .name(PUMP_THREAD_NAME.into())
      .spawn(move || Self::run(dispatcher, filter, receiver))
      .map_err(NativeError::io("spawn event pump"))?;

    Ok(EventPump { handle })
  }

  fn run<T: Transport>(dispatcher: Arc<Dispatcher<T>>, filter: Filter, mut receiver: Receiver<Message>) {
    event!(target: "hotplug", Level::DEBUG, "event pump started");
    let mut delivered = 0usize;
    while let Some(message) = receiver.blocking_recv() {
      match message {
        Message::Event { class, event } => {
          match dispatcher.dispatch(class, event, Origin::Notification, &filter) {
            Outcome::Arrived | Outcome::Departed => delivered += 1,
            _ => (),
          }
        }

        Message::Close => break,
      }
    }

    event!(
      target: "hotplug",
      Level::DEBUG,
      delivered,
      "event pump stopped"
    );
  }

  pub(crate) fn join(self) -> Result<(), NativeError> {
    self
      .handle
      .join()
      .map_err(|_| NativeError::ThreadLost(PUMP_THREAD_NAME.into()))
  }
}
