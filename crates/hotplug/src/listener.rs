use crate::{
  bridge::{self, Message, NotificationSink, QUEUE_CAPACITY},
  class::{self, Bus, Criteria, DeviceClass, InterfaceClass},
  device::DeviceInterface,
  error::{ConfigurationError, Error, NativeError, StateError},
  event::RawEvent,
  pump::{Callback, Dispatcher, EventPump, Origin, Outcome},
  transport::Transport,
};
use serde::Serialize;
use std::{
  collections::BTreeSet,
  fmt, mem,
  sync::{Arc, Mutex, MutexGuard, PoisonError},
  thread,
};
use tokio::sync::mpsc::Sender;
use tracing::{event, Level};

const TEARDOWN_THREAD_NAME: &str = "hotplug-teardown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ListenerState {
  Idle,
  Listening,
  Stopped,
}

impl fmt::Display for ListenerState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      ListenerState::Idle => "idle",
      ListenerState::Listening => "listening",
      ListenerState::Stopped => "stopped",
    })
  }
}

/// What a listener watches and which arrivals it reports.
///
/// Interface classes select the native watches. Device classes and buses
/// narrow the arrivals reported; an empty set accepts everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
  classes: BTreeSet<InterfaceClass>,
  device_classes: BTreeSet<DeviceClass>,
  buses: BTreeSet<Bus>,
}

impl Filter {
  pub fn classes(&self) -> impl Iterator<Item = InterfaceClass> + '_ {
    self.classes.iter().copied()
  }

  pub fn device_classes(&self) -> impl Iterator<Item = DeviceClass> + '_ {
    self.device_classes.iter().copied()
  }

  pub fn buses(&self) -> impl Iterator<Item = Bus> + '_ {
    self.buses.iter().copied()
  }

  pub fn accepts(&self, interface: &DeviceInterface) -> bool {
    let device = interface.device();
    (self.device_classes.is_empty() || self.device_classes.contains(&device.class()))
      && (self.buses.is_empty() || self.buses.contains(&device.bus()))
  }

  /// Native criteria for every watched class, or the first class without a
  /// mapping on this platform.
  fn criteria(&self) -> Result<Vec<(InterfaceClass, &'static Criteria)>, ConfigurationError> {
    if self.classes.is_empty() {
      return Err(ConfigurationError::NoClasses);
    }

    self
      .classes()
      .map(|class| class::resolve(class).map(|criteria| (class, criteria)))
      .collect()
  }
}

struct Session<T: Transport> {
  watches: Vec<(InterfaceClass, T::Watch)>,
  sender: Sender<Message>,
  pump: EventPump,
}

impl<T: Transport> Session<T> {
  /// Unregisters every watch, closes the queue and joins the pump.
  ///
  /// Must not run on the pump thread: unregistration can wait on a delivery
  /// blocked on a full queue, which only the pump drains.
  fn teardown(self, transport: &T) -> Result<(), Error> {
    let Session {
      watches,
      sender,
      pump,
    } = self;

    let mut failure: Option<NativeError> = None;
    for (class, watch) in watches {
      if let Err(e) = transport.unregister_watch(watch) {
        event!(
          target: "hotplug",
          Level::WARN,
          %class,
          error = %e,
          "failed to unregister native watch"
        );
        failure.get_or_insert(e);
      }
    }

    // Every watch is gone, so nothing can be queued behind the close marker.
    if sender.blocking_send(Message::Close).is_err() {
      event!(target: "hotplug", Level::DEBUG, "event pump already gone");
    }
    drop(sender);

    if let Err(e) = pump.join() {
      event!(target: "hotplug", Level::ERROR, error = %e, "event pump panicked");
    }

    match failure {
      None => Ok(()),
      Some(e) => Err(Error::UnregisterFailed(e)),
    }
  }
}

enum Phase<T: Transport> {
  Idle,
  Starting,
  Listening(Session<T>),
  Stopping,
  Stopped,
}

impl<T: Transport> Phase<T> {
  fn state(&self) -> ListenerState {
    match self {
      Phase::Idle => ListenerState::Idle,
      Phase::Starting | Phase::Listening(_) | Phase::Stopping => ListenerState::Listening,
      Phase::Stopped => ListenerState::Stopped,
    }
  }
}

struct Inner<T: Transport> {
  phase: Phase<T>,
  filter: Filter,
  queue_capacity: usize,
}

/// Watches one or more interface classes and reports arrivals and departures
/// to a callback.
///
/// Callbacks run on a dedicated pump thread while listening, and on the
/// calling thread during [`enumerate`](Listener::enumerate). They are never
/// run concurrently for one listener.
///
/// All operations block; they must not be called from inside an async
/// runtime.
pub struct Listener<T: Transport> {
  transport: Arc<T>,
  dispatcher: Arc<Dispatcher<T>>,
  inner: Mutex<Inner<T>>,
}

#[cfg(any(target_os = "linux", windows))]
impl Listener<crate::transport::PlatformTransport> {
  /// Creates a listener on the native transport of this platform.
  pub fn new<I, F>(classes: I, callback: F) -> Result<Self, Error>
  where
    I: IntoIterator<Item = InterfaceClass>,
    F: FnMut(&DeviceInterface, bool) + Send + 'static,
  {
    let transport = crate::transport::PlatformTransport::new().map_err(Error::TransportInit)?;
    Ok(Self::with_transport(transport, classes, callback))
  }
}

impl<T: Transport> Listener<T> {
  pub fn with_transport<I, F>(transport: T, classes: I, callback: F) -> Self
  where
    I: IntoIterator<Item = InterfaceClass>,
    F: FnMut(&DeviceInterface, bool) + Send + 'static,
  {
    let transport = Arc::new(transport);
    let callback: Callback = Box::new(callback);
    let filter = Filter {
      classes: classes.into_iter().collect(),
      ..Filter::default()
    };

    Listener {
      dispatcher: Arc::new(Dispatcher::new(transport.clone(), callback)),
      transport,
      inner: Mutex::new(Inner {
        phase: Phase::Idle,
        filter,
        queue_capacity: QUEUE_CAPACITY,
      }),
    }
  }

  /// Sets the capacity of the queue between the native thread and the pump.
  pub fn with_queue_capacity(self, capacity: usize) -> Self {
    self.lock().queue_capacity = capacity.max(1);
    self
  }

  pub fn transport(&self) -> &T {
    &self.transport
  }

  pub fn state(&self) -> ListenerState {
    self.lock().phase.state()
  }

  pub fn filter(&self) -> Filter {
    self.lock().filter.clone()
  }

  pub fn include_class(&self, class: InterfaceClass) -> Result<(), StateError> {
    self.update_filter(|filter| {
      filter.classes.insert(class);
    })
  }

  pub fn include_device_class(&self, class: DeviceClass) -> Result<(), StateError> {
    self.update_filter(|filter| {
      filter.device_classes.insert(class);
    })
  }

  pub fn include_bus(&self, bus: Bus) -> Result<(), StateError> {
    self.update_filter(|filter| {
      filter.buses.insert(bus);
    })
  }

  /// Registers one native watch per interface class and starts the pump.
  ///
  /// A class without a native mapping fails before any native call. If any
  /// registration fails, the watches registered so far are removed again and
  /// the listener is left idle.
  pub fn listen(&self) -> Result<(), Error> {
    self.ensure_outside_callback("listen")?;
    let (criteria, filter, capacity) = {
      let mut inner = self.lock();
      match inner.phase {
        Phase::Idle | Phase::Stopped => (),
        Phase::Listening(_) => return Err(StateError::AlreadyListening.into()),
        Phase::Starting | Phase::Stopping => return Err(StateError::Transitioning.into()),
      }

      let criteria = inner.filter.criteria()?;
      inner.phase = Phase::Starting;
      (criteria, inner.filter.clone(), inner.queue_capacity)
    };

    match self.start(criteria, filter, capacity) {
      Ok(session) => {
        event!(
          target: "hotplug",
          Level::DEBUG,
          watches = session.watches.len(),
          "listener started"
        );
        self.lock().phase = Phase::Listening(session);
        Ok(())
      }
      Err(e) => {
        self.lock().phase = Phase::Idle;
        Err(e)
      }
    }
  }

  /// Unregisters every native watch, drains the queue and joins the pump.
  pub fn stop(&self) -> Result<(), Error> {
    self.ensure_outside_callback("stop")?;
    let session = {
      let mut inner = self.lock();
      match mem::replace(&mut inner.phase, Phase::Stopping) {
        Phase::Listening(session) => session,
        other => {
          let error = match other {
            Phase::Starting | Phase::Stopping => StateError::Transitioning,
            _ => StateError::NotListening,
          };
          inner.phase = other;
          return Err(error.into());
        }
      }
    };

    let result = session.teardown(&self.transport);
    let forgotten = self.dispatcher.reset();
    self.lock().phase = Phase::Stopped;
    if forgotten > 0 {
      event!(
        target: "hotplug",
        Level::DEBUG,
        forgotten,
        "dropped detach registrations of interfaces still present"
      );
    }

    event!(target: "hotplug", Level::DEBUG, ok = result.is_ok(), "listener stopped");
    result
  }

  pub fn close(&self) -> Result<(), Error> {
    self.stop()
  }

  /// Reports every present interface of the watched classes as an arrival,
  /// synchronously on the calling thread.
  ///
  /// Valid in any state. While listening, interfaces already reported by the
  /// pump and not yet departed are skipped.
  pub fn enumerate(&self) -> Result<(), Error> {
    self.ensure_outside_callback("enumerate")?;
    let (criteria, filter, listening) = {
      let inner = self.lock();
      let criteria = inner.filter.criteria()?;
      let listening = inner.phase.state() == ListenerState::Listening;
      (criteria, inner.filter.clone(), listening)
    };

    let origin = Origin::Enumeration {
      skip_present: listening,
    };
    for (class, criteria) in criteria {
      let devices = self
        .transport
        .enumerate(criteria)
        .map_err(Error::EnumerationFailed)?;

      let found = devices.len();
      let delivered = devices
        .into_iter()
        .map(|raw| {
          self
            .dispatcher
            .dispatch(class, RawEvent::Arrive(raw), origin, &filter)
        })
        .filter(|outcome| *outcome == Outcome::Arrived)
        .count();

      event!(
        target: "hotplug",
        Level::DEBUG,
        %class,
        found,
        delivered,
        "enumerated present interfaces"
      );
    }

    Ok(())
  }

  fn start(
    &self,
    criteria: Vec<(InterfaceClass, &'static Criteria)>,
    filter: Filter,
    capacity: usize,
  ) -> Result<Session<T>, Error> {
    let (sender, receiver) = bridge::channel(capacity);
    let pump = EventPump::spawn(self.dispatcher.clone(), filter, receiver)
      .map_err(Error::RegistrationFailed)?;

    let mut session: Session<T> = Session {
      watches: Vec::with_capacity(criteria.len()),
      sender,
      pump,
    };

    for (class, criteria) in criteria {
      let sink = NotificationSink::new(session.sender.clone(), class);
      match self.transport.register_watch(criteria, sink) {
        Ok(watch) => {
          event!(
            target: "hotplug",
            Level::DEBUG,
            %class,
            subsystem = criteria.subsystem,
            "native watch registered"
          );
          session.watches.push((class, watch));
        }

        Err(e) => {
          event!(
            target: "hotplug",
            Level::DEBUG,
            %class,
            error = %e,
            unwinding = session.watches.len(),
            "native watch registration failed"
          );
          if let Err(unwind) = session.teardown(&self.transport) {
            event!(
              target: "hotplug",
              Level::WARN,
              error = %unwind,
              "failed to unwind partial registration"
            );
          }

          return Err(Error::RegistrationFailed(e));
        }
      }
    }

    Ok(session)
  }

  fn update_filter(&self, update: impl FnOnce(&mut Filter)) -> Result<(), StateError> {
    let mut inner = self.lock();
    match inner.phase.state() {
      ListenerState::Idle => {
        update(&mut inner.filter);
        Ok(())
      }
      state => Err(StateError::FiltersLocked(state)),
    }
  }

  fn ensure_outside_callback(&self, operation: &'static str) -> Result<(), StateError> {
    if self.dispatcher.is_dispatching_here() {
      Err(StateError::CalledFromCallback(operation))
    } else {
      Ok(())
    }
  }

  fn lock(&self) -> MutexGuard<'_, Inner<T>> {
    self.inner.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

impl<T: Transport> fmt::Debug for Listener<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let inner = self.lock();
    f.debug_struct("Listener")
      .field("state", &inner.phase.state())
      .field("filter", &inner.filter)
      .finish()
  }
}

impl<T: Transport> Drop for Listener<T> {
  fn drop(&mut self) {
    let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
    let session = match mem::replace(&mut inner.phase, Phase::Stopped) {
      Phase::Listening(session) => session,
      _ => return,
    };

    if !self.dispatcher.is_dispatching_here() {
      if let Err(e) = session.teardown(&self.transport) {
        event!(
          target: "hotplug",
          Level::ERROR,
          error = %e,
          "failed to stop listener on drop"
        );
      }
      return;
    }

    // Dropped from inside a callback: the pump has to keep draining while the
    // watches go away, so the teardown runs on its own thread.
    let transport = self.transport.clone();
    let spawned = thread::Builder::new()
      .name(TEARDOWN_THREAD_NAME.into())
      .spawn(move || {
        if let Err(e) = session.teardown(&transport) {
          event!(
            target: "hotplug",
            Level::ERROR,
            error = %e,
            "failed to stop listener dropped in a callback"
          );
        }
      });

    if let Err(e) = spawned {
      event!(
        target: "hotplug",
        Level::ERROR,
        error = %e,
        "failed to spawn listener teardown"
      );
    }
  }
}
