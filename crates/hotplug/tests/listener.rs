use hotplug::{
  Action, Bus, ConfigurationError, DeviceClass, DeviceInterface, DeviceRecord, Error,
  Identity, InterfaceClass, InterfaceRecord, Listener, ListenerState, MemoryTransport,
  PropertyKey, PropertyValue, RawDevice, StateError,
};
use std::{
  sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    mpsc, Arc, Condvar, Mutex, Weak,
  },
  thread,
  time::{Duration, Instant},
};

const TIMEOUT: Duration = Duration::from_secs(5);

fn hidraw(n: u32, bus: Bus) -> (RawDevice, InterfaceRecord) {
  let path = format!("/dev/hidraw{}", n);
  (
    RawDevice::new(path.clone()).with_class_id("hidraw"),
    InterfaceRecord {
      path: Identity::new(&path),
      device: DeviceRecord::new(format!("/sys/devices/hid/000{}", n), DeviceClass::Hid, bus)
        .with_property(PropertyKey::VendorId, PropertyValue::Id(0x046d))
        .with_property(PropertyKey::ProductId, PropertyValue::Id(0xc52b + n as u16)),
    },
  )
}

fn usb_device(n: u32) -> (RawDevice, InterfaceRecord) {
  let path = format!("/dev/bus/usb/001/00{}", n);
  (
    RawDevice::new(path.clone())
      .with_class_id("usb")
      .with_property(RawDevice::DEVTYPE, "usb_device"),
    InterfaceRecord {
      path: Identity::new(&path),
      device: DeviceRecord::new(format!("/sys/bus/usb/devices/1-{}", n), DeviceClass::UsbDevice, Bus::Usb),
    },
  )
}

#[derive(Clone, Default)]
struct Log(Arc<(Mutex<Vec<String>>, Condvar)>);

impl Log {
  fn push(&self, entry: String) {
    let (entries, changed) = &*self.0;
    entries.lock().unwrap().push(entry);
    changed.notify_all();
  }

  fn entries(&self) -> Vec<String> {
    self.0 .0.lock().unwrap().clone()
  }

  /// Blocks until at least `len` entries were logged.
  fn wait_len(&self, len: usize) {
    let (entries, changed) = &*self.0;
    let (_entries, timeout) = changed
      .wait_timeout_while(entries.lock().unwrap(), TIMEOUT, |entries| entries.len() < len)
      .unwrap();
    assert!(!timeout.timed_out(), "expected {} log entries", len);
  }
}

fn presence(iface: &DeviceInterface, arrived: bool) -> String {
  format!("{} {}", if arrived { "arrive" } else { "depart" }, iface.path())
}

fn logging_listener(
  transport: &MemoryTransport,
  classes: &[InterfaceClass],
) -> (Listener<MemoryTransport>, Log) {
  let log = Log::default();
  let sink = log.clone();
  let listener = Listener::with_transport(transport.clone(), classes.iter().copied(), move |iface, arrived| {
    sink.push(presence(iface, arrived))
  });

  (listener, log)
}

#[test]
fn reports_hid_arrivals_in_native_order() {
  let transport = MemoryTransport::new();
  let (listener, log) = logging_listener(&transport, &[InterfaceClass::Hid]);
  listener.listen().unwrap();

  for n in 0..3 {
    let (raw, iface) = hidraw(n, Bus::Usb);
    assert_eq!(transport.plug(raw, iface), 1);
  }

  listener.stop().unwrap();
  assert_eq!(
    log.entries(),
    vec!["arrive /dev/hidraw0", "arrive /dev/hidraw1", "arrive /dev/hidraw2"]
  );
}

#[test]
fn interleaved_events_keep_their_relative_order() {
  let transport = MemoryTransport::new();
  let (listener, log) = logging_listener(&transport, &[InterfaceClass::Hid, InterfaceClass::UsbDevice]);
  let listener = listener.with_queue_capacity(1);
  listener.listen().unwrap();

  // Arrivals resolve against the present devices when the pump gets to
  // them, so each unplug waits for the arrival it follows.
  let (raw, iface) = hidraw(0, Bus::Usb);
  transport.plug(raw, iface);
  let (raw, iface) = usb_device(2);
  transport.plug(raw, iface);
  log.wait_len(2);
  transport.unplug("/dev/hidraw0").unwrap();
  let (raw, iface) = hidraw(1, Bus::Usb);
  transport.plug(raw, iface);
  log.wait_len(4);
  transport.unplug("/dev/bus/usb/001/002").unwrap();

  listener.stop().unwrap();
  assert_eq!(
    log.entries(),
    vec![
      "arrive /dev/hidraw0",
      "arrive /dev/bus/usb/001/002",
      "depart /dev/hidraw0",
      "arrive /dev/hidraw1",
      "depart /dev/bus/usb/001/002",
    ]
  );
}

#[test]
fn callbacks_never_run_concurrently() {
  let transport = MemoryTransport::new();
  let busy = Arc::new(AtomicBool::new(false));
  let overlaps = Arc::new(AtomicUsize::new(0));
  let calls = Arc::new(AtomicUsize::new(0));

  let listener = {
    let (busy, overlaps, calls) = (busy.clone(), overlaps.clone(), calls.clone());
    Arc::new(Listener::with_transport(
      transport.clone(),
      vec![InterfaceClass::Hid],
      move |_, _| {
        if busy.swap(true, Ordering::SeqCst) {
          overlaps.fetch_add(1, Ordering::SeqCst);
        }
        thread::sleep(Duration::from_millis(1));
        calls.fetch_add(1, Ordering::SeqCst);
        busy.store(false, Ordering::SeqCst);
      },
    ))
  };

  for n in 0..10 {
    let (raw, iface) = hidraw(n, Bus::Usb);
    transport.insert(raw, iface);
  }
  listener.listen().unwrap();

  let plugger = {
    let transport = transport.clone();
    thread::spawn(move || {
      for n in 10..30 {
        let (raw, iface) = hidraw(n, Bus::Usb);
        transport.plug(raw, iface);
      }
    })
  };
  let enumerator = {
    let listener = listener.clone();
    thread::spawn(move || {
      for _ in 0..3 {
        listener.enumerate().unwrap();
      }
    })
  };

  plugger.join().unwrap();
  enumerator.join().unwrap();
  listener.stop().unwrap();

  assert_eq!(overlaps.load(Ordering::SeqCst), 0);
  assert!(calls.load(Ordering::SeqCst) >= 30);
}

#[test]
fn listen_twice_keeps_the_first_registration() {
  let transport = MemoryTransport::new();
  let (listener, log) = logging_listener(&transport, &[InterfaceClass::Hid]);
  listener.listen().unwrap();

  assert!(matches!(
    listener.listen(),
    Err(Error::State(StateError::AlreadyListening))
  ));
  assert_eq!(transport.active_watches(), 1);
  assert_eq!(transport.registrations(), 1);

  let (raw, iface) = hidraw(0, Bus::Usb);
  assert_eq!(transport.plug(raw, iface), 1);
  listener.stop().unwrap();
  assert_eq!(log.entries(), vec!["arrive /dev/hidraw0"]);
}

#[test]
fn stop_requires_listening() {
  let transport = MemoryTransport::new();
  let (listener, _) = logging_listener(&transport, &[InterfaceClass::Hid]);

  assert!(matches!(
    listener.stop(),
    Err(Error::State(StateError::NotListening))
  ));
  assert_eq!(listener.state(), ListenerState::Idle);

  listener.listen().unwrap();
  listener.close().unwrap();
  assert_eq!(listener.state(), ListenerState::Stopped);
  assert!(matches!(
    listener.close(),
    Err(Error::State(StateError::NotListening))
  ));
}

#[test]
fn detach_runs_once_before_the_departure() {
  let transport = MemoryTransport::new();
  let log = Log::default();
  let listener = {
    let log = log.clone();
    Listener::with_transport(transport.clone(), vec![InterfaceClass::Hid], move |iface, arrived| {
      log.push(presence(iface, arrived));
      if arrived {
        for n in 0..2 {
          let log = log.clone();
          let path = iface.path().to_string();
          iface
            .on_detach(move || log.push(format!("detach{} {}", n, path)))
            .unwrap();
        }
      }
    })
  };
  listener.listen().unwrap();

  let (raw, iface) = hidraw(0, Bus::Usb);
  transport.plug(raw.clone(), iface);
  log.wait_len(1);
  transport.unplug("/dev/hidraw0").unwrap();

  // A second departure without a new arrival is dropped.
  assert_eq!(transport.inject(Action::Remove, raw), 1);
  listener.stop().unwrap();

  assert_eq!(
    log.entries(),
    vec![
      "arrive /dev/hidraw0",
      "detach0 /dev/hidraw0",
      "detach1 /dev/hidraw0",
      "depart /dev/hidraw0",
    ]
  );
}

#[test]
fn detach_never_runs_without_a_departure() {
  let transport = MemoryTransport::new();
  let fired = Arc::new(AtomicUsize::new(0));
  let listener = {
    let fired = fired.clone();
    Listener::with_transport(transport.clone(), vec![InterfaceClass::Hid], move |iface, arrived| {
      if arrived {
        let fired = fired.clone();
        iface
          .on_detach(move || {
            fired.fetch_add(1, Ordering::SeqCst);
          })
          .unwrap();
      }
    })
  };
  listener.listen().unwrap();

  let (raw, iface) = hidraw(0, Bus::Usb);
  transport.plug(raw, iface);
  listener.stop().unwrap();

  // Departures after stop reach no watch.
  assert_eq!(transport.unplug("/dev/hidraw0"), Some(0));
  drop(listener);
  assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[test]
fn detach_registration_outside_the_arrival_is_rejected() {
  let transport = MemoryTransport::new();
  let (sender, receiver) = mpsc::channel();
  let sender = Mutex::new(sender);
  let listener = Listener::with_transport(transport.clone(), vec![InterfaceClass::Hid], move |iface, arrived| {
    let result = if arrived {
      Ok(iface.clone())
    } else {
      Err(iface.on_detach(|| panic!("departure callback must not register")))
    };
    sender.lock().unwrap().send(result).unwrap();
  });
  listener.listen().unwrap();

  let (raw, iface) = hidraw(0, Bus::Usb);
  transport.plug(raw, iface);
  let arrived = receiver.recv_timeout(TIMEOUT).unwrap().unwrap();

  transport.unplug("/dev/hidraw0").unwrap();
  match receiver.recv_timeout(TIMEOUT).unwrap() {
    Err(result) => assert_eq!(result, Err(StateError::DetachOutsideArrival)),
    Ok(_) => panic!("expected a departure"),
  }

  // The departure was dispatched, so the arrival callback has returned.
  assert_eq!(
    arrived.on_detach(|| panic!("registered too late")),
    Err(StateError::DetachOutsideArrival)
  );

  listener.stop().unwrap();
}

#[test]
fn enumerate_without_devices_reports_nothing() {
  let transport = MemoryTransport::new();
  let (listener, log) = logging_listener(&transport, &[InterfaceClass::Hid, InterfaceClass::Printer]);

  listener.enumerate().unwrap();
  assert!(log.entries().is_empty());
  assert_eq!(listener.state(), ListenerState::Idle);
}

#[test]
fn enumerate_reports_present_devices_on_the_caller_thread() {
  let transport = MemoryTransport::new();
  let (raw, iface) = hidraw(0, Bus::Usb);
  transport.insert(raw, iface);
  let (raw, iface) = usb_device(1);
  transport.insert(raw, iface);

  let caller = thread::current().id();
  let threads = Arc::new(Mutex::new(Vec::new()));
  let listener = {
    let threads = threads.clone();
    Listener::with_transport(transport.clone(), vec![InterfaceClass::Hid], move |iface, _| {
      threads
        .lock()
        .unwrap()
        .push((iface.path().to_string(), thread::current().id()));
    })
  };

  listener.enumerate().unwrap();
  assert_eq!(
    *threads.lock().unwrap(),
    vec![("/dev/hidraw0".to_string(), caller)]
  );
}

#[test]
fn enumerate_drops_only_unresolvable_entries() {
  let transport = MemoryTransport::new();
  for n in 0..3 {
    let (raw, iface) = hidraw(n, Bus::Usb);
    transport.insert(raw, iface);
  }
  transport.fail_resolution("/dev/hidraw1");
  let (listener, log) = logging_listener(&transport, &[InterfaceClass::Hid]);

  listener.enumerate().unwrap();
  assert_eq!(log.entries(), vec!["arrive /dev/hidraw0", "arrive /dev/hidraw2"]);
}

#[test]
fn enumerate_while_listening_skips_delivered_interfaces() {
  let transport = MemoryTransport::new();
  let (sender, receiver) = mpsc::channel();
  let sender = Mutex::new(sender);
  let listener = Listener::with_transport(transport.clone(), vec![InterfaceClass::Hid], move |iface, arrived| {
    sender.lock().unwrap().send(presence(iface, arrived)).unwrap();
  });
  listener.listen().unwrap();

  let (raw, iface) = hidraw(0, Bus::Usb);
  transport.plug(raw, iface);
  assert_eq!(receiver.recv_timeout(TIMEOUT).unwrap(), "arrive /dev/hidraw0");

  let (raw, iface) = hidraw(1, Bus::Usb);
  transport.insert(raw, iface);
  listener.enumerate().unwrap();
  assert_eq!(receiver.recv_timeout(TIMEOUT).unwrap(), "arrive /dev/hidraw1");

  listener.stop().unwrap();
  assert!(receiver.try_recv().is_err());
}

#[test]
fn unmapped_class_fails_before_any_native_call() {
  let transport = MemoryTransport::new();
  let (listener, _) = logging_listener(&transport, &[InterfaceClass::Hid, InterfaceClass::Unknown]);

  assert!(matches!(
    listener.listen(),
    Err(Error::Configuration(ConfigurationError::UnsupportedClass(InterfaceClass::Unknown)))
  ));
  assert_eq!(listener.state(), ListenerState::Idle);
  assert_eq!(transport.registrations(), 0);
  assert!(matches!(
    listener.enumerate(),
    Err(Error::Configuration(ConfigurationError::UnsupportedClass(InterfaceClass::Unknown)))
  ));
}

#[test]
fn failed_registration_unwinds_earlier_watches() {
  let transport = MemoryTransport::new();
  let (listener, _) = logging_listener(&transport, &[InterfaceClass::Hid, InterfaceClass::UsbDevice]);
  transport.fail_registration("usb");

  match listener.listen() {
    Err(e @ Error::RegistrationFailed(_)) => assert!(e.native().is_some()),
    other => panic!("unexpected result: {:?}", other),
  }
  assert_eq!(listener.state(), ListenerState::Idle);
  assert_eq!(transport.registrations(), 1);
  assert_eq!(transport.active_watches(), 0);

  // The failure was one-shot.
  listener.listen().unwrap();
  assert_eq!(transport.active_watches(), 2);
}

#[test]
fn blocking_operations_are_refused_inside_callbacks() {
  let transport = MemoryTransport::new();
  let this: Arc<Mutex<Weak<Listener<MemoryTransport>>>> = Arc::new(Mutex::new(Weak::new()));
  let (sender, receiver) = mpsc::channel();
  let sender = Mutex::new(sender);

  let listener = {
    let this = this.clone();
    Arc::new(Listener::with_transport(
      transport.clone(),
      vec![InterfaceClass::Hid],
      move |_, _| {
        let listener = this.lock().unwrap().upgrade();
        if let Some(listener) = listener {
          let results = vec![
            listener.stop().map_err(|e| e.to_string()),
            listener.enumerate().map_err(|e| e.to_string()),
            listener.listen().map_err(|e| e.to_string()),
          ];
          sender.lock().unwrap().send(results).unwrap();
        }
      },
    ))
  };
  *this.lock().unwrap() = Arc::downgrade(&listener);
  listener.listen().unwrap();

  let (raw, iface) = hidraw(0, Bus::Usb);
  transport.plug(raw, iface);
  let results = receiver.recv_timeout(TIMEOUT).unwrap();
  assert_eq!(
    results,
    vec![
      Err(StateError::CalledFromCallback("stop").to_string()),
      Err(StateError::CalledFromCallback("enumerate").to_string()),
      Err(StateError::CalledFromCallback("listen").to_string()),
    ]
  );

  assert_eq!(listener.state(), ListenerState::Listening);
  listener.stop().unwrap();
}

#[test]
fn bus_and_device_class_filters_narrow_arrivals() {
  let transport = MemoryTransport::new();
  let (listener, log) = logging_listener(&transport, &[InterfaceClass::Hid]);
  listener.include_class(InterfaceClass::UsbDevice).unwrap();
  listener.include_bus(Bus::Bluetooth).unwrap();
  listener.include_device_class(DeviceClass::Hid).unwrap();
  listener.listen().unwrap();

  let (raw, iface) = hidraw(0, Bus::Usb);
  transport.plug(raw, iface);
  let (raw, iface) = usb_device(2);
  transport.plug(raw, iface);
  let (raw, iface) = hidraw(1, Bus::Bluetooth);
  transport.plug(raw, iface);
  log.wait_len(1);

  // Filtered arrivals have no departure either.
  transport.unplug("/dev/hidraw0").unwrap();
  transport.unplug("/dev/hidraw1").unwrap();

  listener.stop().unwrap();
  assert_eq!(
    log.entries(),
    vec!["arrive /dev/hidraw1", "depart /dev/hidraw1"]
  );
}

#[test]
fn unresolvable_arrivals_are_dropped() {
  let transport = MemoryTransport::new();
  let (listener, log) = logging_listener(&transport, &[InterfaceClass::Hid]);
  listener.listen().unwrap();

  transport.fail_resolution("/dev/hidraw0");
  let (raw, iface) = hidraw(0, Bus::Usb);
  transport.plug(raw, iface);
  transport.unplug("/dev/hidraw0").unwrap();
  let (raw, iface) = hidraw(1, Bus::Usb);
  transport.plug(raw, iface);

  listener.stop().unwrap();
  assert_eq!(log.entries(), vec!["arrive /dev/hidraw1"]);
}

#[test]
fn restarted_listener_forgets_earlier_arrivals() {
  let transport = MemoryTransport::new();
  let (listener, log) = logging_listener(&transport, &[InterfaceClass::Hid]);
  listener.listen().unwrap();
  let (raw, iface) = hidraw(0, Bus::Usb);
  transport.plug(raw, iface);
  listener.stop().unwrap();

  listener.listen().unwrap();
  assert_eq!(listener.state(), ListenerState::Listening);
  transport.unplug("/dev/hidraw0").unwrap();
  listener.stop().unwrap();

  assert_eq!(log.entries(), vec!["arrive /dev/hidraw0"]);
}

#[test]
fn properties_resolve_lazily_inside_callbacks() {
  let transport = MemoryTransport::new();
  let (sender, receiver) = mpsc::channel();
  let sender = Mutex::new(sender);
  let listener = Listener::with_transport(transport.clone(), vec![InterfaceClass::Hid], move |iface, arrived| {
    if arrived {
      let device = iface.device();
      sender
        .lock()
        .unwrap()
        .send((device.vendor_id().ok(), device.product_id().ok(), device.bus_number().is_err()))
        .unwrap();
    }
  });
  listener.listen().unwrap();

  let (raw, iface) = hidraw(1, Bus::Usb);
  transport.plug(raw, iface);
  assert_eq!(
    receiver.recv_timeout(TIMEOUT).unwrap(),
    (Some(0x046d), Some(0xc52c), true)
  );

  listener.stop().unwrap();
}

#[test]
fn dropping_a_listening_listener_stops_it() {
  let transport = MemoryTransport::new();
  let (listener, log) = logging_listener(&transport, &[InterfaceClass::Hid, InterfaceClass::Printer]);
  listener.listen().unwrap();
  let (raw, iface) = hidraw(0, Bus::Usb);
  transport.plug(raw, iface);
  assert_eq!(transport.active_watches(), 2);

  drop(listener);
  assert_eq!(transport.active_watches(), 0);
  assert_eq!(log.entries(), vec!["arrive /dev/hidraw0"]);
}

#[test]
fn dropping_the_last_handle_inside_a_callback_with_a_full_queue() {
  let transport = MemoryTransport::new();
  let slot: Arc<Mutex<Option<Arc<Listener<MemoryTransport>>>>> = Arc::new(Mutex::new(None));
  let (arrived, arrivals) = mpsc::channel();
  let (go, gate) = mpsc::channel::<()>();
  let (dropped, drops) = mpsc::channel();
  let (arrived, gate, dropped) = (Mutex::new(arrived), Mutex::new(gate), Mutex::new(dropped));

  let listener = {
    let slot = slot.clone();
    Listener::with_transport(transport.clone(), vec![InterfaceClass::Hid], move |_, _| {
      let last = slot.lock().unwrap().take();
      if let Some(last) = last {
        arrived.lock().unwrap().send(()).unwrap();
        gate.lock().unwrap().recv_timeout(TIMEOUT).unwrap();
        drop(last);
        dropped.lock().unwrap().send(()).unwrap();
      }
    })
    .with_queue_capacity(1)
  };
  listener.listen().unwrap();
  let listener = Arc::new(listener);
  let handle = Arc::downgrade(&listener);
  *slot.lock().unwrap() = Some(listener);

  let (raw, iface) = hidraw(0, Bus::Usb);
  transport.plug(raw, iface);
  arrivals.recv_timeout(TIMEOUT).unwrap();

  // One event fills the queue, the next blocks its delivery.
  let pluggers = (1..3)
    .map(|n| {
      let transport = transport.clone();
      let plugger = thread::spawn(move || {
        let (raw, iface) = hidraw(n, Bus::Usb);
        transport.plug(raw, iface);
      });
      thread::sleep(Duration::from_millis(50));
      plugger
    })
    .collect::<Vec<_>>();

  go.send(()).unwrap();
  drops.recv_timeout(TIMEOUT).unwrap();
  assert!(handle.upgrade().is_none());

  let deadline = Instant::now() + TIMEOUT;
  while transport.active_watches() > 0 {
    assert!(Instant::now() < deadline, "native watches still registered");
    thread::sleep(Duration::from_millis(10));
  }
  for plugger in pluggers {
    plugger.join().unwrap();
  }
}
