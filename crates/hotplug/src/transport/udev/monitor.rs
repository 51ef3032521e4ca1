use super::raw_device;
use crate::{
  bridge::{Delivery, NotificationSink},
  class::Criteria,
  error::NativeError,
  event::Action,
};
use futures::StreamExt;
use std::thread::{self, JoinHandle};
use tokio::{
  runtime::Builder,
  select,
  sync::oneshot,
  task::LocalSet,
};
use tokio_udev::{AsyncMonitorSocket, MonitorBuilder};
use tracing::{event, Level};

const MONITOR_THREAD_NAME: &str = "udev-monitor";

/// One netlink monitor, owned by its own thread.
///
/// The monitor socket lives and dies on that thread. Stopping the watch
/// signals the thread and joins it, so no delivery is in flight afterwards.
pub struct UdevWatch {
  subsystem: &'static str,
  signal: Option<oneshot::Sender<()>>,
  thread: Option<JoinHandle<()>>,
}

impl UdevWatch {
  pub(super) fn start(criteria: &'static Criteria, sink: NotificationSink) -> Result<Self, NativeError> {
    let (ready_sender, ready) = oneshot::channel();
    let (signal, signal_receiver) = oneshot::channel();
    let thread = thread::Builder::new()
      .name(MONITOR_THREAD_NAME.into())
      .spawn(move || Self::bg_thread(criteria, sink, ready_sender, signal_receiver))
      .map_err(NativeError::io("spawn udev monitor"))?;

    let mut watch = UdevWatch {
      subsystem: criteria.subsystem,
      signal: Some(signal),
      thread: Some(thread),
    };

    match ready.blocking_recv() {
      Ok(Ok(())) => Ok(watch),
      Ok(Err(e)) => {
        watch.shutdown()?;
        Err(e)
      }
      Err(_) => {
        watch.shutdown()?;
        Err(NativeError::ThreadLost(MONITOR_THREAD_NAME.into()))
      }
    }
  }

  pub(super) fn stop(mut self) -> Result<(), NativeError> {
    self.shutdown()
  }

  fn shutdown(&mut self) -> Result<(), NativeError> {
    drop(self.signal.take());
    match self.thread.take() {
      None => Ok(()),
      Some(thread) => thread
        .join()
        .map_err(|_| NativeError::ThreadLost(MONITOR_THREAD_NAME.into())),
    }
  }

  fn bg_thread(
    criteria: &'static Criteria,
    sink: NotificationSink,
    ready: oneshot::Sender<Result<(), NativeError>>,
    signal: oneshot::Receiver<()>,
  ) {
    let rt = match Builder::new_current_thread().enable_all().build() {
      Ok(rt) => rt,
      Err(e) => {
        let _ = ready.send(Err(NativeError::io("build monitor runtime")(e)));
        return;
      }
    };

    let local = LocalSet::new();
    local.block_on(&rt, Self::bg_task(criteria, sink, ready, signal));
  }

  async fn bg_task(
    criteria: &'static Criteria,
    sink: NotificationSink,
    ready: oneshot::Sender<Result<(), NativeError>>,
    signal: oneshot::Receiver<()>,
  ) {
    let mut socket = match Self::listen(criteria) {
      Ok(socket) => {
        let _ = ready.send(Ok(()));
        socket
      }
      Err(e) => {
        let _ = ready.send(Err(e));
        return;
      }
    };

    let mut signal = futures::stream::once(signal);
    loop {
      let e = select! {
        _ = signal.next() => return,
        e = socket.next() => match e { None => return, Some(e) => e },
      };

      let evt = match e {
        Ok(evt) => evt,
        Err(e) => {
          event!(
            target: "hotplug",
            Level::WARN,
            error = %e,
            subsystem = criteria.subsystem,
            "failed to receive udev event"
          );
          continue;
        }
      };

      let action = Action::from(evt.event_type());
      let raw = match raw_device(&evt.device()) {
        Some(raw) => raw,
        None => continue,
      };

      if sink.notify_async(action, raw).await == Delivery::Closed {
        return;
      }
    }
  }

  fn listen(criteria: &Criteria) -> Result<AsyncMonitorSocket, NativeError> {
    let builder = MonitorBuilder::new().map_err(NativeError::io("udev_monitor_new_from_netlink"))?;
    let builder = match criteria.devtype {
      None => builder.match_subsystem(criteria.subsystem),
      Some(devtype) => builder.match_subsystem_devtype(criteria.subsystem, devtype),
    }
    .map_err(NativeError::io("udev_monitor_filter_add_match_subsystem_devtype"))?;

    let socket = builder
      .listen()
      .map_err(NativeError::io("udev_monitor_enable_receiving"))?;
    AsyncMonitorSocket::new(socket).map_err(NativeError::io("register udev monitor socket"))
  }
}

impl std::fmt::Debug for UdevWatch {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("UdevWatch")
      .field("subsystem", &self.subsystem)
      .field("running", &self.thread.is_some())
      .finish()
  }
}

impl Drop for UdevWatch {
  fn drop(&mut self) {
    if let Err(e) = self.shutdown() {
      event!(
        target: "hotplug",
        Level::ERROR,
        error = %e,
        subsystem = self.subsystem,
        "udev monitor thread lost"
      );
    }
  }
}
