//! Notification bridge between the native notification thread and the pump.
//!
//! Native callbacks must return promptly and must never run user code, so
//! all they do here is classify the action, hand over the already-copied
//! payload and push it onto the bounded queue. The queue is the only structure
//! shared with the pump thread.

use crate::{
  class::InterfaceClass,
  event::{Action, RawDevice, RawEvent},
};
use tokio::sync::mpsc::{self, Receiver, Sender};
use tracing::{event, Level};

/// Default capacity of the event queue between bridge and pump.
pub const QUEUE_CAPACITY: usize = 10;

#[derive(Debug)]
pub(crate) enum Message {
  Event {
    class: InterfaceClass,
    event: RawEvent,
  },

  /// Sent by the listener once every native watch is gone; the pump exits
  /// after draining everything queued before it.
  Close,
}

/// Outcome of handing one notification to the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
  Queued,
  Ignored,

  /// The pump has exited; the watch delivering into this sink is stale.
  Closed,
}

/// Handle given to a native watch for delivering notifications.
///
/// Each watch gets its own sink, tagged with the interface class it watches.
///
/// When the queue is full, delivery blocks the calling native thread until the
/// pump catches up. A slow user callback therefore stalls native delivery
/// once the queue fills.
#[derive(Debug, Clone)]
pub struct NotificationSink {
  sender: Sender<Message>,
  class: InterfaceClass,
}

pub(crate) fn channel(capacity: usize) -> (Sender<Message>, Receiver<Message>) {
  mpsc::channel(capacity.max(1))
}

impl NotificationSink {
  pub(crate) fn new(sender: Sender<Message>, class: InterfaceClass) -> Self {
    NotificationSink { sender, class }
  }

  /// Interface class of the watch this sink belongs to.
  pub fn class(&self) -> InterfaceClass {
    self.class
  }

  /// Delivers a notification from a plain native callback thread.
  ///
  /// Must not be called from inside an async runtime; async monitor threads
  /// use [`notify_async`](Self::notify_async).
  pub fn notify(&self, action: Action, device: RawDevice) -> Delivery {
    match self.classify(action, device) {
      None => Delivery::Ignored,
      Some(message) => match self.sender.blocking_send(message) {
        Ok(()) => Delivery::Queued,
        Err(_) => Delivery::Closed,
      },
    }
  }

  pub async fn notify_async(&self, action: Action, device: RawDevice) -> Delivery {
    match self.classify(action, device) {
      None => Delivery::Ignored,
      Some(message) => match self.sender.send(message).await {
        Ok(()) => Delivery::Queued,
        Err(_) => Delivery::Closed,
      },
    }
  }

  pub fn is_closed(&self) -> bool {
    self.sender.is_closed()
  }

  fn classify(&self, action: Action, device: RawDevice) -> Option<Message> {
    event!(
      target: "hotplug",
      Level::TRACE,
      event.action = %action,
      event.identity = %device.identity,
      event.class = %self.class,
      "native notification received"
    );

    let class = self.class;
    action
      .classify(device)
      .map(|event| Message::Event { class, event })
  }
}
