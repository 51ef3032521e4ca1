mod args;
mod report;

use self::{
  args::{Args, LogFormat, Output},
  report::Report,
};
use anyhow::{Context, Result};
use clap::Parser;
use hotplug::{transport::PlatformTransport, Listener};
use tracing::{event, Level};
use tracing_subscriber::EnvFilter;

#[cfg(unix)]
use crate::signals::Signal;

#[cfg(unix)]
#[derive(Debug, PartialEq, Eq)]
enum Action {
  Enumerate,
  Wait,
  Shutdown,
}

struct App {
  listener: Listener<PlatformTransport>,
  enumerate: bool,
}

impl App {
  fn new(args: &Args) -> Result<Self> {
    let output = args.output;
    let listener = Listener::new(args.classes.iter().copied(), move |iface, arrived| {
      let report = Report::new(iface, arrived);
      println!("{}", report.render(output));
      if arrived && output == Output::Text {
        let path = report.path;
        if let Err(e) = iface.on_detach(move || println!("detach path={}", path)) {
          event!(target: "hotplug-announce", Level::WARN, error = %e, "failed to register detach callback");
        }
      }
    })
    .context("create listener")?;

    for class in &args.device_classes {
      listener.include_device_class(*class)?;
    }

    for bus in &args.buses {
      listener.include_bus(*bus)?;
    }

    Ok(App {
      listener,
      enumerate: args.enumerate,
    })
  }

  #[cfg(unix)]
  fn run(&mut self) -> Result<()> {
    let mut signals = Signal::watch()?;
    self.start()?;

    let mut action = if self.enumerate {
      Action::Enumerate
    } else {
      Action::Wait
    };
    loop {
      action = match action {
        Action::Shutdown => break,
        Action::Enumerate => {
          self.enumerate()?;
          Action::Wait
        }
        Action::Wait => Self::on_signal(signals.next()),
      };
    }

    self.listener.stop().context("stop listener")
  }

  #[cfg(not(unix))]
  fn run(&mut self) -> Result<()> {
    self.start()?;
    if self.enumerate {
      self.enumerate()?;
    }

    event!(target: "hotplug-announce", Level::INFO, "Close standard input to stop.");
    let mut line = String::new();
    while std::io::stdin().read_line(&mut line).context("read stdin")? > 0 {
      line.clear();
    }

    self.listener.stop().context("stop listener")
  }

  fn start(&mut self) -> Result<()> {
    self.listener.listen().context("start listener")?;
    event!(
      target: "hotplug-announce",
      Level::INFO,
      filter = ?self.listener.filter(),
      "Listening for hotplug events"
    );
    Ok(())
  }

  fn enumerate(&mut self) -> Result<()> {
    self.listener.enumerate().context("enumerate present devices")
  }

  #[cfg(unix)]
  fn on_signal(signal: Option<Signal>) -> Action {
    match signal {
      None => {
        event!(
          target: "hotplug-announce",
          Level::ERROR,
          "Signal stream stopped, shutting down.",
        );
        Action::Shutdown
      }
      Some(Signal::SigHup) => {
        event!(target: "hotplug-announce", Level::INFO, "Received SIGHUP, enumerating");
        Action::Enumerate
      }
      Some(s) => {
        event!(
          target: "hotplug-announce",
          Level::INFO,
          "Received signal {}, shutting down.",
          s
        );
        Action::Shutdown
      }
    }
  }
}

pub fn run() -> Result<()> {
  let args = Args::parse();
  let filter = EnvFilter::from_default_env()
    // Set the base level when not matched by other directives to INFO.
    .add_directive(tracing::Level::INFO.into());

  match args.log_format {
    LogFormat::Pretty => {
      tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    LogFormat::Json => {
      tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .with_current_span(false)
        .with_span_list(false)
        .init();
    }
  }

  let mut app = App::new(&args)?;
  app.run()?;
  Ok(())
}

#[cfg(all(test, unix))]
mod tests {
  use super::*;

  #[test]
  fn only_hangup_requests_enumeration() {
    assert_eq!(App::on_signal(Some(Signal::SigHup)), Action::Enumerate);
    assert_eq!(App::on_signal(Some(Signal::SigTerm)), Action::Shutdown);
    assert_eq!(App::on_signal(Some(Signal::SigInt)), Action::Shutdown);
    assert_eq!(App::on_signal(None), Action::Shutdown);
  }
}
