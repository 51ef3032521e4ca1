use clap::{ArgEnum, Parser};
use hotplug::{Bus, DeviceClass, InterfaceClass};

#[derive(ArgEnum, Debug, PartialEq, Clone, Copy)]
pub enum LogFormat {
  Pretty,
  Json,
}

#[derive(ArgEnum, Debug, PartialEq, Clone, Copy)]
pub enum Output {
  Text,
  Json,
}

#[derive(Parser, Debug)]
#[clap(name = "hotplug-announce", about = "Prints device arrivals and departures")]
pub struct Args {
  /// Log output format
  #[clap(
    arg_enum,
    long = "log-format",
    short = 'f',
    env = "LOG_FORMAT",
    default_value = "pretty"
  )]
  pub log_format: LogFormat,

  /// Interface classes to watch
  #[clap(
    long = "class",
    short = 'c',
    env = "HOTPLUG_CLASSES",
    use_value_delimiter = true,
    default_value = "hid"
  )]
  pub classes: Vec<InterfaceClass>,

  /// Only report devices of these classes
  #[clap(long = "device-class", short = 'd', use_value_delimiter = true)]
  pub device_classes: Vec<DeviceClass>,

  /// Only report devices on these buses
  #[clap(long = "bus", short = 'b', use_value_delimiter = true)]
  pub buses: Vec<Bus>,

  /// Report devices already present after listening starts
  #[clap(long = "enumerate", short = 'e')]
  pub enumerate: bool,

  /// Report output format
  #[clap(
    arg_enum,
    long = "output",
    short = 'o',
    env = "HOTPLUG_OUTPUT",
    default_value = "text"
  )]
  pub output: Output,
}
