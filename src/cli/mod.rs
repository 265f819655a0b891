pub(crate) mod command;
pub(crate) mod control;
pub(crate) mod ui;

pub use self::command::{
    Args, Command, DEFAULT_SCAN_TIMEOUT, FakeArgs, LogLevel, OutputFormat, RunSettings,
};
pub use self::control::{CalibrateArgs, DeviceArgs, PushArgs};
