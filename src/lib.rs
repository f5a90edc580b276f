//! This crate captures key presses and releases from a Linux evdev input device and
//! republishes them on stdout as a stream of fixed 3-byte records (see [`encoder`]).
//!
//! While capturing, the controlling terminal is taken out of echo and canonical mode
//! by a [`TerminalModeGuard`], so the typed keys are neither shown nor consumed by the
//! shell. The original terminal attributes are restored when the guard is dropped,
//! including when the process is stopped with SIGINT, SIGTERM or SIGHUP.
//!
//! # Example
//!
//! Forward the events of one device to stdout. Note the process needs read access to the
//! device node, which usually means running as root.
//!
//! ```no_run
//! use keypipe::{
//!     ByteOrder, CaptureLoop, InputDevice, RetryPolicy, StreamEncoder, TerminationSignals,
//! };
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() {
//!     let mut signals = TerminationSignals::install();
//!     let device = InputDevice::open("/dev/input/event4").unwrap();
//!     let encoder = StreamEncoder::new(std::io::stdout().lock(), ByteOrder::Native);
//!     let mut capture = CaptureLoop::new(device, encoder, RetryPolicy::none());
//!
//!     std::process::exit(capture.run(signals.recv()).await);
//! }
//! ```

#[cfg(not(target_os = "linux"))]
compile_error!("This crate only works on Linux");

pub mod capture;
pub mod config;
pub mod device;
pub mod encoder;
mod error;
pub mod event;
pub mod terminal;

pub use capture::{
    run, CaptureLoop, CaptureState, KeySource, RetryPolicy, TerminationSignals,
};
pub use config::Config;
pub use device::{DeviceCapabilities, DeviceIdentity, DriverVersion, EventBits, InputDevice};
pub use encoder::{ByteOrder, StreamEncoder};
pub use error::KeypipeError;
pub use event::{EventBatch, EventKind, KeyValue, NormalizedKeyEvent, RawEvent};
pub use terminal::{TerminalModeGuard, TerminalState};

pub type KeypipeResult<T> = Result<T, KeypipeError>;
