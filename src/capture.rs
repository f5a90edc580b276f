use crate::config::Config;
use crate::device::{DeviceCapabilities, InputDevice};
use crate::encoder::StreamEncoder;
use crate::error::KeypipeError;
use crate::event::{translate, EventBatch};
use crate::terminal::TerminalModeGuard;
use crate::KeypipeResult;
use futures::{Stream, StreamExt};
use std::future::Future;
use std::io::{self, Write};
use std::time::Duration;
use tokio::signal::unix::{signal, Signal, SignalKind};

/// Exit status for every fatal initialization or I/O failure.
pub const EXIT_FAILURE: i32 = 1;

/// Where a capture session is in its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    /// The terminal is being configured and the device opened.
    Init,
    /// The device is open and its capabilities are being queried.
    Validating,
    /// Events are being read and forwarded.
    Capturing,
    /// The session is over; the process exits with this status.
    Terminated(i32),
}

/// How transient read errors are handled. Short reads are never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    /// Give up on the first read error.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            delay: Duration::from_millis(10),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

/// A source of raw event batches that can describe itself.
pub trait KeySource: Stream<Item = KeypipeResult<EventBatch>> + Unpin {
    /// Query the source's capabilities. An error here ends the session.
    fn capabilities(&self) -> KeypipeResult<DeviceCapabilities>;
}

impl KeySource for InputDevice {
    fn capabilities(&self) -> KeypipeResult<DeviceCapabilities> {
        InputDevice::capabilities(self)
    }
}

/// Reads batches from a [`KeySource`], translates them and writes the key events
/// out until something fatal happens.
pub struct CaptureLoop<S, W> {
    source: S,
    encoder: StreamEncoder<W>,
    retry: RetryPolicy,
    state: CaptureState,
    capabilities: Option<DeviceCapabilities>,
}

enum Next {
    Batch(Option<KeypipeResult<EventBatch>>),
    Shutdown(i32),
}

impl<S: KeySource, W: Write> CaptureLoop<S, W> {
    /// Create a loop over an already opened source.
    pub fn new(source: S, encoder: StreamEncoder<W>, retry: RetryPolicy) -> Self {
        Self {
            source,
            encoder,
            retry,
            state: CaptureState::Validating,
            capabilities: None,
        }
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    pub fn capabilities(&self) -> Option<&DeviceCapabilities> {
        self.capabilities.as_ref()
    }

    pub fn output(&self) -> &W {
        self.encoder.get_ref()
    }

    /// Validate the source and forward events until a fatal error or until
    /// `shutdown` resolves with an exit status. Returns the exit status.
    pub async fn run(&mut self, shutdown: impl Future<Output = i32>) -> i32 {
        futures::pin_mut!(shutdown);

        if self.state == CaptureState::Validating {
            match self.source.capabilities() {
                Ok(caps) => {
                    self.capabilities = Some(caps);
                    self.transition(CaptureState::Capturing);
                }
                Err(e) => return self.fail(e),
            }
        }

        let mut retries = 0;

        while self.state == CaptureState::Capturing {
            let next = tokio::select! {
                batch = self.source.next() => Next::Batch(batch),
                code = &mut shutdown => Next::Shutdown(code),
            };

            match next {
                Next::Batch(Some(Ok(batch))) => {
                    retries = 0;
                    if let Err(e) = self.forward(&batch) {
                        return self.fail(e);
                    }
                }
                Next::Batch(Some(Err(e)))
                    if e.is_transient_read() && retries < self.retry.max_retries =>
                {
                    retries += 1;
                    log::warn!(
                        "{e}, retrying ({retries}/{})",
                        self.retry.max_retries
                    );
                    tokio::time::sleep(self.retry.delay).await;
                }
                Next::Batch(Some(Err(e))) => return self.fail(e),
                Next::Batch(None) => return self.fail(KeypipeError::DeviceLost { bytes: 0 }),
                Next::Shutdown(code) => {
                    log::info!("termination signal received, stopping capture");
                    self.transition(CaptureState::Terminated(code));
                }
            }
        }

        match self.state {
            CaptureState::Terminated(code) => code,
            _ => EXIT_FAILURE,
        }
    }

    fn forward(&mut self, batch: &EventBatch) -> KeypipeResult<()> {
        for ev in translate(batch.as_slice()) {
            self.encoder.emit(ev)?;
        }
        Ok(())
    }

    fn fail(&mut self, e: KeypipeError) -> i32 {
        log::error!("{e}");
        self.transition(CaptureState::Terminated(EXIT_FAILURE));
        EXIT_FAILURE
    }

    fn transition(&mut self, next: CaptureState) {
        log::debug!("capture state {:?} -> {next:?}", self.state);
        self.state = next;
    }
}

/// Listeners for SIGINT, SIGTERM and SIGHUP.
///
/// The handlers are registered when this is created, so a signal delivered before
/// [`recv`](Self::recv) is first awaited is still observed. Must be created from
/// within a tokio runtime.
pub struct TerminationSignals {
    signals: Vec<(Signal, i32)>,
}

impl TerminationSignals {
    pub fn install() -> Self {
        let kinds = [
            (SignalKind::interrupt(), libc::SIGINT),
            (SignalKind::terminate(), libc::SIGTERM),
            (SignalKind::hangup(), libc::SIGHUP),
        ];

        let mut signals = Vec::with_capacity(kinds.len());
        for (kind, signo) in kinds {
            match signal(kind) {
                Ok(s) => signals.push((s, signo)),
                Err(e) => log::warn!("cannot listen for signal {signo}: {e}"),
            }
        }

        Self { signals }
    }

    /// Resolves with `128 + signo` once one of the signals is delivered.
    pub async fn recv(&mut self) -> i32 {
        if self.signals.is_empty() {
            return std::future::pending().await;
        }

        let waits = self.signals.iter_mut().map(|(s, signo)| {
            Box::pin(async move {
                s.recv().await;
                *signo
            })
        });

        let (signo, _, _) = futures::future::select_all(waits).await;
        128 + signo
    }
}

/// Run a whole capture session as configured and return the process exit status.
///
/// The terminal and the device are released before this returns.
pub async fn run(config: &Config) -> i32 {
    log::debug!("capture state {:?}", CaptureState::Init);

    // Listen before touching the terminal so a signal can never skip the restore.
    let mut signals = TerminationSignals::install();

    let _terminal = if config.keep_terminal {
        None
    } else {
        TerminalModeGuard::apply(libc::STDIN_FILENO)
            .map_err(|e| log::warn!("{e}, continuing without raw terminal mode"))
            .ok()
    };

    let device = match InputDevice::open(&config.device) {
        Ok(device) => device,
        Err(e) => {
            log::error!("{e}");
            return EXIT_FAILURE;
        }
    };

    log::debug!("opened {}", device.path().display());

    let encoder = StreamEncoder::new(io::stdout().lock(), config.byte_order);
    let mut capture = CaptureLoop::new(device, encoder, config.retry_policy());

    capture.run(signals.recv()).await
}
