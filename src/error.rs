use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum KeypipeError {
    #[error("failed to {op} terminal attributes: {source}")]
    TerminalConfig {
        op: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("terminal mode has already been applied in this process")]
    TerminalAlreadyApplied,
    #[error("failed to open device {}: {source}", path.display())]
    DeviceOpen {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("not a character device: {}", .0.display())]
    NotACharDevice(PathBuf),
    #[error("{query} query failed: {source}")]
    DeviceCapability {
        query: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("short read of {bytes} bytes from device, keyboard lost?")]
    DeviceLost { bytes: usize },
    #[error("error reading from device: {0}")]
    DeviceRead(#[source] io::Error),
    #[error("error writing to output: {0}")]
    OutputWrite(#[source] io::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl KeypipeError {
    /// Whether the error must end the capture session.
    ///
    /// Terminal failures only degrade the session; everything touching the device
    /// or the output stream is fatal.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            KeypipeError::TerminalConfig { .. } | KeypipeError::TerminalAlreadyApplied
        )
    }

    /// Whether a failed read may be retried under a [`RetryPolicy`](crate::RetryPolicy).
    ///
    /// A short read means the device went away and is never transient.
    pub fn is_transient_read(&self) -> bool {
        match self {
            KeypipeError::DeviceRead(e) => {
                e.kind() == io::ErrorKind::Interrupted || e.raw_os_error() == Some(libc::EIO)
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_errors_are_not_fatal() {
        let err = KeypipeError::TerminalConfig {
            op: "get",
            source: io::Error::from_raw_os_error(libc::ENOTTY),
        };
        assert!(!err.is_fatal());
        assert!(!KeypipeError::TerminalAlreadyApplied.is_fatal());
        assert!(KeypipeError::DeviceLost { bytes: 0 }.is_fatal());
        assert!(KeypipeError::OutputWrite(io::ErrorKind::BrokenPipe.into()).is_fatal());
    }

    #[test]
    fn only_interrupted_and_eio_reads_are_transient() {
        assert!(KeypipeError::DeviceRead(io::ErrorKind::Interrupted.into()).is_transient_read());
        assert!(KeypipeError::DeviceRead(io::Error::from_raw_os_error(libc::EIO)).is_transient_read());
        assert!(!KeypipeError::DeviceRead(io::Error::from_raw_os_error(libc::ENODEV))
            .is_transient_read());
        assert!(!KeypipeError::DeviceLost { bytes: 0 }.is_transient_read());
    }

    #[test]
    fn device_lost_message() {
        let err = KeypipeError::DeviceLost { bytes: 3 };
        assert_eq!(
            err.to_string(),
            "short read of 3 bytes from device, keyboard lost?"
        );
    }
}
