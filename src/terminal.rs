use crate::error::KeypipeError;
use crate::KeypipeResult;
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};

/// Set once the first guard has taken its snapshot.
static APPLIED: AtomicBool = AtomicBool::new(false);

/// Terminal attributes captured before they were changed.
#[derive(Clone, Copy)]
pub struct TerminalState {
    termios: libc::termios,
}

impl TerminalState {
    /// Read the current attributes of `fd`.
    pub fn capture(fd: RawFd) -> KeypipeResult<Self> {
        let mut termios = unsafe { std::mem::zeroed::<libc::termios>() };

        if unsafe { libc::tcgetattr(fd, &mut termios) } < 0 {
            return Err(KeypipeError::TerminalConfig {
                op: "get",
                source: io::Error::last_os_error(),
            });
        }

        Ok(Self { termios })
    }

    pub fn echo(&self) -> bool {
        self.termios.c_lflag & libc::ECHO != 0
    }

    pub fn canonical(&self) -> bool {
        self.termios.c_lflag & libc::ICANON != 0
    }

    pub fn min_read(&self) -> u8 {
        self.termios.c_cc[libc::VMIN]
    }

    /// Inter-byte read timeout, in tenths of a second.
    pub fn read_timeout(&self) -> u8 {
        self.termios.c_cc[libc::VTIME]
    }

    /// Attributes with echo and canonical input off, returning whatever is available
    /// after at most a tenth of a second.
    fn raw(&self) -> Self {
        let mut termios = self.termios;
        termios.c_lflag &= !(libc::ECHO | libc::ICANON);
        termios.c_cc[libc::VMIN] = 0;
        termios.c_cc[libc::VTIME] = 1;
        Self { termios }
    }

    fn commit(&self, fd: RawFd) -> io::Result<()> {
        if unsafe { libc::tcsetattr(fd, libc::TCSAFLUSH, &self.termios) } < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

impl std::fmt::Debug for TerminalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalState")
            .field("echo", &self.echo())
            .field("canonical", &self.canonical())
            .field("min_read", &self.min_read())
            .field("read_timeout", &self.read_timeout())
            .finish()
    }
}

/// Keeps the terminal out of echo and canonical mode for as long as it lives, and
/// puts the original attributes back when dropped.
#[derive(Debug)]
pub struct TerminalModeGuard {
    fd: RawFd,
    saved: TerminalState,
}

impl TerminalModeGuard {
    /// Snapshot the attributes of `fd` and switch it to non-echoing, non-canonical
    /// input. Only one guard can ever be applied per process.
    pub fn apply(fd: RawFd) -> KeypipeResult<Self> {
        let saved = TerminalState::capture(fd)?;

        if APPLIED.swap(true, Ordering::SeqCst) {
            return Err(KeypipeError::TerminalAlreadyApplied);
        }

        saved
            .raw()
            .commit(fd)
            .map_err(|source| KeypipeError::TerminalConfig { op: "set", source })?;

        log::debug!("terminal fd {fd} switched to raw input, saved {saved:?}");

        Ok(Self { fd, saved })
    }
}

impl Drop for TerminalModeGuard {
    fn drop(&mut self) {
        match self.saved.commit(self.fd) {
            Ok(()) => log::debug!("terminal fd {} restored", self.fd),
            Err(e) => log::warn!("failed to restore terminal attributes: {e}"),
        }
    }
}
