use crate::error::KeypipeError;
use crate::event::{EventBatch, RawEvent, EV_KEY, EV_MAX, KEY_MAX, MAX_BATCH, RAW_EVENT_SIZE};
use crate::KeypipeResult;
use futures::{ready, Stream};
use std::fmt;
use std::fs::{self, File};
use std::future::Future;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::unix::AsyncFd;

const IOC_NRBITS: libc::c_ulong = 8;
const IOC_TYPEBITS: libc::c_ulong = 8;
const IOC_SIZEBITS: libc::c_ulong = 14;
const IOC_NRSHIFT: libc::c_ulong = 0;
const IOC_TYPESHIFT: libc::c_ulong = IOC_NRSHIFT + IOC_NRBITS;
const IOC_SIZESHIFT: libc::c_ulong = IOC_TYPESHIFT + IOC_TYPEBITS;
const IOC_DIRSHIFT: libc::c_ulong = IOC_SIZESHIFT + IOC_SIZEBITS;
const IOC_READ: libc::c_ulong = 2;

const BITS_PER_LONG: usize = mem::size_of::<libc::c_ulong>() * 8;
/// Number of `c_ulong` words needed to hold one bit per key code.
const EVENT_BITS_WORDS: usize = (KEY_MAX as usize - 1) / BITS_PER_LONG + 1;

/// Build a read-direction `ioctl` request number for the evdev (`'E'`) family.
const fn eviocr(nr: libc::c_ulong, size: usize) -> libc::c_ulong {
    (IOC_READ << IOC_DIRSHIFT)
        | (('E' as libc::c_ulong) << IOC_TYPESHIFT)
        | (nr << IOC_NRSHIFT)
        | ((size as libc::c_ulong) << IOC_SIZESHIFT)
}

const EVIOCGVERSION: libc::c_ulong = eviocr(0x01, mem::size_of::<libc::c_int>());
const EVIOCGID: libc::c_ulong = eviocr(0x02, mem::size_of::<[u16; 4]>());
/// `EVIOCGBIT(0, len)`: the bitmask of supported event types.
const EVIOCGBIT_EV: libc::c_ulong =
    eviocr(0x20, mem::size_of::<[libc::c_ulong; EVENT_BITS_WORDS]>());

/// The evdev protocol version reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverVersion {
    pub major: u16,
    pub minor: u8,
    pub patch: u8,
}

impl From<libc::c_int> for DriverVersion {
    fn from(v: libc::c_int) -> Self {
        Self {
            major: (v >> 16) as u16,
            minor: ((v >> 8) & 0xff) as u8,
            patch: (v & 0xff) as u8,
        }
    }
}

impl fmt::Display for DriverVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// The `struct input_id` of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceIdentity {
    pub bus: u16,
    pub vendor: u16,
    pub product: u16,
    pub version: u16,
}

impl From<[u16; 4]> for DeviceIdentity {
    fn from(id: [u16; 4]) -> Self {
        Self {
            bus: id[0],
            vendor: id[1],
            product: id[2],
            version: id[3],
        }
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "bus {:#x} vendor {:#x} product {:#x} version {:#x}",
            self.bus, self.vendor, self.product, self.version
        )
    }
}

/// The event types a device supports, as returned by `EVIOCGBIT(0, ..)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventBits([libc::c_ulong; EVENT_BITS_WORDS]);

impl EventBits {
    pub fn empty() -> Self {
        Self([0; EVENT_BITS_WORDS])
    }

    /// Build a mask advertising `types`. Types above `EV_MAX` are ignored.
    pub fn from_types(types: &[u16]) -> Self {
        let mut bits = Self::empty();
        for &ty in types.iter().filter(|&&ty| ty <= EV_MAX) {
            let ty = ty as usize;
            bits.0[ty / BITS_PER_LONG] |= 1 << (ty % BITS_PER_LONG);
        }
        bits
    }

    /// Whether the device advertises events of type `ty`.
    pub fn supports(&self, ty: u16) -> bool {
        let ty = ty as usize;
        if ty > EV_MAX as usize {
            return false;
        }
        self.0[ty / BITS_PER_LONG] & (1 << (ty % BITS_PER_LONG)) != 0
    }

    pub fn has_keys(&self) -> bool {
        self.supports(EV_KEY)
    }
}

impl Default for EventBits {
    fn default() -> Self {
        Self::empty()
    }
}

/// What the device told us about itself at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCapabilities {
    pub driver_version: DriverVersion,
    /// `None` if the identity query failed.
    pub identity: Option<DeviceIdentity>,
    /// `None` if the event bitmask query failed.
    pub event_bits: Option<EventBits>,
}

/// An open evdev input device (e.g. `/dev/input/event4`).
#[derive(Debug)]
pub struct InputDevice {
    path: PathBuf,
    async_fd: AsyncFd<File>,
}

impl InputDevice {
    /// Open the device node read-only.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(path: impl AsRef<Path>) -> KeypipeResult<Self> {
        let path = path.as_ref().to_path_buf();
        let open_err = |source: io::Error| KeypipeError::DeviceOpen {
            path: path.clone(),
            source,
        };

        let file_type = fs::metadata(&path).map_err(open_err)?.file_type();
        if !file_type.is_char_device() {
            return Err(KeypipeError::NotACharDevice(path.clone()));
        }

        let file = File::open(&path).map_err(open_err)?;
        set_nonblocking(file.as_raw_fd()).map_err(open_err)?;

        Ok(Self {
            async_fd: AsyncFd::new(file).map_err(open_err)?,
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Query the driver version using the `EVIOCGVERSION` ioctl.
    ///
    /// Fails if the descriptor does not speak the input event protocol.
    pub fn query_version(&self) -> KeypipeResult<DriverVersion> {
        let mut version: libc::c_int = 0;

        ioctl(self.raw_fd(), EVIOCGVERSION, &mut version as *mut _ as *mut libc::c_void)
            .map_err(|source| KeypipeError::DeviceCapability {
                query: "EVIOCGVERSION",
                source,
            })?;

        let version = DriverVersion::from(version);
        log::info!("Input driver version is {version}");

        Ok(version)
    }

    /// Query the bus/vendor/product/version identifiers using the `EVIOCGID` ioctl.
    pub fn query_identity(&self) -> KeypipeResult<DeviceIdentity> {
        let mut id = [0u16; 4];

        ioctl(self.raw_fd(), EVIOCGID, id.as_mut_ptr() as *mut libc::c_void).map_err(
            |source| KeypipeError::DeviceCapability {
                query: "EVIOCGID",
                source,
            },
        )?;

        let identity = DeviceIdentity::from(id);
        log::info!("Input device ID: {identity}");

        Ok(identity)
    }

    /// Read the event types supported by the device using the `EVIOCGBIT` ioctl.
    pub fn query_event_bits(&self) -> KeypipeResult<EventBits> {
        let mut bits = EventBits::empty();

        ioctl(
            self.raw_fd(),
            EVIOCGBIT_EV,
            bits.0.as_mut_ptr() as *mut libc::c_void,
        )
        .map_err(|source| KeypipeError::DeviceCapability {
            query: "EVIOCGBIT",
            source,
        })?;

        Ok(bits)
    }

    /// Run all capability queries. Only a failed version query is an error; the
    /// identity and bitmask queries are best effort.
    pub fn capabilities(&self) -> KeypipeResult<DeviceCapabilities> {
        let driver_version = self.query_version()?;

        let identity = self
            .query_identity()
            .map_err(|e| log::warn!("{}: {e}", self.path.display()))
            .ok();

        let event_bits = self
            .query_event_bits()
            .map_err(|e| log::warn!("{}: {e}", self.path.display()))
            .ok();

        if let Some(bits) = event_bits {
            if !bits.has_keys() {
                log::warn!("{} does not advertise key events", self.path.display());
            }
        }

        Ok(DeviceCapabilities {
            driver_version,
            identity,
            event_bits,
        })
    }

    /// Wait for the device to become readable and read one batch of events.
    pub fn read_batch(&self) -> ReadBatch<'_> {
        ReadBatch(self)
    }

    fn poll_read_batch(&self, cx: &mut Context<'_>) -> Poll<KeypipeResult<EventBatch>> {
        loop {
            let mut guard =
                ready!(self.async_fd.poll_read_ready(cx)).map_err(KeypipeError::DeviceRead)?;

            match guard.try_io(|inner| read_input_events(inner.as_raw_fd())) {
                Ok(result) => return Poll::Ready(into_batch(result)),
                Err(_would_block) => continue,
            }
        }
    }

    fn raw_fd(&self) -> RawFd {
        self.async_fd.get_ref().as_raw_fd()
    }
}

/// A future that resolves once a batch of raw events has been read.
pub struct ReadBatch<'a>(&'a InputDevice);

impl Future for ReadBatch<'_> {
    type Output = KeypipeResult<EventBatch>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.0.poll_read_batch(cx)
    }
}

impl Stream for InputDevice {
    type Item = KeypipeResult<EventBatch>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.poll_read_batch(cx).map(Some)
    }
}

/// Turn the outcome of a raw read into a batch. Anything shorter than one full
/// record means the device is gone.
fn into_batch(result: io::Result<(usize, EventBatch)>) -> KeypipeResult<EventBatch> {
    match result {
        Ok((bytes, _)) if bytes < RAW_EVENT_SIZE => Err(KeypipeError::DeviceLost { bytes }),
        Ok((_, batch)) => Ok(batch),
        Err(e) => Err(KeypipeError::DeviceRead(e)),
    }
}

/// Read up to [`MAX_BATCH`] [`libc::input_event`s](libc::input_event) from the specified
/// file descriptor. Returns the number of bytes read alongside the decoded records.
fn read_input_events(fd: RawFd) -> io::Result<(usize, EventBatch)> {
    let mut input_events = [mem::MaybeUninit::<libc::input_event>::uninit(); MAX_BATCH];

    let n = unsafe {
        libc::read(
            fd,
            input_events.as_mut_ptr() as *mut libc::c_void,
            mem::size_of_val(&input_events),
        )
    };

    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    let bytes = n as usize;

    // The first bytes / RAW_EVENT_SIZE elements of the array are initialized:
    let batch = input_events[..bytes / RAW_EVENT_SIZE]
        .iter()
        .map(|e| RawEvent::from(unsafe { e.assume_init_ref() }))
        .collect();

    Ok((bytes, batch))
}

/// Set the `O_NONBLOCK` flag for the specified file descriptor.
fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };

    if flags < 0 {
        return Err(io::Error::last_os_error());
    }

    let res = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };

    if res < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

fn ioctl(fd: RawFd, request: libc::c_ulong, buf: *mut libc::c_void) -> io::Result<()> {
    let res = unsafe { libc::ioctl(fd, request as _, buf) };

    if res < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EV_MSC, EV_REP, EV_SYN};

    #[test]
    fn ioctl_numbers_match_linux_headers() {
        assert_eq!(EVIOCGVERSION, 0x8004_4501);
        assert_eq!(EVIOCGID, 0x8008_4502);
        let len = (EVENT_BITS_WORDS * mem::size_of::<libc::c_ulong>()) as libc::c_ulong;
        assert_eq!(EVIOCGBIT_EV, 0x8000_4520 | (len << 16));
    }

    #[test]
    fn bitmask_covers_key_space() {
        assert!(EVENT_BITS_WORDS * BITS_PER_LONG >= KEY_MAX as usize);
    }

    #[test]
    fn driver_version_split() {
        let v = DriverVersion::from(0x0001_0001);
        assert_eq!(v.to_string(), "1.0.1");
        let v = DriverVersion::from(0x0002_0304);
        assert_eq!((v.major, v.minor, v.patch), (2, 3, 4));
    }

    #[test]
    fn identity_display() {
        let id = DeviceIdentity::from([0x03, 0x046d, 0xc31c, 0x0110]);
        assert_eq!(
            id.to_string(),
            "bus 0x3 vendor 0x46d product 0xc31c version 0x110"
        );
    }

    #[test]
    fn event_bits_lookup() {
        let bits = EventBits::from_types(&[EV_SYN, EV_KEY, EV_MSC, EV_REP]);
        assert!(bits.has_keys());
        assert!(bits.supports(EV_REP));
        assert!(!bits.supports(0x02));
        assert!(!bits.supports(KEY_MAX));
        assert!(!EventBits::empty().has_keys());
    }

    #[test]
    fn event_bits_ignore_out_of_range_types() {
        let bits = EventBits::from_types(&[EV_KEY, EV_MAX + 1, KEY_MAX, u16::MAX]);
        assert_eq!(bits, EventBits::from_types(&[EV_KEY]));
    }

    #[test]
    fn nonblocking_on_bad_fd_fails() {
        let err = set_nonblocking(-1).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EBADF));
    }

    #[test]
    fn short_read_means_device_lost() {
        for bytes in [0, 1, RAW_EVENT_SIZE - 1] {
            match into_batch(Ok((bytes, EventBatch::new()))) {
                Err(KeypipeError::DeviceLost { bytes: b }) => assert_eq!(b, bytes),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn full_record_read_is_a_batch() {
        let batch: EventBatch = std::iter::once(RawEvent::default()).collect();
        let got = into_batch(Ok((RAW_EVENT_SIZE, batch))).unwrap();
        assert_eq!(got.len(), 1);
    }

    #[test]
    fn read_from_pipe_decodes_records() {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);

        let ev = libc::input_event {
            time: libc::timeval {
                tv_sec: 10,
                tv_usec: 20,
            },
            type_: EV_KEY,
            code: 30,
            value: 1,
        };
        let written = unsafe {
            libc::write(
                fds[1],
                &ev as *const libc::input_event as *const libc::c_void,
                RAW_EVENT_SIZE,
            )
        };
        assert_eq!(written as usize, RAW_EVENT_SIZE);
        unsafe { libc::close(fds[1]) };

        let (bytes, batch) = read_input_events(fds[0]).unwrap();
        assert_eq!(bytes, RAW_EVENT_SIZE);
        assert_eq!(
            batch.as_slice(),
            &[RawEvent {
                sec: 10,
                usec: 20,
                kind: EV_KEY,
                code: 30,
                value: 1
            }]
        );

        // Writer closed: the next read returns 0 bytes.
        let (bytes, batch) = read_input_events(fds[0]).unwrap();
        assert_eq!(bytes, 0);
        assert!(batch.is_empty());
        unsafe { libc::close(fds[0]) };
    }

    /// An `InputDevice` over the read end of a pipe, plus the write end.
    fn pipe_device() -> (InputDevice, RawFd) {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        set_nonblocking(fds[0]).unwrap();

        let file = unsafe { <File as std::os::fd::FromRawFd>::from_raw_fd(fds[0]) };
        let device = InputDevice {
            path: PathBuf::from("pipe"),
            async_fd: AsyncFd::new(file).unwrap(),
        };
        (device, fds[1])
    }

    fn write_key(fd: RawFd, code: u16, value: i32) {
        let ev = libc::input_event {
            time: libc::timeval {
                tv_sec: 0,
                tv_usec: 0,
            },
            type_: EV_KEY,
            code,
            value,
        };
        let written = unsafe {
            libc::write(
                fd,
                &ev as *const libc::input_event as *const libc::c_void,
                RAW_EVENT_SIZE,
            )
        };
        assert_eq!(written as usize, RAW_EVENT_SIZE);
    }

    #[tokio::test]
    async fn read_batch_waits_for_records_then_reports_loss() {
        let (device, writer) = pipe_device();

        write_key(writer, 30, 1);
        write_key(writer, 30, 0);

        let batch = device.read_batch().await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.as_slice()[0].code, 30);
        assert_eq!(batch.as_slice()[1].value, 0);

        unsafe { libc::close(writer) };

        match device.read_batch().await {
            Err(KeypipeError::DeviceLost { bytes: 0 }) => {}
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn stream_yields_batches() {
        use futures::StreamExt;

        let (mut device, writer) = pipe_device();
        write_key(writer, 57, 1);

        let batch = device.next().await.unwrap().unwrap();
        assert_eq!(batch.as_slice(), &[RawEvent::key(57, crate::event::KeyValue::Pressed)]);

        unsafe { libc::close(writer) };
    }
}
