use chrono::{DateTime, NaiveDateTime};
use std::convert::TryFrom;
use std::mem;

// Some interesting Event types (see [input-event-codes.h] and the [kernel docs]).
//
// [input-event-codes.h]: https://elixir.bootlin.com/linux/v5.19.17/source/include/uapi/linux/input-event-codes.h#L38)
// [kernel docs]: https://www.kernel.org/doc/html/latest/input/event-codes.html
pub(crate) const EV_SYN: u16 = 0x00;
pub(crate) const EV_KEY: u16 = 0x01;
pub(crate) const EV_MSC: u16 = 0x04;
pub(crate) const EV_REP: u16 = 0x14;
pub(crate) const EV_MAX: u16 = 0x1f;
pub(crate) const KEY_MAX: u16 = 0x2ff;

/// The number of raw records requested from the device in one read.
pub const MAX_BATCH: usize = 64;

/// The size in bytes of one kernel `input_event` record.
pub const RAW_EVENT_SIZE: usize = mem::size_of::<libc::input_event>();

/// The category of a raw event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Syn,
    Key,
    Misc,
    Repeat,
    Other(u16),
}

impl From<u16> for EventKind {
    fn from(ty: u16) -> Self {
        match ty {
            EV_SYN => EventKind::Syn,
            EV_KEY => EventKind::Key,
            EV_MSC => EventKind::Misc,
            EV_REP => EventKind::Repeat,
            n => EventKind::Other(n),
        }
    }
}

/// The `value` of an EV_KEY event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum KeyValue {
    Released = 0,
    Pressed = 1,
    Repeated = 2,
}

impl TryFrom<i32> for KeyValue {
    type Error = i32;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(KeyValue::Released),
            1 => Ok(KeyValue::Pressed),
            2 => Ok(KeyValue::Repeated),
            n => Err(n),
        }
    }
}

/// One record as delivered by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RawEvent {
    pub sec: i64,
    pub usec: i64,
    pub kind: u16,
    pub code: u16,
    pub value: i32,
}

impl RawEvent {
    pub fn key(code: u16, value: KeyValue) -> Self {
        Self {
            kind: EV_KEY,
            code,
            value: value as i32,
            ..Self::default()
        }
    }

    pub fn kind(&self) -> EventKind {
        EventKind::from(self.kind)
    }

    /// The event timestamp, if it is representable. Only used for diagnostics.
    pub fn timestamp(&self) -> Option<NaiveDateTime> {
        let nsec = u32::try_from(self.usec.checked_mul(1000)?).ok()?;
        DateTime::from_timestamp(self.sec, nsec).map(|dt| dt.naive_utc())
    }
}

impl From<&libc::input_event> for RawEvent {
    fn from(ev: &libc::input_event) -> Self {
        Self {
            sec: ev.time.tv_sec as i64,
            usec: ev.time.tv_usec as i64,
            kind: ev.type_,
            code: ev.code,
            value: ev.value,
        }
    }
}

/// Up to [`MAX_BATCH`] events from a single device read.
#[derive(Debug, Clone, Copy)]
pub struct EventBatch {
    events: [RawEvent; MAX_BATCH],
    len: usize,
}

impl EventBatch {
    pub fn new() -> Self {
        Self {
            events: [RawEvent::default(); MAX_BATCH],
            len: 0,
        }
    }

    /// Append an event. Returns `false` if the batch is already full.
    pub fn push(&mut self, ev: RawEvent) -> bool {
        if self.len == MAX_BATCH {
            return false;
        }
        self.events[self.len] = ev;
        self.len += 1;
        true
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[RawEvent] {
        &self.events[..self.len]
    }
}

impl Default for EventBatch {
    fn default() -> Self {
        Self::new()
    }
}

impl FromIterator<RawEvent> for EventBatch {
    /// Collects at most [`MAX_BATCH`] events; the rest are dropped.
    fn from_iter<I: IntoIterator<Item = RawEvent>>(iter: I) -> Self {
        let mut batch = Self::new();
        for ev in iter.into_iter().take(MAX_BATCH) {
            batch.push(ev);
        }
        batch
    }
}

/// A key transition that survives translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NormalizedKeyEvent {
    pub code: u16,
    pub value: u8,
}

impl NormalizedKeyEvent {
    pub fn new(code: u16, value: u8) -> Self {
        Self { code, value }
    }
}

impl TryFrom<&RawEvent> for NormalizedKeyEvent {
    type Error = ();

    fn try_from(ev: &RawEvent) -> Result<Self, Self::Error> {
        if ev.kind() != EventKind::Key {
            return Err(());
        }

        match KeyValue::try_from(ev.value) {
            Ok(KeyValue::Repeated) => Err(()),
            Ok(v) => Ok(Self::new(ev.code, v as u8)),
            // Out-of-range values are forwarded truncated, as the kernel produced them.
            Err(n) => Ok(Self::new(ev.code, n as u8)),
        }
    }
}

/// Keep the key presses and releases of `events`, dropping auto-repeats and every
/// non-key record.
pub fn translate(events: &[RawEvent]) -> impl Iterator<Item = NormalizedKeyEvent> + '_ {
    events.iter().filter_map(|ev| {
        let key = NormalizedKeyEvent::try_from(ev).ok();

        if log::log_enabled!(log::Level::Trace) {
            let ts = ev
                .timestamp()
                .map(|ts| ts.format("%H:%M:%S%.6f").to_string())
                .unwrap_or_default();
            log::trace!(
                "[{ts}] type={} code={} value={} -> {}",
                ev.kind,
                ev.code,
                ev.value,
                if key.is_some() { "emit" } else { "drop" }
            );
        }

        key
    })
}
