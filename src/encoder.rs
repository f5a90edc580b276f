//! The output wire format.
//!
//! Each key transition is written as a 3-byte record with no framing: one `u8`
//! holding the key value (`0` released, `1` pressed) followed by the `u16` key
//! code. By default the code is in the host's native byte order, so a consumer
//! on a different architecture must know the producer's endianness. Choosing
//! [`ByteOrder::Little`] or [`ByteOrder::Big`] pins the order explicitly; that
//! is a change of wire contract and consumers must be told.

use crate::error::KeypipeError;
use crate::event::NormalizedKeyEvent;
use crate::KeypipeResult;
use std::io::Write;

/// Size in bytes of one output record.
pub const RECORD_SIZE: usize = 3;

/// Byte order of the key code in an output record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum ByteOrder {
    /// Whatever the host uses.
    #[default]
    Native,
    Little,
    Big,
}

impl ByteOrder {
    fn code_bytes(self, code: u16) -> [u8; 2] {
        match self {
            ByteOrder::Native => code.to_ne_bytes(),
            ByteOrder::Little => code.to_le_bytes(),
            ByteOrder::Big => code.to_be_bytes(),
        }
    }

    fn code_from_bytes(self, bytes: [u8; 2]) -> u16 {
        match self {
            ByteOrder::Native => u16::from_ne_bytes(bytes),
            ByteOrder::Little => u16::from_le_bytes(bytes),
            ByteOrder::Big => u16::from_be_bytes(bytes),
        }
    }
}

pub fn encode(ev: NormalizedKeyEvent, order: ByteOrder) -> [u8; RECORD_SIZE] {
    let [c0, c1] = order.code_bytes(ev.code);
    [ev.value, c0, c1]
}

pub fn decode(record: [u8; RECORD_SIZE], order: ByteOrder) -> NormalizedKeyEvent {
    let [value, c0, c1] = record;
    NormalizedKeyEvent::new(order.code_from_bytes([c0, c1]), value)
}

/// Writes records to an output channel, one write and flush per event.
#[derive(Debug)]
pub struct StreamEncoder<W> {
    out: W,
    order: ByteOrder,
}

impl<W: Write> StreamEncoder<W> {
    pub fn new(out: W, order: ByteOrder) -> Self {
        Self { out, order }
    }

    pub fn emit(&mut self, ev: NormalizedKeyEvent) -> KeypipeResult<()> {
        let record = encode(ev, self.order);

        self.out
            .write_all(&record)
            .and_then(|_| self.out.flush())
            .map_err(KeypipeError::OutputWrite)
    }

    pub fn get_ref(&self) -> &W {
        &self.out
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}
