// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Reusable decode/encode state for a single span batch.
//!
//! A [`Codec`] pairs a MessagePack decoder with a rewritable in-memory read transport and an
//! output buffer. Handlers receive the codec as both their input and output channel. Codecs are
//! recycled through [`crate::codec_pool::CodecPool`], so every write fully replaces the previous
//! payload and rewinds the read cursor.

use std::io;

use rmp::Marker;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::errors::HandlerError;

/// Deepest array/map nesting accepted by [`Codec::decode`].
pub const MAX_DECODE_DEPTH: usize = 64;

/// In-memory read transport whose contents can be replaced between messages.
#[derive(Debug, Default)]
pub struct ReadBuffer {
    buf: Vec<u8>,
    pos: usize,
}

impl ReadBuffer {
    /// Discards the current contents and cursor, then stores `payload`.
    pub fn reset_with(&mut self, payload: &[u8]) {
        self.buf.clear();
        self.buf.extend_from_slice(payload);
        self.pos = 0;
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.pos = 0;
    }

    /// Bytes not yet consumed by a reader.
    pub fn remaining(&self) -> &[u8] {
        &self.buf[self.pos..]
    }

    pub fn position(&self) -> usize {
        self.pos
    }
}

impl io::Read for ReadBuffer {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let remaining = self.remaining();
        let amt = remaining.len().min(out.len());
        out[..amt].copy_from_slice(&remaining[..amt]);
        self.pos += amt;
        Ok(amt)
    }
}

/// Decoder/encoder bound to a rewritable transport.
#[derive(Debug)]
pub struct Codec {
    id: u64,
    input: ReadBuffer,
    output: Vec<u8>,
}

impl Codec {
    pub fn new(id: u64) -> Self {
        Codec {
            id,
            input: ReadBuffer::default(),
            output: Vec::new(),
        }
    }

    /// Identifier assigned by the pool that created this codec.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Replaces the transport contents with `payload` and clears any pending output.
    pub fn write_payload(&mut self, payload: &[u8]) {
        self.input.reset_with(payload);
        self.output.clear();
    }

    pub(crate) fn reset(&mut self) {
        self.input.clear();
        self.output.clear();
    }

    /// Bytes of the current payload that have not been decoded yet.
    pub fn remaining(&self) -> &[u8] {
        self.input.remaining()
    }

    pub fn input(&mut self) -> &mut ReadBuffer {
        &mut self.input
    }

    /// Decodes the next MessagePack value from the transport.
    ///
    /// Values nested deeper than [`MAX_DECODE_DEPTH`] are rejected before any decoding happens,
    /// since the decoder recurses once per level.
    pub fn decode<T: DeserializeOwned>(&mut self) -> Result<T, HandlerError> {
        check_nesting(self.input.remaining(), MAX_DECODE_DEPTH)?;
        rmp_serde::from_read(&mut self.input).map_err(|e| HandlerError::Decode(e.to_string()))
    }

    /// Appends a MessagePack encoded value to the output buffer.
    pub fn encode<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), HandlerError> {
        rmp_serde::encode::write(&mut self.output, value)
            .map_err(|e| HandlerError::Encode(e.to_string()))
    }

    pub fn output(&self) -> &[u8] {
        &self.output
    }
}

/// Walks the markers of the first value in `payload` without recursing and fails once more than
/// `max_depth` arrays or maps are open at the same time.
///
/// Truncated or reserved input is left for the decoder to report.
fn check_nesting(payload: &[u8], max_depth: usize) -> Result<(), HandlerError> {
    // elements still expected by each open container, innermost last
    let mut open: Vec<u64> = Vec::new();
    let mut pos = 0;

    loop {
        let Some(&byte) = payload.get(pos) else {
            return Ok(());
        };
        pos += 1;

        let (skip, children) = match Marker::from_u8(byte) {
            Marker::FixPos(_) | Marker::FixNeg(_) | Marker::Null | Marker::True | Marker::False => {
                (0, 0)
            }
            Marker::U8 | Marker::I8 => (1, 0),
            Marker::U16 | Marker::I16 | Marker::FixExt1 => (2, 0),
            Marker::FixExt2 => (3, 0),
            Marker::U32 | Marker::I32 | Marker::F32 => (4, 0),
            Marker::FixExt4 => (5, 0),
            Marker::U64 | Marker::I64 | Marker::F64 => (8, 0),
            Marker::FixExt8 => (9, 0),
            Marker::FixExt16 => (17, 0),
            Marker::FixStr(len) => (u64::from(len), 0),
            Marker::Str8 | Marker::Bin8 => match read_len(payload, &mut pos, 1) {
                Some(len) => (len, 0),
                None => return Ok(()),
            },
            Marker::Str16 | Marker::Bin16 => match read_len(payload, &mut pos, 2) {
                Some(len) => (len, 0),
                None => return Ok(()),
            },
            Marker::Str32 | Marker::Bin32 => match read_len(payload, &mut pos, 4) {
                Some(len) => (len, 0),
                None => return Ok(()),
            },
            // extension type byte follows the length
            Marker::Ext8 => match read_len(payload, &mut pos, 1) {
                Some(len) => (len + 1, 0),
                None => return Ok(()),
            },
            Marker::Ext16 => match read_len(payload, &mut pos, 2) {
                Some(len) => (len + 1, 0),
                None => return Ok(()),
            },
            Marker::Ext32 => match read_len(payload, &mut pos, 4) {
                Some(len) => (len + 1, 0),
                None => return Ok(()),
            },
            Marker::FixArray(len) => (0, u64::from(len)),
            Marker::Array16 => match read_len(payload, &mut pos, 2) {
                Some(len) => (0, len),
                None => return Ok(()),
            },
            Marker::Array32 => match read_len(payload, &mut pos, 4) {
                Some(len) => (0, len),
                None => return Ok(()),
            },
            Marker::FixMap(len) => (0, 2 * u64::from(len)),
            Marker::Map16 => match read_len(payload, &mut pos, 2) {
                Some(len) => (0, 2 * len),
                None => return Ok(()),
            },
            Marker::Map32 => match read_len(payload, &mut pos, 4) {
                Some(len) => (0, 2 * len),
                None => return Ok(()),
            },
            Marker::Reserved => return Ok(()),
        };

        let Ok(skip) = usize::try_from(skip) else {
            return Ok(());
        };
        pos = pos.saturating_add(skip);

        if let Some(expected) = open.last_mut() {
            *expected -= 1;
        }
        if children > 0 {
            if open.len() == max_depth {
                return Err(HandlerError::Decode(format!(
                    "value nested deeper than {max_depth} levels"
                )));
            }
            open.push(children);
        }
        while open.last() == Some(&0) {
            open.pop();
        }
        if open.is_empty() {
            return Ok(());
        }
    }
}

/// Reads a big-endian length of `width` bytes at `pos`.
fn read_len(payload: &[u8], pos: &mut usize, width: usize) -> Option<u64> {
    let bytes = payload.get(*pos..pos.checked_add(width)?)?;
    *pos += width;
    Some(bytes.iter().fold(0u64, |len, b| (len << 8) | u64::from(*b)))
}
