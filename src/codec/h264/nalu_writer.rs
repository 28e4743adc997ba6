// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Bit-level writer for H.264 NAL units, used to synthesize Annex-B streams.

use std::io::Write;

use thiserror::Error;

use crate::bitstream_utils::BitWriter;
use crate::bitstream_utils::BitWriterError;
use crate::codec::h264::nalu::START_CODE;

/// Byte sink inserting `emulation_prevention_three_byte` where the payload would otherwise contain
/// a start code prefix.
struct EscapingSink<W: Write> {
    out: W,
    /// Number of consecutive zero bytes last written.
    zero_run: usize,
    escape: bool,
}

impl<W: Write> EscapingSink<W> {
    fn new(out: W, escape: bool) -> Self {
        Self {
            out,
            zero_run: 0,
            escape,
        }
    }

    /// Writes the start code and the one-byte NAL unit header, which are never escaped.
    fn write_unit_start(&mut self, ref_idc: u8, unit_type: u8) -> std::io::Result<()> {
        self.out.write_all(&[0x00])?;
        self.out.write_all(&START_CODE)?;
        self.out
            .write_all(&[(ref_idc & 0b11) << 5 | (unit_type & 0b1_1111)])?;
        self.zero_run = 0;
        Ok(())
    }
}

impl<W: Write> Write for EscapingSink<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if !self.escape {
            self.out.write_all(buf)?;
            return Ok(buf.len());
        }

        for &byte in buf {
            if self.zero_run >= 2 && byte <= 0x03 {
                self.out.write_all(&[0x03])?;
                self.zero_run = 0;
            }

            self.out.write_all(&[byte])?;
            self.zero_run = if byte == 0 { self.zero_run + 1 } else { 0 };
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.out.flush()
    }
}

#[derive(Error, Debug)]
pub enum NaluWriterError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    BitWriterError(#[from] BitWriterError),
}

pub type NaluWriterResult<T> = std::result::Result<T, NaluWriterError>;

/// Writes the syntax elements of H.264 NAL units, optionally escaping the payload.
pub struct NaluWriter<W: Write>(BitWriter<EscapingSink<W>>);

impl<W: Write> NaluWriter<W> {
    pub fn new(writer: W, escape: bool) -> Self {
        Self(BitWriter::new(EscapingSink::new(writer, escape)))
    }

    /// `f(n)`: a fixed-size field of up to 32 bits.
    pub fn write_f<T: Into<u32>>(&mut self, bits: usize, value: T) -> NaluWriterResult<usize> {
        Ok(self.0.write_f(bits, value)?)
    }

    /// `u(n)`, same encoding as `f(n)`.
    pub fn write_u<T: Into<u32>>(&mut self, bits: usize, value: T) -> NaluWriterResult<usize> {
        self.write_f(bits, value)
    }

    pub fn write_ue<T: Into<u32>>(&mut self, value: T) -> NaluWriterResult<()> {
        Ok(self.0.write_ue(value.into())?)
    }

    pub fn write_se<T: Into<i32>>(&mut self, value: T) -> NaluWriterResult<()> {
        Ok(self.0.write_se(value.into())?)
    }

    /// Starts a new NAL unit. Pending bits of the previous one are padded with zeros.
    pub fn write_header(&mut self, ref_idc: u8, unit_type: u8) -> NaluWriterResult<()> {
        self.0.flush()?;
        self.0.inner_mut().write_unit_start(ref_idc, unit_type)?;
        Ok(())
    }

    /// `rbsp_trailing_bits()`: the stop bit, then zeros up to the next byte boundary.
    pub fn rbsp_trailing_bits(&mut self) -> NaluWriterResult<()> {
        self.0.write_bit(true)?;
        while self.0.has_data_pending() {
            self.0.write_bit(false)?;
        }

        Ok(())
    }
}

impl<W: Write + Default> NaluWriter<W> {
    /// Terminates the RBSP and returns the bytes written.
    pub fn finish(mut self) -> NaluWriterResult<W> {
        self.rbsp_trailing_bits()?;
        self.0.flush()?;
        Ok(std::mem::take(&mut self.0.inner_mut().out))
    }
}
