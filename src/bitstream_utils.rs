// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::io::Write;

use byteorder::ByteOrder;
use byteorder::LittleEndian;
use byteorder::WriteBytesExt;
use thiserror::Error;

/// Largest number of bits `BitReader::read_bits` returns in one call.
pub const MAX_BITS_PER_READ: usize = 24;

/// Exp-Golomb codes in a valid H.264 stream never have more leading zeros than this, because a
/// longer run of zero bits would emulate a start code.
pub const MAX_EXP_GOLOMB_LEADING_ZEROS: usize = 22;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BitReaderError {
    #[error("more than 24 ({0}) bits were requested")]
    TooManyBitsRequested(usize),
    #[error("reader ran out of bits")]
    OutOfBits,
    #[error("exp-golomb code with {0} leading zero bits")]
    ExpGolombTooLong(usize),
    #[error("value {value} out of bounds {min}..={max}")]
    OutOfBounds { value: i64, min: i64, max: i64 },
}

pub type BitReaderResult<T> = std::result::Result<T, BitReaderError>;

/// A bit reader for codec bitstreams.
///
/// Bits are kept MSB-aligned in a 32-bit accumulator that is refilled one byte at a time, so any
/// read of up to 24 bits is served without reloading in the middle of it. Reads past the end of
/// the data fail instead of returning zeros. H.264 emulation-prevention bytes are dropped when
/// the reader is created with `needs_epb`.
#[derive(Clone)]
pub struct BitReader<'a> {
    data: &'a [u8],
    /// Index of the next byte to load into `bits`.
    pos: usize,
    bits: u32,
    bits_available: usize,
    /// Zero bytes seen in a row, for emulation prevention detection.
    zero_run: usize,
    /// Number of emulation prevention bytes (i.e. 0x000003) we found.
    num_epb: usize,
    needs_epb: bool,
    /// How many bits have been read so far.
    position: u64,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8], needs_epb: bool) -> Self {
        Self {
            data,
            pos: 0,
            bits: 0,
            bits_available: 0,
            zero_run: 0,
            num_epb: 0,
            needs_epb,
            position: 0,
        }
    }

    fn load_byte(&mut self) -> BitReaderResult<u8> {
        loop {
            let byte = *self.data.get(self.pos).ok_or(BitReaderError::OutOfBits)?;
            self.pos += 1;

            if self.needs_epb && self.zero_run >= 2 && byte == 0x03 {
                self.zero_run = 0;
                self.num_epb += 1;
                continue;
            }

            self.zero_run = if byte == 0 { self.zero_run + 1 } else { 0 };
            return Ok(byte);
        }
    }

    /// Read a single bit from the stream.
    pub fn read_bit(&mut self) -> BitReaderResult<bool> {
        Ok(self.read_bits::<u32>(1)? == 1)
    }

    /// Read up to 24 bits from the stream. Reading zero bits is valid and returns zero.
    pub fn read_bits<U: From<u32>>(&mut self, num_bits: usize) -> BitReaderResult<U> {
        if num_bits > MAX_BITS_PER_READ {
            return Err(BitReaderError::TooManyBitsRequested(num_bits));
        }

        if num_bits == 0 {
            return Ok(U::from(0));
        }

        while self.bits_available < num_bits {
            let byte = self.load_byte()?;
            self.bits |= u32::from(byte) << (24 - self.bits_available);
            self.bits_available += 8;
        }

        let value = self.bits >> (32 - num_bits);
        self.bits <<= num_bits;
        self.bits_available -= num_bits;
        self.position += num_bits as u64;

        Ok(U::from(value))
    }

    /// Skip `num_bits` bits from the stream.
    pub fn skip_bits(&mut self, mut num_bits: usize) -> BitReaderResult<()> {
        while num_bits > 0 {
            let n = num_bits.min(MAX_BITS_PER_READ);
            self.read_bits::<u32>(n)?;
            num_bits -= n;
        }

        Ok(())
    }

    /// Reads an unsigned Exp-Golomb code, `ue(v)`.
    pub fn read_ue(&mut self) -> BitReaderResult<u32> {
        let mut leading_zeros = 0;

        while !self.read_bit()? {
            leading_zeros += 1;
            if leading_zeros > MAX_EXP_GOLOMB_LEADING_ZEROS {
                return Err(BitReaderError::ExpGolombTooLong(leading_zeros));
            }
        }

        let suffix = self.read_bits::<u32>(leading_zeros)?;
        Ok((1 << leading_zeros) - 1 + suffix)
    }

    pub fn read_ue_bounded(&mut self, min: u32, max: u32) -> BitReaderResult<u32> {
        let ue = self.read_ue()?;
        if ue < min || ue > max {
            return Err(BitReaderError::OutOfBounds {
                value: ue.into(),
                min: min.into(),
                max: max.into(),
            });
        }

        Ok(ue)
    }

    pub fn read_ue_max(&mut self, max: u32) -> BitReaderResult<u32> {
        self.read_ue_bounded(0, max)
    }

    /// Reads a signed Exp-Golomb code, `se(v)`. Odd codes map to positive values.
    pub fn read_se(&mut self) -> BitReaderResult<i32> {
        let ue = self.read_ue()?;
        let magnitude = ((ue + 1) >> 1) as i32;

        if ue & 1 == 1 {
            Ok(magnitude)
        } else {
            Ok(-magnitude)
        }
    }

    pub fn read_se_bounded(&mut self, min: i32, max: i32) -> BitReaderResult<i32> {
        let se = self.read_se()?;
        if se < min || se > max {
            return Err(BitReaderError::OutOfBounds {
                value: se.into(),
                min: min.into(),
                max: max.into(),
            });
        }

        Ok(se)
    }

    /// Returns the amount of bits left in the stream, emulation prevention bytes included.
    pub fn num_bits_left(&self) -> usize {
        (self.data.len() - self.pos) * 8 + self.bits_available
    }

    /// Returns the number of emulation-prevention bytes read so far.
    pub fn num_epb(&self) -> usize {
        self.num_epb
    }

    /// Number of bits read so far.
    pub fn position(&self) -> u64 {
        self.position
    }
}

#[derive(Debug, Error)]
pub enum BitWriterError {
    #[error("invalid bit count")]
    InvalidBitCount,
    #[error("value increment caused value overflow")]
    Overflow,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type BitWriterResult<T> = std::result::Result<T, BitWriterError>;

pub struct BitWriter<W: Write> {
    out: W,
    nth_bit: u8,
    curr_byte: u8,
}

impl<W: Write> BitWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            out: writer,
            curr_byte: 0,
            nth_bit: 0,
        }
    }

    /// Writes fixed bit size integer (up to 32 bit)
    pub fn write_f<T: Into<u32>>(&mut self, bits: usize, value: T) -> BitWriterResult<usize> {
        let value = value.into();

        if bits > 32 {
            return Err(BitWriterError::InvalidBitCount);
        }

        for bit in (0..bits).rev() {
            self.write_bit((value >> bit) & 1 == 1)?;
        }

        Ok(bits)
    }

    /// Takes a single bit that will be outputed to [`std::io::Write`]
    pub fn write_bit(&mut self, bit: bool) -> BitWriterResult<()> {
        self.curr_byte |= (bit as u8) << (7u8 - self.nth_bit);
        self.nth_bit += 1;

        if self.nth_bit == 8 {
            self.out.write_all(&[self.curr_byte])?;
            self.nth_bit = 0;
            self.curr_byte = 0;
        }

        Ok(())
    }

    /// Writes an unsigned Exp-Golomb code, `ue(v)`.
    pub fn write_ue(&mut self, value: u32) -> BitWriterResult<()> {
        let value = value.checked_add(1).ok_or(BitWriterError::Overflow)?;
        let bits = 32 - value.leading_zeros() as usize;

        self.write_f(bits - 1, 0u32)?;
        self.write_f(bits, value)?;

        Ok(())
    }

    /// Writes a signed Exp-Golomb code, `se(v)`.
    pub fn write_se(&mut self, value: i32) -> BitWriterResult<()> {
        let abs_value = value.unsigned_abs();

        if value <= 0 {
            self.write_ue(2 * abs_value)
        } else {
            self.write_ue(2 * abs_value - 1)
        }
    }

    /// Immediately outputs any cached bits to [`std::io::Write`]
    pub fn flush(&mut self) -> BitWriterResult<()> {
        if self.nth_bit != 0 {
            self.out.write_all(&[self.curr_byte])?;
            self.nth_bit = 0;
            self.curr_byte = 0;
        }

        self.out.flush()?;
        Ok(())
    }

    /// Returns `true` if ['Self`] hold data that wasn't written to [`std::io::Write`]
    pub fn has_data_pending(&self) -> bool {
        self.nth_bit != 0
    }

    pub(crate) fn inner_mut(&mut self) -> &mut W {
        &mut self.out
    }
}

impl<W: Write> Drop for BitWriter<W> {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            log::error!("Unable to flush bits {e:?}");
        }
    }
}

/// IVF file header, in the flavour the VPU firmware expects in front of a VP8 stream.
///
/// The frame rate is stored as two 16-bit words (numerator, denominator) and everything past
/// offset 20 is left zeroed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IvfFileHeader {
    pub magic: [u8; 4],
    pub version: u16,
    pub header_size: u16,
    pub codec: [u8; 4],
    pub width: u16,
    pub height: u16,
    pub framerate_num: u16,
    pub framerate_den: u16,
}

impl Default for IvfFileHeader {
    fn default() -> Self {
        Self {
            magic: Self::MAGIC,
            version: 0,
            header_size: Self::SIZE as u16,
            codec: Self::CODEC_VP8,
            width: 320,
            height: 240,
            framerate_num: 1,
            framerate_den: 1,
        }
    }
}

impl IvfFileHeader {
    pub const MAGIC: [u8; 4] = *b"DKIF";
    pub const CODEC_VP8: [u8; 4] = *b"VP80";
    pub const SIZE: usize = 32;

    pub fn new(codec: [u8; 4], width: u16, height: u16) -> Self {
        Self {
            codec,
            width,
            height,
            ..Default::default()
        }
    }

    /// Parses the header at the start of `data`.
    pub fn parse(data: &[u8]) -> anyhow::Result<Self> {
        if data.len() < Self::SIZE || data[0..4] != Self::MAGIC {
            return Err(anyhow::anyhow!("Missing IVF header"));
        }

        let mut codec = [0u8; 4];
        codec.copy_from_slice(&data[8..12]);

        Ok(Self {
            magic: Self::MAGIC,
            version: LittleEndian::read_u16(&data[4..6]),
            header_size: LittleEndian::read_u16(&data[6..8]),
            codec,
            width: LittleEndian::read_u16(&data[12..14]),
            height: LittleEndian::read_u16(&data[14..16]),
            framerate_num: LittleEndian::read_u16(&data[16..18]),
            framerate_den: LittleEndian::read_u16(&data[18..20]),
        })
    }

    /// Writes header into writer
    pub fn write_into(&self, writer: &mut impl Write) -> std::io::Result<()> {
        writer.write_all(&self.magic)?;
        writer.write_u16::<LittleEndian>(self.version)?;
        writer.write_u16::<LittleEndian>(self.header_size)?;
        writer.write_all(&self.codec)?;
        writer.write_u16::<LittleEndian>(self.width)?;
        writer.write_u16::<LittleEndian>(self.height)?;
        writer.write_u16::<LittleEndian>(self.framerate_num)?;
        writer.write_u16::<LittleEndian>(self.framerate_den)?;
        writer.write_all(&[0u8; 12])?;

        Ok(())
    }
}

/// Helper struct for synthesizing IVF frame header
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IvfFrameHeader {
    pub frame_size: u32,
    pub timestamp: u64,
}

impl IvfFrameHeader {
    pub const SIZE: usize = 12;

    /// Writes header into writer
    pub fn write_into(&self, writer: &mut impl Write) -> std::io::Result<()> {
        writer.write_u32::<LittleEndian>(self.frame_size)?;
        writer.write_u64::<LittleEndian>(self.timestamp)?;
        Ok(())
    }
}

/// Iterator over IVF packets.
pub struct IvfIterator<'a> {
    data: &'a [u8],
}

impl<'a> IvfIterator<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        // Skip the IVF header entirely.
        Self {
            data: data.get(IvfFileHeader::SIZE..).unwrap_or_default(),
        }
    }
}

impl<'a> Iterator for IvfIterator<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        // Make sure we have a header.
        let header = self.data.get(..IvfFrameHeader::SIZE)?;
        let len = LittleEndian::read_u32(&header[0..4]) as usize;

        let end = IvfFrameHeader::SIZE.checked_add(len)?;
        let frame = self.data.get(IvfFrameHeader::SIZE..end)?;
        self.data = &self.data[end..];

        Some(frame)
    }
}
