// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Annex-B framing of H.264 byte streams.

use std::fmt;

use enumn::N;

pub const START_CODE: [u8; 3] = [0x00, 0x00, 0x01];
pub const START_CODE_LEN: usize = START_CODE.len();

/// NAL unit types relevant to stream assembly. H.264 Table 7-1.
#[derive(N, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NaluType {
    Unknown = 0,
    Slice = 1,
    SliceDpa = 2,
    SliceDpb = 3,
    SliceDpc = 4,
    SliceIdr = 5,
    Sei = 6,
    Sps = 7,
    Pps = 8,
    AuDelimiter = 9,
    SeqEnd = 10,
    StreamEnd = 11,
    FillerData = 12,
    SpsExt = 13,
    PrefixUnit = 14,
    SubsetSps = 15,
    DepthSps = 16,
    SliceAux = 19,
    SliceExt = 20,
    SliceDepth = 21,
}

impl NaluType {
    /// Whether the unit carries a slice header that starts a picture.
    pub fn starts_picture(&self) -> bool {
        matches!(
            self,
            NaluType::Slice | NaluType::SliceDpa | NaluType::SliceIdr
        )
    }
}

/// The one-byte NAL unit header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NaluHeader {
    pub forbidden_zero_bit: bool,
    pub ref_idc: u8,
    /// Raw `nal_unit_type`, reserved and unspecified values included.
    pub type_value: u8,
}

impl NaluHeader {
    pub fn from_byte(byte: u8) -> Self {
        Self {
            forbidden_zero_bit: byte & 0x80 != 0,
            ref_idc: (byte >> 5) & 0x3,
            type_value: byte & 0x1f,
        }
    }

    /// Known type of the unit, `None` for reserved and unspecified values.
    pub fn type_(&self) -> Option<NaluType> {
        NaluType::n(self.type_value).filter(|t| *t != NaluType::Unknown)
    }

    pub fn idr_pic_flag(&self) -> bool {
        self.type_value == NaluType::SliceIdr as u8
    }
}

impl fmt::Display for NaluHeader {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.type_() {
            Some(t) => write!(f, "{:?} (ref_idc {})", t, self.ref_idc),
            None => write!(f, "type {} (ref_idc {})", self.type_value, self.ref_idc),
        }
    }
}

/// One NAL unit of an Annex-B stream, start code included.
///
/// The unit spans from its 3-byte start code up to the next start code, so the zero byte of a
/// following 4-byte start code and any `trailing_zero_8bits` stay at the end of this unit.
#[derive(Clone, Copy, Debug)]
pub struct Nalu<'a> {
    pub header: NaluHeader,
    /// The whole unit, start code first.
    pub data: &'a [u8],
    /// Offset of the start code in the scanned buffer.
    pub offset: usize,
}

impl<'a> Nalu<'a> {
    /// The unit without its start code, header byte first.
    pub fn payload(&self) -> &'a [u8] {
        &self.data[START_CODE_LEN..]
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// Returns the offset of the first `00 00 01` sequence in `data` at or after `from`.
pub fn find_start_code(data: &[u8], from: usize) -> Option<usize> {
    data.get(from..)?
        .windows(START_CODE_LEN)
        .position(|window| window == START_CODE)
        .map(|pos| pos + from)
}

/// Iterates over the NAL units of an Annex-B buffer.
///
/// Bytes before the first start code are not part of any unit; `leading_bytes` tells how many
/// there are. A start code at the very end of the buffer, with no header byte after it, ends the
/// iteration.
pub struct NaluIterator<'a> {
    data: &'a [u8],
    next: Option<usize>,
}

impl<'a> NaluIterator<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            next: find_start_code(data, 0),
        }
    }

    /// Number of bytes before the first start code, `None` if there is no start code at all.
    pub fn leading_bytes(&self) -> Option<usize> {
        find_start_code(self.data, 0)
    }

    /// Whether the bytes before the first start code look like a stream that was cut in the
    /// middle of a unit. A single zero byte is the first half of a 4-byte start code.
    pub fn has_leading_garbage(&self) -> bool {
        match self.leading_bytes() {
            Some(0) | None => false,
            Some(1) => self.data[0] != 0,
            Some(_) => true,
        }
    }
}

impl<'a> Iterator for NaluIterator<'a> {
    type Item = Nalu<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let start = self.next?;
        let header_byte = *self.data.get(start + START_CODE_LEN)?;
        let end = find_start_code(self.data, start + START_CODE_LEN + 1).unwrap_or(self.data.len());

        self.next = (end < self.data.len()).then_some(end);

        Some(Nalu {
            header: NaluHeader::from_byte(header_byte),
            data: &self.data[start..end],
            offset: start,
        })
    }
}

/// `data` with any trailing zero bytes removed.
pub fn trim_trailing_zeros(data: &[u8]) -> &[u8] {
    let end = data.iter().rposition(|b| *b != 0).map_or(0, |p| p + 1);
    &data[..end]
}
