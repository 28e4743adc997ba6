// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Minimal baseline JPEG frame header parsing.

use anyhow::anyhow;
use anyhow::Context;
use byteorder::BigEndian;
use byteorder::ByteOrder;

use crate::FrameGeometry;

pub const MARKER_SOF0: u8 = 0xc0;
pub const MARKER_DHT: u8 = 0xc4;
pub const MARKER_DAC: u8 = 0xcc;
pub const MARKER_SOF15: u8 = 0xcf;

/// A component of the frame, as described by the SOF segment.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Component {
    pub id: u8,
    pub horizontal_factor: u8,
    pub vertical_factor: u8,
    pub quant_table: u8,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FrameHeader {
    pub width: u16,
    pub height: u16,
    pub components: [Component; 3],
}

impl FrameHeader {
    pub fn geometry(&self) -> FrameGeometry {
        FrameGeometry::from_true(self.width.into(), self.height.into())
    }
}

/// Iterates over the positions of the markers in `data`. A marker is a 0xff byte followed by
/// anything but a stuffed zero or another 0xff.
fn markers(data: &[u8]) -> impl Iterator<Item = (usize, u8)> + '_ {
    data.windows(2)
        .enumerate()
        .filter(|(_, w)| w[0] == 0xff && w[1] != 0x00 && w[1] != 0xff)
        .map(|(pos, w)| (pos, w[1]))
}

fn parse_sof0(segment: &[u8]) -> anyhow::Result<FrameHeader> {
    // Marker, segment length and sample precision.
    let segment = segment.get(5..).context("JPEG SOF0 segment truncated")?;
    if segment.len() < 5 {
        return Err(anyhow!("JPEG SOF0 segment truncated"));
    }

    let mut header = FrameHeader {
        height: BigEndian::read_u16(&segment[0..2]),
        width: BigEndian::read_u16(&segment[2..4]),
        ..Default::default()
    };

    let num_components = segment[4];
    if num_components != 3 {
        return Err(anyhow!("Unsupported JPEG with {} components", num_components));
    }

    let components = segment
        .get(5..5 + 3 * 3)
        .context("JPEG SOF0 component table truncated")?;
    for (component, desc) in header.components.iter_mut().zip(components.chunks_exact(3)) {
        *component = Component {
            id: desc[0],
            horizontal_factor: desc[1] >> 4,
            vertical_factor: desc[1] & 0xf,
            quant_table: desc[2],
        };
    }

    let [luma, cb, cr] = header.components;
    let max_h = header.components.iter().map(|c| c.horizontal_factor).max().unwrap_or(0);
    let max_v = header.components.iter().map(|c| c.vertical_factor).max().unwrap_or(0);

    let is_420 = luma.horizontal_factor == max_h
        && luma.vertical_factor == max_v
        && [cb, cr]
            .iter()
            .all(|c| c.horizontal_factor * 2 == max_h && c.vertical_factor * 2 == max_v);
    if !is_420 {
        return Err(anyhow!("JPEG is not in YUV420 format"));
    }

    Ok(header)
}

/// Finds the SOF0 segment of a baseline JPEG and parses the frame header from it.
///
/// Frames coded with any other SOF marker are rejected, as is anything but 4:2:0 YCbCr.
pub fn parse_frame_header(data: &[u8]) -> anyhow::Result<FrameHeader> {
    for (pos, marker) in markers(data) {
        match marker {
            MARKER_SOF0 => return parse_sof0(&data[pos..]),
            MARKER_DHT | MARKER_DAC => (),
            0xc1..=MARKER_SOF15 => return Err(anyhow!("Not baseline jpeg")),
            _ => (),
        }
    }

    Err(anyhow!("No SOF0 marker found in JPEG data"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jpeg_with_sof(marker: u8, sampling: [u8; 3]) -> Vec<u8> {
        let mut data = vec![0xff, 0xd8, 0xff, 0xe0, 0x00, 0x04, 0xff, 0x00];
        data.extend_from_slice(&[0xff, marker, 0x00, 0x11, 0x08, 0x00, 0xf0, 0x01, 0x40, 0x03]);
        for (id, factors) in sampling.iter().enumerate() {
            data.extend_from_slice(&[id as u8 + 1, *factors, u8::from(id != 0)]);
        }
        data.extend_from_slice(&[0xff, 0xd9]);
        data
    }

    #[test]
    fn baseline_420() {
        let header = parse_frame_header(&jpeg_with_sof(MARKER_SOF0, [0x22, 0x11, 0x11])).unwrap();

        assert_eq!(header.width, 320);
        assert_eq!(header.height, 240);
        assert_eq!(header.components[0].horizontal_factor, 2);
        assert_eq!(header.components[2].quant_table, 1);
        assert_eq!(header.geometry(), FrameGeometry::new(320, 240, 320, 240, 0, 0));
    }

    #[test]
    fn rejects_other_subsamplings() {
        assert!(parse_frame_header(&jpeg_with_sof(MARKER_SOF0, [0x21, 0x11, 0x11])).is_err());
        assert!(parse_frame_header(&jpeg_with_sof(MARKER_SOF0, [0x11, 0x11, 0x11])).is_err());
    }

    #[test]
    fn rejects_non_baseline() {
        let err = parse_frame_header(&jpeg_with_sof(0xc2, [0x22, 0x11, 0x11])).unwrap_err();
        assert_eq!(err.to_string(), "Not baseline jpeg");
    }

    #[test]
    fn missing_or_truncated_sof() {
        assert!(parse_frame_header(&[0xff, 0xd8, 0xff, 0xd9]).is_err());

        let data = jpeg_with_sof(MARKER_SOF0, [0x22, 0x11, 0x11]);
        assert!(parse_frame_header(&data[..20]).is_err());
    }
}
