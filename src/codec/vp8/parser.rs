// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! VP8 uncompressed data chunk parsing, RFC 6386 section 9.1.

use byteorder::ByteOrder;
use byteorder::LittleEndian;
use log::debug;
use thiserror::Error;

use crate::FrameGeometry;

/// Start code of key frames, right after the frame tag.
pub const KEYFRAME_START_CODE: [u8; 3] = [0x9d, 0x01, 0x2a];

const FRAME_TAG_SIZE: usize = 3;
const KEYFRAME_HEADER_SIZE: usize = 10;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseUncompressedChunkError {
    #[error("VP8 frame data truncated")]
    Truncated,
    #[error("VP8 keyframe data header truncated")]
    KeyframeTruncated,
    #[error("VP8 keyframe does not contain start code ({0:02x?})")]
    InvalidStartCode([u8; 3]),
}

/// The uncompressed data chunk of a VP8 frame.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Header {
    pub key_frame: bool,
    pub version: u8,
    pub show_frame: bool,
    /// Size of the first partition, not counting the uncompressed data chunk.
    pub first_part_size: u32,

    // Key frames only.
    pub width: u16,
    pub horiz_scale_code: u8,
    pub height: u16,
    pub vert_scale_code: u8,

    /// Size in bytes of the uncompressed data chunk.
    pub data_chunk_size: u8,
}

impl Header {
    /// Parses the uncompressed data chunk at the start of `bitstream`.
    ///
    /// The key frame bit of the frame tag is inverted: a cleared bit means key frame.
    pub fn parse_uncompressed_data_chunk(
        bitstream: &[u8],
    ) -> Result<Self, ParseUncompressedChunkError> {
        if bitstream.len() < FRAME_TAG_SIZE {
            return Err(ParseUncompressedChunkError::Truncated);
        }

        let frame_tag = LittleEndian::read_u24(bitstream);

        let mut header = Header {
            key_frame: (frame_tag & 0x1) == 0,
            version: ((frame_tag >> 1) & 0x07) as u8,
            show_frame: ((frame_tag >> 4) & 0x1) != 0,
            first_part_size: (frame_tag >> 5) & 0x7ffff,
            data_chunk_size: FRAME_TAG_SIZE as u8,
            ..Default::default()
        };

        if header.key_frame {
            if bitstream.len() < KEYFRAME_HEADER_SIZE {
                return Err(ParseUncompressedChunkError::KeyframeTruncated);
            }

            let start_code = [bitstream[3], bitstream[4], bitstream[5]];
            if start_code != KEYFRAME_START_CODE {
                return Err(ParseUncompressedChunkError::InvalidStartCode(start_code));
            }

            let size_code = LittleEndian::read_u16(&bitstream[6..8]);
            header.horiz_scale_code = (size_code >> 14) as u8;
            header.width = size_code & 0x3fff;

            let size_code = LittleEndian::read_u16(&bitstream[8..10]);
            header.vert_scale_code = (size_code >> 14) as u8;
            header.height = size_code & 0x3fff;

            header.data_chunk_size = KEYFRAME_HEADER_SIZE as u8;

            debug!(
                "VP8 key frame {}x{}, version {}",
                header.width, header.height, header.version
            );
        }

        Ok(header)
    }

    /// Geometry of a key frame. Meaningless for inter frames.
    pub fn geometry(&self) -> FrameGeometry {
        FrameGeometry::from_true(self.width.into(), self.height.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Uncompressed chunk of a 176x144 key frame, followed by the start of the first partition.
    const KEY_FRAME: [u8; 12] = [
        0x50, 0x42, 0x00, 0x9d, 0x01, 0x2a, 0xb0, 0x00, 0x90, 0x00, 0x00, 0x47,
    ];

    #[test]
    fn parse_key_frame() {
        let header = Header::parse_uncompressed_data_chunk(&KEY_FRAME).unwrap();

        assert!(header.key_frame);
        assert_eq!(header.version, 0);
        assert!(header.show_frame);
        assert_eq!(header.first_part_size, 0x212);
        assert_eq!(header.width, 176);
        assert_eq!(header.height, 144);
        assert_eq!(header.horiz_scale_code, 0);
        assert_eq!(header.data_chunk_size, 10);
        assert_eq!(header.geometry(), FrameGeometry::new(176, 144, 176, 144, 0, 0));
    }

    #[test]
    fn parse_inter_frame() {
        let header = Header::parse_uncompressed_data_chunk(&[0x31, 0x02, 0x00, 0x11]).unwrap();

        assert!(!header.key_frame);
        assert!(header.show_frame);
        assert_eq!(header.first_part_size, 0x11);
        assert_eq!(header.width, 0);
        assert_eq!(header.data_chunk_size, 3);
    }

    #[test]
    fn scale_codes() {
        let mut frame = KEY_FRAME;
        frame[7] |= 0x40;
        frame[9] |= 0x80;
        let header = Header::parse_uncompressed_data_chunk(&frame).unwrap();

        assert_eq!(header.width, 176);
        assert_eq!(header.horiz_scale_code, 1);
        assert_eq!(header.vert_scale_code, 2);
    }

    #[test]
    fn truncated_and_corrupted() {
        assert_eq!(
            Header::parse_uncompressed_data_chunk(&KEY_FRAME[..2]),
            Err(ParseUncompressedChunkError::Truncated)
        );
        assert_eq!(
            Header::parse_uncompressed_data_chunk(&KEY_FRAME[..9]),
            Err(ParseUncompressedChunkError::KeyframeTruncated)
        );

        let mut frame = KEY_FRAME;
        frame[4] = 0x02;
        assert_eq!(
            Header::parse_uncompressed_data_chunk(&frame),
            Err(ParseUncompressedChunkError::InvalidStartCode([0x9d, 0x02, 0x2a]))
        );
    }
}
