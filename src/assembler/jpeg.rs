// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Motion JPEG assembly: one picture per buffer, each of them independent.

use log::warn;

use crate::assembler::flag_last_pack_for_flushing;
use crate::assembler::StreamAssembler;
use crate::codec::jpeg::parse_frame_header;
use crate::pack::ChunkKind;
use crate::pack::Pack;
use crate::pack::PackQueue;
use crate::pack::VideoBuffer;
use crate::pack::VideoChunk;
use crate::CodecType;

#[derive(Default)]
pub struct JpegAssembler {
    synchronized: bool,
}

impl JpegAssembler {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StreamAssembler for JpegAssembler {
    fn codec(&self) -> CodecType {
        CodecType::Jpeg
    }

    fn process_buffer(&mut self, queue: &mut PackQueue, mut buffer: VideoBuffer) {
        match parse_frame_header(&buffer.data) {
            Ok(header) => {
                let mut pack = Pack::new(CodecType::Jpeg, header.geometry(), 0);
                pack.can_reopen_decoding = true;
                pack.can_be_dropped = true;
                pack.push_chunk(
                    VideoChunk::new(buffer.data.clone(), ChunkKind::Frame)
                        .with_meta(buffer.meta.clone()),
                );
                queue.push_new_pack(pack);
                queue.complete_back();
                self.synchronized = true;
            }
            Err(e) => {
                warn!("Dropping JPEG picture of {} bytes: {:#}", buffer.data.len(), e);
                self.synchronized = false;
            }
        }

        queue.attach_release(buffer.release.take());
    }

    fn end_of_input(&mut self, queue: &mut PackQueue) {
        flag_last_pack_for_flushing(queue);
    }

    fn reset(&mut self) {
        self.synchronized = false;
    }

    fn is_synchronized(&self) -> bool {
        self.synchronized
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FrameGeometry;

    fn picture(width: u16, height: u16, luma_sampling: u8) -> Vec<u8> {
        let mut data = vec![0xff, 0xd8, 0xff, 0xc0, 0x00, 0x11, 0x08];
        data.extend_from_slice(&height.to_be_bytes());
        data.extend_from_slice(&width.to_be_bytes());
        data.extend_from_slice(&[0x03, 0x01, luma_sampling, 0x00, 0x02, 0x11, 0x01, 0x03, 0x11, 0x01]);
        data.extend_from_slice(&[0xff, 0xda, 0x12, 0x34, 0xff, 0xd9]);
        data
    }

    #[test]
    fn one_complete_pack_per_picture() {
        let mut assembler = JpegAssembler::new();
        let mut queue = PackQueue::new();

        assembler.process_buffer(&mut queue, VideoBuffer::new(picture(100, 50, 0x22), 7));

        let pack = queue.front().unwrap();
        assert!(pack.is_complete);
        assert!(pack.can_reopen_decoding);
        assert_eq!(pack.reference_count, 0);
        assert_eq!(pack.geometry, FrameGeometry::from_true(100, 50));
        assert_eq!(pack.chunks().len(), 1);
        assert_eq!(pack.timestamp(), Some(7));
    }

    #[test]
    fn unsupported_subsampling_is_dropped() {
        let mut assembler = JpegAssembler::new();
        let mut queue = PackQueue::new();

        assembler.process_buffer(&mut queue, VideoBuffer::new(picture(100, 50, 0x21), 0));
        assert!(queue.is_empty());
        assert!(!assembler.is_synchronized());

        assembler.process_buffer(&mut queue, VideoBuffer::new(picture(100, 50, 0x22), 1));
        assembler.end_of_input(&mut queue);
        assert_eq!(queue.len(), 1);
        assert!(queue.front().unwrap().needs_flushing);
    }
}
