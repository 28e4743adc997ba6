// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! VP8 stream assembly. Every input buffer holds exactly one frame.
//!
//! The hardware takes VP8 as an IVF stream: frames are prefixed with an IVF frame header, and an
//! IVF file header goes in front of the first frame of a session.

use std::io::Write;

use bytes::Bytes;
use log::debug;
use log::error;
use log::info;
use log::warn;

use crate::assembler::flag_last_pack_for_flushing;
use crate::assembler::StreamAssembler;
use crate::bitstream_utils::IvfFileHeader;
use crate::bitstream_utils::IvfFrameHeader;
use crate::codec::vp8::parser::Header;
use crate::pack::ChunkKind;
use crate::pack::Pack;
use crate::pack::PackQueue;
use crate::pack::VideoBuffer;
use crate::pack::VideoChunk;
use crate::CodecType;
use crate::FrameGeometry;

/// Reference frames of a VP8 decoder: last, golden and altref, plus the one being decoded.
pub const VP8_REFERENCE_COUNT: u32 = 4;

/// Returns the IVF file header for a `width`x`height` VP8 stream.
pub fn sequence_header(width: u16, height: u16) -> std::io::Result<Bytes> {
    let mut buf = Vec::with_capacity(IvfFileHeader::SIZE);
    IvfFileHeader::new(IvfFileHeader::CODEC_VP8, width, height).write_into(&mut buf)?;
    Ok(buf.into())
}

/// Prefixes `frame` with an IVF frame header. The hardware ignores the timestamp, which is left
/// zeroed.
fn framed(frame: &[u8]) -> std::io::Result<Bytes> {
    let mut buf = Vec::with_capacity(IvfFrameHeader::SIZE + frame.len());
    IvfFrameHeader {
        frame_size: frame.len() as u32,
        timestamp: 0,
    }
    .write_into(&mut buf)?;
    buf.write_all(frame)?;
    Ok(buf.into())
}

#[derive(Default)]
pub struct Vp8Assembler {
    /// Size of the last key frame, as found in its header.
    last_size: Option<(u16, u16)>,
    synchronized: bool,
    discontinuity: bool,
}

impl Vp8Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    fn go_out_of_sync(&mut self, queue: &mut PackQueue) {
        if self.synchronized {
            error!("VP8 parser going out of sync till next keyframe");
            self.synchronized = false;
            self.discontinuity = true;
        }

        queue.complete_back();
    }

    fn process_frame(&mut self, queue: &mut PackQueue, buffer: &VideoBuffer) -> anyhow::Result<()> {
        let header = Header::parse_uncompressed_data_chunk(&buffer.data)?;

        if !header.key_frame && !self.synchronized {
            debug!("Dropping inter frame of {} bytes while out of sync", buffer.data.len());
            return Ok(());
        }

        let mut chunks = Vec::with_capacity(2);
        let (width, height) = if header.key_frame {
            let size = (header.width, header.height);
            match self.last_size {
                Some(last) if last != size => {
                    info!(
                        "VP8 resolution change from {}x{} to {}x{}",
                        last.0, last.1, size.0, size.1
                    );
                    chunks.push(VideoChunk::new(
                        sequence_header(size.0, size.1)?,
                        ChunkKind::SequenceHeader,
                    ));
                }
                _ => (),
            }
            if !self.synchronized {
                info!("VP8 parser synchronized on keyframe");
                self.synchronized = true;
            }
            self.last_size = Some(size);
            size
        } else {
            self.last_size.unwrap_or_default()
        };

        chunks.push(
            VideoChunk::new(framed(&buffer.data)?, ChunkKind::Frame)
                .with_meta(buffer.meta.clone()),
        );

        let geometry = FrameGeometry::from_true(width.into(), height.into());
        let mut pack = Pack::new(CodecType::Vp8, geometry, VP8_REFERENCE_COUNT);
        pack.can_reopen_decoding = header.key_frame;
        if header.key_frame {
            pack.discontinuity = std::mem::take(&mut self.discontinuity);
        }

        let pack = queue.push_new_pack(pack);
        for chunk in chunks {
            pack.push_chunk(chunk);
        }
        queue.complete_back();

        Ok(())
    }
}

impl StreamAssembler for Vp8Assembler {
    fn codec(&self) -> CodecType {
        CodecType::Vp8
    }

    fn process_buffer(&mut self, queue: &mut PackQueue, mut buffer: VideoBuffer) {
        if let Err(e) = self.process_frame(queue, &buffer) {
            warn!("Discarding VP8 frame of {} bytes: {:#}", buffer.data.len(), e);
            self.go_out_of_sync(queue);
        }

        queue.attach_release(buffer.release.take());
    }

    fn end_of_input(&mut self, queue: &mut PackQueue) {
        if flag_last_pack_for_flushing(queue) {
            debug!("Flushing after the last VP8 frame");
        }
    }

    fn reset(&mut self) {
        *self = Self::default();
    }

    fn is_synchronized(&self) -> bool {
        self.synchronized
    }
}
