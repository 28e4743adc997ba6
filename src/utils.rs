// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Utility functions used by several parts of this crate.
//!
//! This module is for anything that doesn't fit into the other top-level modules. Try not to add
//! new code here unless it really doesn't belong anywhere else.

use anyhow::anyhow;
use bytes::Bytes;
use log::debug;
use log::warn;

use crate::assembler::StreamAssembler;
use crate::backend::VpuDevice;
use crate::bitstream_utils::IvfFileHeader;
use crate::bitstream_utils::IvfIterator;
use crate::codec::h264::nalu::NaluIterator;
use crate::decoder::OutputFrame;
use crate::decoder::VpuDecoder;
use crate::pack::Pack;
use crate::pack::PackQueue;
use crate::pack::VideoBuffer;
use crate::CodecType;

/// Iterator over the NAL units of an Annex-B stream, start codes included.
pub struct H264UnitIterator<'a>(NaluIterator<'a>);

impl<'a> H264UnitIterator<'a> {
    pub fn new(stream: &'a [u8]) -> Self {
        Self(NaluIterator::new(stream))
    }
}

impl<'a> Iterator for H264UnitIterator<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        self.0.next().map(|nalu| nalu.data)
    }
}

/// Splits the content of a `codec` stream file into input buffers, the way a demuxer would hand
/// them out: one per NAL unit for H.264, one per IVF frame for VP8, and the whole file for JPEG.
/// Buffers are numbered through their timestamp.
pub fn input_buffers(codec: CodecType, stream: &[u8]) -> anyhow::Result<Vec<VideoBuffer>> {
    let units: Vec<&[u8]> = match codec {
        CodecType::H264 => H264UnitIterator::new(stream).collect(),
        CodecType::Vp8 => {
            let header = IvfFileHeader::parse(stream)?;
            debug!("IVF stream of {}x{}", header.width, header.height);
            IvfIterator::new(stream).collect()
        }
        CodecType::Jpeg => vec![stream],
        CodecType::None => return Err(anyhow!("no codec to split the stream for")),
    };

    Ok(units
        .into_iter()
        .enumerate()
        .map(|(i, unit)| VideoBuffer::new(Bytes::copy_from_slice(unit), i as i64))
        .collect())
}

/// CRC32 of the bytes a pack feeds to the hardware.
pub fn pack_checksum(pack: &Pack) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    for chunk in pack.chunks() {
        hasher.update(&chunk.data);
    }
    hasher.finalize()
}

/// Steps `decoder` for as long as it makes progress, handing every frame to `on_new_frame` then
/// back to the decoder.
fn run_decoder<D: VpuDevice>(
    decoder: &mut VpuDecoder<D>,
    queue: &mut PackQueue,
    on_new_frame: &mut dyn FnMut(&OutputFrame),
) -> anyhow::Result<usize> {
    let mut frames = 0;

    loop {
        let before = (queue.len(), queue.packs_popped(), decoder.session_state());

        match decoder.step(queue) {
            Ok(Some(frame)) => {
                on_new_frame(&frame);
                decoder.return_output_frame(frame.physical_address())?;
                frames += 1;
                continue;
            }
            Ok(None) => (),
            Err(e) => warn!("Pack dropped after a decoding error: {}", e),
        }

        if before == (queue.len(), queue.packs_popped(), decoder.session_state()) {
            return Ok(frames);
        }
    }
}

/// Simple decoding loop that plays the stream once from start to finish. Returns the number of
/// frames decoded.
///
/// Decoding errors are not fatal: the faulty pack is dropped and decoding resumes at the next
/// restart point of the stream.
pub fn decode_stream<D, I>(
    assembler: &mut dyn StreamAssembler,
    decoder: &mut VpuDecoder<D>,
    buffers: I,
    on_new_frame: &mut dyn FnMut(&OutputFrame),
) -> anyhow::Result<usize>
where
    D: VpuDevice,
    I: IntoIterator<Item = VideoBuffer>,
{
    let mut queue = PackQueue::new();
    let mut frames = 0;

    for buffer in buffers {
        assembler.process_buffer(&mut queue, buffer);
        frames += run_decoder(decoder, &mut queue, on_new_frame)?;
    }

    assembler.end_of_input(&mut queue);
    frames += run_decoder(decoder, &mut queue, on_new_frame)?;

    // Whatever the hardware still holds.
    for _ in 0..decoder.config().max_decode_iterations {
        if !decoder.session_state().is_running() {
            break;
        }

        if let Some(frame) = decoder.flush_step()? {
            on_new_frame(&frame);
            decoder.return_output_frame(frame.physical_address())?;
            frames += 1;
        }
    }

    if !queue.is_empty() {
        warn!("{} packs left undecoded", queue.len());
    }

    Ok(frames)
}
