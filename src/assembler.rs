// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Stream assemblers turn the buffers of a compressed stream into [`Pack`]s, one per picture.
//!
//! An assembler keeps track of whether it is synchronized on the stream. After a parse error it
//! drops everything until the next picture the hardware can start decoding from, so that frames
//! between an error and the next restart point are missing from the output rather than corrupted.
//!
//! [`Pack`]: crate::pack::Pack

pub mod h264;
pub mod jpeg;
pub mod vp8;

use crate::pack::PackQueue;
use crate::pack::VideoBuffer;
use crate::CodecType;
use crate::DecoderConfig;

pub trait StreamAssembler {
    fn codec(&self) -> CodecType;

    /// Splits `buffer` into chunks and appends them to the packs of `queue`, creating new packs
    /// as pictures start. Stream errors are recovered from by desynchronizing. The release
    /// callback of `buffer` fires once none of its bytes are in the queue anymore.
    fn process_buffer(&mut self, queue: &mut PackQueue, buffer: VideoBuffer);

    /// Signals that no more input is coming. The last pack is completed and will flush the
    /// decoder.
    fn end_of_input(&mut self, queue: &mut PackQueue);

    /// Forgets everything learnt from the stream so far.
    fn reset(&mut self);

    /// Whether packs are currently being produced.
    fn is_synchronized(&self) -> bool;
}

/// Creates the assembler for `codec`.
pub fn new_assembler(codec: CodecType, config: &DecoderConfig) -> Option<Box<dyn StreamAssembler>> {
    match codec {
        CodecType::H264 => Some(Box::new(h264::H264Assembler::new(config.disable_reordering))),
        CodecType::Vp8 => Some(Box::new(vp8::Vp8Assembler::new())),
        CodecType::Jpeg => Some(Box::new(jpeg::JpegAssembler::new())),
        CodecType::None => None,
    }
}

/// Shared end of input handling: flag the last pack for flushing. Returns `false` if it already
/// was, i.e. the stream signalled its end itself.
pub(crate) fn flag_last_pack_for_flushing(queue: &mut PackQueue) -> bool {
    let flagged = match queue.back_mut() {
        Some(pack) if !pack.needs_flushing => {
            pack.needs_flushing = true;
            true
        }
        _ => false,
    };

    queue.complete_back();
    flagged
}
