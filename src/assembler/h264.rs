// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! H.264 Annex-B stream assembly.
//!
//! Parameter sets are kept aside and only sent to the hardware in front of the pictures that
//! need them: the SPS and PPS before every IDR picture, and a PPS before the first picture
//! using it after a change of active PPS.

use anyhow::anyhow;
use anyhow::Context;
use bytes::Bytes;
use log::debug;
use log::error;
use log::info;
use log::warn;

use crate::assembler::flag_last_pack_for_flushing;
use crate::assembler::StreamAssembler;
use crate::codec::h264::nalu::trim_trailing_zeros;
use crate::codec::h264::nalu::Nalu;
use crate::codec::h264::nalu::NaluIterator;
use crate::codec::h264::nalu::NaluType;
use crate::codec::h264::param_sets::PpsStore;
use crate::codec::h264::param_sets::SpsStore;
use crate::codec::h264::parser::parse_pps;
use crate::codec::h264::parser::parse_slice_header;
use crate::codec::h264::parser::parse_slice_header_initial;
use crate::codec::h264::parser::parse_sps;
use crate::codec::h264::parser::SliceHeader;
use crate::pack::ChunkKind;
use crate::pack::Pack;
use crate::pack::PackQueue;
use crate::pack::VideoBuffer;
use crate::pack::VideoChunk;
use crate::CodecType;
use crate::FrameMetadata;

pub struct H264Assembler {
    sps: SpsStore,
    pps: PpsStore,
    /// Parameter sets the hardware currently knows about.
    active_sps: Option<u8>,
    active_pps: Option<u8>,
    /// Header of the first slice of the picture being assembled.
    current: Option<SliceHeader>,
    synchronized: bool,
    /// Synchronization was lost since the last IDR picture.
    discontinuity: bool,
    disable_reordering: bool,
}

impl H264Assembler {
    pub fn new(disable_reordering: bool) -> Self {
        Self {
            sps: SpsStore::new(),
            pps: PpsStore::new(),
            active_sps: None,
            active_pps: None,
            current: None,
            synchronized: false,
            discontinuity: false,
            disable_reordering,
        }
    }

    fn go_out_of_sync(&mut self, queue: &mut PackQueue) {
        if self.synchronized {
            error!("H264 parser going out of sync till next IDR");
            self.synchronized = false;
            self.discontinuity = true;
        }

        queue.complete_back();
        self.current = None;
    }

    fn process_sps(&mut self, bytes: Bytes) -> anyhow::Result<()> {
        let sps = parse_sps(&bytes).context("Broken stream: invalid SPS")?;
        let id = sps.seq_parameter_set_id;

        if self.sps.update(usize::from(id), bytes, None, sps) {
            debug!("SPS {} updated", id);
            if self.active_sps == Some(id) {
                self.active_sps = None;
                self.active_pps = None;
            }
        }

        Ok(())
    }

    fn process_pps(&mut self, bytes: Bytes) -> anyhow::Result<()> {
        let pps = parse_pps(&bytes).context("Broken stream: invalid PPS")?;
        let id = pps.pic_parameter_set_id;
        let sps_id = pps.seq_parameter_set_id;

        if !self.sps.contains(usize::from(sps_id)) {
            return Err(anyhow!(
                "Broken stream: PPS {} refers to unknown SPS {}",
                id,
                sps_id
            ));
        }

        let previous_sps = self.pps.get(usize::from(id)).and_then(|pps| pps.referenced);
        if self.pps.update(usize::from(id), bytes, Some(sps_id), pps) {
            debug!("PPS {} updated", id);
            if self.active_pps == Some(id) {
                self.active_pps = None;
                if previous_sps != Some(sps_id) {
                    self.active_sps = None;
                }
            }
        }

        Ok(())
    }

    fn process_slice(
        &mut self,
        queue: &mut PackQueue,
        bytes: Bytes,
        meta: &FrameMetadata,
    ) -> anyhow::Result<()> {
        let initial =
            parse_slice_header_initial(&bytes).context("Broken stream: invalid slice header")?;

        if !self.synchronized && !initial.idr_pic_flag {
            debug!("Dropping slice of {} bytes while out of sync", bytes.len());
            return Ok(());
        }

        let pps_id = initial.pic_parameter_set_id;
        let pps = self
            .pps
            .get(usize::from(pps_id))
            .ok_or_else(|| anyhow!("Broken stream: slice refers to unknown PPS {}", pps_id))?;
        let sps_id = pps.info.seq_parameter_set_id;
        let sps = self
            .sps
            .get(usize::from(sps_id))
            .ok_or_else(|| anyhow!("Broken stream: PPS {} refers to unknown SPS {}", pps_id, sps_id))?;

        let hdr = parse_slice_header(&bytes, &sps.info, &pps.info)
            .context("Broken stream: invalid slice header")?;

        if !hdr.idr_pic_flag && self.active_sps != Some(sps_id) {
            return Err(anyhow!(
                "Broken stream: non-IDR slice refers to SPS {} which is not active",
                sps_id
            ));
        }

        if !self.synchronized {
            info!("H264 parser synchronized on IDR picture");
            self.synchronized = true;
        }

        let new_picture = match (&self.current, queue.back()) {
            (Some(current), Some(back)) if !back.is_complete => current.is_different_picture(&hdr),
            _ => true,
        };

        if !new_picture {
            if let Some(pack) = queue.back_mut() {
                pack.push_chunk(VideoChunk::new(bytes, ChunkKind::Slice).with_meta(meta.clone()));
            }
            return Ok(());
        }

        let mut pack = Pack::new(CodecType::H264, sps.info.geometry(), sps.info.max_num_ref_frames);
        pack.can_reopen_decoding = hdr.idr_pic_flag;
        pack.can_be_dropped = hdr.nal_ref_idc == 0;
        pack.needs_reordering = !self.disable_reordering && sps.info.needs_reordering();

        if hdr.idr_pic_flag {
            pack.discontinuity = std::mem::take(&mut self.discontinuity);
            pack.push_chunk(VideoChunk::new(sps.bytes.clone(), ChunkKind::Sps));
            pack.push_chunk(VideoChunk::new(pps.bytes.clone(), ChunkKind::Pps));
            self.active_sps = Some(sps_id);
            self.active_pps = Some(pps_id);
        } else if self.active_pps != Some(pps_id) {
            pack.push_chunk(VideoChunk::new(pps.bytes.clone(), ChunkKind::Pps));
            self.active_pps = Some(pps_id);
        }

        pack.push_chunk(VideoChunk::new(bytes, ChunkKind::Slice).with_meta(meta.clone()));
        queue.push_new_pack(pack);
        self.current = Some(hdr);

        Ok(())
    }

    /// Data partitions B and C belong to the picture of the preceding partition A.
    fn process_partition(&mut self, queue: &mut PackQueue, bytes: Bytes) {
        match queue.back_mut() {
            Some(pack) if self.synchronized && self.current.is_some() && !pack.is_complete => {
                pack.push_chunk(VideoChunk::new(bytes, ChunkKind::Continuation))
            }
            _ => debug!("Dropping data partition without a picture"),
        }
    }

    fn process_end_of_stream(&mut self, queue: &mut PackQueue) {
        match queue.back_mut() {
            Some(pack) => pack.needs_flushing = true,
            None => warn!("End of stream without a picture to flush"),
        }

        queue.complete_back();
        self.current = None;
    }

    fn process_nalu(
        &mut self,
        queue: &mut PackQueue,
        buffer: &VideoBuffer,
        nalu: &Nalu,
    ) -> anyhow::Result<()> {
        let bytes = buffer.data.slice(nalu.offset..nalu.offset + nalu.size());

        if nalu.header.forbidden_zero_bit {
            return Err(anyhow!("Broken stream: forbidden bit set in {}", nalu.header));
        }

        match nalu.header.type_() {
            Some(NaluType::Sps) => {
                let len = trim_trailing_zeros(nalu.data).len();
                self.process_sps(bytes.slice(..len))
            }
            Some(NaluType::Pps) => {
                let len = trim_trailing_zeros(nalu.data).len();
                self.process_pps(bytes.slice(..len))
            }
            Some(NaluType::Slice | NaluType::SliceDpa | NaluType::SliceIdr) => {
                self.process_slice(queue, bytes, &buffer.meta)
            }
            Some(NaluType::SliceDpb | NaluType::SliceDpc) => {
                self.process_partition(queue, bytes);
                Ok(())
            }
            Some(NaluType::SeqEnd | NaluType::StreamEnd) => {
                self.process_end_of_stream(queue);
                Ok(())
            }
            _ => {
                debug!("Discarding NAL unit {}", nalu.header);
                Ok(())
            }
        }
    }
}

impl StreamAssembler for H264Assembler {
    fn codec(&self) -> CodecType {
        CodecType::H264
    }

    fn process_buffer(&mut self, queue: &mut PackQueue, mut buffer: VideoBuffer) {
        let iter = NaluIterator::new(&buffer.data);

        match iter.leading_bytes() {
            None => {
                warn!(
                    "Dropping buffer of {} bytes without NAL start code",
                    buffer.data.len()
                );
                self.go_out_of_sync(queue);
                queue.attach_release(buffer.release.take());
                return;
            }
            Some(leading) if iter.has_leading_garbage() => {
                warn!("Skipping {} bytes before the first NAL start code", leading)
            }
            Some(_) => (),
        }

        for nalu in iter {
            if let Err(e) = self.process_nalu(queue, &buffer, &nalu) {
                warn!("Discarding {}: {:#}", nalu.header, e);
                self.go_out_of_sync(queue);
            }
        }

        queue.attach_release(buffer.release.take());
    }

    fn end_of_input(&mut self, queue: &mut PackQueue) {
        if flag_last_pack_for_flushing(queue) {
            warn!("Terminating stream at the end of input, no EOS detected");
        }
        self.current = None;
    }

    fn reset(&mut self) {
        self.sps.clear();
        self.pps.clear();
        self.active_sps = None;
        self.active_pps = None;
        self.current = None;
        self.synchronized = false;
        self.discontinuity = false;
    }

    fn is_synchronized(&self) -> bool {
        self.synchronized
    }
}
