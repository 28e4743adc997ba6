// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The decoder: takes packs from a [`PackQueue`] and runs them through hardware decoding
//! sessions, opening a new session whenever the stream requires it.
//!
//! Decoding is pulled by the caller, one pack per [`VpuDecoder::step`]. Decoded frames stay owned
//! by the decoder's frame buffers and must be handed back with
//! [`VpuDecoder::return_output_frame`] once displayed.

pub mod buffers;
pub mod frame_buffers;
pub mod monitoring;
pub mod session;

use std::collections::VecDeque;
use std::fmt;

use anyhow::anyhow;
use anyhow::Context;
use log::debug;
use log::error;
use log::info;
use log::warn;
use thiserror::Error;

use crate::assembler::vp8::sequence_header;
use crate::backend::BackendError;
use crate::backend::DmaBuffer;
use crate::backend::OutputFlags;
use crate::backend::VpuDevice;
use crate::decoder::buffers::DecoderBuffers;
use crate::decoder::frame_buffers::FrameBuffers;
use crate::decoder::session::DecodingSession;
use crate::decoder::session::FeedOutcome;
use crate::decoder::session::SessionParameters;
use crate::decoder::session::SessionState;
use crate::nv12_copy;
use crate::pack::ChunkKind;
use crate::pack::Pack;
use crate::pack::PackPurpose;
use crate::pack::PackQueue;
use crate::pack::VideoChunk;
use crate::visible_nv12_size;
use crate::CodecType;
use crate::DecoderConfig;
use crate::DecodingStats;
use crate::FrameGeometry;
use crate::FrameMetadata;
use crate::Nv12Layout;
use crate::Timestamp;

pub type Result<T> = std::result::Result<T, DecodeError>;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("no hardware session is open")]
    NotOpen,
    #[error("picture of {0} macroblocks exceeds the hardware limit")]
    MacroblockLimitExceeded(u32),
    #[error("unsupported stream: {0}")]
    UnsupportedStream(&'static str),
    #[error("{needed} bytes of input do not fit in a bitstream buffer of {available} bytes")]
    InputBufferTooSmall { needed: usize, available: usize },
    #[error("hardware reported a change of stream parameters")]
    ParamsChanged,
    #[error("hardware decode timed out")]
    Timeout,
    #[error("hardware reported a bitstream syntax error")]
    SyntaxError,
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A decoded picture, given out for display.
///
/// The frame buffer stays reserved until the frame is handed back with
/// [`VpuDecoder::return_output_frame`]. Dropping the frame alone does not make the buffer
/// available to the hardware again.
pub struct OutputFrame {
    /// Index of the frame buffer, as known by the hardware.
    pub index: usize,
    pub buffer: DmaBuffer,
    pub geometry: FrameGeometry,
    pub layout: Nv12Layout,
    pub meta: Option<FrameMetadata>,
}

impl OutputFrame {
    pub fn physical_address(&self) -> u64 {
        self.buffer.physical_address()
    }

    pub fn timestamp(&self) -> Option<Timestamp> {
        self.meta.as_ref().map(|meta| meta.timestamp)
    }

    /// Size of the visible NV12 picture, as written by `read_visible`.
    pub fn visible_size(&self) -> usize {
        visible_nv12_size(&self.geometry)
    }

    /// Copies the visible NV12 picture into `dst`.
    pub fn read_visible(&self, dst: &mut [u8]) -> Result<()> {
        if dst.len() < self.visible_size() {
            return Err(anyhow!(
                "destination of {} bytes too small for a {} picture",
                dst.len(),
                self.geometry
            )
            .into());
        }

        let mut src = vec![0; self.layout.mv_col_offset];
        self.buffer.read(0, &mut src)?;
        nv12_copy(&src, dst, &self.geometry, &self.layout);

        Ok(())
    }
}

impl fmt::Debug for OutputFrame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("OutputFrame")
            .field("index", &self.index)
            .field("physical_address", &format_args!("{:#x}", self.physical_address()))
            .field("geometry", &self.geometry)
            .field("meta", &self.meta)
            .finish()
    }
}

/// Decodes packs on hardware reachable through `D`.
pub struct VpuDecoder<D: VpuDevice> {
    device: D,
    config: DecoderConfig,
    session: Option<DecodingSession<D::Instance>>,
    /// Frame buffers, shared by successive sessions so that frames held by consumers survive a
    /// reopening.
    frames: FrameBuffers,
    buffers: DecoderBuffers,
    /// Frames decoded but not handed to the caller yet.
    ready: VecDeque<OutputFrame>,
    /// The front pack ends the stream and the session is being drained.
    draining: bool,
    /// Statistics of the sessions that went away.
    stats: DecodingStats,
}

impl<D: VpuDevice> VpuDecoder<D> {
    pub fn new(device: D, config: DecoderConfig) -> Self {
        Self::with_buffers(device, config, DecoderBuffers::default())
    }

    /// Creates a decoder whose first session uses the work buffer sizes of `buffers`.
    pub fn with_buffers(device: D, config: DecoderConfig, buffers: DecoderBuffers) -> Self {
        Self {
            device,
            config,
            session: None,
            frames: FrameBuffers::new(),
            buffers,
            ready: VecDeque::new(),
            draining: false,
            stats: DecodingStats::default(),
        }
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn session_state(&self) -> SessionState {
        self.session
            .as_ref()
            .map_or(SessionState::Closed, DecodingSession::state)
    }

    /// Statistics of every session so far, the current one included.
    pub fn stats(&self) -> DecodingStats {
        let mut stats = self.stats.clone();
        if let Some(session) = &self.session {
            stats.merge(session.stats());
        }
        stats
    }

    /// Number of frames given out and not returned yet.
    pub fn frames_given(&self) -> usize {
        self.frames.given_count()
    }

    /// Whether the next pack can be decoded, i.e. a session can be opened or the current one has
    /// a frame buffer to decode into.
    pub fn has_frame_for_decoding(&self) -> bool {
        match &self.session {
            Some(session) if session.state().is_running() => self.frames.has_free_slot(),
            _ => true,
        }
    }

    /// Decodes the front pack of `queue` once it is complete. Returns the next frame ready for
    /// display, if any.
    pub fn step(&mut self, queue: &mut PackQueue) -> Result<Option<OutputFrame>> {
        self.step_for(queue, PackPurpose::Consumption)
    }

    /// Like `step`, but feeds the chunks of the front pack as soon as they are available, without
    /// waiting for the pack to be complete.
    pub fn try_step(&mut self, queue: &mut PackQueue) -> Result<Option<OutputFrame>> {
        self.step_for(queue, PackPurpose::Feeding)
    }

    fn step_for(&mut self, queue: &mut PackQueue, purpose: PackPurpose) -> Result<Option<OutputFrame>> {
        if let Some(frame) = self.ready.pop_front() {
            return Ok(Some(frame));
        }

        if self.draining {
            return self.drain_front(queue);
        }

        if let Some(max) = self.config.max_queued_packs {
            if queue.len() > max {
                let dropped = queue.drop_droppable();
                if dropped > 0 {
                    warn!("Decoding late, {} droppable packs skipped", dropped);
                    self.stats.number_of_dropped_packs += dropped as u64;
                }
            }
        }

        if !self.has_frame_for_decoding() || !queue.has_pack_for(purpose) {
            return Ok(None);
        }

        if let Err(e) = self.process_front(queue, purpose) {
            error!("Decoding pack failed, dropping it: {}", e);
            queue.pop_front();
            self.close_session();
            return Err(e);
        }

        Ok(self.ready.pop_front())
    }

    /// Runs one step of draining the current session. Returns the next frame ready for display,
    /// if any.
    pub fn flush_step(&mut self) -> Result<Option<OutputFrame>> {
        if let Some(frame) = self.ready.pop_front() {
            return Ok(Some(frame));
        }

        let result = match self.session.as_mut() {
            Some(session) if session.state().is_running() => session.flush_step(&mut self.frames),
            _ => Ok(true),
        };
        self.collect_ready();

        result?;
        Ok(self.ready.pop_front())
    }

    /// Continues draining for the pack at the front of `queue`, which ends the stream. The pack
    /// goes away once the session produces nothing more.
    fn drain_front(&mut self, queue: &mut PackQueue) -> Result<Option<OutputFrame>> {
        let drained = match self.session.as_mut() {
            Some(session) if session.state().is_running() => session.flush_step(&mut self.frames),
            _ => Ok(true),
        };
        self.collect_ready();

        match drained {
            Ok(false) => (),
            Ok(true) => {
                debug!("Stream drained");
                self.draining = false;
                queue.pop_front();
            }
            Err(e) => {
                error!("Draining failed: {}", e);
                self.draining = false;
                queue.pop_front();
                self.close_session();
                return Err(e);
            }
        }

        Ok(self.ready.pop_front())
    }

    fn collect_ready(&mut self) {
        if let Some(session) = self.session.as_mut() {
            while let Some(frame) = session.pop_ready() {
                self.ready.push_back(frame);
            }
        }
    }

    /// Whether the current session cannot decode `pack`.
    fn needs_reopening(&self, pack: &Pack) -> bool {
        let Some(session) = self.session.as_ref().filter(|s| s.state() == SessionState::Open) else {
            return true;
        };

        if pack.discontinuity {
            info!("Reopening decoding after a stream discontinuity");
            true
        } else if !session.accepts(pack) {
            info!(
                "Stream parameters changed from {} to {}",
                session.parameters(),
                SessionParameters::from(pack)
            );
            true
        } else if pack.can_reopen_decoding && self.buffers.needs_growth() {
            info!("Reopening decoding to grow the bitstream buffer");
            true
        } else {
            false
        }
    }

    fn process_front(&mut self, queue: &mut PackQueue, purpose: PackPurpose) -> Result<()> {
        let reopen = match queue.front() {
            Some(pack) => pack.is_untouched() && self.needs_reopening(pack),
            None => return Ok(()),
        };

        if reopen {
            self.end_session();
            let state = self.session_state();
            if state != SessionState::Closed {
                // Frame buffers of the previous session are still held by the consumer.
                debug!("Previous session {:?}, not reopening yet", state);
                return Ok(());
            }

            if !queue.skip_to_reopen_point(purpose) {
                debug!("No pack to reopen decoding from");
                return Ok(());
            }

            let Some(pack) = queue.front_mut() else {
                return Ok(());
            };
            self.open_session(pack)?;
        }

        let Some(pack) = queue.front_mut() else {
            return Ok(());
        };

        if pack.has_unfed_chunks() {
            let session = self.session.as_mut().ok_or(DecodeError::NotOpen)?;
            let chunks: Vec<&VideoChunk> = pack.unfed_chunks().iter().collect();
            let total = chunks.iter().map(|chunk| chunk.len()).sum();
            self.buffers.note_input(total);

            let outcome = session.feed(&mut self.frames, &chunks);
            self.collect_ready();

            match outcome? {
                FeedOutcome::NotConsumed => {
                    if pack.can_reopen_decoding {
                        info!("Pack of {} bytes not consumed, retrying with a new session", total);
                        pack.rewind();
                    } else {
                        warn!("Dropping pack of {} bytes that did not fit the bitstream buffer", total);
                        queue.pop_front();
                    }
                    return Ok(());
                }
                FeedOutcome::Consumed(summary) => {
                    pack.mark_fed();
                    if summary.decoded > 0 {
                        pack.decoded = true;
                    } else if !pack.is_complete
                        && summary.flags.contains(OutputFlags::NOT_ENOUGH_INPUT)
                    {
                        self.stats.number_of_rolled_back_decodes += 1;
                    }
                }
            }
        }

        if pack.is_complete && !pack.has_unfed_chunks() {
            if pack.needs_flushing {
                debug!("Last pack of the stream fed, draining");
                self.draining = true;
            } else {
                queue.pop_front();
            }
        }

        Ok(())
    }

    /// Opens a session for `pack`, which must be able to reopen decoding, feeding it the leading
    /// chunks the hardware needs to set itself up.
    fn open_session(&mut self, pack: &mut Pack) -> Result<()> {
        self.drop_session();

        let initial_count = match pack.codec {
            CodecType::H264 => pack
                .chunks()
                .iter()
                .take_while(|chunk| matches!(chunk.kind, ChunkKind::Sps | ChunkKind::Pps))
                .count(),
            _ => 0,
        };
        let initial_count = match initial_count {
            0 => pack.chunks().len(),
            count => count,
        };

        // A new VP8 session always starts with a sequence header.
        let header = match pack.chunks().first() {
            Some(chunk) if pack.codec == CodecType::Vp8 && chunk.kind != ChunkKind::SequenceHeader => {
                let data = sequence_header(pack.geometry.true_width as u16, pack.geometry.true_height as u16)
                    .context("while building the VP8 sequence header")?;
                Some(VideoChunk::new(data, ChunkKind::SequenceHeader))
            }
            _ => None,
        };

        let initial: Vec<&VideoChunk> = header
            .iter()
            .chain(pack.chunks()[..initial_count].iter())
            .collect();
        self.buffers.note_input(initial.iter().map(|chunk| chunk.len()).sum());
        self.buffers.grow();

        let parameters = SessionParameters::from(&*pack);
        info!("Opening decoding session for {}", parameters);
        let session = DecodingSession::open(
            &mut self.device,
            &mut self.frames,
            &self.buffers,
            &self.config,
            parameters,
            &initial,
        )?;

        pack.mark_fed_up_to(initial_count);
        self.session = Some(session);
        self.collect_ready();

        Ok(())
    }

    /// Drains the current session before replacing it, keeping the frames it still produces.
    fn end_session(&mut self) {
        if let Some(session) = self.session.as_mut().filter(|s| s.state().is_running()) {
            if let Err(e) = session.flush(&mut self.frames) {
                warn!("Flushing the previous session failed: {}", e);
            }
        }
        self.collect_ready();
    }

    /// Stops the current session right away.
    fn close_session(&mut self) {
        if let Some(session) = self.session.as_mut() {
            session.close(&mut self.frames);
        }
        self.collect_ready();
    }

    fn drop_session(&mut self) {
        if let Some(session) = self.session.take() {
            self.stats.merge(session.stats());
        }
    }

    /// Takes back the frame whose buffer is at `physical_address`, once the consumer is done with
    /// it. Unknown addresses and frames returned twice are ignored.
    pub fn return_output_frame(&mut self, physical_address: u64) -> Result<()> {
        let result = match self.session.as_mut() {
            Some(session) => session
                .on_frame_returned(&mut self.frames, physical_address)
                .map(|_| ()),
            None => {
                self.frames.mark_returned(physical_address);
                Ok(())
            }
        };
        self.collect_ready();

        result
    }

    /// Stops decoding. Frames decoded but not handed out yet are discarded.
    pub fn close(&mut self) {
        self.close_session();
        for frame in self.ready.drain(..) {
            self.frames.mark_returned(frame.physical_address());
        }
        self.drop_session();
        self.draining = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::h264::H264Assembler;
    use crate::assembler::vp8::Vp8Assembler;
    use crate::assembler::StreamAssembler;
    use crate::backend::dummy::Command;
    use crate::backend::dummy::DummyConfig;
    use crate::backend::dummy::DummyHardware;
    use crate::codec::h264::parser::Pps;
    use crate::codec::h264::parser::Sps;
    use crate::codec::h264::synthesizer::pps_nalu;
    use crate::codec::h264::synthesizer::slice_nalu;
    use crate::codec::h264::synthesizer::sps_nalu;
    use crate::codec::h264::synthesizer::PpsBuilder;
    use crate::codec::h264::synthesizer::SliceHeaderBuilder;
    use crate::codec::h264::synthesizer::SpsBuilder;
    use crate::decoder::buffers::PAGE_SIZE;
    use crate::pack::VideoBuffer;

    const SLICE_DATA: [u8; 4] = [0x88, 0x84, 0x21, 0xa0];

    struct H264Stream {
        sps: Sps,
        pps: Pps,
    }

    impl H264Stream {
        fn new() -> Self {
            Self {
                sps: SpsBuilder::new(0).resolution(64, 64).build(),
                pps: PpsBuilder::new(0, 0).build(),
            }
        }

        fn idr(&self, idr_pic_id: u32) -> Vec<u8> {
            let mut data = sps_nalu(&self.sps).unwrap();
            data.extend(pps_nalu(&self.pps).unwrap());
            let hdr = SliceHeaderBuilder::new(&self.pps).idr(idr_pic_id).build();
            data.extend(slice_nalu(&hdr, &self.sps, &self.pps, &SLICE_DATA).unwrap());
            data
        }

        fn inter(&self, frame_num: u32) -> Vec<u8> {
            let hdr = SliceHeaderBuilder::new(&self.pps)
                .frame_num(frame_num)
                .pic_order_cnt_lsb(frame_num * 2)
                .build();
            slice_nalu(&hdr, &self.sps, &self.pps, &SLICE_DATA).unwrap()
        }
    }

    fn vp8_key_frame(width: u16, height: u16, len: usize) -> Vec<u8> {
        let mut frame = vec![0x50, 0x42, 0x00, 0x9d, 0x01, 0x2a];
        frame.extend_from_slice(&width.to_le_bytes());
        frame.extend_from_slice(&height.to_le_bytes());
        frame.extend_from_slice(&[0x00, 0x47, 0x08, 0x85]);
        frame.resize(len.max(frame.len()), 0x11);
        frame
    }

    fn vp8_inter_frame(len: usize) -> Vec<u8> {
        let mut frame = vec![0x31, 0x02, 0x00, 0x11, 0x22, 0x33];
        frame.resize(len.max(frame.len()), 0x22);
        frame
    }

    /// Steps `decoder` until nothing is left to do, returning each frame right away.
    fn run(decoder: &mut VpuDecoder<DummyHardware>, queue: &mut PackQueue) -> Vec<Timestamp> {
        let mut timestamps = Vec::new();

        for _ in 0..64 {
            match decoder.step(queue).unwrap() {
                Some(frame) => {
                    timestamps.push(frame.timestamp().unwrap());
                    decoder.return_output_frame(frame.physical_address()).unwrap();
                }
                None if queue.is_empty() => break,
                None => (),
            }
        }

        timestamps
    }

    #[test]
    fn h264_stream() {
        let _ = env_logger::try_init();

        let stream = H264Stream::new();
        let mut assembler = H264Assembler::new(false);
        let mut queue = PackQueue::new();
        assembler.process_buffer(&mut queue, VideoBuffer::new(stream.idr(0), 0));
        for i in 1..4 {
            assembler.process_buffer(&mut queue, VideoBuffer::new(stream.inter(i), i as i64 * 33));
        }
        assembler.end_of_input(&mut queue);

        let hw = DummyHardware::default();
        let mut decoder = VpuDecoder::new(hw.clone(), Default::default());

        assert_eq!(run(&mut decoder, &mut queue), [0, 33, 66, 99]);
        assert_eq!(hw.count(&Command::Open(CodecType::H264)), 1);
        assert_eq!(hw.count(&Command::UpdateBitstream(0)), 1);
        assert_eq!(hw.count(&Command::Close), 1);
        assert_eq!(decoder.session_state(), SessionState::Closed);
        assert_eq!(decoder.frames_given(), 0);
        assert!(decoder.stats().number_of_decode_operations >= 4);
    }

    #[test]
    fn oversized_sps_is_dropped() {
        let stream = H264Stream {
            sps: SpsBuilder::new(0).resolution(1 << 26, 1 << 26).build(),
            pps: PpsBuilder::new(0, 0).build(),
        };
        let mut assembler = H264Assembler::new(false);
        let mut queue = PackQueue::new();
        assembler.process_buffer(&mut queue, VideoBuffer::new(stream.idr(0), 0));
        assembler.end_of_input(&mut queue);
        assert!(queue.is_empty());

        let hw = DummyHardware::default();
        let mut decoder = VpuDecoder::new(hw.clone(), Default::default());
        assert!(decoder.step(&mut queue).unwrap().is_none());
        assert_eq!(hw.count(&Command::Open(CodecType::H264)), 0);
    }

    #[test]
    fn late_decoding_skips_droppable_packs() {
        let stream = H264Stream::new();
        let mut assembler = H264Assembler::new(false);
        let mut queue = PackQueue::new();
        assembler.process_buffer(&mut queue, VideoBuffer::new(stream.idr(0), 0));
        for (i, nal_ref_idc) in [(1, 0), (2, 0), (3, 2)] {
            let hdr = SliceHeaderBuilder::new(&stream.pps)
                .nal_ref_idc(nal_ref_idc)
                .frame_num(1)
                .pic_order_cnt_lsb(i * 2)
                .build();
            let slice = slice_nalu(&hdr, &stream.sps, &stream.pps, &SLICE_DATA).unwrap();
            assembler.process_buffer(&mut queue, VideoBuffer::new(slice, i as i64));
        }
        assembler.end_of_input(&mut queue);
        assert_eq!(queue.len(), 4);

        let config = DecoderConfig {
            max_queued_packs: Some(1),
            ..Default::default()
        };
        let mut decoder = VpuDecoder::new(DummyHardware::default(), config);

        // The IDR picture is never skipped, the two non-reference pictures after it are.
        assert_eq!(run(&mut decoder, &mut queue), [0, 3]);
        assert_eq!(decoder.stats().number_of_dropped_packs, 2);
    }

    #[test]
    fn reordered_frames_come_out_while_draining() {
        let stream = H264Stream::new();
        let mut assembler = H264Assembler::new(false);
        let mut queue = PackQueue::new();
        assembler.process_buffer(&mut queue, VideoBuffer::new(stream.idr(0), 0));
        assembler.process_buffer(&mut queue, VideoBuffer::new(stream.inter(1), 1));
        assembler.end_of_input(&mut queue);

        let hw = DummyHardware::new(DummyConfig {
            display_delay: 1,
            ..Default::default()
        });
        let mut decoder = VpuDecoder::new(hw, Default::default());

        // The first picture is held back by the hardware.
        assert!(decoder.step(&mut queue).unwrap().is_none());
        assert_eq!(queue.len(), 1);

        assert_eq!(run(&mut decoder, &mut queue), [0, 1]);
    }

    #[test]
    fn low_latency_feeding() {
        let stream = H264Stream::new();
        let mut assembler = H264Assembler::new(false);
        let mut queue = PackQueue::new();
        assembler.process_buffer(&mut queue, VideoBuffer::new(stream.idr(0), 7));

        let mut decoder = VpuDecoder::new(DummyHardware::default(), Default::default());

        // The pack is not complete until the next picture starts.
        assert!(decoder.step(&mut queue).unwrap().is_none());
        let frame = decoder.try_step(&mut queue).unwrap().unwrap();
        assert_eq!(frame.timestamp(), Some(7));
        assert_eq!(queue.len(), 1);
        assert!(queue.front().unwrap().decoded);

        // Nothing new to feed.
        assert!(decoder.try_step(&mut queue).unwrap().is_none());

        assembler.process_buffer(&mut queue, VideoBuffer::new(stream.inter(1), 8));
        assert!(decoder.try_step(&mut queue).unwrap().is_none());
        assert_eq!(queue.len(), 1);
        let frame = decoder.try_step(&mut queue).unwrap().unwrap();
        assert_eq!(frame.timestamp(), Some(8));
    }

    #[test]
    fn return_output_frame_twice() {
        let stream = H264Stream::new();
        let mut assembler = H264Assembler::new(false);
        let mut queue = PackQueue::new();
        assembler.process_buffer(&mut queue, VideoBuffer::new(stream.idr(0), 0));
        assembler.process_buffer(&mut queue, VideoBuffer::new(stream.inter(1), 1));

        let hw = DummyHardware::default();
        let mut decoder = VpuDecoder::new(hw.clone(), Default::default());
        let frame = decoder.step(&mut queue).unwrap().unwrap();
        assert_eq!(decoder.frames_given(), 1);

        decoder.return_output_frame(frame.physical_address()).unwrap();
        decoder.return_output_frame(frame.physical_address()).unwrap();
        decoder.return_output_frame(0x42).unwrap();

        assert_eq!(hw.count(&Command::ClearDisplayFlag(frame.index)), 1);
        assert_eq!(decoder.frames_given(), 0);
    }

    #[test]
    fn no_decoding_without_free_frame_buffer() {
        let mut assembler = Vp8Assembler::new();
        let mut queue = PackQueue::new();
        assembler.process_buffer(&mut queue, VideoBuffer::new(vp8_key_frame(64, 64, 20), 0));
        for i in 1..4 {
            assembler.process_buffer(&mut queue, VideoBuffer::new(vp8_inter_frame(20), i));
        }

        let config = DecoderConfig {
            display_reserve: 0,
            ..Default::default()
        };
        let mut decoder = VpuDecoder::new(DummyHardware::default(), config);

        let first = decoder.step(&mut queue).unwrap().unwrap();
        let second = decoder.step(&mut queue).unwrap().unwrap();
        assert!(!decoder.has_frame_for_decoding());

        // Both frame buffers are held: packs stay queued.
        assert!(decoder.step(&mut queue).unwrap().is_none());
        assert_eq!(queue.len(), 2);

        decoder.return_output_frame(first.physical_address()).unwrap();
        assert_eq!(decoder.step(&mut queue).unwrap().unwrap().timestamp(), Some(2));
        assert_eq!(queue.len(), 1);
        drop(second);
    }

    #[test]
    fn oversized_key_frame_reopens_with_larger_buffer() {
        let _ = env_logger::try_init();

        let mut assembler = Vp8Assembler::new();
        let mut queue = PackQueue::new();
        assembler.process_buffer(&mut queue, VideoBuffer::new(vp8_key_frame(64, 64, 100), 0));
        assembler.process_buffer(&mut queue, VideoBuffer::new(vp8_inter_frame(3000), 1));
        assembler.process_buffer(&mut queue, VideoBuffer::new(vp8_key_frame(64, 64, 6000), 2));
        assembler.process_buffer(&mut queue, VideoBuffer::new(vp8_inter_frame(100), 3));

        let hw = DummyHardware::default();
        let mut decoder =
            VpuDecoder::with_buffers(hw.clone(), Default::default(), DecoderBuffers::new(PAGE_SIZE));

        assert_eq!(run(&mut decoder, &mut queue), [0, 1, 2, 3]);
        // The key frame did not fit the first session, and was fed again to a second one.
        assert_eq!(hw.count(&Command::Open(CodecType::Vp8)), 2);
        assert_eq!(hw.count(&Command::UpdateBitstream(0)), 1);
    }

    #[test]
    fn resolution_change_reopens() {
        let mut assembler = Vp8Assembler::new();
        let mut queue = PackQueue::new();
        assembler.process_buffer(&mut queue, VideoBuffer::new(vp8_key_frame(64, 64, 20), 0));
        assembler.process_buffer(&mut queue, VideoBuffer::new(vp8_inter_frame(20), 1));
        assembler.process_buffer(&mut queue, VideoBuffer::new(vp8_key_frame(128, 96, 20), 2));
        assembler.process_buffer(&mut queue, VideoBuffer::new(vp8_inter_frame(20), 3));

        let hw = DummyHardware::default();
        let mut decoder = VpuDecoder::new(hw.clone(), Default::default());
        let mut frames = Vec::new();
        for _ in 0..8 {
            if let Some(frame) = decoder.step(&mut queue).unwrap() {
                frames.push(frame);
            }
        }

        let geometries: Vec<FrameGeometry> = frames.iter().map(|frame| frame.geometry).collect();
        assert_eq!(
            geometries,
            [
                FrameGeometry::from_true(64, 64),
                FrameGeometry::from_true(64, 64),
                FrameGeometry::from_true(128, 96),
                FrameGeometry::from_true(128, 96),
            ]
        );
        assert_eq!(hw.count(&Command::Open(CodecType::Vp8)), 2);
        assert_eq!(decoder.frames_given(), 4);

        // Frames of the first session can still be returned.
        for frame in &frames {
            decoder.return_output_frame(frame.physical_address()).unwrap();
        }
        assert_eq!(decoder.frames_given(), 0);
    }

    #[test]
    fn errors_drop_packs_until_next_key_frame() {
        let _ = env_logger::try_init();

        let mut assembler = Vp8Assembler::new();
        let mut queue = PackQueue::new();
        assembler.process_buffer(&mut queue, VideoBuffer::new(vp8_key_frame(64, 64, 20), 0));
        for i in 1..4 {
            assembler.process_buffer(&mut queue, VideoBuffer::new(vp8_inter_frame(20), i));
        }
        assembler.process_buffer(&mut queue, VideoBuffer::new(vp8_key_frame(64, 64, 20), 4));

        let hw = DummyHardware::default();
        let mut decoder = VpuDecoder::new(hw.clone(), Default::default());
        let frame = decoder.step(&mut queue).unwrap().unwrap();
        decoder.return_output_frame(frame.physical_address()).unwrap();

        hw.update_config(|config| config.corrupted_steps = 1);
        assert!(matches!(decoder.step(&mut queue), Err(DecodeError::SyntaxError)));
        assert_eq!(decoder.session_state(), SessionState::Closed);
        assert_eq!(queue.len(), 3);

        // Inter frames cannot restart decoding.
        assert_eq!(decoder.step(&mut queue).unwrap().unwrap().timestamp(), Some(4));
        assert!(queue.is_empty());
        assert_eq!(hw.count(&Command::Open(CodecType::Vp8)), 2);
    }

    #[test]
    fn timeout_resets_hardware() {
        let mut assembler = Vp8Assembler::new();
        let mut queue = PackQueue::new();
        assembler.process_buffer(&mut queue, VideoBuffer::new(vp8_key_frame(64, 64, 20), 0));

        let hw = DummyHardware::new(DummyConfig {
            stalled_steps: 1,
            ..Default::default()
        });
        let mut decoder = VpuDecoder::new(hw.clone(), Default::default());

        assert!(matches!(decoder.step(&mut queue), Err(DecodeError::Timeout)));
        assert_eq!(hw.count(&Command::SoftwareReset), 1);
        assert_eq!(hw.count(&Command::Close), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn session_waits_for_all_frames() {
        let mut assembler = Vp8Assembler::new();
        let mut queue = PackQueue::new();
        assembler.process_buffer(&mut queue, VideoBuffer::new(vp8_key_frame(64, 64, 20), 0));
        assembler.end_of_input(&mut queue);

        let config = DecoderConfig {
            wait_for_all_frames: true,
            ..Default::default()
        };
        let mut decoder = VpuDecoder::new(DummyHardware::default(), config);

        let frame = decoder.step(&mut queue).unwrap().unwrap();
        assert!(decoder.step(&mut queue).unwrap().is_none());
        assert!(queue.is_empty());
        assert_eq!(decoder.session_state(), SessionState::WaitingForAllFrames);

        decoder.return_output_frame(frame.physical_address()).unwrap();
        assert_eq!(decoder.session_state(), SessionState::Closed);
    }

    #[test]
    fn reopening_waits_for_all_frames() {
        let mut assembler = Vp8Assembler::new();
        let mut queue = PackQueue::new();
        assembler.process_buffer(&mut queue, VideoBuffer::new(vp8_key_frame(64, 64, 20), 0));
        assembler.process_buffer(&mut queue, VideoBuffer::new(vp8_key_frame(128, 96, 20), 1));

        let hw = DummyHardware::default();
        let config = DecoderConfig {
            wait_for_all_frames: true,
            ..Default::default()
        };
        let mut decoder = VpuDecoder::new(hw.clone(), config);

        let first = decoder.step(&mut queue).unwrap().unwrap();
        assert!(decoder.step(&mut queue).unwrap().is_none());
        assert_eq!(decoder.session_state(), SessionState::WaitingForAllFrames);
        assert_eq!(hw.count(&Command::Open(CodecType::Vp8)), 1);
        assert_eq!(queue.len(), 1);

        decoder.return_output_frame(first.physical_address()).unwrap();
        assert_eq!(decoder.session_state(), SessionState::Closed);

        let second = decoder.step(&mut queue).unwrap().unwrap();
        assert_eq!(second.geometry, FrameGeometry::from_true(128, 96));
        assert_eq!(hw.count(&Command::Open(CodecType::Vp8)), 2);
        assert_eq!(decoder.session_state(), SessionState::Open);
    }

    #[test]
    fn no_reopening_while_flushing() {
        let mut assembler = Vp8Assembler::new();
        let mut queue = PackQueue::new();
        assembler.process_buffer(&mut queue, VideoBuffer::new(vp8_key_frame(64, 64, 20), 0));
        assembler.process_buffer(&mut queue, VideoBuffer::new(vp8_inter_frame(20), 1));
        assembler.process_buffer(&mut queue, VideoBuffer::new(vp8_key_frame(128, 96, 20), 2));

        let hw = DummyHardware::default();
        let config = DecoderConfig {
            display_reserve: 0,
            ..Default::default()
        };
        let mut decoder = VpuDecoder::new(hw.clone(), config);
        let first = decoder.step(&mut queue).unwrap().unwrap();
        let second = decoder.step(&mut queue).unwrap().unwrap();

        // Both frame buffers are held: draining cannot go on.
        assert!(decoder.flush_step().unwrap().is_none());
        assert_eq!(decoder.session_state(), SessionState::Flushing);
        assert!(decoder.step(&mut queue).unwrap().is_none());
        assert_eq!(hw.count(&Command::Open(CodecType::Vp8)), 1);
        assert_eq!(queue.len(), 1);

        decoder.return_output_frame(first.physical_address()).unwrap();
        assert_eq!(decoder.session_state(), SessionState::Closed);

        let third = decoder.step(&mut queue).unwrap().unwrap();
        assert_eq!(third.timestamp(), Some(2));
        assert_eq!(third.geometry, FrameGeometry::from_true(128, 96));
        assert_eq!(hw.count(&Command::Open(CodecType::Vp8)), 2);
        drop(second);
    }

    #[test]
    fn flush_step_drains_current_session() {
        let mut assembler = Vp8Assembler::new();
        let mut queue = PackQueue::new();
        assembler.process_buffer(&mut queue, VideoBuffer::new(vp8_key_frame(64, 64, 20), 0));
        assembler.process_buffer(&mut queue, VideoBuffer::new(vp8_inter_frame(20), 1));

        let hw = DummyHardware::new(DummyConfig {
            display_delay: 1,
            ..Default::default()
        });
        let mut decoder = VpuDecoder::new(hw, Default::default());
        assert!(decoder.step(&mut queue).unwrap().is_none());
        assert_eq!(decoder.step(&mut queue).unwrap().unwrap().timestamp(), Some(0));

        assert_eq!(decoder.flush_step().unwrap().unwrap().timestamp(), Some(1));
        assert!(decoder.flush_step().unwrap().is_none());
        assert_eq!(decoder.session_state(), SessionState::Closed);
    }

    #[test]
    fn read_visible_picture() {
        let mut assembler = Vp8Assembler::new();
        let mut queue = PackQueue::new();
        assembler.process_buffer(&mut queue, VideoBuffer::new(vp8_key_frame(20, 18, 20), 0));

        let mut decoder = VpuDecoder::new(DummyHardware::default(), Default::default());
        let frame = decoder.step(&mut queue).unwrap().unwrap();
        assert_eq!(frame.layout.stride, 32);

        let luma: Vec<u8> = (0..frame.layout.cb_offset).map(|i| (i % 32) as u8).collect();
        frame.buffer.write(0, &luma).unwrap();

        let mut picture = vec![0; frame.visible_size()];
        frame.read_visible(&mut picture).unwrap();
        assert_eq!(picture.len(), 20 * 18 + 20 * 9);
        assert_eq!(&picture[..20], &(0..20).collect::<Vec<u8>>()[..]);
        assert_eq!(&picture[20..40], &(0..20).collect::<Vec<u8>>()[..]);

        let mut small = vec![0; 10];
        assert!(frame.read_visible(&mut small).is_err());
    }

    #[test]
    fn close_releases_everything() {
        let mut assembler = Vp8Assembler::new();
        let mut queue = PackQueue::new();
        assembler.process_buffer(&mut queue, VideoBuffer::new(vp8_key_frame(64, 64, 20), 0));

        let hw = DummyHardware::default();
        let mut decoder = VpuDecoder::new(hw.clone(), Default::default());
        let frame = decoder.step(&mut queue).unwrap().unwrap();

        decoder.close();
        assert_eq!(hw.count(&Command::Close), 1);
        assert_eq!(decoder.session_state(), SessionState::Closed);

        decoder.return_output_frame(frame.physical_address()).unwrap();
        assert_eq!(decoder.frames_given(), 0);
    }
}
