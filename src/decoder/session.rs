// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! One hardware decoding session: a hardware instance opened for given stream parameters, from
//! the first restart point fed to it until it is drained or fails.

use std::collections::VecDeque;
use std::fmt;
use std::time::Instant;

use anyhow::anyhow;
use log::debug;
use log::error;
use log::info;
use log::warn;

use crate::backend::BackendResult;
use crate::backend::CodecOpenParams;
use crate::backend::DmaBuffer;
use crate::backend::FrameBufferRegistration;
use crate::backend::OpenParams;
use crate::backend::OutputFlags;
use crate::backend::VpuDevice;
use crate::backend::VpuInstance;
use crate::decoder::buffers::DecoderBuffers;
use crate::decoder::buffers::MB_PREDICTION_BUFFER_SIZE;
use crate::decoder::buffers::PS_SAVE_BUFFER_SIZE;
use crate::decoder::buffers::SLICE_BUFFER_SIZE;
use crate::decoder::frame_buffers::FrameBuffers;
use crate::decoder::monitoring::BitstreamMonitor;
use crate::decoder::DecodeError;
use crate::decoder::OutputFrame;
use crate::decoder::Result;
use crate::pack::Pack;
use crate::pack::VideoChunk;
use crate::CodecType;
use crate::DecoderConfig;
use crate::DecodingStats;
use crate::FrameGeometry;
use crate::Nv12Layout;

/// Largest picture the hardware can decode, in macroblocks. This is 1920x1088.
pub const MAX_MACROBLOCKS: u32 = 8160;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Open,
    /// The end of the input was signalled, the hardware is being drained.
    Flushing,
    /// The hardware is closed but some output frames are still held by consumers.
    WaitingForAllFrames,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    Opened,
    FlushStarted,
    /// The hardware instance went away, drained or failed.
    Ended { frames_outstanding: bool },
    AllFramesReturned,
}

impl SessionState {
    /// The state reached from `self` on `event`, `None` if the transition is not allowed.
    pub fn next(self, event: SessionEvent) -> Option<SessionState> {
        use SessionEvent::*;
        use SessionState::*;

        match (self, event) {
            (Closed, Opened) => Some(Open),
            (Open | Flushing, FlushStarted) => Some(Flushing),
            (Open | Flushing, Ended { frames_outstanding }) => Some(if frames_outstanding {
                WaitingForAllFrames
            } else {
                Closed
            }),
            (WaitingForAllFrames, AllFramesReturned) => Some(Closed),
            _ => None,
        }
    }

    /// Whether the hardware instance is available.
    pub fn is_running(self) -> bool {
        matches!(self, SessionState::Open | SessionState::Flushing)
    }
}

/// What a session was opened for. A pack with different parameters needs a new session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionParameters {
    pub codec: CodecType,
    pub geometry: FrameGeometry,
    pub reference_count: u32,
    pub needs_reordering: bool,
}

impl From<&Pack> for SessionParameters {
    fn from(pack: &Pack) -> Self {
        Self {
            codec: pack.codec,
            geometry: pack.geometry,
            reference_count: pack.reference_count,
            needs_reordering: pack.needs_reordering,
        }
    }
}

impl fmt::Display for SessionParameters {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} {}, {} reference frames{}",
            self.codec,
            self.geometry,
            self.reference_count,
            if self.needs_reordering { ", reordering" } else { "" }
        )
    }
}

/// What happened during one or more decode steps.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub flags: OutputFlags,
    pub steps: usize,
    pub decoded: usize,
    pub displayed: usize,
}

impl PassSummary {
    fn add(&mut self, flags: OutputFlags) {
        self.flags |= flags;
        self.steps += 1;
        if flags.contains(OutputFlags::DECODED) {
            self.decoded += 1;
        }
        if flags.contains(OutputFlags::DISPLAY) {
            self.displayed += 1;
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum FeedOutcome {
    /// The chunks did not fit in the bitstream buffer. The session was flushed and the chunks
    /// have to be fed again to a new session.
    NotConsumed,
    Consumed(PassSummary),
}

pub struct DecodingSession<I: VpuInstance> {
    instance: Option<I>,
    state: SessionState,
    parameters: SessionParameters,
    config: DecoderConfig,
    bitstream: DmaBuffer,
    // Work memory the hardware uses for as long as the instance lives.
    _ps_save_buffer: Option<DmaBuffer>,
    slice_buffer: Option<DmaBuffer>,
    mb_prediction_buffer: Option<DmaBuffer>,
    /// Bytes written to the bitstream buffer since opening.
    written: u64,
    monitor: BitstreamMonitor,
    ready: VecDeque<OutputFrame>,
    stats: DecodingStats,
}

impl<I: VpuInstance> DecodingSession<I> {
    /// Opens a session decoding streams with `parameters`, feeding it `initial` chunks so the
    /// hardware can tell how many frame buffers it needs.
    ///
    /// Either returns an open session or fails with the hardware closed again.
    pub fn open<D: VpuDevice<Instance = I>>(
        device: &mut D,
        frames: &mut FrameBuffers,
        buffers: &DecoderBuffers,
        config: &DecoderConfig,
        parameters: SessionParameters,
        initial: &[&VideoChunk],
    ) -> Result<Self> {
        let macroblocks = parameters.geometry.macroblocks();
        if macroblocks > MAX_MACROBLOCKS {
            return Err(DecodeError::MacroblockLimitExceeded(macroblocks));
        }

        let mut stats = DecodingStats::default();
        let mut allocate = |size: usize| -> BackendResult<DmaBuffer> {
            stats.update_dma_allocation_size(size);
            device.allocate(size)
        };

        let bitstream = allocate(buffers.bitstream_size())?;
        let mut ps_save_buffer = None;
        let mut slice_buffer = None;
        let mut mb_prediction_buffer = None;

        let codec = match parameters.codec {
            CodecType::H264 => {
                let ps_save = allocate(PS_SAVE_BUFFER_SIZE)?;
                slice_buffer = Some(allocate(SLICE_BUFFER_SIZE)?);
                ps_save_buffer = Some(ps_save.clone());
                CodecOpenParams::H264 {
                    ps_save_buffer: ps_save,
                }
            }
            CodecType::Vp8 => {
                mb_prediction_buffer = Some(allocate(MB_PREDICTION_BUFFER_SIZE)?);
                CodecOpenParams::Vp8
            }
            CodecType::Jpeg => CodecOpenParams::Jpeg,
            CodecType::None => return Err(DecodeError::UnsupportedStream("no codec")),
        };

        let instance = device.open(&OpenParams {
            codec,
            bitstream_buffer: bitstream.clone(),
            reordering: parameters.needs_reordering,
        })?;

        let mut session = Self {
            instance: Some(instance),
            state: SessionState::Closed,
            parameters,
            config: config.clone(),
            bitstream,
            _ps_save_buffer: ps_save_buffer,
            slice_buffer,
            mb_prediction_buffer,
            written: 0,
            monitor: BitstreamMonitor::new(),
            ready: VecDeque::new(),
            stats,
        };

        match session.start(device, frames, initial) {
            Ok(()) => Ok(session),
            Err(e) => {
                error!("Opening session for {} failed: {}", parameters, e);
                session.close_instance(frames);
                Err(e)
            }
        }
    }

    fn start<D: VpuDevice<Instance = I>>(
        &mut self,
        device: &mut D,
        frames: &mut FrameBuffers,
        initial: &[&VideoChunk],
    ) -> Result<()> {
        if !self.write_chunks(initial)? {
            let needed = initial.iter().map(|chunk| chunk.len()).sum();
            return Err(DecodeError::InputBufferTooSmall {
                needed,
                available: self.bitstream.size(),
            });
        }

        let instance = self.instance.as_mut().ok_or(DecodeError::NotOpen)?;
        let info = instance.initial_info()?;
        if !info.yuv420 {
            return Err(DecodeError::UnsupportedStream("Stream not in YUV420 format"));
        }
        if info.interlaced {
            return Err(DecodeError::UnsupportedStream("Interlaced streams are not supported"));
        }

        let count = info.min_frame_buffer_count + self.config.display_reserve;
        let geometry = self.parameters.geometry;
        let layout = Nv12Layout::for_geometry(&geometry, self.parameters.codec);
        frames.reserve(device, count, geometry, layout)?;
        self.stats.update_dma_allocation_size(layout.size);

        instance.register_frame_buffers(&FrameBufferRegistration {
            frames: &frames.buffers(),
            layout,
            slice_buffer: self.slice_buffer.as_ref(),
            mb_prediction_buffer: self.mb_prediction_buffer.as_ref(),
        })?;

        self.transition(SessionEvent::Opened);
        info!(
            "Opened session for {} with {} frame buffers ({} required)",
            self.parameters, count, info.min_frame_buffer_count
        );

        self.decode(frames)?;
        Ok(())
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn parameters(&self) -> &SessionParameters {
        &self.parameters
    }

    /// Whether `pack` can be decoded by this session.
    pub fn accepts(&self, pack: &Pack) -> bool {
        self.parameters == SessionParameters::from(pack)
    }

    pub fn stats(&self) -> &DecodingStats {
        &self.stats
    }

    /// Next frame ready for display, in display order.
    pub fn pop_ready(&mut self) -> Option<OutputFrame> {
        self.ready.pop_front()
    }

    fn transition(&mut self, event: SessionEvent) {
        match self.state.next(event) {
            Some(state) => {
                debug!("Session {:?} -> {:?} on {:?}", self.state, state, event);
                self.state = state;
            }
            None => {
                debug_assert!(false, "invalid session transition {:?} on {:?}", self.state, event);
                error!("Ignoring invalid session transition {:?} on {:?}", self.state, event);
            }
        }
    }

    /// Closes the hardware instance, if still open.
    fn close_instance(&mut self, frames: &mut FrameBuffers) {
        if let Some(mut instance) = self.instance.take() {
            if let Err(e) = instance.close() {
                error!("Closing hardware instance failed: {}", e);
            }
        }

        frames.drop_pending();
        self.monitor.clear();
    }

    /// Ends the session, drained or not.
    fn end(&mut self, frames: &mut FrameBuffers) {
        if !self.state.is_running() {
            return;
        }

        self.close_instance(frames);
        let frames_outstanding = self.config.wait_for_all_frames && !frames.all_returned();
        self.transition(SessionEvent::Ended { frames_outstanding });
        info!("Session for {} ended, now {:?}", self.parameters, self.state);
    }

    /// Stops decoding right away.
    pub fn close(&mut self, frames: &mut FrameBuffers) {
        self.end(frames);
    }

    /// Writes `chunks` into the bitstream buffer. Returns `false` without writing anything if
    /// they do not fit.
    fn write_chunks(&mut self, chunks: &[&VideoChunk]) -> Result<bool> {
        let instance = self.instance.as_mut().ok_or(DecodeError::NotOpen)?;

        let total: usize = chunks.iter().map(|chunk| chunk.len()).sum();
        let status = instance.bitstream_status()?;
        if total > status.free_size {
            return Ok(false);
        }

        let size = self.bitstream.size();
        let mut offset = status
            .write_address
            .checked_sub(self.bitstream.physical_address())
            .map(|offset| offset as usize)
            .filter(|offset| *offset < size)
            .ok_or_else(|| anyhow!("write address {:#x} outside of the bitstream buffer", status.write_address))?;

        for chunk in chunks.iter().filter(|chunk| !chunk.is_empty()) {
            let data = &chunk.data[..];
            // The buffer is circular.
            let first = data.len().min(size - offset);
            self.bitstream.write(offset, &data[..first])?;
            if first < data.len() {
                self.bitstream.write(0, &data[first..])?;
            }
            instance.update_bitstream(data.len())?;

            self.monitor.record(self.written, chunk.meta.clone());
            self.written += data.len() as u64;
            offset = (offset + data.len()) % size;
        }

        debug!("Wrote {} bytes in {} chunks", total, chunks.len());
        Ok(true)
    }

    /// Runs one decode step of the hardware.
    fn decode_step(&mut self, frames: &mut FrameBuffers) -> Result<OutputFlags> {
        if !frames.has_free_slot() {
            debug_assert!(false, "decode step without a free frame buffer");
            return Ok(OutputFlags::NOT_ENOUGH_OUTPUT);
        }

        let instance = self.instance.as_mut().ok_or(DecodeError::NotOpen)?;

        instance.start_one_frame()?;
        let started = Instant::now();
        let mut finished = false;
        for attempt in 1..=self.config.decode_retries {
            if instance.wait_for_interrupt(self.config.decode_timeout)? {
                finished = true;
                break;
            }
            debug!("Decode not finished after wait {}", attempt);
        }

        self.stats.number_of_decode_operations += 1;
        self.stats
            .update_decode_timing(started.elapsed().as_millis() as u64);

        if !finished {
            error!(
                "Hardware decode timed out after {} waits, resetting",
                self.config.decode_retries
            );
            instance.software_reset()?;
            return Ok(OutputFlags::TIMEOUT);
        }

        let info = instance.output_info()?;
        let flags = OutputFlags::from_info(&info);

        if flags.contains(OutputFlags::DECODED) {
            let status = instance.bitstream_status()?;
            let unread = self.bitstream.size().saturating_sub(status.free_size) as u64;
            let meta = self.monitor.take_consumed(self.written.saturating_sub(unread));
            if meta.is_none() {
                warn!("No timestamp for frame decoded in buffer {}", info.decoded_index);
            }
            frames.set_decoded(info.decoded_index as usize, meta);
        }

        if flags.contains(OutputFlags::DISPLAY) {
            match frames.give_for_display(info.display_index as usize) {
                Some(frame) => {
                    debug!("Frame buffer {} ready for display", frame.index);
                    self.ready.push_back(frame);
                }
                None => warn!(
                    "Hardware displayed frame buffer {} which is not available",
                    info.display_index
                ),
            }
        }

        Ok(flags)
    }

    /// Checks the flags of a decode step for conditions that end the session.
    fn check_step(&mut self, frames: &mut FrameBuffers, flags: OutputFlags) -> Result<()> {
        let error = if flags.contains(OutputFlags::TIMEOUT) {
            DecodeError::Timeout
        } else if flags.contains(OutputFlags::SYNTAX_ERROR) {
            DecodeError::SyntaxError
        } else if flags.contains(OutputFlags::PARAMS_CHANGED) {
            // Packs with new parameters always get a new session.
            DecodeError::ParamsChanged
        } else {
            return Ok(());
        };

        error!("Decoding failed: {}", error);
        self.end(frames);
        Err(error)
    }

    /// Decodes as much as possible of what was fed, until the hardware runs out of input or
    /// frame buffers.
    pub fn decode(&mut self, frames: &mut FrameBuffers) -> Result<PassSummary> {
        if !self.state.is_running() {
            return Err(DecodeError::NotOpen);
        }

        let mut summary = PassSummary::default();

        for _ in 0..self.config.max_decode_iterations {
            if !frames.has_free_slot() {
                summary.flags |= OutputFlags::NOT_ENOUGH_OUTPUT;
                return Ok(summary);
            }

            let flags = match self.decode_step(frames) {
                Ok(flags) => flags,
                Err(e) => {
                    self.end(frames);
                    return Err(e);
                }
            };
            summary.add(flags);
            self.check_step(frames, flags)?;

            if flags.intersects(
                OutputFlags::NOT_ENOUGH_INPUT | OutputFlags::NOT_ENOUGH_OUTPUT | OutputFlags::EOS,
            ) {
                return Ok(summary);
            }
        }

        debug_assert!(false, "decode pass did not terminate");
        warn!(
            "Decode pass stopped after {} steps",
            self.config.max_decode_iterations
        );
        Ok(summary)
    }

    /// Writes `chunks` and decodes them.
    pub fn feed(&mut self, frames: &mut FrameBuffers, chunks: &[&VideoChunk]) -> Result<FeedOutcome> {
        if self.state != SessionState::Open {
            return Err(DecodeError::NotOpen);
        }

        match self.write_chunks(chunks) {
            Ok(true) => (),
            Ok(false) => {
                info!("Not enough room in the bitstream buffer, flushing the session");
                self.flush(frames)?;
                return Ok(FeedOutcome::NotConsumed);
            }
            Err(e) => {
                self.end(frames);
                return Err(e);
            }
        }

        Ok(FeedOutcome::Consumed(self.decode(frames)?))
    }

    fn signal_end_of_input(&mut self, frames: &mut FrameBuffers) -> Result<()> {
        if self.state != SessionState::Open {
            return Ok(());
        }

        let instance = self.instance.as_mut().ok_or(DecodeError::NotOpen)?;
        if let Err(e) = instance.update_bitstream(0) {
            self.end(frames);
            return Err(e.into());
        }

        self.transition(SessionEvent::FlushStarted);
        Ok(())
    }

    /// Drains the hardware and ends the session once it reports the end of the stream.
    ///
    /// When frame buffers run out first, the session stays in [`SessionState::Flushing`] and
    /// ends from `on_frame_returned` once the consumer gives enough of them back.
    pub fn flush(&mut self, frames: &mut FrameBuffers) -> Result<PassSummary> {
        if !self.state.is_running() {
            return Err(DecodeError::NotOpen);
        }

        self.signal_end_of_input(frames)?;
        let summary = self.decode(frames)?;
        if summary
            .flags
            .intersects(OutputFlags::EOS | OutputFlags::NOT_ENOUGH_INPUT)
        {
            self.end(frames);
        } else {
            debug!("Flush waiting for frame buffers ({:?})", summary.flags);
        }

        Ok(summary)
    }

    /// Runs one step of draining. Returns `true` once the session is drained and ended.
    pub fn flush_step(&mut self, frames: &mut FrameBuffers) -> Result<bool> {
        self.signal_end_of_input(frames)?;
        if self.state != SessionState::Flushing {
            return Ok(true);
        }

        if !frames.has_free_slot() {
            debug!("Waiting for a frame buffer to continue flushing");
            return Ok(false);
        }

        let flags = match self.decode_step(frames) {
            Ok(flags) => flags,
            Err(e) => {
                self.end(frames);
                return Err(e);
            }
        };
        self.check_step(frames, flags)?;

        if flags.intersects(OutputFlags::EOS | OutputFlags::NOT_ENOUGH_INPUT) {
            self.end(frames);
            return Ok(true);
        }

        Ok(false)
    }

    /// Takes back a frame given out for display. Returns whether the frame belonged to this
    /// session and was still given out.
    pub fn on_frame_returned(
        &mut self,
        frames: &mut FrameBuffers,
        physical_address: u64,
    ) -> Result<bool> {
        let Some(index) = frames.mark_returned(physical_address) else {
            debug!("Ignoring return of unknown frame at {:#x}", physical_address);
            return Ok(false);
        };

        match self.state {
            SessionState::Open | SessionState::Flushing => {
                let instance = self.instance.as_mut().ok_or(DecodeError::NotOpen)?;
                if let Err(e) = instance.clear_display_flag(index) {
                    self.end(frames);
                    return Err(e.into());
                }

                // A picture may have been waiting for this buffer.
                let summary = self.decode(frames)?;
                if self.state == SessionState::Flushing
                    && summary
                        .flags
                        .intersects(OutputFlags::EOS | OutputFlags::NOT_ENOUGH_INPUT)
                {
                    self.end(frames);
                }
            }
            SessionState::WaitingForAllFrames => {
                if frames.all_returned() {
                    self.transition(SessionEvent::AllFramesReturned);
                }
            }
            SessionState::Closed => (),
        }

        Ok(true)
    }
}

impl<I: VpuInstance> Drop for DecodingSession<I> {
    fn drop(&mut self) {
        if let Some(mut instance) = self.instance.take() {
            if let Err(e) = instance.close() {
                error!("Closing hardware instance failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::backend::dummy::Command;
    use crate::backend::dummy::DummyConfig;
    use crate::backend::dummy::DummyHardware;
    use crate::backend::dummy::DummyInstance;
    use crate::pack::ChunkKind;
    use crate::FrameMetadata;

    fn parameters() -> SessionParameters {
        SessionParameters {
            codec: CodecType::Vp8,
            geometry: FrameGeometry::from_true(64, 64),
            reference_count: 4,
            needs_reordering: false,
        }
    }

    fn frame(timestamp: i64, len: usize) -> VideoChunk {
        VideoChunk::new(Bytes::from(vec![0x5a; len]), ChunkKind::Frame)
            .with_meta(FrameMetadata::new(timestamp))
    }

    fn open(
        hw: &mut DummyHardware,
        frames: &mut FrameBuffers,
        buffers: &DecoderBuffers,
        config: &DecoderConfig,
    ) -> DecodingSession<DummyInstance> {
        let first = frame(0, 100);
        DecodingSession::open(hw, frames, buffers, config, parameters(), &[&first]).unwrap()
    }

    #[test]
    fn transitions() {
        use SessionEvent::*;
        use SessionState::*;

        assert_eq!(Closed.next(Opened), Some(Open));
        assert_eq!(Open.next(FlushStarted), Some(Flushing));
        assert_eq!(Flushing.next(FlushStarted), Some(Flushing));
        assert_eq!(Open.next(Ended { frames_outstanding: false }), Some(Closed));
        assert_eq!(
            Flushing.next(Ended { frames_outstanding: true }),
            Some(WaitingForAllFrames)
        );
        assert_eq!(WaitingForAllFrames.next(AllFramesReturned), Some(Closed));

        assert_eq!(Closed.next(FlushStarted), None);
        assert_eq!(Open.next(Opened), None);
        assert_eq!(WaitingForAllFrames.next(Opened), None);
        assert_eq!(Closed.next(Ended { frames_outstanding: false }), None);
    }

    #[test]
    fn open_decodes_initial_chunks() {
        let mut hw = DummyHardware::default();
        let mut frames = FrameBuffers::new();
        let config = DecoderConfig::default();
        let mut session = open(&mut hw, &mut frames, &Default::default(), &config);

        assert_eq!(session.state(), SessionState::Open);
        assert_eq!(frames.len(), 2 + config.display_reserve);
        assert!(hw.commands().contains(&Command::RegisterFrameBuffers(4)));

        let output = session.pop_ready().unwrap();
        assert_eq!(output.timestamp(), Some(0));
        assert_eq!(output.geometry, FrameGeometry::from_true(64, 64));
        assert!(session.pop_ready().is_none());
    }

    #[test]
    fn open_rejects_large_pictures() {
        let mut hw = DummyHardware::default();
        let mut frames = FrameBuffers::new();
        let first = frame(0, 100);
        let parameters = SessionParameters {
            geometry: FrameGeometry::from_true(1920, 1200),
            ..parameters()
        };

        let result = DecodingSession::<DummyInstance>::open(
            &mut hw,
            &mut frames,
            &Default::default(),
            &Default::default(),
            parameters,
            &[&first],
        );
        assert!(matches!(result, Err(DecodeError::MacroblockLimitExceeded(9000))));
        assert!(hw.commands().is_empty());
    }

    #[test]
    fn failed_open_closes_hardware() {
        let mut hw = DummyHardware::new(DummyConfig {
            initial_info: crate::backend::InitialInfo {
                interlaced: true,
                ..DummyConfig::default().initial_info
            },
            ..Default::default()
        });
        let mut frames = FrameBuffers::new();
        let first = frame(0, 100);

        let result = DecodingSession::<DummyInstance>::open(
            &mut hw,
            &mut frames,
            &Default::default(),
            &Default::default(),
            parameters(),
            &[&first],
        );
        assert!(matches!(result, Err(DecodeError::UnsupportedStream(_))));
        assert_eq!(hw.commands().last(), Some(&Command::Close));
        assert_eq!(hw.count(&Command::StartOneFrame), 0);
    }

    #[test]
    fn feed_requires_open_session() {
        let mut hw = DummyHardware::default();
        let mut frames = FrameBuffers::new();
        let mut session = open(&mut hw, &mut frames, &Default::default(), &Default::default());

        session.flush(&mut frames).unwrap();
        assert_eq!(session.state(), SessionState::Closed);

        let next = frame(1, 10);
        assert!(matches!(
            session.feed(&mut frames, &[&next]),
            Err(DecodeError::NotOpen)
        ));
    }

    #[test]
    fn feed_and_decode() {
        let mut hw = DummyHardware::default();
        let mut frames = FrameBuffers::new();
        let mut session = open(&mut hw, &mut frames, &Default::default(), &Default::default());
        session.pop_ready();

        let next = frame(33, 200);
        let outcome = session.feed(&mut frames, &[&next]).unwrap();
        let FeedOutcome::Consumed(summary) = outcome else {
            panic!("frame not consumed");
        };
        assert_eq!(summary.decoded, 1);
        assert_eq!(summary.displayed, 1);
        assert!(summary.flags.contains(OutputFlags::NOT_ENOUGH_INPUT));
        assert_eq!(session.pop_ready().unwrap().timestamp(), Some(33));
    }

    #[test]
    fn oversized_feed_is_not_consumed() {
        let mut hw = DummyHardware::default();
        let mut frames = FrameBuffers::new();
        let buffers = DecoderBuffers::new(1024);
        let mut session = open(&mut hw, &mut frames, &buffers, &Default::default());
        let first_output = session.pop_ready().unwrap();

        let written_before = session.written;
        let mut before = vec![0; 1024];
        session.bitstream.read(0, &mut before).unwrap();
        hw.clear_commands();

        let large = frame(1, 2000);
        let outcome = session.feed(&mut frames, &[&large]).unwrap();

        assert_eq!(outcome, FeedOutcome::NotConsumed);
        let mut after = vec![0; 1024];
        session.bitstream.read(0, &mut after).unwrap();
        assert_eq!(before, after);
        assert_eq!(session.written, written_before);

        // The session was flushed: end of input signalled, then closed.
        let commands = hw.commands();
        assert_eq!(commands.first(), Some(&Command::UpdateBitstream(0)));
        assert_eq!(commands.last(), Some(&Command::Close));
        assert_eq!(session.state(), SessionState::Closed);
        drop(first_output);
    }

    #[test]
    fn returning_a_frame_twice() {
        let mut hw = DummyHardware::default();
        let mut frames = FrameBuffers::new();
        let mut session = open(&mut hw, &mut frames, &Default::default(), &Default::default());
        let output = session.pop_ready().unwrap();

        assert!(session
            .on_frame_returned(&mut frames, output.physical_address())
            .unwrap());
        assert!(!session
            .on_frame_returned(&mut frames, output.physical_address())
            .unwrap());

        assert_eq!(hw.count(&Command::ClearDisplayFlag(output.index)), 1);
    }

    #[test]
    fn waits_for_frames_before_closing() {
        let mut hw = DummyHardware::default();
        let mut frames = FrameBuffers::new();
        let config = DecoderConfig {
            wait_for_all_frames: true,
            ..Default::default()
        };
        let mut session = open(&mut hw, &mut frames, &Default::default(), &config);
        let output = session.pop_ready().unwrap();

        session.flush(&mut frames).unwrap();
        assert_eq!(session.state(), SessionState::WaitingForAllFrames);
        assert_eq!(hw.count(&Command::Close), 1);

        session
            .on_frame_returned(&mut frames, output.physical_address())
            .unwrap();
        assert_eq!(session.state(), SessionState::Closed);
        // The hardware is gone already.
        assert_eq!(hw.count(&Command::ClearDisplayFlag(output.index)), 0);
    }

    #[test]
    fn out_of_frame_buffers() {
        let mut hw = DummyHardware::default();
        let mut frames = FrameBuffers::new();
        let config = DecoderConfig {
            display_reserve: 0,
            ..Default::default()
        };
        let mut session = open(&mut hw, &mut frames, &Default::default(), &config);
        let first = session.pop_ready().unwrap();

        let second = frame(1, 10);
        session.feed(&mut frames, &[&second]).unwrap();
        let second_output = session.pop_ready().unwrap();

        // Both frame buffers are held: the hardware is not asked to decode.
        hw.clear_commands();
        let third = frame(2, 10);
        let FeedOutcome::Consumed(summary) = session.feed(&mut frames, &[&third]).unwrap() else {
            panic!("frame not consumed");
        };
        assert_eq!(summary.steps, 0);
        assert!(summary.flags.contains(OutputFlags::NOT_ENOUGH_OUTPUT));
        assert_eq!(hw.count(&Command::StartOneFrame), 0);

        // Returning one lets the pending picture through.
        session
            .on_frame_returned(&mut frames, first.physical_address())
            .unwrap();
        assert_eq!(session.pop_ready().unwrap().timestamp(), Some(2));
        drop(second_output);
    }

    #[test]
    fn flush_waits_for_frame_buffers() {
        let mut hw = DummyHardware::default();
        let mut frames = FrameBuffers::new();
        let config = DecoderConfig {
            display_reserve: 0,
            ..Default::default()
        };
        let mut session = open(&mut hw, &mut frames, &Default::default(), &config);
        let first = session.pop_ready().unwrap();

        let second = frame(1, 10);
        session.feed(&mut frames, &[&second]).unwrap();
        let second_output = session.pop_ready().unwrap();
        let third = frame(2, 10);
        session.feed(&mut frames, &[&third]).unwrap();

        // The third picture is still in the bitstream buffer.
        let summary = session.flush(&mut frames).unwrap();
        assert!(summary.flags.contains(OutputFlags::NOT_ENOUGH_OUTPUT));
        assert_eq!(session.state(), SessionState::Flushing);
        assert_eq!(hw.count(&Command::Close), 0);

        session
            .on_frame_returned(&mut frames, first.physical_address())
            .unwrap();
        assert_eq!(session.pop_ready().unwrap().timestamp(), Some(2));
        assert_eq!(session.state(), SessionState::Flushing);

        session
            .on_frame_returned(&mut frames, second_output.physical_address())
            .unwrap();
        assert!(session.pop_ready().is_none());
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(hw.count(&Command::Close), 1);
    }

    #[test]
    fn timeout_resets_hardware() {
        let mut hw = DummyHardware::default();
        let mut frames = FrameBuffers::new();
        let mut session = open(&mut hw, &mut frames, &Default::default(), &Default::default());
        session.pop_ready();

        hw.update_config(|config| config.stalled_steps = 1);
        let next = frame(1, 10);
        let result = session.feed(&mut frames, &[&next]);

        assert!(matches!(result, Err(DecodeError::Timeout)));
        assert_eq!(hw.count(&Command::SoftwareReset), 1);
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn syntax_error_ends_session() {
        let mut hw = DummyHardware::default();
        let mut frames = FrameBuffers::new();
        let mut session = open(&mut hw, &mut frames, &Default::default(), &Default::default());

        hw.update_config(|config| config.corrupted_steps = 1);
        let next = frame(1, 10);
        assert!(matches!(
            session.feed(&mut frames, &[&next]),
            Err(DecodeError::SyntaxError)
        ));
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn flush_step_drains_reordered_frames() {
        let mut hw = DummyHardware::new(DummyConfig {
            display_delay: 1,
            ..Default::default()
        });
        let mut frames = FrameBuffers::new();
        let mut session = open(&mut hw, &mut frames, &Default::default(), &Default::default());
        assert!(session.pop_ready().is_none());

        let next = frame(1, 10);
        session.feed(&mut frames, &[&next]).unwrap();
        assert_eq!(session.pop_ready().unwrap().timestamp(), Some(0));

        assert!(!session.flush_step(&mut frames).unwrap());
        assert_eq!(session.state(), SessionState::Flushing);
        assert_eq!(session.pop_ready().unwrap().timestamp(), Some(1));

        assert!(session.flush_step(&mut frames).unwrap());
        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.pop_ready().is_none());
    }
}
