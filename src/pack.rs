// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Packs: the bitstream of one picture, as chunks ready to be fed to the hardware, along with
//! the decisions the decoder needs to take about it.

use std::collections::VecDeque;
use std::fmt;

use bytes::Bytes;
use log::debug;

use crate::CodecType;
use crate::FrameGeometry;
use crate::FrameMetadata;
use crate::Timestamp;

/// Called once the bytes of an input buffer are not needed anymore.
pub type ReleaseCallback = Box<dyn FnOnce()>;

/// An input buffer, as handed to a stream assembler.
pub struct VideoBuffer {
    pub data: Bytes,
    pub meta: FrameMetadata,
    pub release: Option<ReleaseCallback>,
}

impl VideoBuffer {
    pub fn new(data: impl Into<Bytes>, timestamp: Timestamp) -> Self {
        Self {
            data: data.into(),
            meta: FrameMetadata::new(timestamp),
            release: None,
        }
    }

    pub fn with_meta(mut self, meta: FrameMetadata) -> Self {
        self.meta = meta;
        self
    }

    pub fn with_release(mut self, release: impl FnOnce() + 'static) -> Self {
        self.release = Some(Box::new(release));
        self
    }
}

impl fmt::Debug for VideoBuffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("VideoBuffer")
            .field("size", &self.data.len())
            .field("meta", &self.meta)
            .field("release", &self.release.is_some())
            .finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChunkKind {
    Sps,
    Pps,
    /// First unit of a picture. Carries the picture's metadata.
    Slice,
    /// Additional slice data of a picture already started.
    Continuation,
    /// Synthetic IVF sequence header.
    SequenceHeader,
    /// A whole VP8 or JPEG frame.
    Frame,
}

/// A contiguous run of bytes to feed to the hardware.
///
/// Dropping the chunk fires its release callback, if any.
pub struct VideoChunk {
    pub data: Bytes,
    pub kind: ChunkKind,
    /// Metadata of the picture, on chunks that start one.
    pub meta: Option<FrameMetadata>,
    release: Option<ReleaseCallback>,
}

impl VideoChunk {
    pub fn new(data: Bytes, kind: ChunkKind) -> Self {
        Self {
            data,
            kind,
            meta: None,
            release: None,
        }
    }

    pub fn with_meta(mut self, meta: FrameMetadata) -> Self {
        self.meta = Some(meta);
        self
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn has_release(&self) -> bool {
        self.release.is_some()
    }
}

impl Drop for VideoChunk {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for VideoChunk {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}[{}]", self.kind, self.data.len())
    }
}

/// The bitstream of one picture.
#[derive(Debug)]
pub struct Pack {
    pub codec: CodecType,
    pub geometry: FrameGeometry,
    /// Reference frames the hardware needs to keep around for this stream.
    pub reference_count: u32,
    /// The hardware can start decoding from this pack, without any earlier state.
    pub can_reopen_decoding: bool,
    /// No other picture refers to this one.
    pub can_be_dropped: bool,
    pub needs_reordering: bool,
    /// The stream ends after this pack and the hardware has to be drained.
    pub needs_flushing: bool,
    /// The stream lost synchronization before this pack.
    pub discontinuity: bool,
    /// No more chunks will be added.
    pub is_complete: bool,
    /// Set once the picture went through the hardware.
    pub decoded: bool,
    /// Combined metadata of the chunks.
    pub meta: Option<FrameMetadata>,
    chunks: Vec<VideoChunk>,
    /// Number of leading chunks already given to the hardware.
    fed: usize,
}

impl Pack {
    pub fn new(codec: CodecType, geometry: FrameGeometry, reference_count: u32) -> Self {
        Self {
            codec,
            geometry,
            reference_count,
            can_reopen_decoding: false,
            can_be_dropped: false,
            needs_reordering: false,
            needs_flushing: false,
            discontinuity: false,
            is_complete: false,
            decoded: false,
            meta: None,
            chunks: Vec::new(),
            fed: 0,
        }
    }

    pub fn push_chunk(&mut self, chunk: VideoChunk) {
        if let Some(chunk_meta) = &chunk.meta {
            match &mut self.meta {
                Some(meta) => meta.merge(chunk_meta),
                None => self.meta = Some(chunk_meta.clone()),
            }
        }

        self.chunks.push(chunk);
    }

    pub fn chunks(&self) -> &[VideoChunk] {
        &self.chunks
    }

    /// Chunks not given to the hardware yet.
    pub fn unfed_chunks(&self) -> &[VideoChunk] {
        &self.chunks[self.fed..]
    }

    pub fn has_unfed_chunks(&self) -> bool {
        self.fed < self.chunks.len()
    }

    /// Marks every current chunk as given to the hardware.
    pub fn mark_fed(&mut self) {
        self.fed = self.chunks.len();
    }

    /// Marks the first `count` chunks as given to the hardware.
    pub fn mark_fed_up_to(&mut self, count: usize) {
        self.fed = self.fed.max(count.min(self.chunks.len()));
    }

    /// Whether no chunk was given to the hardware yet.
    pub fn is_untouched(&self) -> bool {
        self.fed == 0
    }

    /// Makes the whole pack available for feeding again, for a new hardware session.
    pub fn rewind(&mut self) {
        self.fed = 0;
        self.decoded = false;
    }

    pub fn total_size(&self) -> usize {
        self.chunks.iter().map(VideoChunk::len).sum()
    }

    pub fn timestamp(&self) -> Option<Timestamp> {
        self.meta.as_ref().map(|meta| meta.timestamp)
    }
}

/// What a pack is looked for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PackPurpose {
    /// The whole pack is needed: it must be complete.
    Consumption,
    /// Chunks are fed as soon as they are available, for low latency.
    Feeding,
}

/// FIFO of packs between a stream assembler and the decoder.
#[derive(Debug, Default)]
pub struct PackQueue {
    packs: VecDeque<Pack>,
    popped: u64,
}

impl PackQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.packs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Pack> {
        self.packs.iter()
    }

    pub fn front(&self) -> Option<&Pack> {
        self.packs.front()
    }

    pub fn front_mut(&mut self) -> Option<&mut Pack> {
        self.packs.front_mut()
    }

    pub fn back(&self) -> Option<&Pack> {
        self.packs.back()
    }

    pub fn back_mut(&mut self) -> Option<&mut Pack> {
        self.packs.back_mut()
    }

    /// Whether the front pack can be used for `purpose`.
    pub fn has_pack_for(&self, purpose: PackPurpose) -> bool {
        match (self.packs.front(), purpose) {
            (None, _) => false,
            (Some(pack), PackPurpose::Consumption) => pack.is_complete,
            (Some(pack), PackPurpose::Feeding) => pack.is_complete || pack.has_unfed_chunks(),
        }
    }

    /// Appends `pack`, completing the previous last pack.
    pub fn push_new_pack(&mut self, pack: Pack) -> &mut Pack {
        self.complete_back();
        self.packs.push_back(pack);
        let index = self.packs.len() - 1;
        &mut self.packs[index]
    }

    pub fn complete_back(&mut self) {
        if let Some(pack) = self.packs.back_mut() {
            pack.is_complete = true;
        }
    }

    /// Attaches the release callback of an input buffer to the last chunk in the queue, so it
    /// fires once that chunk is gone. Fires it right away if no chunk can carry it.
    pub fn attach_release(&mut self, release: Option<ReleaseCallback>) {
        let Some(release) = release else {
            return;
        };

        match self.packs.back_mut().and_then(|pack| pack.chunks.last_mut()) {
            Some(chunk) if chunk.release.is_none() => chunk.release = Some(release),
            _ => release(),
        }
    }

    pub fn pop_front(&mut self) -> Option<Pack> {
        let pack = self.packs.pop_front()?;
        self.popped += 1;
        Some(pack)
    }

    /// Number of packs removed from the queue so far.
    pub fn packs_popped(&self) -> u64 {
        self.popped
    }

    /// Removes the complete droppable packs at the front of the queue, to catch up when decoding
    /// falls behind. Returns how many were dropped.
    pub fn drop_droppable(&mut self) -> usize {
        let mut dropped = 0;

        while self
            .packs
            .front()
            .is_some_and(|pack| pack.is_complete && pack.can_be_dropped && pack.is_untouched())
        {
            self.pop_front();
            dropped += 1;
        }

        if dropped > 0 {
            debug!("Dropped {} droppable packs", dropped);
        }

        dropped
    }

    /// Removes packs until the front one can reopen decoding. Only packs usable for `purpose`
    /// are removed. Returns whether such a pack is now at the front.
    pub fn skip_to_reopen_point(&mut self, purpose: PackPurpose) -> bool {
        loop {
            if !self.has_pack_for(purpose) {
                return false;
            }

            match self.packs.front() {
                Some(pack) if pack.can_reopen_decoding => return true,
                Some(pack) => {
                    debug!("Skipping pack of {} bytes, waiting for a reopen point", pack.total_size());
                    self.pop_front();
                }
                None => return false,
            }
        }
    }

    pub fn clear(&mut self) {
        self.packs.clear();
    }
}
