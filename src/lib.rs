// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Stream assembly and session management for fixed-function VPU decoders.
//!
//! Raw H.264 Annex-B, VP8 or JPEG buffers go through a [`assembler::StreamAssembler`], which
//! turns them into [`pack::Pack`]s, one per picture. A [`decoder::VpuDecoder`] then feeds those
//! packs to the hardware through a [`backend::VpuDevice`] and hands out decoded frames.

pub mod assembler;
pub mod backend;
pub mod bitstream_utils;
pub mod codec;
pub mod decoder;
pub mod pack;
pub mod utils;

use std::any::Any;
use std::fmt;
use std::rc::Rc;
use std::str::FromStr;
use std::time::Duration;

/// Presentation timestamp, in whatever unit the caller uses.
pub type Timestamp = i64;

/// Size of a macroblock, in luma samples.
pub const MACROBLOCK_SIZE: u32 = 16;

/// Dimensions of a coded picture and the visible window inside it.
///
/// The padded size is what the hardware decodes into. The true size and crop offsets describe
/// the part that should be displayed.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FrameGeometry {
    pub padded_width: u32,
    pub padded_height: u32,
    pub true_width: u32,
    pub true_height: u32,
    pub crop_left: u32,
    pub crop_top: u32,
}

impl FrameGeometry {
    pub fn new(
        padded_width: u32,
        padded_height: u32,
        true_width: u32,
        true_height: u32,
        crop_left: u32,
        crop_top: u32,
    ) -> Self {
        Self {
            padded_width,
            padded_height,
            true_width,
            true_height,
            crop_left,
            crop_top,
        }
    }

    /// Geometry of a picture whose visible size is `width`x`height`, padded up to whole
    /// macroblocks on the right and bottom.
    pub fn from_true(width: u32, height: u32) -> Self {
        let pad = |v: u32| v.div_ceil(MACROBLOCK_SIZE) * MACROBLOCK_SIZE;

        Self {
            padded_width: pad(width),
            padded_height: pad(height),
            true_width: width,
            true_height: height,
            crop_left: 0,
            crop_top: 0,
        }
    }

    /// Number of macroblocks in the padded picture, saturating at `u32::MAX`.
    pub fn macroblocks(&self) -> u32 {
        (self.padded_width / MACROBLOCK_SIZE).saturating_mul(self.padded_height / MACROBLOCK_SIZE)
    }

    pub fn is_empty(&self) -> bool {
        self.padded_width == 0 || self.padded_height == 0
    }
}

impl fmt::Display for FrameGeometry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}x{} (padded {}x{}, crop +{}+{})",
            self.true_width,
            self.true_height,
            self.padded_width,
            self.padded_height,
            self.crop_left,
            self.crop_top
        )
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum CodecType {
    #[default]
    None,
    H264,
    Vp8,
    Jpeg,
}

impl FromStr for CodecType {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "h264" | "H264" => Ok(CodecType::H264),
            "vp8" | "VP8" => Ok(CodecType::Vp8),
            "jpeg" | "JPEG" | "mjpeg" => Ok(CodecType::Jpeg),
            _ => Err("unrecognized codec. Valid values: h264, vp8, jpeg"),
        }
    }
}

impl fmt::Display for CodecType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            CodecType::None => "none",
            CodecType::H264 => "h264",
            CodecType::Vp8 => "vp8",
            CodecType::Jpeg => "jpeg",
        };
        f.write_str(name)
    }
}

/// Caller data travelling with a picture from input buffer to output frame.
#[derive(Clone, Debug, Default)]
pub struct FrameMetadata {
    pub timestamp: Timestamp,
    /// Opaque caller object, handed back untouched with the decoded frame.
    pub user: Option<Rc<dyn Any>>,
}

impl FrameMetadata {
    pub fn new(timestamp: Timestamp) -> Self {
        Self {
            timestamp,
            user: None,
        }
    }

    /// Combines the metadata of two buffers that ended up in the same picture. The latest
    /// timestamp wins, and the first opaque object is kept.
    pub fn merge(&mut self, other: &FrameMetadata) {
        self.timestamp = self.timestamp.max(other.timestamp);
        if self.user.is_none() {
            self.user = other.user.clone();
        }
    }
}

/// Counters collected while decoding. Durations are in milliseconds.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DecodingStats {
    pub total_decoding_time: u64,
    pub number_of_decode_operations: u64,
    /// Decodes that reported missing input for a pack that may not have been complete.
    pub number_of_rolled_back_decodes: u64,
    /// Packs skipped without decoding to catch up with the input.
    pub number_of_dropped_packs: u64,
    pub max_decode_duration: u64,
    pub max_dma_allocation_size: usize,
}

impl DecodingStats {
    pub fn update_decode_timing(&mut self, duration_ms: u64) {
        self.total_decoding_time += duration_ms;
        self.max_decode_duration = self.max_decode_duration.max(duration_ms);
    }

    pub fn update_dma_allocation_size(&mut self, size: usize) {
        self.max_dma_allocation_size = self.max_dma_allocation_size.max(size);
    }

    /// Adds the counters of `other`, collected by another decoding session.
    pub fn merge(&mut self, other: &DecodingStats) {
        self.total_decoding_time += other.total_decoding_time;
        self.number_of_decode_operations += other.number_of_decode_operations;
        self.number_of_rolled_back_decodes += other.number_of_rolled_back_decodes;
        self.number_of_dropped_packs += other.number_of_dropped_packs;
        self.max_decode_duration = self.max_decode_duration.max(other.max_decode_duration);
        self.max_dma_allocation_size = self.max_dma_allocation_size.max(other.max_dma_allocation_size);
    }

    /// Average duration of one decode operation, if any happened.
    pub fn average_decode_time(&self) -> Option<u64> {
        self.total_decoding_time
            .checked_div(self.number_of_decode_operations)
    }
}

/// Tunables of the decoder.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecoderConfig {
    /// Frame buffers allocated on top of the minimum the hardware asks for. These are the frames
    /// that can be held by the display side at once. The value is empirical and may need to be
    /// re-validated on new hardware revisions.
    pub display_reserve: usize,
    /// When a session ends, keep it around until every output frame has been returned.
    pub wait_for_all_frames: bool,
    /// Never request reordering, even if the stream signals more than one reference frame.
    pub disable_reordering: bool,
    /// Single wait for the decode-complete interrupt.
    pub decode_timeout: Duration,
    /// Waits attempted before a decode step is declared timed out.
    pub decode_retries: u32,
    /// Upper bound on decode steps in one pass.
    pub max_decode_iterations: usize,
    /// Once more packs than this are queued, droppable packs at the front of the queue are
    /// skipped so decoding catches up. `None` never drops anything.
    pub max_queued_packs: Option<usize>,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            display_reserve: 2,
            wait_for_all_frames: false,
            disable_reordering: false,
            decode_timeout: Duration::from_millis(500),
            decode_retries: 4,
            max_decode_iterations: 64,
            max_queued_packs: None,
        }
    }
}

/// Placement of the planes of an NV12 frame buffer, relative to its start.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Nv12Layout {
    pub stride: u32,
    pub y_offset: usize,
    pub cb_offset: usize,
    pub cr_offset: usize,
    /// Co-located motion vectors, only used by H.264.
    pub mv_col_offset: usize,
    /// Bytes needed for the whole buffer.
    pub size: usize,
}

impl Nv12Layout {
    /// Layout of a `width`x`height` frame buffer decoding `codec`. Dimensions are the padded ones.
    pub fn new(width: u32, height: u32, codec: CodecType) -> Self {
        let y_size = width as usize * height as usize;
        let cbcr_size = y_size / 2;
        let mv_col_size = match codec {
            CodecType::H264 => y_size / 4,
            _ => 0,
        };

        Self {
            stride: width,
            y_offset: 0,
            // Interleaved chroma, so both planes start at the same place.
            cb_offset: y_size,
            cr_offset: y_size,
            mv_col_offset: y_size + cbcr_size,
            size: y_size + cbcr_size + mv_col_size,
        }
    }

    pub fn for_geometry(geometry: &FrameGeometry, codec: CodecType) -> Self {
        Self::new(geometry.padded_width, geometry.padded_height, codec)
    }
}

/// Copies the visible part of the NV12 picture in `src` into `dst`, removing padding and crop.
pub fn nv12_copy(src: &[u8], mut dst: &mut [u8], geometry: &FrameGeometry, layout: &Nv12Layout) {
    let width = geometry.true_width as usize;
    let height = geometry.true_height as usize;
    let stride = layout.stride as usize;
    let left = geometry.crop_left as usize;
    let top = geometry.crop_top as usize;

    let mut src_y = &src[layout.y_offset + top * stride + left..];

    // Copy luma
    for _ in 0..height {
        dst[..width].copy_from_slice(&src_y[..width]);
        dst = &mut dst[width..];
        src_y = &src_y[stride.min(src_y.len())..];
    }

    // Align width and height to 2 for UV plane.
    let width = if width % 2 == 1 { width + 1 } else { width };
    let height = if height % 2 == 1 { height + 1 } else { height };

    let mut src_uv = &src[layout.cb_offset + (top / 2) * stride + (left & !1)..];

    // Copy chroma
    for _ in 0..height / 2 {
        dst[..width].copy_from_slice(&src_uv[..width]);
        dst = &mut dst[width..];
        src_uv = &src_uv[stride.min(src_uv.len())..];
    }
}

/// Returns the size of the visible NV12 picture of `geometry`, without any padding. This is the
/// minimum size of the destination buffer passed to `nv12_copy`.
pub fn visible_nv12_size(geometry: &FrameGeometry) -> usize {
    let width = geometry.true_width as usize;
    let height = geometry.true_height as usize;
    // UV plane needs to be aligned to 2.
    let uv_size = width.div_ceil(2) * height.div_ceil(2) * 2;

    width * height + uv_size
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry_from_true_pads_to_macroblocks() {
        let geometry = FrameGeometry::from_true(1920, 1080);
        assert_eq!(geometry.padded_width, 1920);
        assert_eq!(geometry.padded_height, 1088);
        assert_eq!(geometry.true_height, 1080);
        assert_eq!(geometry.macroblocks(), 120 * 68);

        let geometry = FrameGeometry::from_true(64, 64);
        assert_eq!(geometry.padded_width, 64);
        assert_eq!(geometry.padded_height, 64);

        let geometry = FrameGeometry::new(1 << 26, 1 << 26, 1 << 26, 1 << 26, 0, 0);
        assert_eq!(geometry.macroblocks(), u32::MAX);
    }

    #[test]
    fn geometry_inequality_covers_crop() {
        let a = FrameGeometry::new(64, 64, 62, 64, 0, 0);
        let b = FrameGeometry::new(64, 64, 62, 64, 2, 0);
        assert_ne!(a, b);
        assert_eq!(a, a);
    }

    #[test]
    fn metadata_merge_keeps_latest_timestamp() {
        let mut meta = FrameMetadata::new(40);
        meta.merge(&FrameMetadata::new(33));
        assert_eq!(meta.timestamp, 40);

        let other = FrameMetadata {
            timestamp: 80,
            user: Some(Rc::new(7u32)),
        };
        meta.merge(&other);
        assert_eq!(meta.timestamp, 80);
        assert_eq!(meta.user.unwrap().downcast_ref::<u32>(), Some(&7));
    }

    #[test]
    fn stats_track_maximums() {
        let mut stats = DecodingStats::default();
        assert_eq!(stats.average_decode_time(), None);

        stats.update_decode_timing(5);
        stats.update_decode_timing(12);
        stats.number_of_decode_operations = 2;
        stats.update_dma_allocation_size(1000);
        stats.update_dma_allocation_size(10);

        assert_eq!(stats.total_decoding_time, 17);
        assert_eq!(stats.max_decode_duration, 12);
        assert_eq!(stats.average_decode_time(), Some(8));
        assert_eq!(stats.max_dma_allocation_size, 1000);

        let mut total = DecodingStats {
            number_of_decode_operations: 3,
            max_decode_duration: 20,
            ..Default::default()
        };
        total.merge(&stats);
        assert_eq!(total.number_of_decode_operations, 5);
        assert_eq!(total.max_decode_duration, 20);
        assert_eq!(total.max_dma_allocation_size, 1000);
    }

    #[test]
    fn nv12_layout() {
        let layout = Nv12Layout::new(64, 32, CodecType::Vp8);
        assert_eq!(layout.stride, 64);
        assert_eq!(layout.cb_offset, 2048);
        assert_eq!(layout.cr_offset, 2048);
        assert_eq!(layout.size, 3072);

        let layout = Nv12Layout::new(64, 32, CodecType::H264);
        assert_eq!(layout.mv_col_offset, 3072);
        assert_eq!(layout.size, 3072 + 512);
    }

    #[test]
    fn nv12_copy_crops() {
        let geometry = FrameGeometry::new(4, 4, 2, 2, 2, 2);
        let layout = Nv12Layout::new(4, 4, CodecType::Vp8);
        let mut src = vec![0u8; layout.size];
        for (i, b) in src.iter_mut().enumerate() {
            *b = i as u8;
        }

        let mut dst = vec![0u8; visible_nv12_size(&geometry)];
        nv12_copy(&src, &mut dst, &geometry, &layout);

        // Luma rows 2 and 3, columns 2 and 3, then chroma row 1, columns 2 and 3.
        assert_eq!(dst, vec![10, 11, 14, 15, 22, 23]);
    }

    #[test]
    fn codec_from_str() {
        assert_eq!("h264".parse::<CodecType>(), Ok(CodecType::H264));
        assert_eq!("VP8".parse::<CodecType>(), Ok(CodecType::Vp8));
        assert!("av1".parse::<CodecType>().is_err());
    }
}
