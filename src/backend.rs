// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Interfaces to the hardware decoder and to the memory it works with.
//!
//! A backend provides a [`VpuDevice`], able to open decoding instances and to allocate memory
//! the hardware can access. The decoder in this crate drives any backend through these traits
//! only, and [`dummy`] provides one running entirely in system memory.

pub mod dummy;

use std::rc::Rc;
use std::time::Duration;

use bitflags::bitflags;
use thiserror::Error;

use crate::CodecType;
use crate::Nv12Layout;

/// Error returned by backend methods.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("not enough resources to proceed with the operation now")]
    OutOfResources,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type returned by backend methods.
pub type BackendResult<T> = Result<T, BackendError>;

/// A physically contiguous memory area shared with the hardware.
pub trait DmaMemory {
    /// Address of the memory as seen by the hardware.
    fn physical_address(&self) -> u64;
    fn size(&self) -> usize;
    /// Copies `dst.len()` bytes starting at `offset` into `dst`.
    fn read(&self, offset: usize, dst: &mut [u8]) -> BackendResult<()>;
    /// Copies `src` into the memory, starting at `offset`.
    fn write(&self, offset: usize, src: &[u8]) -> BackendResult<()>;
}

/// DMA memory is freed once the last reference to it is dropped.
pub type DmaBuffer = Rc<dyn DmaMemory>;

pub trait DmaAllocator {
    fn allocate(&mut self, size: usize) -> BackendResult<DmaBuffer>;
}

/// Codec-specific memory the hardware needs when opening an instance.
pub enum CodecOpenParams {
    H264 {
        /// Where the hardware saves parameter sets between pictures.
        ps_save_buffer: DmaBuffer,
    },
    Vp8,
    Jpeg,
}

impl CodecOpenParams {
    pub fn codec(&self) -> CodecType {
        match self {
            CodecOpenParams::H264 { .. } => CodecType::H264,
            CodecOpenParams::Vp8 => CodecType::Vp8,
            CodecOpenParams::Jpeg => CodecType::Jpeg,
        }
    }
}

pub struct OpenParams {
    pub codec: CodecOpenParams,
    /// Circular buffer the bitstream is written to.
    pub bitstream_buffer: DmaBuffer,
    pub reordering: bool,
}

/// Position of the hardware in the circular bitstream buffer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BitstreamStatus {
    pub read_address: u64,
    pub write_address: u64,
    /// Bytes that can be written before catching up with the read address.
    pub free_size: usize,
}

/// What the hardware found out about the stream once enough of it was fed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InitialInfo {
    pub min_frame_buffer_count: usize,
    pub width: u32,
    pub height: u32,
    pub interlaced: bool,
    pub yuv420: bool,
}

/// Frame buffers and work memory handed to the hardware once per instance.
pub struct FrameBufferRegistration<'a> {
    pub frames: &'a [DmaBuffer],
    pub layout: Nv12Layout,
    /// H.264 only.
    pub slice_buffer: Option<&'a DmaBuffer>,
    /// VP8 only.
    pub mb_prediction_buffer: Option<&'a DmaBuffer>,
}

/// Raw result of one decode step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OutputInfo {
    /// Frame buffer the picture was decoded into, or a negative status.
    pub decoded_index: i32,
    /// Frame buffer ready for display, or a negative status.
    pub display_index: i32,
    pub not_enough_bitstream: bool,
    pub params_changed: bool,
    pub decoding_success: bool,
}

impl Default for OutputInfo {
    fn default() -> Self {
        Self {
            decoded_index: -2,
            display_index: -3,
            not_enough_bitstream: false,
            params_changed: false,
            decoding_success: true,
        }
    }
}

bitflags! {
    /// Outcome of decode steps, as a set of flags.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct OutputFlags: u32 {
        const DECODED = 1 << 0;
        const DISPLAY = 1 << 1;
        const DROPPED = 1 << 2;
        const EOS = 1 << 3;
        const NOT_ENOUGH_INPUT = 1 << 4;
        const NOT_ENOUGH_OUTPUT = 1 << 5;
        const PARAMS_CHANGED = 1 << 6;
        const TIMEOUT = 1 << 7;
        const SYNTAX_ERROR = 1 << 8;
    }
}

impl Default for OutputFlags {
    fn default() -> Self {
        Self::empty()
    }
}

impl OutputFlags {
    /// Interprets the indices and status bits reported by the hardware.
    pub fn from_info(info: &OutputInfo) -> Self {
        let mut flags = Self::empty();

        if info.decoded_index >= 0 {
            flags.insert(Self::DECODED);
        }
        if info.display_index >= 0 {
            flags.insert(Self::DISPLAY);
        }
        if info.display_index == -1 {
            flags.insert(Self::EOS);
        }
        if info.decoded_index == -1 {
            flags.insert(Self::NOT_ENOUGH_OUTPUT);
        }
        if info.not_enough_bitstream {
            flags.insert(Self::NOT_ENOUGH_INPUT);
        } else if info.decoded_index == -2 && matches!(info.display_index, -2 | -3) {
            flags.insert(Self::DROPPED);
        }
        if info.params_changed {
            flags.insert(Self::PARAMS_CHANGED);
        }
        if !info.decoding_success && !info.not_enough_bitstream {
            flags.insert(Self::SYNTAX_ERROR);
        }

        flags
    }
}

/// An open decoding instance of the hardware.
pub trait VpuInstance {
    fn bitstream_status(&mut self) -> BackendResult<BitstreamStatus>;
    /// Tells the hardware that `size` bytes were written at the write address. A size of zero
    /// signals the end of the input.
    fn update_bitstream(&mut self, size: usize) -> BackendResult<()>;
    /// Fails until enough of the stream was fed for the hardware to find its parameters.
    fn initial_info(&mut self) -> BackendResult<InitialInfo>;
    fn register_frame_buffers(
        &mut self,
        registration: &FrameBufferRegistration,
    ) -> BackendResult<()>;
    /// Starts decoding one picture out of the bitstream buffer.
    fn start_one_frame(&mut self) -> BackendResult<()>;
    /// Waits at most `timeout` for the current decode step to finish. Returns whether it did.
    fn wait_for_interrupt(&mut self, timeout: Duration) -> BackendResult<bool>;
    /// Result of the last finished decode step.
    fn output_info(&mut self) -> BackendResult<OutputInfo>;
    /// Lets the hardware decode into frame buffer `index` again.
    fn clear_display_flag(&mut self, index: usize) -> BackendResult<()>;
    /// Recovers the hardware after a decode step never finished.
    fn software_reset(&mut self) -> BackendResult<()>;
    fn close(&mut self) -> BackendResult<()>;
}

pub trait VpuDevice: DmaAllocator {
    type Instance: VpuInstance;

    fn open(&mut self, params: &OpenParams) -> BackendResult<Self::Instance>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(decoded_index: i32, display_index: i32) -> OutputInfo {
        OutputInfo {
            decoded_index,
            display_index,
            ..Default::default()
        }
    }

    #[test]
    fn flags_from_indices() {
        let flags = OutputFlags::from_info(&info(2, 0));
        assert_eq!(flags, OutputFlags::DECODED | OutputFlags::DISPLAY);

        assert_eq!(OutputFlags::from_info(&info(3, -3)), OutputFlags::DECODED);
        assert_eq!(OutputFlags::from_info(&info(-2, -1)), OutputFlags::EOS);
        assert_eq!(OutputFlags::from_info(&info(-1, -3)), OutputFlags::NOT_ENOUGH_OUTPUT);
        assert_eq!(OutputFlags::from_info(&info(-2, -2)), OutputFlags::DROPPED);
        assert_eq!(OutputFlags::from_info(&info(-2, 1)), OutputFlags::DISPLAY);
    }

    #[test]
    fn flags_from_status() {
        let flags = OutputFlags::from_info(&OutputInfo {
            not_enough_bitstream: true,
            decoding_success: false,
            ..Default::default()
        });
        assert_eq!(flags, OutputFlags::NOT_ENOUGH_INPUT);

        let flags = OutputFlags::from_info(&OutputInfo {
            decoded_index: 0,
            decoding_success: false,
            ..Default::default()
        });
        assert!(flags.contains(OutputFlags::SYNTAX_ERROR));
        assert!(flags.contains(OutputFlags::DECODED));

        let flags = OutputFlags::from_info(&OutputInfo {
            params_changed: true,
            ..info(-2, -3)
        });
        assert!(flags.intersects(OutputFlags::PARAMS_CHANGED | OutputFlags::EOS));
        assert!(!flags.contains(OutputFlags::PARAMS_CHANGED | OutputFlags::EOS));
    }
}
