// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Sizing of the work memory of a decoding instance.
//!
//! The bitstream buffer starts large enough for a 1080p I frame at a generous bitrate. When a
//! picture does not fit, the next session opens with a buffer twice its size.

use log::info;

pub const PAGE_SIZE: usize = 4096;

const MAX_WIDTH: usize = 1920;
const MAX_HEIGHT: usize = 1088;

pub const DEFAULT_BITSTREAM_BUFFER_SIZE: usize =
    page_align(MAX_WIDTH * MAX_HEIGHT * 3 / 2) + PAGE_SIZE;
pub const SLICE_BUFFER_SIZE: usize = MAX_WIDTH * MAX_HEIGHT * 15 / 20;
pub const PS_SAVE_BUFFER_SIZE: usize = 128 * 1024;
pub const MB_PREDICTION_BUFFER_SIZE: usize = 68 * (MAX_WIDTH * MAX_HEIGHT / 256);

pub const fn page_align(size: usize) -> usize {
    size.div_ceil(PAGE_SIZE) * PAGE_SIZE
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecoderBuffers {
    bitstream_size: usize,
    wanted_bitstream_size: usize,
}

impl Default for DecoderBuffers {
    fn default() -> Self {
        Self::new(DEFAULT_BITSTREAM_BUFFER_SIZE)
    }
}

impl DecoderBuffers {
    pub fn new(bitstream_size: usize) -> Self {
        Self {
            bitstream_size,
            wanted_bitstream_size: bitstream_size,
        }
    }

    /// Size of the bitstream buffer of the next session.
    pub fn bitstream_size(&self) -> usize {
        self.bitstream_size
    }

    pub fn wanted_bitstream_size(&self) -> usize {
        self.wanted_bitstream_size
    }

    /// Accounts for `len` bytes about to be fed at once.
    pub fn note_input(&mut self, len: usize) {
        if len > self.bitstream_size {
            self.wanted_bitstream_size = self.wanted_bitstream_size.max(page_align(2 * len));
        }
    }

    pub fn needs_growth(&self) -> bool {
        self.wanted_bitstream_size != self.bitstream_size
    }

    /// Applies the planned growth. Returns whether the size changed.
    pub fn grow(&mut self) -> bool {
        if !self.needs_growth() {
            return false;
        }

        info!(
            "Old bitstream input buffer size {} too small, using {}",
            self.bitstream_size, self.wanted_bitstream_size
        );
        self.bitstream_size = self.wanted_bitstream_size;
        true
    }
}
