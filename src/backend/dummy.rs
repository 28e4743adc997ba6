// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! This file contains a dummy backend whose only purpose is to let the decoder
//! run so we can test it in isolation.
//!
//! Memory is plain system memory with made-up physical addresses. Decoding does not produce any
//! pixel: a decode step only takes the unread bitstream out of the circular buffer and picks a
//! frame buffer for it, following the same index and status conventions as the hardware. Every
//! call is recorded so tests can check what the hardware was told.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

use anyhow::anyhow;

use crate::backend::BackendError;
use crate::backend::BackendResult;
use crate::backend::BitstreamStatus;
use crate::backend::DmaAllocator;
use crate::backend::DmaBuffer;
use crate::backend::DmaMemory;
use crate::backend::FrameBufferRegistration;
use crate::backend::InitialInfo;
use crate::backend::OpenParams;
use crate::backend::OutputInfo;
use crate::backend::VpuDevice;
use crate::backend::VpuInstance;
use crate::codec::h264::nalu::NaluIterator;
use crate::CodecType;

/// Physical address of the first allocation.
const DMA_BASE_ADDRESS: u64 = 0x1000_0000;
const DMA_ALIGNMENT: u64 = 0x1000;

/// DMA memory backed by a vector.
pub struct SystemDma {
    physical_address: u64,
    data: RefCell<Vec<u8>>,
}

impl SystemDma {
    pub fn new(physical_address: u64, size: usize) -> Self {
        Self {
            physical_address,
            data: RefCell::new(vec![0; size]),
        }
    }
}

impl DmaMemory for SystemDma {
    fn physical_address(&self) -> u64 {
        self.physical_address
    }

    fn size(&self) -> usize {
        self.data.borrow().len()
    }

    fn read(&self, offset: usize, dst: &mut [u8]) -> BackendResult<()> {
        let data = self.data.borrow();
        let src = offset
            .checked_add(dst.len())
            .and_then(|end| data.get(offset..end))
            .ok_or_else(|| anyhow!("read of {} bytes at {} out of bounds", dst.len(), offset))?;
        dst.copy_from_slice(src);
        Ok(())
    }

    fn write(&self, offset: usize, src: &[u8]) -> BackendResult<()> {
        let mut data = self.data.borrow_mut();
        let dst = offset
            .checked_add(src.len())
            .and_then(|end| data.get_mut(offset..end))
            .ok_or_else(|| anyhow!("write of {} bytes at {} out of bounds", src.len(), offset))?;
        dst.copy_from_slice(src);
        Ok(())
    }
}

/// A call received by the dummy hardware.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Open(CodecType),
    UpdateBitstream(usize),
    RegisterFrameBuffers(usize),
    StartOneFrame,
    ClearDisplayFlag(usize),
    SoftwareReset,
    Close,
}

/// Behavior of the dummy hardware.
#[derive(Clone, Debug)]
pub struct DummyConfig {
    pub initial_info: InitialInfo,
    /// Pictures kept back before being displayed, as a decoder reordering frames would.
    pub display_delay: usize,
    /// Number of upcoming decode steps that never finish.
    pub stalled_steps: usize,
    /// Number of upcoming decode steps reporting a corrupted bitstream.
    pub corrupted_steps: usize,
    /// Total DMA memory available.
    pub memory_limit: Option<usize>,
}

impl Default for DummyConfig {
    fn default() -> Self {
        Self {
            initial_info: InitialInfo {
                min_frame_buffer_count: 2,
                width: 64,
                height: 64,
                interlaced: false,
                yuv420: true,
            },
            display_delay: 0,
            stalled_steps: 0,
            corrupted_steps: 0,
            memory_limit: None,
        }
    }
}

struct DummyState {
    config: DummyConfig,
    commands: Vec<Command>,
    next_address: u64,
    allocated: usize,
}

/// Dummy hardware, shared between its clones so that tests can keep a handle on it.
#[derive(Clone)]
pub struct DummyHardware {
    state: Rc<RefCell<DummyState>>,
}

impl DummyHardware {
    pub fn new(config: DummyConfig) -> Self {
        Self {
            state: Rc::new(RefCell::new(DummyState {
                config,
                commands: Vec::new(),
                next_address: DMA_BASE_ADDRESS,
                allocated: 0,
            })),
        }
    }

    /// Commands received so far, by every instance.
    pub fn commands(&self) -> Vec<Command> {
        self.state.borrow().commands.clone()
    }

    pub fn clear_commands(&self) {
        self.state.borrow_mut().commands.clear();
    }

    /// Number of times `command` was received.
    pub fn count(&self, command: &Command) -> usize {
        self.state
            .borrow()
            .commands
            .iter()
            .filter(|c| *c == command)
            .count()
    }

    pub fn update_config(&self, f: impl FnOnce(&mut DummyConfig)) {
        f(&mut self.state.borrow_mut().config)
    }

    /// Bytes allocated so far, freed memory included.
    pub fn allocated(&self) -> usize {
        self.state.borrow().allocated
    }
}

impl Default for DummyHardware {
    fn default() -> Self {
        Self::new(Default::default())
    }
}

impl DmaAllocator for DummyHardware {
    fn allocate(&mut self, size: usize) -> BackendResult<DmaBuffer> {
        let mut state = self.state.borrow_mut();

        if let Some(limit) = state.config.memory_limit {
            if state.allocated + size > limit {
                return Err(BackendError::OutOfResources);
            }
        }

        let address = state.next_address;
        state.next_address += (size as u64).div_ceil(DMA_ALIGNMENT).max(1) * DMA_ALIGNMENT;
        state.allocated += size;

        Ok(Rc::new(SystemDma::new(address, size)))
    }
}

impl VpuDevice for DummyHardware {
    type Instance = DummyInstance;

    fn open(&mut self, params: &OpenParams) -> BackendResult<DummyInstance> {
        let codec = params.codec.codec();
        self.state.borrow_mut().commands.push(Command::Open(codec));

        Ok(DummyInstance {
            state: Rc::clone(&self.state),
            codec,
            bitstream: Rc::clone(&params.bitstream_buffer),
            read: 0,
            written: 0,
            end_of_input: false,
            displayed: Vec::new(),
            pending_display: VecDeque::new(),
            stalled: false,
            last_info: Default::default(),
        })
    }
}

pub struct DummyInstance {
    state: Rc<RefCell<DummyState>>,
    codec: CodecType,
    bitstream: DmaBuffer,
    /// Total bytes consumed and written, since opening.
    read: u64,
    written: u64,
    end_of_input: bool,
    /// Display flag of each frame buffer.
    displayed: Vec<bool>,
    /// Decoded frames not displayed yet.
    pending_display: VecDeque<usize>,
    stalled: bool,
    last_info: OutputInfo,
}

impl DummyInstance {
    fn record(&self, command: Command) {
        self.state.borrow_mut().commands.push(command);
    }

    fn address_of(&self, position: u64) -> u64 {
        self.bitstream.physical_address() + position % self.bitstream.size() as u64
    }

    fn unread(&self) -> BackendResult<Vec<u8>> {
        let size = self.bitstream.size();
        let len = (self.written - self.read) as usize;
        let offset = (self.read % size as u64) as usize;
        let first = len.min(size - offset);

        let mut data = vec![0; len];
        self.bitstream.read(offset, &mut data[..first])?;
        self.bitstream.read(0, &mut data[first..])?;
        Ok(data)
    }

    fn contains_picture(&self, data: &[u8]) -> bool {
        match self.codec {
            CodecType::H264 => NaluIterator::new(data)
                .any(|nalu| nalu.header.type_().is_some_and(|t| t.starts_picture())),
            _ => !data.is_empty(),
        }
    }

    fn free_frame(&self) -> Option<usize> {
        (0..self.displayed.len()).find(|i| !self.displayed[*i] && !self.pending_display.contains(i))
    }

    fn next_display(&mut self, draining: bool) -> i32 {
        let delay = self.state.borrow().config.display_delay;
        if self.pending_display.len() > delay || (draining && !self.pending_display.is_empty()) {
            if let Some(index) = self.pending_display.pop_front() {
                self.displayed[index] = true;
                return index as i32;
            }
        }
        -3
    }

    fn decode(&mut self) -> BackendResult<OutputInfo> {
        let unread = self.unread()?;

        if !self.contains_picture(&unread) {
            if !self.end_of_input {
                return Ok(OutputInfo {
                    not_enough_bitstream: true,
                    ..Default::default()
                });
            }

            let display_index = match self.next_display(true) {
                -3 => -1,
                index => index,
            };
            return Ok(OutputInfo {
                display_index,
                ..Default::default()
            });
        }

        let Some(index) = self.free_frame() else {
            return Ok(OutputInfo {
                decoded_index: -1,
                ..Default::default()
            });
        };

        self.read = self.written;

        let corrupted = {
            let mut state = self.state.borrow_mut();
            let corrupted = state.config.corrupted_steps > 0;
            state.config.corrupted_steps = state.config.corrupted_steps.saturating_sub(1);
            corrupted
        };
        if corrupted {
            return Ok(OutputInfo {
                decoded_index: -2,
                decoding_success: false,
                ..Default::default()
            });
        }

        self.pending_display.push_back(index);
        let display_index = self.next_display(false);

        Ok(OutputInfo {
            decoded_index: index as i32,
            display_index,
            ..Default::default()
        })
    }
}

impl VpuInstance for DummyInstance {
    fn bitstream_status(&mut self) -> BackendResult<BitstreamStatus> {
        Ok(BitstreamStatus {
            read_address: self.address_of(self.read),
            write_address: self.address_of(self.written),
            free_size: self.bitstream.size() - (self.written - self.read) as usize,
        })
    }

    fn update_bitstream(&mut self, size: usize) -> BackendResult<()> {
        self.record(Command::UpdateBitstream(size));

        if size == 0 {
            self.end_of_input = true;
        } else {
            self.written += size as u64;
        }

        Ok(())
    }

    fn initial_info(&mut self) -> BackendResult<InitialInfo> {
        if self.written == self.read {
            return Err(anyhow!("no bitstream to get the initial info from").into());
        }

        Ok(self.state.borrow().config.initial_info)
    }

    fn register_frame_buffers(
        &mut self,
        registration: &FrameBufferRegistration,
    ) -> BackendResult<()> {
        self.record(Command::RegisterFrameBuffers(registration.frames.len()));

        if let Some(small) = registration
            .frames
            .iter()
            .find(|frame| frame.size() < registration.layout.size)
        {
            return Err(anyhow!("frame buffer of {} bytes too small", small.size()).into());
        }

        self.displayed = vec![false; registration.frames.len()];
        self.pending_display.clear();
        Ok(())
    }

    fn start_one_frame(&mut self) -> BackendResult<()> {
        self.record(Command::StartOneFrame);

        let stall = {
            let mut state = self.state.borrow_mut();
            let stall = state.config.stalled_steps > 0;
            state.config.stalled_steps = state.config.stalled_steps.saturating_sub(1);
            stall
        };
        if stall {
            self.stalled = true;
            return Ok(());
        }

        self.last_info = self.decode()?;
        Ok(())
    }

    fn wait_for_interrupt(&mut self, _timeout: Duration) -> BackendResult<bool> {
        Ok(!self.stalled)
    }

    fn output_info(&mut self) -> BackendResult<OutputInfo> {
        Ok(self.last_info)
    }

    fn clear_display_flag(&mut self, index: usize) -> BackendResult<()> {
        self.record(Command::ClearDisplayFlag(index));

        let flag = self
            .displayed
            .get_mut(index)
            .ok_or_else(|| anyhow!("invalid frame buffer index {}", index))?;
        *flag = false;
        Ok(())
    }

    fn software_reset(&mut self) -> BackendResult<()> {
        self.record(Command::SoftwareReset);
        self.stalled = false;
        Ok(())
    }

    fn close(&mut self) -> BackendResult<()> {
        self.record(Command::Close);
        Ok(())
    }
}
