// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Frame buffers registered with the hardware, indexed the way the hardware refers to them.
//!
//! A slot given out for display stays unusable by the hardware until the consumer returns it,
//! whatever happens to the reference count of its memory. Slots are only ever identified by the
//! physical address of their memory when coming back from consumers, so frames outliving the
//! session that decoded them can be returned without harm.

use log::debug;

use crate::backend::BackendResult;
use crate::backend::DmaAllocator;
use crate::backend::DmaBuffer;
use crate::decoder::OutputFrame;
use crate::FrameGeometry;
use crate::FrameMetadata;
use crate::Nv12Layout;

struct FrameSlot {
    buffer: DmaBuffer,
    given_for_display: bool,
    /// Decoded by the hardware, not displayed yet.
    awaiting_display: bool,
    meta: Option<FrameMetadata>,
}

impl FrameSlot {
    fn new(buffer: DmaBuffer) -> Self {
        Self {
            buffer,
            given_for_display: false,
            awaiting_display: false,
            meta: None,
        }
    }

    fn is_free(&self) -> bool {
        !self.given_for_display && !self.awaiting_display
    }
}

#[derive(Default)]
pub struct FrameBuffers {
    slots: Vec<FrameSlot>,
    /// Buffers still held by consumers after their slot went away with a previous session.
    retired: Vec<DmaBuffer>,
    geometry: FrameGeometry,
    layout: Nv12Layout,
}

impl FrameBuffers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets up `count` slots for frames of `geometry`, reusing the buffers of the previous slots
    /// that are not held by consumers and are large enough. New buffers are allocated for the rest.
    pub fn reserve<A: DmaAllocator + ?Sized>(
        &mut self,
        allocator: &mut A,
        count: usize,
        geometry: FrameGeometry,
        layout: Nv12Layout,
    ) -> BackendResult<()> {
        let mut buffers = Vec::with_capacity(count);

        for slot in self.slots.drain(..) {
            if slot.given_for_display {
                self.retired.push(slot.buffer);
            } else if slot.buffer.size() >= layout.size && buffers.len() < count {
                buffers.push(slot.buffer);
            }
        }

        debug!("Recycling {} of {} frame buffers", buffers.len(), count);

        while buffers.len() < count {
            buffers.push(allocator.allocate(layout.size)?);
        }

        self.slots = buffers.into_iter().map(FrameSlot::new).collect();
        self.geometry = geometry;
        self.layout = layout;

        Ok(())
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn layout(&self) -> Nv12Layout {
        self.layout
    }

    /// The buffers of every slot, in index order.
    pub fn buffers(&self) -> Vec<DmaBuffer> {
        self.slots.iter().map(|slot| slot.buffer.clone()).collect()
    }

    /// Whether the hardware has a buffer it can decode into.
    pub fn has_free_slot(&self) -> bool {
        self.slots.iter().any(FrameSlot::is_free)
    }

    /// Number of frames currently held by consumers, those of previous sessions included.
    pub fn given_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.given_for_display).count() + self.retired.len()
    }

    /// Whether no frame of the current slots is held by a consumer.
    pub fn all_returned(&self) -> bool {
        !self.slots.iter().any(|slot| slot.given_for_display)
    }

    /// Records that the hardware decoded a picture into slot `index`.
    pub fn set_decoded(&mut self, index: usize, meta: Option<FrameMetadata>) -> bool {
        match self.slots.get_mut(index) {
            Some(slot) => {
                slot.awaiting_display = true;
                slot.meta = meta;
                true
            }
            None => false,
        }
    }

    /// Gives slot `index` out for display.
    pub fn give_for_display(&mut self, index: usize) -> Option<OutputFrame> {
        let slot = self.slots.get_mut(index)?;
        if slot.given_for_display {
            return None;
        }

        slot.awaiting_display = false;
        slot.given_for_display = true;

        Some(OutputFrame {
            index,
            buffer: slot.buffer.clone(),
            geometry: self.geometry,
            layout: self.layout,
            meta: slot.meta.take(),
        })
    }

    /// Takes back the frame whose memory is at `physical_address`. Returns the index of the slot
    /// the hardware may decode into again, or `None` if the address is unknown, already returned,
    /// or belongs to a previous session.
    pub fn mark_returned(&mut self, physical_address: u64) -> Option<usize> {
        if let Some(pos) = self
            .retired
            .iter()
            .position(|buffer| buffer.physical_address() == physical_address)
        {
            self.retired.swap_remove(pos);
            return None;
        }

        let (index, slot) = self
            .slots
            .iter_mut()
            .enumerate()
            .find(|(_, slot)| slot.buffer.physical_address() == physical_address)?;

        if !slot.given_for_display {
            return None;
        }

        slot.given_for_display = false;
        Some(index)
    }

    /// Forgets about pictures the hardware decoded but never displayed, for when the hardware
    /// instance goes away.
    pub fn drop_pending(&mut self) {
        for slot in self.slots.iter_mut().filter(|slot| slot.awaiting_display) {
            slot.awaiting_display = false;
            slot.meta = None;
        }
    }
}
