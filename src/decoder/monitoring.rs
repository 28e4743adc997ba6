// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Tracking of which bytes of the bitstream belong to which picture.
//!
//! The hardware does not carry any metadata along with the bitstream. Each chunk written to the
//! bitstream buffer is recorded with its position in the stream, and once the hardware reports a
//! decoded picture, the records it consumed tell which metadata the picture gets.

use std::collections::VecDeque;

use crate::FrameMetadata;

#[derive(Debug)]
struct Record {
    /// Stream position of the first byte of the chunk.
    start: u64,
    meta: Option<FrameMetadata>,
}

#[derive(Debug, Default)]
pub struct BitstreamMonitor {
    records: VecDeque<Record>,
}

impl BitstreamMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a chunk written at stream position `start`.
    pub fn record(&mut self, start: u64, meta: Option<FrameMetadata>) {
        self.records.push_back(Record { start, meta });
    }

    /// Forgets about the chunks the hardware started reading before stream position `consumed`,
    /// and returns the first metadata found among them.
    pub fn take_consumed(&mut self, consumed: u64) -> Option<FrameMetadata> {
        let mut meta = None;

        while self.records.front().is_some_and(|r| r.start < consumed) {
            if let Some(record) = self.records.pop_front() {
                if meta.is_none() {
                    meta = record.meta;
                }
            }
        }

        meta
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_of_consumed_chunks() {
        let mut monitor = BitstreamMonitor::new();
        // Parameter sets, then two pictures.
        monitor.record(0, None);
        monitor.record(10, None);
        monitor.record(20, Some(FrameMetadata::new(100)));
        monitor.record(500, Some(FrameMetadata::new(133)));

        assert_eq!(monitor.take_consumed(500).map(|m| m.timestamp), Some(100));
        assert_eq!(monitor.len(), 1);

        // Nothing new consumed.
        assert!(monitor.take_consumed(500).is_none());

        assert_eq!(monitor.take_consumed(900).map(|m| m.timestamp), Some(133));
        assert!(monitor.is_empty());
    }

    #[test]
    fn chunks_without_metadata() {
        let mut monitor = BitstreamMonitor::new();
        monitor.record(0, None);
        monitor.record(8, None);

        assert!(monitor.take_consumed(16).is_none());
        assert!(monitor.is_empty());
    }
}
