// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Storage of the parameter sets seen in a stream, indexed by their id.

use bytes::Bytes;

use crate::codec::h264::parser::Pps;
use crate::codec::h264::parser::Sps;
use crate::codec::h264::parser::MAX_PPS_COUNT;
use crate::codec::h264::parser::MAX_SPS_COUNT;

/// A parameter set as received, along with what was parsed from it.
#[derive(Clone, Debug)]
pub struct ParameterSet<T> {
    /// The NAL unit, start code included. Sent to the hardware as-is.
    pub bytes: Bytes,
    /// Id of the parameter set this one depends on, if any.
    pub referenced: Option<u8>,
    pub info: T,
}

/// Fixed-capacity table of parameter sets.
#[derive(Debug)]
pub struct ParameterSetStore<T, const N: usize> {
    slots: Vec<Option<ParameterSet<T>>>,
}

impl<T, const N: usize> Default for ParameterSetStore<T, N> {
    fn default() -> Self {
        Self {
            slots: std::iter::repeat_with(|| None).take(N).collect(),
        }
    }
}

impl<T, const N: usize> ParameterSetStore<T, N> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a parameter set at `index`, replacing the previous one.
    ///
    /// Returns `false` and leaves the store untouched if the same bytes are already stored there.
    /// Callers are expected to validate `index`; out of range indices are ignored.
    pub fn update(&mut self, index: usize, bytes: Bytes, referenced: Option<u8>, info: T) -> bool {
        debug_assert!(index < N, "parameter set index {index} out of range");
        let Some(slot) = self.slots.get_mut(index) else {
            return false;
        };

        if slot.as_ref().is_some_and(|set| set.bytes == bytes) {
            return false;
        }

        *slot = Some(ParameterSet {
            bytes,
            referenced,
            info,
        });

        true
    }

    pub fn get(&self, index: usize) -> Option<&ParameterSet<T>> {
        self.slots.get(index)?.as_ref()
    }

    pub fn contains(&self, index: usize) -> bool {
        self.get(index).is_some()
    }

    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
    }
}

pub type SpsStore = ParameterSetStore<Sps, MAX_SPS_COUNT>;
pub type PpsStore = ParameterSetStore<Pps, MAX_PPS_COUNT>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_update_is_a_no_op() {
        let mut store = ParameterSetStore::<u32, 4>::new();
        let bytes = Bytes::from_static(&[0x00, 0x00, 0x01, 0x68, 0xce]);

        assert!(store.update(2, bytes.clone(), Some(0), 1));
        assert!(!store.update(2, bytes.clone(), Some(1), 2));
        assert_eq!(store.get(2).unwrap().info, 1);
        assert_eq!(store.get(2).unwrap().referenced, Some(0));

        assert!(store.update(2, Bytes::from_static(&[0x00, 0x00, 0x01, 0x68, 0xcf]), Some(1), 3));
        assert_eq!(store.get(2).unwrap().info, 3);
        assert!(!store.contains(1));
    }

    #[test]
    fn clear_empties_every_slot() {
        let mut store = ParameterSetStore::<(), 2>::new();
        store.update(0, Bytes::from_static(&[1]), None, ());
        store.update(1, Bytes::from_static(&[2]), None, ());

        store.clear();
        assert!(!store.contains(0));
        assert!(!store.contains(1));
        assert!(store.get(7).is_none());
    }
}
