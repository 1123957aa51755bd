// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;

use crate::PhysicalAddress;

/// Physical memory made of discontiguous, zero-initialized regions.
pub struct Memory {
    regions: BTreeMap<PhysicalAddress, Vec<u8>>,
}

impl Memory {
    /// # Panics
    ///
    /// Panics if a region is empty or overlaps another.
    pub fn new(regions: impl IntoIterator<Item = Range<PhysicalAddress>>) -> Self {
        let mut this = Self {
            regions: BTreeMap::new(),
        };

        for Range { start, end } in regions {
            let size = end.offset_from_unsigned(start);
            assert!(size > 0, "empty memory region at {start}");
            assert!(
                this.available(start).is_none() && this.available(end.wrapping_sub(1)).is_none(),
                "memory region {start}..{end} overlaps"
            );
            this.regions.insert(start, vec![0; size as usize]);
        }

        this
    }

    pub fn regions(&self) -> impl Iterator<Item = Range<PhysicalAddress>> + '_ {
        self.regions.iter().map(|(start, region)| {
            *start..start.wrapping_add(u32::try_from(region.len()).unwrap_or(u32::MAX))
        })
    }

    /// Bytes from `address` up to the end of its region, `None` outside of memory.
    pub fn available(&self, address: PhysicalAddress) -> Option<u32> {
        let (start, region) = self.regions.range(..=address).next_back()?;
        let offset = address.offset_from_unsigned(*start) as usize;
        (offset < region.len()).then(|| u32::try_from(region.len() - offset).unwrap_or(u32::MAX))
    }

    pub fn slice(&self, address: PhysicalAddress, len: u32) -> Option<&[u8]> {
        let (start, region) = self.regions.range(..=address).next_back()?;
        let offset = address.offset_from_unsigned(*start) as usize;
        region.get(offset..offset + len as usize)
    }

    pub fn slice_mut(&mut self, address: PhysicalAddress, len: u32) -> Option<&mut [u8]> {
        let (start, region) = self.regions.range_mut(..=address).next_back()?;
        let offset = address.offset_from_unsigned(*start) as usize;
        region.get_mut(offset..offset + len as usize)
    }

    /// # Panics
    ///
    /// Panics if the range is not entirely inside one region.
    pub fn read(&self, address: PhysicalAddress, buf: &mut [u8]) {
        let len = u32::try_from(buf.len()).unwrap_or(u32::MAX);
        match self.slice(address, len) {
            Some(bytes) => buf.copy_from_slice(bytes),
            None => panic!("Memory::read: {address} size {len:#x} outside of memory ({self:?})"),
        }
    }

    /// # Panics
    ///
    /// Panics if the range is not entirely inside one region.
    pub fn write(&mut self, address: PhysicalAddress, bytes: &[u8]) {
        let len = u32::try_from(bytes.len()).unwrap_or(u32::MAX);
        if let Some(dst) = self.slice_mut(address, len) {
            dst.copy_from_slice(bytes);
        } else {
            panic!("Memory::write: {address} size {len:#x} outside of memory ({self:?})");
        }
    }

    /// # Panics
    ///
    /// Panics if the word is outside of memory.
    pub fn read_u32(&self, address: PhysicalAddress) -> u32 {
        let mut word = [0; 4];
        self.read(address, &mut word);
        u32::from_ne_bytes(word)
    }

    /// # Panics
    ///
    /// Panics if the word is outside of memory.
    pub fn write_u32(&mut self, address: PhysicalAddress, value: u32) {
        self.write(address, &value.to_ne_bytes());
    }

    /// Copies `len` bytes between two ranges, which may overlap.
    ///
    /// # Panics
    ///
    /// Panics if either range is outside of memory.
    pub fn copy(&mut self, from: PhysicalAddress, to: PhysicalAddress, len: u32) {
        let mut bytes = vec![0; len as usize];
        self.read(from, &mut bytes);
        self.write(to, &bytes);
    }
}

impl fmt::Debug for Memory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Memory")
            .field("regions", &self.regions().collect::<Vec<_>>())
            .finish()
    }
}
