// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

use crate::VirtualAddress;

/// A copy stopped at a page fault.
///
/// The address is in the linear address space of the side that faulted (or the physical
/// address, for physical targets), not the address of the kernel window it was accessed
/// through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyFault {
    Source(VirtualAddress),
    Destination(VirtualAddress),
}

impl CopyFault {
    pub fn addr(self) -> VirtualAddress {
        match self {
            CopyFault::Source(addr) | CopyFault::Destination(addr) => addr,
        }
    }

    pub fn is_source(self) -> bool {
        matches!(self, CopyFault::Source(_))
    }
}

impl fmt::Display for CopyFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CopyFault::Source(addr) => write!(f, "page fault reading source at {addr}"),
            CopyFault::Destination(addr) => write!(f, "page fault writing destination at {addr}"),
        }
    }
}

impl core::error::Error for CopyFault {}

/// A fill stopped at a page fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FillFault {
    /// First byte of the chunk that faulted.
    pub chunk_start: VirtualAddress,
    /// Bytes left to fill from `chunk_start` on.
    pub remaining: u32,
    pub addr: VirtualAddress,
}

impl fmt::Display for FillFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "page fault at {} filling {:#x} bytes from {}",
            self.addr, self.remaining, self.chunk_start
        )
    }
}

impl core::error::Error for FillFault {}

/// Which level of the page table walk found a non-present entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkLevel {
    Directory,
    Table,
}

/// A linear address has no translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFault {
    pub addr: VirtualAddress,
    pub level: WalkLevel,
}

impl fmt::Display for PageFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.level {
            WalkLevel::Directory => "directory",
            WalkLevel::Table => "page table",
        };
        write!(f, "{} not mapped: no present {level} entry", self.addr)
    }
}

impl core::error::Error for PageFault {}
