// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! `proptest` strategies for memory access tests

use std::ops::Range;

use proptest::prelude::Strategy;

use crate::arch::PagingMode;
use crate::VirtualAddress;

/// Produces `VirtualAddress`s in the given range
pub fn virt(range: Range<u32>) -> impl Strategy<Value = VirtualAddress> {
    range.prop_map(VirtualAddress::new)
}

/// Produces a start address and a length of up to three windows that together stay clear of
/// the top of the address space.
pub fn window_request<M: PagingMode>() -> impl Strategy<Value = (VirtualAddress, u32)> {
    let max_len = 3 * M::WINDOW_SIZE;
    (virt(0..u32::MAX - max_len), 1..=max_len)
}
