// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

/// The number of kernel task slots, numbered `-NR_TASKS..0`
pub const NR_TASKS: i32 = 5;
/// The number of process slots, numbered `0..NR_PROCS`
pub const NR_PROCS: i32 = 256;
/// The largest number of CPUs the kernel lock queues
pub const MAX_CPUS: usize = kwin_util::MAX_CPUS;
