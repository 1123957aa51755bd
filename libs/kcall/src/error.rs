// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt::{Display, Formatter};

use kmem::{CopyFault, PageFault, VirtualAddress};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// An endpoint does not name a live process.
    NoSuchProcess,
    /// An empty range.
    Domain,
    SourceFault(VirtualAddress),
    DestinationFault(VirtualAddress),
    Fault(VirtualAddress),
    /// The VM server could not make a range accessible.
    NoMemory,
    InvalidArgument,
    /// The caller is not allowed to make this kernel call.
    CallDenied,
    /// The caller has been suspended until the VM server resolved a fault. The call is
    /// restarted afterwards and no reply is sent now.
    VmSuspend,
}

impl From<CopyFault> for Error {
    fn from(fault: CopyFault) -> Self {
        match fault {
            CopyFault::Source(addr) => Self::SourceFault(addr),
            CopyFault::Destination(addr) => Self::DestinationFault(addr),
        }
    }
}

impl From<PageFault> for Error {
    fn from(fault: PageFault) -> Self {
        Self::Fault(fault.addr)
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::NoSuchProcess => f.write_str("endpoint does not name a live process"),
            Error::Domain => f.write_str("range must not be empty"),
            Error::SourceFault(addr) => write!(f, "page fault in copy source at {addr}"),
            Error::DestinationFault(addr) => write!(f, "page fault in copy destination at {addr}"),
            Error::Fault(addr) => write!(f, "page fault at {addr}"),
            Error::NoMemory => f.write_str("VM server could not provide memory for the range"),
            Error::InvalidArgument => f.write_str("invalid argument"),
            Error::CallDenied => f.write_str("caller is not allowed to make this kernel call"),
            Error::VmSuspend => f.write_str("suspended waiting for the VM server"),
        }
    }
}

impl core::error::Error for Error {}
